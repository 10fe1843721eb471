//! The `<name>.workspace` file persisted next to a workspace.
//!
//! ```xml
//! <?xml version="1.0" encoding="UTF-8"?>
//! <Workspace>
//!   <Files>
//!     <Package name="talker">
//!       <File>src/talker/src/talker.cpp</File>
//!     </Package>
//!   </Files>
//!   <IncludePaths>
//!     <Directory>/opt/ros/kinetic/include</Directory>
//!   </IncludePaths>
//! </Workspace>
//! ```
//!
//! File paths are stored relative to the workspace root with `/` separators;
//! include directories are stored as given.

use std::path::{Component, Path};

use quick_xml::events::{BytesDecl, BytesText, Event};
use quick_xml::reader::Reader;
use quick_xml::writer::Writer;

use crate::error::{Error, Result};
use crate::files::PackageFileMap;
use crate::includes::{IncludePathSet, normalize_path};

/// In-memory form of the persisted workspace descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkspaceDescriptor {
    pub files: PackageFileMap,
    pub includes: IncludePathSet,
}

impl WorkspaceDescriptor {
    /// Creates a descriptor from a file map and include set.
    pub fn new(files: PackageFileMap, includes: IncludePathSet) -> Self {
        Self { files, includes }
    }

    /// Serializes to indented XML with file paths made relative to `root`.
    pub fn to_xml(&self, root: &Path) -> Result<String> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

        writer
            .create_element("Workspace")
            .write_inner_content(|w| {
                w.create_element("Files").write_inner_content(|w| {
                    for (package, files) in self.files.iter() {
                        w.create_element("Package")
                            .with_attribute(("name", package))
                            .write_inner_content(|w| {
                                for file in files {
                                    let rel = relative_slash_path(file, root);
                                    w.create_element("File")
                                        .write_text_content(BytesText::new(&rel))?;
                                }
                                Ok::<(), quick_xml::Error>(())
                            })?;
                    }
                    Ok::<(), quick_xml::Error>(())
                })?;
                w.create_element("IncludePaths").write_inner_content(|w| {
                    for dir in self.includes.iter() {
                        let dir = dir.to_string_lossy();
                        w.create_element("Directory")
                            .write_text_content(BytesText::new(&dir))?;
                    }
                    Ok::<(), quick_xml::Error>(())
                })?;
                Ok::<(), quick_xml::Error>(())
            })?;

        let mut xml = String::from_utf8(writer.into_inner())
            .map_err(|e| Error::ParseFailure(e.to_string()))?;
        xml.push('\n');
        Ok(xml)
    }

    /// Parses a descriptor, resolving relative file paths against `root`.
    pub fn from_xml(xml: &str, root: &Path) -> Result<Self> {
        let mut reader = Reader::from_str(xml);
        reader.trim_text(true);

        let mut descriptor = WorkspaceDescriptor::default();
        let mut saw_root = false;
        let mut package: Option<String> = None;
        let mut element: Vec<u8> = Vec::new();

        loop {
            match reader.read_event()? {
                Event::Start(e) => {
                    let name = e.name().as_ref().to_vec();
                    match name.as_slice() {
                        b"Workspace" => saw_root = true,
                        b"Package" => {
                            let attr = e
                                .try_get_attribute("name")
                                .map_err(quick_xml::Error::from)?
                                .ok_or_else(|| {
                                    Error::ParseFailure(
                                        "<Package> without a name attribute".to_string(),
                                    )
                                })?;
                            package = Some(attr.unescape_value()?.into_owned());
                        }
                        _ => {}
                    }
                    element = name;
                }
                Event::End(e) => {
                    if e.name().as_ref() == b"Package" {
                        package = None;
                    }
                    element.clear();
                }
                Event::Text(t) => {
                    let text = t.unescape()?;
                    match element.as_slice() {
                        b"File" => {
                            let Some(ref pkg) = package else {
                                return Err(Error::ParseFailure(
                                    "<File> outside of a <Package>".to_string(),
                                ));
                            };
                            let file = normalize_path(&root.join(text.as_ref()));
                            descriptor.files.insert_file(pkg.clone(), file);
                        }
                        b"Directory" => {
                            descriptor.includes.insert(text.as_ref());
                        }
                        _ => {}
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if !saw_root {
            return Err(Error::ParseFailure(
                "missing <Workspace> root element".to_string(),
            ));
        }
        Ok(descriptor)
    }

    /// Writes the descriptor wholesale, replacing any previous file atomically.
    pub fn write(&self, path: &Path, root: &Path) -> Result<()> {
        let xml = self.to_xml(root)?;
        let tmp = path.with_extension("workspace.tmp");
        std::fs::write(&tmp, xml).map_err(|e| Error::fs(&tmp, e))?;
        std::fs::rename(&tmp, path).map_err(|e| Error::fs(path, e))?;
        Ok(())
    }

    /// Reads and parses the descriptor at `path`.
    pub fn read(path: &Path, root: &Path) -> Result<Self> {
        let xml = std::fs::read_to_string(path).map_err(|e| Error::fs(path, e))?;
        Self::from_xml(&xml, root)
    }
}

fn relative_slash_path(file: &Path, root: &Path) -> String {
    let Ok(rel) = file.strip_prefix(root) else {
        return file.to_string_lossy().into_owned();
    };
    rel.components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy()),
            Component::ParentDir => Some("..".into()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

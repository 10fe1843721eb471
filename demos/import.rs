use std::path::PathBuf;

use anyhow::Context;
use catkinkit::{PackageIndex, Settings, WorkspaceProject};
use catkinkit::workspace::installed_distributions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let root = match std::env::args().nth(1) {
        Some(arg) => PathBuf::from(arg),
        None => std::env::current_dir().context("failed to get current directory")?,
    };
    let settings = Settings::load(&Settings::default_path())?;

    let distribution = match std::env::args().nth(2) {
        Some(d) => d,
        None => installed_distributions(&settings)
            .into_iter()
            .next()
            .context("no ROS distribution installed")?,
    };
    let name = root
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("workspace")
        .to_string();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            println!("{}", line.text);
        }
    });

    let cancel = CancellationToken::new();
    let project = WorkspaceProject::import_workspace(
        settings.clone(),
        &name,
        &root,
        &distribution,
        Some(&tx),
        &cancel,
    )
    .await?;
    drop(tx);
    printer.await?;

    let model = project.snapshot().await;
    println!("Imported '{}' ({distribution})", model.name);
    println!("  descriptor: {}", model.descriptor_path().display());
    println!("  {} files, {} include paths", model.files().len(), model.includes().len());
    println!("  targets: {}", model.build_targets().join(", "));

    let env = catkinkit::EnvironmentSourcer::new(settings.clone())
        .source_workspace(&root, &distribution)
        .await?;
    let index = PackageIndex::new(settings);
    for (pkg, path) in index.list_packages(&env, &cancel).await {
        if !path.starts_with(&root) {
            continue;
        }
        println!("\n{pkg} ({})", path.display());
        for exe in index.executables(&pkg, &env) {
            println!("  exec   {exe}");
        }
        for launch in index.launch_files(&path, true) {
            println!("  launch {launch}");
        }
    }

    Ok(())
}

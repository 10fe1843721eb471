use std::path::{Path, PathBuf};

use anyhow::Context;
use catkinkit::{BuildEvent, Settings, StepList, Toolchain, WorkspaceProject};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut args = std::env::args().skip(1);
    let descriptor = args
        .next()
        .map(PathBuf::from)
        .context("usage: build <name.workspace> <distribution> [clean]")?;
    let distribution = args.next().unwrap_or_else(|| "kinetic".to_string());
    let list = match args.next().as_deref() {
        Some("clean") => StepList::Clean,
        _ => StepList::Build,
    };

    let settings = Settings::load(&Settings::default_path())?;
    let project = WorkspaceProject::load(settings, &descriptor, &distribution)?;
    let toolchain = Toolchain {
        name: "GCC".to_string(),
        compiler: PathBuf::from("/usr/bin/g++"),
    };

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                BuildEvent::Output(line) => println!("{}", line.text),
                BuildEvent::Progress(p) => eprintln!("[progress] {p}%"),
                BuildEvent::State(s) => eprintln!("[state] {s:?}"),
                BuildEvent::Diagnostic(d) => {
                    let file = d.file.as_deref().unwrap_or(Path::new("-"));
                    eprintln!(
                        "[{:?}] {}:{} {}",
                        d.severity,
                        file.display(),
                        d.line.unwrap_or(0),
                        d.message
                    );
                }
            }
        }
    });

    let config = project.build_step(list);
    let outcome = project
        .build(config, Some(&toolchain), Some(tx), &cancel)
        .await?;
    printer.await?;

    eprintln!(
        "[status] finished: {:?} (exit code {:?})",
        outcome.state, outcome.exit_code
    );
    if let Some(err) = outcome.error {
        return Err(err.into());
    }
    Ok(())
}

//! avfs command-line entry point
//!
//! Starts a compio event loop, runs the requested command as the loop's entry
//! task and waits for the loop to go idle before exiting with the command's
//! status.

use anyhow::{Context, Result};
use avfs::backends::LocalVfs;
use avfs::cli::{self, Args};
use avfs::completion;
use avfs::event_loop::{self, CompioEventLoop, Scheduler};
use avfs::vfs::VfsExt;
use clap::Parser;
use std::sync::Arc;

fn main() -> Result<()> {
    let args = Args::parse();
    args.validate()?;

    tracing_subscriber::fmt()
        .with_max_level(args.output.log_level())
        .with_writer(std::io::stderr)
        .init();

    let compio_loop = Arc::new(
        CompioEventLoop::start(args.runtime.to_options())
            .context("Failed to start the event loop")?,
    );
    let scheduler = Scheduler::new(compio_loop.clone());
    event_loop::install(scheduler.clone()).context("Failed to install the scheduler")?;

    let vfs = LocalVfs::with_options(args.root.clone(), args.backend.to_options());
    let command = args.command;
    let (completer, outcome) = completion::completion::<Result<i32>>();

    scheduler.main(move || async move {
        let root = vfs.root();
        let mut stdout = std::io::stdout();
        completer.succeed(cli::execute(&root, &command, &mut stdout).await);
        Ok::<(), anyhow::Error>(())
    });

    let code = futures::executor::block_on(outcome)
        .context("Command task ended without a result")??;
    scheduler.wait_idle();
    compio_loop.shutdown();

    tracing::debug!("exiting with status {code}");
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

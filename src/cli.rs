//! Command-line interface definitions
//!
//! Arguments are grouped by the component that consumes them: runtime
//! options feed [`RuntimeOptions`], backend options feed [`LocalVfsOptions`],
//! and output options pick the log level.

use crate::backends::LocalVfsOptions;
use crate::event_loop::RuntimeOptions;
use crate::vfs::{VfsFile, VfsFileEvent, VfsProcessHandler};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Inspect and modify a directory through the avfs runtime
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Directory served as the filesystem root
    #[arg(long, default_value = ".", global = true)]
    pub root: PathBuf,

    /// Event loop configuration
    #[command(flatten)]
    pub runtime: RuntimeConfig,

    /// Local backend configuration
    #[command(flatten)]
    pub backend: BackendConfig,

    /// Output and logging configuration
    #[command(flatten)]
    pub output: OutputConfig,

    #[command(subcommand)]
    pub command: Command,
}

// ============================================================================
// FUNCTIONAL GROUPS: Organized by what component consumes them
// ============================================================================

/// Event loop configuration
///
/// Used by: `CompioEventLoop::start()`
#[derive(clap::Args, Debug, Clone)]
#[command(next_help_heading = "Runtime Options")]
pub struct RuntimeConfig {
    /// Blocking worker threads (0 = auto-detect)
    #[arg(long, default_value = "0")]
    pub workers: usize,
}

impl RuntimeConfig {
    /// Convert to the options used by the event loop
    #[must_use]
    pub fn to_options(&self) -> RuntimeOptions {
        if self.workers == 0 {
            RuntimeOptions::default()
        } else {
            RuntimeOptions::new(self.workers)
        }
    }
}

/// Local backend configuration
///
/// Used by: `LocalVfs::with_options()`
#[derive(clap::Args, Debug, Clone)]
#[command(next_help_heading = "Backend Options")]
pub struct BackendConfig {
    /// How long a watch poll blocks before checking for cancellation (ms)
    #[arg(long, default_value = "100")]
    pub watch_poll_ms: u64,

    /// Pause between output drains of a running command (ms)
    #[arg(long, default_value = "1")]
    pub exec_poll_ms: u64,
}

impl BackendConfig {
    #[must_use]
    pub fn to_options(&self) -> LocalVfsOptions {
        LocalVfsOptions::default()
            .with_watch_poll_timeout(Duration::from_millis(self.watch_poll_ms))
            .with_exec_poll_interval(Duration::from_millis(self.exec_poll_ms))
    }
}

/// Output and logging configuration
#[derive(clap::Args, Debug, Clone)]
#[command(next_help_heading = "Output Options")]
pub struct OutputConfig {
    /// Verbose output (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Quiet mode (only errors are logged)
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

impl OutputConfig {
    /// Maximum log level for the subscriber
    #[must_use]
    pub const fn log_level(&self) -> tracing::Level {
        if self.quiet {
            return tracing::Level::ERROR;
        }
        match self.verbose {
            0 => tracing::Level::WARN,
            1 => tracing::Level::INFO,
            2 => tracing::Level::DEBUG,
            _ => tracing::Level::TRACE,
        }
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// List a directory
    Ls {
        #[arg(default_value = "/")]
        path: String,
    },
    /// Show metadata for a path
    Stat { path: String },
    /// Print a file
    Cat { path: String },
    /// Replace a file's content with TEXT
    Put { path: String, text: String },
    /// Run a command inside the served directory
    Exec {
        /// Working directory, as a path in the served tree
        #[arg(long, default_value = "/")]
        cwd: String,
        #[arg(trailing_var_arg = true, required = true, num_args = 1..)]
        command: Vec<String>,
    },
    /// Print changes in a directory
    Watch {
        #[arg(default_value = "/")]
        path: String,
        /// How long to watch
        #[arg(long, default_value = "10")]
        seconds: u64,
    },
}

impl Args {
    /// Validate argument combinations
    ///
    /// # Errors
    ///
    /// This function will return an error if:
    /// - Both --quiet and --verbose are used
    /// - A poll interval is zero
    /// - The root is not a directory
    pub fn validate(&self) -> Result<()> {
        if self.output.quiet && self.output.verbose > 0 {
            anyhow::bail!("Cannot use both --quiet and --verbose options");
        }
        if self.backend.watch_poll_ms == 0 || self.backend.exec_poll_ms == 0 {
            anyhow::bail!("Poll intervals must be at least 1 ms");
        }
        if !self.root.is_dir() {
            anyhow::bail!("Root {} is not a directory", self.root.display());
        }
        Ok(())
    }
}

/// Forwards child output: stdout to the command's writer, stderr to ours
struct Forward<'a> {
    out: &'a mut dyn Write,
}

impl VfsProcessHandler for Forward<'_> {
    fn on_out(&mut self, data: &[u8]) {
        if let Err(e) = self.out.write_all(data) {
            tracing::warn!("failed to forward command output: {e}");
        }
    }

    fn on_err(&mut self, data: &[u8]) {
        if let Err(e) = std::io::stderr().write_all(data) {
            tracing::warn!("failed to forward command errors: {e}");
        }
    }
}

fn print_event(event: &VfsFileEvent) {
    println!("{:?} {}", event.kind, event.file.path());
}

/// Run `command` against `root`, writing its output to `out`
///
/// Returns the process exit status: the child's exit code for `exec`, 0
/// otherwise.
///
/// # Errors
///
/// Returns the underlying filesystem error with the failing path attached.
pub async fn execute(root: &VfsFile, command: &Command, out: &mut dyn Write) -> Result<i32> {
    match command {
        Command::Ls { path } => {
            let dir = root.with_path(path);
            let mut entries = dir
                .list()
                .await
                .with_context(|| format!("Failed to list {path}"))?;
            while let Some(entry) = entries.next().await {
                let stat = entry
                    .stat()
                    .await
                    .with_context(|| format!("Failed to stat {}", entry.path()))?;
                let suffix = if stat.is_directory() { "/" } else { "" };
                writeln!(out, "{:>10} {}{suffix}", stat.size(), entry.basename())?;
            }
        }
        Command::Stat { path } => {
            let stat = root
                .with_path(path)
                .stat()
                .await
                .with_context(|| format!("Failed to stat {path}"))?;
            if !stat.exists() {
                anyhow::bail!("{path} does not exist");
            }
            writeln!(out, "path:     {}", stat.file().path())?;
            writeln!(
                out,
                "type:     {}",
                if stat.is_directory() { "directory" } else { "file" }
            )?;
            writeln!(out, "size:     {}", stat.size())?;
            writeln!(out, "mode:     {:o}", stat.mode())?;
            writeln!(out, "owner:    {}:{}", stat.owner(), stat.group())?;
            writeln!(out, "inode:    {}", stat.inode())?;
            writeln!(out, "modified: {}", stat.modified_time())?;
        }
        Command::Cat { path } => {
            let data = root
                .with_path(path)
                .read_all()
                .await
                .with_context(|| format!("Failed to read {path}"))?;
            out.write_all(&data)?;
        }
        Command::Put { path, text } => {
            root.with_path(path)
                .write_bytes(text.as_bytes())
                .await
                .with_context(|| format!("Failed to write {path}"))?;
        }
        Command::Exec { cwd, command } => {
            let code = root
                .with_path(cwd)
                .exec(command, &mut Forward { out })
                .await
                .with_context(|| format!("Failed to run {command:?}"))?;
            return Ok(code);
        }
        Command::Watch { path, seconds } => {
            let subscription = root
                .with_path(path)
                .watch(Arc::new(|event: VfsFileEvent| print_event(&event)))
                .await
                .with_context(|| format!("Failed to watch {path}"))?;
            compio::time::sleep(Duration::from_secs(*seconds)).await;
            subscription.cancel().await;
        }
    }
    Ok(0)
}

//! Process control surface
//!
//! Line-oriented commands on stdin and termination signals both act on a
//! shared `Controls`: a cancellation token for graceful drain and a watch
//! channel carrying the stream concurrency limit.

use std::io::BufRead;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A parsed stdin command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Stop issuing requests and drain
    Exit,
    /// Change the number of streams with a request in flight; 0 pauses
    Concurrency { limit: usize },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("Unknown command '{0}'. Available commands: exit, concurrency <streams|all> <n>")]
    Unknown(String),

    #[error("Usage: concurrency <streams|all> <n>")]
    Usage,

    #[error("Unknown concurrency target '{0}' (expected 'streams' or 'all')")]
    Target(String),

    #[error("Invalid concurrency '{0}': expected a non-negative integer")]
    Limit(String),
}

/// Parses one input line; blank lines yield `None`
pub fn parse_command(line: &str) -> Result<Option<Command>, CommandError> {
    let lowered = line.trim().to_ascii_lowercase();
    let mut words = lowered.split_whitespace();
    let Some(name) = words.next() else {
        return Ok(None);
    };

    match name {
        "exit" => Ok(Some(Command::Exit)),
        "concurrency" => {
            let (Some(target), Some(limit), None) = (words.next(), words.next(), words.next())
            else {
                return Err(CommandError::Usage);
            };
            if target != "streams" && target != "all" {
                return Err(CommandError::Target(target.to_string()));
            }
            let limit = limit
                .parse()
                .map_err(|_| CommandError::Limit(limit.to_string()))?;
            Ok(Some(Command::Concurrency { limit }))
        }
        other => Err(CommandError::Unknown(other.to_string())),
    }
}

/// Shared handles for steering a running crawl
#[derive(Debug)]
pub struct Controls {
    cancel: CancellationToken,
    concurrency: watch::Sender<usize>,
}

impl Controls {
    pub fn new(concurrency: usize) -> Self {
        let (concurrency, _) = watch::channel(concurrency);
        Self {
            cancel: CancellationToken::new(),
            concurrency,
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<usize> {
        self.concurrency.subscribe()
    }

    /// Requests a graceful drain
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn concurrency(&self) -> usize {
        *self.concurrency.borrow()
    }

    pub fn set_concurrency(&self, limit: usize) {
        let previous = self.concurrency.send_replace(limit);
        if limit == 0 {
            tracing::info!("Pausing: concurrency {} -> 0", previous);
        } else {
            tracing::info!("Concurrency {} -> {}", previous, limit);
        }
    }

    pub fn apply(&self, command: Command) {
        match command {
            Command::Exit => {
                tracing::info!("Exit requested; draining in-flight requests");
                self.shutdown();
            }
            Command::Concurrency { limit } => self.set_concurrency(limit),
        }
    }

    /// Applies a raw input line, reporting invalid input
    pub fn handle_line(&self, line: &str) {
        match parse_command(line) {
            Ok(Some(command)) => self.apply(command),
            Ok(None) => {}
            Err(e) => tracing::warn!("{}", e),
        }
    }
}

/// Reads commands from stdin on a detached thread
///
/// A blocking read cannot be interrupted, so the reader lives on its own OS
/// thread and never holds up process exit.
pub fn spawn_stdin_reader(controls: Arc<Controls>) {
    let spawned = std::thread::Builder::new()
        .name("stdin-commands".to_string())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                match line {
                    Ok(line) => controls.handle_line(&line),
                    Err(e) => {
                        tracing::debug!("Stopped reading stdin: {}", e);
                        break;
                    }
                }
            }
        });
    if let Err(e) = spawned {
        tracing::warn!("Cannot read commands from stdin: {}", e);
    }
}

/// Cancels `controls` on SIGINT or SIGTERM; a second signal exits at once
pub fn spawn_signal_handler(controls: Arc<Controls>) -> JoinHandle<()> {
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::warn!("Received shutdown signal; draining (signal again to force exit)");
        controls.shutdown();

        wait_for_signal().await;
        tracing::error!("Received second shutdown signal; exiting without final checkpoint");
        std::process::exit(130);
    })
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!("Cannot listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

//! Process-wide logging channel.
//!
//! Mirrors the teacher's `Printout`/`PrintSender` pattern: components never
//! write to stderr directly, they send a `LogEvent` on a channel owned by
//! `NodeAgent`. A single drain task both prints to stderr and fans events out
//! to any local admin-socket watchers subscribed to `/status`.

use std::path::PathBuf;

use tokio::fs::OpenOptions;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::{broadcast, mpsc};

pub type LogSender = mpsc::Sender<LogEvent>;
pub type LogReceiver = mpsc::Receiver<LogEvent>;

/// verbosity 0 is always shown; higher numbers are gated by `-v`/`TS_DEBUG_LOG`.
#[derive(Clone, Debug)]
pub struct LogEvent {
    pub verbosity: u8,
    pub target: &'static str,
    pub message: String,
}

impl LogEvent {
    pub fn new(verbosity: u8, target: &'static str, message: impl Into<String>) -> Self {
        Self {
            verbosity,
            target,
            message: message.into(),
        }
    }
}

/// Creates the owned channel pair plus a `broadcast` tap for IPC watchers.
pub fn channel(capacity: usize) -> (LogSender, LogReceiver) {
    mpsc::channel(capacity)
}

/// Drains `rx`, printing to stderr at or below `max_verbosity` and
/// republishing every event (regardless of verbosity) onto `watch_tx` so
/// `/status` subscribers see the full stream. `logs_dir`, when set
/// (`TS_LOGS_DIR`, spec §6), additionally appends every event to a
/// `meshd.log` file under that directory, one line per event regardless of
/// verbosity.
pub async fn drain(
    mut rx: LogReceiver,
    max_verbosity: u8,
    watch_tx: broadcast::Sender<LogEvent>,
    logs_dir: Option<PathBuf>,
) {
    let mut file_writer = match logs_dir {
        Some(dir) => open_log_file(&dir).await,
        None => None,
    };
    while let Some(ev) = rx.recv().await {
        if ev.verbosity <= max_verbosity {
            eprintln!("[{}] {}", ev.target, ev.message);
        }
        if let Some(writer) = file_writer.as_mut() {
            let line = format!("[{}] {}\n", ev.target, ev.message);
            if writer.write_all(line.as_bytes()).await.is_ok() {
                let _ = writer.flush().await;
            }
        }
        // a lagging watcher drops old events; that's fine, /status is a snapshot stream.
        let _ = watch_tx.send(ev);
    }
}

async fn open_log_file(dir: &std::path::Path) -> Option<BufWriter<tokio::fs::File>> {
    if tokio::fs::create_dir_all(dir).await.is_err() {
        return None;
    }
    let path = dir.join("meshd.log");
    OpenOptions::new().append(true).create(true).open(&path).await.ok().map(BufWriter::new)
}

#[macro_export]
macro_rules! log_event {
    ($tx:expr, $verbosity:expr, $target:expr, $($arg:tt)*) => {{
        let _ = $tx.try_send($crate::log::LogEvent::new($verbosity, $target, format!($($arg)*)));
    }};
}

//! Diagnostics and DCC chat transcripts.
//!
//! [`init_tracing`] installs the process-wide `tracing` subscriber.
//! [`TranscriptLogger`] writes DCC chat traffic to daily log files, one per
//! peer, named `<mask>_<date>.log` in the configured log directory
//! (default: `~/.local/share/crabdcc/logs/`).

use crate::config::LoggingConfig;
use crate::dcc::{DccType, Dispatcher, IoType};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing_subscriber::EnvFilter;

/// Log to stderr, filtered by `RUST_LOG` (default `info`).
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

enum Record {
    Line { filename: String, line: String },
    Flush(oneshot::Sender<()>),
}

/// Appends DCC chat lines to per-peer daily files.
///
/// Lines are formatted where they are dispatched and written by a
/// background task, so session tasks never wait on the disk. File handles
/// are cached by that task for the lifetime of the logger.
pub struct TranscriptLogger {
    records: mpsc::UnboundedSender<Record>,
}

impl TranscriptLogger {
    /// `None` when transcripts are disabled. The writer task runs on
    /// `runtime`.
    pub fn new(config: &LoggingConfig, runtime: &Handle) -> Option<Arc<Self>> {
        if !config.enabled {
            return None;
        }
        let (records, rx) = mpsc::unbounded_channel();
        runtime.spawn(write_transcripts(expand_home(&config.log_dir), rx));
        Some(Arc::new(Self { records }))
    }

    /// Record every chat line in both directions. Transfer control lines
    /// are left out.
    pub fn register(self: &Arc<Self>, dispatcher: &mut Dispatcher) -> Result<(), regex::Error> {
        for iotype in [IoType::In, IoType::Out] {
            let logger = Arc::clone(self);
            dispatcher.register_line_handler(".*", iotype, move |ev| {
                if ev.session.kind() == DccType::Chat {
                    logger.log_line(ev.mask, ev.iotype, ev.line);
                }
            })?;
        }
        Ok(())
    }

    pub fn log_line(&self, mask: &str, iotype: IoType, text: &str) {
        let now = chrono::Local::now();
        let timestamp = now.format("%H:%M:%S");
        let sender = match iotype {
            IoType::In => mask,
            IoType::Out => "me",
        };
        let line = match text
            .strip_prefix("\x01ACTION ")
            .map(|action| action.trim_end_matches('\x01'))
        {
            Some(action) => format!("[{}] * {} {}", timestamp, sender, action),
            None => format!("[{}] <{}> {}", timestamp, sender, text),
        };

        // Sanitize mask for filename
        let safe_mask: String = mask
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
            .collect();
        let filename = format!("{}_{}.log", safe_mask, now.format("%Y-%m-%d"));

        if self.records.send(Record::Line { filename, line }).is_err() {
            tracing::debug!(%mask, "transcript writer is gone");
        }
    }

    /// Wait until every line logged so far is on disk.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.records.send(Record::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

async fn write_transcripts(log_dir: PathBuf, mut records: mpsc::UnboundedReceiver<Record>) {
    let mut files: HashMap<String, fs::File> = HashMap::new();

    while let Some(record) = records.recv().await {
        match record {
            Record::Line { filename, line } => {
                if !files.contains_key(&filename) {
                    if let Err(e) = fs::create_dir_all(&log_dir).await {
                        tracing::warn!(dir = %log_dir.display(), error = %e, "cannot create transcript directory");
                    }
                    match OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(log_dir.join(&filename))
                        .await
                    {
                        Ok(file) => {
                            files.insert(filename.clone(), file);
                        }
                        Err(e) => {
                            tracing::warn!(%filename, error = %e, "cannot open transcript");
                            continue;
                        }
                    }
                }
                if let Some(file) = files.get_mut(&filename) {
                    if let Err(e) = file.write_all(format!("{line}\n").as_bytes()).await {
                        tracing::warn!(%filename, error = %e, "transcript write failed");
                    }
                }
            }
            Record::Flush(done) => {
                for (filename, file) in files.iter_mut() {
                    if let Err(e) = file.flush().await {
                        tracing::warn!(%filename, error = %e, "transcript flush failed");
                    }
                }
                let _ = done.send(());
            }
        }
    }
}

fn expand_home(dir: &str) -> PathBuf {
    match dir.strip_prefix("~/") {
        Some(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => PathBuf::from(dir),
        },
        None => PathBuf::from(dir),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disabled_logger() {
        assert!(TranscriptLogger::new(&LoggingConfig::default(), &Handle::current()).is_none());
    }

    fn enabled(dir: &std::path::Path) -> Arc<TranscriptLogger> {
        let config = LoggingConfig {
            enabled: true,
            log_dir: dir.to_string_lossy().into_owned(),
        };
        TranscriptLogger::new(&config, &Handle::current()).unwrap()
    }

    fn transcript(dir: &std::path::Path, safe_mask: &str) -> Vec<String> {
        let date = chrono::Local::now().format("%Y-%m-%d");
        let path = dir.join(format!("{}_{}.log", safe_mask, date));
        std::fs::read_to_string(path)
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[tokio::test]
    async fn test_transcript_lines() {
        let dir = tempfile::tempdir().unwrap();
        let logger = enabled(dir.path());
        logger.log_line("gawel!g@example.org", IoType::In, "hello");
        logger.log_line("gawel!g@example.org", IoType::Out, "\x01ACTION waves\x01");
        logger.flush().await;

        let lines = transcript(dir.path(), "gawel_g_example.org");
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("<gawel!g@example.org> hello"));
        assert!(lines[1].ends_with("* me waves"));
    }

    #[tokio::test]
    async fn test_only_chat_lines_are_recorded() {
        use crate::dcc::session::{test_handle, test_transfer_handle};

        let dir = tempfile::tempdir().unwrap();
        let logger = enabled(dir.path());
        let mut dispatcher = Dispatcher::new();
        logger.register(&mut dispatcher).unwrap();

        let (chat, _lines) = test_handle("gawel");
        let transfer = test_transfer_handle("gawel");
        dispatcher.dispatch_line(IoType::In, "gawel", &chat, "hi there");
        dispatcher.dispatch_line(IoType::Out, "gawel", &transfer, "DCC RESUME src 4567 10");
        dispatcher.dispatch_line(IoType::In, "gawel", &transfer, "DCC ACCEPT src 4567 10");
        dispatcher.dispatch_line(IoType::Out, "gawel", &chat, "bye");
        logger.flush().await;

        let lines = transcript(dir.path(), "gawel");
        assert_eq!(lines.len(), 2, "{lines:?}");
        assert!(lines[0].ends_with("<gawel> hi there"));
        assert!(lines[1].ends_with("<me> bye"));
    }

    #[test]
    fn test_expand_home() {
        assert_eq!(expand_home("/var/log/dcc"), PathBuf::from("/var/log/dcc"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_home("~/logs"), home.join("logs"));
        }
    }
}

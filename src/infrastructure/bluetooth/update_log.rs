//! Process-wide feature update logging.
//!
//! Dispatch hands every decoded update to a [`LoggerSink`]. The sink never
//! blocks: updates go through a bounded channel to a background task that
//! fans them out to the registered [`UpdateLogger`]s on the blocking pool,
//! and an update that does not fit is dropped.

use crate::domain::features::FeatureUpdate;
use serde::Serialize;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

pub trait UpdateLogger: Send {
    fn id(&self) -> &str;

    fn log(&mut self, device: &str, update: &FeatureUpdate) -> io::Result<()>;
}

/// Emits one `debug!` event per update.
#[derive(Debug, Default)]
pub struct TracingUpdateLogger;

impl TracingUpdateLogger {
    pub const ID: &'static str = "tracing";
}

impl UpdateLogger for TracingUpdateLogger {
    fn id(&self) -> &str {
        Self::ID
    }

    fn log(&mut self, device: &str, update: &FeatureUpdate) -> io::Result<()> {
        debug!(
            target: "nodelink::updates",
            device,
            feature = update.name,
            timestamp = update.timestamp,
            sample = ?update.sample,
            "Feature update"
        );
        Ok(())
    }
}

#[derive(Serialize)]
struct JsonLine<'a> {
    device: &'a str,
    #[serde(flatten)]
    update: &'a FeatureUpdate,
}

/// Appends one JSON document per line.
pub struct JsonLinesUpdateLogger<W: Write + Send> {
    id: String,
    writer: W,
}

impl<W: Write + Send> JsonLinesUpdateLogger<W> {
    pub fn new(id: impl Into<String>, writer: W) -> Self {
        Self {
            id: id.into(),
            writer,
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> UpdateLogger for JsonLinesUpdateLogger<W> {
    fn id(&self) -> &str {
        &self.id
    }

    fn log(&mut self, device: &str, update: &FeatureUpdate) -> io::Result<()> {
        serde_json::to_writer(&mut self.writer, &JsonLine { device, update })?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()
    }
}

struct LoggerEntry {
    id: String,
    enabled: AtomicBool,
    logger: Mutex<Box<dyn UpdateLogger>>,
}

struct LoggedUpdate {
    device: Arc<str>,
    update: FeatureUpdate,
}

/// Registered loggers. The list lock is only held to change or copy the
/// list; writes run under each logger's own lock.
#[derive(Default)]
struct Registry {
    entries: Mutex<Vec<Arc<LoggerEntry>>>,
    any_enabled: AtomicBool,
}

impl Registry {
    fn entries(&self) -> MutexGuard<'_, Vec<Arc<LoggerEntry>>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn refresh(&self, entries: &[Arc<LoggerEntry>]) {
        let any = entries.iter().any(|entry| entry.enabled.load(Ordering::SeqCst));
        self.any_enabled.store(any, Ordering::SeqCst);
    }

    fn enabled(&self) -> Vec<Arc<LoggerEntry>> {
        self.entries()
            .iter()
            .filter(|entry| entry.enabled.load(Ordering::SeqCst))
            .cloned()
            .collect()
    }
}

/// Cloneable handle to the logging task.
#[derive(Clone)]
pub struct LoggerSink {
    sender: mpsc::Sender<LoggedUpdate>,
    registry: Arc<Registry>,
}

impl LoggerSink {
    /// Spawns the logging task; must be called from within a Tokio runtime.
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let registry = Arc::new(Registry::default());
        tokio::spawn(Self::run(receiver, registry.clone()));
        Self { sender, registry }
    }

    /// Sink with a [`TracingUpdateLogger`] already registered.
    pub fn with_tracing(capacity: usize) -> Self {
        let sink = Self::new(capacity);
        sink.add_logger(Box::new(TracingUpdateLogger));
        sink
    }

    async fn run(mut receiver: mpsc::Receiver<LoggedUpdate>, registry: Arc<Registry>) {
        while let Some(logged) = receiver.recv().await {
            let entries = registry.enabled();
            if entries.is_empty() {
                continue;
            }
            // logger I/O is blocking
            let written = tokio::task::spawn_blocking(move || {
                for entry in entries {
                    let mut logger = entry.logger.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                    if let Err(e) = logger.log(&logged.device, &logged.update) {
                        warn!(logger = %entry.id, error = %e, "Update logger failed");
                    }
                }
            })
            .await;
            if let Err(e) = written {
                warn!(error = %e, "Update logger panicked");
            }
        }
        trace!("Update logging task stopped");
    }

    /// Queues `update` for the enabled loggers. Drops it when the channel is full.
    pub fn log(&self, device: &Arc<str>, update: &FeatureUpdate) {
        if !self.registry.any_enabled.load(Ordering::SeqCst) {
            return;
        }
        let logged = LoggedUpdate {
            device: device.clone(),
            update: update.clone(),
        };
        match self.sender.try_send(logged) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(device = %device, feature = update.name, "Update log channel full, dropping update");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                trace!("Update logging task gone");
            }
        }
    }

    /// Registers `logger`, enabled, replacing any logger with the same id.
    pub fn add_logger(&self, logger: Box<dyn UpdateLogger>) {
        let entry = Arc::new(LoggerEntry {
            id: logger.id().to_string(),
            enabled: AtomicBool::new(true),
            logger: Mutex::new(logger),
        });
        let mut entries = self.registry.entries();
        match entries.iter_mut().find(|existing| existing.id == entry.id) {
            Some(existing) => *existing = entry,
            None => entries.push(entry),
        }
        self.registry.refresh(&entries);
    }

    pub fn remove_logger(&self, id: &str) -> bool {
        let mut entries = self.registry.entries();
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        self.registry.refresh(&entries);
        entries.len() != before
    }

    /// Returns false when no logger has that id.
    pub fn set_enabled(&self, id: &str, enabled: bool) -> bool {
        let entries = self.registry.entries();
        let found = match entries.iter().find(|entry| entry.id == id) {
            Some(entry) => {
                entry.enabled.store(enabled, Ordering::SeqCst);
                true
            }
            None => false,
        };
        self.registry.refresh(&entries);
        found
    }

    /// `(id, enabled)` for every registered logger.
    pub fn loggers(&self) -> Vec<(String, bool)> {
        self.registry
            .entries()
            .iter()
            .map(|entry| (entry.id.clone(), entry.enabled.load(Ordering::SeqCst)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::features::{FeatureClass, FeatureId, FeatureSample};
    use std::time::Duration;

    struct ChannelLogger {
        id: &'static str,
        sender: mpsc::UnboundedSender<(String, u64)>,
    }

    impl UpdateLogger for ChannelLogger {
        fn id(&self) -> &str {
            self.id
        }

        fn log(&mut self, device: &str, update: &FeatureUpdate) -> io::Result<()> {
            let _ = self.sender.send((device.to_string(), update.timestamp));
            Ok(())
        }
    }

    fn update(timestamp: u64) -> FeatureUpdate {
        FeatureUpdate {
            feature: FeatureId {
                class: FeatureClass::Standard,
                id: 0x0004_0000,
            },
            name: "Temperature",
            timestamp,
            raw: vec![0x01, 0x00, 0xEB, 0x00],
            sample: FeatureSample::Scalar {
                value: 23.5,
                unit: "°C",
            },
            bytes_consumed: 2,
        }
    }

    #[test]
    fn test_json_lines_format() {
        let mut logger = JsonLinesUpdateLogger::new("json", Vec::new());
        logger.log("AA:BB", &update(7)).unwrap();
        logger.log("AA:BB", &update(8)).unwrap();

        let output = String::from_utf8(logger.into_inner()).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 2);

        let value: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(value["device"], "AA:BB");
        assert_eq!(value["name"], "Temperature");
        assert_eq!(value["timestamp"], 7);
        assert_eq!(value["sample"]["type"], "scalar");
    }

    #[tokio::test]
    async fn test_sink_fans_out_to_enabled_loggers() {
        let sink = LoggerSink::new(8);
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        sink.add_logger(Box::new(ChannelLogger { id: "a", sender: tx_a }));
        sink.add_logger(Box::new(ChannelLogger { id: "b", sender: tx_b }));
        assert!(sink.set_enabled("b", false));
        assert!(!sink.set_enabled("missing", false));

        let device: Arc<str> = Arc::from("AA:BB");
        sink.log(&device, &update(1));

        let logged = tokio::time::timeout(Duration::from_secs(1), rx_a.recv())
            .await
            .unwrap();
        assert_eq!(logged, Some(("AA:BB".to_string(), 1)));
        tokio::task::yield_now().await;
        assert!(rx_b.try_recv().is_err());

        assert_eq!(
            sink.loggers(),
            vec![("a".to_string(), true), ("b".to_string(), false)]
        );
    }

    #[tokio::test]
    async fn test_replace_and_remove() {
        let sink = LoggerSink::with_tracing(8);
        sink.set_enabled(TracingUpdateLogger::ID, false);
        sink.add_logger(Box::new(TracingUpdateLogger));
        assert_eq!(sink.loggers(), vec![("tracing".to_string(), true)]);
        assert!(sink.remove_logger("tracing"));
        assert!(!sink.remove_logger("tracing"));
        assert!(sink.loggers().is_empty());
    }

    #[tokio::test]
    async fn test_full_channel_drops_without_blocking() {
        let sink = LoggerSink::new(1);
        let (tx, _rx) = mpsc::unbounded_channel();
        sink.add_logger(Box::new(ChannelLogger { id: "a", sender: tx }));
        let device: Arc<str> = Arc::from("AA");
        // no await between sends: the logging task cannot drain
        for i in 0..100 {
            sink.log(&device, &update(i));
        }
    }

    struct SlowWriter {
        started: mpsc::UnboundedSender<()>,
    }

    impl Write for SlowWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let _ = self.started.send(());
            std::thread::sleep(Duration::from_millis(300));
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_slow_logger_does_not_block_log_calls() {
        let sink = LoggerSink::new(64);
        let (started, mut writing) = mpsc::unbounded_channel();
        sink.add_logger(Box::new(JsonLinesUpdateLogger::new("slow", io::BufWriter::new(SlowWriter { started }))));
        let device: Arc<str> = Arc::from("AA");

        sink.log(&device, &update(1));
        tokio::time::timeout(Duration::from_secs(5), writing.recv())
            .await
            .unwrap();

        // the first update is still being written
        let begin = std::time::Instant::now();
        for i in 2..10 {
            sink.log(&device, &update(i));
        }
        assert!(sink.set_enabled("slow", true));
        assert_eq!(sink.loggers(), vec![("slow".to_string(), true)]);
        assert!(begin.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_disabled_sink_skips_queueing() {
        let sink = LoggerSink::new(1);
        let (tx, mut rx) = mpsc::unbounded_channel();
        sink.add_logger(Box::new(ChannelLogger { id: "a", sender: tx }));
        sink.set_enabled("a", false);
        let device: Arc<str> = Arc::from("AA");
        sink.log(&device, &update(1));

        sink.set_enabled("a", true);
        sink.log(&device, &update(2));
        let logged = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert_eq!(logged, Some(("AA".to_string(), 2)));
    }
}

use crate::config::MonitorConfig;
use crate::error::HarnessError;
use crate::types::{Device, DeviceLog, DeviceLogs, LogEvent};
use log::{debug, error, info, warn};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, timeout_at, Instant};
use tokio_serial::{SerialPortBuilderExt, SerialStream};

/// Timing for one monitoring stage.
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub baud_rate: u32,
    pub duration: Duration,
    pub read_timeout: Duration,
    pub poll_interval: Duration,
    pub grace: Duration,
    pub join_timeout: Duration,
    /// Echo every line and report transient read errors
    pub verbose: bool,
}

impl MonitorSettings {
    pub fn from_config(config: &MonitorConfig, verbose: bool) -> Self {
        Self {
            baud_rate: config.baud_rate,
            duration: Duration::from_secs(config.duration_secs),
            read_timeout: Duration::from_millis(config.read_timeout_ms),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            grace: Duration::from_secs(config.grace_secs),
            join_timeout: Duration::from_secs(config.join_timeout_secs),
            verbose,
        }
    }
}

/// Opens a device's endpoint as a byte stream.
pub trait EndpointOpener: Send + Sync + 'static {
    type Stream: AsyncRead + Unpin + Send + 'static;

    fn open(&self, device: &Device, baud_rate: u32) -> Result<Self::Stream, HarnessError>;
}

pub struct SerialOpener;

impl EndpointOpener for SerialOpener {
    type Stream = SerialStream;

    fn open(&self, device: &Device, baud_rate: u32) -> Result<SerialStream, HarnessError> {
        tokio_serial::new(&device.port, baud_rate)
            .open_native_async()
            .map_err(|e| HarnessError::EndpointOpenFailure {
                device: device.name.clone(),
                port: device.port.clone(),
                reason: e.to_string(),
            })
    }
}

/// Roughly 30 years; stands in for a deadline `Instant` cannot represent.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// `start + span`, saturating to a far-future instant instead of overflowing.
pub fn deadline_after(start: Instant, span: Duration) -> Instant {
    start
        .checked_add(span)
        .or_else(|| start.checked_add(FAR_FUTURE))
        .unwrap_or(start)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorStats {
    pub lines: usize,
    pub read_errors: usize,
}

/// Everything gathered during one monitoring stage.
#[derive(Debug, Default)]
pub struct Collection {
    /// Holds an entry for every monitored device, even silent ones
    pub logs: DeviceLogs,
    /// Device name to the reason its endpoint could not be used
    pub endpoint_failures: BTreeMap<String, String>,
}

impl Collection {
    pub fn total_lines(&self) -> usize {
        self.logs.values().map(DeviceLog::len).sum()
    }
}

/// Opens the device endpoint and reads it until `settings.duration` elapses.
pub async fn monitor<O: EndpointOpener>(
    device: Device,
    opener: Arc<O>,
    settings: MonitorSettings,
    sink: mpsc::UnboundedSender<LogEvent>,
) -> Result<MonitorStats, HarnessError> {
    info!("Starting serial monitor for {} on {}", device.name, device.port);

    let deadline = deadline_after(Instant::now(), settings.duration);
    let stream = opener.open(&device, settings.baud_rate)?;

    Ok(read_lines(&device.name, stream, deadline, &settings, &sink).await)
}

/// Pushes each non-empty line from `stream` onto `sink` until `deadline`.
///
/// Read errors and end of stream never end the loop early; a partial line
/// still buffered at the deadline is emitted as-is.
pub async fn read_lines<R: AsyncRead + Unpin>(
    device_name: &str,
    stream: R,
    deadline: Instant,
    settings: &MonitorSettings,
    sink: &mpsc::UnboundedSender<LogEvent>,
) -> MonitorStats {
    let mut reader = BufReader::new(stream);
    let mut buffer = Vec::new();
    let mut stats = MonitorStats::default();

    loop {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        let wake = deadline.min(now + settings.read_timeout);

        // Bytes read before a timeout stay in `buffer` and the next call continues the line.
        match timeout_at(wake, reader.read_until(b'\n', &mut buffer)).await {
            Err(_) => continue,
            Ok(Ok(0)) => {
                if !emit(device_name, &mut buffer, settings, sink, &mut stats) {
                    return stats;
                }
                sleep_until(wake).await;
            }
            Ok(Ok(_)) => {
                if !emit(device_name, &mut buffer, settings, sink, &mut stats) {
                    return stats;
                }
            }
            Ok(Err(source)) => {
                stats.read_errors += 1;
                buffer.clear();
                let e = HarnessError::TransientReadError {
                    device: device_name.to_string(),
                    source,
                };
                if settings.verbose {
                    warn!("{}", e);
                } else {
                    debug!("{}", e);
                }
                sleep_until(wake).await;
            }
        }
    }

    emit(device_name, &mut buffer, settings, sink, &mut stats);
    stats
}

/// Decodes and sends the buffered line. Returns false once the collector is gone.
fn emit(
    device_name: &str,
    buffer: &mut Vec<u8>,
    settings: &MonitorSettings,
    sink: &mpsc::UnboundedSender<LogEvent>,
    stats: &mut MonitorStats,
) -> bool {
    let line = String::from_utf8_lossy(buffer).trim().to_string();
    buffer.clear();
    if line.is_empty() {
        return true;
    }

    if settings.verbose {
        info!("[{}] {}", device_name, line);
    }
    stats.lines += 1;
    sink.send(LogEvent::new(device_name.to_string(), line)).is_ok()
}

/// Runs one monitor per device and gathers their lines into per-device logs.
///
/// Collection stops once `duration + grace` has elapsed or every monitor has
/// finished. Monitors still running after `join_timeout` are detached.
pub async fn collect<O: EndpointOpener>(
    devices: &[Device],
    opener: Arc<O>,
    settings: &MonitorSettings,
) -> Collection {
    let (tx, mut rx) = mpsc::unbounded_channel();

    let mut collection = Collection {
        logs: devices
            .iter()
            .map(|d| (d.name.clone(), DeviceLog::default()))
            .collect(),
        endpoint_failures: BTreeMap::new(),
    };

    let workers: Vec<(String, JoinHandle<Result<MonitorStats, HarnessError>>)> = devices
        .iter()
        .map(|device| {
            let handle = tokio::spawn(monitor(
                device.clone(),
                Arc::clone(&opener),
                settings.clone(),
                tx.clone(),
            ));
            (device.name.clone(), handle)
        })
        .collect();
    drop(tx);

    info!(
        "Monitoring mesh communication for {} seconds...",
        settings.duration.as_secs()
    );

    let window_end = deadline_after(Instant::now(), settings.duration.saturating_add(settings.grace));
    while Instant::now() < window_end {
        match timeout(settings.poll_interval, rx.recv()).await {
            Ok(Some(event)) => store(&mut collection.logs, event),
            Ok(None) => break,
            Err(_) => continue,
        }
    }
    while let Ok(event) = rx.try_recv() {
        store(&mut collection.logs, event);
    }

    for (name, handle) in workers {
        match timeout(settings.join_timeout, handle).await {
            Ok(Ok(Ok(stats))) => {
                debug!("{}: {} lines, {} read errors", name, stats.lines, stats.read_errors)
            }
            Ok(Ok(Err(e))) => {
                error!("Serial monitor failed for {}: {}", name, e);
                collection.endpoint_failures.insert(name, e.to_string());
            }
            Ok(Err(e)) => {
                error!("Serial monitor for {} aborted: {}", name, e);
                collection.endpoint_failures.insert(name, e.to_string());
            }
            Err(_) => warn!("Serial monitor for {} did not stop in time; leaving it detached", name),
        }
    }

    for (name, log) in &collection.logs {
        if log.is_empty() {
            warn!("No serial output from {}", name);
        } else if let (Some(first), Some(last)) = (log.events().first(), log.events().last()) {
            debug!(
                "{}: {} lines between {} and {}",
                name,
                log.len(),
                first.timestamp.format("%H:%M:%S%.3f"),
                last.timestamp.format("%H:%M:%S%.3f")
            );
        }
    }
    info!("Collected {} log lines", collection.total_lines());
    collection
}

fn store(logs: &mut DeviceLogs, event: LogEvent) {
    logs.entry(event.device_name.clone()).or_default().push(event);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::io::Cursor;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncWriteExt, ReadBuf};

    fn settings(duration_ms: u64) -> MonitorSettings {
        MonitorSettings {
            baud_rate: 115200,
            duration: Duration::from_millis(duration_ms),
            read_timeout: Duration::from_millis(20),
            poll_interval: Duration::from_millis(20),
            grace: Duration::from_millis(100),
            join_timeout: Duration::from_millis(500),
            verbose: false,
        }
    }

    fn devices() -> Vec<Device> {
        vec![
            Device::new("T-Deck", "/dev/ttyA".to_string(), 0),
            Device::new("T-Deck", "/dev/ttyB".to_string(), 1),
        ]
    }

    /// Serves canned output per port; ports without output fail to open.
    struct ScriptedOpener(HashMap<String, Vec<u8>>);

    impl EndpointOpener for ScriptedOpener {
        type Stream = Cursor<Vec<u8>>;

        fn open(&self, device: &Device, _baud_rate: u32) -> Result<Self::Stream, HarnessError> {
            self.0
                .get(&device.port)
                .map(|bytes| Cursor::new(bytes.clone()))
                .ok_or_else(|| HarnessError::EndpointOpenFailure {
                    device: device.name.clone(),
                    port: device.port.clone(),
                    reason: "No such file or directory".to_string(),
                })
        }
    }

    /// Replays chunks and errors in order, then reports end of stream.
    struct FlakyPort(VecDeque<std::io::Result<&'static [u8]>>);

    impl AsyncRead for FlakyPort {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            match self.0.pop_front() {
                Some(Ok(bytes)) => {
                    buf.put_slice(bytes);
                    Poll::Ready(Ok(()))
                }
                Some(Err(e)) => Poll::Ready(Err(e)),
                None => Poll::Ready(Ok(())),
            }
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<LogEvent>) -> Vec<String> {
        let mut lines = Vec::new();
        while let Ok(event) = rx.try_recv() {
            lines.push(event.raw_line);
        }
        lines
    }

    #[tokio::test]
    async fn emits_trimmed_non_empty_lines() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let input: &[u8] = b"boot\r\n\r\n   \nKyber keypair generated\n";
        let deadline = Instant::now() + Duration::from_millis(100);

        let stats = read_lines("T-Deck-1", input, deadline, &settings(100), &tx).await;

        assert_eq!(drain(&mut rx), ["boot", "Kyber keypair generated"]);
        assert_eq!(stats.lines, 2);
    }

    #[tokio::test]
    async fn read_error_is_skipped_and_reading_continues() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let port = FlakyPort(VecDeque::from([
            Ok(&b"before\n"[..]),
            Err(std::io::Error::new(std::io::ErrorKind::Other, "framing error")),
            Ok(&b"after\n"[..]),
        ]));
        let started = Instant::now();
        let deadline = started + Duration::from_millis(200);

        let stats = read_lines("T-Deck-1", port, deadline, &settings(200), &tx).await;

        assert_eq!(drain(&mut rx), ["before", "after"]);
        assert_eq!(stats, MonitorStats { lines: 2, read_errors: 1 });
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[test]
    fn oversized_duration_saturates_instead_of_overflowing() {
        let now = Instant::now();
        let deadline = deadline_after(now, Duration::from_secs(u64::MAX));
        assert!(deadline > now + Duration::from_secs(86400 * 365));

        let span = Duration::from_secs(u64::MAX).saturating_add(Duration::from_secs(5));
        assert!(deadline_after(now, span) > now);
        assert_eq!(
            deadline_after(now, Duration::from_millis(10)),
            now + Duration::from_millis(10)
        );
    }

    #[tokio::test]
    async fn invalid_utf8_is_replaced() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let input: &[u8] = b"pkt \xff\xfe ok\n";
        let deadline = Instant::now() + Duration::from_millis(100);

        read_lines("T-Deck-1", input, deadline, &settings(100), &tx).await;

        assert_eq!(drain(&mut rx), ["pkt \u{fffd}\u{fffd} ok"]);
    }

    #[tokio::test]
    async fn runs_until_deadline_after_end_of_stream() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let input: &[u8] = b"one line\n";
        let started = Instant::now();
        let deadline = started + Duration::from_millis(150);

        read_lines("T-Deck-1", input, deadline, &settings(150), &tx).await;

        assert!(started.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn partial_line_split_across_reads_is_joined() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (mut writer, reader) = tokio::io::duplex(64);
        let deadline = Instant::now() + Duration::from_millis(300);

        let feeder = tokio::spawn(async move {
            writer.write_all(b"KYBER_MSG_KEY_").await.unwrap();
            tokio::time::sleep(Duration::from_millis(60)).await;
            writer.write_all(b"EXCHANGE_REQUEST sent\nunterminated").await.unwrap();
            // keep the writer open so the reader sees no end of stream
            tokio::time::sleep(Duration::from_millis(400)).await;
        });

        read_lines("T-Deck-1", reader, deadline, &settings(300), &tx).await;
        feeder.abort();

        assert_eq!(
            drain(&mut rx),
            ["KYBER_MSG_KEY_EXCHANGE_REQUEST sent", "unterminated"]
        );
    }

    #[tokio::test]
    async fn collects_both_devices_into_separate_logs() {
        let opener = ScriptedOpener(HashMap::from([
            ("/dev/ttyA".to_string(), b"a1\na2\na3\n".to_vec()),
            ("/dev/ttyB".to_string(), b"b1\nb2\n".to_vec()),
        ]));

        let collection = collect(&devices(), Arc::new(opener), &settings(150)).await;

        let lines = |name: &str| -> Vec<String> {
            collection.logs[name]
                .events()
                .iter()
                .map(|e| e.raw_line.clone())
                .collect()
        };
        assert_eq!(lines("T-Deck-1"), ["a1", "a2", "a3"]);
        assert_eq!(lines("T-Deck-2"), ["b1", "b2"]);
        assert!(collection.logs["T-Deck-1"]
            .events()
            .iter()
            .all(|e| e.device_name == "T-Deck-1"));
        assert_eq!(collection.total_lines(), 5);
        assert!(collection.endpoint_failures.is_empty());
    }

    #[tokio::test]
    async fn open_failure_on_one_device_keeps_the_other() {
        let opener = ScriptedOpener(HashMap::from([(
            "/dev/ttyB".to_string(),
            b"KyberCryptoEngine created\n".to_vec(),
        )]));

        let collection = collect(&devices(), Arc::new(opener), &settings(150)).await;

        assert!(collection.logs["T-Deck-1"].is_empty());
        assert_eq!(collection.logs["T-Deck-2"].len(), 1);
        assert!(collection.endpoint_failures.contains_key("T-Deck-1"));
        assert!(!collection.endpoint_failures.contains_key("T-Deck-2"));
    }

    #[tokio::test]
    async fn collection_is_bounded_by_duration_and_grace() {
        let opener = ScriptedOpener(HashMap::from([
            ("/dev/ttyA".to_string(), Vec::new()),
            ("/dev/ttyB".to_string(), Vec::new()),
        ]));
        let started = Instant::now();

        let collection = collect(&devices(), Arc::new(opener), &settings(200)).await;

        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_secs(2));
        assert_eq!(collection.logs.len(), 2);
    }
}

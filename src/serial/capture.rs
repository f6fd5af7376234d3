//! Timestamped line capture bounded by a run-end marker or a deadline.
//!
//! Device nodes are opened non-blocking and read through the reactor, so a
//! read abandoned at the deadline is gone once its future is dropped.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::pipe;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::discovery::PortDiscovery;
use crate::config::SerialConfig;
use crate::domain::{ExperimentParams, Transcript, is_run_end_for};
use crate::error::{HilError, Result};
use crate::flash::tool::{find_tool, run_tool};

/// Parameter that selects the capture baud rate.
pub const BAUD_PARAM: &str = "guess_baud";

/// Anything that yields newline-delimited device output.
#[async_trait]
pub trait LineSource: Send {
    /// Next line without its terminator; `None` once the source is closed.
    async fn next_line(&mut self) -> std::io::Result<Option<String>>;
}

/// Lines read from an open device node.
pub struct DeviceLineSource {
    reader: BufReader<pipe::Receiver>,
    buf: Vec<u8>,
}

impl DeviceLineSource {
    /// Open `port` for reading. Must be called inside a runtime.
    pub fn open(port: &Path) -> std::io::Result<Self> {
        let receiver = pipe::OpenOptions::new().unchecked(true).open_receiver(port)?;
        Ok(Self {
            reader: BufReader::new(receiver),
            buf: Vec::with_capacity(256),
        })
    }
}

#[async_trait]
impl LineSource for DeviceLineSource {
    async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        self.buf.clear();
        let n = self.reader.read_until(b'\n', &mut self.buf).await?;
        if n == 0 {
            return Ok(None);
        }
        let text = String::from_utf8_lossy(&self.buf);
        Ok(Some(text.trim_end_matches(['\r', '\n']).to_string()))
    }
}

/// Pre-scripted lines with a fixed inter-line delay. When `hold_open` is set
/// the source never closes after the last line, like a device that stopped
/// talking.
pub struct ScriptedLines {
    lines: VecDeque<String>,
    delay: Duration,
    hold_open: bool,
}

impl ScriptedLines {
    pub fn new<I, S>(lines: I, delay: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            lines: lines.into_iter().map(Into::into).collect(),
            delay,
            hold_open: false,
        }
    }

    pub fn hold_open(mut self) -> Self {
        self.hold_open = true;
        self
    }
}

#[async_trait]
impl LineSource for ScriptedLines {
    async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        match self.lines.pop_front() {
            Some(line) => {
                if !self.delay.is_zero() {
                    tokio::time::sleep(self.delay).await;
                }
                Ok(Some(line))
            }
            None if self.hold_open => std::future::pending().await,
            None => Ok(None),
        }
    }
}

/// Why `read_lines` stopped.
#[derive(Debug)]
enum ReadEnd {
    RunEnd,
    Deadline,
    Closed,
    Failed(std::io::Error),
}

/// Append lines from `source` to `transcript` until a run-end marker for
/// `expected`, the deadline, or the source ending.
async fn read_lines<S>(source: &mut S, transcript: &mut Transcript, expected: Option<&str>, deadline: Instant) -> ReadEnd
where
    S: LineSource + ?Sized,
{
    loop {
        match tokio::time::timeout_at(deadline, source.next_line()).await {
            Ok(Ok(Some(line))) => {
                let done = is_run_end_for(&line, expected);
                transcript.push(Utc::now(), line);
                if done {
                    debug!(lines = transcript.len(), "Run end observed");
                    return ReadEnd::RunEnd;
                }
            }
            Ok(Ok(None)) => return ReadEnd::Closed,
            Ok(Err(e)) => return ReadEnd::Failed(e),
            Err(_) => return ReadEnd::Deadline,
        }
    }
}

/// Read from `source` until a run-end marker for `expected` or `timeout`.
///
/// Whatever was read is always returned. A closed or failing source ends
/// capture the same way the deadline does.
pub async fn capture<S>(source: &mut S, expected: Option<&str>, timeout: Duration) -> Transcript
where
    S: LineSource + ?Sized,
{
    let mut transcript = Transcript::open(expected.map(String::from));
    match read_lines(source, &mut transcript, expected, Instant::now() + timeout).await {
        ReadEnd::RunEnd => {}
        ReadEnd::Closed => {
            warn!(lines = transcript.len(), "Serial source closed before run end");
            transcript.mark_timed_out();
        }
        ReadEnd::Failed(e) => {
            warn!(error = %e, lines = transcript.len(), "Serial read failed");
            transcript.mark_timed_out();
        }
        ReadEnd::Deadline => {
            info!(timeout_ms = timeout.as_millis() as u64, lines = transcript.len(), "Capture deadline reached");
            transcript.mark_timed_out();
        }
    }
    transcript
}

/// Write a handshake line to an already-present port.
pub async fn handshake(port: &Path, command: &str, limit: Duration) -> std::result::Result<(), String> {
    let write = async {
        let mut sender = pipe::OpenOptions::new().unchecked(true).open_sender(port)?;
        sender.write_all(format!("{}\n", command).as_bytes()).await?;
        sender.flush().await
    };
    match tokio::time::timeout(limit, write).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(format!("handshake write to {} failed: {}", port.display(), e)),
        Err(_) => Err(format!("handshake to {} timed out", port.display())),
    }
}

/// Baud rate for this capture: the attempt's `guess_baud` when it is a usable
/// rate, otherwise `default`.
pub fn capture_baud(params: &ExperimentParams, default: u32) -> u32 {
    params
        .get_int(BAUD_PARAM)
        .and_then(|b| u32::try_from(b).ok())
        .filter(|b| *b > 0)
        .unwrap_or(default)
}

/// `stty` arguments putting `port` into raw mode at `baud`.
pub fn stty_args(port: &Path, baud: u32) -> Vec<String> {
    let device_flag = if cfg!(target_os = "macos") { "-f" } else { "-F" };
    vec![
        device_flag.into(),
        port.display().to_string(),
        baud.to_string(),
        "raw".into(),
        "-echo".into(),
    ]
}

/// Put the tty at `port` into raw mode at `baud`.
pub async fn configure_port(port: &Path, baud: u32, limit: Duration) -> std::result::Result<(), String> {
    let stty = find_tool("stty").ok_or_else(|| "stty not found on PATH".to_string())?;
    run_tool(&stty, &stty_args(port, baud), limit).await.map(|_| ())
}

/// What an attempt asks of the capture stage.
#[derive(Debug, Clone)]
pub struct CaptureRequest {
    pub run_id: String,
    /// Run id the terminating marker must carry; `None` accepts any
    pub expected_run_id: Option<String>,
    pub params: ExperimentParams,
}

#[derive(Debug, Clone)]
pub struct CaptureReport {
    pub endpoint: String,
    pub transcript: Transcript,
}

/// Evidence acquisition seen from the orchestrator.
#[async_trait]
pub trait TruthCapture: Send + Sync {
    /// Ask the device to enter its programming-ready state. Failure is not fatal.
    async fn prepare_for_flash(&self) -> std::result::Result<(), String>;

    /// Acquire one transcript after flashing.
    async fn capture(&self, request: &CaptureRequest) -> Result<CaptureReport>;
}

/// Capture from a real serial device.
///
/// The endpoint may vanish and come back while the target reboots after a
/// flash. A node that closes or errors before the run end is rediscovered and
/// reopened; every reopen appends to the same transcript under one deadline.
pub struct SerialPortCapture {
    discovery: PortDiscovery,
    handshake: Option<String>,
    baud: u32,
    configure: bool,
    capture_timeout: Duration,
    reenumeration_timeout: Duration,
    poll_interval: Duration,
}

impl SerialPortCapture {
    pub fn from_config(config: &SerialConfig) -> Self {
        Self {
            discovery: PortDiscovery::from_config(config),
            handshake: config.handshake.clone(),
            baud: config.baud,
            configure: config.configure_port,
            capture_timeout: Duration::from_millis(config.capture_timeout_ms),
            reenumeration_timeout: Duration::from_millis(config.reenumeration_timeout_ms),
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
        }
    }

    pub fn discovery(&self) -> &PortDiscovery {
        &self.discovery
    }

    async fn open(&self, port: &Path, baud: u32) -> std::io::Result<DeviceLineSource> {
        if self.configure {
            if let Err(reason) = configure_port(port, baud, self.poll_interval * 8).await {
                warn!(port = %port.display(), baud, reason = %reason, "Could not configure serial port");
            }
        }
        DeviceLineSource::open(port)
    }

    /// Wait one poll interval, then rediscover the endpoint. False once the
    /// deadline has passed without one.
    async fn wait_to_reopen(&self, port: &mut PathBuf, deadline: Instant) -> bool {
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        tokio::time::sleep_until((now + self.poll_interval).min(deadline)).await;
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return false;
        }
        match self.discovery.wait_for_port(remaining, self.poll_interval).await {
            Ok(found) => {
                *port = found;
                true
            }
            Err(_) => false,
        }
    }
}

#[async_trait]
impl TruthCapture for SerialPortCapture {
    async fn prepare_for_flash(&self) -> std::result::Result<(), String> {
        let Some(command) = &self.handshake else {
            return Ok(());
        };
        let port: PathBuf = self
            .discovery
            .discover()
            .ok_or_else(|| "no serial endpoint for handshake".to_string())?;
        handshake(&port, command, self.poll_interval * 4).await
    }

    async fn capture(&self, request: &CaptureRequest) -> Result<CaptureReport> {
        let expected = request.expected_run_id.as_deref();
        let baud = capture_baud(&request.params, self.baud);
        let mut port = self
            .discovery
            .wait_for_port(self.reenumeration_timeout, self.poll_interval)
            .await?;
        let deadline = Instant::now() + self.capture_timeout;
        let mut transcript = Transcript::open(expected.map(String::from));
        let mut opened = false;
        let mut open_error = None;

        loop {
            match self.open(&port, baud).await {
                Ok(mut source) => {
                    opened = true;
                    match read_lines(&mut source, &mut transcript, expected, deadline).await {
                        ReadEnd::RunEnd => break,
                        ReadEnd::Deadline => {
                            info!(
                                timeout_ms = self.capture_timeout.as_millis() as u64,
                                lines = transcript.len(),
                                "Capture deadline reached"
                            );
                            transcript.mark_timed_out();
                            break;
                        }
                        ReadEnd::Closed => {
                            debug!(port = %port.display(), lines = transcript.len(), "Serial endpoint closed, reopening")
                        }
                        ReadEnd::Failed(e) => {
                            debug!(port = %port.display(), error = %e, lines = transcript.len(), "Serial read failed, reopening")
                        }
                    }
                }
                Err(e) => {
                    debug!(port = %port.display(), error = %e, "Cannot open serial endpoint");
                    open_error = Some(format!("cannot open {}: {}", port.display(), e));
                }
            }

            if !self.wait_to_reopen(&mut port, deadline).await {
                warn!(lines = transcript.len(), "Serial endpoint did not return before the capture deadline");
                transcript.mark_timed_out();
                break;
            }
        }

        if !opened {
            if let Some(message) = open_error {
                return Err(HilError::transient_device(message));
            }
        }
        info!(port = %port.display(), baud, lines = transcript.len(), "Capture finished");
        Ok(CaptureReport {
            endpoint: port.display().to_string(),
            transcript,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn mkfifo(path: &Path) {
        let status = std::process::Command::new("mkfifo").arg(path).status().unwrap();
        assert!(status.success());
    }

    fn port_config(port: &Path, capture_timeout_ms: u64) -> SerialConfig {
        SerialConfig {
            port: Some(port.to_path_buf()),
            configure_port: false,
            capture_timeout_ms,
            reenumeration_timeout_ms: 500,
            poll_interval_ms: 10,
            ..Default::default()
        }
    }

    fn request(run_id: &str) -> CaptureRequest {
        CaptureRequest {
            run_id: run_id.into(),
            expected_run_id: Some(run_id.into()),
            params: ExperimentParams::new(),
        }
    }

    #[tokio::test]
    async fn test_capture_stops_at_matching_run_end() {
        let mut source = ScriptedLines::new(
            ["boot noise", "RUN_START r1", "INFO x", "RUN_END r1", "INFO after"],
            Duration::ZERO,
        );
        let t = capture(&mut source, Some("r1"), Duration::from_secs(1)).await;
        assert_eq!(t.len(), 4);
        assert!(!t.timed_out());
        assert_eq!(t.lines()[3].line, "RUN_END r1");
    }

    #[tokio::test]
    async fn test_capture_ignores_other_run_end() {
        let mut source = ScriptedLines::new(["RUN_END r0", "RUN_START r1", "RUN_END r1"], Duration::ZERO);
        let t = capture(&mut source, Some("r1"), Duration::from_secs(1)).await;
        assert_eq!(t.len(), 3);
    }

    #[tokio::test]
    async fn test_capture_any_run_end_when_unexpected() {
        let mut source = ScriptedLines::new(["RUN_START sig_9", "RUN_END sig_9", "INFO late"], Duration::ZERO);
        let t = capture(&mut source, None, Duration::from_secs(1)).await;
        assert_eq!(t.len(), 2);
        assert!(!t.timed_out());
    }

    #[tokio::test]
    async fn test_capture_deadline_keeps_partial_evidence() {
        let mut source = ScriptedLines::new(["INFO booting", "ERROR 3 brownout"], Duration::ZERO).hold_open();
        let t = capture(&mut source, Some("r1"), Duration::from_millis(50)).await;
        assert!(t.timed_out());
        assert_eq!(t.len(), 2);
    }

    #[tokio::test]
    async fn test_capture_slow_device_hits_deadline() {
        let mut source = ScriptedLines::new(["RUN_START r1", "INFO a", "RUN_END r1"], Duration::from_millis(40));
        let t = capture(&mut source, Some("r1"), Duration::from_millis(100)).await;
        assert!(t.timed_out());
        assert_eq!(t.len(), 2);
    }

    #[tokio::test]
    async fn test_capture_timestamps_are_monotonic() {
        let mut source = ScriptedLines::new(["RUN_START r1", "INFO a", "RUN_END r1"], Duration::from_millis(5));
        let t = capture(&mut source, Some("r1"), Duration::from_secs(1)).await;
        let ts: Vec<_> = t.lines().iter().map(|l| l.ts).collect();
        assert!(ts.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_capture_baud_from_params() {
        let params = ExperimentParams::from_overrides(&["guess_baud=921600"]).unwrap();
        assert_eq!(capture_baud(&params, 115_200), 921_600);
        assert_eq!(capture_baud(&ExperimentParams::new(), 115_200), 115_200);
        let bad = ExperimentParams::from_overrides(&["guess_baud=fast"]).unwrap();
        assert_eq!(capture_baud(&bad, 115_200), 115_200);
        let negative = ExperimentParams::from_overrides(&["guess_baud=-9600"]).unwrap();
        assert_eq!(capture_baud(&negative, 115_200), 115_200);
    }

    #[test]
    fn test_stty_args_raw_mode() {
        let args = stty_args(Path::new("/dev/ttyACM0"), 57_600);
        assert_eq!(&args[1..], ["/dev/ttyACM0", "57600", "raw", "-echo"]);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_device_source_reads_lines() {
        let dir = TempDir::new().unwrap();
        let port = dir.path().join("ttyACM0");
        mkfifo(&port);
        let mut device = pipe::OpenOptions::new().read_write(true).open_sender(&port).unwrap();
        device
            .write_all(b"RUN_START r1\r\nINFO \xff\xfe ok\nRUN_END r1\n")
            .await
            .unwrap();

        let mut source = DeviceLineSource::open(&port).unwrap();
        let t = capture(&mut source, Some("r1"), Duration::from_secs(1)).await;
        assert_eq!(t.len(), 3);
        assert!(!t.timed_out());
        assert_eq!(t.lines()[0].line, "RUN_START r1");
        assert!(t.lines()[1].line.starts_with("INFO"));
    }

    #[tokio::test]
    async fn test_handshake_writes_command() {
        let dir = TempDir::new().unwrap();
        let port = dir.path().join("ttyACM0");
        mkfifo(&port);
        let mut device = pipe::OpenOptions::new().open_receiver(&port).unwrap();

        handshake(&port, "BOOTSEL", Duration::from_secs(1)).await.unwrap();
        let mut received = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut device, &mut received)
            .await
            .unwrap();
        assert_eq!(received, "BOOTSEL\n");

        let err = handshake(&dir.path().join("missing"), "BOOTSEL", Duration::from_secs(1)).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_serial_port_capture_reports_missing_port_as_transient() {
        let dir = TempDir::new().unwrap();
        let config = SerialConfig {
            port: Some(dir.path().join("ttyACM9")),
            reenumeration_timeout_ms: 30,
            poll_interval_ms: 10,
            ..Default::default()
        };
        let capture = SerialPortCapture::from_config(&config);
        let err = capture.capture(&request("r1")).await.unwrap_err();
        assert!(err.is_transient());
        assert!(capture.prepare_for_flash().await.is_err());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_capture_follows_device_through_reenumeration() {
        let dir = TempDir::new().unwrap();
        let port = dir.path().join("ttyACM0");
        mkfifo(&port);

        let device_port = port.clone();
        let device = tokio::spawn(async move {
            // old node: one line, then the device drops off the bus
            tokio::time::sleep(Duration::from_millis(50)).await;
            let mut old = pipe::OpenOptions::new().read_write(true).open_sender(&device_port).unwrap();
            old.write_all(b"INFO stale boot\n").await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            std::fs::remove_file(&device_port).unwrap();
            drop(old);

            // new node after re-enumeration
            tokio::time::sleep(Duration::from_millis(150)).await;
            mkfifo(&device_port);
            let mut new = pipe::OpenOptions::new().read_write(true).open_sender(&device_port).unwrap();
            new.write_all(b"RUN_START r1\nINFO ok\nRUN_END r1\n").await.unwrap();
            tokio::time::sleep(Duration::from_millis(1500)).await;
            drop(new);
        });

        let started = std::time::Instant::now();
        let report = SerialPortCapture::from_config(&port_config(&port, 3000))
            .capture(&request("r1"))
            .await
            .unwrap();
        let lines: Vec<&str> = report.transcript.lines().iter().map(|l| l.line.as_str()).collect();
        assert_eq!(lines, vec!["INFO stale boot", "RUN_START r1", "INFO ok", "RUN_END r1"]);
        assert!(!report.transcript.timed_out());
        assert!(started.elapsed() < Duration::from_millis(3000));
        device.abort();
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_capture_reopens_regular_node_until_deadline() {
        let dir = TempDir::new().unwrap();
        let port = dir.path().join("ttyACM0");
        std::fs::write(&port, b"").unwrap();

        let started = std::time::Instant::now();
        let err = SerialPortCapture::from_config(&port_config(&port, 150))
            .capture(&request("r1"))
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(started.elapsed() >= Duration::from_millis(150));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_silent_device_deadline_does_not_hold_runtime() {
        let dir = TempDir::new().unwrap();
        let port = dir.path().join("ttyACM0");
        mkfifo(&port);

        let runtime = tokio::runtime::Runtime::new().unwrap();
        let transcript = runtime.block_on(async {
            let silent = pipe::OpenOptions::new().read_write(true).open_sender(&port).unwrap();
            let report = SerialPortCapture::from_config(&port_config(&port, 100))
                .capture(&request("r1"))
                .await
                .unwrap();
            drop(silent);
            report.transcript
        });
        assert!(transcript.timed_out());
        assert!(transcript.is_empty());

        let started = std::time::Instant::now();
        drop(runtime);
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use minaret_core::{Command, Report};
use tokio::io::{AsyncRead, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::frame::{FrameError, read_frame, write_frame};

/// Connection parameters for the coordinator session.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Address of the coordinator endpoint.
    pub coordinator_addr: SocketAddr,
    /// Per-attempt connect timeout. Attempts fail fast rather than hang.
    pub connect_timeout: Duration,
    /// Flat delay between reconnect attempts. The coordinator is assumed
    /// to be a stable peer, so there is no exponential backoff; the loop
    /// retries forever.
    pub reconnect_delay: Duration,
    /// Interval between heartbeat reports while connected.
    pub heartbeat_interval: Duration,
}

/// Supplies the session-scoped reports the link sends on its own schedule.
///
/// The link stays ignorant of agent state; the agent implements this to
/// hand over a registration report for each new session and a heartbeat
/// report for each tick.
#[async_trait]
pub trait SessionReporter: Send + Sync + 'static {
    async fn registration(&self) -> Report;
    async fn heartbeat(&self) -> Report;
}

/// Session transitions and inbound traffic, observed by the agent.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Connected,
    Disconnected,
    Command(Command),
    /// A well-framed JSON message that is not a valid command. Carries the
    /// claimed `type` field when present so the agent can nack it; never
    /// tears down the session.
    Malformed {
        command: Option<Box<str>>,
        detail: Box<str>,
    },
}

/// Sending side of the link, cheap to clone into any task that reports.
///
/// Sends are best-effort: while the session is down the report is dropped
/// with a log line, never queued. The next tick of whatever produced it
/// supersedes it.
#[derive(Clone)]
pub struct LinkHandle {
    outbound: mpsc::Sender<Report>,
    connected: Arc<AtomicBool>,
}

impl LinkHandle {
    /// A handle wired to a plain channel, with the connected flag set.
    ///
    /// The session loop builds its own handle through this; tests use it to
    /// capture reports without a live coordinator.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Report>) {
        let (tx, rx) = mpsc::channel(capacity);
        let handle = Self {
            outbound: tx,
            connected: Arc::new(AtomicBool::new(true)),
        };
        (handle, rx)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Send a report if the session is up, otherwise drop it.
    pub fn send(&self, report: Report) {
        if !self.is_connected() {
            debug!("link down, dropping outbound report");
            return;
        }
        if self.outbound.try_send(report).is_err() {
            warn!("outbound channel full, dropping report");
        }
    }
}

/// The persistent duplex channel to the coordinator.
pub struct CoordinatorLink<R> {
    config: LinkConfig,
    reporter: Arc<R>,
}

impl<R: SessionReporter> CoordinatorLink<R> {
    pub fn new(config: LinkConfig, reporter: Arc<R>) -> Self {
        Self { config, reporter }
    }

    /// Spawn the session task.
    ///
    /// Returns the sending handle and the event stream. The task runs the
    /// Disconnected -> Connecting -> Connected loop until the token is
    /// cancelled, reconnecting forever on failure.
    pub fn start(self, cancel: CancellationToken) -> (LinkHandle, mpsc::Receiver<LinkEvent>) {
        let (handle, out_rx) = LinkHandle::channel(32);
        handle.connected.store(false, Ordering::Relaxed);

        let (event_tx, event_rx) = mpsc::channel(32);
        let connected = Arc::clone(&handle.connected);

        tokio::spawn(run_session_loop(
            self.config,
            self.reporter,
            out_rx,
            event_tx,
            connected,
            cancel,
        ));

        (handle, event_rx)
    }
}

async fn run_session_loop<R: SessionReporter>(
    config: LinkConfig,
    reporter: Arc<R>,
    mut out_rx: mpsc::Receiver<Report>,
    event_tx: mpsc::Sender<LinkEvent>,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let addr = config.coordinator_addr;
    info!(%addr, "Coordinator link started");

    loop {
        // Connecting: exactly one attempt in flight, failing fast.
        let attempt = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr));
        let stream = tokio::select! {
            _ = cancel.cancelled() => break,
            result = attempt => match result {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    warn!(error = %e, delay_secs = config.reconnect_delay.as_secs_f64(),
                        "Coordinator connect failed, will retry");
                    if sleep_or_cancel(config.reconnect_delay, &cancel).await {
                        break;
                    }
                    continue;
                }
                Err(_) => {
                    warn!(timeout_secs = config.connect_timeout.as_secs_f64(),
                        "Coordinator connect timed out, will retry");
                    if sleep_or_cancel(config.reconnect_delay, &cancel).await {
                        break;
                    }
                    continue;
                }
            },
        };

        // Reports accepted against the previous session are stale by now.
        while out_rx.try_recv().is_ok() {}

        info!(%addr, "Connected to coordinator");
        connected.store(true, Ordering::Relaxed);
        let _ = event_tx.send(LinkEvent::Connected).await;

        let closed = run_connected(&config, &reporter, &mut out_rx, &event_tx, stream, &cancel).await;

        connected.store(false, Ordering::Relaxed);
        let _ = event_tx.send(LinkEvent::Disconnected).await;

        if closed || cancel.is_cancelled() {
            break;
        }

        info!(delay_secs = config.reconnect_delay.as_secs_f64(), "Coordinator session lost, reconnecting");
        if sleep_or_cancel(config.reconnect_delay, &cancel).await {
            break;
        }
    }

    info!("Coordinator link shut down");
}

/// Drive one connected session until it ends.
///
/// Returns true when the session ended because of cancellation (a clean
/// close), false when the transport failed and a reconnect is due.
async fn run_connected<R: SessionReporter>(
    config: &LinkConfig,
    reporter: &Arc<R>,
    out_rx: &mut mpsc::Receiver<Report>,
    event_tx: &mpsc::Sender<LinkEvent>,
    stream: TcpStream,
    cancel: &CancellationToken,
) -> bool {
    let (read_half, write_half) = stream.into_split();
    let mut writer = BufWriter::new(write_half);

    // Dedicated reader task so a torn-down select never abandons a
    // half-read frame (the reads are not cancel-safe).
    let (inbound_tx, mut inbound_rx) = mpsc::channel::<LinkEvent>(32);
    let reader_task = tokio::spawn(run_reader(BufReader::new(read_half), inbound_tx));

    let registration = reporter.registration().await;
    if let Err(e) = write_frame(&mut writer, &registration).await {
        warn!(error = %e, "Failed to send registration");
        reader_task.abort();
        return false;
    }

    let mut heartbeat = tokio::time::interval_at(
        tokio::time::Instant::now() + config.heartbeat_interval,
        config.heartbeat_interval,
    );

    let clean_close = loop {
        tokio::select! {
            _ = cancel.cancelled() => break true,
            _ = heartbeat.tick() => {
                let report = reporter.heartbeat().await;
                if let Err(e) = write_frame(&mut writer, &report).await {
                    warn!(error = %e, "Heartbeat write failed");
                    break false;
                }
            }
            maybe_report = out_rx.recv() => {
                // The senders include the handle held by the caller, so
                // this channel outlives the session; recv is never None
                // while the loop runs.
                if let Some(report) = maybe_report {
                    if let Err(e) = write_frame(&mut writer, &report).await {
                        warn!(error = %e, "Outbound write failed");
                        break false;
                    }
                }
            }
            inbound = inbound_rx.recv() => {
                match inbound {
                    Some(event) => {
                        let _ = event_tx.send(event).await;
                    }
                    // Reader ended: transport error or peer close.
                    None => break false,
                }
            }
        }
    };

    reader_task.abort();
    clean_close
}

async fn run_reader<S>(mut reader: S, inbound_tx: mpsc::Sender<LinkEvent>)
where
    S: AsyncRead + Unpin,
{
    loop {
        // Two-stage decode: a frame that is valid JSON but not a valid
        // command is surfaced (with its claimed type) instead of killing
        // the session, so the agent can nack it.
        match read_frame::<_, serde_json::Value>(&mut reader).await {
            Ok(value) => {
                let event = match serde_json::from_value::<Command>(value.clone()) {
                    Ok(command) => {
                        debug!(command = command.kind(), "Inbound command");
                        LinkEvent::Command(command)
                    }
                    Err(e) => {
                        let command = value
                            .get("type")
                            .and_then(|v| v.as_str())
                            .map(Box::from);
                        warn!(?command, error = %e, "Malformed inbound command");
                        LinkEvent::Malformed {
                            command,
                            detail: e.to_string().into_boxed_str(),
                        }
                    }
                };
                if inbound_tx.send(event).await.is_err() {
                    break;
                }
            }
            Err(e) if e.is_recoverable() => {
                warn!(error = %e, "Skipping non-JSON inbound frame");
            }
            Err(FrameError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                info!("Coordinator closed the session");
                break;
            }
            Err(e) => {
                warn!(error = %e, "Inbound transport error");
                break;
            }
        }
    }
}

/// Sleep for `delay`, returning true if cancelled first.
async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

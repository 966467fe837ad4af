//! Transient capture status: state machine, snapshots, background monitor.
//!
//! The appliance publishes a free-running text status feed, one line per
//! poll: `<state> <pre> <post> <elapsed> <demux>`. The [`StatusMonitor`]
//! task owns that connection for the device's whole lifetime, parses each
//! line into a [`StatusSnapshot`], publishes it over a single-slot
//! `tokio::sync::watch` channel (readers never observe a partial update),
//! and turns level status into edge-triggered armed/stopped events with
//! blocking wait primitives.
//!
//! A capture ("shot") progresses monotonically
//! `IDLE → ARMED → RUN_PRE → RUN_POST → POST_PROCESS → CLEANUP → IDLE`.
//! A transition out of IDLE that skips ARMED means host and firmware have
//! lost agreement about the shot cycle; that is fatal for the session. The
//! monitor stops polling and every task blocked in a wait call is failed,
//! via a shared termination flag each waiter polls (no cross-task
//! interruption needed).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{ChassisError, ChassisResult};
use crate::net::Connection;

/// Transient capture state reported by the status feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    /// No shot in progress; both initial and terminal state.
    Idle,
    /// Armed, waiting for trigger.
    Armed,
    /// Capturing pre-trigger samples.
    RunPre,
    /// Capturing post-trigger samples.
    RunPost,
    /// Post-shot processing on the appliance.
    PostProcess,
    /// Shot teardown.
    Cleanup,
    /// Any state code this client does not know.
    Undefined,
}

impl CaptureState {
    /// Map a wire state code onto a state.
    pub fn from_code(code: u64) -> Self {
        match code {
            0 => CaptureState::Idle,
            1 => CaptureState::Armed,
            2 => CaptureState::RunPre,
            3 => CaptureState::RunPost,
            4 => CaptureState::PostProcess,
            5 => CaptureState::Cleanup,
            _ => CaptureState::Undefined,
        }
    }
}

impl std::fmt::Display for CaptureState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            CaptureState::Idle => "IDLE",
            CaptureState::Armed => "ARMED",
            CaptureState::RunPre => "RUN_PRE",
            CaptureState::RunPost => "RUN_POST",
            CaptureState::PostProcess => "POST_PROCESS",
            CaptureState::Cleanup => "CLEANUP",
            CaptureState::Undefined => "UNDEFINED",
        };
        write!(f, "{label}")
    }
}

/// One parsed status line. Replaced wholesale on every successful poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub state: CaptureState,
    /// Configured pre-trigger sample count.
    pub pre: u64,
    /// Configured post-trigger sample count.
    pub post: u64,
    /// Samples captured so far in the current shot.
    pub elapsed: u64,
    /// Whether the appliance demultiplexes channels after the shot.
    pub demux: bool,
}

impl StatusSnapshot {
    /// Parse `<state> <pre> <post> <elapsed> <demux>`. Returns `None` for
    /// anything else; the status feed interleaves log noise with status
    /// lines and noise is never fatal. Stricter than it has to be: a status
    /// tuple embedded in surrounding text also counts as noise and is
    /// discarded rather than extracted.
    pub fn parse(line: &str) -> Option<Self> {
        let mut fields = [0u64; 5];
        let mut count = 0;
        for token in line.split_whitespace() {
            if count == 5 {
                return None;
            }
            fields[count] = token.parse().ok()?;
            count += 1;
        }
        if count != 5 {
            return None;
        }
        Some(StatusSnapshot {
            state: CaptureState::from_code(fields[0]),
            pre: fields[1],
            post: fields[2],
            elapsed: fields[3],
            demux: fields[4] != 0,
        })
    }

    /// Total samples for the configured shot.
    pub fn samples(&self) -> u64 {
        self.pre + self.post
    }
}

/// State shared between the monitor task and waiters.
struct MonitorShared {
    /// Latched when an ARMED snapshot is observed; consumed by `wait_armed`.
    armed: AtomicBool,
    /// Latched on a running→IDLE edge; consumed by `wait_stopped`.
    stopped: AtomicBool,
    /// Set once the monitor will never publish again (fatal or orderly).
    terminated: AtomicBool,
    /// The illegal transition, when termination was a protocol violation.
    violation: Mutex<Option<(CaptureState, CaptureState)>>,
}

impl MonitorShared {
    fn fatal_error(&self) -> ChassisError {
        match *self.violation.lock() {
            Some((from, to)) => ChassisError::ProtocolViolation { from, to },
            None => ChassisError::MonitorStopped,
        }
    }
}

/// Background poller for the status feed. Exactly one per device.
pub struct StatusMonitor {
    shared: Arc<MonitorShared>,
    snapshot_rx: watch::Receiver<StatusSnapshot>,
    stop: Arc<Notify>,
    poll_interval: Duration,
    handle: Option<JoinHandle<()>>,
}

impl StatusMonitor {
    /// Spawn the monitor task on `conn`, seeded with the snapshot read
    /// synchronously at device open so status is valid before the first poll.
    pub fn start(conn: Connection, seed: StatusSnapshot, poll_interval: Duration) -> Self {
        let shared = Arc::new(MonitorShared {
            armed: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            violation: Mutex::new(None),
        });
        let (snapshot_tx, snapshot_rx) = watch::channel(seed);
        let stop = Arc::new(Notify::new());

        let handle = tokio::spawn(monitor_loop(
            conn,
            seed.state,
            snapshot_tx,
            Arc::clone(&shared),
            Arc::clone(&stop),
        ));

        StatusMonitor {
            shared,
            snapshot_rx,
            stop,
            poll_interval,
            handle: Some(handle),
        }
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> StatusSnapshot {
        *self.snapshot_rx.borrow()
    }

    /// A watch receiver for callers that want to follow snapshot updates.
    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.snapshot_rx.clone()
    }

    /// Whether the monitor has stopped publishing for good.
    pub fn is_terminated(&self) -> bool {
        self.shared.terminated.load(Ordering::SeqCst)
    }

    /// Block until the device has been observed ARMED since the last wait.
    ///
    /// Consumes the armed edge: a second call without an intervening ARMED
    /// observation blocks. Fails instead of hanging once the monitor is
    /// terminated: with the recorded [`ChassisError::ProtocolViolation`]
    /// after a state skip, or [`ChassisError::MonitorStopped`] after an
    /// orderly shutdown.
    pub async fn wait_armed(&self) -> ChassisResult<()> {
        self.wait_event(&self.shared.armed, "armed").await
    }

    /// Block until a running→IDLE edge has been observed since the last wait.
    ///
    /// Same consumption and failure semantics as [`wait_armed`](Self::wait_armed).
    pub async fn wait_stopped(&self) -> ChassisResult<()> {
        self.wait_event(&self.shared.stopped, "stopped").await
    }

    async fn wait_event(&self, flag: &AtomicBool, what: &str) -> ChassisResult<()> {
        loop {
            // Consume the latch before looking at termination, so an event
            // that was delivered before shutdown still succeeds.
            if flag.swap(false, Ordering::SeqCst) {
                debug!(event = what, "wait satisfied");
                return Ok(());
            }
            if self.shared.terminated.load(Ordering::SeqCst) {
                return Err(self.shared.fatal_error());
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Ask the monitor task to stop. Pending and future waits fail with
    /// `MonitorStopped` once the task has wound down.
    pub fn request_stop(&self) {
        self.stop.notify_one();
    }

    /// Stop the monitor and wait for the task to finish.
    pub async fn stop(mut self) {
        self.stop.notify_one();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for StatusMonitor {
    fn drop(&mut self) {
        self.shared.terminated.store(true, Ordering::SeqCst);
        self.stop.notify_one();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

async fn monitor_loop(
    mut conn: Connection,
    seed_state: CaptureState,
    snapshot_tx: watch::Sender<StatusSnapshot>,
    shared: Arc<MonitorShared>,
    stop: Arc<Notify>,
) {
    let mut prev = seed_state;
    loop {
        let line = tokio::select! {
            _ = stop.notified() => break,
            line = conn.receive_line() => line,
        };
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                // Feed gone: orderly termination, waiters get MonitorStopped.
                debug!(error = %e, "status feed closed");
                break;
            }
        };
        let snap = match StatusSnapshot::parse(&line) {
            Some(snap) => snap,
            None => {
                debug!(line, "discarding unparseable status line");
                continue;
            }
        };

        if prev != CaptureState::Idle && snap.state == CaptureState::Idle {
            debug!("capture stopped");
            shared.stopped.store(true, Ordering::SeqCst);
            shared.armed.store(false, Ordering::SeqCst);
        }
        if snap.state == CaptureState::Armed {
            debug!("capture armed");
            shared.armed.store(true, Ordering::SeqCst);
            shared.stopped.store(false, Ordering::SeqCst);
        }
        if prev == CaptureState::Idle
            && !matches!(snap.state, CaptureState::Idle | CaptureState::Armed)
        {
            warn!(from = %prev, to = %snap.state, "capture state skipped ARM, terminating session");
            *shared.violation.lock() = Some((prev, snap.state));
            shared.terminated.store(true, Ordering::SeqCst);
            return;
        }

        prev = snap.state;
        snapshot_tx.send_replace(snap);
    }
    shared.terminated.store(true, Ordering::SeqCst);
}

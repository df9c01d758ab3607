//! Periodic status refresh and stall watchdog.
//!
//! Every renderer gets a polling thread that calls [`poll`] once per tick.
//! Answers come back as completions and go through the state machine like
//! any other completion.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::config::PollingConfig;
use crate::control::ActionRequest;
use crate::device::Session;
use crate::model::{DesiredState, TransportState};

/// Runs one polling tick for a device, `elapsed` after the previous one.
pub fn poll(s: &mut Session<'_>, polling: &PollingConfig, elapsed: Duration) {
    let name = s.device.name();
    if !s.state.on {
        return;
    }
    if s.polling_suspended() {
        trace!(renderer = name, errors = s.state.action_errors, "Polling suspended");
        return;
    }

    let elapsed_ms = elapsed.as_millis().min(u128::from(u64::MAX)) as u64;
    watchdog(s);

    if let Some(sid) = s.state.subscription.clone() {
        s.state.poll.renew_ms += elapsed_ms;
        if s.state.poll.renew_ms >= polling.subscription_renew_secs * 1000 {
            s.state.poll.renew_ms = 0;
            let timeout = Duration::from_secs(polling.subscription_renew_secs * 2);
            if let Err(err) = s.renew_subscription(&sid, timeout) {
                warn!(renderer = name, sid = %sid, error = %err, "Subscription renewal failed");
                s.state.subscription = None;
            }
        }
    }

    // Nothing to watch on a renderer that is stopped as requested.
    if s.state.desired == DesiredState::Stopped && s.state.transport == TransportState::Stopped {
        return;
    }

    s.state.poll.track_ms += elapsed_ms;
    s.state.poll.state_ms += elapsed_ms;

    let transport = s.state.transport;
    if s.state.poll.track_ms >= polling.track_poll_ms {
        s.state.poll.track_ms = 0;
        if !matches!(transport, TransportState::Stopped | TransportState::Paused) {
            s.issue_logged(ActionRequest::GetPositionInfo);
            s.issue_logged(ActionRequest::GetMediaInfo);
        }
    }

    if s.state.poll.state_ms >= polling.state_poll_ms {
        s.state.poll.state_ms = 0;
        s.issue_logged(ActionRequest::GetTransportInfo);
    }
}

/// Counts ticks where the renderer contradicts what the host asked for.
/// Pending actions and transitions are not contradictions yet.
fn watchdog(s: &mut Session<'_>) {
    let threshold = s.device.config().stall_threshold;
    let mismatch = s.state.queue.is_empty() && s.state.desired.contradicts(s.state.transport);
    if !mismatch {
        s.state.stall_count = 0;
        return;
    }

    s.state.stall_count += 1;
    trace!(
        renderer = s.device.name(),
        stalls = s.state.stall_count,
        desired = ?s.state.desired,
        observed = %s.state.transport,
        "State mismatch"
    );
    if threshold > 0 && s.state.stall_count >= threshold {
        warn!(
            renderer = s.device.name(),
            desired = ?s.state.desired,
            observed = %s.state.transport,
            "Renderer stalled"
        );
        s.request_reset();
    }
}

/// A supervised polling thread.
pub struct Poller {
    stop_flag: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Poller {
    /// Spawns a thread calling `tick` every `interval` until stopped.
    /// `tick` receives the time elapsed since its previous call.
    pub fn spawn(
        name: &str,
        interval: Duration,
        mut tick: impl FnMut(Duration) + Send + 'static,
    ) -> std::io::Result<Self> {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let thread_flag = Arc::clone(&stop_flag);
        let thread_name = format!("poller-{name}");

        let handle = thread::Builder::new().name(thread_name).spawn(move || {
            let mut last = Instant::now();
            while !thread_flag.load(Ordering::SeqCst) {
                thread::sleep(interval);
                if thread_flag.load(Ordering::SeqCst) {
                    break;
                }
                let now = Instant::now();
                tick(now.duration_since(last));
                last = now;
            }
        })?;

        debug!(poller = name, "Polling thread started");
        Ok(Self {
            stop_flag,
            handle: Some(handle),
        })
    }

    pub fn signal_stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
    }

    /// Stops the thread and waits for it.
    pub fn stop(mut self) {
        self.signal_stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.signal_stop();
    }
}

//! Per-renderer record.
//!
//! A [`Device`] couples what never changes after creation (identity,
//! service endpoints, settings, volume curve) with a [`DeviceState`] behind
//! the device lock. Every mutation goes through a [`Session`], which holds
//! that lock, issues outbound calls and collects the host events to send
//! once the lock is released.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, warn};

use crate::action_queue::ActionQueue;
use crate::capabilities::ProtocolCapabilities;
use crate::config::{DeviceConfig, PollingConfig};
use crate::control::{ActionRequest, ActionTag, ControlPoint};
use crate::errors::BridgeError;
use crate::host::Notifications;
use crate::model::{DesiredState, HostEvent, RendererDescription, TrackMetadata, TransportState};
use crate::sequence::{SeqCounter, SeqNo};
use crate::table::DeviceHandle;
use crate::volume_curve::VolumeCurve;

/// A media URI as handed to the renderer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MediaUri {
    pub uri: String,
    pub protocol_info: String,
    pub metadata: TrackMetadata,
}

/// Elapsed time since each kind of poll was last issued.
#[derive(Clone, Copy, Debug, Default)]
pub struct PollClock {
    pub state_ms: u64,
    pub track_ms: u64,
    pub renew_ms: u64,
}

/// Discovery bookkeeping.
#[derive(Clone, Copy, Debug, Default)]
pub struct Presence {
    /// Set at each rediscovery round, cleared when the renderer answers.
    pub timed_out: bool,
    /// Rounds left before a silent renderer is removed; 0 keeps it forever.
    pub missing_budget: u32,
}

#[derive(Debug)]
pub struct DeviceState {
    /// Controlled by the host.
    pub on: bool,
    pub transport: TransportState,
    pub desired: DesiredState,
    pub elapsed_ms: u64,
    /// Position recorded at PAUSE, re-asserted at UNPAUSE.
    pub paused_at: Option<u64>,
    pub current: Option<MediaUri>,
    pub next: Option<MediaUri>,
    /// Result of the last SET_FORMAT.
    pub protocol_info: Option<String>,
    pub capabilities: ProtocolCapabilities,
    /// Renderer volume, already mapped through the curve.
    pub volume: Option<u32>,
    pub seq: SeqCounter,
    pub last_acked: SeqNo,
    /// Positions and URIs answered by calls tagged at or before this were
    /// measured before the last STOP, SET_URI or reset.
    pub stale_before: SeqNo,
    pub action_errors: u32,
    pub stall_count: u32,
    pub queue: ActionQueue,
    pub poll: PollClock,
    pub subscription: Option<String>,
    pub presence: Presence,
}

impl DeviceState {
    fn new(remove_count: u32) -> Self {
        Self {
            on: false,
            transport: TransportState::Stopped,
            desired: DesiredState::Stopped,
            elapsed_ms: 0,
            paused_at: None,
            current: None,
            next: None,
            protocol_info: None,
            capabilities: ProtocolCapabilities::default(),
            volume: None,
            seq: SeqCounter::new(),
            last_acked: SeqNo::default(),
            stale_before: SeqNo::default(),
            action_errors: 0,
            stall_count: 0,
            queue: ActionQueue::new(),
            poll: PollClock::default(),
            subscription: None,
            presence: Presence {
                timed_out: false,
                missing_budget: remove_count,
            },
        }
    }

    /// Records an acknowledgement; older tags never move it back.
    pub fn acknowledge(&mut self, seq: SeqNo) {
        if seq.is_after(self.last_acked) {
            self.last_acked = seq;
        }
    }

    /// Makes every call issued so far stale.
    pub fn mark_stale(&mut self) {
        self.stale_before = self.seq.last_issued();
    }

    pub fn is_stale(&self, seq: SeqNo) -> bool {
        seq.is_at_or_before(self.stale_before)
    }
}

/// Copy of the observable state of a device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceStatus {
    pub on: bool,
    pub transport: TransportState,
    pub desired: DesiredState,
    pub current_uri: Option<String>,
    pub next_uri: Option<String>,
    pub queued: usize,
    pub last_acked: SeqNo,
    pub action_errors: u32,
    pub stall_count: u32,
    pub volume: Option<u32>,
}

#[derive(Debug)]
pub struct Device {
    handle: DeviceHandle,
    name: String,
    description: RendererDescription,
    config: DeviceConfig,
    curve: VolumeCurve,
    max_action_errors: u32,
    state: Mutex<DeviceState>,
}

impl Device {
    /// Fails with a configuration error when the volume curve is invalid.
    pub fn new(
        handle: DeviceHandle,
        description: RendererDescription,
        config: DeviceConfig,
        polling: &PollingConfig,
    ) -> Result<Self, BridgeError> {
        let curve = VolumeCurve::parse(&config.volume_curve)?;
        Ok(Self::with_curve(handle, description, config, curve, polling))
    }

    /// Builds a device around an already validated volume curve.
    pub fn with_curve(
        handle: DeviceHandle,
        description: RendererDescription,
        config: DeviceConfig,
        curve: VolumeCurve,
        polling: &PollingConfig,
    ) -> Self {
        let name = if config.name.is_empty() {
            description.friendly_name.clone()
        } else {
            config.name.clone()
        };
        let state = DeviceState::new(config.remove_count);

        Self {
            handle,
            name,
            description,
            config,
            curve,
            max_action_errors: polling.max_action_errors,
            state: Mutex::new(state),
        }
    }

    pub fn handle(&self) -> DeviceHandle {
        self.handle
    }

    pub fn udn(&self) -> &str {
        &self.description.udn
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &RendererDescription {
        &self.description
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn curve(&self) -> &VolumeCurve {
        &self.curve
    }

    pub fn max_action_errors(&self) -> u32 {
        self.max_action_errors
    }

    /// Locks the device state. A panic in another holder does not make the
    /// state unusable: the guard is recovered.
    pub fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> DeviceStatus {
        let state = self.lock();
        DeviceStatus {
            on: state.on,
            transport: state.transport,
            desired: state.desired,
            current_uri: state.current.as_ref().map(|m| m.uri.clone()),
            next_uri: state.next.as_ref().map(|m| m.uri.clone()),
            queued: state.queue.len(),
            last_acked: state.last_acked,
            action_errors: state.action_errors,
            stall_count: state.stall_count,
            volume: state.volume,
        }
    }

    /// Runs `work` under the device lock. The host events it produced are
    /// returned for delivery after the lock is gone.
    pub fn session<R>(
        &self,
        control: &dyn ControlPoint,
        work: impl FnOnce(&mut Session<'_>) -> R,
    ) -> (R, Notifications) {
        let mut session = Session {
            device: self,
            state: self.lock(),
            control,
            notifications: Notifications::new(self.handle),
        };
        let result = work(&mut session);
        let Session { notifications, .. } = session;
        (result, notifications)
    }
}

/// Exclusive access to one device for the duration of a host command,
/// a completion or a poll.
pub struct Session<'a> {
    pub device: &'a Device,
    pub state: MutexGuard<'a, DeviceState>,
    control: &'a dyn ControlPoint,
    notifications: Notifications,
}

impl Session<'_> {
    /// Sends `request` to the renderer and returns the tag it carries.
    pub fn issue(&mut self, request: ActionRequest) -> Result<SeqNo, BridgeError> {
        let device = self.device;
        let service = request.service();
        let endpoint = device
            .description
            .services
            .get(service)
            .ok_or_else(|| BridgeError::missing_service(device.name(), &service.to_string()))?;

        let seq = self.state.seq.advance();
        let tag = ActionTag {
            device: device.handle,
            seq,
        };
        debug!(
            renderer = device.name(),
            action = request.action_name(),
            seq = %seq,
            "Issuing action"
        );

        if let Err(err) = self.control.invoke(endpoint, &request, tag) {
            warn!(
                renderer = device.name(),
                action = request.action_name(),
                error = %err,
                "Action could not be sent"
            );
            self.record_action_error();
            return Err(err);
        }
        Ok(seq)
    }

    /// Like [`Session::issue`] for calls whose failure is only logged; the
    /// error count already reflects it.
    pub fn issue_logged(&mut self, request: ActionRequest) -> Option<SeqNo> {
        let action = request.action_name();
        match self.issue(request) {
            Ok(seq) => Some(seq),
            Err(err) => {
                debug!(renderer = self.device.name(), action, error = %err, "Action not issued");
                None
            }
        }
    }

    pub fn renew_subscription(&self, sid: &str, timeout: Duration) -> Result<(), BridgeError> {
        self.control.renew(sid, timeout)
    }

    pub fn notify(&mut self, event: HostEvent) {
        self.notifications.push(event);
    }

    pub fn record_action_success(&mut self) {
        self.state.action_errors = 0;
    }

    /// Counts a failed call. Reaching the ceiling suspends polling and asks
    /// the host for a reset.
    pub fn record_action_error(&mut self) {
        self.state.action_errors = self.state.action_errors.saturating_add(1);
        if self.state.action_errors == self.device.max_action_errors {
            warn!(
                renderer = self.device.name(),
                errors = self.state.action_errors,
                "Renderer unresponsive, polling suspended"
            );
            self.request_reset();
        }
    }

    pub fn polling_suspended(&self) -> bool {
        self.state.action_errors >= self.device.max_action_errors
    }

    /// Asks the host to tear down and rebuild its player session.
    pub fn request_reset(&mut self) {
        warn!(renderer = self.device.name(), "Requesting host session reset");
        self.state.stall_count = 0;
        self.state.queue.flush();
        self.state.mark_stale();
        self.notify(HostEvent::OnOff(false));
        self.notify(HostEvent::OnOff(true));
    }
}

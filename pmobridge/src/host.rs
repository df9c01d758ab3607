//! Boundary with the host playback server.

use tracing::trace;

use crate::errors::BridgeError;
use crate::model::HostEvent;
use crate::table::DeviceHandle;

/// The host side: players are attached to it and receive playback events.
///
/// Implementations may call back into the gateway from `notify`, which is
/// why the gateway never calls it while holding a device lock.
pub trait HostBridge: Send + Sync {
    /// Registers a new player for renderer `device`. Returning an error
    /// makes the gateway drop the renderer.
    fn attach(&self, device: DeviceHandle, name: &str) -> Result<(), BridgeError>;

    fn detach(&self, device: DeviceHandle);

    fn notify(&self, device: DeviceHandle, event: HostEvent);
}

/// Host events computed under a device lock, delivered once it is released.
#[derive(Debug)]
#[must_use = "notifications must be delivered to the host"]
pub struct Notifications {
    device: DeviceHandle,
    events: Vec<HostEvent>,
}

impl Notifications {
    pub fn new(device: DeviceHandle) -> Self {
        Self {
            device,
            events: Vec::new(),
        }
    }

    pub fn push(&mut self, event: HostEvent) {
        self.events.push(event);
    }

    pub fn events(&self) -> &[HostEvent] {
        &self.events
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn deliver(self, host: &dyn HostBridge) {
        for event in self.events {
            trace!(device = %self.device, ?event, "Notifying host");
            host.notify(self.device, event);
        }
    }
}

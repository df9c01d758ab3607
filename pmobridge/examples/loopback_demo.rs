//! Drives an in-memory renderer through a short playback session.
//!
//! ```sh
//! RUST_LOG=pmobridge=debug cargo run -p pmobridge --example loopback_demo
//! ```

use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::Duration;

use pmobridge::{
    ActionCompletion, ActionRequest, ActionTag, BridgeConfig, BridgeError, CompletionSink,
    ControlPoint, DescriptionProvider, DeviceHandle, DiscoveryFacility, Gateway, HostBridge,
    HostCommand, HostEvent, RendererDescription, ServiceEndpoint, ServiceKind, ServiceSet,
    TransportState, UriRequest,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

const LOCATION: &str = "http://127.0.0.1:49152/description.xml";

/// Renderer that plays instantly and moves to the next track after a few
/// position polls.
#[derive(Default)]
struct LoopbackRenderer {
    sink: OnceLock<CompletionSink>,
    state: Mutex<(TransportState, u64)>,
}

impl ControlPoint for LoopbackRenderer {
    fn invoke(
        &self,
        _endpoint: &ServiceEndpoint,
        request: &ActionRequest,
        tag: ActionTag,
    ) -> Result<(), BridgeError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut completion = ActionCompletion::success(tag);
        match request {
            ActionRequest::Play => state.0 = TransportState::Playing,
            ActionRequest::Pause => state.0 = TransportState::Paused,
            ActionRequest::Stop => *state = (TransportState::Stopped, 0),
            ActionRequest::SetUri { .. } => state.1 = 0,
            ActionRequest::GetTransportInfo => {
                completion = completion.with_field("CurrentTransportState", state.0.as_upnp());
            }
            ActionRequest::GetPositionInfo => {
                state.1 += 1;
                let rel_time = format!("0:00:{:02}", state.1.min(59));
                completion = completion.with_field("RelTime", &rel_time);
                if state.1 >= 4 {
                    *state = (TransportState::Stopped, 0);
                }
            }
            ActionRequest::GetProtocolInfo => {
                completion = completion.with_field(
                    "Sink",
                    "http-get:*:audio/flac:*,http-get:*:audio/mpeg:*,http-get:*:audio/L16:*",
                );
            }
            _ => {}
        }
        if let Some(sink) = self.sink.get() {
            sink.action_complete(completion);
        }
        Ok(())
    }

    fn subscribe(&self, _endpoint: &ServiceEndpoint, _timeout: Duration) -> Result<String, BridgeError> {
        Err(BridgeError::action_failed("SUBSCRIBE", 501))
    }

    fn renew(&self, _sid: &str, _timeout: Duration) -> Result<(), BridgeError> {
        Ok(())
    }
}

/// Answers every search with the loopback renderer.
struct LoopbackDiscovery {
    sink: OnceLock<CompletionSink>,
}

impl DiscoveryFacility for LoopbackDiscovery {
    fn search(&self, _timeout: Duration) -> Result<(), BridgeError> {
        if let Some(sink) = self.sink.get() {
            sink.search_result(LOCATION);
            sink.search_timeout();
        }
        Ok(())
    }
}

struct LoopbackDescription;

impl DescriptionProvider for LoopbackDescription {
    fn describe(&self, location: &str) -> Result<RendererDescription, BridgeError> {
        let mut services = ServiceSet::default();
        for kind in ServiceKind::ALL {
            services.insert(
                kind,
                ServiceEndpoint {
                    service_type: format!("{}1", kind.urn_prefix()),
                    control_url: format!("http://127.0.0.1:49152/{kind}/control"),
                    event_url: format!("http://127.0.0.1:49152/{kind}/event"),
                },
            );
        }
        Ok(RendererDescription {
            udn: "uuid:loopback-renderer".to_string(),
            friendly_name: "Loopback".to_string(),
            manufacturer: "PMOMusic".to_string(),
            model_name: "In-memory".to_string(),
            location: location.to_string(),
            services,
        })
    }
}

/// Host side: prints events and remembers the attached player.
#[derive(Default)]
struct ConsoleHost {
    player: Mutex<Option<DeviceHandle>>,
}

impl HostBridge for ConsoleHost {
    fn attach(&self, device: DeviceHandle, name: &str) -> Result<(), BridgeError> {
        info!(device = %device, name, "Player attached");
        *self.player.lock().unwrap_or_else(|e| e.into_inner()) = Some(device);
        Ok(())
    }

    fn detach(&self, device: DeviceHandle) {
        info!(device = %device, "Player detached");
    }

    fn notify(&self, device: DeviceHandle, event: HostEvent) {
        info!(device = %device, ?event, "Host event");
    }
}

fn track(resource: &str) -> UriRequest {
    UriRequest {
        resource: resource.to_string(),
        ..UriRequest::default()
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = BridgeConfig::default();
    config.polling.tick_ms = 200;
    config.polling.state_poll_ms = 200;
    config.polling.track_poll_ms = 400;

    let control = Arc::new(LoopbackRenderer::default());
    let discovery = Arc::new(LoopbackDiscovery {
        sink: OnceLock::new(),
    });
    let host = Arc::new(ConsoleHost::default());
    let gateway = Gateway::new(
        config,
        control.clone(),
        discovery.clone(),
        Arc::new(LoopbackDescription),
        host.clone(),
    );
    let _ = control.sink.set(gateway.completion_sink());
    let _ = discovery.sink.set(gateway.completion_sink());

    gateway.start()?;

    let mut player = None;
    for _ in 0..50 {
        player = *host.player.lock().unwrap_or_else(|e| e.into_inner());
        if player.is_some() {
            break;
        }
        thread::sleep(Duration::from_millis(100));
    }
    let Some(player) = player else {
        anyhow::bail!("loopback renderer was not discovered");
    };

    gateway.handle_command(player, HostCommand::OnOff(true))?;
    gateway.handle_command(player, HostCommand::SetUri(track("track-1.flac")))?;
    gateway.handle_command(player, HostCommand::SetNextUri(track("track-2.flac")))?;
    gateway.handle_command(player, HostCommand::Play)?;

    thread::sleep(Duration::from_secs(6));
    if let Some(status) = gateway.device_status(player) {
        info!(?status, "Final status");
    }

    gateway.handle_command(player, HostCommand::Stop)?;
    gateway.shutdown();
    Ok(())
}

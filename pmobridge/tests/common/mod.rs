//! In-memory stand-ins for the network facilities and the host.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pmobridge::{
    ActionCompletion, ActionRequest, ActionTag, BridgeConfig, BridgeError, ControlPoint,
    DescriptionProvider, DeviceHandle, DiscoveryFacility, Gateway, HostBridge, HostCommand,
    HostEvent, MediaServerConfig, RendererDescription, SeqNo, ServiceEndpoint, ServiceKind,
    ServiceSet, UriRequest,
};

/// Records every call; completions are fed by the test.
#[derive(Default)]
pub struct FakeControl {
    pub calls: Mutex<Vec<(ActionRequest, ActionTag)>>,
    pub unsubscribed: Mutex<Vec<String>>,
}

impl FakeControl {
    pub fn actions(&self) -> Vec<&'static str> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(request, _)| request.action_name())
            .collect()
    }

    pub fn requests(&self) -> Vec<ActionRequest> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(request, _)| request.clone())
            .collect()
    }

    /// Tag of the latest call named `action`.
    pub fn tag_of(&self, action: &str) -> ActionTag {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(request, _)| request.action_name() == action)
            .map(|(_, tag)| *tag)
            .unwrap()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }
}

impl ControlPoint for FakeControl {
    fn invoke(
        &self,
        _endpoint: &ServiceEndpoint,
        request: &ActionRequest,
        tag: ActionTag,
    ) -> Result<(), BridgeError> {
        self.calls.lock().unwrap().push((request.clone(), tag));
        Ok(())
    }

    fn subscribe(&self, _endpoint: &ServiceEndpoint, _timeout: Duration) -> Result<String, BridgeError> {
        Ok("uuid:sub-1".to_string())
    }

    fn renew(&self, _sid: &str, _timeout: Duration) -> Result<(), BridgeError> {
        Ok(())
    }

    fn unsubscribe(&self, sid: &str) {
        self.unsubscribed.lock().unwrap().push(sid.to_string());
    }
}

#[derive(Default)]
pub struct FakeHost {
    pub events: Mutex<Vec<(DeviceHandle, HostEvent)>>,
    pub attached: Mutex<Vec<DeviceHandle>>,
    pub detached: Mutex<Vec<DeviceHandle>>,
    pub refuse: bool,
}

impl FakeHost {
    pub fn events(&self) -> Vec<HostEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|(_, event)| event.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

impl HostBridge for FakeHost {
    fn attach(&self, device: DeviceHandle, name: &str) -> Result<(), BridgeError> {
        if self.refuse {
            return Err(BridgeError::HostRefused(name.to_string(), "no player slot".to_string()));
        }
        self.attached.lock().unwrap().push(device);
        Ok(())
    }

    fn detach(&self, device: DeviceHandle) {
        self.detached.lock().unwrap().push(device);
    }

    fn notify(&self, device: DeviceHandle, event: HostEvent) {
        self.events.lock().unwrap().push((device, event));
    }
}

#[derive(Default)]
pub struct FakeDiscovery {
    pub searches: Mutex<usize>,
}

impl DiscoveryFacility for FakeDiscovery {
    fn search(&self, _timeout: Duration) -> Result<(), BridgeError> {
        *self.searches.lock().unwrap() += 1;
        Ok(())
    }
}

/// Serves descriptions by location.
#[derive(Default)]
pub struct FakeProvider {
    pub descriptions: Mutex<HashMap<String, RendererDescription>>,
    pub fetches: Mutex<usize>,
}

impl FakeProvider {
    pub fn publish(&self, description: RendererDescription) {
        self.descriptions
            .lock()
            .unwrap()
            .insert(description.location.clone(), description);
    }
}

impl DescriptionProvider for FakeProvider {
    fn describe(&self, location: &str) -> Result<RendererDescription, BridgeError> {
        *self.fetches.lock().unwrap() += 1;
        self.descriptions
            .lock()
            .unwrap()
            .get(location)
            .cloned()
            .ok_or_else(|| BridgeError::Description(format!("no document at {location}")))
    }
}

pub fn renderer(udn: &str, manufacturer: &str) -> RendererDescription {
    let location = format!("http://10.0.0.5:1400/{}/desc.xml", udn.trim_start_matches("uuid:"));
    let mut services = ServiceSet::default();
    for kind in ServiceKind::ALL {
        services.insert(
            kind,
            ServiceEndpoint {
                service_type: format!("{}1", kind.urn_prefix()),
                control_url: format!("http://10.0.0.5:1400/{kind}/control"),
                event_url: format!("http://10.0.0.5:1400/{kind}/event"),
            },
        );
    }
    RendererDescription {
        udn: udn.to_string(),
        friendly_name: format!("Renderer {udn}"),
        manufacturer: manufacturer.to_string(),
        model_name: "Streamer".to_string(),
        location,
        services,
    }
}

pub fn test_config() -> BridgeConfig {
    BridgeConfig {
        media_server: MediaServerConfig {
            host: "192.168.1.2".to_string(),
            port: 8090,
            ..MediaServerConfig::default()
        },
        ..BridgeConfig::default()
    }
}

pub fn uri(resource: &str) -> UriRequest {
    UriRequest {
        resource: resource.to_string(),
        ..UriRequest::default()
    }
}

pub struct TestBench {
    pub gateway: Gateway,
    pub control: Arc<FakeControl>,
    pub host: Arc<FakeHost>,
    pub discovery: Arc<FakeDiscovery>,
    pub provider: Arc<FakeProvider>,
}

pub fn create_bench(config: BridgeConfig) -> TestBench {
    create_bench_with_host(config, FakeHost::default())
}

pub fn create_bench_with_host(config: BridgeConfig, host: FakeHost) -> TestBench {
    let control = Arc::new(FakeControl::default());
    let host = Arc::new(host);
    let discovery = Arc::new(FakeDiscovery::default());
    let provider = Arc::new(FakeProvider::default());
    let gateway = Gateway::new(
        config,
        control.clone(),
        discovery.clone(),
        provider.clone(),
        host.clone(),
    );
    TestBench {
        gateway,
        control,
        host,
        discovery,
        provider,
    }
}

impl TestBench {
    /// Adds a renderer, switches it on and forgets the setup calls.
    pub fn add_active(&self, udn: &str) -> DeviceHandle {
        let handle = self.gateway.add_renderer(renderer(udn, "Acme")).unwrap();
        self.gateway
            .handle_command(handle, HostCommand::OnOff(true))
            .unwrap();
        self.control.clear();
        handle
    }

    pub fn command(&self, handle: DeviceHandle, command: HostCommand) {
        self.gateway.handle_command(handle, command).unwrap();
    }

    /// Acknowledges the latest call named `action`.
    pub fn ack(&self, action: &str) {
        self.gateway
            .on_action_complete(ActionCompletion::success(self.control.tag_of(action)));
    }

    /// A GetTransportInfo answer that acknowledges nothing new.
    pub fn report(&self, handle: DeviceHandle, state: &str) {
        let tag = ActionTag {
            device: handle,
            seq: SeqNo(0),
        };
        self.gateway.on_action_complete(
            ActionCompletion::success(tag).with_field("CurrentTransportState", state),
        );
    }
}

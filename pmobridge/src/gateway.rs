//! Renderer lifecycle and background work.
//!
//! The [`Gateway`] owns the device table and routes everything that reaches
//! a renderer: host commands, action completions, transport events and
//! polling ticks. Discovery answers are staged and folded into the table at
//! the end of each search window, and renderers that stop answering are
//! removed after `remove_count` silent rounds.
//!
//! Lock discipline: the table lock is only taken to look up, allocate or
//! free slots, the device lock is taken through a [`Session`], and host
//! notifications are delivered after both are released.
//!
//! [`Session`]: crate::device::Session

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, error, info, trace, warn};

use crate::config::BridgeConfig;
use crate::control::{
    ActionCompletion, ActionRequest, CompletionSink, ControlEvent, ControlPoint,
    DescriptionProvider, DiscoveryFacility, TransportEvent,
};
use crate::device::{Device, DeviceStatus};
use crate::dispatcher::{self, CommandReply};
use crate::errors::BridgeError;
use crate::host::{HostBridge, Notifications};
use crate::model::{HostCommand, RendererDescription, ServiceKind, TransportState};
use crate::poller::{self, Poller};
use crate::table::{DeviceHandle, DeviceTable};
use crate::transport;
use crate::volume_curve::VolumeCurve;

const EVENT_WAIT: Duration = Duration::from_millis(100);
const DISCOVERY_WAIT: Duration = Duration::from_millis(250);

struct Inner {
    config: BridgeConfig,
    control: Arc<dyn ControlPoint>,
    discovery: Arc<dyn DiscoveryFacility>,
    provider: Arc<dyn DescriptionProvider>,
    host: Arc<dyn HostBridge>,
    table: Mutex<DeviceTable<Device>>,
    /// Description locations reported during the current search window.
    found: Mutex<Vec<String>>,
    pollers: Mutex<HashMap<DeviceHandle, Poller>>,
    sink: CompletionSink,
    events: Receiver<ControlEvent>,
    stop_flag: Arc<AtomicBool>,
    started: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// Cheaply clonable handle on the gateway.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Gateway {
    pub fn new(
        config: BridgeConfig,
        control: Arc<dyn ControlPoint>,
        discovery: Arc<dyn DiscoveryFacility>,
        provider: Arc<dyn DescriptionProvider>,
        host: Arc<dyn HostBridge>,
    ) -> Self {
        let (sink, events) = CompletionSink::channel();
        let table = DeviceTable::with_capacity(config.discovery.max_renderers);
        Self {
            inner: Arc::new(Inner {
                config,
                control,
                discovery,
                provider,
                host,
                table: Mutex::new(table),
                found: Mutex::new(Vec::new()),
                pollers: Mutex::new(HashMap::new()),
                sink,
                events,
                stop_flag: Arc::new(AtomicBool::new(false)),
                started: AtomicBool::new(false),
                workers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    /// Where the control and discovery facilities report back.
    pub fn completion_sink(&self) -> CompletionSink {
        self.inner.sink.clone()
    }

    fn table(&self) -> MutexGuard<'_, DeviceTable<Device>> {
        lock(&self.inner.table)
    }

    fn pollers(&self) -> MutexGuard<'_, HashMap<DeviceHandle, Poller>> {
        lock(&self.inner.pollers)
    }

    pub fn device(&self, handle: DeviceHandle) -> Option<Arc<Device>> {
        self.table().get(handle)
    }

    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.table()
            .snapshot()
            .into_iter()
            .map(|(_, device)| device)
            .collect()
    }

    pub fn find_device(&self, udn: &str) -> Option<Arc<Device>> {
        self.table()
            .find(|device| device.udn() == udn)
            .map(|(_, device)| device)
    }

    pub fn device_status(&self, handle: DeviceHandle) -> Option<DeviceStatus> {
        self.device(handle).map(|device| device.status())
    }

    /// Runs a host command against renderer `handle`.
    pub fn handle_command(
        &self,
        handle: DeviceHandle,
        command: HostCommand,
    ) -> Result<CommandReply, BridgeError> {
        let Some(device) = self.device(handle) else {
            warn!(device = %handle, command = command.name(), "Command for unknown device");
            return Err(BridgeError::UnknownDevice(handle.to_string()));
        };

        let media_server = &self.inner.config.media_server;
        let (result, notifications) = device.session(self.inner.control.as_ref(), |s| {
            dispatcher::dispatch(s, media_server, command)
        });
        notifications.deliver(self.inner.host.as_ref());

        if let Err(err) = &result {
            if err.is_command_rejection() {
                debug!(renderer = device.name(), error = %err, "Command rejected");
            } else {
                warn!(renderer = device.name(), error = %err, "Command failed");
            }
        }
        result
    }

    /// Feeds the outcome of an outbound call to its device. Completions for
    /// a renderer that has been removed meanwhile are dropped.
    pub fn on_action_complete(&self, completion: ActionCompletion) {
        let Some(tag) = completion.tag else {
            trace!(code = completion.error_code, "Untagged completion");
            return;
        };
        let Some(device) = self.device(tag.device) else {
            debug!(device = %tag.device, seq = %tag.seq, "Completion for vanished device");
            return;
        };

        let (on, notifications) = device.session(self.inner.control.as_ref(), |s| {
            transport::on_action_complete(s, &completion);
            s.state.on
        });
        self.deliver_if_on(&device, on, notifications);
    }

    /// Applies an AVTransport event to the subscribed device.
    pub fn on_transport_event(&self, event: TransportEvent) {
        let device = self
            .devices()
            .into_iter()
            .find(|device| device.lock().subscription.as_deref() == Some(event.sid.as_str()));
        let Some(device) = device else {
            trace!(sid = %event.sid, "Event for unknown subscription");
            return;
        };

        let (on, notifications) = device.session(self.inner.control.as_ref(), |s| {
            if let Some(raw) = event.transport_state.as_deref() {
                match TransportState::from_upnp(raw) {
                    Some(state) => transport::on_transport_state(s, state),
                    None => trace!(renderer = s.device.name(), state = raw, "Untracked transport state"),
                }
            }
            if let Some(uri) = event.current_track_uri.as_deref() {
                transport::on_track_uri(s, uri);
            }
            s.state.on
        });
        self.deliver_if_on(&device, on, notifications);
    }

    /// The state is kept current for a device the host switched off, but
    /// the host does not hear about it.
    fn deliver_if_on(&self, device: &Device, on: bool, notifications: Notifications) {
        if on {
            notifications.deliver(self.inner.host.as_ref());
        } else if !notifications.is_empty() {
            trace!(renderer = device.name(), "Device off, events not forwarded");
        }
    }

    /// Stages a description location found by the current search.
    pub fn on_search_result(&self, location: impl Into<String>) {
        let location = location.into();
        trace!(location = %location, "Renderer answered search");
        lock(&self.inner.found).push(location);
    }

    /// Flags every renderer as unconfirmed until it answers a new search.
    pub fn mark_for_rediscovery(&self) {
        for device in self.devices() {
            device.lock().presence.timed_out = true;
        }
    }

    /// Folds the staged search answers into the table, then removes the
    /// renderers that stayed silent for too many rounds.
    pub fn update_devices(&self) {
        let mut locations = std::mem::take(&mut *lock(&self.inner.found));
        locations.sort();
        locations.dedup();

        for location in locations {
            let known = self
                .devices()
                .into_iter()
                .find(|device| device.description().location == location);
            if let Some(device) = known {
                refresh(&device);
                continue;
            }

            let description = match self.inner.provider.describe(&location) {
                Ok(description) => description,
                Err(err) => {
                    warn!(location = %location, error = %err, "Cannot read renderer description");
                    continue;
                }
            };
            if let Some(device) = self.find_device(&description.udn) {
                refresh(&device);
                continue;
            }
            match self.add_renderer(description) {
                Ok(_) => {}
                Err(err @ BridgeError::Ignored(..)) => debug!(location = %location, "{err}"),
                Err(err) => warn!(location = %location, error = %err, "Renderer not added"),
            }
        }

        let mut expired = Vec::new();
        for device in self.devices() {
            let mut state = device.lock();
            let presence = &mut state.presence;
            if presence.timed_out && presence.missing_budget > 0 {
                presence.missing_budget -= 1;
                if presence.missing_budget == 0 {
                    expired.push(device.handle());
                }
            }
        }
        for handle in expired {
            info!(device = %handle, "Renderer missing, removing");
            self.remove_renderer(handle);
        }
    }

    /// Creates a device for `description` and attaches it to the host.
    ///
    /// Renderers of our own product family and disabled ones are
    /// [`BridgeError::Ignored`]. An already known UDN yields its handle.
    pub fn add_renderer(&self, description: RendererDescription) -> Result<DeviceHandle, BridgeError> {
        let config = &self.inner.config;
        let udn = description.udn.clone();
        let friendly_name = description.friendly_name.clone();

        let own_family = &config.discovery.self_manufacturer;
        if !own_family.is_empty() && description.manufacturer.contains(own_family.as_str()) {
            return Err(BridgeError::Ignored(
                friendly_name,
                format!("made by {}", description.manufacturer),
            ));
        }

        let settings = config.device(&udn);
        if !settings.enabled {
            return Err(BridgeError::Ignored(friendly_name, "disabled".to_string()));
        }
        if !description.services.has(ServiceKind::AvTransport) {
            return Err(BridgeError::missing_service(
                &friendly_name,
                &ServiceKind::AvTransport.to_string(),
            ));
        }

        let curve = VolumeCurve::parse(&settings.volume_curve).inspect_err(|err| {
            error!(renderer = %friendly_name, error = %err, "Invalid volume curve, renderer skipped");
        })?;

        let (handle, device) = {
            let mut table = self.table();
            if let Some((handle, _)) = table.find(|device| device.udn() == udn) {
                return Ok(handle);
            }
            table
                .insert_with(|handle| {
                    Device::with_curve(handle, description, settings, curve, &config.polling)
                })
                .inspect_err(|err| {
                    error!(renderer = %friendly_name, error = %err, "Cannot add renderer");
                })?
        };

        let ((), notifications) = device.session(self.inner.control.as_ref(), |s| {
            s.issue_logged(ActionRequest::GetProtocolInfo);
        });

        if config.polling.use_events {
            self.subscribe(&device);
        }

        if let Err(err) = self.inner.host.attach(handle, device.name()) {
            warn!(renderer = device.name(), error = %err, "Host refused renderer");
            self.discard(handle);
            return Err(BridgeError::HostRefused(device.name().to_string(), err.to_string()));
        }
        notifications.deliver(self.inner.host.as_ref());

        if self.inner.started.load(Ordering::SeqCst) {
            self.start_poller(handle);
        }

        info!(
            renderer = device.name(),
            udn = device.udn(),
            address = ?device.description().address(),
            device = %handle,
            "Added renderer"
        );
        Ok(handle)
    }

    fn subscribe(&self, device: &Device) {
        let Some(endpoint) = device.description().services.get(ServiceKind::AvTransport) else {
            return;
        };
        let timeout = Duration::from_secs(self.inner.config.polling.subscription_renew_secs * 2);
        match self.inner.control.subscribe(endpoint, timeout) {
            Ok(sid) => {
                debug!(renderer = device.name(), sid = %sid, "Subscribed to transport events");
                device.lock().subscription = Some(sid);
            }
            Err(err) => {
                warn!(renderer = device.name(), error = %err, "Subscription failed, polling only");
            }
        }
    }

    /// Frees the slot of `handle` and releases what the device holds.
    /// Returns the device if it was still in the table.
    fn discard(&self, handle: DeviceHandle) -> Option<Arc<Device>> {
        let device = self.table().remove(handle)?;
        let poller = self.pollers().remove(&handle);
        if let Some(poller) = poller {
            poller.stop();
        }

        let sid = {
            let mut state = device.lock();
            state.queue.flush();
            state.on = false;
            state.subscription.take()
        };
        if let Some(sid) = sid {
            self.inner.control.unsubscribe(&sid);
        }
        Some(device)
    }

    /// Detaches renderer `handle` from the host and frees its slot.
    pub fn remove_renderer(&self, handle: DeviceHandle) -> bool {
        let Some(device) = self.discard(handle) else {
            return false;
        };
        self.inner.host.detach(handle);
        info!(renderer = device.name(), device = %handle, "Removed renderer");
        true
    }

    /// Runs one polling tick on `handle` from the calling thread.
    pub fn poll_now(&self, handle: DeviceHandle, elapsed: Duration) {
        let Some(device) = self.device(handle) else {
            return;
        };
        let polling = &self.inner.config.polling;
        let ((), notifications) = device.session(self.inner.control.as_ref(), |s| {
            poller::poll(s, polling, elapsed)
        });
        notifications.deliver(self.inner.host.as_ref());
    }

    fn handle_event(&self, event: ControlEvent) {
        match event {
            ControlEvent::ActionComplete(completion) => self.on_action_complete(completion),
            ControlEvent::Transport(event) => self.on_transport_event(event),
            ControlEvent::SearchResult { location } => self.on_search_result(location),
            ControlEvent::SearchTimeout => self.update_devices(),
        }
    }

    /// Handles the control events already queued, from the calling thread.
    pub fn process_pending_events(&self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.inner.events.try_recv() {
            self.handle_event(event);
            handled += 1;
        }
        handled
    }

    /// Configuration listing every renderer currently known, ready to be
    /// saved and edited.
    pub fn discovered_config(&self) -> BridgeConfig {
        let mut config = self.inner.config.clone();
        for device in self.devices() {
            config.remember_device(device.udn(), &device.description().friendly_name);
        }
        config
    }

    fn start_poller(&self, handle: DeviceHandle) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let interval = Duration::from_millis(self.inner.config.polling.tick_ms);
        let spawned = Poller::spawn(&handle.to_string(), interval, move |elapsed| {
            if let Some(inner) = weak.upgrade() {
                Gateway { inner }.poll_now(handle, elapsed);
            }
        });
        match spawned {
            Ok(poller) => {
                if let Some(previous) = self.pollers().insert(handle, poller) {
                    previous.signal_stop();
                }
            }
            Err(err) => error!(device = %handle, error = %err, "Cannot start polling thread"),
        }
    }

    fn spawn_event_worker(&self, index: usize) -> std::io::Result<JoinHandle<()>> {
        let weak = Arc::downgrade(&self.inner);
        let events = self.inner.events.clone();
        let stop_flag = Arc::clone(&self.inner.stop_flag);

        thread::Builder::new()
            .name(format!("events-{index}"))
            .spawn(move || {
                while !stop_flag.load(Ordering::SeqCst) {
                    match events.recv_timeout(EVENT_WAIT) {
                        Ok(event) => match weak.upgrade() {
                            Some(inner) => Gateway { inner }.handle_event(event),
                            None => break,
                        },
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!(worker = index, "Event worker stopped");
            })
    }

    fn spawn_discovery_loop(&self) -> std::io::Result<JoinHandle<()>> {
        let weak = Arc::downgrade(&self.inner);
        let stop_flag = Arc::clone(&self.inner.stop_flag);
        let discovery = &self.inner.config.discovery;
        let interval = Duration::from_secs(discovery.scan_interval_secs);
        let timeout = Duration::from_secs(discovery.scan_timeout_secs);

        thread::Builder::new()
            .name("discovery".to_string())
            .spawn(move || {
                let mut next_scan = Some(Instant::now());
                while !stop_flag.load(Ordering::SeqCst) {
                    if next_scan.is_some_and(|at| Instant::now() >= at) {
                        let Some(inner) = weak.upgrade() else {
                            break;
                        };
                        Gateway { inner }.scan(timeout);
                        next_scan = (!interval.is_zero()).then(|| Instant::now() + interval);
                    }
                    thread::sleep(DISCOVERY_WAIT);
                }
                debug!("Discovery loop stopped");
            })
    }

    fn scan(&self, timeout: Duration) {
        self.mark_for_rediscovery();
        debug!(timeout_secs = timeout.as_secs(), "Searching renderers");
        if let Err(err) = self.inner.discovery.search(timeout) {
            warn!(error = %err, "Renderer search failed");
        }
    }

    /// Starts the event workers, the discovery loop and one polling thread
    /// per renderer. Calling it again is a no-op.
    pub fn start(&self) -> Result<(), BridgeError> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let config = &self.inner.config;
        if !config.any_enabled() {
            error!("No renderer enabled in configuration, nothing will be controlled");
        }
        self.inner.stop_flag.store(false, Ordering::SeqCst);

        let startup = |err: std::io::Error| BridgeError::Startup(err.to_string());
        {
            let mut workers = lock(&self.inner.workers);
            for index in 0..config.polling.event_workers {
                workers.push(self.spawn_event_worker(index).map_err(startup)?);
            }
            workers.push(self.spawn_discovery_loop().map_err(startup)?);
        }

        for device in self.devices() {
            self.start_poller(device.handle());
        }
        info!(
            workers = config.polling.event_workers,
            scan_interval_secs = config.discovery.scan_interval_secs,
            "Gateway started"
        );
        Ok(())
    }

    /// Stops every background thread, waits for them, then detaches all
    /// renderers from the host. Must not be called from a gateway thread.
    pub fn shutdown(&self) {
        self.inner.stop_flag.store(true, Ordering::SeqCst);
        self.inner.started.store(false, Ordering::SeqCst);

        let pollers: Vec<Poller> = self.pollers().drain().map(|(_, poller)| poller).collect();
        for poller in pollers {
            poller.stop();
        }

        let workers: Vec<JoinHandle<()>> = lock(&self.inner.workers).drain(..).collect();
        let current = thread::current().id();
        for worker in workers {
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                error!("Gateway thread panicked");
            }
        }

        let devices = self.table().drain();
        for (handle, device) in devices {
            let sid = device.lock().subscription.take();
            if let Some(sid) = sid {
                self.inner.control.unsubscribe(&sid);
            }
            self.inner.host.detach(handle);
        }
        info!("Gateway stopped");
    }
}

/// A renderer answered the search again.
fn refresh(device: &Device) {
    let mut state = device.lock();
    state.presence.timed_out = false;
    state.presence.missing_budget = device.config().remove_count;
    state.action_errors = 0;
    trace!(renderer = device.name(), "Renderer still present");
}

//! Drives UPnP/DLNA media renderers on behalf of a music streaming server.
//!
//! Each renderer is mirrored by a [`Device`] whose transport state is kept
//! in sync with polled or evented reports. Host commands are turned into
//! sequenced AVTransport calls, and playback events flow back to the host
//! through a [`HostBridge`]. The network side is abstracted behind
//! [`ControlPoint`], [`DiscoveryFacility`] and [`DescriptionProvider`].

pub mod action_queue;
pub mod capabilities;
pub mod config;
pub mod control;
pub mod device;
pub mod dispatcher;
pub mod errors;
pub mod gateway;
pub mod host;
pub mod model;
pub mod poller;
pub mod provider;
pub mod sequence;
pub mod table;
pub mod time_utils;
pub mod transport;
pub mod volume_curve;

pub use action_queue::{ActionKind, ActionQueue, QueuedAction};
pub use capabilities::ProtocolCapabilities;
pub use config::{
    BridgeConfig, DeviceConfig, DeviceOverrides, DiscoveryConfig, MediaServerConfig, PollingConfig,
    ProcessMode, VolumeMode,
};
pub use control::{
    ActionCompletion, ActionRequest, ActionTag, CompletionSink, ControlEvent, ControlPoint,
    DescriptionProvider, DiscoveryFacility, TransportEvent,
};
pub use device::{Device, DeviceStatus};
pub use dispatcher::CommandReply;
pub use errors::BridgeError;
pub use gateway::Gateway;
pub use host::HostBridge;
pub use model::{
    Codec, DesiredState, FormatRequest, HostCommand, HostEvent, RendererDescription,
    ServiceEndpoint, ServiceKind, ServiceSet, TrackMetadata, TransportState, UriRequest,
};
pub use provider::HttpDescriptionProvider;
pub use sequence::SeqNo;
pub use table::DeviceHandle;
pub use volume_curve::VolumeCurve;

use std::fmt;

/// Renderer transport state as mirrored by the bridge.
///
/// Built once from the AVTransport `TransportState` text at the facility
/// boundary; nothing past that point looks at the raw strings again.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum TransportState {
    #[default]
    Stopped,
    Playing,
    Paused,
    Transitioning,
}

impl TransportState {
    /// Returns `None` for states the bridge does not track
    /// (`NO_MEDIA_PRESENT`, `RECORDING`, vendor extensions…).
    pub fn from_upnp(raw: &str) -> Option<Self> {
        match raw.trim() {
            "STOPPED" => Some(TransportState::Stopped),
            "PLAYING" => Some(TransportState::Playing),
            "PAUSED_PLAYBACK" => Some(TransportState::Paused),
            "TRANSITIONING" => Some(TransportState::Transitioning),
            _ => None,
        }
    }

    pub fn as_upnp(self) -> &'static str {
        match self {
            TransportState::Stopped => "STOPPED",
            TransportState::Playing => "PLAYING",
            TransportState::Paused => "PAUSED_PLAYBACK",
            TransportState::Transitioning => "TRANSITIONING",
        }
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_upnp())
    }
}

/// What the host last asked the renderer to do.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DesiredState {
    #[default]
    Stopped,
    Playing,
    Paused,
}

impl DesiredState {
    /// True when the observed renderer state contradicts this request.
    /// Transitions in progress never count as a contradiction.
    pub fn contradicts(self, observed: TransportState) -> bool {
        use TransportState as T;
        match (self, observed) {
            (_, T::Transitioning) => false,
            (DesiredState::Playing, T::Stopped | T::Paused) => true,
            (DesiredState::Paused, T::Playing) => true,
            (DesiredState::Stopped, T::Playing | T::Paused) => true,
            _ => false,
        }
    }
}

/// The UPnP services the bridge drives on a renderer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    AvTransport,
    RenderingControl,
    ConnectionManager,
}

impl ServiceKind {
    pub const ALL: [ServiceKind; 3] = [
        ServiceKind::AvTransport,
        ServiceKind::RenderingControl,
        ServiceKind::ConnectionManager,
    ];

    /// Version-less service type prefix, matched case-insensitively.
    pub fn urn_prefix(self) -> &'static str {
        match self {
            ServiceKind::AvTransport => "urn:schemas-upnp-org:service:avtransport:",
            ServiceKind::RenderingControl => "urn:schemas-upnp-org:service:renderingcontrol:",
            ServiceKind::ConnectionManager => "urn:schemas-upnp-org:service:connectionmanager:",
        }
    }

    pub fn from_service_type(service_type: &str) -> Option<Self> {
        let lower = service_type.to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|kind| lower.starts_with(kind.urn_prefix()))
    }

    fn index(self) -> usize {
        match self {
            ServiceKind::AvTransport => 0,
            ServiceKind::RenderingControl => 1,
            ServiceKind::ConnectionManager => 2,
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ServiceKind::AvTransport => "AVTransport",
            ServiceKind::RenderingControl => "RenderingControl",
            ServiceKind::ConnectionManager => "ConnectionManager",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceEndpoint {
    pub service_type: String,
    pub control_url: String,
    pub event_url: String,
}

/// Control endpoints of a renderer, one slot per `ServiceKind`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServiceSet {
    slots: [Option<ServiceEndpoint>; 3],
}

impl ServiceSet {
    pub fn insert(&mut self, kind: ServiceKind, endpoint: ServiceEndpoint) {
        self.slots[kind.index()] = Some(endpoint);
    }

    pub fn get(&self, kind: ServiceKind) -> Option<&ServiceEndpoint> {
        self.slots[kind.index()].as_ref()
    }

    pub fn has(&self, kind: ServiceKind) -> bool {
        self.get(kind).is_some()
    }
}

/// What the bridge keeps from a renderer description document.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RendererDescription {
    pub udn: String,
    pub friendly_name: String,
    pub manufacturer: String,
    pub model_name: String,
    /// Description document URL (SSDP LOCATION).
    pub location: String,
    pub services: ServiceSet,
}

impl RendererDescription {
    /// Host part of the description URL, used as the renderer address.
    pub fn address(&self) -> Option<String> {
        let (_, rest) = self.location.split_once("://")?;
        let authority = rest.split('/').next()?;
        let host = match authority.rsplit_once(':') {
            Some((host, port)) if port.bytes().all(|b| b.is_ascii_digit()) => host,
            _ => authority,
        };
        (!host.is_empty()).then(|| host.to_string())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TrackMetadata {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub genre: Option<String>,
    pub artwork_url: Option<String>,
    pub duration_ms: Option<u64>,
    pub file_size: Option<u64>,
}

impl TrackMetadata {
    /// Sent in place of real metadata when a renderer is configured not to
    /// receive it.
    pub fn placeholder(stream_length: Option<u64>) -> Self {
        Self {
            title: Some("Streaming from PMOBridge".to_string()),
            file_size: stream_length,
            ..Self::default()
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Codec {
    Mp3,
    Flac,
    Pcm,
    Wav,
    Aac,
    Ogg,
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Codec::Mp3 => "mp3",
            Codec::Flac => "flac",
            Codec::Pcm => "pcm",
            Codec::Wav => "wav",
            Codec::Aac => "aac",
            Codec::Ogg => "ogg",
        })
    }
}

/// Stream format the host wants to send (SET_FORMAT payload).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FormatRequest {
    /// Acceptable codecs, in the host's order of preference.
    pub codecs: Vec<Codec>,
    pub channels: u8,
    pub sample_size: u8,
    pub sample_rate: u32,
}

/// SET_URI / SET_NEXT_URI payload.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UriRequest {
    /// Direct server address; when `port` is 0 the bridge's own media
    /// server serves `resource`.
    pub host: String,
    pub port: u16,
    pub resource: String,
    /// Explicit protocol info; falls back to the SET_FORMAT result.
    pub protocol_info: Option<String>,
    pub metadata: TrackMetadata,
}

/// Commands the host server sends to one of its players.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HostCommand {
    OnOff(bool),
    SetFormat(FormatRequest),
    SetUri(UriRequest),
    SetNextUri(UriRequest),
    Play,
    Unpause,
    Pause,
    Stop,
    Seek { position_ms: u64 },
    /// Linear host volume, mapped through the device volume curve.
    Volume(u32),
}

impl HostCommand {
    pub fn name(&self) -> &'static str {
        match self {
            HostCommand::OnOff(_) => "ON_OFF",
            HostCommand::SetFormat(_) => "SET_FORMAT",
            HostCommand::SetUri(_) => "SET_URI",
            HostCommand::SetNextUri(_) => "SET_NEXT_URI",
            HostCommand::Play => "PLAY",
            HostCommand::Unpause => "UNPAUSE",
            HostCommand::Pause => "PAUSE",
            HostCommand::Stop => "STOP",
            HostCommand::Seek { .. } => "SEEK",
            HostCommand::Volume(_) => "VOLUME",
        }
    }
}

/// Playback lifecycle notifications sent back to the host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HostEvent {
    /// `unsolicited` is set when the renderer started on its own and the
    /// host has to resynchronise.
    Play { unsolicited: bool },
    Pause { unsolicited: bool },
    Stop,
    TrackChange,
    Time { elapsed_ms: u64 },
    OnOff(bool),
}

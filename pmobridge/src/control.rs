//! Boundary with the network control facility.
//!
//! The bridge never talks HTTP/SOAP itself. It hands [`ActionRequest`]s to a
//! [`ControlPoint`] and gets the outcome back later, as an
//! [`ActionCompletion`] pushed through the [`CompletionSink`] the gateway
//! gives out. Discovery answers and transport events travel the same way.

use std::collections::HashMap;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};
use quick_xml::escape::escape;
use tracing::trace;
use xmltree::{Element, XMLNode};

use crate::errors::BridgeError;
use crate::model::{RendererDescription, ServiceEndpoint, ServiceKind, TrackMetadata};
use crate::sequence::SeqNo;
use crate::table::DeviceHandle;
use crate::time_utils::format_hhmmss;

/// Identifies an outbound call; echoed back in its completion.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ActionTag {
    pub device: DeviceHandle,
    pub seq: SeqNo,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ActionRequest {
    SetUri {
        uri: String,
        protocol_info: String,
        metadata: TrackMetadata,
    },
    SetNextUri {
        uri: String,
        protocol_info: String,
        metadata: TrackMetadata,
    },
    Play,
    Pause,
    Stop,
    Seek {
        target_ms: u64,
    },
    GetTransportInfo,
    GetPositionInfo,
    GetMediaInfo,
    SetVolume(u32),
    GetProtocolInfo,
}

impl ActionRequest {
    pub fn service(&self) -> ServiceKind {
        match self {
            ActionRequest::SetVolume(_) => ServiceKind::RenderingControl,
            ActionRequest::GetProtocolInfo => ServiceKind::ConnectionManager,
            _ => ServiceKind::AvTransport,
        }
    }

    pub fn action_name(&self) -> &'static str {
        match self {
            ActionRequest::SetUri { .. } => "SetAVTransportURI",
            ActionRequest::SetNextUri { .. } => "SetNextAVTransportURI",
            ActionRequest::Play => "Play",
            ActionRequest::Pause => "Pause",
            ActionRequest::Stop => "Stop",
            ActionRequest::Seek { .. } => "Seek",
            ActionRequest::GetTransportInfo => "GetTransportInfo",
            ActionRequest::GetPositionInfo => "GetPositionInfo",
            ActionRequest::GetMediaInfo => "GetMediaInfo",
            ActionRequest::SetVolume(_) => "SetVolume",
            ActionRequest::GetProtocolInfo => "GetProtocolInfo",
        }
    }

    /// SOAP arguments of the call, in declaration order.
    pub fn arguments(&self) -> Vec<(&'static str, String)> {
        let instance = ("InstanceID", "0".to_string());
        match self {
            ActionRequest::SetUri {
                uri,
                protocol_info,
                metadata,
            } => vec![
                instance,
                ("CurrentURI", uri.clone()),
                ("CurrentURIMetaData", didl_lite(uri, protocol_info, metadata)),
            ],
            ActionRequest::SetNextUri {
                uri,
                protocol_info,
                metadata,
            } => vec![
                instance,
                ("NextURI", uri.clone()),
                ("NextURIMetaData", didl_lite(uri, protocol_info, metadata)),
            ],
            ActionRequest::Play => vec![instance, ("Speed", "1".to_string())],
            ActionRequest::Seek { target_ms } => vec![
                instance,
                ("Unit", "REL_TIME".to_string()),
                ("Target", format_hhmmss(*target_ms)),
            ],
            ActionRequest::SetVolume(volume) => vec![
                instance,
                ("Channel", "Master".to_string()),
                ("DesiredVolume", volume.to_string()),
            ],
            ActionRequest::GetProtocolInfo => Vec::new(),
            ActionRequest::Pause
            | ActionRequest::Stop
            | ActionRequest::GetTransportInfo
            | ActionRequest::GetPositionInfo
            | ActionRequest::GetMediaInfo => vec![instance],
        }
    }
}

/// Outcome of an outbound call.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ActionCompletion {
    pub tag: Option<ActionTag>,
    /// 0 on success, the UPnP (or transport) error code otherwise.
    pub error_code: i32,
    /// Output arguments of the response, by name.
    pub fields: HashMap<String, String>,
}

impl ActionCompletion {
    pub fn success(tag: ActionTag) -> Self {
        Self {
            tag: Some(tag),
            ..Self::default()
        }
    }

    pub fn failure(tag: ActionTag, error_code: i32) -> Self {
        Self {
            tag: Some(tag),
            error_code,
            fields: HashMap::new(),
        }
    }

    pub fn with_field(mut self, name: &str, value: &str) -> Self {
        self.fields.insert(name.to_string(), value.to_string());
        self
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    pub fn is_success(&self) -> bool {
        self.error_code == 0
    }
}

/// AVTransport LastChange notification, already split into variables.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransportEvent {
    pub sid: String,
    pub transport_state: Option<String>,
    pub current_track_uri: Option<String>,
}

/// Everything the control facility reports back asynchronously.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlEvent {
    ActionComplete(ActionCompletion),
    Transport(TransportEvent),
    SearchResult { location: String },
    SearchTimeout,
}

/// Sending half of the gateway's control event channel.
#[derive(Clone, Debug)]
pub struct CompletionSink {
    tx: Sender<ControlEvent>,
}

impl CompletionSink {
    pub(crate) fn channel() -> (Self, Receiver<ControlEvent>) {
        let (tx, rx) = unbounded::<ControlEvent>();
        (Self { tx }, rx)
    }

    pub fn action_complete(&self, completion: ActionCompletion) {
        self.send(ControlEvent::ActionComplete(completion));
    }

    pub fn transport_event(&self, event: TransportEvent) {
        self.send(ControlEvent::Transport(event));
    }

    pub fn search_result(&self, location: impl Into<String>) {
        self.send(ControlEvent::SearchResult {
            location: location.into(),
        });
    }

    pub fn search_timeout(&self) {
        self.send(ControlEvent::SearchTimeout);
    }

    fn send(&self, event: ControlEvent) {
        if self.tx.send(event).is_err() {
            trace!("Control event dropped, gateway is shut down");
        }
    }
}

/// Asynchronous action invocation on renderer services.
pub trait ControlPoint: Send + Sync {
    /// Sends `request` to `endpoint`. The call must not block on the
    /// renderer's answer: its outcome is reported later through the
    /// completion sink, carrying `tag`. An `Err` means the call could not be
    /// sent at all and no completion will follow.
    fn invoke(
        &self,
        endpoint: &ServiceEndpoint,
        request: &ActionRequest,
        tag: ActionTag,
    ) -> Result<(), BridgeError>;

    /// Subscribes to the service events, returning the subscription id.
    fn subscribe(&self, endpoint: &ServiceEndpoint, timeout: Duration) -> Result<String, BridgeError>;

    fn renew(&self, sid: &str, timeout: Duration) -> Result<(), BridgeError>;

    fn unsubscribe(&self, _sid: &str) {}
}

/// Renderer search on the local network. Answers (description locations)
/// and the end of the search window come back through the completion sink.
pub trait DiscoveryFacility: Send + Sync {
    fn search(&self, timeout: Duration) -> Result<(), BridgeError>;
}

/// Fetches and digests a renderer description document.
pub trait DescriptionProvider: Send + Sync {
    fn describe(&self, location: &str) -> Result<RendererDescription, BridgeError>;
}

/// Builds an [`ActionCompletion`] from a raw SOAP response body.
///
/// A SOAP fault yields its UPnP `errorCode` (or 501 when the fault carries
/// none); a regular response yields the children of `<{action}Response>`.
pub fn parse_action_response(
    tag: ActionTag,
    action: &str,
    body: &str,
) -> Result<ActionCompletion, BridgeError> {
    let root = Element::parse(body.as_bytes())
        .map_err(|e| BridgeError::Description(format!("invalid SOAP response to {action}: {e}")))?;
    let soap_body = find_child_with_suffix(&root, "Body")
        .ok_or_else(|| BridgeError::Description(format!("missing SOAP Body in {action} response")))?;

    if let Some(fault) = find_child_with_suffix(soap_body, "Fault") {
        return Ok(ActionCompletion::failure(tag, parse_upnp_error_code(fault).unwrap_or(501)));
    }

    let response_name = format!("{action}Response");
    let response = find_child_with_suffix(soap_body, &response_name).ok_or_else(|| {
        BridgeError::Description(format!("missing {response_name} element in SOAP body"))
    })?;

    let mut completion = ActionCompletion::success(tag);
    for node in &response.children {
        if let XMLNode::Element(elem) = node {
            let text = elem
                .get_text()
                .map(|t| t.trim().to_string())
                .unwrap_or_default();
            completion.fields.insert(elem.name.clone(), text);
        }
    }
    Ok(completion)
}

fn parse_upnp_error_code(fault: &Element) -> Option<i32> {
    let detail = find_child_with_suffix(fault, "detail")?;
    let upnp_error = find_child_with_suffix(detail, "UPnPError")?;
    let code = find_child_with_suffix(upnp_error, "errorCode")?.get_text()?;
    code.trim().parse::<i32>().ok()
}

fn find_child_with_suffix<'a>(parent: &'a Element, suffix: &str) -> Option<&'a Element> {
    parent.children.iter().find_map(|node| match node {
        XMLNode::Element(elem) if elem.name.ends_with(suffix) => Some(elem),
        _ => None,
    })
}

/// Minimal DIDL-Lite item describing the stream handed to the renderer.
pub fn didl_lite(uri: &str, protocol_info: &str, metadata: &TrackMetadata) -> String {
    let mut item = String::new();
    let mut push = |tag: &str, value: &Option<String>| {
        if let Some(value) = value {
            item.push_str(&format!("<{tag}>{}</{tag}>", escape(value)));
        }
    };
    push("dc:title", &metadata.title);
    push("upnp:artist", &metadata.artist);
    push("upnp:album", &metadata.album);
    push("upnp:genre", &metadata.genre);
    push("upnp:albumArtURI", &metadata.artwork_url);

    let mut res_attrs = format!(r#" protocolInfo="{}""#, escape(protocol_info));
    if let Some(size) = metadata.file_size {
        res_attrs.push_str(&format!(r#" size="{size}""#));
    }
    if let Some(duration) = metadata.duration_ms {
        res_attrs.push_str(&format!(r#" duration="{}""#, format_hhmmss(duration)));
    }

    format!(
        concat!(
            r#"<DIDL-Lite xmlns="urn:schemas-upnp-org:metadata-1-0/DIDL-Lite/" "#,
            r#"xmlns:dc="http://purl.org/dc/elements/1.1/" "#,
            r#"xmlns:upnp="urn:schemas-upnp-org:metadata-1-0/upnp/">"#,
            r#"<item id="1" parentID="0" restricted="1">{}"#,
            r#"<upnp:class>object.item.audioItem.musicTrack</upnp:class>"#,
            r#"<res{}>{}</res></item></DIDL-Lite>"#
        ),
        item,
        res_attrs,
        escape(uri)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag() -> ActionTag {
        ActionTag {
            device: DeviceHandle::new(0, 1),
            seq: SeqNo(4),
        }
    }

    #[test]
    fn parse_transport_info_response() {
        let body = r#"<?xml version="1.0"?>
<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/">
  <s:Body>
    <u:GetTransportInfoResponse xmlns:u="urn:schemas-upnp-org:service:AVTransport:1">
      <CurrentTransportState>PLAYING</CurrentTransportState>
      <CurrentTransportStatus>OK</CurrentTransportStatus>
      <CurrentSpeed>1</CurrentSpeed>
    </u:GetTransportInfoResponse>
  </s:Body>
</s:Envelope>"#;
        let completion = parse_action_response(tag(), "GetTransportInfo", body).unwrap();
        assert!(completion.is_success());
        assert_eq!(completion.tag, Some(tag()));
        assert_eq!(completion.field("CurrentTransportState"), Some("PLAYING"));
        assert_eq!(completion.field("CurrentSpeed"), Some("1"));
    }

    #[test]
    fn parse_fault_response() {
        let body = r#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/">
  <s:Body>
    <s:Fault>
      <faultcode>s:Client</faultcode>
      <faultstring>UPnPError</faultstring>
      <detail>
        <UPnPError xmlns="urn:schemas-upnp-org:control-1-0">
          <errorCode>701</errorCode>
          <errorDescription>Transition not available</errorDescription>
        </UPnPError>
      </detail>
    </s:Fault>
  </s:Body>
</s:Envelope>"#;
        let completion = parse_action_response(tag(), "Play", body).unwrap();
        assert_eq!(completion.error_code, 701);
        assert!(completion.fields.is_empty());
    }

    #[test]
    fn parse_rejects_unrelated_body() {
        let body = r#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/"><s:Body><u:PauseResponse/></s:Body></s:Envelope>"#;
        assert!(parse_action_response(tag(), "Play", body).is_err());
        assert!(parse_action_response(tag(), "Play", "not xml").is_err());
    }

    #[test]
    fn request_routing_and_arguments() {
        assert_eq!(ActionRequest::SetVolume(30).service(), ServiceKind::RenderingControl);
        assert_eq!(ActionRequest::GetProtocolInfo.service(), ServiceKind::ConnectionManager);
        assert_eq!(ActionRequest::Pause.service(), ServiceKind::AvTransport);

        let seek = ActionRequest::Seek { target_ms: 75_000 };
        assert_eq!(seek.action_name(), "Seek");
        assert_eq!(
            seek.arguments(),
            vec![
                ("InstanceID", "0".to_string()),
                ("Unit", "REL_TIME".to_string()),
                ("Target", "00:01:15".to_string()),
            ]
        );
    }

    #[test]
    fn didl_escapes_values() {
        let metadata = TrackMetadata {
            title: Some("Rock & Roll".to_string()),
            file_size: Some(1234),
            ..Default::default()
        };
        let didl = didl_lite("http://h/a?x=1&y=2", "http-get:*:audio/flac:*", &metadata);
        assert!(didl.contains("<dc:title>Rock &amp; Roll</dc:title>"));
        assert!(didl.contains(r#"size="1234""#));
        assert!(didl.contains(">http://h/a?x=1&amp;y=2</res>"));
        assert!(!didl.contains("upnp:artist"));
    }
}

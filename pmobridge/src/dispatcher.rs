//! Host command handling.
//!
//! Each host command runs in one [`Session`]: the device lock is held from
//! the validation to the last outbound call, so state reports and
//! completions cannot slip in between a decision and its effect.

use tracing::{debug, info};

use crate::action_queue::ActionKind;
use crate::config::{MediaServerConfig, VolumeMode};
use crate::control::ActionRequest;
use crate::device::{MediaUri, Session};
use crate::errors::BridgeError;
use crate::model::{DesiredState, FormatRequest, HostCommand, HostEvent, TrackMetadata, UriRequest};

/// Protocol info used when neither the host nor SET_FORMAT provided one.
const FALLBACK_PROTOCOL_INFO: &str = "http-get:*:*:*";

/// Successful outcome of a host command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommandReply {
    Done,
    /// SET_FORMAT result: the protocolInfo the stream will be announced with.
    Format(String),
}

pub fn dispatch(
    s: &mut Session<'_>,
    media_server: &MediaServerConfig,
    command: HostCommand,
) -> Result<CommandReply, BridgeError> {
    let name = s.device.name();

    if let HostCommand::OnOff(on) = command {
        set_power(s, on);
        return Ok(CommandReply::Done);
    }
    if !s.state.on {
        debug!(renderer = name, command = command.name(), "Device off or not controlled by host");
        return Err(BridgeError::DeviceOff(name.to_string()));
    }

    debug!(renderer = name, command = command.name(), "Host command");
    match command {
        HostCommand::OnOff(_) => Ok(CommandReply::Done),
        HostCommand::SetFormat(request) => set_format(s, &request),
        HostCommand::SetUri(request) => set_uri(s, media_server, request),
        HostCommand::SetNextUri(request) => set_next_uri(s, media_server, request),
        HostCommand::Play => play(s, ActionKind::Play),
        HostCommand::Unpause => play(s, ActionKind::Unpause),
        HostCommand::Pause => pause(s),
        HostCommand::Stop => stop(s),
        HostCommand::Seek { position_ms } => {
            s.issue(ActionRequest::Seek {
                target_ms: position_ms,
            })?;
            Ok(CommandReply::Done)
        }
        HostCommand::Volume(volume) => set_volume(s, volume),
    }
}

fn set_power(s: &mut Session<'_>, on: bool) {
    if s.state.on == on {
        return;
    }
    info!(renderer = s.device.name(), on, "Device set on/off");
    s.state.on = on;
    if !on {
        s.state.queue.flush();
        s.state.desired = DesiredState::Stopped;
        s.state.current = None;
        s.state.next = None;
        s.state.paused_at = None;
        s.state.stall_count = 0;
        s.state.mark_stale();
    }
}

fn set_format(s: &mut Session<'_>, request: &FormatRequest) -> Result<CommandReply, BridgeError> {
    info!(
        renderer = s.device.name(),
        codecs = ?request.codecs,
        channels = request.channels,
        sample_size = request.sample_size,
        sample_rate = request.sample_rate,
        "Stream format"
    );
    let protocol_info = s.state.capabilities.negotiate(request)?;
    s.state.protocol_info = Some(protocol_info.clone());
    Ok(CommandReply::Format(protocol_info))
}

/// Host-supplied address when it gives a port, our own media server
/// otherwise.
fn playable_url(media_server: &MediaServerConfig, request: &UriRequest) -> String {
    if request.port != 0 {
        format!(
            "http://{}:{}/{}",
            request.host,
            request.port,
            request.resource.trim_start_matches('/')
        )
    } else {
        media_server.resource_url(&request.resource)
    }
}

fn media_uri(s: &Session<'_>, media_server: &MediaServerConfig, request: UriRequest) -> MediaUri {
    let config = s.device.config();
    let uri = playable_url(media_server, &request);
    let protocol_info = request
        .protocol_info
        .or_else(|| s.state.protocol_info.clone())
        .unwrap_or_else(|| FALLBACK_PROTOCOL_INFO.to_string());
    let metadata = if config.send_metadata {
        let mut metadata = request.metadata;
        if metadata.file_size.is_none() {
            metadata.file_size = config.stream_length;
        }
        metadata
    } else {
        TrackMetadata::placeholder(config.stream_length)
    };
    MediaUri {
        uri,
        protocol_info,
        metadata,
    }
}

fn set_uri(
    s: &mut Session<'_>,
    media_server: &MediaServerConfig,
    request: UriRequest,
) -> Result<CommandReply, BridgeError> {
    // Forget both URIs so a later change of the renderer's URI is not
    // mistaken for a track change.
    s.state.current = None;
    s.state.next = None;
    s.state.paused_at = None;
    s.state.mark_stale();

    let media = media_uri(s, media_server, request);
    s.issue(ActionRequest::SetUri {
        uri: media.uri.clone(),
        protocol_info: media.protocol_info.clone(),
        metadata: media.metadata.clone(),
    })?;
    info!(renderer = s.device.name(), uri = %media.uri, "Current URI set");
    s.state.elapsed_ms = 0;
    s.state.current = Some(media);
    Ok(CommandReply::Done)
}

fn set_next_uri(
    s: &mut Session<'_>,
    media_server: &MediaServerConfig,
    request: UriRequest,
) -> Result<CommandReply, BridgeError> {
    let media = media_uri(s, media_server, request);
    if s.device.config().accept_next_uri {
        s.issue(ActionRequest::SetNextUri {
            uri: media.uri.clone(),
            protocol_info: media.protocol_info.clone(),
            metadata: media.metadata.clone(),
        })?;
    }
    info!(renderer = s.device.name(), uri = %media.uri, "Next URI set");
    s.state.next = Some(media);
    Ok(CommandReply::Done)
}

fn play(s: &mut Session<'_>, kind: ActionKind) -> Result<CommandReply, BridgeError> {
    if s.state.current.is_none() {
        return Err(BridgeError::NoCurrentUri(s.device.name().to_string()));
    }
    let config = s.device.config();

    if kind == ActionKind::Unpause && config.seek_after_pause {
        if let Some(paused_at) = s.state.paused_at.take() {
            s.notify(HostEvent::Time {
                elapsed_ms: paused_at,
            });
        }
    }

    let handle = s.device.handle();
    let wait_for = s.state.seq.last_issued();
    s.state.queue.enqueue(handle, kind, wait_for, true);
    s.state.desired = DesiredState::Playing;

    if config.volume_mode == VolumeMode::OnPlay {
        if let Some(volume) = s.state.volume {
            s.issue_logged(ActionRequest::SetVolume(volume));
        }
    }
    Ok(CommandReply::Done)
}

fn pause(s: &mut Session<'_>) -> Result<CommandReply, BridgeError> {
    let handle = s.device.handle();
    let wait_for = s.state.seq.last_issued();
    s.state.queue.enqueue(handle, ActionKind::Pause, wait_for, true);
    s.state.desired = DesiredState::Paused;
    if s.device.config().seek_after_pause {
        s.state.paused_at = Some(s.state.elapsed_ms);
    }
    Ok(CommandReply::Done)
}

/// Never queued: it cancels whatever is pending.
fn stop(s: &mut Session<'_>) -> Result<CommandReply, BridgeError> {
    let dropped = s.state.queue.flush();
    if dropped > 0 {
        debug!(renderer = s.device.name(), dropped, "Flushed pending actions");
    }
    s.state.current = None;
    s.state.next = None;
    s.state.paused_at = None;
    s.state.desired = DesiredState::Stopped;
    s.state.mark_stale();
    s.issue(ActionRequest::Stop)?;
    Ok(CommandReply::Done)
}

fn set_volume(s: &mut Session<'_>, volume: u32) -> Result<CommandReply, BridgeError> {
    let config = s.device.config();
    if config.volume_mode == VolumeMode::Ignore {
        return Ok(CommandReply::Done);
    }
    let mapped = s.device.curve().map(volume);
    s.state.volume = Some(mapped);
    debug!(renderer = s.device.name(), volume, mapped, "Volume");

    if config.volume_mode == VolumeMode::Immediate || s.state.desired == DesiredState::Playing {
        s.issue(ActionRequest::SetVolume(mapped))?;
    }
    Ok(CommandReply::Done)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::ProtocolCapabilities;
    use crate::config::DeviceConfig;
    use crate::device::tests::{RecordingControl, device, device_with};
    use crate::model::Codec;
    use crate::sequence::SeqNo;

    fn server() -> MediaServerConfig {
        MediaServerConfig {
            host: "192.168.1.2".to_string(),
            port: 8090,
            virtual_dir: "pmobridge".to_string(),
        }
    }

    fn uri(resource: &str) -> UriRequest {
        UriRequest {
            resource: resource.to_string(),
            ..UriRequest::default()
        }
    }

    fn run(
        device: &crate::device::Device,
        control: &RecordingControl,
        command: HostCommand,
    ) -> Result<CommandReply, BridgeError> {
        let (result, notifications) = device.session(control, |s| dispatch(s, &server(), command));
        assert!(notifications.is_empty());
        result
    }

    #[test]
    fn commands_rejected_while_off() {
        let device = device();
        let control = RecordingControl::default();
        assert!(matches!(
            run(&device, &control, HostCommand::Play),
            Err(BridgeError::DeviceOff(_))
        ));
        assert_eq!(run(&device, &control, HostCommand::OnOff(true)), Ok(CommandReply::Done));
        assert!(device.status().on);
    }

    #[test]
    fn play_requires_current_uri() {
        let device = device();
        let control = RecordingControl::default();
        run(&device, &control, HostCommand::OnOff(true)).unwrap();
        assert!(matches!(
            run(&device, &control, HostCommand::Play),
            Err(BridgeError::NoCurrentUri(_))
        ));
    }

    #[test]
    fn set_uri_then_play_queues_ordered_play() {
        let device = device();
        let control = RecordingControl::default();
        run(&device, &control, HostCommand::OnOff(true)).unwrap();
        run(&device, &control, HostCommand::SetUri(uri("track-1.flac"))).unwrap();
        run(&device, &control, HostCommand::Play).unwrap();

        assert_eq!(control.actions(), ["SetAVTransportURI"]);
        let set_uri_seq = control.last_tag().seq;
        let state = device.lock();
        assert_eq!(
            state.current.as_ref().unwrap().uri,
            "http://192.168.1.2:8090/pmobridge/track-1.flac"
        );
        let head = state.queue.peek_head().unwrap();
        assert!(head.ordered);
        assert_eq!(head.wait_for, set_uri_seq);
        assert_eq!(state.desired, DesiredState::Playing);
    }

    #[test]
    fn direct_url_when_host_gives_a_port() {
        let request = UriRequest {
            host: "10.1.1.1".to_string(),
            port: 9000,
            resource: "/stream.mp3?player=aa".to_string(),
            ..UriRequest::default()
        };
        assert_eq!(
            playable_url(&server(), &request),
            "http://10.1.1.1:9000/stream.mp3?player=aa"
        );
    }

    #[test]
    fn stop_is_immediate_and_flushes() {
        let device = device();
        let control = RecordingControl::default();
        run(&device, &control, HostCommand::OnOff(true)).unwrap();
        run(&device, &control, HostCommand::SetUri(uri("a"))).unwrap();
        run(&device, &control, HostCommand::SetNextUri(uri("b"))).unwrap();
        run(&device, &control, HostCommand::Play).unwrap();
        run(&device, &control, HostCommand::Pause).unwrap();
        run(&device, &control, HostCommand::Stop).unwrap();

        assert_eq!(control.actions(), ["SetAVTransportURI", "Stop"]);
        let status = device.status();
        assert_eq!(status.queued, 0);
        assert!(status.current_uri.is_none());
        assert!(status.next_uri.is_none());
        assert_eq!(status.desired, DesiredState::Stopped);
    }

    #[test]
    fn next_uri_sent_only_to_gapless_renderers() {
        let control = RecordingControl::default();
        let plain = device();
        run(&plain, &control, HostCommand::OnOff(true)).unwrap();
        run(&plain, &control, HostCommand::SetNextUri(uri("b"))).unwrap();
        assert!(control.actions().is_empty());
        assert!(plain.status().next_uri.is_some());

        let gapless = device_with(DeviceConfig {
            accept_next_uri: true,
            ..DeviceConfig::default()
        });
        run(&gapless, &control, HostCommand::OnOff(true)).unwrap();
        run(&gapless, &control, HostCommand::SetNextUri(uri("b"))).unwrap();
        assert_eq!(control.actions(), ["SetNextAVTransportURI"]);
    }

    #[test]
    fn metadata_placeholder_when_disabled() {
        let device = device_with(DeviceConfig {
            send_metadata: false,
            stream_length: Some(3_000_000),
            ..DeviceConfig::default()
        });
        let control = RecordingControl::default();
        run(&device, &control, HostCommand::OnOff(true)).unwrap();
        let mut request = uri("a");
        request.metadata.title = Some("Secret".to_string());
        run(&device, &control, HostCommand::SetUri(request)).unwrap();

        let calls = control.calls.lock().unwrap();
        let ActionRequest::SetUri { metadata, .. } = &calls[0].0 else {
            panic!("expected SetUri");
        };
        assert_eq!(metadata, &TrackMetadata::placeholder(Some(3_000_000)));
    }

    #[test]
    fn set_format_negotiates_against_sink() {
        let device = device();
        let control = RecordingControl::default();
        run(&device, &control, HostCommand::OnOff(true)).unwrap();
        let request = FormatRequest {
            codecs: vec![Codec::Flac],
            channels: 2,
            sample_size: 16,
            sample_rate: 44100,
        };

        assert!(matches!(
            run(&device, &control, HostCommand::SetFormat(request.clone())),
            Err(BridgeError::NoMatchingFormat(_))
        ));

        device.lock().capabilities = ProtocolCapabilities::parse_sink("http-get:*:audio/flac:*");
        assert_eq!(
            run(&device, &control, HostCommand::SetFormat(request)),
            Ok(CommandReply::Format("http-get:*:audio/flac:*".to_string()))
        );

        run(&device, &control, HostCommand::SetUri(uri("a"))).unwrap();
        let calls = control.calls.lock().unwrap();
        let ActionRequest::SetUri { protocol_info, .. } = &calls[0].0 else {
            panic!("expected SetUri");
        };
        assert_eq!(protocol_info, "http-get:*:audio/flac:*");
    }

    #[test]
    fn volume_modes() {
        let control = RecordingControl::default();
        let ignoring = device_with(DeviceConfig {
            volume_mode: VolumeMode::Ignore,
            ..DeviceConfig::default()
        });
        run(&ignoring, &control, HostCommand::OnOff(true)).unwrap();
        run(&ignoring, &control, HostCommand::Volume(65536)).unwrap();
        assert!(control.actions().is_empty());
        assert_eq!(ignoring.status().volume, None);

        let immediate = device_with(DeviceConfig {
            volume_mode: VolumeMode::Immediate,
            ..DeviceConfig::default()
        });
        run(&immediate, &control, HostCommand::OnOff(true)).unwrap();
        run(&immediate, &control, HostCommand::Volume(65536)).unwrap();
        assert_eq!(control.actions(), ["SetVolume"]);
        assert_eq!(immediate.status().volume, Some(100));

        control.clear();
        let on_play = device();
        run(&on_play, &control, HostCommand::OnOff(true)).unwrap();
        run(&on_play, &control, HostCommand::Volume(3800)).unwrap();
        assert!(control.actions().is_empty());
        run(&on_play, &control, HostCommand::SetUri(uri("a"))).unwrap();
        run(&on_play, &control, HostCommand::Play).unwrap();
        assert_eq!(control.actions(), ["SetAVTransportURI", "SetVolume"]);
        let calls = control.calls.lock().unwrap();
        assert_eq!(calls[1].0, ActionRequest::SetVolume(50));
    }

    #[test]
    fn unpause_reasserts_pause_position() {
        let device = device_with(DeviceConfig {
            seek_after_pause: true,
            ..DeviceConfig::default()
        });
        let control = RecordingControl::default();
        run(&device, &control, HostCommand::OnOff(true)).unwrap();
        run(&device, &control, HostCommand::SetUri(uri("a"))).unwrap();
        device.lock().elapsed_ms = 42_000;
        run(&device, &control, HostCommand::Pause).unwrap();

        let (result, notifications) =
            device.session(&control, |s| dispatch(s, &server(), HostCommand::Unpause));
        result.unwrap();
        assert_eq!(notifications.events(), [HostEvent::Time { elapsed_ms: 42_000 }]);
        assert_eq!(device.lock().queue.len(), 2);
    }

    #[test]
    fn seek_is_sent_right_away() {
        let device = device();
        let control = RecordingControl::default();
        run(&device, &control, HostCommand::OnOff(true)).unwrap();
        run(&device, &control, HostCommand::Seek { position_ms: 90_000 }).unwrap();
        let calls = control.calls.lock().unwrap();
        assert_eq!(calls[0].0, ActionRequest::Seek { target_ms: 90_000 });
        assert_eq!(calls[0].1.seq, SeqNo(1));
    }
}

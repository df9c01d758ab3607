//! Renderer transport state machine.
//!
//! Two inputs drive a device: transport state reports (polled
//! `GetTransportInfo` answers or AVTransport events) and action
//! completions. Both run inside a [`Session`], so for a given device they
//! are totally ordered with host commands.

use tracing::{debug, info, trace, warn};

use crate::action_queue::{ActionKind, QueuedAction};
use crate::capabilities::ProtocolCapabilities;
use crate::config::{ProcessMode, VolumeMode};
use crate::control::{ActionCompletion, ActionRequest};
use crate::device::Session;
use crate::model::{DesiredState, HostEvent, TransportState};
use crate::time_utils::parse_upnp_time;

/// Applies a transport state reported by the renderer.
pub fn on_transport_state(s: &mut Session<'_>, observed: TransportState) {
    let name = s.device.name();
    let previous = s.state.transport;

    if observed == TransportState::Transitioning {
        if previous != TransportState::Transitioning {
            info!(renderer = name, "upnp transition");
        }
        s.state.transport = TransportState::Transitioning;
        return;
    }

    // Only the entry at the head when the report arrived may be issued
    // afterwards; one released here is not replaced by the next in line.
    let head = s.state.queue.peek_head().cloned();
    let mut head_consumed = false;

    match observed {
        TransportState::Stopped => {
            if previous != TransportState::Stopped {
                info!(renderer = name, "upnp stop");
                on_stopped(s);
                s.state.transport = TransportState::Stopped;
            }
        }
        TransportState::Playing => {
            if previous != TransportState::Playing {
                info!(renderer = name, "upnp playing");
                on_playing(s, head.as_ref());
                s.state.transport = TransportState::Playing;
            }
            if s.state.queue.release_head_if(ActionKind::starts_playback).is_some() {
                trace!(renderer = name, "Pending play satisfied by renderer");
                head_consumed = true;
            }
        }
        TransportState::Paused => {
            if previous != TransportState::Paused {
                info!(renderer = name, "upnp pause");
                let desired = s.state.desired;
                let resuming = head.as_ref().is_some_and(|h| h.kind.starts_playback());
                if desired != DesiredState::Paused && !resuming {
                    s.notify(HostEvent::Pause { unsolicited: true });
                }
                if s.state.queue.release_head_if(|k| k == ActionKind::Pause).is_some() {
                    head_consumed = true;
                }
                s.state.transport = TransportState::Paused;
            }
        }
        TransportState::Transitioning => {}
    }

    if head.is_some() && !head_consumed {
        let last_acked = s.state.last_acked;
        if let Some(entry) = s.state.queue.dequeue_if_ready(last_acked) {
            issue_queued(s, entry);
        }
    }
}

fn on_stopped(s: &mut Session<'_>) {
    let gapless_needed = s.state.next.is_some() && !s.device.config().accept_next_uri;
    if !gapless_needed {
        s.notify(HostEvent::Stop);
        return;
    }

    let Some(next) = s.state.next.take() else {
        return;
    };
    info!(renderer = s.device.name(), uri = %next.uri, "no gapless, promoting next uri");

    let request = ActionRequest::SetUri {
        uri: next.uri.clone(),
        protocol_info: next.protocol_info.clone(),
        metadata: next.metadata.clone(),
    };
    s.state.mark_stale();

    // PLAY must not reach the renderer before it has taken the new URI,
    // otherwise the old one restarts for a moment.
    match s.issue_logged(request) {
        Some(wait_for) => {
            s.state.current = Some(next);
            s.state.elapsed_ms = 0;
            let handle = s.device.handle();
            s.state.queue.enqueue(handle, ActionKind::Play, wait_for, true);
            s.notify(HostEvent::TrackChange);
        }
        None => {
            warn!(renderer = s.device.name(), "Next URI not sent, renderer stays stopped");
            s.state.current = None;
            s.state.paused_at = None;
            s.state.desired = DesiredState::Stopped;
            s.notify(HostEvent::Stop);
        }
    }
}

fn on_playing(s: &mut Session<'_>, head: Option<&QueuedAction>) {
    let desired = s.state.desired;
    let head_kind = head.map(|h| h.kind);
    let solicited = head_kind.is_some_and(ActionKind::starts_playback)
        || desired == DesiredState::Playing
        || (desired == DesiredState::Paused && head_kind == Some(ActionKind::Pause));

    if !solicited {
        warn!(
            renderer = s.device.name(),
            desired = ?desired,
            "Renderer started playing on its own"
        );
    }
    s.notify(HostEvent::Play {
        unsolicited: !solicited,
    });

    let config = s.device.config();
    if config.force_volume
        && config.volume_mode != VolumeMode::Ignore
        && config.process_mode != ProcessMode::Delegated
    {
        if let Some(volume) = s.state.volume {
            s.issue_logged(ActionRequest::SetVolume(volume));
        }
    }
}

fn issue_queued(s: &mut Session<'_>, entry: QueuedAction) {
    let request = match entry.kind {
        ActionKind::Play | ActionKind::Unpause => ActionRequest::Play,
        ActionKind::Pause => ActionRequest::Pause,
        ActionKind::Stop => ActionRequest::Stop,
    };
    debug!(
        renderer = s.device.name(),
        kind = ?entry.kind,
        wait_for = %entry.wait_for,
        "Releasing queued action"
    );
    s.issue_logged(request);
}

/// Applies the outcome of an outbound call.
pub fn on_action_complete(s: &mut Session<'_>, completion: &ActionCompletion) {
    let name = s.device.name();
    if let Some(tag) = completion.tag {
        s.state.acknowledge(tag.seq);
    }

    // Answers to calls issued before the state moved on describe the
    // previous track.
    let stale = completion.tag.is_some_and(|tag| s.state.is_stale(tag.seq));
    if stale && (completion.field("RelTime").is_some() || completion.field("CurrentURI").is_some()) {
        trace!(renderer = name, seq = ?completion.tag.map(|t| t.seq), "Ignoring stale position");
    }

    if let Some(rel_time) = completion.field("RelTime").filter(|_| !stale) {
        match parse_upnp_time(rel_time) {
            Ok(Some(elapsed_ms)) => {
                s.state.elapsed_ms = elapsed_ms;
                // Positions reported while not playing are stale.
                if s.state.transport == TransportState::Playing {
                    s.notify(HostEvent::Time { elapsed_ms });
                }
            }
            Ok(None) => {}
            Err(err) => debug!(renderer = name, error = %err, "Ignoring position"),
        }
    }

    if let Some(raw) = completion.field("CurrentTransportState") {
        match TransportState::from_upnp(raw) {
            Some(state) => on_transport_state(s, state),
            None => trace!(renderer = name, state = raw, "Untracked transport state"),
        }
    }

    if let Some(uri) = completion.field("CurrentURI").filter(|_| !stale) {
        on_track_uri(s, uri);
    }

    if let Some(sink) = completion.field("Sink") {
        let capabilities = ProtocolCapabilities::parse_sink(sink);
        debug!(
            renderer = name,
            formats = capabilities.entries().len(),
            "Renderer protocol info"
        );
        s.state.capabilities = capabilities;
    }

    if completion.is_success() {
        s.record_action_success();
    } else {
        warn!(
            renderer = name,
            code = completion.error_code,
            seq = ?completion.tag.map(|t| t.seq),
            "Error in action completion"
        );
        s.record_action_error();
    }
}

/// Detects a renderer moving on to the staged next URI by itself.
///
/// A differing URI only means a track change when a next URI was staged;
/// otherwise it is a desync between host and renderer and is ignored.
pub fn on_track_uri(s: &mut Session<'_>, reported: &str) {
    let reported = reported.trim();
    if reported.is_empty() {
        return;
    }
    let Some(current) = s.state.current.as_ref() else {
        return;
    };
    if current.uri == reported
        || s.state.transport != TransportState::Playing
        || s.state.next.is_none()
    {
        return;
    }

    info!(
        renderer = s.device.name(),
        from = %current.uri,
        to = reported,
        "Detected URI change"
    );
    if let Some(mut next) = s.state.next.take() {
        next.uri = reported.to_string();
        s.state.current = Some(next);
    }
    s.state.elapsed_ms = 0;
    s.notify(HostEvent::TrackChange);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::control::ActionTag;
    use crate::device::MediaUri;
    use crate::device::tests::{RecordingControl, device, device_with};
    use crate::model::TrackMetadata;
    use crate::sequence::SeqNo;

    fn media(uri: &str) -> MediaUri {
        MediaUri {
            uri: uri.to_string(),
            protocol_info: "http-get:*:audio/flac:*".to_string(),
            metadata: TrackMetadata::default(),
        }
    }

    #[test]
    fn transitioning_is_quiet() {
        let device = device();
        let control = RecordingControl::default();
        let (_, events) = device.session(&control, |s| {
            on_transport_state(s, TransportState::Transitioning);
        });
        assert!(events.is_empty());
        assert_eq!(device.status().transport, TransportState::Transitioning);
    }

    #[test]
    fn plain_stop_is_reported_once() {
        let device = device();
        let control = RecordingControl::default();
        device.lock().transport = TransportState::Playing;

        let (_, first) = device.session(&control, |s| on_transport_state(s, TransportState::Stopped));
        let (_, second) = device.session(&control, |s| on_transport_state(s, TransportState::Stopped));
        assert_eq!(first.events(), [HostEvent::Stop]);
        assert!(second.is_empty());
    }

    #[test]
    fn stop_with_staged_next_synthesizes_gapless() {
        let device = device();
        let control = RecordingControl::default();
        {
            let mut state = device.lock();
            state.transport = TransportState::Playing;
            state.desired = DesiredState::Playing;
            state.current = Some(media("http://h/1"));
            state.next = Some(media("http://h/2"));
        }

        let (_, events) = device.session(&control, |s| on_transport_state(s, TransportState::Stopped));

        assert_eq!(events.events(), [HostEvent::TrackChange]);
        assert_eq!(control.actions(), ["SetAVTransportURI"]);
        let set_uri_seq = control.last_tag().seq;

        let state = device.lock();
        assert_eq!(state.transport, TransportState::Stopped);
        assert_eq!(state.current.as_ref().unwrap().uri, "http://h/2");
        assert!(state.next.is_none());
        let head = state.queue.peek_head().unwrap();
        assert_eq!(head.kind, ActionKind::Play);
        assert!(head.ordered);
        assert_eq!(head.wait_for, set_uri_seq);
        assert_eq!(state.queue.len(), 1);
    }

    #[test]
    fn unsent_next_uri_reports_stop() {
        let device = device();
        let control = RecordingControl {
            refuse: true,
            ..Default::default()
        };
        {
            let mut state = device.lock();
            state.transport = TransportState::Playing;
            state.desired = DesiredState::Playing;
            state.current = Some(media("http://h/1"));
            state.next = Some(media("http://h/2"));
        }

        let (_, events) = device.session(&control, |s| on_transport_state(s, TransportState::Stopped));

        assert_eq!(events.events(), [HostEvent::Stop]);
        let status = device.status();
        assert_eq!(status.transport, TransportState::Stopped);
        assert_eq!(status.desired, DesiredState::Stopped);
        assert!(status.current_uri.is_none());
        assert!(status.next_uri.is_none());
        assert_eq!(status.queued, 0);
        assert_eq!(status.action_errors, 1);
    }

    #[test]
    fn stale_position_is_ignored() {
        let device = device();
        let control = RecordingControl::default();
        device.lock().transport = TransportState::Playing;

        let (old, _) = device.session(&control, |s| {
            let old = s.issue(ActionRequest::GetPositionInfo).unwrap();
            s.state.mark_stale();
            old
        });
        let stale = ActionCompletion::success(ActionTag {
            device: device.handle(),
            seq: old,
        })
        .with_field("RelTime", "0:00:42");
        let (_, events) = device.session(&control, |s| on_action_complete(s, &stale));
        assert!(events.is_empty());
        assert_eq!(device.lock().elapsed_ms, 0);

        let (fresh, _) = device.session(&control, |s| s.issue(ActionRequest::GetPositionInfo).unwrap());
        let fresh = ActionCompletion::success(ActionTag {
            device: device.handle(),
            seq: fresh,
        })
        .with_field("RelTime", "0:00:03");
        let (_, events) = device.session(&control, |s| on_action_complete(s, &fresh));
        assert_eq!(events.events(), [HostEvent::Time { elapsed_ms: 3_000 }]);
    }

    #[test]
    fn native_gapless_renderer_just_stops() {
        let device = device_with(DeviceConfig {
            accept_next_uri: true,
            ..DeviceConfig::default()
        });
        let control = RecordingControl::default();
        {
            let mut state = device.lock();
            state.transport = TransportState::Playing;
            state.next = Some(media("http://h/2"));
        }
        let (_, events) = device.session(&control, |s| on_transport_state(s, TransportState::Stopped));
        assert_eq!(events.events(), [HostEvent::Stop]);
        assert!(control.actions().is_empty());
    }

    #[test]
    fn unsolicited_play_is_flagged() {
        let device = device();
        let control = RecordingControl::default();
        let (_, events) = device.session(&control, |s| on_transport_state(s, TransportState::Playing));
        assert_eq!(events.events(), [HostEvent::Play { unsolicited: true }]);
        assert_eq!(device.status().transport, TransportState::Playing);
    }

    #[test]
    fn solicited_play_releases_queue_entry() {
        let device = device();
        let control = RecordingControl::default();
        {
            let mut state = device.lock();
            state.desired = DesiredState::Playing;
            let handle = device.handle();
            state.queue.enqueue(handle, ActionKind::Play, SeqNo(0), true);
        }
        let (_, events) = device.session(&control, |s| on_transport_state(s, TransportState::Playing));
        assert_eq!(events.events(), [HostEvent::Play { unsolicited: false }]);
        assert_eq!(device.status().queued, 0);
        assert!(control.actions().is_empty());
    }

    #[test]
    fn unsolicited_pause_is_flagged_but_requested_one_is_not() {
        let device = device();
        let control = RecordingControl::default();
        {
            let mut state = device.lock();
            state.transport = TransportState::Playing;
            state.desired = DesiredState::Playing;
        }
        let (_, events) = device.session(&control, |s| on_transport_state(s, TransportState::Paused));
        assert_eq!(events.events(), [HostEvent::Pause { unsolicited: true }]);

        {
            let mut state = device.lock();
            state.transport = TransportState::Playing;
            state.desired = DesiredState::Paused;
        }
        let (_, events) = device.session(&control, |s| on_transport_state(s, TransportState::Paused));
        assert!(events.is_empty());
    }

    #[test]
    fn ready_head_is_issued_after_state_report() {
        let device = device();
        let control = RecordingControl::default();
        {
            let mut state = device.lock();
            state.desired = DesiredState::Playing;
            state.last_acked = SeqNo(3);
            let handle = device.handle();
            state.queue.enqueue(handle, ActionKind::Play, SeqNo(3), true);
        }
        let (_, events) = device.session(&control, |s| on_transport_state(s, TransportState::Stopped));
        assert!(events.is_empty());
        assert_eq!(control.actions(), ["Play"]);
        assert_eq!(device.status().queued, 0);
    }

    #[test]
    fn blocked_head_waits_for_ack() {
        let device = device();
        let control = RecordingControl::default();
        {
            let mut state = device.lock();
            let handle = device.handle();
            state.queue.enqueue(handle, ActionKind::Pause, SeqNo(8), true);
        }
        let (_, _) = device.session(&control, |s| on_transport_state(s, TransportState::Stopped));
        assert!(control.actions().is_empty());
        assert_eq!(device.status().queued, 1);
    }

    #[test]
    fn time_only_forwarded_while_playing() {
        let device = device();
        let control = RecordingControl::default();
        let tag = ActionTag {
            device: device.handle(),
            seq: SeqNo(1),
        };
        let completion = ActionCompletion::success(tag).with_field("RelTime", "0:01:02");

        let (_, events) = device.session(&control, |s| on_action_complete(s, &completion));
        assert!(events.is_empty());

        device.lock().transport = TransportState::Playing;
        let (_, events) = device.session(&control, |s| on_action_complete(s, &completion));
        assert_eq!(events.events(), [HostEvent::Time { elapsed_ms: 62_000 }]);
    }

    #[test]
    fn uri_change_needs_a_staged_next() {
        let device = device();
        let control = RecordingControl::default();
        {
            let mut state = device.lock();
            state.transport = TransportState::Playing;
            state.current = Some(media("http://h/1"));
        }
        let (_, events) = device.session(&control, |s| on_track_uri(s, "http://h/other"));
        assert!(events.is_empty());

        device.lock().next = Some(media("http://h/2"));
        let (_, events) = device.session(&control, |s| on_track_uri(s, "http://h/2"));
        assert_eq!(events.events(), [HostEvent::TrackChange]);
        let status = device.status();
        assert_eq!(status.current_uri.as_deref(), Some("http://h/2"));
        assert!(status.next_uri.is_none());
    }

    #[test]
    fn completion_errors_and_success() {
        let device = device();
        let control = RecordingControl::default();
        let tag = ActionTag {
            device: device.handle(),
            seq: SeqNo(2),
        };
        for _ in 0..3 {
            let _ = device.session(&control, |s| on_action_complete(s, &ActionCompletion::failure(tag, 501)));
        }
        assert_eq!(device.status().action_errors, 3);
        assert_eq!(device.status().last_acked, SeqNo(2));

        let _ = device.session(&control, |s| on_action_complete(s, &ActionCompletion::success(tag)));
        assert_eq!(device.status().action_errors, 0);
    }

    #[test]
    fn sink_field_fills_capabilities() {
        let device = device();
        let control = RecordingControl::default();
        let tag = ActionTag {
            device: device.handle(),
            seq: SeqNo(1),
        };
        let completion =
            ActionCompletion::success(tag).with_field("Sink", "http-get:*:audio/flac:*,http-get:*:audio/mpeg:*");
        let _ = device.session(&control, |s| on_action_complete(s, &completion));
        assert_eq!(device.lock().capabilities.entries().len(), 2);
    }

    #[test]
    fn force_volume_on_play() {
        let device = device_with(DeviceConfig {
            force_volume: true,
            ..DeviceConfig::default()
        });
        let control = RecordingControl::default();
        {
            let mut state = device.lock();
            state.desired = DesiredState::Playing;
            state.volume = Some(42);
        }
        let _ = device.session(&control, |s| on_transport_state(s, TransportState::Playing));
        assert_eq!(control.actions(), ["SetVolume"]);
    }
}

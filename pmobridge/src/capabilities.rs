// pmobridge/src/capabilities.rs
//! Renderer sink capabilities and stream format negotiation.
//!
//! The ConnectionManager `Sink` value is a comma separated list of
//! protocolInfo strings `protocol:network:contentFormat:additionalInfo`.
//! Only `http-get` entries matter for a renderer pulling an HTTP stream.

use crate::errors::BridgeError;
use crate::model::{Codec, FormatRequest};

/// One `http-get` entry of a renderer's sink list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProtocolEntry {
    pub mime: String,
    pub additional: String,
}

impl ProtocolEntry {
    pub fn to_protocol_info(&self) -> String {
        format!("http-get:*:{}:{}", self.mime, self.additional)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProtocolCapabilities {
    entries: Vec<ProtocolEntry>,
}

impl ProtocolCapabilities {
    /// Parses a ConnectionManager `Sink` value. Entries that are not
    /// `http-get` or are malformed are skipped.
    pub fn parse_sink(sink: &str) -> Self {
        let entries = sink
            .split(',')
            .filter_map(|raw| {
                let mut fields = raw.trim().splitn(4, ':');
                let protocol = fields.next()?;
                let _network = fields.next()?;
                let mime = fields.next()?.trim();
                let additional = fields.next().unwrap_or("*").trim();
                if !protocol.eq_ignore_ascii_case("http-get") || mime.is_empty() {
                    return None;
                }
                Some(ProtocolEntry {
                    mime: mime.to_string(),
                    additional: additional.to_string(),
                })
            })
            .collect();
        Self { entries }
    }

    pub fn entries(&self) -> &[ProtocolEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Picks the protocolInfo to announce for `request`, trying codecs in the
    /// host's order of preference.
    pub fn negotiate(&self, request: &FormatRequest) -> Result<String, BridgeError> {
        for codec in &request.codecs {
            for mime in codec_mime_types(*codec) {
                let Some(entry) = self.find(mime) else {
                    continue;
                };
                let protocol_info = match codec {
                    Codec::Pcm => format!(
                        "http-get:*:{};rate={};channels={}:{}",
                        mime, request.sample_rate, request.channels, entry.additional
                    ),
                    _ => entry.to_protocol_info(),
                };
                return Ok(protocol_info);
            }
        }

        let wanted: Vec<String> = request.codecs.iter().map(Codec::to_string).collect();
        Err(BridgeError::NoMatchingFormat(format!(
            "[{}]",
            wanted.join(",")
        )))
    }

    fn find(&self, mime: &str) -> Option<&ProtocolEntry> {
        self.entries.iter().find(|entry| {
            let base = entry.mime.split(';').next().unwrap_or_default().trim();
            base.eq_ignore_ascii_case(mime)
        })
    }
}

/// MIME types a renderer may announce for `codec`, most common first.
pub fn codec_mime_types(codec: Codec) -> &'static [&'static str] {
    match codec {
        Codec::Mp3 => &["audio/mpeg", "audio/mp3", "audio/x-mpeg"],
        Codec::Flac => &["audio/flac", "audio/x-flac"],
        Codec::Pcm => &["audio/L16"],
        Codec::Wav => &["audio/wav", "audio/x-wav", "audio/wave"],
        Codec::Aac => &["audio/aac", "audio/x-aac", "audio/mp4", "audio/x-m4a"],
        Codec::Ogg => &["audio/ogg", "application/ogg"],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SINK: &str = "http-get:*:audio/mpeg:DLNA.ORG_PN=MP3,\
        http-get:*:audio/x-flac:*,\
        http-get:*:audio/L16;rate=44100;channels=2:DLNA.ORG_PN=LPCM,\
        rtsp-rtp-udp:*:audio/ogg:*,\
        garbage";

    fn request(codecs: &[Codec]) -> FormatRequest {
        FormatRequest {
            codecs: codecs.to_vec(),
            channels: 2,
            sample_size: 16,
            sample_rate: 48000,
        }
    }

    #[test]
    fn parse_keeps_only_http_get() {
        let caps = ProtocolCapabilities::parse_sink(SINK);
        let mimes: Vec<&str> = caps.entries().iter().map(|e| e.mime.as_str()).collect();
        assert_eq!(mimes, ["audio/mpeg", "audio/x-flac", "audio/L16;rate=44100;channels=2"]);
    }

    #[test]
    fn negotiate_follows_host_preference() {
        let caps = ProtocolCapabilities::parse_sink(SINK);
        assert_eq!(
            caps.negotiate(&request(&[Codec::Flac, Codec::Mp3])).unwrap(),
            "http-get:*:audio/x-flac:*"
        );
        assert_eq!(
            caps.negotiate(&request(&[Codec::Ogg, Codec::Mp3])).unwrap(),
            "http-get:*:audio/mpeg:DLNA.ORG_PN=MP3"
        );
    }

    #[test]
    fn negotiate_pcm_carries_stream_parameters() {
        let caps = ProtocolCapabilities::parse_sink(SINK);
        assert_eq!(
            caps.negotiate(&request(&[Codec::Pcm])).unwrap(),
            "http-get:*:audio/L16;rate=48000;channels=2:DLNA.ORG_PN=LPCM"
        );
    }

    #[test]
    fn no_overlap_is_reported() {
        let caps = ProtocolCapabilities::parse_sink(SINK);
        let err = caps.negotiate(&request(&[Codec::Aac, Codec::Ogg])).unwrap_err();
        assert_eq!(err, BridgeError::NoMatchingFormat("[aac,ogg]".to_string()));

        let empty = ProtocolCapabilities::default();
        assert!(empty.negotiate(&request(&[Codec::Mp3])).is_err());
    }
}

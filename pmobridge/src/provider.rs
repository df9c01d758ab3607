use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use quick_xml::escape::resolve_predefined_entity;
use quick_xml::{Reader, events::Event};
use tracing::debug;
use ureq::Agent;

use crate::control::DescriptionProvider;
use crate::errors::BridgeError;
use crate::model::{RendererDescription, ServiceEndpoint, ServiceKind};

/// Downloads UPnP device descriptions over HTTP.
pub struct HttpDescriptionProvider {
    timeout: Duration,
}

impl HttpDescriptionProvider {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn fetch(&self, location: &str) -> Result<String> {
        let config = Agent::config_builder()
            .timeout_global(Some(self.timeout))
            .build();
        let agent: Agent = config.into();

        let mut response = agent
            .get(location)
            .call()
            .with_context(|| format!("HTTP error fetching description {location}"))?;
        let body = response
            .body_mut()
            .read_to_string()
            .context("Failed to read description body")?;
        Ok(body)
    }
}

impl Default for HttpDescriptionProvider {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl DescriptionProvider for HttpDescriptionProvider {
    fn describe(&self, location: &str) -> Result<RendererDescription, BridgeError> {
        debug!(location, "Fetching renderer description");
        let xml = self
            .fetch(location)
            .map_err(|e| BridgeError::Description(format!("{e:#}")))?;
        parse_description(location, &xml).map_err(|e| BridgeError::Description(format!("{e:#}")))
    }
}

#[derive(Default)]
struct PendingService {
    service_type: Option<String>,
    control_url: Option<String>,
    event_url: Option<String>,
}

/// Extracts identity and service endpoints from a description document.
/// Relative URLs are resolved against `URLBase`, or `location` without it.
pub fn parse_description(location: &str, xml: &str) -> Result<RendererDescription> {
    let mut reader = Reader::from_str(xml);

    let mut description = RendererDescription {
        location: location.to_string(),
        ..RendererDescription::default()
    };
    let mut url_base: Option<String> = None;
    let mut path: Vec<String> = Vec::new();
    let mut text = String::new();
    let mut service: Option<PendingService> = None;
    let mut services: Vec<PendingService> = Vec::new();

    loop {
        match reader.read_event().context("Invalid description XML")? {
            Event::Start(e) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                if name == "service" {
                    service = Some(PendingService::default());
                }
                path.push(name);
                text.clear();
            }
            Event::Text(e) => {
                let decoded = e.decode().context("Invalid text encoding in description")?;
                text.push_str(&decoded);
            }
            Event::CData(e) => {
                text.push_str(&String::from_utf8_lossy(&e.into_inner()));
            }
            Event::GeneralRef(e) => {
                if let Some(ch) = e
                    .resolve_char_ref()
                    .context("Invalid character reference in description")?
                {
                    text.push(ch);
                    continue;
                }
                let entity = e.decode().context("Invalid entity in description")?;
                match resolve_predefined_entity(&entity) {
                    Some(value) => text.push_str(value),
                    None => {
                        debug!(entity = %entity, "Unknown entity kept verbatim");
                        text.push_str(&format!("&{entity};"));
                    }
                }
            }
            Event::End(_) => {
                let Some(name) = path.pop() else {
                    return Err(anyhow!("Unbalanced description XML"));
                };
                let value = text.trim().to_string();
                let parent = path.last().map(String::as_str);

                match (name.as_str(), parent) {
                    ("URLBase", _) if !value.is_empty() => url_base = Some(value),
                    ("service", _) => {
                        if let Some(done) = service.take() {
                            services.push(done);
                        }
                    }
                    ("serviceType", Some("service")) => {
                        if let Some(s) = service.as_mut() {
                            s.service_type = Some(value);
                        }
                    }
                    ("controlURL", Some("service")) => {
                        if let Some(s) = service.as_mut() {
                            s.control_url = Some(value);
                        }
                    }
                    ("eventSubURL", Some("service")) => {
                        if let Some(s) = service.as_mut() {
                            s.event_url = Some(value);
                        }
                    }
                    (field, Some("device")) => {
                        let slot = match field {
                            "UDN" => Some(&mut description.udn),
                            "friendlyName" => Some(&mut description.friendly_name),
                            "manufacturer" => Some(&mut description.manufacturer),
                            "modelName" => Some(&mut description.model_name),
                            _ => None,
                        };
                        // The root device comes first; embedded devices do
                        // not override it.
                        if let Some(slot) = slot.filter(|slot| slot.is_empty()) {
                            *slot = value;
                        }
                    }
                    _ => {}
                }
                text.clear();
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if description.udn.is_empty() {
        return Err(anyhow!("Missing UDN in description at {location}"));
    }

    let base = url_base.as_deref().unwrap_or(location);
    for pending in services {
        let (Some(service_type), Some(control_url)) = (pending.service_type, pending.control_url)
        else {
            continue;
        };
        let Some(kind) = ServiceKind::from_service_type(&service_type) else {
            continue;
        };
        if description.services.has(kind) {
            continue;
        }
        let event_url = pending
            .event_url
            .map(|url| resolve_url(base, &url))
            .unwrap_or_default();
        description.services.insert(
            kind,
            ServiceEndpoint {
                service_type,
                control_url: resolve_url(base, &control_url),
                event_url,
            },
        );
    }

    Ok(description)
}

/// Resolves a description URL against the document base.
pub fn resolve_url(base: &str, url: &str) -> String {
    if url.starts_with("http://") || url.starts_with("https://") {
        return url.to_string();
    }

    if let Some((scheme, rest)) = base.split_once("://") {
        let (authority, base_path) = match rest.find('/') {
            Some(pos) => (&rest[..pos], &rest[pos..]),
            None => (rest, "/"),
        };
        if url.starts_with('/') {
            return format!("{scheme}://{authority}{url}");
        }
        let directory = match base_path.rfind('/') {
            Some(pos) => &base_path[..=pos],
            None => "/",
        };
        return format!("{scheme}://{authority}{directory}{url}");
    }

    url.to_string()
}

//! Device-description fetch and AVTransport endpoint extraction.

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};
use ureq::Agent;
use xmltree::{Element, XMLNode};

/// Service type used when the description does not state one.
pub const AVTRANSPORT_SERVICE_TYPE: &str = "urn:schemas-upnp-org:service:AVTransport:1";

#[derive(Debug, Error)]
pub enum DescriptionError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] Box<ureq::Error>),

    #[error("XML parsing error: {0}")]
    Xml(#[from] xmltree::ParseError),

    #[error("missing required device element: {0}")]
    MissingField(&'static str),
}

/// What the control plane needs from a device description.
#[derive(Debug, Clone)]
pub struct DeviceDescription {
    pub friendly_name: String,
    pub manufacturer: Option<String>,
    pub control_url: String,
    pub service_type: String,
    pub location: String,
    pub hostname: String,
}

/// Fetch and parse the description XML at `location`.
pub fn fetch_device_description(
    location: &str,
    timeout: Duration,
) -> Result<DeviceDescription, DescriptionError> {
    debug!("Fetching device description at {}", location);

    let config = Agent::config_builder()
        .timeout_global(Some(timeout))
        .build();
    let agent: Agent = config.into();

    let mut response = agent.get(location).call().map_err(Box::new)?;
    let body = response
        .body_mut()
        .read_to_string()
        .map_err(Box::new)?;

    parse_device_description(&body, location)
}

/// Parse a device description document.
///
/// Default-namespace declarations are stripped before parsing: renderer
/// firmwares disagree on namespaces and the element names are unambiguous
/// without them.
pub fn parse_device_description(
    xml: &str,
    location: &str,
) -> Result<DeviceDescription, DescriptionError> {
    let cleaned = strip_default_namespaces(xml);
    let root = Element::parse(cleaned.as_bytes())?;

    let friendly_name = find_descendant_text(&root, "friendlyName")
        .ok_or(DescriptionError::MissingField("friendlyName"))?;
    let manufacturer = find_descendant_text(&root, "manufacturer");

    let (service_type, control_url) = match find_avtransport_endpoint(&root) {
        Some((service_type, raw_url)) => {
            (service_type, resolve_control_url(location, &raw_url))
        }
        None => {
            // Renderers that omit the AVTransport entry from their
            // serviceList almost always still answer on the
            // conventional endpoint.
            let base = host_base(location).unwrap_or_else(|| location.to_string());
            let synthesized = format!("{}/AVTransport/Control", base);
            warn!(
                "No AVTransport controlURL in description at {}, assuming {}",
                location, synthesized
            );
            (AVTRANSPORT_SERVICE_TYPE.to_string(), synthesized)
        }
    };

    let hostname = host_of(location).unwrap_or_default();

    Ok(DeviceDescription {
        friendly_name,
        manufacturer,
        control_url,
        service_type,
        location: location.to_string(),
        hostname,
    })
}

/// Locate the AVTransport (service_type, controlURL) pair.
///
/// Tried in order: a `<service>` whose serviceType is exactly the
/// AVTransport:1 URN, then any service whose serviceType merely contains
/// "AVTransport", then a bare `<controlURL>` that itself mentions
/// AVTransport. Each fallback exists because some firmware emits it.
fn find_avtransport_endpoint(root: &Element) -> Option<(String, String)> {
    let mut services = Vec::new();
    collect_elements_named(root, "service", &mut services);

    let service_entry = |service: &Element| -> Option<(String, String)> {
        let service_type = child_text(service, "serviceType")?;
        let control_url = child_text(service, "controlURL")?;
        Some((service_type, control_url))
    };

    for service in &services {
        if let Some((st, url)) = service_entry(service) {
            if st == AVTRANSPORT_SERVICE_TYPE {
                return Some((st, url));
            }
        }
    }

    for service in &services {
        if let Some((st, url)) = service_entry(service) {
            if st.contains("AVTransport") {
                return Some((st, url));
            }
        }
    }

    let mut control_urls = Vec::new();
    collect_elements_named(root, "controlURL", &mut control_urls);
    for elem in control_urls {
        if let Some(text) = element_text(elem) {
            if text.contains("AVTransport") {
                return Some((AVTRANSPORT_SERVICE_TYPE.to_string(), text));
            }
        }
    }

    None
}

/// Resolve a possibly relative controlURL against the description URL.
///
/// - If `control_url` is already absolute (starts with http:// or
///   https://), it is returned as-is.
/// - Otherwise it is rebased onto the scheme://host:port of
///   `description_url`.
pub fn resolve_control_url(description_url: &str, control_url: &str) -> String {
    if control_url.starts_with("http://") || control_url.starts_with("https://") {
        return control_url.to_string();
    }

    if let Some(base) = host_base(description_url) {
        if control_url.starts_with('/') {
            return format!("{}{}", base, control_url);
        }
        return format!("{}/{}", base, control_url);
    }

    control_url.to_string()
}

/// "scheme://host:port" of a URL, without any path.
fn host_base(url: &str) -> Option<String> {
    let (scheme, rest) = url.split_once("://")?;
    let authority = rest.split('/').next()?;
    if authority.is_empty() {
        return None;
    }
    Some(format!("{}://{}", scheme, authority))
}

/// Bare host of a URL, without scheme, port or path.
fn host_of(url: &str) -> Option<String> {
    let (_, rest) = url.split_once("://")?;
    let authority = rest.split('/').next()?;
    let host = authority.rsplit_once(':').map_or(authority, |(h, _)| h);
    if host.is_empty() {
        None
    } else {
        Some(host.to_string())
    }
}

/// Remove `xmlns="..."` default-namespace declarations from a document.
fn strip_default_namespaces(xml: &str) -> String {
    let mut out = String::with_capacity(xml.len());
    let mut rest = xml;

    while let Some(idx) = rest.find("xmlns=") {
        let (before, after) = rest.split_at(idx);
        out.push_str(before.trim_end_matches(' '));
        out.push(' ');

        let value_part = &after["xmlns=".len()..];
        let Some(quote) = value_part.chars().next().filter(|c| *c == '"' || *c == '\'')
        else {
            // Malformed declaration, keep it untouched and move on.
            out.push_str("xmlns=");
            rest = value_part;
            continue;
        };
        match value_part[1..].find(quote) {
            Some(end) => rest = &value_part[end + 2..],
            None => {
                rest = value_part;
            }
        }
    }

    out.push_str(rest);
    out
}

fn collect_elements_named<'a>(elem: &'a Element, name: &str, out: &mut Vec<&'a Element>) {
    for node in &elem.children {
        if let XMLNode::Element(child) = node {
            if child.name == name {
                out.push(child);
            }
            collect_elements_named(child, name, out);
        }
    }
}

fn find_descendant_text(elem: &Element, name: &str) -> Option<String> {
    let mut found = Vec::new();
    collect_elements_named(elem, name, &mut found);
    found.first().and_then(|e| element_text(e))
}

fn child_text(elem: &Element, name: &str) -> Option<String> {
    elem.children.iter().find_map(|node| match node {
        XMLNode::Element(child) if child.name == name => element_text(child),
        _ => None,
    })
}

fn element_text(elem: &Element) -> Option<String> {
    elem.get_text()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    const DESCRIPTION_XML: &str = r#"<?xml version="1.0"?>
<root xmlns="urn:schemas-upnp-org:device-1-0">
  <device>
    <deviceType>urn:schemas-upnp-org:device:MediaRenderer:1</deviceType>
    <friendlyName>Proj-A</friendlyName>
    <manufacturer>Acme Displays</manufacturer>
    <serviceList>
      <service>
        <serviceType>urn:schemas-upnp-org:service:ConnectionManager:1</serviceType>
        <controlURL>/CM/Control</controlURL>
      </service>
      <service>
        <serviceType>urn:schemas-upnp-org:service:AVTransport:1</serviceType>
        <controlURL>/AVT/Control</controlURL>
      </service>
    </serviceList>
  </device>
</root>"#;

    #[test]
    fn test_parse_description_with_relative_control_url() {
        let desc =
            parse_device_description(DESCRIPTION_XML, "http://10.0.0.45:3500/desc.xml").unwrap();

        assert_eq!(desc.friendly_name, "Proj-A");
        assert_eq!(desc.manufacturer.as_deref(), Some("Acme Displays"));
        assert_eq!(desc.control_url, "http://10.0.0.45:3500/AVT/Control");
        assert_eq!(desc.service_type, "urn:schemas-upnp-org:service:AVTransport:1");
        assert_eq!(desc.hostname, "10.0.0.45");
    }

    #[test]
    fn test_parse_description_synthesizes_control_url() {
        let xml = r#"<?xml version="1.0"?>
<root>
  <device>
    <friendlyName>Bare-B</friendlyName>
  </device>
</root>"#;

        let desc = parse_device_description(xml, "http://10.0.0.46:49152/d.xml").unwrap();
        assert_eq!(
            desc.control_url,
            "http://10.0.0.46:49152/AVTransport/Control"
        );
        assert_eq!(desc.service_type, AVTRANSPORT_SERVICE_TYPE);
    }

    #[test]
    fn test_parse_description_requires_friendly_name() {
        let xml = "<root><device></device></root>";
        assert!(matches!(
            parse_device_description(xml, "http://10.0.0.46/d.xml"),
            Err(DescriptionError::MissingField("friendlyName"))
        ));
    }

    #[test]
    fn test_loose_avtransport_service_type_matches() {
        let xml = r#"<root>
  <device>
    <friendlyName>Odd-C</friendlyName>
    <serviceList>
      <service>
        <serviceType>urn:custom:service:AVTransport:2</serviceType>
        <controlURL>http://10.0.0.47:8000/avt</controlURL>
      </service>
    </serviceList>
  </device>
</root>"#;

        let desc = parse_device_description(xml, "http://10.0.0.47:8000/d.xml").unwrap();
        assert_eq!(desc.control_url, "http://10.0.0.47:8000/avt");
        assert_eq!(desc.service_type, "urn:custom:service:AVTransport:2");
    }

    #[test]
    fn test_resolve_control_url() {
        assert_eq!(
            resolve_control_url("http://10.0.0.45:3500/desc.xml", "/ctrl"),
            "http://10.0.0.45:3500/ctrl"
        );
        assert_eq!(
            resolve_control_url("http://10.0.0.45:3500/desc.xml", "ctrl"),
            "http://10.0.0.45:3500/ctrl"
        );
        assert_eq!(
            resolve_control_url("http://10.0.0.45:3500/desc.xml", "http://other/ctrl"),
            "http://other/ctrl"
        );
        assert_eq!(resolve_control_url("not a url", "ctrl"), "ctrl");
    }

    #[test]
    fn test_strip_default_namespaces() {
        let xml = r#"<root xmlns="urn:x" a="1"><child xmlns='urn:y'/></root>"#;
        let cleaned = strip_default_namespaces(xml);
        assert!(!cleaned.contains("xmlns"));
        assert!(cleaned.contains(r#"a="1""#));
    }

    #[test]
    fn test_host_helpers() {
        assert_eq!(
            host_base("http://10.0.0.45:3500/desc.xml"),
            Some("http://10.0.0.45:3500".to_string())
        );
        assert_eq!(host_of("http://10.0.0.45:3500/desc.xml"), Some("10.0.0.45".to_string()));
        assert_eq!(host_of("http://10.0.0.45/desc.xml"), Some("10.0.0.45".to_string()));
        assert_eq!(host_base("garbage"), None);
    }
}

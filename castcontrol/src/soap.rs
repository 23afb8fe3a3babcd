//! SOAP 1.1 plumbing for UPnP action invocation.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::debug;
use ureq::Agent;
use xmltree::{Element, EmitterConfig, XMLNode};

/// Per-attempt SOAP timeout.
const SOAP_TIMEOUT: Duration = Duration::from_secs(10);

/// Result of a SOAP call:
/// - HTTP status code
/// - raw XML body (always)
/// - parsed envelope root if parsing succeeded
pub struct SoapCallResult {
    pub status: ureq::http::StatusCode,
    pub raw_body: String,
    pub envelope: Option<Element>,
}

/// Build a SOAP 1.1 request envelope for a UPnP action.
///
/// The action element carries `xmlns:u` set to the service URN and one
/// child per `(name, value)` argument pair.
pub fn build_soap_request(
    service_type: &str,
    action: &str,
    args: &[(&str, &str)],
) -> Result<String> {
    let mut action_elem = Element::new(&format!("u:{}", action));
    action_elem
        .attributes
        .insert("xmlns:u".to_string(), service_type.to_string());

    for (name, value) in args {
        let mut child = Element::new(name);
        child.children.push(XMLNode::Text((*value).to_string()));
        action_elem.children.push(XMLNode::Element(child));
    }

    let mut body = Element::new("s:Body");
    body.children.push(XMLNode::Element(action_elem));

    let mut envelope = Element::new("s:Envelope");
    envelope.attributes.insert(
        "xmlns:s".to_string(),
        "http://schemas.xmlsoap.org/soap/envelope/".to_string(),
    );
    envelope.attributes.insert(
        "s:encodingStyle".to_string(),
        "http://schemas.xmlsoap.org/soap/encoding/".to_string(),
    );
    envelope.children.push(XMLNode::Element(body));

    let mut buf = Vec::new();
    let config = EmitterConfig::new().perform_indent(false);
    envelope
        .write_with_config(&mut buf, config)
        .context("Failed to serialize SOAP request")?;

    String::from_utf8(buf).context("SOAP request is not valid UTF-8")
}

/// Invoke a UPnP SOAP action on a control URL.
///
/// - `control_url`: full HTTP URL of the service control endpoint
/// - `service_type`: service URN
/// - `action`: action name
/// - `args`: list of (name, value)
pub fn invoke_upnp_action(
    control_url: &str,
    service_type: &str,
    action: &str,
    args: &[(&str, &str)],
) -> Result<SoapCallResult> {
    let body_xml = build_soap_request(service_type, action, args)
        .context("Failed to build SOAP request body")?;

    // 4xx/5xx must surface as a status, not a transport error: UPnP
    // faults ride on HTTP 500.
    let config = Agent::config_builder()
        .http_status_as_error(false)
        .timeout_global(Some(SOAP_TIMEOUT))
        .build();
    let agent: Agent = config.into();

    let soap_action_header = format!(r#""{}#{}""#, service_type, action);
    debug!("SOAP {} -> {}", action, control_url);

    let mut response = agent
        .post(control_url)
        .header("Content-Type", r#"text/xml; charset="utf-8""#)
        .header("SOAPAction", &soap_action_header)
        .send(body_xml)
        .with_context(|| format!("HTTP error when sending SOAP request to {}", control_url))?;

    let status = response.status();
    let raw_body = response
        .body_mut()
        .read_to_string()
        .context("Failed to read SOAP response body")?;

    let envelope = Element::parse(raw_body.as_bytes()).ok();

    Ok(SoapCallResult {
        status,
        raw_body,
        envelope,
    })
}

/// Check a call result for HTTP and UPnP-level failure.
pub fn handle_action_response(action: &str, call_result: &SoapCallResult) -> Result<()> {
    if let Some(envelope) = &call_result.envelope {
        if let Some(upnp_error) = parse_upnp_error(envelope) {
            return Err(anyhow!(
                "{action} failed with UPnP error {}: {} (HTTP status {})",
                upnp_error.error_code,
                upnp_error.error_description,
                call_result.status
            ));
        }
    }

    if !call_result.status.is_success() {
        return Err(anyhow!(
            "{action} failed with HTTP status {} and body: {}",
            call_result.status,
            call_result.raw_body
        ));
    }

    Ok(())
}

/// A UPnP error carried in a SOAP Fault.
#[derive(Debug, Clone)]
pub struct UpnpError {
    pub error_code: u32,
    pub error_description: String,
}

/// Parse a SOAP Fault containing a UPnPError, if present.
///
/// Typical shape (SOAP 1.1):
///
/// ```xml
/// <s:Body>
///   <s:Fault>
///     <detail>
///       <UPnPError xmlns="urn:schemas-upnp-org:control-1-0">
///         <errorCode>401</errorCode>
///         <errorDescription>Invalid Action</errorDescription>
///       </UPnPError>
///     </detail>
///   </s:Fault>
/// </s:Body>
/// ```
pub fn parse_upnp_error(envelope: &Element) -> Option<UpnpError> {
    let body = find_child_with_suffix(envelope, "Body")?;
    let fault = find_child_with_suffix(body, "Fault")?;
    let detail = find_child_with_suffix(fault, "detail")?;
    let upnp_error = find_child_with_suffix(detail, "UPnPError")?;

    let code_text = extract_child_text(upnp_error, "errorCode").ok()?;
    let error_code = code_text.parse::<u32>().ok()?;

    let error_description =
        extract_child_text(upnp_error, "errorDescription").unwrap_or_default();

    Some(UpnpError {
        error_code,
        error_description,
    })
}

/// First child whose (possibly prefixed) name ends with `suffix`.
///
/// Renderers qualify response elements with arbitrary prefixes, so
/// matching on the suffix is the robust way to walk SOAP bodies.
pub fn find_child_with_suffix<'a>(parent: &'a Element, suffix: &str) -> Option<&'a Element> {
    parent.children.iter().find_map(|node| match node {
        XMLNode::Element(elem) if elem.name.ends_with(suffix) => Some(elem),
        _ => None,
    })
}

/// Trimmed text of the first child whose name ends with `suffix`.
pub fn extract_child_text(parent: &Element, suffix: &str) -> Result<String> {
    let child = find_child_with_suffix(parent, suffix)
        .ok_or_else(|| anyhow!("Missing {suffix} element in SOAP response"))?;

    child
        .get_text()
        .map(|t| t.trim().to_string())
        .ok_or_else(|| anyhow!("{suffix} element has no text in SOAP response"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_soap_request_shape() {
        let xml = build_soap_request(
            "urn:schemas-upnp-org:service:AVTransport:1",
            "Play",
            &[("InstanceID", "0"), ("Speed", "1")],
        )
        .unwrap();

        assert!(xml.contains(r#"xmlns:s="http://schemas.xmlsoap.org/soap/envelope/""#));
        assert!(xml.contains(r#"<u:Play xmlns:u="urn:schemas-upnp-org:service:AVTransport:1""#));
        assert!(xml.contains("<InstanceID>0</InstanceID>"));
        assert!(xml.contains("<Speed>1</Speed>"));
    }

    #[test]
    fn test_build_soap_request_empty_args() {
        let xml = build_soap_request(
            "urn:schemas-upnp-org:service:AVTransport:1",
            "Stop",
            &[("InstanceID", "0")],
        )
        .unwrap();
        assert!(xml.contains("u:Stop"));
    }

    #[test]
    fn test_parse_upnp_error() {
        let xml = r#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/">
  <s:Body>
    <s:Fault>
      <faultcode>s:Client</faultcode>
      <faultstring>UPnPError</faultstring>
      <detail>
        <UPnPError xmlns="urn:schemas-upnp-org:control-1-0">
          <errorCode>401</errorCode>
          <errorDescription>Invalid Action</errorDescription>
        </UPnPError>
      </detail>
    </s:Fault>
  </s:Body>
</s:Envelope>"#;

        let envelope = Element::parse(xml.as_bytes()).unwrap();
        let error = parse_upnp_error(&envelope).expect("expected UPnPError");
        assert_eq!(error.error_code, 401);
        assert_eq!(error.error_description, "Invalid Action");
    }

    #[test]
    fn test_parse_upnp_error_absent_on_success() {
        let xml = r#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/">
  <s:Body>
    <u:PlayResponse xmlns:u="urn:schemas-upnp-org:service:AVTransport:1"/>
  </s:Body>
</s:Envelope>"#;

        let envelope = Element::parse(xml.as_bytes()).unwrap();
        assert!(parse_upnp_error(&envelope).is_none());
    }
}

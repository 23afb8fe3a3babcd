//! Typed AVTransport client.
//!
//! Every action runs against InstanceID 0, which covers media renderers
//! with a single transport instance. Transient failures are retried a
//! bounded number of times before surfacing.

use std::time::Duration;

use anyhow::{Result, anyhow};
use xmltree::Element;

use castutils::retry;

use crate::soap::{
    SoapCallResult, extract_child_text, find_child_with_suffix, handle_action_response,
    invoke_upnp_action,
};

/// Retry policy for transport actions.
const ACTION_ATTEMPTS: usize = 3;
const ACTION_RETRY_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct AvTransportClient {
    pub control_url: String,
    pub service_type: String,
}

#[derive(Debug, Clone)]
pub struct TransportInfo {
    pub current_transport_state: String,
    pub current_transport_status: String,
    pub current_speed: String,
}

#[derive(Debug, Clone)]
pub struct PositionInfo {
    pub track_duration: String,
    pub rel_time: String,
}

impl AvTransportClient {
    pub fn new(control_url: String, service_type: String) -> Self {
        Self {
            control_url,
            service_type,
        }
    }

    fn invoke(&self, action: &str, args: &[(&str, &str)]) -> Result<SoapCallResult> {
        retry(ACTION_ATTEMPTS, ACTION_RETRY_DELAY, |_| {
            let call_result =
                invoke_upnp_action(&self.control_url, &self.service_type, action, args)?;
            handle_action_response(action, &call_result)?;
            Ok(call_result)
        })
    }

    /// AVTransport:1 — SetAVTransportURI
    ///
    /// - `uri`: CurrentURI
    /// - `meta`: CurrentURIMetaData (DIDL-Lite or empty string)
    pub fn set_av_transport_uri(&self, uri: &str, meta: &str) -> Result<()> {
        let args = [
            ("InstanceID", "0"),
            ("CurrentURI", uri),
            ("CurrentURIMetaData", meta),
        ];
        self.invoke("SetAVTransportURI", &args).map(|_| ())
    }

    /// AVTransport:1 — Play (Speed=1)
    pub fn play(&self) -> Result<()> {
        let args = [("InstanceID", "0"), ("Speed", "1")];
        self.invoke("Play", &args).map(|_| ())
    }

    /// AVTransport:1 — Pause
    pub fn pause(&self) -> Result<()> {
        let args = [("InstanceID", "0")];
        self.invoke("Pause", &args).map(|_| ())
    }

    /// AVTransport:1 — Stop
    pub fn stop(&self) -> Result<()> {
        let args = [("InstanceID", "0")];
        self.invoke("Stop", &args).map(|_| ())
    }

    /// AVTransport:1 — Seek (Unit=REL_TIME, Target=HH:MM:SS)
    pub fn seek(&self, target: &str) -> Result<()> {
        let args = [
            ("InstanceID", "0"),
            ("Unit", "REL_TIME"),
            ("Target", target),
        ];
        self.invoke("Seek", &args).map(|_| ())
    }

    /// AVTransport:1 — GetTransportInfo
    pub fn get_transport_info(&self) -> Result<TransportInfo> {
        let args = [("InstanceID", "0")];
        let call_result = self.invoke("GetTransportInfo", &args)?;

        let envelope = call_result
            .envelope
            .as_ref()
            .ok_or_else(|| anyhow!("Missing SOAP envelope in GetTransportInfo response"))?;
        parse_transport_info(envelope)
    }

    /// AVTransport:1 — GetPositionInfo
    pub fn get_position_info(&self) -> Result<PositionInfo> {
        let args = [("InstanceID", "0")];
        let call_result = self.invoke("GetPositionInfo", &args)?;

        let envelope = call_result
            .envelope
            .as_ref()
            .ok_or_else(|| anyhow!("Missing SOAP envelope in GetPositionInfo response"))?;
        parse_position_info(envelope)
    }
}

fn find_response_element<'a>(envelope: &'a Element, name: &str) -> Result<&'a Element> {
    let body = find_child_with_suffix(envelope, "Body")
        .ok_or_else(|| anyhow!("Missing Body element in SOAP envelope"))?;
    find_child_with_suffix(body, name)
        .ok_or_else(|| anyhow!("Missing {name} element in SOAP body"))
}

fn parse_transport_info(envelope: &Element) -> Result<TransportInfo> {
    let response = find_response_element(envelope, "GetTransportInfoResponse")?;

    Ok(TransportInfo {
        current_transport_state: extract_child_text(response, "CurrentTransportState")?,
        current_transport_status: extract_child_text(response, "CurrentTransportStatus")?,
        current_speed: extract_child_text(response, "CurrentSpeed").unwrap_or_default(),
    })
}

fn parse_position_info(envelope: &Element) -> Result<PositionInfo> {
    let response = find_response_element(envelope, "GetPositionInfoResponse")?;

    // Both fields are commonly sentinels ("NOT_IMPLEMENTED") rather than
    // absent; missing elements degrade to the same sentinel.
    Ok(PositionInfo {
        track_duration: extract_child_text(response, "TrackDuration")
            .unwrap_or_else(|_| "NOT_IMPLEMENTED".to_string()),
        rel_time: extract_child_text(response, "RelTime")
            .unwrap_or_else(|_| "NOT_IMPLEMENTED".to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope_with(body_inner: &str) -> Element {
        let xml = format!(
            r#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/">
  <s:Body>{}</s:Body>
</s:Envelope>"#,
            body_inner
        );
        Element::parse(xml.as_bytes()).unwrap()
    }

    #[test]
    fn test_parse_transport_info_extracts_fields() {
        let envelope = envelope_with(
            r#"<u:GetTransportInfoResponse xmlns:u="urn:schemas-upnp-org:service:AVTransport:1">
  <CurrentTransportState>PLAYING</CurrentTransportState>
  <CurrentTransportStatus>OK</CurrentTransportStatus>
  <CurrentSpeed>1</CurrentSpeed>
</u:GetTransportInfoResponse>"#,
        );

        let info = parse_transport_info(&envelope).unwrap();
        assert_eq!(info.current_transport_state, "PLAYING");
        assert_eq!(info.current_transport_status, "OK");
        assert_eq!(info.current_speed, "1");
    }

    #[test]
    fn test_parse_transport_info_missing_response() {
        let envelope = envelope_with(
            r#"<u:SomethingElse xmlns:u="urn:schemas-upnp-org:service:AVTransport:1"/>"#,
        );
        assert!(parse_transport_info(&envelope).is_err());
    }

    #[test]
    fn test_parse_position_info_extracts_fields() {
        let envelope = envelope_with(
            r#"<u:GetPositionInfoResponse xmlns:u="urn:schemas-upnp-org:service:AVTransport:1">
  <Track>1</Track>
  <TrackDuration>00:02:30</TrackDuration>
  <RelTime>00:00:02</RelTime>
</u:GetPositionInfoResponse>"#,
        );

        let info = parse_position_info(&envelope).unwrap();
        assert_eq!(info.track_duration, "00:02:30");
        assert_eq!(info.rel_time, "00:00:02");
    }

    #[test]
    fn test_parse_position_info_defaults_to_sentinels() {
        let envelope = envelope_with(
            r#"<u:GetPositionInfoResponse xmlns:u="urn:schemas-upnp-org:service:AVTransport:1">
  <Track>0</Track>
</u:GetPositionInfoResponse>"#,
        );

        let info = parse_position_info(&envelope).unwrap();
        assert_eq!(info.track_duration, "NOT_IMPLEMENTED");
        assert_eq!(info.rel_time, "NOT_IMPLEMENTED");
    }
}

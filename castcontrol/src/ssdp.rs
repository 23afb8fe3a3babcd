//! SSDP M-SEARCH probe for AVTransport renderers.
//!
//! The probe is a pure control point: it binds an ephemeral port, never
//! UDP 1900, sends one multicast M-SEARCH and collects the unicast
//! HTTP/200 replies for a bounded window.

use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, trace, warn};

const SSDP_MULTICAST_ADDR: &str = "239.255.255.250";
const SSDP_PORT: u16 = 1900;
const SSDP_TTL: u32 = 4;
/// MX value advertised in the M-SEARCH.
const SSDP_MX: u32 = 10;

/// One parsed M-SEARCH response.
#[derive(Debug, Clone)]
pub struct SsdpResponse {
    pub usn: String,
    pub st: String,
    /// URL of the device description XML.
    pub location: String,
    pub server: String,
    pub from: SocketAddr,
}

/// Broadcast an M-SEARCH for `ssdp:all` and collect responses that
/// advertise an AVTransport service, deduplicated by LOCATION.
pub fn search_avtransport(window: Duration) -> std::io::Result<Vec<SsdpResponse>> {
    let socket = make_search_socket()?;
    send_msearch(&socket)?;
    Ok(collect_responses(&socket, window))
}

fn make_search_socket() -> std::io::Result<UdpSocket> {
    let socket2 = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket2.set_reuse_address(true)?;

    let bind_addr: SocketAddr = "0.0.0.0:0".parse().expect("static addr");
    socket2.bind(&bind_addr.into())?;
    socket2.set_multicast_ttl_v4(SSDP_TTL)?;

    let socket: UdpSocket = socket2.into();
    socket.set_read_timeout(Some(Duration::from_millis(500)))?;
    Ok(socket)
}

fn send_msearch(socket: &UdpSocket) -> std::io::Result<()> {
    let msg = format!(
        "M-SEARCH * HTTP/1.1\r\n\
         HOST: {}:{}\r\n\
         MAN: \"ssdp:discover\"\r\n\
         MX: {}\r\n\
         ST: ssdp:all\r\n\
         \r\n",
        SSDP_MULTICAST_ADDR, SSDP_PORT, SSDP_MX
    );

    let addr: SocketAddr = format!("{}:{}", SSDP_MULTICAST_ADDR, SSDP_PORT)
        .parse()
        .expect("static addr");

    socket.send_to(msg.as_bytes(), addr)?;
    debug!("M-SEARCH sent (ST=ssdp:all, MX={})", SSDP_MX);
    Ok(())
}

fn collect_responses(socket: &UdpSocket, window: Duration) -> Vec<SsdpResponse> {
    let deadline = Instant::now() + window;
    let mut seen_locations = std::collections::HashSet::new();
    let mut responses = Vec::new();
    let mut buf = [0u8; 8192];

    while Instant::now() < deadline {
        match socket.recv_from(&mut buf) {
            Ok((n, from)) => {
                let data = String::from_utf8_lossy(&buf[..n]);
                if let Some(response) = parse_search_response(&data, from) {
                    if !is_avtransport(&response.st) {
                        trace!("Ignoring non-AVTransport service: {}", response.st);
                        continue;
                    }
                    if seen_locations.insert(response.location.clone()) {
                        debug!(
                            "AVTransport renderer at {} ({})",
                            response.from, response.location
                        );
                        responses.push(response);
                    }
                }
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                warn!("SSDP receive error: {}", e);
                break;
            }
        }
    }

    responses
}

fn is_avtransport(st: &str) -> bool {
    st.contains("AVTransport")
}

/// Parse one M-SEARCH response datagram.
///
/// Anything that is not an HTTP/200 status line with LOCATION and ST
/// headers is silently discarded (NOTIFY traffic, other control points'
/// searches, malformed replies).
fn parse_search_response(data: &str, from: SocketAddr) -> Option<SsdpResponse> {
    let mut lines = data.lines();
    let first_line = lines.next()?.trim().to_ascii_uppercase();
    if !first_line.starts_with("HTTP/") || !first_line.contains(" 200 ") {
        return None;
    }

    let headers = parse_headers(lines);

    let st = headers.get("ST")?.to_string();
    let location = headers.get("LOCATION")?.to_string();
    let usn = headers.get("USN").cloned().unwrap_or_default();
    let server = headers
        .get("SERVER")
        .cloned()
        .unwrap_or_else(|| "Unknown".to_string());

    Some(SsdpResponse {
        usn,
        st,
        location,
        server,
        from,
    })
}

fn parse_headers<'a, I>(lines: I) -> HashMap<String, String>
where
    I: Iterator<Item = &'a str>,
{
    let mut headers = HashMap::new();
    for line in lines {
        let line = line.trim();
        if line.is_empty() {
            break;
        }

        // Split on the first ':' only; values may contain ':'.
        if let Some(colon_pos) = line.find(':') {
            let (name, value_with_colon) = line.split_at(colon_pos);
            let value = &value_with_colon[1..];

            let name = name.trim().to_ascii_uppercase();
            let value = value.trim().to_string();
            if !name.is_empty() && !value.is_empty() {
                headers.insert(name, value);
            }
        } else {
            trace!("Skipping header line without colon: '{}'", line);
        }
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_addr() -> SocketAddr {
        "10.0.0.45:1900".parse().unwrap()
    }

    #[test]
    fn test_parse_search_response() {
        let data = "HTTP/1.1 200 OK\r\n\
                    CACHE-CONTROL: max-age=1800\r\n\
                    LOCATION: http://10.0.0.45:3500/desc.xml\r\n\
                    SERVER: Linux UPnP/1.0 Renderer/1.0\r\n\
                    ST: urn:schemas-upnp-org:service:AVTransport:1\r\n\
                    USN: uuid:1234::urn:schemas-upnp-org:service:AVTransport:1\r\n\
                    \r\n";

        let response = parse_search_response(data, from_addr()).unwrap();
        assert_eq!(response.location, "http://10.0.0.45:3500/desc.xml");
        assert_eq!(response.st, "urn:schemas-upnp-org:service:AVTransport:1");
        assert!(response.usn.starts_with("uuid:1234"));
        assert!(is_avtransport(&response.st));
    }

    #[test]
    fn test_parse_rejects_non_200() {
        let data = "NOTIFY * HTTP/1.1\r\nNT: upnp:rootdevice\r\n\r\n";
        assert!(parse_search_response(data, from_addr()).is_none());
    }

    #[test]
    fn test_parse_rejects_missing_location() {
        let data = "HTTP/1.1 200 OK\r\n\
                    ST: urn:schemas-upnp-org:service:AVTransport:1\r\n\
                    \r\n";
        assert!(parse_search_response(data, from_addr()).is_none());
    }

    #[test]
    fn test_header_values_keep_colons() {
        let data = "HTTP/1.1 200 OK\r\n\
                    LOCATION: http://10.0.0.45:3500/desc.xml\r\n\
                    ST: ssdp:all\r\n\
                    \r\n";
        let response = parse_search_response(data, from_addr()).unwrap();
        assert_eq!(response.location, "http://10.0.0.45:3500/desc.xml");
    }

    #[test]
    fn test_non_avtransport_service_filtered() {
        let st = "urn:schemas-upnp-org:service:ContentDirectory:1";
        assert!(!is_avtransport(st));
        assert!(is_avtransport(
            "urn:schemas-upnp-org:service:AVTransport:1"
        ));
    }
}

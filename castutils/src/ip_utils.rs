use std::net::{IpAddr, UdpSocket};

use tracing::warn;

/// Environment variable forcing the LAN IP used in streaming URLs.
pub const SERVE_IP_ENV: &str = "STREAMING_SERVE_IP";

/// Pick the IP address renderers should use to reach this machine.
///
/// `STREAMING_SERVE_IP` wins when set, unless it names a loopback address
/// (renderers on the LAN cannot reach 127.0.0.0/8, so such a value is
/// ignored with a warning). Otherwise the address is auto-detected.
pub fn serve_ip() -> String {
    if let Ok(forced) = std::env::var(SERVE_IP_ENV) {
        let forced = forced.trim().to_string();
        match forced.parse::<IpAddr>() {
            Ok(ip) if ip.is_loopback() => {
                warn!(
                    "{} is set to loopback address {}, ignoring it",
                    SERVE_IP_ENV, forced
                );
            }
            Ok(_) => return forced,
            Err(_) => {
                warn!("{} is not a valid IP address: {}", SERVE_IP_ENV, forced);
            }
        }
    }
    guess_local_ip()
}

/// Guess the local LAN IP of this machine.
///
/// Binds a UDP socket and "connects" it toward a public DNS server, then
/// reads the local address the kernel selected for that route. No packet
/// is sent. If the result is loopback (or the socket fails), falls back
/// to scanning the network interfaces for a non-loopback IPv4 address.
pub fn guess_local_ip() -> String {
    if let Ok(socket) = UdpSocket::bind("0.0.0.0:0") {
        if socket.connect("8.8.8.8:80").is_ok() {
            if let Ok(local_addr) = socket.local_addr() {
                let ip = local_addr.ip();
                if !ip.is_loopback() {
                    return ip.to_string();
                }
            }
        }
    }

    if let Some(ip) = first_interface_ip() {
        return ip;
    }

    warn!("Could not determine a non-loopback local IP, using 127.0.0.1");
    "127.0.0.1".to_string()
}

/// First non-loopback IPv4 address among the network interfaces.
fn first_interface_ip() -> Option<String> {
    let interfaces = get_if_addrs::get_if_addrs().ok()?;
    interfaces
        .into_iter()
        .map(|iface| iface.ip())
        .find(|ip| ip.is_ipv4() && !ip.is_loopback())
        .map(|ip| ip.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    #[test]
    fn test_guess_local_ip_returns_valid_ip() {
        let ip = guess_local_ip();
        assert!(ip.parse::<IpAddr>().is_ok(), "should return a valid IP");
    }

    #[test]
    fn test_guess_local_ip_is_ipv4() {
        let ip = guess_local_ip();
        if let Ok(parsed) = ip.parse::<IpAddr>() {
            assert!(parsed.is_ipv4(), "should return an IPv4 address");
        }
    }

    #[test]
    fn test_serve_ip_returns_valid_ip() {
        let ip = serve_ip();
        assert!(ip.parse::<IpAddr>().is_ok(), "should return a valid IP");
    }

    #[test]
    fn test_first_interface_ip_not_loopback() {
        if let Some(ip) = first_interface_ip() {
            let parsed = ip.parse::<IpAddr>().unwrap();
            assert!(!parsed.is_loopback(), "interface scan must skip loopback");
        }
    }
}

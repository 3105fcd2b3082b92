//! wg-quick configuration parser
//!
//! Parses `.conf` style settings with [Interface] and [Peer] sections, and
//! dispatches between this grammar and UAPI.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ipnet::IpNet;

use crate::error::ConfigError;

/// Complete WireGuard configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireGuardConfig {
    /// Interface configuration (our side)
    pub interface: InterfaceConfig,
    /// Peer configurations
    pub peers: Vec<PeerConfig>,
}

/// Interface (local) configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceConfig {
    /// Our private key (32 bytes)
    pub private_key: [u8; 32],
    /// Tunnel addresses with prefix
    pub address: Vec<IpNet>,
    /// DNS servers (optional)
    pub dns: Vec<IpAddr>,
    /// Listen port (optional)
    pub listen_port: Option<u16>,
    /// MTU (optional, default 1420)
    pub mtu: Option<u16>,
    /// Firewall mark (UAPI only)
    pub fwmark: Option<u32>,
}

/// Peer configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    /// Peer's public key (32 bytes)
    pub public_key: [u8; 32],
    /// Pre-shared key (optional, 32 bytes)
    pub preshared_key: Option<[u8; 32]>,
    /// Peer's endpoint (IP:port)
    pub endpoint: Option<SocketAddr>,
    /// Allowed IP ranges for this peer
    pub allowed_ips: Vec<IpNet>,
    /// Keepalive interval in seconds (optional)
    pub persistent_keepalive: Option<u16>,
}

/// Default tunnel MTU
pub const DEFAULT_MTU: u16 = 1420;

impl WireGuardConfig {
    /// Parse settings from a file, in either grammar
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound {
                    path: path.display().to_string(),
                }
            } else {
                ConfigError::Io(e)
            }
        })?;
        Self::parse_settings(&content)
    }

    /// Parse a settings string, detecting the grammar.
    ///
    /// Input whose first meaningful line is a `[Section]` header is treated
    /// as wg-quick INI; anything else is parsed as UAPI.
    pub fn parse_settings(content: &str) -> Result<Self, ConfigError> {
        let first = content
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty() && !line.starts_with('#'));

        match first {
            Some(line) if line.starts_with('[') => Self::parse(content),
            Some(_) => Self::parse_uapi(content),
            None => Err(ConfigError::MissingField {
                field: "[Interface] section".to_string(),
            }),
        }
    }

    /// Parse a wg-quick style configuration string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut interface: Option<InterfaceConfig> = None;
        let mut peers: Vec<PeerConfig> = Vec::new();
        let mut current_section: Option<Section> = None;
        let mut current_peer: Option<PeerBuilder> = None;

        for (line_num, line) in content.lines().enumerate() {
            let line_num = line_num + 1;
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if line.eq_ignore_ascii_case("[interface]") {
                if let Some(peer) = current_peer.take() {
                    peers.push(peer.build()?);
                }
                current_section = Some(Section::Interface);
                continue;
            } else if line.eq_ignore_ascii_case("[peer]") {
                if let Some(peer) = current_peer.take() {
                    peers.push(peer.build()?);
                }
                current_section = Some(Section::Peer);
                current_peer = Some(PeerBuilder::default());
                continue;
            } else if line.starts_with('[') {
                return Err(ConfigError::ParseError {
                    line: line_num,
                    message: format!("Unknown section: {}", line),
                });
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::ParseError {
                    line: line_num,
                    message: format!("Expected 'key = value', got: {}", line),
                });
            };

            let key = key.trim().to_lowercase();
            let value = value.trim();

            match current_section {
                Some(Section::Interface) => {
                    let iface = interface.get_or_insert_with(InterfaceConfig::empty);

                    match key.as_str() {
                        "privatekey" => {
                            iface.private_key = parse_key(value, "PrivateKey")?;
                        }
                        "address" => {
                            iface.address.extend(parse_cidr_list(value)?);
                        }
                        "dns" => {
                            for dns_str in value.split(',') {
                                let dns_str = dns_str.trim();
                                if dns_str.is_empty() {
                                    continue;
                                }
                                let dns: IpAddr =
                                    dns_str.parse().map_err(|_| ConfigError::InvalidAddress {
                                        value: dns_str.to_string(),
                                    })?;
                                iface.dns.push(dns);
                            }
                        }
                        "listenport" => {
                            iface.listen_port = Some(parse_number(value, line_num, "ListenPort")?);
                        }
                        "mtu" => {
                            iface.mtu = Some(parse_number(value, line_num, "MTU")?);
                        }
                        _ => {
                            // Unknown key, ignore (wg-quick extensions like PostUp)
                            tracing::debug!("Unknown interface key: {}", key);
                        }
                    }
                }
                Some(Section::Peer) => {
                    let peer = current_peer.as_mut().ok_or(ConfigError::ParseError {
                        line: line_num,
                        message: "Peer value outside of [Peer] section".to_string(),
                    })?;

                    match key.as_str() {
                        "publickey" => {
                            peer.public_key = Some(parse_key(value, "PublicKey")?);
                        }
                        "presharedkey" => {
                            peer.preshared_key = Some(parse_key(value, "PresharedKey")?);
                        }
                        "endpoint" => {
                            peer.endpoint = Some(parse_endpoint(value)?);
                        }
                        "allowedips" => {
                            peer.allowed_ips.extend(parse_cidr_list(value)?);
                        }
                        "persistentkeepalive" => {
                            peer.persistent_keepalive =
                                parse_keepalive(value, line_num, "PersistentKeepalive")?;
                        }
                        _ => {
                            tracing::debug!("Unknown peer key: {}", key);
                        }
                    }
                }
                None => {
                    return Err(ConfigError::ParseError {
                        line: line_num,
                        message: "Configuration value outside of any section".to_string(),
                    });
                }
            }
        }

        if let Some(peer) = current_peer.take() {
            peers.push(peer.build()?);
        }

        let interface = interface.ok_or(ConfigError::MissingField {
            field: "[Interface] section".to_string(),
        })?;

        let config = WireGuardConfig { interface, peers };
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations no engine could bring up
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.interface.private_key == [0u8; 32] {
            return Err(ConfigError::MissingField {
                field: "PrivateKey".to_string(),
            });
        }
        Ok(())
    }

    /// Get our public key derived from the private key
    pub fn public_key(&self) -> [u8; 32] {
        crate::crypto::x25519::public_key(&self.interface.private_key)
    }

    /// Effective MTU for the tunnel interface
    pub fn mtu(&self) -> u16 {
        self.interface.mtu.unwrap_or(DEFAULT_MTU)
    }
}

impl InterfaceConfig {
    pub(crate) fn empty() -> Self {
        Self {
            private_key: [0u8; 32],
            address: Vec::new(),
            dns: Vec::new(),
            listen_port: None,
            mtu: None,
            fwmark: None,
        }
    }
}

/// Section type during parsing
#[derive(Clone, Copy)]
enum Section {
    Interface,
    Peer,
}

/// Builder for PeerConfig during parsing
#[derive(Default)]
pub(crate) struct PeerBuilder {
    pub(crate) public_key: Option<[u8; 32]>,
    pub(crate) preshared_key: Option<[u8; 32]>,
    pub(crate) endpoint: Option<SocketAddr>,
    pub(crate) allowed_ips: Vec<IpNet>,
    pub(crate) persistent_keepalive: Option<u16>,
}

impl PeerBuilder {
    pub(crate) fn build(self) -> Result<PeerConfig, ConfigError> {
        let public_key = self.public_key.ok_or(ConfigError::MissingField {
            field: "PublicKey in [Peer]".to_string(),
        })?;

        Ok(PeerConfig {
            public_key,
            preshared_key: self.preshared_key,
            endpoint: self.endpoint,
            allowed_ips: self.allowed_ips,
            persistent_keepalive: self.persistent_keepalive,
        })
    }
}

/// Parse a base64-encoded 32-byte key
fn parse_key(value: &str, field_name: &str) -> Result<[u8; 32], ConfigError> {
    let bytes = BASE64.decode(value).map_err(|_| ConfigError::InvalidKey {
        field: field_name.to_string(),
    })?;

    bytes.try_into().map_err(|_| ConfigError::InvalidKey {
        field: field_name.to_string(),
    })
}

/// Parse a comma separated list of CIDR ranges
pub(crate) fn parse_cidr_list(value: &str) -> Result<Vec<IpNet>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<IpNet>().map_err(|_| ConfigError::InvalidCidr {
                value: s.to_string(),
            })
        })
        .collect()
}

fn parse_number<T: std::str::FromStr>(
    value: &str,
    line: usize,
    field_name: &str,
) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::ParseError {
        line,
        message: format!("Invalid {}: {}", field_name, value),
    })
}

/// Keepalive of 0 (or "off") disables it
pub(crate) fn parse_keepalive(
    value: &str,
    line: usize,
    field_name: &str,
) -> Result<Option<u16>, ConfigError> {
    if value.eq_ignore_ascii_case("off") {
        return Ok(None);
    }
    let secs: u16 = parse_number(value, line, field_name)?;
    Ok((secs > 0).then_some(secs))
}

/// Parse an endpoint (ip:port, IPv6 in brackets)
pub(crate) fn parse_endpoint(value: &str) -> Result<SocketAddr, ConfigError> {
    // Hostnames are resolved by the host before the settings reach us
    value.parse::<SocketAddr>().map_err(|_| ConfigError::InvalidAddress {
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const TEST_CONFIG: &str = r#"
[Interface]
PrivateKey = UOvtcWdILFwjb1UnsnK+a9lcqYvNTmtPv+fvqIVOz3w=
Address = 10.0.0.2/24, fd00::2/64
DNS = 8.8.8.8

[Peer]
PublicKey = YgkBjKXER5YarD8STsvMFURw/5nhCLIFOJ5uKWrrMW4=
AllowedIPs = 10.0.0.0/24, 0.0.0.0/0
Endpoint = 13.239.46.151:51820
PersistentKeepalive = 25
"#;

    #[test]
    fn test_parse_config() {
        let config = WireGuardConfig::parse(TEST_CONFIG).unwrap();

        assert_eq!(config.interface.address.len(), 2);
        assert_eq!(config.interface.address[0].to_string(), "10.0.0.2/24");
        assert_eq!(config.interface.address[1].to_string(), "fd00::2/64");
        assert_eq!(config.interface.dns.len(), 1);
        assert_eq!(config.interface.dns[0].to_string(), "8.8.8.8");
        assert_eq!(config.mtu(), DEFAULT_MTU);

        assert_eq!(config.peers.len(), 1);
        let peer = &config.peers[0];
        assert_eq!(peer.endpoint.unwrap().to_string(), "13.239.46.151:51820");
        assert_eq!(peer.persistent_keepalive, Some(25));
        assert_eq!(peer.allowed_ips.len(), 2);
    }

    #[test]
    fn test_settings_detects_ini() {
        let config = WireGuardConfig::parse_settings(TEST_CONFIG).unwrap();
        assert_eq!(config.peers.len(), 1);
    }

    #[test]
    fn test_settings_without_address() {
        // Packet-tunnel hosts assign addresses themselves
        let settings = "[Interface]\nPrivateKey=UOvtcWdILFwjb1UnsnK+a9lcqYvNTmtPv+fvqIVOz3w=\n\
                        [Peer]\nPublicKey=YgkBjKXER5YarD8STsvMFURw/5nhCLIFOJ5uKWrrMW4=\n\
                        Endpoint=1.2.3.4:51820\n";
        let config = WireGuardConfig::parse_settings(settings).unwrap();
        assert!(config.interface.address.is_empty());
        assert_eq!(
            config.peers[0].endpoint.unwrap().to_string(),
            "1.2.3.4:51820"
        );
    }

    #[test]
    fn test_empty_settings() {
        assert!(WireGuardConfig::parse_settings("").is_err());
        assert!(WireGuardConfig::parse_settings("# only a comment\n").is_err());
    }

    #[test]
    fn test_parse_key() {
        let key_b64 = "UOvtcWdILFwjb1UnsnK+a9lcqYvNTmtPv+fvqIVOz3w=";
        let key = parse_key(key_b64, "TestKey").unwrap();
        assert_eq!(key.len(), 32);
    }

    #[test]
    fn test_invalid_key() {
        let result = parse_key("invalid-base64!", "TestKey");
        assert!(result.is_err());

        let result = parse_key("dG9vIHNob3J0", "TestKey"); // "too short" in base64
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_interface() {
        let config = "[Peer]\nPublicKey = YgkBjKXER5YarD8STsvMFURw/5nhCLIFOJ5uKWrrMW4=\n";
        let result = WireGuardConfig::parse(config);
        assert!(matches!(result, Err(ConfigError::MissingField { .. })));
    }

    #[test]
    fn test_missing_private_key() {
        let config = "[Interface]\nAddress = 10.0.0.2/24\n";
        let result = WireGuardConfig::parse(config);
        assert!(result.is_err());
    }

    #[test]
    fn test_peer_without_public_key() {
        let config = "[Interface]\nPrivateKey = UOvtcWdILFwjb1UnsnK+a9lcqYvNTmtPv+fvqIVOz3w=\n\
                      [Peer]\nEndpoint = 1.2.3.4:51820\n";
        assert!(WireGuardConfig::parse(config).is_err());
    }

    #[test]
    fn test_unknown_section_and_bad_line() {
        let config = "[Interface]\nPrivateKey = UOvtcWdILFwjb1UnsnK+a9lcqYvNTmtPv+fvqIVOz3w=\n[Bogus]\n";
        assert!(matches!(
            WireGuardConfig::parse(config),
            Err(ConfigError::ParseError { line: 3, .. })
        ));

        let config = "[Interface]\nPrivateKey\n";
        assert!(matches!(
            WireGuardConfig::parse(config),
            Err(ConfigError::ParseError { line: 2, .. })
        ));
    }

    #[test]
    fn test_hostname_endpoint_rejected() {
        assert!(parse_endpoint("vpn.example.com:51820").is_err());
        assert!(parse_endpoint("[fd00::1]:51820").is_ok());
    }

    #[test]
    fn test_keepalive_off() {
        assert_eq!(parse_keepalive("0", 1, "PersistentKeepalive").unwrap(), None);
        assert_eq!(parse_keepalive("off", 1, "PersistentKeepalive").unwrap(), None);
        assert_eq!(parse_keepalive("15", 1, "PersistentKeepalive").unwrap(), Some(15));
    }

    #[test]
    fn test_from_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(TEST_CONFIG.as_bytes()).unwrap();
        temp_file.flush().unwrap();

        let config = WireGuardConfig::from_file(temp_file.path()).unwrap();
        assert_eq!(config.peers.len(), 1);

        let missing = WireGuardConfig::from_file("/nonexistent/minnow.conf");
        assert!(matches!(missing, Err(ConfigError::FileNotFound { .. })));
    }
}

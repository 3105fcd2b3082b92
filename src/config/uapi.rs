//! wireguard-go UAPI settings
//!
//! The UAPI "set" grammar is a flat list of `key=value` lines. Interface keys
//! come first; every `public_key` line opens a new peer. Keys are lowercase
//! hex. Address, DNS and MTU are not part of this grammar.

use std::fmt::Write as _;

use crate::config::parser::{parse_cidr_list, parse_endpoint, parse_keepalive, PeerBuilder};
use crate::config::{InterfaceConfig, WireGuardConfig};
use crate::error::ConfigError;

impl WireGuardConfig {
    /// Parse a UAPI settings string
    pub fn parse_uapi(content: &str) -> Result<Self, ConfigError> {
        let mut interface = InterfaceConfig::empty();
        let mut peers = Vec::new();
        let mut current_peer: Option<PeerBuilder> = None;

        for (line_num, line) in content.lines().enumerate() {
            let line_num = line_num + 1;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::ParseError {
                    line: line_num,
                    message: format!("Expected 'key=value', got: {}", line),
                });
            };

            if key == "public_key" {
                if let Some(peer) = current_peer.take() {
                    peers.push(peer.build()?);
                }
                current_peer = Some(PeerBuilder {
                    public_key: Some(parse_hex_key(value, "public_key")?),
                    ..PeerBuilder::default()
                });
                continue;
            }

            match current_peer.as_mut() {
                None => match key {
                    "private_key" => {
                        interface.private_key = parse_hex_key(value, "private_key")?;
                    }
                    "listen_port" => {
                        let port: u16 = parse_value(value, line_num, key)?;
                        interface.listen_port = (port != 0).then_some(port);
                    }
                    "fwmark" => {
                        let mark: u32 = parse_value(value, line_num, key)?;
                        interface.fwmark = (mark != 0).then_some(mark);
                    }
                    "replace_peers" => expect_true(value, line_num, key)?,
                    _ => return Err(unsupported(key, line_num)),
                },
                Some(peer) => match key {
                    "preshared_key" => {
                        let psk = parse_hex_key(value, "preshared_key")?;
                        peer.preshared_key = (psk != [0u8; 32]).then_some(psk);
                    }
                    "endpoint" => {
                        peer.endpoint = Some(parse_endpoint(value)?);
                    }
                    "persistent_keepalive_interval" => {
                        peer.persistent_keepalive = parse_keepalive(value, line_num, key)?;
                    }
                    "replace_allowed_ips" => expect_true(value, line_num, key)?,
                    "allowed_ip" => {
                        peer.allowed_ips.extend(parse_cidr_list(value)?);
                    }
                    "protocol_version" => {
                        if value != "1" {
                            return Err(ConfigError::ParseError {
                                line: line_num,
                                message: format!("Unsupported protocol_version: {}", value),
                            });
                        }
                    }
                    _ => return Err(unsupported(key, line_num)),
                },
            }
        }

        if let Some(peer) = current_peer.take() {
            peers.push(peer.build()?);
        }

        let config = WireGuardConfig { interface, peers };
        config.validate()?;
        Ok(config)
    }

    /// Render the configuration as a UAPI "set" body.
    ///
    /// Interface addresses, DNS and MTU have no UAPI form and are omitted.
    pub fn to_uapi(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "private_key={}", hex::encode(self.interface.private_key));
        if let Some(port) = self.interface.listen_port {
            let _ = writeln!(out, "listen_port={}", port);
        }
        if let Some(mark) = self.interface.fwmark {
            let _ = writeln!(out, "fwmark={}", mark);
        }
        out.push_str("replace_peers=true\n");

        for peer in &self.peers {
            let _ = writeln!(out, "public_key={}", hex::encode(peer.public_key));
            if let Some(psk) = peer.preshared_key {
                let _ = writeln!(out, "preshared_key={}", hex::encode(psk));
            }
            if let Some(endpoint) = peer.endpoint {
                let _ = writeln!(out, "endpoint={}", endpoint);
            }
            if let Some(keepalive) = peer.persistent_keepalive {
                let _ = writeln!(out, "persistent_keepalive_interval={}", keepalive);
            }
            out.push_str("replace_allowed_ips=true\n");
            for allowed in &peer.allowed_ips {
                let _ = writeln!(out, "allowed_ip={}", allowed);
            }
        }

        out
    }
}

fn parse_hex_key(value: &str, field_name: &str) -> Result<[u8; 32], ConfigError> {
    let mut key = [0u8; 32];
    hex::decode_to_slice(value, &mut key).map_err(|_| ConfigError::InvalidKey {
        field: field_name.to_string(),
    })?;
    Ok(key)
}

fn parse_value<T: std::str::FromStr>(
    value: &str,
    line: usize,
    key: &str,
) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::ParseError {
        line,
        message: format!("Invalid {}: {}", key, value),
    })
}

fn expect_true(value: &str, line: usize, key: &str) -> Result<(), ConfigError> {
    if value == "true" {
        Ok(())
    } else {
        Err(ConfigError::ParseError {
            line,
            message: format!("{} only accepts 'true', got: {}", key, value),
        })
    }
}

fn unsupported(key: &str, line: usize) -> ConfigError {
    ConfigError::ParseError {
        line,
        message: format!("Unsupported key: {}", key),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRIVATE_HEX: &str = "50ebed7167482c5c236f5527b272be6bd95ca98bcd4e6b4fbfe7efa8854ecf7c";
    const PEER_HEX: &str = "6209018ca5c447961aac3f124ecbcc154470ff99e108b205389e6e296aeb316e";

    fn peer_hex() -> String {
        PEER_HEX.to_string()
    }

    fn uapi_settings() -> String {
        format!(
            "private_key={}\nlisten_port=51820\nreplace_peers=true\n\
             public_key={}\nendpoint=1.2.3.4:51820\npersistent_keepalive_interval=25\n\
             replace_allowed_ips=true\nallowed_ip=0.0.0.0/0\nallowed_ip=::/0\nprotocol_version=1\n",
            PRIVATE_HEX,
            peer_hex()
        )
    }

    #[test]
    fn test_parse_uapi() {
        let config = WireGuardConfig::parse_uapi(&uapi_settings()).unwrap();
        assert_eq!(hex::encode(config.interface.private_key), PRIVATE_HEX);
        assert_eq!(config.interface.listen_port, Some(51820));
        assert_eq!(config.peers.len(), 1);

        let peer = &config.peers[0];
        assert_eq!(hex::encode(peer.public_key), peer_hex());
        assert_eq!(peer.endpoint.unwrap().to_string(), "1.2.3.4:51820");
        assert_eq!(peer.persistent_keepalive, Some(25));
        assert_eq!(peer.allowed_ips.len(), 2);
        assert_eq!(peer.preshared_key, None);
    }

    #[test]
    fn test_settings_detects_uapi() {
        let config = WireGuardConfig::parse_settings(&uapi_settings()).unwrap();
        assert_eq!(config.peers.len(), 1);
    }

    #[test]
    fn test_zero_preshared_key_means_none() {
        let settings = format!(
            "private_key={}\npublic_key={}\npreshared_key={}\n",
            PRIVATE_HEX,
            peer_hex(),
            "00".repeat(32)
        );
        let config = WireGuardConfig::parse_uapi(&settings).unwrap();
        assert_eq!(config.peers[0].preshared_key, None);
    }

    #[test]
    fn test_uapi_rejects_unknown_key() {
        let settings = format!("private_key={}\nbogus=1\n", PRIVATE_HEX);
        assert!(matches!(
            WireGuardConfig::parse_uapi(&settings),
            Err(ConfigError::ParseError { line: 2, .. })
        ));
    }

    #[test]
    fn test_uapi_rejects_bad_hex_and_protocol() {
        assert!(matches!(
            WireGuardConfig::parse_uapi("private_key=abcd\n"),
            Err(ConfigError::InvalidKey { .. })
        ));

        let settings = format!(
            "private_key={}\npublic_key={}\nprotocol_version=2\n",
            PRIVATE_HEX,
            peer_hex()
        );
        assert!(WireGuardConfig::parse_uapi(&settings).is_err());
    }

    #[test]
    fn test_uapi_requires_private_key() {
        let settings = format!("public_key={}\n", peer_hex());
        assert!(matches!(
            WireGuardConfig::parse_uapi(&settings),
            Err(ConfigError::MissingField { .. })
        ));
    }

    #[test]
    fn test_ini_settings_render_as_uapi() {
        let ini = "[Interface]\nPrivateKey = UOvtcWdILFwjb1UnsnK+a9lcqYvNTmtPv+fvqIVOz3w=\n\
                   Address = 10.0.0.2/24\n\
                   [Peer]\nPublicKey = YgkBjKXER5YarD8STsvMFURw/5nhCLIFOJ5uKWrrMW4=\n\
                   AllowedIPs = 10.0.0.0/24\nEndpoint = 1.2.3.4:51820\n";
        let config = WireGuardConfig::parse(ini).unwrap();
        let uapi = config.to_uapi();

        assert!(uapi.starts_with(&format!("private_key={}\n", PRIVATE_HEX)));
        assert!(uapi.contains("replace_peers=true\n"));
        assert!(uapi.contains(&format!("public_key={}\n", peer_hex())));
        assert!(uapi.contains("allowed_ip=10.0.0.0/24\n"));

        // Everything except the address survives the trip
        let reparsed = WireGuardConfig::parse_uapi(&uapi).unwrap();
        assert_eq!(reparsed.peers, config.peers);
        assert_eq!(reparsed.interface.private_key, config.interface.private_key);
        assert!(reparsed.interface.address.is_empty());
    }
}

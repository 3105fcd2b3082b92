//! TUN device packet flow
//!
//! Lets the controller run against a real virtual interface instead of a
//! host-provided channel. Uses tun-rs for macOS (utun), Linux (/dev/net/tun)
//! and Windows (Wintun).

use std::net::Ipv4Addr;
use std::ops::Deref;

use async_trait::async_trait;
use tun_rs::{AsyncDevice, DeviceBuilder};

use crate::error::ChannelError;
use crate::flow::{IpFamily, PacketFlow};

/// Room for a packet-information header some platforms prepend
const READ_HEADROOM: usize = 64;

/// A [`PacketFlow`] backed by a TUN device
pub struct TunPacketFlow {
    device: AsyncDevice,
    name: String,
    mtu: u16,
}

impl TunPacketFlow {
    /// Create a TUN device addressed `address/prefix_len`
    pub fn create(address: Ipv4Addr, prefix_len: u8, mtu: u16) -> Result<Self, ChannelError> {
        check_privileges()?;

        #[cfg(target_os = "windows")]
        let builder = DeviceBuilder::new().name("MinnowVPN");
        #[cfg(not(target_os = "windows"))]
        let builder = DeviceBuilder::new();

        let device = builder
            .ipv4(address, prefix_len, None)
            .mtu(mtu)
            .build_async()
            .map_err(|e| ChannelError::CreateFailed {
                reason: e.to_string(),
            })?;

        let name = device.deref().name().map_err(|e| ChannelError::CreateFailed {
            reason: format!("Failed to get device name: {}", e),
        })?;

        tracing::info!("Created TUN device: {} with address {}/{}", name, address, prefix_len);

        Ok(Self { device, name, mtu })
    }

    /// Device name chosen by the OS (e.g. "utun5", "tun0")
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mtu(&self) -> u16 {
        self.mtu
    }
}

#[async_trait]
impl PacketFlow for TunPacketFlow {
    async fn read_packet(&self) -> Result<Vec<u8>, ChannelError> {
        let mut buf = vec![0u8; read_buffer_len(self.mtu)];
        let n = self
            .device
            .recv(&mut buf)
            .await
            .map_err(|e| ChannelError::ReadFailed {
                reason: e.to_string(),
            })?;
        buf.truncate(n);
        Ok(buf)
    }

    async fn write_packet(&self, packet: &[u8], family: IpFamily) -> Result<(), ChannelError> {
        tracing::trace!("Writing {} byte {:?} packet to {}", packet.len(), family, self.name);
        self.device
            .send(packet)
            .await
            .map(|_| ())
            .map_err(|e| ChannelError::WriteFailed {
                reason: e.to_string(),
            })
    }
}

fn read_buffer_len(mtu: u16) -> usize {
    usize::from(mtu) + READ_HEADROOM
}

/// Check for required privileges to create TUN devices
fn check_privileges() -> Result<(), ChannelError> {
    #[cfg(unix)]
    {
        // Root or CAP_NET_ADMIN
        if unsafe { libc::geteuid() } != 0 {
            #[cfg(target_os = "linux")]
            {
                // Capabilities are not inspected; creation fails clearly without them
                tracing::warn!("Running without root. TUN creation may fail.");
                tracing::warn!("Either run with sudo or grant CAP_NET_ADMIN:");
                tracing::warn!("  sudo setcap cap_net_admin=eip ./minnowvpn-extension");
            }

            #[cfg(target_os = "macos")]
            {
                return Err(ChannelError::InsufficientPrivileges {
                    message: "Root privileges required on macOS. Run with sudo.".to_string(),
                });
            }
        }
    }

    #[cfg(target_os = "windows")]
    {
        if !is_elevated_windows() {
            return Err(ChannelError::InsufficientPrivileges {
                message: "Administrator privileges required on Windows.".to_string(),
            });
        }
    }

    Ok(())
}

/// Check if running as Administrator on Windows
#[cfg(target_os = "windows")]
fn is_elevated_windows() -> bool {
    use std::mem::MaybeUninit;
    use std::ptr::null_mut;

    use winapi::um::handleapi::CloseHandle;
    use winapi::um::processthreadsapi::{GetCurrentProcess, OpenProcessToken};
    use winapi::um::securitybaseapi::GetTokenInformation;
    use winapi::um::winnt::{TokenElevation, HANDLE, TOKEN_ELEVATION, TOKEN_QUERY};

    unsafe {
        let mut token: HANDLE = null_mut();
        if OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut token) == 0 {
            return false;
        }

        let mut elevation: MaybeUninit<TOKEN_ELEVATION> = MaybeUninit::uninit();
        let mut size: u32 = std::mem::size_of::<TOKEN_ELEVATION>() as u32;

        let result = GetTokenInformation(
            token,
            TokenElevation,
            elevation.as_mut_ptr() as *mut _,
            size,
            &mut size,
        );

        CloseHandle(token);

        if result == 0 {
            return false;
        }

        elevation.assume_init().TokenIsElevated != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_buffer_fits_mtu() {
        assert!(read_buffer_len(1420) > 1420);
        assert_eq!(read_buffer_len(0), READ_HEADROOM);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_privilege_check_only_warns_on_linux() {
        assert!(check_privileges().is_ok());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_create_reports_channel_errors() {
        // Unprivileged sandboxes cannot open /dev/net/tun
        match TunPacketFlow::create(Ipv4Addr::new(10, 99, 0, 2), 24, 1420) {
            Ok(flow) => {
                assert!(!flow.name().is_empty());
                assert_eq!(flow.mtu(), 1420);
            }
            Err(ChannelError::CreateFailed { reason }) => assert!(!reason.is_empty()),
            Err(other) => panic!("unexpected error: {}", other),
        }
    }
}

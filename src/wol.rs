//! Wake-on-LAN magic packets
//!
//! A magic packet is 6 bytes of `0xFF` followed by the target hardware
//! address repeated 16 times. It is sent as a single UDP datagram; there is
//! no reply protocol, so delivery is fire-and-forget.

use crate::error::{MacParseError, WakeError};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::debug;

/// Port conventionally used for wake-on-LAN (discard)
pub const DEFAULT_WAKE_PORT: u16 = 9;

/// Length of a magic packet in bytes
pub const MAGIC_PACKET_LEN: usize = 6 + 6 * 16;

/// A 6-byte network interface hardware address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HardwareAddress([u8; 6]);

impl HardwareAddress {
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl FromStr for HardwareAddress {
    type Err = MacParseError;

    /// Accepts `aa:bb:cc:dd:ee:ff`, `aa-bb-cc-dd-ee-ff` and `aabb.ccdd.eeff`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || MacParseError(s.to_string());

        let (separator, width) = if s.contains(':') {
            (':', 2)
        } else if s.contains('-') {
            ('-', 2)
        } else if s.contains('.') {
            ('.', 4)
        } else {
            return Err(invalid());
        };

        let groups: Vec<&str> = s.split(separator).collect();
        if groups.len() * width != 12 {
            return Err(invalid());
        }

        let mut bytes = Vec::with_capacity(6);
        for group in groups {
            if group.len() != width {
                return Err(invalid());
            }
            bytes.extend(hex::decode(group).map_err(|_| invalid())?);
        }

        let octets: [u8; 6] = bytes.try_into().map_err(|_| invalid())?;
        Ok(Self(octets))
    }
}

impl fmt::Display for HardwareAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

/// The 102-byte wake-on-LAN payload for one hardware address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagicPacket([u8; MAGIC_PACKET_LEN]);

impl MagicPacket {
    pub fn new(mac: &HardwareAddress) -> Self {
        let mut packet = [0xFF; MAGIC_PACKET_LEN];
        for chunk in packet[6..].chunks_exact_mut(6) {
            chunk.copy_from_slice(&mac.0);
        }
        Self(packet)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Send a magic packet for `mac` to `target` in a single datagram.
///
/// The socket lives only for the duration of this call and is closed on
/// every return path. Returns the number of bytes written.
pub async fn send_magic_packet(target: SocketAddr, mac: &HardwareAddress) -> Result<usize, WakeError> {
    let packet = MagicPacket::new(mac);

    let local: SocketAddr = match target.ip() {
        IpAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        IpAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };

    let dial = |source: std::io::Error| WakeError::Dial { addr: target, source };
    let socket = UdpSocket::bind(local).await.map_err(dial)?;
    if target.is_ipv4() {
        // Allows a subnet broadcast address as the wake hostname
        socket.set_broadcast(true).map_err(dial)?;
    }
    socket.connect(target).await.map_err(dial)?;

    let written = socket
        .send(packet.as_bytes())
        .await
        .map_err(|source| WakeError::Write { addr: target, source })?;

    if written != MAGIC_PACKET_LEN {
        return Err(WakeError::ShortWrite {
            addr: target,
            written,
            expected: MAGIC_PACKET_LEN,
        });
    }

    debug!(target = %target, mac = %mac, "Magic packet sent");
    Ok(written)
}

/// [`send_magic_packet`] bounded by `timeout`
pub async fn wake(target: SocketAddr, mac: &HardwareAddress, timeout: Duration) -> Result<usize, WakeError> {
    match tokio::time::timeout(timeout, send_magic_packet(target, mac)).await {
        Ok(result) => result,
        Err(_) => Err(WakeError::TimedOut { addr: target, timeout }),
    }
}

//! A listening bucket: a (game-socket, ping-socket) pair with accept policy (§3).

use std::net::UdpSocket;

use crate::config::ListenerConfig;
use crate::error::{Result, ZoneError};

/// One `Listen`/`Listen1`/... bucket. The ping socket always binds to `game socket port + 1`.
pub struct Listener {
    pub config: ListenerConfig,
    pub game_socket: UdpSocket,
    pub ping_socket: UdpSocket,
}

impl Listener {
    pub fn bind(config: ListenerConfig) -> Result<Self> {
        let game_addr = (config.bind_address, config.port);
        let game_socket = UdpSocket::bind(game_addr).map_err(|source| ZoneError::ListenerBind {
            addr: std::net::SocketAddr::from(game_addr),
            source,
        })?;
        game_socket.set_nonblocking(true).ok();

        let ping_addr = (config.bind_address, config.ping_port());
        let ping_socket = UdpSocket::bind(ping_addr).map_err(|source| ZoneError::ListenerBind {
            addr: std::net::SocketAddr::from(ping_addr),
            source,
        })?;
        ping_socket.set_nonblocking(true).ok();

        Ok(Self { config, game_socket, ping_socket })
    }

    pub fn accepts(&self, client_kind_byte: u8) -> bool {
        match client_kind_byte {
            0x01 => self.config.allow_vie,
            0x11 => self.config.allow_cont,
            _ => false,
        }
    }
}

/// Answers one ping-protocol datagram (§6): 4 bytes of opaque client timestamp in, 8 bytes
/// (`population:4 LE`, `echoed timestamp:4`) out.
pub fn build_ping_reply(population: u32, echoed_timestamp: &[u8; 4]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[0..4].copy_from_slice(&population.to_le_bytes());
    out[4..8].copy_from_slice(echoed_timestamp);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_reply_echoes_timestamp_and_encodes_population() {
        let reply = build_ping_reply(7, &[1, 2, 3, 4]);
        assert_eq!(&reply[0..4], &7u32.to_le_bytes());
        assert_eq!(&reply[4..8], &[1, 2, 3, 4]);
    }
}

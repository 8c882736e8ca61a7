//! A minimal zone server that accepts connections, logs players in with a trivial
//! always-succeed authenticator, and echoes the contents of every registered payload it
//! receives back to the sender. Analogous in spirit to a protocol echo demo, wired through the
//! full connect -> login -> playing path instead of a single request/response loop.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use ss_zone_core::bandwidth::Priority;
use ss_zone_core::collab::{AuthCode, AuthResult, Authentication};
use ss_zone_core::config::{BandwidthConfig, Config, ListenerConfig, NetConfig};
use ss_zone_core::player::PlayerId;
use ss_zone_core::transport::handlers::PacketHandler;
use ss_zone_core::Zone;

struct AllowAll;

impl Authentication for AllowAll {
    fn authenticate(&self, _player: PlayerId, login_payload: &[u8], done_cb: Box<dyn FnOnce(AuthResult) + Send>) {
        let name = String::from_utf8_lossy(login_payload).trim().to_string();
        let name = if name.is_empty() { "Guest".to_string() } else { name };
        done_cb(AuthResult::success(AuthCode::Ok, name, String::new()));
    }
}

const ECHO_TYPE_BYTE: u8 = 0x02;

struct EchoHandler {
    zone: std::sync::Weak<Zone>,
}

impl PacketHandler for EchoHandler {
    fn handle(&self, player: PlayerId, payload: &[u8]) {
        if let Some(zone) = self.zone.upgrade() {
            let mut wire = Vec::with_capacity(payload.len() + 1);
            wire.push(ECHO_TYPE_BYTE);
            wire.extend_from_slice(payload);
            zone.transport.submit(player, Priority::Unreliable, false, false, &wire);
        }
    }
}

fn main() {
    env_logger::init();

    let config = Config {
        net: NetConfig::default(),
        bandwidth: BandwidthConfig::default(),
        listeners: vec![ListenerConfig {
            bind_address: "0.0.0.0".parse::<IpAddr>().unwrap(),
            port: 5000,
            allow_vie: true,
            allow_cont: true,
            connect_as: "default".to_string(),
        }],
    };

    let zone = Zone::new(config, Arc::new(AllowAll)).expect("failed to start zone server");

    zone.transport
        .register_type_handler(ECHO_TYPE_BYTE, Box::new(EchoHandler { zone: Arc::downgrade(&zone) }))
        .expect("echo handler registered exactly once");

    log::info!("zone server listening on 0.0.0.0:5000");

    loop {
        std::thread::sleep(Duration::from_secs(60));
    }
}

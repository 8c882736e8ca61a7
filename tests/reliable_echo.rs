use std::net::UdpSocket;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use ss_zone_core::bandwidth::Priority;
use ss_zone_core::collab::{AuthCode, AuthResult, Authentication};
use ss_zone_core::config::{BandwidthConfig, Config, ListenerConfig, NetConfig};
use ss_zone_core::player::PlayerId;
use ss_zone_core::transport::frame::CoreFrame;
use ss_zone_core::transport::handlers::PacketHandler;
use ss_zone_core::zone::LOGIN_TYPE_BYTE;
use ss_zone_core::Zone;

static STEP_INTERVAL: Duration = Duration::from_millis(20);
static TIMEOUT: Duration = Duration::from_secs(2);

const ECHO_TYPE_BYTE: u8 = 0x02;

struct AllowAll;

impl Authentication for AllowAll {
    fn authenticate(&self, _player: PlayerId, _login_payload: &[u8], done_cb: Box<dyn FnOnce(AuthResult) + Send>) {
        done_cb(AuthResult::success(AuthCode::Ok, "Tester".into(), String::new()));
    }
}

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

fn start_zone(port: u16) -> Arc<Zone> {
    let config = Config {
        net: NetConfig::default(),
        bandwidth: BandwidthConfig::default(),
        listeners: vec![ListenerConfig {
            bind_address: "127.0.0.1".parse().unwrap(),
            port,
            allow_vie: true,
            allow_cont: true,
            connect_as: "default".to_string(),
        }],
    };
    let zone = Zone::new(config, Arc::new(AllowAll)).expect("zone should bind");
    zone.transport
        .register_type_handler(ECHO_TYPE_BYTE, Box::new(EchoHandler { zone: Arc::downgrade(&zone) }))
        .expect("echo handler registered exactly once");
    zone
}

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(STEP_INTERVAL);
    }
    false
}

#[test]
fn reliable_payload_is_acked_and_dispatched_to_the_registered_handler() {
    let zone = start_zone(34502);
    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    client.set_read_timeout(Some(TIMEOUT)).unwrap();
    let server: std::net::SocketAddr = "127.0.0.1:34502".parse().unwrap();

    // Handshake first, so the datagram below is attributed to a known player.
    let key_init = CoreFrame::KeyInit { key: 0, client_kind: 0x01, continuum: false }.write();
    client.send_to(&key_init, server).unwrap();
    let mut buf = [0u8; 64];
    let (len, _) = client.recv_from(&mut buf).expect("expected a key response");
    assert!(matches!(CoreFrame::parse(&buf[..len], 0), Some(CoreFrame::KeyResponse { .. })));

    // Send an echo-type payload wrapped in a reliable envelope at sequence 0.
    let mut inner = vec![ECHO_TYPE_BYTE];
    inner.extend_from_slice(b"ping");
    let reliable = CoreFrame::Reliable { seq: 0, payload: inner.into_boxed_slice() }.write();
    client.send_to(&reliable, server).unwrap();

    // First datagram back should be the Ack for sequence 0.
    let (len, _) = client.recv_from(&mut buf).expect("expected an ack");
    assert_eq!(CoreFrame::parse(&buf[..len], 0), Some(CoreFrame::Ack { seq: 0 }));

    // Second datagram back should be the echoed payload, unwrapped (unreliable, no envelope).
    let (len, _) = client.recv_from(&mut buf).expect("expected the echoed payload");
    assert_eq!(&buf[..len], [&[ECHO_TYPE_BYTE][..], b"ping"].concat().as_slice());

    assert!(wait_until(|| zone.players.len() == 1));
    zone.shutdown();
}

#[test]
fn login_writes_authenticated_name_onto_the_player_record() {
    let zone = start_zone(34505);
    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    client.set_read_timeout(Some(TIMEOUT)).unwrap();
    let server: std::net::SocketAddr = "127.0.0.1:34505".parse().unwrap();

    let key_init = CoreFrame::KeyInit { key: 0, client_kind: 0x01, continuum: false }.write();
    client.send_to(&key_init, server).unwrap();
    let mut buf = [0u8; 64];
    let (len, _) = client.recv_from(&mut buf).expect("expected a key response");
    assert!(matches!(CoreFrame::parse(&buf[..len], 0), Some(CoreFrame::KeyResponse { .. })));

    let mut inner = vec![LOGIN_TYPE_BYTE];
    inner.extend_from_slice(b"whatever");
    let reliable = CoreFrame::Reliable { seq: 0, payload: inner.into_boxed_slice() }.write();
    client.send_to(&reliable, server).unwrap();

    let (len, _) = client.recv_from(&mut buf).expect("expected an ack for the login packet");
    assert_eq!(CoreFrame::parse(&buf[..len], 0), Some(CoreFrame::Ack { seq: 0 }));

    assert!(wait_until(|| zone.players.len() == 1));
    let player = zone.players.iter()[0].clone();
    assert!(wait_until(|| player.name() == "Tester"));
    assert_eq!(player.squad(), "");

    zone.shutdown();
}

#[test]
fn ping_socket_echoes_timestamp_and_reports_population() {
    let zone = start_zone(34503);
    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    client.set_read_timeout(Some(TIMEOUT)).unwrap();

    let mut buf = [0u8; 16];
    client.send_to(&[9, 9, 9, 9], "127.0.0.1:34504").unwrap();
    let (len, _) = client.recv_from(&mut buf).expect("expected a ping reply");
    assert_eq!(len, 8);
    assert_eq!(&buf[0..4], &0u32.to_le_bytes(), "no players connected yet");
    assert_eq!(&buf[4..8], &[9, 9, 9, 9]);

    zone.shutdown();
}

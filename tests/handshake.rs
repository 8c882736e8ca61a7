use std::net::UdpSocket;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use ss_zone_core::collab::{AuthCode, AuthResult, Authentication};
use ss_zone_core::config::{BandwidthConfig, Config, ListenerConfig, NetConfig};
use ss_zone_core::player::PlayerId;
use ss_zone_core::transport::frame::CoreFrame;
use ss_zone_core::Zone;

static STEP_INTERVAL: Duration = Duration::from_millis(20);
static TIMEOUT: Duration = Duration::from_secs(2);

struct AllowAll;

impl Authentication for AllowAll {
    fn authenticate(&self, _player: PlayerId, _login_payload: &[u8], done_cb: Box<dyn FnOnce(AuthResult) + Send>) {
        done_cb(AuthResult::success(AuthCode::Ok, "Tester".into(), String::new()));
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
    Zone::new(config, Arc::new(AllowAll)).expect("zone should bind")
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
fn key_init_registers_a_player_and_receives_a_key_response() {
    let zone = start_zone(34500);
    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    client.set_read_timeout(Some(TIMEOUT)).unwrap();

    let key_init = CoreFrame::KeyInit { key: 0, client_kind: 0x01, continuum: false }.write();
    client.send_to(&key_init, "127.0.0.1:34500").unwrap();

    let mut buf = [0u8; 64];
    let (len, _addr) = client.recv_from(&mut buf).expect("expected a key response datagram");
    let reply = CoreFrame::parse(&buf[..len], 0).expect("reply should parse as a core frame");
    assert!(matches!(reply, CoreFrame::KeyResponse { continuum: false, .. }));

    assert!(wait_until(|| zone.players.len() == 1));

    zone.shutdown();
}

#[test]
fn unrecognized_client_kind_gets_out_of_slots_reply() {
    let zone = start_zone(34501);
    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    client.set_read_timeout(Some(TIMEOUT)).unwrap();

    // The listener only allows VIE (0x01) and Continuum (0x11); anything else is refused.
    let key_init = CoreFrame::KeyInit { key: 0, client_kind: 0x99, continuum: false }.write();
    client.send_to(&key_init, "127.0.0.1:34501").unwrap();

    let mut buf = [0u8; 64];
    let (len, _addr) = client.recv_from(&mut buf).expect("expected an out-of-slots reply");
    assert_eq!(&buf[..len], &[0x00, 0x07]);
    assert_eq!(zone.players.len(), 0);

    zone.shutdown();
}

//! Top-level glue: owns the transport, player table, timer service, and capability broker
//! together, and wires the login packet to the lifecycle machine and the authentication
//! collaborator (§3, §4.5, §6).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use log::{info, warn};

use crate::bandwidth::Priority;
use crate::broker::Broker;
use crate::collab::Authentication;
use crate::config::Config;
use crate::error::Result;
use crate::lifecycle::{KickReason, Machine, State};
use crate::player::{PlayerId, PlayerTable};
use crate::timer::TimerService;
use crate::transport::handlers::PacketHandler;
use crate::transport::Transport;

/// The payload type byte carrying a login request, by convention the lowest registrable type.
pub const LOGIN_TYPE_BYTE: u8 = 0x01;

/// A complete zone server core: transport, players, lifecycle, timers, and the capability broker,
/// wired together per §3-§6.
pub struct Zone {
    pub players: Arc<PlayerTable>,
    pub transport: Arc<Transport>,
    pub timers: Arc<TimerService>,
    pub broker: Arc<Broker>,

    machines: RwLock<HashMap<PlayerId, Mutex<Machine>>>,
    auth: Arc<dyn Authentication>,
    weak: std::sync::Weak<Zone>,
}

impl Zone {
    pub fn new(config: Config, auth: Arc<dyn Authentication>) -> Result<Arc<Self>> {
        let players = Arc::new(PlayerTable::new());
        let transport = Transport::new(config, Arc::clone(&players))?;
        let timers = TimerService::new();
        let broker = Broker::root();

        let zone = Arc::new_cyclic(|weak| Self {
            players,
            transport,
            timers,
            broker,
            machines: RwLock::new(HashMap::new()),
            auth,
            weak: weak.clone(),
        });

        let login_handler = Box::new(LoginHandler { zone: Arc::downgrade(&zone) });
        zone.transport
            .register_type_handler(LOGIN_TYPE_BYTE, login_handler)
            .expect("login type byte registered exactly once at startup");

        let kick_zone = Arc::downgrade(&zone);
        zone.transport.set_kick_hook(Box::new(move |player, reason| {
            if let Some(zone) = kick_zone.upgrade() {
                zone.kick(player, reason);
            }
        }));

        Ok(zone)
    }

    /// Advances `player`'s lifecycle machine through the transition named by `f`, returning the
    /// resulting state. Allocates the machine on first use, and mirrors the new state onto the
    /// `Player` record so readers without a handle on the machine table (the send-sweep) see it.
    fn transition(&self, player: PlayerId, f: impl FnOnce(&mut Machine)) -> Option<State> {
        self.machines.write().unwrap().entry(player).or_insert_with(|| Mutex::new(Machine::new()));

        let table = self.machines.read().unwrap();
        let mut machine = table.get(&player)?.lock().unwrap();
        f(&mut machine);
        let state = machine.state;
        drop(machine);
        drop(table);

        if let Some(player_record) = self.players.get(player) {
            player_record.set_state(state);
        }
        Some(state)
    }

    fn on_login_payload(&self, player: PlayerId, payload: &[u8]) {
        self.transition(player, Machine::on_connection_init);
        self.transition(player, Machine::on_login_received);

        if self.players.get(player).is_none() {
            return;
        }
        if payload.is_empty() || payload.len() > 20 || !payload.is_ascii() {
            info!("player {:?} sent an invalid login name, dropping", player);
            return;
        }

        self.transition(player, Machine::on_auth_dispatched);

        let zone_weak = self.weak.clone();
        let payload = payload.to_vec();
        self.auth.authenticate(
            player,
            &payload,
            Box::new(move |result| {
                if let Some(zone) = zone_weak.upgrade() {
                    zone.on_auth_result(player, result);
                }
            }),
        );
    }

    fn on_auth_result(self: &Arc<Self>, player: PlayerId, result: crate::collab::AuthResult) {
        let state = self.transition(player, |m| m.on_auth_result(&result));

        if state == Some(State::Connected) {
            warn!("player {:?} failed authentication: {:?}", player, result.code);
            return;
        }

        if let Some(player_record) = self.players.get(player) {
            if let Some(name) = result.name.clone() {
                player_record.set_name(name);
            }
            if let Some(squad) = result.squad.clone() {
                player_record.set_squad(squad);
            }
        }

        self.transition(player, Machine::on_global_sync_requested);
        // A real zone would wait for the global-sync collaborator here; §4.5's core does not
        // specify one, so the core completes the remaining login transitions immediately.
        self.transition(player, Machine::on_global_sync_complete);
        self.transition(player, Machine::on_global_callbacks_complete);
        self.transition(player, Machine::on_login_response_sent);

        self.transport.submit(player, Priority::Reliable, true, false, &[]);
    }

    /// Drives a player toward zone departure (client disconnect, admin kick, or lagout), per
    /// §4.5. Once the machine reaches `TimeWait`, the player and connection records are freed.
    pub fn kick(self: &Arc<Self>, player: PlayerId, reason: KickReason) {
        self.transition(player, |m| m.on_leave_arena(reason));
        self.transition(player, Machine::on_leave_zone);
        self.transition(player, Machine::on_global_leave_sync_requested);
        let state = self.transition(player, Machine::on_global_leave_sync_complete);

        if state == Some(State::TimeWait) {
            if let Some(player_record) = self.players.get(player) {
                self.transport.drop_connection(player, player_record.remote_addr);
            }
            self.players.free_player(player);
            self.machines.write().unwrap().remove(&player);
        }
    }

    pub fn shutdown(&self) {
        self.transport.shutdown();
        self.timers.shutdown();
    }
}

struct LoginHandler {
    zone: std::sync::Weak<Zone>,
}

impl PacketHandler for LoginHandler {
    fn handle(&self, player: PlayerId, payload: &[u8]) {
        if let Some(zone) = self.zone.upgrade() {
            zone.on_login_payload(player, payload);
        }
    }
}

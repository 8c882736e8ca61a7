//! The `Player` record and the table that owns player allocation (§3, §6).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::RwLock;

use crate::lifecycle::State as LifecycleState;

/// Small stable integer identifier for a player; unique among live players.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlayerId(pub u32);

/// Opaque arena handle; the core never interprets the integer beyond equality.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ArenaId(pub u32);

/// The kind of client behind a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientKind {
    Vie,
    Continuum,
    ChatProtocol,
    Fake,
    Unknown,
}

impl ClientKind {
    /// A "standard client" uses the UDP game protocol (excludes chat and fake clients).
    pub fn is_standard(&self) -> bool {
        matches!(self, ClientKind::Vie | ClientKind::Continuum)
    }
}

/// Boolean flag set carried on every player (§3). Kept as a plain struct of `bool`s rather than a
/// bitmask: there are few enough flags that a bitmask would only obscure which ones are set.
#[derive(Clone, Copy, Debug, Default)]
pub struct PlayerFlags {
    pub authenticated: bool,
    pub during_change: bool,
    pub want_all_overlays: bool,
    pub during_query: bool,
    pub no_ship: bool,
    pub no_flags_balls: bool,
    pub sent_position: bool,
    pub sent_weapon: bool,
    pub see_all_positions: bool,
    pub see_own_position: bool,
    pub leave_arena_when_ready: bool,
    pub obscenity_filter: bool,
    pub is_dead: bool,
    /// Set by the send scheduler when retry exhaustion is hit (§4.3 step 3).
    pub hit_max_retries: bool,
    /// Set by the send scheduler when the queued-byte ceiling is exceeded (§4.3).
    pub hit_max_outlist: bool,
}

/// Last observed position summary; contents are collaborator-defined, the core only stores and
/// timestamps it.
#[derive(Clone, Debug, Default)]
pub struct PositionSummary {
    pub x: i16,
    pub y: i16,
    pub bytes: Box<[u8]>,
}

/// A logical connection (§3). One `Player` exists per login attempt, whether or not it ever
/// becomes a standard (UDP) client.
pub struct Player {
    pub id: PlayerId,
    pub kind: ClientKind,
    state: RwLock<LifecycleState>,

    pub arena: Option<ArenaId>,
    pub entering_arena: Option<ArenaId>,

    name: RwLock<String>,
    squad: RwLock<String>,

    pub machine_id: u32,
    pub permanent_id: u32,

    pub remote_addr: SocketAddr,
    /// The listening bucket's `connect_as` tag this player arrived on.
    pub connect_as: String,

    pub position: PositionSummary,
    pub flags: PlayerFlags,

    extra_data: RwLock<HashMap<u32, Box<dyn std::any::Any + Send + Sync>>>,
}

impl Player {
    pub fn new(id: PlayerId, kind: ClientKind, remote_addr: SocketAddr, connect_as: String) -> Self {
        Self {
            id,
            kind,
            state: RwLock::new(LifecycleState::Uninitialized),
            arena: None,
            entering_arena: None,
            name: RwLock::new(String::new()),
            squad: RwLock::new(String::new()),
            machine_id: 0,
            permanent_id: 0,
            remote_addr,
            connect_as,
            position: PositionSummary::default(),
            flags: PlayerFlags::default(),
            extra_data: RwLock::new(HashMap::new()),
        }
    }

    /// The player's current lifecycle state, kept in sync with the `Machine` that owns the
    /// authoritative transitions (`Zone::transition`) so readers elsewhere (the send-sweep, for
    /// instance) don't need their own handle on the machine table.
    pub fn state(&self) -> LifecycleState {
        *self.state.read().unwrap()
    }

    pub fn set_state(&self, state: LifecycleState) {
        *self.state.write().unwrap() = state;
    }

    pub fn name(&self) -> String {
        self.name.read().unwrap().clone()
    }

    pub fn set_name(&self, name: String) {
        *self.name.write().unwrap() = name;
    }

    pub fn squad(&self) -> String {
        self.squad.read().unwrap().clone()
    }

    pub fn set_squad(&self, squad: String) {
        *self.squad.write().unwrap() = squad;
    }

    /// `true` once the player has passed login: name must be non-empty and at most 20 single-byte
    /// characters (§3 invariant).
    pub fn has_valid_login_name(&self) -> bool {
        let name = self.name.read().unwrap();
        !name.is_empty() && name.len() <= 20 && name.is_ascii()
    }

    /// Stores a per-player extra-data value under `key`. Registration of the key itself (i.e.
    /// deciding which keys exist) is the job of [`PlayerTable::allocate_extra_data_slot`]; this
    /// just writes a value into an already-allocated slot.
    pub fn set_extra_data<T: std::any::Any + Send + Sync>(&self, key: u32, value: T) {
        self.extra_data.write().unwrap().insert(key, Box::new(value));
    }

    pub fn clear_extra_data(&self, key: u32) {
        self.extra_data.write().unwrap().remove(&key);
    }
}

/// Owns player allocation, the stable-id free list, and per-player-slot key allocation (§6
/// `PlayerRegistry` contract). There being exactly one implementation of this contract (unlike
/// encryption or authentication, which are genuinely pluggable), it is exposed as inherent
/// methods rather than a trait.
pub struct PlayerTable {
    players: RwLock<HashMap<PlayerId, std::sync::Arc<Player>>>,
    next_id: std::sync::atomic::AtomicU32,
    free_ids: std::sync::Mutex<Vec<PlayerId>>,
    next_slot_key: std::sync::atomic::AtomicU32,
}

impl Default for PlayerTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PlayerTable {
    pub fn new() -> Self {
        Self {
            players: RwLock::new(HashMap::new()),
            next_id: std::sync::atomic::AtomicU32::new(1),
            free_ids: std::sync::Mutex::new(Vec::new()),
            next_slot_key: std::sync::atomic::AtomicU32::new(1),
        }
    }

    /// Creates a new player. Returns `None` if no free slot is available (the transport replies
    /// with `00 07` and discards state, per §7 resource exhaustion handling).
    pub fn new_player(
        &self,
        kind: ClientKind,
        remote_addr: SocketAddr,
        connect_as: String,
        max_players: usize,
    ) -> Option<std::sync::Arc<Player>> {
        let mut players = self.players.write().unwrap();
        if players.len() >= max_players {
            return None;
        }

        let id = {
            let mut free = self.free_ids.lock().unwrap();
            free.pop()
                .unwrap_or_else(|| PlayerId(self.next_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed)))
        };

        let player = std::sync::Arc::new(Player::new(id, kind, remote_addr, connect_as));
        players.insert(id, std::sync::Arc::clone(&player));
        Some(player)
    }

    /// Disposes of a player record, returning its id to the free list. Callers must ensure no
    /// thread still holds a reference before calling this (§3 lifecycle invariant); since players
    /// are reference-counted via `Arc`, a stray reference simply keeps the allocation alive a bit
    /// longer rather than causing a use-after-free.
    pub fn free_player(&self, id: PlayerId) {
        self.players.write().unwrap().remove(&id);
        self.free_ids.lock().unwrap().push(id);
    }

    pub fn get(&self, id: PlayerId) -> Option<std::sync::Arc<Player>> {
        self.players.read().unwrap().get(&id).cloned()
    }

    pub fn iter(&self) -> Vec<std::sync::Arc<Player>> {
        self.players.read().unwrap().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.players.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registers a new per-player extra-data key, unique for the process lifetime.
    pub fn allocate_extra_data_slot(&self) -> u32 {
        self.next_slot_key.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }
}

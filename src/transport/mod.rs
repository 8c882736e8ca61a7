//! The UDP transport (§3, §4.1, §5): listener sockets, the core-protocol receive path, the
//! bandwidth-limited send sweep, and the registered-type-handler dispatch surface.

pub mod frame;
pub mod handlers;
pub mod listener;
pub mod reassembly;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::Duration;

use log::{debug, info, trace, warn};

use crate::bandwidth::{Priority, TokenBucket};
use crate::config::Config;
use crate::connection::{ConnectionRecord, PacketFlags, PendingPacket};
use crate::error::Result;
use crate::lifecycle::KickReason;
use crate::player::{ClientKind, PlayerId, PlayerTable};
use crate::reliable::Accept;
use crate::transport::frame::{CoreFrame, CORE_TYPE_BYTE, MAX_PACKET_SIZE};
use crate::transport::handlers::HandlerTable;
use crate::transport::listener::{build_ping_reply, Listener};
use crate::transport::reassembly::BigChunkResult;

/// Callback a higher layer (the zone) registers to drive a player out of the lifecycle machine
/// when the transport itself observes a reason to disconnect them (§4.5).
pub type KickHook = Box<dyn Fn(PlayerId, KickReason) + Send + Sync>;

/// Bytes of source data read per presized chunk, leaving headroom under `MAX_PACKET_SIZE` once
/// the type byte, an optional 4-byte length prefix, and the Reliable wrapper are added.
const PRESIZED_CHUNK_SIZE: usize = 255;

/// One fully-ordered reliable (or otherwise dispatchable) payload handed to a worker thread,
/// stripped of the core-protocol envelope.
struct DispatchItem {
    player: PlayerId,
    type_byte: u8,
    payload: Box<[u8]>,
}

/// Owns every listening bucket, the live connection set, and the three worker-thread groups that
/// drive them (§5: receive thread, send thread, reliable-dispatch workers).
pub struct Transport {
    config: Config,
    listeners: Vec<Listener>,
    connections: RwLock<HashMap<PlayerId, Arc<ConnectionRecord>>>,
    addr_to_player: RwLock<HashMap<SocketAddr, PlayerId>>,
    /// Which listening bucket each connection arrived on, so replies and the send-thread sweep
    /// go out the same game socket the client is talking to.
    listener_of: RwLock<HashMap<PlayerId, usize>>,
    players: Arc<PlayerTable>,
    handlers: HandlerTable,
    /// Set once by `Zone::new`, mirroring the weak-reference registration used for
    /// `LoginHandler`; `None` until then (e.g. in tests that exercise `Transport` bare).
    kick_hook: RwLock<Option<KickHook>>,

    dispatch_tx: mpsc::Sender<DispatchItem>,
    dispatch_rx: Mutex<Option<mpsc::Receiver<DispatchItem>>>,

    shutdown: Arc<AtomicBool>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Transport {
    /// Binds every configured listener and spawns the receive, send, and reliable-dispatch
    /// threads. The returned `Arc` must stay alive for those threads to keep running; dropping
    /// the last reference does not join them -- call [`Transport::shutdown`] first.
    pub fn new(config: Config, players: Arc<PlayerTable>) -> Result<Arc<Self>> {
        let mut listeners = Vec::with_capacity(config.listeners.len());
        for lc in &config.listeners {
            listeners.push(Listener::bind(lc.clone())?);
        }

        let (dispatch_tx, dispatch_rx) = mpsc::channel();

        let transport = Arc::new(Self {
            config,
            listeners,
            connections: RwLock::new(HashMap::new()),
            addr_to_player: RwLock::new(HashMap::new()),
            listener_of: RwLock::new(HashMap::new()),
            players,
            handlers: HandlerTable::new(),
            kick_hook: RwLock::new(None),
            dispatch_tx,
            dispatch_rx: Mutex::new(Some(dispatch_rx)),
            shutdown: Arc::new(AtomicBool::new(false)),
            threads: Mutex::new(Vec::new()),
        });

        transport.spawn_receive_threads();
        transport.spawn_send_thread();
        transport.spawn_dispatch_workers();

        Ok(transport)
    }

    /// Registers the callback the send sweep calls when it decides, on its own, that a
    /// connection should be kicked (lagout, retry exhaustion, out-list overflow). Overwrites any
    /// previously registered hook.
    pub fn set_kick_hook(&self, hook: KickHook) {
        *self.kick_hook.write().unwrap() = Some(hook);
    }

    fn kick(&self, player: PlayerId, reason: KickReason) {
        if let Some(hook) = self.kick_hook.read().unwrap().as_ref() {
            hook(player, reason);
        }
    }

    /// Registers a handler for payload type byte `type_byte` (must be in `0x01..=0x3F`, §9).
    pub fn register_type_handler(&self, type_byte: u8, handler: Box<dyn handlers::PacketHandler>) -> Result<()> {
        self.handlers.register(type_byte, handler)
    }

    /// Registers a handler for a registered *sized* transfer type (§4.1, §6).
    pub fn register_sized_type_handler(
        &self,
        type_byte: u8,
        handler: Box<dyn handlers::SizedPacketHandler>,
    ) -> Result<()> {
        self.handlers.register_sized(type_byte, handler)
    }

    fn connection(&self, player: PlayerId) -> Option<Arc<ConnectionRecord>> {
        self.connections.read().unwrap().get(&player).cloned()
    }

    /// Queues `payload` for delivery to `player` at priority `pri`. `reliable` requests
    /// sequenced, acknowledged, retransmitted delivery; non-reliable payloads larger than 255
    /// bytes are never grouped (§4.1, §4.3).
    pub fn submit(&self, player: PlayerId, pri: Priority, reliable: bool, droppable: bool, payload: &[u8]) {
        let Some(conn) = self.connection(player) else { return };

        let seq = if reliable { Some(conn.next_seq()) } else { None };
        let wire = match seq {
            Some(seq) => CoreFrame::Reliable { seq, payload: Box::from(payload) }.write(),
            None => Box::from(payload),
        };

        let flags = PacketFlags { reliable, droppable, urgent: false };
        let packet = PendingPacket::new(wire, flags, seq);
        conn.out_lists.lock().unwrap().queue(pri).push_back(packet);
    }

    /// Hands `source` to the sized-send queue for `player`, tagged with the registered sized
    /// type byte the receiving end will dispatch chunks to (§3, §4.1). The send sweep drains this
    /// queue on every pass.
    pub fn submit_sized(&self, player: PlayerId, type_byte: u8, source: Box<dyn reassembly::SizedSource>) {
        if let Some(conn) = self.connection(player) {
            conn.reassembly.lock().unwrap().sized_tx_queue.push(type_byte, source);
        }
    }

    /// Sends `bytes` immediately on the first listener's game socket, bypassing the priority
    /// queues and grouping buffer entirely (§6). Prefer [`Transport::submit`] for anything that
    /// should be reliable, bandwidth-limited, or grouped; this exists for callers that need to
    /// push a datagram out right now.
    pub fn really_raw_send(&self, addr: SocketAddr, bytes: &[u8]) {
        self.really_raw_send_on(0, addr, bytes);
    }

    fn really_raw_send_on(&self, idx: usize, addr: SocketAddr, bytes: &[u8]) {
        if let Some(listener) = self.listeners.get(idx) {
            let _ = listener.game_socket.send_to(bytes, addr);
        }
    }

    /// Allocates a player and connection record for a freshly key-exchanged client arriving on
    /// listener `idx`.
    pub fn new_connection(
        &self,
        idx: usize,
        addr: SocketAddr,
        kind: ClientKind,
        connect_as: String,
    ) -> Option<Arc<crate::player::Player>> {
        let player = self.players.new_player(kind, addr, connect_as, usize::MAX)?;
        let conn = Arc::new(ConnectionRecord::new(player.id, &self.config.net, 0, 0));
        *conn.limiter.lock().unwrap() = Box::new(TokenBucket::new(&self.config.bandwidth));

        self.connections.write().unwrap().insert(player.id, conn);
        self.addr_to_player.write().unwrap().insert(addr, player.id);
        self.listener_of.write().unwrap().insert(player.id, idx);
        Some(player)
    }

    /// Tears down a connection's transport-level state. The `Player` record itself is owned by
    /// [`PlayerTable`] and is disposed separately once the lifecycle machine reaches `TimeWait`.
    pub fn drop_connection(&self, player: PlayerId, addr: SocketAddr) {
        self.connections.write().unwrap().remove(&player);
        self.addr_to_player.write().unwrap().remove(&addr);
        self.listener_of.write().unwrap().remove(&player);
    }

    fn spawn_receive_threads(self: &Arc<Self>) {
        for (idx, _listener) in self.listeners.iter().enumerate() {
            let transport = Arc::clone(self);
            let shutdown = Arc::clone(&self.shutdown);
            let handle = thread::spawn(move || {
                let mut buf = [0u8; MAX_PACKET_SIZE + 64];
                while !shutdown.load(Ordering::Relaxed) {
                    let socket = &transport.listeners[idx].game_socket;
                    match socket.recv_from(&mut buf) {
                        Ok((len, addr)) => transport.on_game_datagram(idx, addr, &mut buf[..len]),
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                            thread::sleep(Duration::from_millis(2));
                        }
                        Err(e) => {
                            warn!("receive error on listener {}: {}", idx, e);
                            thread::sleep(Duration::from_millis(10));
                        }
                    }
                }
            });
            self.threads.lock().unwrap().push(handle);

            let transport = Arc::clone(self);
            let shutdown = Arc::clone(&self.shutdown);
            let handle = thread::spawn(move || {
                let mut buf = [0u8; 64];
                while !shutdown.load(Ordering::Relaxed) {
                    let socket = &transport.listeners[idx].ping_socket;
                    match socket.recv_from(&mut buf) {
                        Ok((len, addr)) if len >= 4 => {
                            let population = transport.players.len() as u32;
                            let mut echoed = [0u8; 4];
                            echoed.copy_from_slice(&buf[..4]);
                            let reply = build_ping_reply(population, &echoed);
                            let _ = socket.send_to(&reply, addr);
                        }
                        Ok(_) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                            thread::sleep(Duration::from_millis(20));
                        }
                        Err(e) => {
                            warn!("ping receive error on listener {}: {}", idx, e);
                            thread::sleep(Duration::from_millis(20));
                        }
                    }
                }
            });
            self.threads.lock().unwrap().push(handle);
        }
    }

    fn spawn_send_thread(self: &Arc<Self>) {
        let transport = Arc::clone(self);
        let shutdown = Arc::clone(&self.shutdown);
        let handle = thread::spawn(move || {
            while !shutdown.load(Ordering::Relaxed) {
                transport.send_sweep();
                thread::sleep(Duration::from_millis(10));
            }
        });
        self.threads.lock().unwrap().push(handle);
    }

    fn send_sweep(&self) {
        let players = self.players.iter();
        for player in players {
            if !player.state().is_ours_range() {
                continue;
            }
            let Some(conn) = self.connection(player.id) else { continue };

            if conn.since_last_recv() > self.config.net.drop_timeout {
                debug!("player {:?} lagged out (silence exceeded drop_timeout)", player.id);
                self.kick(player.id, KickReason::Lagout);
                continue;
            }

            self.pump_sized_sends(player.id, &conn);

            let addr = player.remote_addr;
            let Some(&listener_idx) = self.listener_of.read().unwrap().get(&player.id) else { continue };
            let socket = &self.listeners[listener_idx].game_socket;

            let mut send = |bytes: &[u8]| {
                let mut out = Vec::from(bytes);
                let len = out.len();
                let new_len = conn.encryption.lock().unwrap().encrypt(player.id, &mut out, len);
                let _ = socket.send_to(&out[..new_len], addr);
            };

            if let Some(outcome) = crate::scheduler::flush_connection(&conn, &self.config.net, &mut send) {
                if outcome.hit_max_retries || outcome.hit_max_outlist {
                    warn!(
                        "player {:?} hit send-scheduler limit (retries={} outlist={})",
                        player.id, outcome.hit_max_retries, outcome.hit_max_outlist
                    );
                    self.kick(player.id, KickReason::Unresponsive);
                }
            }
        }
    }

    /// Drains `conn`'s outbound sized-send queue into ordinary reliable-priority packets, paced
    /// so one large sized send can't starve everything else queued for the connection (§3, §4.1).
    fn pump_sized_sends(&self, player_id: PlayerId, conn: &ConnectionRecord) {
        let pending_reliable = conn.out_lists.lock().unwrap().queue(Priority::Reliable).len();
        if pending_reliable >= self.config.net.presized_queue_threshold {
            return;
        }

        for _ in 0..self.config.net.presized_queue_packets {
            let chunk = conn.reassembly.lock().unwrap().sized_tx_queue.pump(PRESIZED_CHUNK_SIZE);
            let Some(chunk) = chunk else { break };

            let mut body = Vec::with_capacity(1 + 4 + chunk.payload.len());
            body.push(chunk.type_byte);
            if chunk.is_first {
                body.extend_from_slice(&chunk.total_len.to_le_bytes());
            }
            body.extend_from_slice(&chunk.payload);

            let frame = CoreFrame::PresizedData { body: body.into_boxed_slice() }.write();
            self.submit(player_id, Priority::Reliable, true, false, &frame);
        }
    }

    fn spawn_dispatch_workers(self: &Arc<Self>) {
        let rx = self.dispatch_rx.lock().unwrap().take().expect("dispatch_rx taken twice");
        let rx = Arc::new(Mutex::new(rx));

        for _ in 0..self.config.net.reliable_threads.max(1) {
            let transport = Arc::clone(self);
            let rx = Arc::clone(&rx);
            let shutdown = Arc::clone(&self.shutdown);
            let handle = thread::spawn(move || loop {
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                let item = {
                    let rx = rx.lock().unwrap();
                    rx.recv_timeout(Duration::from_millis(100))
                };
                match item {
                    Ok(item) => transport.dispatch_payload(item),
                    Err(mpsc::RecvTimeoutError::Timeout) => continue,
                    Err(mpsc::RecvTimeoutError::Disconnected) => break,
                }
            });
            self.threads.lock().unwrap().push(handle);
        }
    }

    fn dispatch_payload(&self, item: DispatchItem) {
        self.handlers.dispatch(item.type_byte, item.player, &item.payload);
    }

    /// Entry point for every datagram received on a game socket (§4.1, §7).
    fn on_game_datagram(&self, listener_idx: usize, addr: SocketAddr, buf: &mut [u8]) {
        if buf.is_empty() {
            return;
        }

        let type_byte = buf[0];

        let player_id = self.addr_to_player.read().unwrap().get(&addr).copied();

        let Some(player_id) = player_id else {
            // Unknown endpoint: only a core-protocol KeyInit is meaningful.
            if type_byte == CORE_TYPE_BYTE {
                if let Some(CoreFrame::KeyInit { client_kind, continuum, .. }) = CoreFrame::parse(buf, 0) {
                    self.on_key_init(listener_idx, addr, client_kind, continuum);
                }
            }
            return;
        };

        let Some(conn) = self.connection(player_id) else { return };

        let len = {
            let mut enc = conn.encryption.lock().unwrap();
            let n = enc.decrypt(player_id, buf, buf.len());
            if n == 0 {
                trace!("dropping undecryptable datagram from {:?}", player_id);
                return;
            }
            n
        };
        let buf = &buf[..len];

        conn.touch_received();
        conn.counters.received.fetch_add(1, Ordering::Relaxed);
        conn.counters.bytes_received.fetch_add(len as u64, Ordering::Relaxed);

        if type_byte == CORE_TYPE_BYTE {
            if let Some(frame) = CoreFrame::parse(buf, 0) {
                self.on_core_frame(player_id, &conn, frame);
            }
            return;
        }

        if self.handlers.is_sized(type_byte) {
            self.on_sized_payload(player_id, &conn, type_byte, &buf[1..]);
        } else {
            let _ = self.dispatch_tx.send(DispatchItem {
                player: player_id,
                type_byte,
                payload: Box::from(&buf[1..]),
            });
        }
    }

    fn on_key_init(&self, listener_idx: usize, addr: SocketAddr, client_kind_byte: u8, continuum: bool) {
        let listener = &self.listeners[listener_idx];
        if !listener.accepts(client_kind_byte) {
            self.really_raw_send_on(listener_idx, addr, &CoreFrame::OutOfSlots.write());
            return;
        }

        let kind = if continuum { ClientKind::Continuum } else { ClientKind::Vie };
        let connect_as = listener.config.connect_as.clone();

        match self.new_connection(listener_idx, addr, kind, connect_as) {
            Some(player) => {
                info!("player {:?} connected from {} ({:?})", player.id, addr, kind);
                let key: u32 = rand::random();
                let reply = CoreFrame::KeyResponse { key, continuum }.write();
                self.really_raw_send_on(listener_idx, addr, &reply);
            }
            None => {
                self.really_raw_send_on(listener_idx, addr, &CoreFrame::OutOfSlots.write());
            }
        }
    }

    fn on_core_frame(&self, player_id: PlayerId, conn: &Arc<ConnectionRecord>, frame: CoreFrame) {
        match frame {
            CoreFrame::Reliable { seq, payload } => self.on_reliable(player_id, conn, seq, payload),
            CoreFrame::Ack { seq } => crate::scheduler::handle_ack(conn, seq),
            CoreFrame::SyncRequest { timestamp } => {
                let server_timestamp = 0;
                let reply = CoreFrame::SyncResponse { echoed_timestamp: timestamp, server_timestamp }.write();
                conn.out_lists
                    .lock()
                    .unwrap()
                    .queue(Priority::Ack)
                    .push_back(PendingPacket::new(reply, PacketFlags { reliable: false, droppable: false, urgent: true }, None));
            }
            CoreFrame::Disconnect => {
                debug!("player {:?} sent Disconnect", player_id);
            }
            CoreFrame::BigChunk { payload } => {
                let result = conn.reassembly.lock().unwrap().big.push_chunk(&payload);
                self.on_big_result(player_id, result);
            }
            CoreFrame::BigFinal { payload } => {
                let result = conn.reassembly.lock().unwrap().big.push_final(&payload);
                self.on_big_result(player_id, result);
            }
            CoreFrame::PresizedData { body } => {
                // The first byte of the payload carries the registered sized type, same
                // convention as any other registered payload (§4.1).
                if let Some((&type_byte, rest)) = body.split_first() {
                    self.on_sized_payload(player_id, conn, type_byte, rest);
                }
            }
            CoreFrame::CancelRequest => {
                conn.reassembly.lock().unwrap().sized_rx.cancel();
                let reply = CoreFrame::CancelAck.write();
                conn.out_lists
                    .lock()
                    .unwrap()
                    .queue(Priority::Ack)
                    .push_back(PendingPacket::new(reply, PacketFlags::default(), None));
            }
            CoreFrame::CancelAck => {
                conn.reassembly.lock().unwrap().sized_tx_queue.pop_front();
            }
            CoreFrame::Grouped { items } => {
                for item in items {
                    if item.first() == Some(&CORE_TYPE_BYTE) {
                        if let Some(inner) = CoreFrame::parse(&item, 1) {
                            self.on_core_frame(player_id, conn, inner);
                        }
                    } else if let Some(&type_byte) = item.first() {
                        if self.handlers.is_sized(type_byte) {
                            self.on_sized_payload(player_id, conn, type_byte, &item[1..]);
                        } else {
                            let _ = self.dispatch_tx.send(DispatchItem {
                                player: player_id,
                                type_byte,
                                payload: Box::from(&item[1..]),
                            });
                        }
                    }
                }
            }
            CoreFrame::KeyInit { .. } | CoreFrame::KeyResponse { .. } | CoreFrame::OutOfSlots => {
                // A known connection resending its handshake frame; nothing further to do.
            }
        }
    }

    fn on_reliable(&self, player_id: PlayerId, conn: &Arc<ConnectionRecord>, seq: u32, payload: Box<[u8]>) {
        let accept = conn.in_window.lock().unwrap().receive(seq, payload);

        match accept {
            Accept::OutOfWindow => return,
            Accept::Duplicate => {
                conn.counters.duplicate_reliable.fetch_add(1, Ordering::Relaxed);
            }
            Accept::Accepted { ready } => {
                for item in ready {
                    if item.first() == Some(&CORE_TYPE_BYTE) {
                        if let Some(inner) = CoreFrame::parse(&item, 0) {
                            self.on_core_frame(player_id, conn, inner);
                        }
                    } else if let Some(&type_byte) = item.first() {
                        if self.handlers.is_sized(type_byte) {
                            self.on_sized_payload(player_id, conn, type_byte, &item[1..]);
                        } else {
                            let _ = self.dispatch_tx.send(DispatchItem {
                                player: player_id,
                                type_byte,
                                payload: Box::from(&item[1..]),
                            });
                        }
                    }
                }
            }
        }

        let ack = CoreFrame::Ack { seq }.write();
        conn.out_lists
            .lock()
            .unwrap()
            .queue(Priority::Ack)
            .push_back(PendingPacket::new(ack, PacketFlags::default(), None));
    }

    fn on_big_result(&self, player_id: PlayerId, result: BigChunkResult) {
        match result {
            BigChunkResult::Continuing => {}
            BigChunkResult::Overflowed => {
                warn!("player {:?} exceeded the big-packet reassembly cap", player_id);
            }
            BigChunkResult::Complete(payload) => {
                if let Some(&type_byte) = payload.first() {
                    if self.handlers.is_sized(type_byte) {
                        // A reassembled big packet dispatches as a normal (non-chunked) payload.
                        self.handlers.dispatch(type_byte, player_id, &payload[1..]);
                    } else {
                        let _ = self.dispatch_tx.send(DispatchItem {
                            player: player_id,
                            type_byte,
                            payload: Box::from(&payload[1..]),
                        });
                    }
                }
            }
        }
    }

    /// Dispatches one chunk of a registered sized transfer. Whether `body` opens with a 4-byte
    /// `total_len` prefix is session state, not something derivable from `body`'s length: a
    /// non-first chunk of any reasonable size also clears the `>= 4 bytes` threshold, so that bit
    /// comes from the reassembly slot itself (§4.1).
    fn on_sized_payload(&self, player_id: PlayerId, conn: &Arc<ConnectionRecord>, type_byte: u8, body: &[u8]) {
        let mut reassembly = conn.reassembly.lock().unwrap();
        let is_first = reassembly.sized_rx.is_first_chunk();

        let (total_len, payload) = if is_first && body.len() >= 4 {
            (Some(u32::from_le_bytes([body[0], body[1], body[2], body[3]])), &body[4..])
        } else {
            (None, body)
        };

        let chunk = reassembly.sized_rx.push(total_len, payload);
        drop(reassembly);
        if let Some(chunk) = chunk {
            self.handlers.dispatch_sized(type_byte, player_id, chunk.offset, chunk.total_len, &chunk.payload);
        }
    }

    /// Stops every receive/send/dispatch thread and joins them.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        for handle in self.threads.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
    }
}

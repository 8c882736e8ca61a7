//! The per-player connection record (§3): sequence counters, queues, counters, and the three
//! mutual-exclusion domains named in §5 (out-list, reliable-window, reassembly).

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use crate::bandwidth::{Limiter, NoLimit, Priority};
use crate::collab::{Encryption, NullEncryption};
use crate::config::NetConfig;
use crate::player::PlayerId;
use crate::reliable::{InWindow, RttEstimator, Seq};
use crate::transport::reassembly::{BigReassembly, SizedReceive, SizedSendQueue};

/// Flags carried on one pending outbound packet (§3).
#[derive(Clone, Copy, Debug, Default)]
pub struct PacketFlags {
    pub reliable: bool,
    pub droppable: bool,
    pub urgent: bool,
}

/// One packet waiting to be sent (§3).
pub struct PendingPacket {
    pub bytes: Box<[u8]>,
    /// Reliable sequence number, present only for packets in the `Reliable` priority class.
    pub seq: Option<Seq>,
    pub flags: PacketFlags,
    pub attempts: u32,
    pub last_attempt: Option<Instant>,
}

impl PendingPacket {
    pub fn new(bytes: Box<[u8]>, flags: PacketFlags, seq: Option<Seq>) -> Self {
        Self { bytes, seq, flags, attempts: 0, last_attempt: None }
    }
}

/// The five priority out-lists, guarded together by one mutex (§3, §5: "out-list mutex").
#[derive(Default)]
pub struct OutLists {
    pub queues: [std::collections::VecDeque<PendingPacket>; 5],
}

impl OutLists {
    pub fn queue(&mut self, pri: Priority) -> &mut std::collections::VecDeque<PendingPacket> {
        &mut self.queues[pri.index()]
    }

    pub fn total_bytes(&self) -> usize {
        self.queues.iter().flatten().map(|p| p.bytes.len()).sum()
    }
}

/// Packet and byte counters (§3).
#[derive(Default)]
pub struct Counters {
    pub sent: AtomicU64,
    pub received: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub dropped: AtomicU64,
    pub duplicate_reliable: AtomicU64,
    pub retries: AtomicU64,
}

/// Reassembly state, guarded together by one mutex (§3, §5: "reassembly mutex").
#[derive(Default)]
pub struct Reassembly {
    pub big: BigReassembly,
    pub sized_rx: SizedReceive,
    pub sized_tx_queue: SizedSendQueue,
}

/// Per-connection state for a player that uses the UDP transport (§3).
pub struct ConnectionRecord {
    pub player_id: PlayerId,

    created_at: Instant,
    last_recv_ms: AtomicU64,

    next_out_seq: AtomicU32,

    pub counters: Counters,

    pub rtt: Mutex<RttEstimator>,
    pub encryption: Mutex<Box<dyn Encryption>>,
    pub limiter: Mutex<Box<dyn Limiter>>,

    pub out_lists: Mutex<OutLists>,
    pub in_window: Mutex<InWindow>,
    pub reassembly: Mutex<Reassembly>,

    pub hit_max_retries: AtomicBool,
    pub hit_max_outlist: AtomicBool,
}

impl ConnectionRecord {
    pub fn new(player_id: PlayerId, net: &NetConfig, out_seq_start: Seq, in_seq_start: Seq) -> Self {
        Self {
            player_id,
            created_at: Instant::now(),
            last_recv_ms: AtomicU64::new(0),
            next_out_seq: AtomicU32::new(out_seq_start),
            counters: Counters::default(),
            rtt: Mutex::new(RttEstimator::new()),
            encryption: Mutex::new(Box::new(NullEncryption)),
            limiter: Mutex::new(Box::new(NoLimit::new())),
            out_lists: Mutex::new(OutLists::default()),
            in_window: Mutex::new(InWindow::new(net.reliable_window_size, in_seq_start)),
            reassembly: Mutex::new(Reassembly::default()),
            hit_max_retries: AtomicBool::new(false),
            hit_max_outlist: AtomicBool::new(false),
        }
    }

    pub fn touch_received(&self) {
        let elapsed = self.created_at.elapsed().as_millis() as u64;
        self.last_recv_ms.store(elapsed, Ordering::Relaxed);
    }

    pub fn since_last_recv(&self) -> std::time::Duration {
        let elapsed_ms = self.created_at.elapsed().as_millis() as u64;
        let last = self.last_recv_ms.load(Ordering::Relaxed);
        std::time::Duration::from_millis(elapsed_ms.saturating_sub(last))
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn next_seq(&self) -> Seq {
        self.next_out_seq.fetch_add(1, Ordering::SeqCst)
    }

    pub fn peek_next_seq(&self) -> Seq {
        self.next_out_seq.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_counter_increments_monotonically() {
        let conn = ConnectionRecord::new(PlayerId(1), &NetConfig::default(), 7, 0);
        assert_eq!(conn.next_seq(), 7);
        assert_eq!(conn.next_seq(), 8);
        assert_eq!(conn.peek_next_seq(), 9);
    }
}

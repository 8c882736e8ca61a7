//! The bandwidth-limited priority send scheduler (§4.3).

use std::time::Instant;

use crate::bandwidth::Priority;
use crate::connection::{ConnectionRecord, PendingPacket};
use crate::config::NetConfig;
use crate::transport::frame::{CoreFrame, MAX_PACKET_SIZE};

/// Transient accumulator that coalesces small sub-packets under the `0x00 0x0E` grouped
/// envelope (§3, §4.3).
struct GroupingBuffer {
    items: Vec<Box<[u8]>>,
}

impl GroupingBuffer {
    fn new() -> Self {
        Self { items: Vec::new() }
    }

    fn envelope_size(&self) -> usize {
        2 + self.items.iter().map(|i| 1 + i.len()).sum::<usize>()
    }

    fn would_overflow(&self, item_len: usize) -> bool {
        self.envelope_size() + 1 + item_len > MAX_PACKET_SIZE
    }

    fn push(&mut self, item: Box<[u8]>) {
        self.items.push(item);
    }

    fn flush(&mut self, send: &mut dyn FnMut(&[u8])) {
        if self.items.is_empty() {
            return;
        }
        let items = std::mem::take(&mut self.items);
        let frame = CoreFrame::Grouped { items };
        send(&frame.write());
    }

    /// Routes one wire-ready sub-packet: grouped if small enough to share an envelope, standalone
    /// otherwise (§4.3).
    fn accumulate(&mut self, item: Box<[u8]>, send: &mut dyn FnMut(&[u8])) {
        if item.len() > 255 {
            self.flush(send);
            send(&item);
            return;
        }

        if self.would_overflow(item.len()) {
            self.flush(send);
        }

        self.push(item);
    }
}

/// Outcome of one scheduler sweep over a connection, surfaced to the lifecycle machinery.
#[derive(Debug, Default)]
pub struct FlushOutcome {
    pub hit_max_retries: bool,
    pub hit_max_outlist: bool,
}

/// Runs one send-scheduler sweep over `conn`'s out-lists, emitting wire bytes via `send`.
///
/// Returns immediately (without sending anything) if another thread currently holds the
/// out-list lock, per the non-blocking discipline in §5.
pub fn flush_connection(
    conn: &ConnectionRecord,
    net: &NetConfig,
    send: &mut dyn FnMut(&[u8]),
) -> Option<FlushOutcome> {
    let mut out_lists = conn.out_lists.try_lock().ok()?;

    let now = Instant::now();
    let timeout = conn.rtt.lock().unwrap().retransmit_timeout();

    let mut limiter = conn.limiter.lock().unwrap();
    limiter.iter(now);
    let buffer_bound = limiter.can_buffer_packets();

    let min_reliable_seq = out_lists
        .queue(Priority::Reliable)
        .iter()
        .filter_map(|p| p.seq)
        .min();

    let mut outcome = FlushOutcome::default();
    let mut grouping = GroupingBuffer::new();
    let mut aborted = false;

    for &pri in Priority::ALL.iter() {
        if aborted {
            break;
        }

        let queue = out_lists.queue(pri);
        let pending = std::mem::take(queue);
        let mut remaining = std::collections::VecDeque::with_capacity(pending.len());

        for mut packet in pending {
            if aborted {
                remaining.push_back(packet);
                continue;
            }

            if let Some(last) = packet.last_attempt {
                if now.saturating_duration_since(last) <= timeout * packet.attempts.max(1) {
                    remaining.push_back(packet);
                    continue;
                }
            }

            if pri == Priority::Reliable {
                if let (Some(seq), Some(min_seq)) = (packet.seq, min_reliable_seq) {
                    if seq.wrapping_sub(min_seq) > buffer_bound {
                        remaining.push_back(packet);
                        continue;
                    }
                }
            }

            if packet.attempts > net.max_retries {
                outcome.hit_max_retries = true;
                remaining.push_back(packet);
                aborted = true;
                continue;
            }

            if !limiter.check(packet.bytes.len(), pri) {
                if packet.flags.droppable && pri.is_droppable() {
                    conn.counters.dropped.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    // Dropped: do not re-enqueue.
                } else {
                    remaining.push_back(packet);
                }
                continue;
            }

            if packet.attempts > 0 {
                conn.counters.retries.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                limiter.adjust_for_retry();
            }

            packet.last_attempt = Some(now);
            packet.attempts += 1;

            conn.counters.sent.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            conn.counters.bytes_sent.fetch_add(packet.bytes.len() as u64, std::sync::atomic::Ordering::Relaxed);

            grouping.accumulate(packet.bytes.clone(), send);

            if packet.flags.reliable {
                remaining.push_back(packet);
            }
            // Non-reliable packets are not re-enqueued: they have been sent at most once.
        }

        *out_lists.queue(pri) = remaining;
    }

    grouping.flush(send);

    if out_lists.total_bytes() > net.max_outlist_size {
        outcome.hit_max_outlist = true;
    }

    conn.hit_max_retries.store(outcome.hit_max_retries, std::sync::atomic::Ordering::Relaxed);
    conn.hit_max_outlist.store(outcome.hit_max_outlist, std::sync::atomic::Ordering::Relaxed);

    Some(outcome)
}

/// Called when an Ack frame is received for `seq`: removes the matching reliable packet from the
/// out-list, if present, and returns the RTT sample (time since its last send attempt).
pub fn handle_ack(conn: &ConnectionRecord, seq: u32) {
    let mut out_lists = conn.out_lists.lock().unwrap();
    let queue = out_lists.queue(Priority::Reliable);

    if let Some(pos) = queue.iter().position(|p| p.seq == Some(seq)) {
        let packet = queue.remove(pos).unwrap();
        if let Some(last) = packet.last_attempt {
            let sample = last.elapsed();
            conn.rtt.lock().unwrap().sample(sample);
        }
        conn.limiter.lock().unwrap().adjust_for_ack();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::PacketFlags;
    use crate::player::PlayerId;

    fn make_conn() -> ConnectionRecord {
        ConnectionRecord::new(PlayerId(1), &NetConfig::default(), 0, 0)
    }

    fn push(conn: &ConnectionRecord, pri: Priority, bytes: &[u8], reliable: bool, droppable: bool, seq: Option<u32>) {
        let packet = PendingPacket::new(
            Box::from(bytes),
            PacketFlags { reliable, droppable, urgent: false },
            seq,
        );
        conn.out_lists.lock().unwrap().queue(pri).push_back(packet);
    }

    #[test]
    fn small_reliable_packets_are_grouped_in_one_send() {
        let conn = make_conn();
        for i in 0..5u32 {
            let frame = CoreFrame::Reliable { seq: i, payload: Box::from(&[1u8; 50][..]) };
            push(&conn, Priority::Reliable, &frame.write(), true, false, Some(i));
        }

        let mut sends: Vec<Box<[u8]>> = Vec::new();
        let mut sink = |b: &[u8]| sends.push(Box::from(b));
        flush_connection(&conn, &NetConfig::default(), &mut sink).unwrap();

        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0][1], crate::transport::frame::sub_type::GROUPED);
    }

    #[test]
    fn droppable_packet_is_removed_when_limiter_denies() {
        use crate::bandwidth::Limiter;

        struct AlwaysDeny;
        impl Limiter for AlwaysDeny {
            fn iter(&mut self, _now: Instant) {}
            fn check(&mut self, _bytes: usize, _pri: Priority) -> bool {
                false
            }
            fn adjust_for_ack(&mut self) {}
            fn adjust_for_retry(&mut self) {}
            fn can_buffer_packets(&self) -> u32 {
                30
            }
            fn info(&self) -> String {
                "deny".into()
            }
        }

        let conn = make_conn();
        *conn.limiter.lock().unwrap() = Box::new(AlwaysDeny);
        push(&conn, Priority::UnreliableLow, b"xyz", false, true, None);

        let mut sink = |_: &[u8]| panic!("should not send");
        flush_connection(&conn, &NetConfig::default(), &mut sink).unwrap();

        assert_eq!(conn.counters.dropped.load(std::sync::atomic::Ordering::Relaxed), 1);
        assert!(conn.out_lists.lock().unwrap().queue(Priority::UnreliableLow).is_empty());
    }

    #[test]
    fn ack_removes_reliable_entry_and_updates_rtt() {
        let conn = make_conn();
        let frame = CoreFrame::Reliable { seq: 3, payload: Box::from(&[1u8][..]) };
        push(&conn, Priority::Reliable, &frame.write(), true, false, Some(3));

        {
            let mut out_lists = conn.out_lists.lock().unwrap();
            out_lists.queue(Priority::Reliable)[0].last_attempt = Some(Instant::now());
            out_lists.queue(Priority::Reliable)[0].attempts = 1;
        }

        handle_ack(&conn, 3);
        assert!(conn.out_lists.lock().unwrap().queue(Priority::Reliable).is_empty());
    }

    #[test]
    fn exhausting_retries_sets_hit_max_retries_and_aborts_sweep() {
        let conn = make_conn();
        let frame = CoreFrame::Reliable { seq: 1, payload: Box::from(&[1u8][..]) };
        let mut packet = PendingPacket::new(frame.write(), PacketFlags { reliable: true, droppable: false, urgent: false }, Some(1));
        packet.attempts = (NetConfig::default().max_retries + 1) as u32;
        packet.last_attempt = Some(Instant::now() - std::time::Duration::from_secs(10));
        conn.out_lists.lock().unwrap().queue(Priority::Reliable).push_back(packet);

        let mut sink = |_: &[u8]| {};
        let outcome = flush_connection(&conn, &NetConfig::default(), &mut sink).unwrap();
        assert!(outcome.hit_max_retries);
    }
}

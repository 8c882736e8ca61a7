//! Big-packet and presized/sized transfer reassembly slots (§4.1, §3).

use std::collections::VecDeque;

use super::frame::MAX_BIG_PACKET_SIZE;

/// Accumulates successive `BigChunk` payloads until a `BigFinal` completes the stream.
#[derive(Default)]
pub struct BigReassembly {
    buffer: Vec<u8>,
    active: bool,
}

pub enum BigChunkResult {
    /// More chunks are expected.
    Continuing,
    /// The stream completed; dispatch the assembled buffer as a normal payload.
    Complete(Box<[u8]>),
    /// The stream exceeded the cap and was aborted; state has been cleared (§8).
    Overflowed,
}

impl BigReassembly {
    pub fn push_chunk(&mut self, payload: &[u8]) -> BigChunkResult {
        self.active = true;
        self.buffer.extend_from_slice(payload);

        if self.buffer.len() > MAX_BIG_PACKET_SIZE {
            self.buffer.clear();
            self.active = false;
            return BigChunkResult::Overflowed;
        }

        BigChunkResult::Continuing
    }

    pub fn push_final(&mut self, payload: &[u8]) -> BigChunkResult {
        match self.push_chunk(payload) {
            BigChunkResult::Overflowed => BigChunkResult::Overflowed,
            BigChunkResult::Continuing => {
                let out = std::mem::take(&mut self.buffer).into_boxed_slice();
                self.active = false;
                BigChunkResult::Complete(out)
            }
            BigChunkResult::Complete(_) => unreachable!(),
        }
    }
}

/// One chunk handed to a registered sized-type sink (§4.1, §6).
pub struct SizedChunk {
    pub offset: u32,
    pub total_len: u32,
    pub payload: Box<[u8]>,
}

/// Tracks an in-progress incoming sized/presized transfer.
#[derive(Default)]
pub struct SizedReceive {
    total_len: Option<u32>,
    offset: u32,
    cancelled: bool,
}

impl SizedReceive {
    /// `true` when the next chunk handed to `push` is the first of a new transfer, i.e. the
    /// caller must read a leading 4-byte length off the wire and pass it as `total_len`.
    pub fn is_first_chunk(&self) -> bool {
        self.total_len.is_none()
    }

    /// `total_len` is `Some` only on the very first chunk of a session; callers decide which
    /// chunk that is via [`SizedReceive::is_first_chunk`], since only the reassembly slot knows
    /// whether a transfer is already underway.
    pub fn push(&mut self, total_len: Option<u32>, payload: &[u8]) -> Option<SizedChunk> {
        if self.cancelled {
            return None;
        }

        if self.total_len.is_none() {
            self.total_len = total_len;
        }

        let total = self.total_len?;
        let chunk = SizedChunk {
            offset: self.offset,
            total_len: total,
            payload: Box::from(payload),
        };
        self.offset += payload.len() as u32;

        if self.offset >= total {
            // Transfer complete: reset so the next chunk pushed starts a fresh one.
            self.total_len = None;
            self.offset = 0;
        }

        Some(chunk)
    }

    pub fn cancel(&mut self) {
        self.cancelled = true;
        self.total_len = None;
        self.offset = 0;
    }
}

/// A producer-driven lazy source of bytes queued for an outbound sized send (§3).
pub trait SizedSource: Send {
    /// Total length of the stream, known up front.
    fn total_len(&self) -> u32;
    /// Produces up to `max_len` bytes starting at `offset`. Returns an empty slice once exhausted.
    fn read(&mut self, offset: u32, max_len: usize) -> Box<[u8]>;
}

struct SizedSendEntry {
    type_byte: u8,
    offset: u32,
    source: Box<dyn SizedSource>,
}

/// One outbound presized chunk, ready to frame onto the wire (§3).
pub struct SizedSendChunk {
    pub type_byte: u8,
    /// `true` for the first chunk of this source's transfer: the caller must prefix the wire
    /// payload with the 4-byte `total_len`.
    pub is_first: bool,
    pub total_len: u32,
    pub payload: Box<[u8]>,
}

/// Queue of pending outbound sized sends for one connection (§3).
#[derive(Default)]
pub struct SizedSendQueue {
    queue: VecDeque<SizedSendEntry>,
}

impl SizedSendQueue {
    pub fn push(&mut self, type_byte: u8, source: Box<dyn SizedSource>) {
        self.queue.push_back(SizedSendEntry { type_byte, offset: 0, source });
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn pop_front(&mut self) {
        self.queue.pop_front();
    }

    /// Reads the next chunk (up to `max_len` bytes) from the front source, advancing its offset.
    /// Pops the source once it is exhausted. Returns `None` if the queue is empty.
    pub fn pump(&mut self, max_len: usize) -> Option<SizedSendChunk> {
        let entry = self.queue.front_mut()?;
        let is_first = entry.offset == 0;
        let total_len = entry.source.total_len();
        let payload = entry.source.read(entry.offset, max_len);
        entry.offset += payload.len() as u32;

        let chunk = SizedSendChunk { type_byte: entry.type_byte, is_first, total_len, payload };

        if entry.offset >= total_len {
            self.queue.pop_front();
        }

        Some(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn big_packet_round_trips_exactly() {
        let body: Vec<u8> = (0..2000u32).map(|i| (i % 256) as u8).collect();
        let chunk_size = 300;
        let mut reassembly = BigReassembly::default();

        let mut chunks = body.chunks(chunk_size).peekable();
        let mut result = None;
        while let Some(chunk) = chunks.next() {
            if chunks.peek().is_none() {
                result = Some(reassembly.push_final(chunk));
            } else {
                reassembly.push_chunk(chunk);
            }
        }

        match result.unwrap() {
            BigChunkResult::Complete(buf) => assert_eq!(&*buf, &body[..]),
            _ => panic!("expected completion"),
        }
    }

    #[test]
    fn big_packet_overflow_aborts_and_clears() {
        let mut reassembly = BigReassembly::default();
        let chunk = vec![0u8; MAX_BIG_PACKET_SIZE];
        assert!(matches!(reassembly.push_chunk(&chunk), BigChunkResult::Continuing));
        assert!(matches!(reassembly.push_chunk(&[0u8; 10]), BigChunkResult::Overflowed));
    }

    #[test]
    fn presized_offsets_are_ascending_and_final_matches_total() {
        let mut recv = SizedReceive::default();
        let c0 = recv.push(Some(100), &[0u8; 40]).unwrap();
        assert_eq!(c0.offset, 0);
        assert_eq!(c0.total_len, 100);

        let c1 = recv.push(None, &[0u8; 40]).unwrap();
        assert_eq!(c1.offset, 40);

        let c2 = recv.push(None, &[0u8; 20]).unwrap();
        assert_eq!(c2.offset, 80);
        assert_eq!(c2.offset + c2.payload.len() as u32, c2.total_len);
    }

    #[test]
    fn presized_receive_resets_after_completion_for_the_next_transfer() {
        let mut recv = SizedReceive::default();
        assert!(recv.is_first_chunk());
        recv.push(Some(40), &[0u8; 40]).unwrap();
        assert!(recv.is_first_chunk(), "transfer completed in one chunk, slot should be free again");

        let c0 = recv.push(Some(10), &[0u8; 6]).unwrap();
        assert_eq!(c0.offset, 0);
        assert!(!recv.is_first_chunk(), "second chunk still pending");
        recv.push(None, &[0u8; 4]).unwrap();
        assert!(recv.is_first_chunk());
    }

    struct FixedSource {
        total_len: u32,
        data: Vec<u8>,
    }

    impl SizedSource for FixedSource {
        fn total_len(&self) -> u32 {
            self.total_len
        }

        fn read(&mut self, offset: u32, max_len: usize) -> Box<[u8]> {
            let start = offset as usize;
            if start >= self.data.len() {
                return Box::from(&[][..]);
            }
            let end = (start + max_len).min(self.data.len());
            Box::from(&self.data[start..end])
        }
    }

    #[test]
    fn sized_send_queue_chunks_a_source_and_marks_only_the_first_chunk() {
        let mut queue = SizedSendQueue::default();
        let data: Vec<u8> = (0..25u32).map(|i| i as u8).collect();
        queue.push(0x20, Box::new(FixedSource { total_len: data.len() as u32, data }));

        let c0 = queue.pump(10).unwrap();
        assert!(c0.is_first);
        assert_eq!(c0.type_byte, 0x20);
        assert_eq!(c0.total_len, 25);
        assert_eq!(&*c0.payload, &(0..10u8).collect::<Vec<_>>()[..]);
        assert_eq!(queue.len(), 1, "source not yet exhausted");

        let c1 = queue.pump(10).unwrap();
        assert!(!c1.is_first);
        assert_eq!(queue.len(), 1);

        let c2 = queue.pump(10).unwrap();
        assert!(!c2.is_first);
        assert_eq!(&*c2.payload, &(20..25u8).collect::<Vec<_>>()[..]);
        assert!(queue.is_empty(), "source exhausted, entry popped");

        assert!(queue.pump(10).is_none());
    }
}

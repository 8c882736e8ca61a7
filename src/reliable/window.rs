//! Incoming reliable window: a fixed-size ring indexed by sequence modulo window size (§3, §4.2).

use super::sequence::{self, Seq};

/// Holds out-of-order reliable payloads until the gap in front of them closes, then yields them
/// back to the caller in ascending sequence order.
pub struct InWindow {
    window_size: u32,
    expected: Seq,
    slots: Vec<Option<Box<[u8]>>>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Accept {
    /// Sequence was below `expected`; an Ack must still be emitted, but the payload is a
    /// duplicate and must not be dispatched again.
    Duplicate,
    /// Sequence was outside `[expected, expected + window)`; dropped silently, no Ack.
    OutOfWindow,
    /// Sequence was accepted. `ready` holds every payload (including this one, if applicable)
    /// that is now deliverable in ascending order, because the gap in front of them has closed.
    Accepted { ready: Vec<Box<[u8]>> },
}

impl InWindow {
    pub fn new(window_size: u32, expected_start: Seq) -> Self {
        Self {
            window_size,
            expected: expected_start,
            slots: (0..window_size).map(|_| None).collect(),
        }
    }

    fn slot_index(&self, seq: Seq) -> usize {
        (sequence::sub(seq, self.expected) % self.window_size) as usize
    }

    pub fn expected(&self) -> Seq {
        self.expected
    }

    /// Processes one received reliable payload at `seq`. An Ack should be emitted by the caller
    /// whenever this returns anything other than `OutOfWindow`.
    pub fn receive(&mut self, seq: Seq, payload: Box<[u8]>) -> Accept {
        if sequence::is_duplicate(seq, self.expected) {
            return Accept::Duplicate;
        }

        if !sequence::in_window(seq, self.expected, self.window_size) {
            return Accept::OutOfWindow;
        }

        if seq == self.expected {
            let mut ready = vec![payload];
            self.expected = sequence::add(self.expected, 1);

            // Drain any already-stashed slots that are now contiguous.
            loop {
                let idx = self.slot_index(self.expected);
                match self.slots[idx].take() {
                    Some(next) => {
                        ready.push(next);
                        self.expected = sequence::add(self.expected, 1);
                    }
                    None => break,
                }
            }

            Accept::Accepted { ready }
        } else {
            let idx = self.slot_index(seq);
            self.slots[idx] = Some(payload);
            Accept::Accepted { ready: Vec::new() }
        }
    }
}

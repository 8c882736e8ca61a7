//! The registered-type-handler table (§9 re-architecture guidance): payload type bytes
//! `0x01..=0x3F` are not hardcoded game logic, they are dispatch targets a collaborator installs.

use std::sync::RwLock;

use crate::error::{Result, ZoneError};
use crate::player::PlayerId;

/// Handles one fully-received payload of a registered type, already stripped of its type byte.
pub trait PacketHandler: Send + Sync {
    fn handle(&self, player: PlayerId, payload: &[u8]);
}

/// Handles one chunk of an incoming registered *sized* transfer (§4.1, §6).
pub trait SizedPacketHandler: Send + Sync {
    fn handle_chunk(&self, player: PlayerId, offset: u32, total_len: u32, payload: &[u8]);
}

const TYPE_RANGE_START: u8 = 0x01;
const TYPE_RANGE_END: u8 = 0x3F;
const SLOT_COUNT: usize = (TYPE_RANGE_END - TYPE_RANGE_START + 1) as usize;

fn slot_for(type_byte: u8) -> Result<usize> {
    if !(TYPE_RANGE_START..=TYPE_RANGE_END).contains(&type_byte) {
        return Err(ZoneError::TypeByteOutOfRange(type_byte));
    }
    Ok((type_byte - TYPE_RANGE_START) as usize)
}

/// A fixed-capacity, write-lock-protected registry of payload-type handlers.
///
/// Fixed capacity (rather than a `HashMap`) mirrors the type-byte range itself being fixed by the
/// wire protocol: there can never be more than 63 registrations.
#[derive(Default)]
pub struct HandlerTable {
    packet: RwLock<[Option<Box<dyn PacketHandler>>; SLOT_COUNT]>,
    sized: RwLock<[Option<Box<dyn SizedPacketHandler>>; SLOT_COUNT]>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self {
            packet: RwLock::new(std::array::from_fn(|_| None)),
            sized: RwLock::new(std::array::from_fn(|_| None)),
        }
    }

    pub fn register(&self, type_byte: u8, handler: Box<dyn PacketHandler>) -> Result<()> {
        let idx = slot_for(type_byte)?;
        let mut table = self.packet.write().unwrap();
        if table[idx].is_some() {
            return Err(ZoneError::DuplicateTypeHandler(type_byte));
        }
        table[idx] = Some(handler);
        Ok(())
    }

    pub fn register_sized(&self, type_byte: u8, handler: Box<dyn SizedPacketHandler>) -> Result<()> {
        let idx = slot_for(type_byte)?;
        let mut table = self.sized.write().unwrap();
        if table[idx].is_some() {
            return Err(ZoneError::DuplicateTypeHandler(type_byte));
        }
        table[idx] = Some(handler);
        Ok(())
    }

    pub fn dispatch(&self, type_byte: u8, player: PlayerId, payload: &[u8]) {
        let Ok(idx) = slot_for(type_byte) else { return };
        let table = self.packet.read().unwrap();
        if let Some(handler) = &table[idx] {
            handler.handle(player, payload);
        }
    }

    pub fn dispatch_sized(&self, type_byte: u8, player: PlayerId, offset: u32, total_len: u32, payload: &[u8]) {
        let Ok(idx) = slot_for(type_byte) else { return };
        let table = self.sized.read().unwrap();
        if let Some(handler) = &table[idx] {
            handler.handle_chunk(player, offset, total_len, payload);
        }
    }

    pub fn is_sized(&self, type_byte: u8) -> bool {
        match slot_for(type_byte) {
            Ok(idx) => self.sized.read().unwrap()[idx].is_some(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct CountingHandler(Arc<AtomicU32>);
    impl PacketHandler for CountingHandler {
        fn handle(&self, _player: PlayerId, _payload: &[u8]) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn registering_twice_for_the_same_type_byte_is_rejected() {
        let table = HandlerTable::new();
        let count = Arc::new(AtomicU32::new(0));
        table.register(0x05, Box::new(CountingHandler(Arc::clone(&count)))).unwrap();
        assert!(matches!(
            table.register(0x05, Box::new(CountingHandler(count))),
            Err(ZoneError::DuplicateTypeHandler(0x05))
        ));
    }

    #[test]
    fn out_of_range_type_byte_is_rejected() {
        let table = HandlerTable::new();
        let count = Arc::new(AtomicU32::new(0));
        assert!(matches!(
            table.register(0x00, Box::new(CountingHandler(count))),
            Err(ZoneError::TypeByteOutOfRange(0x00))
        ));
    }

    #[test]
    fn dispatch_invokes_registered_handler() {
        let table = HandlerTable::new();
        let count = Arc::new(AtomicU32::new(0));
        table.register(0x05, Box::new(CountingHandler(Arc::clone(&count)))).unwrap();
        table.dispatch(0x05, PlayerId(1), b"hi");
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}

//! Framing of the "core" protocol (type-byte `0x00` sub-packets), mirroring the shape of
//! `uflow::frame`: one `enum` of wire frames plus a `Serialize`-style `read`/`write` pair, with
//! wire-format constants in a `serial` submodule.

/// Maximum payload carried by a single submission (§6).
pub const MAX_PACKET_SIZE: usize = 512;

/// First byte of every datagram that carries the core (network) protocol.
pub const CORE_TYPE_BYTE: u8 = 0x00;

/// Cap on a reassembled big packet (§4.1).
pub const MAX_BIG_PACKET_SIZE: usize = 64 * 1024;

/// Sub-type byte values for the core protocol (§4.1).
pub mod sub_type {
    pub const KEY_INIT: u8 = 0x01;
    pub const KEY_RESPONSE: u8 = 0x02;
    pub const RELIABLE: u8 = 0x03;
    pub const ACK: u8 = 0x04;
    pub const SYNC_REQUEST: u8 = 0x05;
    pub const SYNC_RESPONSE: u8 = 0x06;
    pub const DISCONNECT: u8 = 0x07;
    pub const BIG_CHUNK: u8 = 0x08;
    pub const BIG_FINAL: u8 = 0x09;
    pub const PRESIZED_DATA: u8 = 0x0A;
    pub const CANCEL_REQUEST: u8 = 0x0B;
    pub const CANCEL_ACK: u8 = 0x0C;
    pub const GROUPED: u8 = 0x0E;
    pub const KEY_INIT_CONTINUUM: u8 = 0x11;
    pub const CONTINUUM_KEY_RESPONSE: u8 = 0x13;
}

/// A parsed core (type-byte `0x00`) sub-packet.
#[derive(Clone, Debug, PartialEq)]
pub enum CoreFrame {
    KeyInit { key: u32, client_kind: u8, continuum: bool },
    KeyResponse { key: u32, continuum: bool },
    Reliable { seq: u32, payload: Box<[u8]> },
    Ack { seq: u32 },
    SyncRequest { timestamp: u32 },
    SyncResponse { echoed_timestamp: u32, server_timestamp: u32 },
    Disconnect,
    BigChunk { payload: Box<[u8]> },
    BigFinal { payload: Box<[u8]> },
    /// `body` is the raw sub-packet payload, length-prefix included when present. Whether a
    /// leading 4-byte length belongs to this chunk is session state the frame itself cannot
    /// know; the caller (the reassembly slot) strips it when appropriate.
    PresizedData { body: Box<[u8]> },
    CancelRequest,
    CancelAck,
    /// Each item is a single-byte-length-prefixed sub-packet's raw wire bytes (without the
    /// `0x00 0x0E` envelope).
    Grouped { items: Vec<Box<[u8]>> },
    OutOfSlots,
}

/// Reply for resource exhaustion on a new connection-init (§6, §7).
pub fn out_of_slots_reply() -> Box<[u8]> {
    Box::from([CORE_TYPE_BYTE, 0x07])
}

impl CoreFrame {
    /// Parses one core sub-packet from `data`, which must begin with the `0x00` type byte.
    /// `depth` guards against a Grouped packet nested inside another Grouped packet (§4.1): pass
    /// `0` for a packet taken straight off the wire, `1` when parsing an item pulled out of a
    /// Grouped envelope.
    pub fn parse(data: &[u8], depth: u32) -> Option<CoreFrame> {
        if data.len() < 2 || data[0] != CORE_TYPE_BYTE {
            return None;
        }
        let sub = data[1];
        let body = &data[2..];

        match sub {
            sub_type::KEY_INIT | sub_type::KEY_INIT_CONTINUUM => {
                if body.len() != 6 {
                    return None;
                }
                let key = read_u32_le(&body[0..4]);
                let client_kind = body[4];
                Some(CoreFrame::KeyInit { key, client_kind, continuum: sub == sub_type::KEY_INIT_CONTINUUM })
            }
            sub_type::KEY_RESPONSE | sub_type::CONTINUUM_KEY_RESPONSE => {
                if body.len() != 4 {
                    return None;
                }
                Some(CoreFrame::KeyResponse { key: read_u32_le(body), continuum: sub == sub_type::CONTINUUM_KEY_RESPONSE })
            }
            sub_type::RELIABLE => {
                if body.len() < 4 {
                    return None;
                }
                let seq = read_u32_le(&body[0..4]);
                Some(CoreFrame::Reliable { seq, payload: Box::from(&body[4..]) })
            }
            sub_type::ACK => {
                if body.len() != 4 {
                    return None;
                }
                Some(CoreFrame::Ack { seq: read_u32_le(body) })
            }
            sub_type::SYNC_REQUEST => {
                if body.len() != 4 {
                    return None;
                }
                Some(CoreFrame::SyncRequest { timestamp: read_u32_le(body) })
            }
            sub_type::SYNC_RESPONSE => {
                if body.len() != 8 {
                    return None;
                }
                Some(CoreFrame::SyncResponse {
                    echoed_timestamp: read_u32_le(&body[0..4]),
                    server_timestamp: read_u32_le(&body[4..8]),
                })
            }
            sub_type::DISCONNECT => Some(CoreFrame::Disconnect),
            sub_type::BIG_CHUNK => Some(CoreFrame::BigChunk { payload: Box::from(body) }),
            sub_type::BIG_FINAL => Some(CoreFrame::BigFinal { payload: Box::from(body) }),
            sub_type::PRESIZED_DATA => Some(CoreFrame::PresizedData { body: Box::from(body) }),
            sub_type::CANCEL_REQUEST => Some(CoreFrame::CancelRequest),
            sub_type::CANCEL_ACK => Some(CoreFrame::CancelAck),
            sub_type::GROUPED => {
                if depth >= 1 {
                    // A Grouped item is itself dispatched at depth 1 (see on_core_frame), so this
                    // rejects a Grouped nested inside a Grouped at any depth (§4.1).
                    return None;
                }
                parse_grouped(body).map(|items| CoreFrame::Grouped { items })
            }
            _ => None,
        }
    }

    /// Serializes this frame back to wire bytes, including the leading `0x00` type byte.
    pub fn write(&self) -> Box<[u8]> {
        let mut out = Vec::with_capacity(8);
        out.push(CORE_TYPE_BYTE);

        match self {
            CoreFrame::KeyInit { key, client_kind, continuum } => {
                out.push(if *continuum { sub_type::KEY_INIT_CONTINUUM } else { sub_type::KEY_INIT });
                out.extend_from_slice(&key.to_le_bytes());
                out.push(*client_kind);
                out.push(0);
            }
            CoreFrame::KeyResponse { key, continuum } => {
                out.push(if *continuum { sub_type::CONTINUUM_KEY_RESPONSE } else { sub_type::KEY_RESPONSE });
                out.extend_from_slice(&key.to_le_bytes());
            }
            CoreFrame::Reliable { seq, payload } => {
                out.push(sub_type::RELIABLE);
                out.extend_from_slice(&seq.to_le_bytes());
                out.extend_from_slice(payload);
            }
            CoreFrame::Ack { seq } => {
                out.push(sub_type::ACK);
                out.extend_from_slice(&seq.to_le_bytes());
            }
            CoreFrame::SyncRequest { timestamp } => {
                out.push(sub_type::SYNC_REQUEST);
                out.extend_from_slice(&timestamp.to_le_bytes());
            }
            CoreFrame::SyncResponse { echoed_timestamp, server_timestamp } => {
                out.push(sub_type::SYNC_RESPONSE);
                out.extend_from_slice(&echoed_timestamp.to_le_bytes());
                out.extend_from_slice(&server_timestamp.to_le_bytes());
            }
            CoreFrame::Disconnect => out.push(sub_type::DISCONNECT),
            CoreFrame::BigChunk { payload } => {
                out.push(sub_type::BIG_CHUNK);
                out.extend_from_slice(payload);
            }
            CoreFrame::BigFinal { payload } => {
                out.push(sub_type::BIG_FINAL);
                out.extend_from_slice(payload);
            }
            CoreFrame::PresizedData { body } => {
                out.push(sub_type::PRESIZED_DATA);
                out.extend_from_slice(body);
            }
            CoreFrame::CancelRequest => out.push(sub_type::CANCEL_REQUEST),
            CoreFrame::CancelAck => out.push(sub_type::CANCEL_ACK),
            CoreFrame::Grouped { items } => {
                out.push(sub_type::GROUPED);
                for item in items {
                    out.push(item.len() as u8);
                    out.extend_from_slice(item);
                }
            }
            CoreFrame::OutOfSlots => {
                return out_of_slots_reply();
            }
        }

        out.into_boxed_slice()
    }
}

fn parse_grouped(mut body: &[u8]) -> Option<Vec<Box<[u8]>>> {
    let mut items = Vec::new();
    while !body.is_empty() {
        let len = body[0] as usize;
        body = &body[1..];
        if len > body.len() {
            // Declared length exceeds remaining bytes: reject the whole datagram (§8).
            return None;
        }
        items.push(Box::from(&body[..len]));
        body = &body[len..];
    }
    Some(items)
}

fn read_u32_le(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_init_round_trips_and_matches_wire_shape() {
        let frame = CoreFrame::KeyInit { key: 0xEFBEADDE, client_kind: 0x01, continuum: false };
        let bytes = frame.write();
        assert_eq!(&*bytes, &[0x00, 0x01, 0xDE, 0xAD, 0xBE, 0xEF, 0x01, 0x00]);
        assert_eq!(CoreFrame::parse(&bytes, 0), Some(frame));
    }

    #[test]
    fn key_response_is_six_bytes() {
        let frame = CoreFrame::KeyResponse { key: 0xEFBEADDE, continuum: false };
        assert_eq!(&*frame.write(), &[0x00, 0x02, 0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn reliable_wire_form_matches_scenario_2() {
        let frame = CoreFrame::Reliable { seq: 7, payload: Box::from(&[0x42, 0xFF][..]) };
        assert_eq!(&*frame.write(), &[0x00, 0x03, 0x07, 0x00, 0x00, 0x00, 0x42, 0xFF]);
    }

    #[test]
    fn grouped_round_trip_is_a_bijection() {
        let items: Vec<Box<[u8]>> = vec![Box::from(&b"hello"[..]), Box::from(&b"world!"[..])];
        let frame = CoreFrame::Grouped { items: items.clone() };
        let bytes = frame.write();
        match CoreFrame::parse(&bytes, 0) {
            Some(CoreFrame::Grouped { items: parsed }) => assert_eq!(parsed, items),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn grouped_rejects_nested_grouped_at_depth_two() {
        let inner = CoreFrame::Grouped { items: vec![Box::from(&b"x"[..])] }.write();
        let mut outer_body = Vec::new();
        outer_body.push(inner.len() as u8);
        outer_body.extend_from_slice(&inner);
        let mut outer = vec![0x00, sub_type::GROUPED];
        outer.extend_from_slice(&outer_body);
        assert_eq!(CoreFrame::parse(&outer, 1), None);
    }

    #[test]
    fn grouped_with_overlong_declared_length_is_rejected() {
        let bytes = [0x00, sub_type::GROUPED, 0xFF, b'a', b'b'];
        assert_eq!(CoreFrame::parse(&bytes, 0), None);
    }

    #[test]
    fn ack_is_rejected_at_malformed_length() {
        let bytes = [0x00, sub_type::ACK, 0x01];
        assert_eq!(CoreFrame::parse(&bytes, 0), None);
    }
}

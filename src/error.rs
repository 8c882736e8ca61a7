//! Error types for operations that have a legitimate caller-visible failure mode.
//!
//! Per-packet faults (malformed packets, lifecycle violations, handler panics) are not
//! represented here -- they are recovered locally by logging and dropping, per the base
//! error-handling design. This enum covers setup-time and API-misuse failures only.

use std::net::SocketAddr;

/// Errors surfaced by the zone core's public API.
#[derive(Debug, thiserror::Error)]
pub enum ZoneError {
    /// A listening bucket's game or ping socket could not be bound.
    #[error("failed to bind listener on {addr}: {source}")]
    ListenerBind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// A token-bucket bandwidth limiter was configured with invalid percentages.
    #[error("bandwidth priority percentages must sum to 100, got {sum}")]
    InvalidPriorityShares { sum: u8 },

    /// A `Config` failed its own validation.
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: &'static str },

    /// A payload type handler was registered twice for the same type byte.
    #[error("type byte {0:#04x} already has a registered handler")]
    DuplicateTypeHandler(u8),

    /// A payload type byte outside the registrable range [0x01, 0x3F] was used.
    #[error("type byte {0:#04x} is out of the registrable range 0x01..=0x3F")]
    TypeByteOutOfRange(u8),

    /// A broker interface lookup failed and the caller asked for a hard error instead of `None`.
    #[error("no interface registered for {0}")]
    InterfaceNotFound(&'static str),

    /// An interface could not be unregistered because other holders still reference it.
    #[error("interface {name} still has {refs} active reference(s)")]
    InterfaceInUse { name: &'static str, refs: u32 },
}

pub type Result<T> = std::result::Result<T, ZoneError>;

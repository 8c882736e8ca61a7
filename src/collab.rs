//! Traits the core consumes from external collaborators (§6). The core is generic over these so
//! that encryption math, authentication policy, billing, and chat routing stay out of its scope.

use crate::player::PlayerId;

/// A pluggable per-connection encryption transform, applied on ingress/egress (§4.1 step 2).
///
/// Implementations transform `buf[..len]` in place and return the new length, which must not
/// exceed `len` plus a small fixed headroom. A `NullEncryption` that performs no transform is
/// provided for zones that do not negotiate encryption.
pub trait Encryption: Send {
    /// Encrypts `buf[..len]` in place, returning the new length.
    fn encrypt(&mut self, player: PlayerId, buf: &mut [u8], len: usize) -> usize;
    /// Decrypts `buf[..len]` in place, returning the new length. A return of `0` signals a
    /// decrypt failure and the caller drops the datagram per §7.
    fn decrypt(&mut self, player: PlayerId, buf: &mut [u8], len: usize) -> usize;
    /// Releases any per-player state held by this transform.
    fn void(&mut self, player: PlayerId);
}

/// No-op transform used when a zone negotiates no encryption.
#[derive(Default)]
pub struct NullEncryption;

impl Encryption for NullEncryption {
    fn encrypt(&mut self, _player: PlayerId, _buf: &mut [u8], len: usize) -> usize {
        len
    }

    fn decrypt(&mut self, _player: PlayerId, _buf: &mut [u8], len: usize) -> usize {
        len
    }

    fn void(&mut self, _player: PlayerId) {}
}

/// Result codes returned by the authentication collaborator (§6).
#[derive(Clone, Debug, PartialEq)]
pub enum AuthCode {
    Ok,
    NewName,
    BadPassword,
    ArenaFull,
    LockedOut,
    NoPermission,
    SpecOnly,
    TooManyPoints,
    TooSlow,
    NoScores,
    /// Carries a variable-length message; exact framing is left to the authentication
    /// collaborator (base spec §9, Open Question).
    CustomText(String),
}

impl AuthCode {
    /// `true` for the codes that let the player proceed to global sync.
    pub fn is_success(&self) -> bool {
        matches!(self, AuthCode::Ok | AuthCode::SpecOnly | AuthCode::NoScores)
    }
}

/// Outcome handed to the `done_cb` passed to [`Authentication::authenticate`].
#[derive(Clone, Debug, PartialEq)]
pub struct AuthResult {
    pub code: AuthCode,
    /// Present for success codes (`Ok`/`SpecOnly`/`NoScores`).
    pub name: Option<String>,
    /// Present for success codes (`Ok`/`SpecOnly`/`NoScores`).
    pub squad: Option<String>,
}

impl AuthResult {
    pub fn success(code: AuthCode, name: String, squad: String) -> Self {
        debug_assert!(code.is_success());
        Self { code, name: Some(name), squad: Some(squad) }
    }

    pub fn failure(code: AuthCode) -> Self {
        debug_assert!(!code.is_success());
        Self { code, name: None, squad: None }
    }
}

/// Authenticates a login payload for `player`, invoking `done_cb` with the result once the
/// collaborator has made a decision. The collaborator may call `done_cb` synchronously or defer
/// it to another thread (e.g. while a database round trip is in flight).
pub trait Authentication: Send + Sync {
    fn authenticate(
        &self,
        player: PlayerId,
        login_payload: &[u8],
        done_cb: Box<dyn FnOnce(AuthResult) + Send>,
    );
}

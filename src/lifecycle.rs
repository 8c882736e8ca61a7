//! The per-player lifecycle state machine (§4.5).
//!
//! States progress:
//!
//! ```text
//! Uninitialized -> Connected -> NeedAuth -> WaitAuth
//!   -> { Connected (auth fail) | NeedGlobalSync -> WaitGlobalSync1
//!        -> DoGlobalCallbacks -> SendLoginResponse -> LoggedIn }
//! LoggedIn <-> { DoFreqAndArenaSync -> WaitArenaSync1 -> ArenaRespAndCallbacks
//!                -> Playing -> LeavingArena -> DoArenaSync2 -> WaitArenaSync2 -> LoggedIn }
//! LoggedIn -> LeavingZone -> WaitGlobalSync2 -> TimeWait
//! ```

use crate::collab::AuthResult;

/// A state in the player lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Uninitialized,
    Connected,
    NeedAuth,
    WaitAuth,
    NeedGlobalSync,
    WaitGlobalSync1,
    DoGlobalCallbacks,
    SendLoginResponse,
    LoggedIn,
    DoFreqAndArenaSync,
    WaitArenaSync1,
    ArenaRespAndCallbacks,
    Playing,
    LeavingArena,
    DoArenaSync2,
    WaitArenaSync2,
    LeavingZone,
    WaitGlobalSync2,
    TimeWait,
}

impl State {
    /// The arena handle on a `Player` is valid only in this range (§3 invariant).
    pub fn arena_handle_valid(&self) -> bool {
        matches!(
            self,
            State::DoFreqAndArenaSync
                | State::WaitArenaSync1
                | State::ArenaRespAndCallbacks
                | State::Playing
                | State::LeavingArena
                | State::DoArenaSync2
                | State::WaitArenaSync2
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, State::TimeWait)
    }

    pub fn accepts_sends(&self) -> bool {
        !matches!(self, State::TimeWait | State::Uninitialized)
    }

    /// `true` while this player counts as "ours" for the standard send-thread sweep (§4.1, §5).
    pub fn is_ours_range(&self) -> bool {
        !matches!(self, State::Uninitialized | State::TimeWait)
    }
}

/// Reasons a player can be driven toward `LeavingArena`/`LeavingZone`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KickReason {
    ClientRequest,
    AdminKick,
    Lagout,
    /// The send scheduler gave up on this connection: retries exhausted or the out-list grew
    /// past its cap (§4.3).
    Unresponsive,
}

/// Drives `Player::state` forward. Kept separate from `Player` itself so that transition logic
/// (and its unit tests) doesn't need a live connection or socket.
pub struct Machine {
    pub state: State,
}

impl Machine {
    pub fn new() -> Self {
        Self { state: State::Uninitialized }
    }

    /// Entered when the connection-init handler creates the player.
    pub fn on_connection_init(&mut self) {
        debug_assert_eq!(self.state, State::Uninitialized);
        self.state = State::Connected;
    }

    /// Entered when the client's login sub-packet is fully received and length-validated.
    pub fn on_login_received(&mut self) {
        if self.state == State::Connected {
            self.state = State::NeedAuth;
        }
    }

    pub fn on_auth_dispatched(&mut self) {
        if self.state == State::NeedAuth {
            self.state = State::WaitAuth;
        }
    }

    /// Advances (or reverts) the state machine once the authentication collaborator calls back.
    pub fn on_auth_result(&mut self, result: &AuthResult) {
        if self.state != State::WaitAuth {
            return;
        }
        if result.code.is_success() {
            self.state = State::NeedGlobalSync;
        } else {
            self.state = State::Connected;
        }
    }

    pub fn on_global_sync_requested(&mut self) {
        if self.state == State::NeedGlobalSync {
            self.state = State::WaitGlobalSync1;
        }
    }

    pub fn on_global_sync_complete(&mut self) {
        if self.state == State::WaitGlobalSync1 {
            self.state = State::DoGlobalCallbacks;
        }
    }

    pub fn on_global_callbacks_complete(&mut self) {
        if self.state == State::DoGlobalCallbacks {
            self.state = State::SendLoginResponse;
        }
    }

    pub fn on_login_response_sent(&mut self) {
        if self.state == State::SendLoginResponse {
            self.state = State::LoggedIn;
        }
    }

    /// Entered when a player in `LoggedIn` begins entering an arena.
    pub fn on_enter_arena_requested(&mut self) {
        if self.state == State::LoggedIn {
            self.state = State::DoFreqAndArenaSync;
        }
    }

    pub fn on_arena_sync_requested(&mut self) {
        if self.state == State::DoFreqAndArenaSync {
            self.state = State::WaitArenaSync1;
        }
    }

    pub fn on_arena_sync_complete(&mut self) {
        if self.state == State::WaitArenaSync1 {
            self.state = State::ArenaRespAndCallbacks;
        }
    }

    pub fn on_arena_callbacks_complete(&mut self) {
        if self.state == State::ArenaRespAndCallbacks {
            self.state = State::Playing;
        }
    }

    /// Entered on client request, kick, or lagout (§4.5).
    pub fn on_leave_arena(&mut self, _reason: KickReason) {
        if self.state == State::Playing {
            self.state = State::LeavingArena;
        }
    }

    pub fn on_arena_leave_sync_requested(&mut self) {
        if self.state == State::LeavingArena {
            self.state = State::DoArenaSync2;
        }
    }

    pub fn on_arena_leave_sync_dispatched(&mut self) {
        if self.state == State::DoArenaSync2 {
            self.state = State::WaitArenaSync2;
        }
    }

    pub fn on_arena_leave_sync_complete(&mut self) {
        if self.state == State::WaitArenaSync2 {
            self.state = State::LoggedIn;
        }
    }

    /// Entered when a logged-in player leaves the zone entirely (disconnect, kick, timeout).
    pub fn on_leave_zone(&mut self) {
        if matches!(self.state, State::LoggedIn | State::Playing | State::LeavingArena) {
            self.state = State::LeavingZone;
        }
    }

    pub fn on_global_leave_sync_requested(&mut self) {
        if self.state == State::LeavingZone {
            self.state = State::WaitGlobalSync2;
        }
    }

    /// Enters the terminal drain state; the player and its connection record may be disposed once
    /// no thread holds a reference (§3, §4.5).
    pub fn on_global_leave_sync_complete(&mut self) {
        if self.state == State::WaitGlobalSync2 {
            self.state = State::TimeWait;
        }
    }
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_happy_path_reaches_logged_in() {
        let mut m = Machine::new();
        m.on_connection_init();
        m.on_login_received();
        m.on_auth_dispatched();
        m.on_auth_result(&AuthResult::success(
            crate::collab::AuthCode::Ok,
            "Foo".into(),
            "".into(),
        ));
        m.on_global_sync_requested();
        m.on_global_sync_complete();
        m.on_global_callbacks_complete();
        m.on_login_response_sent();
        assert_eq!(m.state, State::LoggedIn);
    }

    #[test]
    fn failed_auth_returns_to_connected() {
        let mut m = Machine::new();
        m.on_connection_init();
        m.on_login_received();
        m.on_auth_dispatched();
        m.on_auth_result(&AuthResult::failure(crate::collab::AuthCode::BadPassword));
        assert_eq!(m.state, State::Connected);
    }

    #[test]
    fn arena_round_trip_returns_to_logged_in() {
        let mut m = Machine::new();
        m.state = State::LoggedIn;
        m.on_enter_arena_requested();
        m.on_arena_sync_requested();
        m.on_arena_sync_complete();
        m.on_arena_callbacks_complete();
        assert_eq!(m.state, State::Playing);
        assert!(m.state.arena_handle_valid());

        m.on_leave_arena(KickReason::ClientRequest);
        m.on_arena_leave_sync_requested();
        m.on_arena_leave_sync_dispatched();
        m.on_arena_leave_sync_complete();
        assert_eq!(m.state, State::LoggedIn);
    }

    #[test]
    fn zone_leave_reaches_time_wait() {
        let mut m = Machine::new();
        m.state = State::LoggedIn;
        m.on_leave_zone();
        m.on_global_leave_sync_requested();
        m.on_global_leave_sync_complete();
        assert!(m.state.is_terminal());
    }
}

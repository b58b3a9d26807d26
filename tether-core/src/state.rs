//! Client connection lifecycle: Disconnected -> Connecting -> Connected -> Disconnected.
//!
//! Only socket events and explicit disconnect move the machine. Every connect
//! attempt gets a fresh [`Epoch`]; events reported for an older epoch belong to
//! an abandoned attempt and are ignored, so a late connect or close can never
//! resurrect or double-report a session.

/// Client-side connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(s)
    }
}

/// Identifies one connect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Epoch(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("connect requested while {0}")]
    AlreadyActive(ConnectionState),
}

/// Transition table for one client. Methods return `Some(new_state)` when the
/// state changed and the listener should hear about it, `None` otherwise.
#[derive(Debug)]
pub struct ClientMachine {
    state: ConnectionState,
    epoch: u64,
}

impl Default for ClientMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientMachine {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            epoch: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Whether `epoch` is the attempt currently in progress (or established).
    pub fn is_current(&self, epoch: Epoch) -> bool {
        self.state != ConnectionState::Disconnected && epoch.0 == self.epoch
    }

    /// Disconnected -> Connecting.
    pub fn start_connect(&mut self) -> Result<Epoch, TransitionError> {
        if self.state != ConnectionState::Disconnected {
            return Err(TransitionError::AlreadyActive(self.state));
        }
        self.epoch += 1;
        self.state = ConnectionState::Connecting;
        Ok(Epoch(self.epoch))
    }

    /// Connecting -> Connected when the socket for `epoch` is up.
    pub fn on_connected(&mut self, epoch: Epoch) -> Option<ConnectionState> {
        if !self.is_current(epoch) || self.state != ConnectionState::Connecting {
            return None;
        }
        self.state = ConnectionState::Connected;
        Some(self.state)
    }

    /// Connecting -> Disconnected when the connect for `epoch` failed.
    pub fn on_connect_failed(&mut self, epoch: Epoch) -> Option<ConnectionState> {
        if !self.is_current(epoch) || self.state != ConnectionState::Connecting {
            return None;
        }
        self.state = ConnectionState::Disconnected;
        Some(self.state)
    }

    /// Socket for `epoch` closed (peer close, I/O or protocol error).
    pub fn on_closed(&mut self, epoch: Epoch) -> Option<ConnectionState> {
        if !self.is_current(epoch) {
            return None;
        }
        self.state = ConnectionState::Disconnected;
        Some(self.state)
    }

    /// Explicit disconnect. Idempotent: a second call reports nothing.
    pub fn disconnect(&mut self) -> Option<ConnectionState> {
        if self.state == ConnectionState::Disconnected {
            return None;
        }
        self.state = ConnectionState::Disconnected;
        Some(self.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;

    #[test]
    fn happy_path() {
        let mut m = ClientMachine::new();
        assert_eq!(m.state(), Disconnected);
        let e = m.start_connect().unwrap();
        assert_eq!(m.state(), Connecting);
        assert_eq!(m.on_connected(e), Some(Connected));
        assert!(m.is_connected());
        assert_eq!(m.on_closed(e), Some(Disconnected));
        assert!(!m.is_connected());
    }

    #[test]
    fn connect_failure_returns_to_disconnected() {
        let mut m = ClientMachine::new();
        let e = m.start_connect().unwrap();
        assert_eq!(m.on_connect_failed(e), Some(Disconnected));
        assert_eq!(m.on_connected(e), None);
        assert_eq!(m.state(), Disconnected);
    }

    #[test]
    fn connect_only_from_disconnected() {
        let mut m = ClientMachine::new();
        let e = m.start_connect().unwrap();
        assert_eq!(
            m.start_connect(),
            Err(TransitionError::AlreadyActive(Connecting))
        );
        m.on_connected(e);
        assert_eq!(m.start_connect(), Err(TransitionError::AlreadyActive(Connected)));
    }

    #[test]
    fn disconnect_is_idempotent() {
        let mut m = ClientMachine::new();
        assert_eq!(m.disconnect(), None);
        let e = m.start_connect().unwrap();
        m.on_connected(e);
        assert_eq!(m.disconnect(), Some(Disconnected));
        assert_eq!(m.disconnect(), None);
    }

    #[test]
    fn events_from_abandoned_attempt_are_ignored() {
        let mut m = ClientMachine::new();
        let old = m.start_connect().unwrap();
        m.disconnect();
        assert_eq!(m.on_connected(old), None);
        assert_eq!(m.state(), Disconnected);

        let new = m.start_connect().unwrap();
        assert_ne!(old, new);
        assert_eq!(m.on_closed(old), None);
        assert_eq!(m.on_connect_failed(old), None);
        assert_eq!(m.state(), Connecting);
        assert_eq!(m.on_connected(new), Some(Connected));
    }

    #[test]
    fn close_while_connecting() {
        let mut m = ClientMachine::new();
        let e = m.start_connect().unwrap();
        assert_eq!(m.on_closed(e), Some(Disconnected));
        assert_eq!(m.on_closed(e), None);
    }
}

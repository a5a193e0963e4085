use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindState {
    Unbound,
    Binding,
    Bound,
    Unbinding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Readability and writability of a tunnel as seen by its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterestOps {
    pub readable: bool,
    pub writable: bool,
}

impl Default for InterestOps {
    fn default() -> Self {
        Self {
            readable: true,
            writable: true,
        }
    }
}

/// A small state machine cell with compare-and-set transitions.
#[derive(Debug)]
pub struct StateCell<S> {
    state: Mutex<S>,
}

impl<S: Copy + Eq> StateCell<S> {
    pub fn new(initial: S) -> Self {
        Self {
            state: Mutex::new(initial),
        }
    }

    pub fn get(&self) -> S {
        *self.state.lock()
    }

    pub fn set(&self, next: S) {
        *self.state.lock() = next;
    }

    /// Moves to `next` only when the current state is `expected`.
    pub fn compare_and_set(&self, expected: S, next: S) -> bool {
        let mut state = self.state.lock();
        if *state != expected {
            return false;
        }
        *state = next;
        true
    }

    pub fn is(&self, expected: S) -> bool {
        self.get() == expected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_only_from_expected_state() {
        let cell = StateCell::new(ConnectState::Disconnected);
        assert!(!cell.compare_and_set(ConnectState::Connected, ConnectState::Disconnecting));
        assert!(cell.compare_and_set(ConnectState::Disconnected, ConnectState::Connecting));
        assert!(!cell.compare_and_set(ConnectState::Disconnected, ConnectState::Connecting));
        assert!(cell.is(ConnectState::Connecting));
    }
}

//! Link State Machine
//!
//! Tracks adapter availability, scanning and the single device connection, and
//! defines which transitions are valid.

use crate::AdapterState;

/// Externally visible connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Scanning,
    Connecting,
    Connected,
    /// Overlay while the adapter is anything other than powered on
    AdapterUnavailable,
}

/// Lifecycle of the single device link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkPhase {
    #[default]
    Idle,
    Connecting,
    Connected,
}

/// Events that can trigger state transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkTrigger {
    /// Platform reported a new adapter state
    AdapterChanged(AdapterState),
    /// Discovery started (or restarted)
    ScanStarted,
    /// Discovery ended by timeout or explicit stop
    ScanStopped,
    /// A connect attempt began
    ConnectRequested,
    /// Transport session established and topology resolved
    ConnectSucceeded,
    /// Connect attempt failed
    ConnectFailed,
    /// Link torn down (requested or transport drop)
    Disconnected,
}

/// Result of a state transition attempt
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionResult {
    /// Transition was valid
    Success(ConnectionState),
    /// Transition was invalid from current state
    Invalid {
        from: ConnectionState,
        trigger: LinkTrigger,
    },
    /// Adapter left PoweredOn; scan and link were force-cleared
    AdapterLost { link_dropped: bool, scan_stopped: bool },
    /// Adapter came back; state returns to Idle without reconnecting
    AdapterRestored,
}

#[derive(Debug, Default)]
pub struct LinkStateMachine {
    adapter: AdapterState,
    scanning: bool,
    phase: LinkPhase,
}

impl LinkStateMachine {
    /// Create a state machine with an unknown adapter
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a state machine seeded with the adapter's current state
    pub fn with_adapter(adapter: AdapterState) -> Self {
        Self {
            adapter,
            ..Self::default()
        }
    }

    pub fn adapter(&self) -> AdapterState {
        self.adapter
    }

    pub fn phase(&self) -> LinkPhase {
        self.phase
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    /// Derived connection state
    pub fn state(&self) -> ConnectionState {
        if !self.adapter.is_ready() {
            return ConnectionState::AdapterUnavailable;
        }
        match self.phase {
            LinkPhase::Connecting => ConnectionState::Connecting,
            LinkPhase::Connected => ConnectionState::Connected,
            LinkPhase::Idle if self.scanning => ConnectionState::Scanning,
            LinkPhase::Idle => ConnectionState::Idle,
        }
    }

    /// Process a trigger and return the transition result
    pub fn process(&mut self, trigger: LinkTrigger) -> TransitionResult {
        use LinkPhase::*;
        use LinkTrigger::*;

        if let AdapterChanged(next) = trigger {
            return self.apply_adapter(next);
        }

        let from = self.state();
        let ready = self.adapter.is_ready();

        let valid = match (trigger, self.phase) {
            (ScanStarted, _) if ready => {
                self.scanning = true;
                true
            }
            (ScanStopped, _) => {
                self.scanning = false;
                true
            }
            (ConnectRequested, Idle) if ready => {
                self.phase = Connecting;
                true
            }
            (ConnectSucceeded, Connecting) if ready => {
                self.phase = Connected;
                true
            }
            (ConnectFailed, Connecting) | (Disconnected, Connecting | Connected) => {
                self.phase = Idle;
                true
            }
            _ => false,
        };

        if valid {
            TransitionResult::Success(self.state())
        } else {
            TransitionResult::Invalid { from, trigger }
        }
    }

    fn apply_adapter(&mut self, next: AdapterState) -> TransitionResult {
        let was_ready = self.adapter.is_ready();
        self.adapter = next;

        match (was_ready, next.is_ready()) {
            (true, false) => {
                let link_dropped = self.phase != LinkPhase::Idle;
                let scan_stopped = self.scanning;
                self.phase = LinkPhase::Idle;
                self.scanning = false;
                TransitionResult::AdapterLost {
                    link_dropped,
                    scan_stopped,
                }
            }
            (false, true) => TransitionResult::AdapterRestored,
            _ => TransitionResult::Success(self.state()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn powered() -> LinkStateMachine {
        LinkStateMachine::with_adapter(AdapterState::PoweredOn)
    }

    #[test]
    fn test_initial_state() {
        assert_eq!(
            LinkStateMachine::new().state(),
            ConnectionState::AdapterUnavailable
        );
        assert_eq!(powered().state(), ConnectionState::Idle);
    }

    #[test]
    fn test_scan_cycle() {
        let mut fsm = powered();
        let result = fsm.process(LinkTrigger::ScanStarted);
        assert_eq!(result, TransitionResult::Success(ConnectionState::Scanning));

        let result = fsm.process(LinkTrigger::ScanStopped);
        assert_eq!(result, TransitionResult::Success(ConnectionState::Idle));
    }

    #[test]
    fn test_connect_cycle() {
        let mut fsm = powered();
        fsm.process(LinkTrigger::ScanStarted);

        let result = fsm.process(LinkTrigger::ConnectRequested);
        assert_eq!(result, TransitionResult::Success(ConnectionState::Connecting));

        let result = fsm.process(LinkTrigger::ConnectSucceeded);
        assert_eq!(result, TransitionResult::Success(ConnectionState::Connected));

        // Scan ending does not affect the link
        fsm.process(LinkTrigger::ScanStopped);
        assert_eq!(fsm.state(), ConnectionState::Connected);

        let result = fsm.process(LinkTrigger::Disconnected);
        assert_eq!(result, TransitionResult::Success(ConnectionState::Idle));
    }

    #[test]
    fn test_connect_failure_returns_to_idle() {
        let mut fsm = powered();
        fsm.process(LinkTrigger::ConnectRequested);
        let result = fsm.process(LinkTrigger::ConnectFailed);
        assert_eq!(result, TransitionResult::Success(ConnectionState::Idle));
    }

    #[test]
    fn test_invalid_transitions() {
        let mut fsm = powered();

        let result = fsm.process(LinkTrigger::ConnectSucceeded);
        assert!(matches!(result, TransitionResult::Invalid { .. }));

        let result = fsm.process(LinkTrigger::Disconnected);
        assert!(matches!(result, TransitionResult::Invalid { .. }));
        assert_eq!(fsm.state(), ConnectionState::Idle);
    }

    #[test]
    fn test_operations_rejected_without_adapter() {
        let mut fsm = LinkStateMachine::with_adapter(AdapterState::PoweredOff);
        assert!(matches!(
            fsm.process(LinkTrigger::ScanStarted),
            TransitionResult::Invalid { .. }
        ));
        assert!(matches!(
            fsm.process(LinkTrigger::ConnectRequested),
            TransitionResult::Invalid { .. }
        ));
    }

    #[test]
    fn test_adapter_loss_clears_link_and_restores_to_idle() {
        let mut fsm = powered();
        fsm.process(LinkTrigger::ScanStarted);
        fsm.process(LinkTrigger::ConnectRequested);
        fsm.process(LinkTrigger::ConnectSucceeded);

        let result = fsm.process(LinkTrigger::AdapterChanged(AdapterState::PoweredOff));
        assert_eq!(
            result,
            TransitionResult::AdapterLost {
                link_dropped: true,
                scan_stopped: true
            }
        );
        assert_eq!(fsm.state(), ConnectionState::AdapterUnavailable);
        assert_eq!(fsm.phase(), LinkPhase::Idle);

        // Resetting is still unavailable
        let result = fsm.process(LinkTrigger::AdapterChanged(AdapterState::Resetting));
        assert_eq!(
            result,
            TransitionResult::Success(ConnectionState::AdapterUnavailable)
        );

        let result = fsm.process(LinkTrigger::AdapterChanged(AdapterState::PoweredOn));
        assert_eq!(result, TransitionResult::AdapterRestored);
        assert_eq!(fsm.state(), ConnectionState::Idle);
    }
}

//! Streaming-client state machine (C4): a pure event/action reducer plus
//! subscription bookkeeping, decoupled from any transport or provider
//! implementation.
//!
//! [`StreamingSupervisor::handle`] mirrors the `(state, event) -> (state,
//! actions)` shape used for connection supervision elsewhere in this
//! workspace: the reducer never performs I/O itself. Callers own opening the
//! transport, sending credentials, and scheduling timers, then feed the
//! results back in as further events.

use std::collections::HashMap;
use std::time::Duration;

use crate::types::{SubscriptionId, SubscriptionKind};

/// Lifecycle state of one streaming client. `Active` is the only state in
/// which subscriptions transmit to the wire; `Disposed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport open, not attempting to connect.
    Disconnected,
    /// Transport open request in flight.
    Connecting {
        /// 1-based attempt counter within the current connect sequence.
        attempt: u32,
    },
    /// Transport open; credentials sent, awaiting acceptance.
    Authenticating,
    /// Authenticated; subscriptions are live.
    Active,
    /// Connection was lost from `Active`; reconnecting.
    Reconnecting {
        /// 1-based attempt counter within the current reconnect sequence.
        attempt: u32,
    },
    /// Terminal. No further transitions are possible.
    Disposed,
}

/// Inputs to the reducer. Everything that isn't a pure state transition
/// (timer firing, I/O completing) arrives as one of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Caller wants to (re)connect.
    ConnectRequested,
    /// The transport finished opening.
    TransportOpened,
    /// The transport failed to open or dropped.
    TransportFailed,
    /// The vendor-specific credentials deadline elapsed with no response.
    CredentialsDeadlineElapsed,
    /// The vendor accepted the credentials.
    AuthenticationAccepted,
    /// The vendor rejected the credentials.
    AuthenticationRejected,
    /// `Active` connection was lost (transport error).
    ConnectionLost,
    /// No heartbeat pong within the timeout.
    HeartbeatTimeout,
    /// A scheduled backoff timer elapsed; retry the connect/reconnect attempt.
    BackoffElapsed,
    /// The circuit breaker's 30s recloses timer elapsed.
    CircuitRecloseElapsed,
    /// Caller wants to tear the client down permanently.
    Dispose,
}

/// Side effects the caller must perform in response to a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Open the underlying transport.
    OpenTransport,
    /// Send credentials within `deadline`.
    SendCredentials {
        /// Vendor-specific credentials deadline.
        deadline: Duration,
    },
    /// Schedule a single-shot timer; fire `Event::BackoffElapsed` after `delay`.
    ScheduleReconnect {
        /// Backoff delay before the next connect attempt.
        delay: Duration,
    },
    /// Resubscribe to every currently-tracked subscription in one message.
    ResubscribeAll,
    /// Surface an unrecoverable error; never auto-retried.
    SurfaceFatal,
    /// Start the periodic heartbeat ping task.
    StartHeartbeat,
    /// Stop the heartbeat ping task.
    StopHeartbeat,
    /// The circuit breaker opened; stop attempting connects.
    OpenCircuitBreaker,
    /// Schedule a timer; fire `Event::CircuitRecloseElapsed` after `delay`.
    ScheduleCircuitReclose {
        /// Delay before the breaker recloses.
        delay: Duration,
    },
}

const MAX_CONNECT_ATTEMPTS: u32 = 5;
const CIRCUIT_OPEN_THRESHOLD: u32 = 5;
const BACKOFF_BASE_MS: u64 = 2_000;
const BACKOFF_CAP_MS: u64 = 30_000;
const CIRCUIT_RECLOSE: Duration = Duration::from_secs(30);
const CREDENTIALS_DEADLINE: Duration = Duration::from_secs(10);

fn backoff_delay(attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(20);
    let exp = BACKOFF_BASE_MS.saturating_mul(1u64 << shift);
    Duration::from_millis(exp.min(BACKOFF_CAP_MS))
}

/// Pure connection-state reducer for one streaming client.
#[derive(Debug, Clone)]
pub struct StreamingSupervisor {
    /// Current lifecycle state.
    pub state: ConnectionState,
    /// Consecutive connect/reconnect failures since the last success.
    pub consecutive_failures: u32,
    /// Whether the circuit breaker is currently open.
    pub circuit_open: bool,
}

impl Default for StreamingSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamingSupervisor {
    /// A fresh supervisor in `Disconnected`, no prior failures.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            consecutive_failures: 0,
            circuit_open: false,
        }
    }

    /// Apply one event, producing the next state and the actions the caller
    /// must perform.
    #[must_use]
    pub fn handle(mut self, event: Event) -> (Self, Vec<Action>) {
        let prev = self.state;
        let (next_state, actions) = match (prev, event) {
            (ConnectionState::Disconnected, Event::ConnectRequested) if self.circuit_open => (
                ConnectionState::Disconnected,
                vec![Action::ScheduleCircuitReclose {
                    delay: CIRCUIT_RECLOSE,
                }],
            ),
            (ConnectionState::Disconnected, Event::ConnectRequested) => (
                ConnectionState::Connecting { attempt: 1 },
                vec![Action::OpenTransport],
            ),

            (ConnectionState::Connecting { .. }, Event::TransportOpened)
            | (ConnectionState::Reconnecting { .. }, Event::TransportOpened) => (
                ConnectionState::Authenticating,
                vec![Action::SendCredentials {
                    deadline: CREDENTIALS_DEADLINE,
                }],
            ),

            (ConnectionState::Connecting { attempt }, Event::TransportFailed) => {
                self.consecutive_failures += 1;
                self.after_connect_failure(attempt, false)
            }
            (ConnectionState::Reconnecting { attempt }, Event::TransportFailed) => {
                self.consecutive_failures += 1;
                self.after_connect_failure(attempt, true)
            }

            (ConnectionState::Authenticating, Event::AuthenticationAccepted) => {
                self.consecutive_failures = 0;
                (
                    ConnectionState::Active,
                    vec![Action::StartHeartbeat, Action::ResubscribeAll],
                )
            }
            (ConnectionState::Authenticating, Event::AuthenticationRejected) => {
                (ConnectionState::Disposed, vec![Action::SurfaceFatal])
            }
            (ConnectionState::Authenticating, Event::CredentialsDeadlineElapsed) => {
                self.consecutive_failures += 1;
                self.after_connect_failure(1, false)
            }

            (ConnectionState::Active, Event::ConnectionLost)
            | (ConnectionState::Active, Event::HeartbeatTimeout) => {
                self.consecutive_failures += 1;
                (
                    ConnectionState::Reconnecting { attempt: 1 },
                    vec![Action::StopHeartbeat, Action::OpenTransport],
                )
            }

            (ConnectionState::Connecting { attempt }, Event::BackoffElapsed) => {
                (ConnectionState::Connecting { attempt }, vec![Action::OpenTransport])
            }
            (ConnectionState::Reconnecting { attempt }, Event::BackoffElapsed) => {
                (ConnectionState::Reconnecting { attempt }, vec![Action::OpenTransport])
            }

            (_, Event::CircuitRecloseElapsed) => {
                self.circuit_open = false;
                self.consecutive_failures = 0;
                (ConnectionState::Disconnected, Vec::new())
            }

            (ConnectionState::Disposed, _) => (ConnectionState::Disposed, Vec::new()),
            (_, Event::Dispose) => (ConnectionState::Disposed, vec![Action::StopHeartbeat]),

            (state, _) => (state, Vec::new()),
        };
        self.state = next_state;
        (self, actions)
    }

    /// Shared handling for a failed connect/reconnect attempt: open the
    /// circuit breaker once `consecutive_failures` reaches the threshold,
    /// otherwise schedule another attempt with exponential backoff, up to
    /// `MAX_CONNECT_ATTEMPTS`.
    fn after_connect_failure(&mut self, attempt: u32, reconnecting: bool) -> (ConnectionState, Vec<Action>) {
        if self.consecutive_failures >= CIRCUIT_OPEN_THRESHOLD {
            self.circuit_open = true;
            return (
                ConnectionState::Disconnected,
                vec![
                    Action::OpenCircuitBreaker,
                    Action::ScheduleCircuitReclose {
                        delay: CIRCUIT_RECLOSE,
                    },
                ],
            );
        }
        let next_attempt = attempt + 1;
        if next_attempt > MAX_CONNECT_ATTEMPTS {
            return (ConnectionState::Disposed, vec![Action::SurfaceFatal]);
        }
        let delay = backoff_delay(next_attempt);
        let state = if reconnecting {
            ConnectionState::Reconnecting { attempt: next_attempt }
        } else {
            ConnectionState::Connecting { attempt: next_attempt }
        };
        (state, vec![Action::ScheduleReconnect { delay }])
    }
}

/// Bidirectional bookkeeping for `(symbol, kind) <-> subscription id`.
///
/// Ids are assigned monotonically starting at 100,000. Subscribing to an
/// already-subscribed `(symbol, kind)` pair returns the existing id rather
/// than allocating a new one.
#[derive(Debug, Clone)]
pub struct SubscriptionManager {
    next_id: u64,
    by_id: HashMap<SubscriptionId, (String, SubscriptionKind)>,
    by_key: HashMap<(String, SubscriptionKind), SubscriptionId>,
}

impl Default for SubscriptionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionManager {
    const FIRST_ID: u64 = 100_000;

    /// An empty manager, first id `100000`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: Self::FIRST_ID,
            by_id: HashMap::new(),
            by_key: HashMap::new(),
        }
    }

    /// Record a subscription for `(symbol, kind)`, returning its id. Returns
    /// the existing id unchanged if already subscribed.
    pub fn subscribe(&mut self, symbol: &str, kind: SubscriptionKind) -> SubscriptionId {
        let key = (symbol.to_string(), kind);
        if let Some(id) = self.by_key.get(&key) {
            return *id;
        }
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.by_id.insert(id, key.clone());
        self.by_key.insert(key, id);
        id
    }

    /// Remove the subscription for `(symbol, kind)`, if present, returning its id.
    pub fn unsubscribe(&mut self, symbol: &str, kind: SubscriptionKind) -> Option<SubscriptionId> {
        let key = (symbol.to_string(), kind);
        let id = self.by_key.remove(&key)?;
        self.by_id.remove(&id);
        Some(id)
    }

    /// Every currently-tracked `(symbol, kind)` pair, for resubscribe-all.
    pub fn all(&self) -> Vec<(String, SubscriptionKind)> {
        self.by_id.values().cloned().collect()
    }

    /// Look up the `(symbol, kind)` pair for a subscription id.
    #[must_use]
    pub fn get(&self, id: SubscriptionId) -> Option<&(String, SubscriptionKind)> {
        self.by_id.get(&id)
    }

    /// Number of tracked subscriptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// True if no subscriptions are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_reaches_active_and_starts_heartbeat() {
        let sup = StreamingSupervisor::new();
        let (sup, actions) = sup.handle(Event::ConnectRequested);
        assert_eq!(sup.state, ConnectionState::Connecting { attempt: 1 });
        assert_eq!(actions, vec![Action::OpenTransport]);

        let (sup, actions) = sup.handle(Event::TransportOpened);
        assert_eq!(sup.state, ConnectionState::Authenticating);
        assert!(matches!(actions[0], Action::SendCredentials { .. }));

        let (sup, actions) = sup.handle(Event::AuthenticationAccepted);
        assert_eq!(sup.state, ConnectionState::Active);
        assert!(actions.contains(&Action::StartHeartbeat));
        assert!(actions.contains(&Action::ResubscribeAll));
    }

    #[test]
    fn connection_loss_from_active_reconnects() {
        let sup = StreamingSupervisor::new();
        let (sup, _) = sup.handle(Event::ConnectRequested);
        let (sup, _) = sup.handle(Event::TransportOpened);
        let (sup, _) = sup.handle(Event::AuthenticationAccepted);
        let (sup, actions) = sup.handle(Event::ConnectionLost);
        assert_eq!(sup.state, ConnectionState::Reconnecting { attempt: 1 });
        assert!(actions.contains(&Action::StopHeartbeat));
        assert!(actions.contains(&Action::OpenTransport));
    }

    #[test]
    fn circuit_breaker_opens_after_five_consecutive_failures() {
        let mut sup = StreamingSupervisor::new();
        for _ in 0..4 {
            let (next, _) = sup.handle(Event::ConnectRequested);
            let (next, _) = next.handle(Event::TransportFailed);
            sup = next;
        }
        assert!(!sup.circuit_open);
        let (next, _) = sup.handle(Event::ConnectRequested);
        let (next, actions) = next.handle(Event::TransportFailed);
        assert!(next.circuit_open);
        assert!(actions.contains(&Action::OpenCircuitBreaker));
        assert!(matches!(next.state, ConnectionState::Disconnected));

        let (next, actions) = next.handle(Event::ConnectRequested);
        assert!(actions.iter().any(|a| matches!(a, Action::ScheduleCircuitReclose { .. })));
        assert_eq!(next.state, ConnectionState::Disconnected);
    }

    #[test]
    fn auth_rejection_is_fatal_and_terminal() {
        let sup = StreamingSupervisor::new();
        let (sup, _) = sup.handle(Event::ConnectRequested);
        let (sup, _) = sup.handle(Event::TransportOpened);
        let (sup, actions) = sup.handle(Event::AuthenticationRejected);
        assert_eq!(sup.state, ConnectionState::Disposed);
        assert_eq!(actions, vec![Action::SurfaceFatal]);
        let (sup, actions) = sup.handle(Event::ConnectRequested);
        assert_eq!(sup.state, ConnectionState::Disposed);
        assert!(actions.is_empty());
    }

    #[test]
    fn subscription_manager_dedups_and_assigns_monotonic_ids() {
        let mut mgr = SubscriptionManager::new();
        let first = mgr.subscribe("AAPL", SubscriptionKind::Trade);
        let again = mgr.subscribe("AAPL", SubscriptionKind::Trade);
        assert_eq!(first, again);
        assert_eq!(first.0, 100_000);

        let second = mgr.subscribe("MSFT", SubscriptionKind::Trade);
        assert_eq!(second.0, 100_001);
        assert_eq!(mgr.len(), 2);

        let removed = mgr.unsubscribe("AAPL", SubscriptionKind::Trade).unwrap();
        assert_eq!(removed, first);
        assert_eq!(mgr.len(), 1);
        assert!(mgr.unsubscribe("AAPL", SubscriptionKind::Trade).is_none());
    }
}

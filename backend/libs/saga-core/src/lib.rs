//! Saga protocol state machine.
//!
//! One saga is a sequence of events keyed by `sagaId`; this crate holds the
//! legal transitions, the per-state timeout budgets, and the watchdog's
//! substitute failure events. The machine is pure: services feed observed
//! events through [`transition`] inside their own transactions and act on
//! the returned [`Transition`].
//!
//! Transitions are monotonic along the saga DAG. An event that is not legal
//! in the current state is discarded by the caller (logged and acked, never
//! retried); terminal states absorb everything.

use std::time::Duration;

use event_schema::EventType;
use serde::{Deserialize, Serialize};

pub mod status;

pub use status::{
    CaptureStatus, OrderStatus, PaymentStatus, ReservationStatus, ShipmentStatus, StatusFromDbError,
};

/// Protocol state of one saga, stored as a smallint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SagaState {
    Pending,
    AwaitingPayment,
    Reserved,
    Paid,
    Completed,
    Failed,
}

impl SagaState {
    pub fn as_i16(&self) -> i16 {
        match self {
            SagaState::Pending => 0,
            SagaState::AwaitingPayment => 1,
            SagaState::Reserved => 2,
            SagaState::Paid => 3,
            SagaState::Completed => 4,
            SagaState::Failed => 5,
        }
    }

    pub fn from_i16(v: i16) -> Result<Self, StatusFromDbError> {
        match v {
            0 => Ok(SagaState::Pending),
            1 => Ok(SagaState::AwaitingPayment),
            2 => Ok(SagaState::Reserved),
            3 => Ok(SagaState::Paid),
            4 => Ok(SagaState::Completed),
            5 => Ok(SagaState::Failed),
            other => Err(StatusFromDbError::new("SagaState", other)),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SagaState::Completed | SagaState::Failed)
    }

    /// How long the saga may sit in this state before the watchdog treats
    /// the pending step as failed. Payment steps get 30s, inventory 60s,
    /// shipping 5m. Terminal states never time out.
    pub fn timeout_budget(&self) -> Option<Duration> {
        match self {
            SagaState::Pending => Some(Duration::from_secs(30)),
            SagaState::AwaitingPayment => Some(Duration::from_secs(30)),
            SagaState::Reserved => Some(Duration::from_secs(60)),
            SagaState::Paid => Some(Duration::from_secs(300)),
            SagaState::Completed | SagaState::Failed => None,
        }
    }

    /// The failure event the watchdog emits on budget expiry, standing in
    /// for the downstream service that never answered. Feeding it back
    /// through the bus triggers the same compensation chain a real failure
    /// would.
    pub fn timeout_event(&self) -> Option<EventType> {
        match self {
            SagaState::Pending => Some(EventType::OrderFailed),
            SagaState::AwaitingPayment => Some(EventType::PaymentFailed),
            SagaState::Reserved => Some(EventType::InventoryFailed),
            SagaState::Paid => Some(EventType::OrderFailed),
            SagaState::Completed | SagaState::Failed => None,
        }
    }
}

impl std::fmt::Display for SagaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SagaState::Pending => "PENDING",
            SagaState::AwaitingPayment => "AWAITING_PAYMENT",
            SagaState::Reserved => "RESERVED",
            SagaState::Paid => "PAID",
            SagaState::Completed => "COMPLETED",
            SagaState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Outcome of applying an observed event to a saga state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The saga advances to a new non-terminal state.
    Advance(SagaState),
    /// The saga reaches a terminal state.
    Terminal(SagaState),
    /// The event is legal here but does not move the state (capture
    /// confirmations and compensation progress); callers record it as the
    /// last applied event.
    Observe,
    /// The state is terminal; the event is an absorbed duplicate.
    Duplicate,
    /// The event is not legal in this state; log, ack and discard.
    Invalid,
}

impl Transition {
    /// The state after the transition, when it changes.
    pub fn next_state(&self) -> Option<SagaState> {
        match self {
            Transition::Advance(s) | Transition::Terminal(s) => Some(*s),
            _ => None,
        }
    }
}

/// Apply one observed event to the current state.
///
/// `ORDER_FAILED` fails any live saga; everything else follows the forward
/// path `PENDING → AWAITING_PAYMENT → RESERVED → PAID → COMPLETED`.
/// Compensation events (`PAYMENT_FAILED`, `INVENTORY_FAILED`,
/// `PAYMENT_VOID`, `INVENTORY_RELEASE`) are observed in flight: the saga
/// only fails when the chain ends in `ORDER_FAILED`.
pub fn transition(state: SagaState, event: EventType) -> Transition {
    use EventType::*;
    use SagaState::*;

    if state.is_terminal() {
        return Transition::Duplicate;
    }

    match (state, event) {
        (_, OrderFailed) => Transition::Terminal(Failed),

        (Pending, OrderCreated) => Transition::Advance(AwaitingPayment),
        (AwaitingPayment, PaymentAuthorized) => Transition::Advance(Reserved),
        (Reserved, InventoryReserved) => Transition::Advance(Paid),
        (Paid, OrderCompleted) => Transition::Terminal(Completed),

        // Capture confirmed; shipping not yet scheduled.
        (Paid, PaymentCaptured) => Transition::Observe,

        // Compensation in flight.
        (AwaitingPayment, PaymentFailed) => Transition::Observe,
        (Reserved, InventoryFailed) => Transition::Observe,
        (Reserved | Paid, PaymentVoid) => Transition::Observe,
        (Reserved | Paid, InventoryRelease) => Transition::Observe,

        _ => Transition::Invalid,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use EventType::*;
    use SagaState::*;

    #[test]
    fn happy_path_is_legal() {
        let events = [
            OrderCreated,
            PaymentAuthorized,
            InventoryReserved,
            PaymentCaptured,
            OrderCompleted,
        ];
        let mut state = Pending;
        for event in events {
            match transition(state, event) {
                Transition::Advance(next) | Transition::Terminal(next) => state = next,
                Transition::Observe => {}
                other => panic!("unexpected {other:?} applying {event} in {state}"),
            }
        }
        assert_eq!(state, Completed);
    }

    #[test]
    fn payment_rejection_fails_the_saga() {
        let mut state = Pending;
        state = transition(state, OrderCreated).next_state().unwrap();
        assert_eq!(transition(state, PaymentFailed), Transition::Observe);
        assert_eq!(transition(state, OrderFailed), Transition::Terminal(Failed));
    }

    #[test]
    fn inventory_compensation_chain_is_observed_until_order_failed() {
        let mut state = Pending;
        state = transition(state, OrderCreated).next_state().unwrap();
        state = transition(state, PaymentAuthorized).next_state().unwrap();
        assert_eq!(state, Reserved);
        assert_eq!(transition(state, InventoryFailed), Transition::Observe);
        assert_eq!(transition(state, PaymentVoid), Transition::Observe);
        assert_eq!(transition(state, OrderFailed), Transition::Terminal(Failed));
    }

    #[test]
    fn terminal_states_absorb_everything() {
        for event in [
            OrderCreated,
            PaymentAuthorized,
            PaymentCaptured,
            OrderFailed,
            OrderCompleted,
        ] {
            assert_eq!(transition(Completed, event), Transition::Duplicate);
            assert_eq!(transition(Failed, event), Transition::Duplicate);
        }
    }

    #[test]
    fn out_of_order_events_are_invalid() {
        // A delayed PAYMENT_AUTHORIZED after the saga moved past payment.
        assert_eq!(transition(Paid, PaymentAuthorized), Transition::Invalid);
        // Reservation success before the payment step.
        assert_eq!(transition(Pending, InventoryReserved), Transition::Invalid);
        // The command is never applied to an existing saga.
        assert_eq!(transition(AwaitingPayment, OrderCreate), Transition::Invalid);
    }

    #[test]
    fn saga_state_round_trips_through_i16() {
        for state in [Pending, AwaitingPayment, Reserved, Paid, Completed, Failed] {
            assert_eq!(SagaState::from_i16(state.as_i16()).unwrap(), state);
        }
        assert!(SagaState::from_i16(42).is_err());
    }

    #[test]
    fn budgets_cover_exactly_the_live_states() {
        assert_eq!(Pending.timeout_budget(), Some(Duration::from_secs(30)));
        assert_eq!(AwaitingPayment.timeout_budget(), Some(Duration::from_secs(30)));
        assert_eq!(Reserved.timeout_budget(), Some(Duration::from_secs(60)));
        assert_eq!(Paid.timeout_budget(), Some(Duration::from_secs(300)));
        assert_eq!(Completed.timeout_budget(), None);
        assert_eq!(Failed.timeout_budget(), None);
    }

    #[test]
    fn watchdog_substitutes_the_pending_step_failure() {
        assert_eq!(AwaitingPayment.timeout_event(), Some(PaymentFailed));
        assert_eq!(Reserved.timeout_event(), Some(InventoryFailed));
        assert_eq!(Paid.timeout_event(), Some(OrderFailed));
        assert_eq!(Completed.timeout_event(), None);
    }
}

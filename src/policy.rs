//! Activation policy: the active/idle/enabled state machine.
//!
//! Reconciles the local idle signal, the inhibitor set and explicit
//! `SetActive` requests into one consistent activation state. Inhibitors
//! block only the idle-triggered path; a direct `SetActive(true)` bypasses
//! them.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::events::{EventSender, ServiceEvent};

/// The locking/blanking collaborator's transition hook.
///
/// Called before the activation flag flips. Returns whether the handler
/// actually performed the transition; returning false vetoes the change and
/// leaves the state untouched.
pub trait TransitionHandler: Send {
    fn transition(&mut self, desired: bool) -> bool;
}

/// Default handler: every transition is performed.
struct AcceptingHandler;

impl TransitionHandler for AcceptingHandler {
    fn transition(&mut self, _desired: bool) -> bool {
        true
    }
}

/// Mutable activation state owned by the policy.
#[derive(Debug)]
pub struct ActivationState {
    /// Whether the screen is currently locked/blanked.
    pub active: bool,

    /// Whether the session is considered idle.
    pub session_idle: bool,

    /// Whether idle-triggered activation is allowed at all.
    pub activation_enabled: bool,

    /// Set iff `active` is true.
    pub active_since: Option<DateTime<Utc>>,

    /// Set iff `session_idle` is true.
    pub session_idle_since: Option<DateTime<Utc>>,
}

impl ActivationState {
    fn new(activation_enabled: bool) -> Self {
        Self {
            active: false,
            session_idle: false,
            activation_enabled,
            active_since: None,
            session_idle_since: None,
        }
    }
}

/// Owns the activation flags and performs all state transitions.
pub struct ActivationPolicy {
    state: ActivationState,
    throttled: bool,
    handler: Box<dyn TransitionHandler>,
    events: EventSender,
}

impl ActivationPolicy {
    /// Create a policy in the initial state (inactive, not idle).
    pub fn new(activation_enabled: bool, events: EventSender) -> Self {
        Self {
            state: ActivationState::new(activation_enabled),
            throttled: false,
            handler: Box::new(AcceptingHandler),
            events,
        }
    }

    /// Install the locking collaborator's transition hook.
    pub fn set_transition_handler(&mut self, handler: Box<dyn TransitionHandler>) {
        self.handler = handler;
    }

    pub fn is_active(&self) -> bool {
        self.state.active
    }

    pub fn is_session_idle(&self) -> bool {
        self.state.session_idle
    }

    #[allow(dead_code)]
    pub fn is_throttled(&self) -> bool {
        self.throttled
    }

    #[allow(dead_code)]
    pub fn state(&self) -> &ActivationState {
        &self.state
    }

    /// Request an activation change. Returns whether the request was
    /// accepted; a same-value request or a vetoed transition returns false
    /// and leaves the state unchanged.
    pub fn request_active(&mut self, desired: bool) -> bool {
        if desired == self.state.active {
            debug!("Activation already {}, ignoring request", desired);
            return false;
        }

        if !self.handler.transition(desired) {
            debug!("Activation change to {} vetoed by transition handler", desired);
            return false;
        }

        self.state.active = desired;
        self.state.active_since = desired.then(Utc::now);
        // Activation and idleness are coupled: the flags move together in
        // the same transaction.
        self.set_idle_flag(desired);

        debug!("Activation changed to {}", desired);
        let _ = self.events.send(ServiceEvent::ActiveChanged(desired));
        true
    }

    /// Report the session idle state. Idle-triggered activation is refused
    /// while disabled or while any inhibitor lease is held; on a vetoed
    /// transition the idle flag is rolled back to its prior value.
    pub fn set_session_idle(&mut self, idle: bool, inhibitor_count: usize) -> bool {
        if idle == self.state.session_idle {
            return false;
        }

        if idle && !self.state.activation_enabled {
            debug!("Session idle ignored: idle-triggered activation is disabled");
            return false;
        }

        if idle && inhibitor_count > 0 {
            debug!(
                "Session idle refused: {} inhibitor lease(s) held",
                inhibitor_count
            );
            return false;
        }

        let prior = self.state.session_idle;
        let prior_since = self.state.session_idle_since;
        self.set_idle_flag(idle);

        let accepted = self.request_active(idle);
        if !accepted {
            self.state.session_idle = prior;
            self.state.session_idle_since = prior_since;
        }
        accepted
    }

    /// Re-evaluate idle-triggered activation. Called whenever the inhibitor
    /// set changes or `activation_enabled` toggles.
    pub fn check_activation(&mut self, inhibitor_count: usize) {
        if !self.state.activation_enabled {
            return;
        }
        if !self.state.session_idle {
            return;
        }
        if inhibitor_count == 0 {
            debug!("Session idle and no inhibitors remain, activating");
            self.request_active(true);
        }
    }

    /// Recompute the throttled predicate, signaling only on an edge.
    pub fn check_throttle(&mut self, throttle_count: usize) {
        let throttled = throttle_count > 0;
        if throttled != self.throttled {
            self.throttled = throttled;
            debug!("Throttle changed to {}", throttled);
            let _ = self.events.send(ServiceEvent::ThrottleChanged(throttled));
        }
    }

    /// Toggle idle-triggered activation. Returns whether the flag changed;
    /// the caller re-runs `check_activation` on a change.
    #[allow(dead_code)]
    pub fn set_activation_enabled(&mut self, enabled: bool) -> bool {
        if enabled == self.state.activation_enabled {
            return false;
        }
        self.state.activation_enabled = enabled;
        true
    }

    /// Force deactivation without consulting the veto handler. Session-layer
    /// unlock is authoritative and cannot be refused.
    pub fn force_active_off(&mut self) {
        if !self.state.active {
            return;
        }
        self.state.active = false;
        self.state.active_since = None;
        self.set_idle_flag(false);

        debug!("Activation forced off by session layer");
        let _ = self.events.send(ServiceEvent::ActiveChanged(false));
    }

    /// Seconds the screen has been active, or 0 when inactive or when the
    /// recorded start time is missing or in the future.
    pub fn get_active_time(&self) -> u32 {
        if !self.state.active {
            return 0;
        }
        elapsed_seconds(self.state.active_since)
    }

    /// Seconds the session has been idle, with the same defensive zeroes.
    pub fn get_session_idle_time(&self) -> u32 {
        if !self.state.session_idle {
            return 0;
        }
        elapsed_seconds(self.state.session_idle_since)
    }

    /// Test hook: drive the raw idle flag without the refusal/veto path.
    #[cfg(test)]
    pub(crate) fn set_idle_for_test(&mut self, idle: bool) {
        self.set_idle_flag(idle);
    }

    fn set_idle_flag(&mut self, idle: bool) {
        if idle && !self.state.session_idle {
            self.state.session_idle_since = Some(Utc::now());
        } else if !idle {
            self.state.session_idle_since = None;
        }
        self.state.session_idle = idle;
    }
}

/// Whole seconds since `since`, clamped to 0 for missing or future stamps.
fn elapsed_seconds(since: Option<DateTime<Utc>>) -> u32 {
    let Some(since) = since else {
        return 0;
    };
    let delta = Utc::now().signed_duration_since(since).num_seconds();
    u32::try_from(delta).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{self, EventReceiver};
    use chrono::Duration;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    /// Handler that records calls and can be switched to vetoing.
    struct TestHandler {
        calls: Arc<AtomicU32>,
        veto: Arc<AtomicBool>,
    }

    impl TransitionHandler for TestHandler {
        fn transition(&mut self, _desired: bool) -> bool {
            self.calls.fetch_add(1, Ordering::Relaxed);
            !self.veto.load(Ordering::Relaxed)
        }
    }

    fn policy() -> (ActivationPolicy, EventReceiver) {
        let (tx, rx) = events::channel();
        (ActivationPolicy::new(true, tx), rx)
    }

    fn policy_with_veto() -> (ActivationPolicy, EventReceiver, Arc<AtomicBool>, Arc<AtomicU32>) {
        let (mut policy, rx) = policy();
        let veto = Arc::new(AtomicBool::new(false));
        let calls = Arc::new(AtomicU32::new(0));
        policy.set_transition_handler(Box::new(TestHandler {
            calls: calls.clone(),
            veto: veto.clone(),
        }));
        (policy, rx, veto, calls)
    }

    fn drain(rx: &mut EventReceiver) -> Vec<ServiceEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[test]
    fn test_initial_state() {
        let (policy, _rx) = policy();
        assert!(!policy.is_active());
        assert!(!policy.is_session_idle());
        assert!(!policy.is_throttled());
        assert!(policy.state().activation_enabled);
        assert_eq!(policy.get_active_time(), 0);
        assert_eq!(policy.get_session_idle_time(), 0);
    }

    #[test]
    fn test_request_active_couples_idle_and_stamps() {
        let (mut policy, mut rx) = policy();

        assert!(policy.request_active(true));
        assert!(policy.is_active());
        assert!(policy.is_session_idle());
        assert!(policy.state().active_since.is_some());
        assert!(policy.state().session_idle_since.is_some());
        assert_eq!(drain(&mut rx), vec![ServiceEvent::ActiveChanged(true)]);

        assert!(policy.request_active(false));
        assert!(!policy.is_active());
        assert!(!policy.is_session_idle());
        assert!(policy.state().active_since.is_none());
        assert!(policy.state().session_idle_since.is_none());
        assert_eq!(drain(&mut rx), vec![ServiceEvent::ActiveChanged(false)]);
    }

    #[test]
    fn test_request_active_same_value_is_noop() {
        let (mut policy, mut rx) = policy();
        assert!(!policy.request_active(false));
        assert!(drain(&mut rx).is_empty());

        assert!(policy.request_active(true));
        drain(&mut rx);
        assert!(!policy.request_active(true));
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_veto_leaves_state_unchanged() {
        let (mut policy, mut rx, veto, calls) = policy_with_veto();
        veto.store(true, Ordering::Relaxed);

        assert!(!policy.request_active(true));
        assert!(!policy.is_active());
        assert!(!policy.is_session_idle());
        assert!(drain(&mut rx).is_empty());
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_session_idle_refused_while_inhibited() {
        let (mut policy, mut rx) = policy();

        assert!(!policy.set_session_idle(true, 1));
        assert!(!policy.is_session_idle());
        assert!(!policy.is_active());
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_session_idle_rolls_back_on_veto() {
        let (mut policy, _rx, veto, _calls) = policy_with_veto();
        veto.store(true, Ordering::Relaxed);

        assert!(!policy.set_session_idle(true, 0));
        assert!(!policy.is_session_idle());
        assert!(policy.state().session_idle_since.is_none());
    }

    #[test]
    fn test_check_activation_requires_idle_and_no_inhibitors() {
        let (mut policy, mut rx) = policy();

        // Not idle: nothing happens regardless of inhibitors.
        policy.check_activation(0);
        assert!(!policy.is_active());

        // Idle but vetoed by a pending inhibitor count.
        policy.set_session_idle(true, 0);
        drain(&mut rx);
        policy.request_active(false);
        drain(&mut rx);

        // Re-enter idle through the raw flag to simulate "idle timer already
        // elapsed while inhibited".
        policy.set_idle_flag(true);
        policy.check_activation(2);
        assert!(!policy.is_active());

        policy.check_activation(0);
        assert!(policy.is_active());
        assert_eq!(drain(&mut rx), vec![ServiceEvent::ActiveChanged(true)]);
    }

    #[test]
    fn test_check_activation_disabled() {
        let (mut policy, _rx) = policy();
        assert!(policy.set_activation_enabled(false));
        policy.set_idle_flag(true);
        policy.check_activation(0);
        assert!(!policy.is_active());

        // Toggling back on re-arms the check.
        assert!(policy.set_activation_enabled(true));
        assert!(!policy.set_activation_enabled(true));
        policy.check_activation(0);
        assert!(policy.is_active());
    }

    #[test]
    fn test_idle_report_ignored_when_disabled() {
        let (tx, mut rx) = events::channel();
        let mut policy = ActivationPolicy::new(false, tx);

        assert!(!policy.set_session_idle(true, 0));
        assert!(!policy.is_active());
        assert!(!policy.is_session_idle());
        assert!(drain(&mut rx).is_empty());

        // Deactivation is never gated on the flag.
        policy.request_active(true);
        drain(&mut rx);
        assert!(policy.set_session_idle(false, 0));
        assert!(!policy.is_active());
    }

    #[test]
    fn test_throttle_signals_only_edges() {
        let (mut policy, mut rx) = policy();

        policy.check_throttle(1);
        policy.check_throttle(2);
        policy.check_throttle(1);
        policy.check_throttle(0);
        policy.check_throttle(0);

        assert_eq!(
            drain(&mut rx),
            vec![
                ServiceEvent::ThrottleChanged(true),
                ServiceEvent::ThrottleChanged(false),
            ]
        );
    }

    #[test]
    fn test_force_active_off_bypasses_veto() {
        let (mut policy, mut rx, veto, _calls) = policy_with_veto();

        assert!(policy.request_active(true));
        drain(&mut rx);

        // Veto handler would now refuse, but session unlock is authoritative.
        veto.store(true, Ordering::Relaxed);
        policy.force_active_off();
        assert!(!policy.is_active());
        assert!(!policy.is_session_idle());
        assert!(policy.state().active_since.is_none());
        assert_eq!(drain(&mut rx), vec![ServiceEvent::ActiveChanged(false)]);

        // Already inactive: no event, no transition.
        policy.force_active_off();
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_active_time_defensive_zero() {
        let (mut policy, _rx) = policy();
        assert!(policy.request_active(true));

        // Normal case: non-negative and small.
        assert!(policy.get_active_time() < 5);

        // Future stamp reads as zero rather than wrapping.
        policy.state.active_since = Some(Utc::now() + Duration::hours(1));
        assert_eq!(policy.get_active_time(), 0);

        // Missing stamp while active also reads as zero.
        policy.state.active_since = None;
        assert_eq!(policy.get_active_time(), 0);
    }

    #[test]
    fn test_active_time_counts_up() {
        let (mut policy, _rx) = policy();
        assert!(policy.request_active(true));
        policy.state.active_since = Some(Utc::now() - Duration::seconds(90));
        assert_eq!(policy.get_active_time(), 90);
        policy.state.session_idle_since = Some(Utc::now() - Duration::seconds(90));
        assert_eq!(policy.get_session_idle_time(), 90);
    }

    /// The end-to-end scenario from the arbitration design: an inhibitor
    /// blocks idle activation, releasing it alone does not activate, and a
    /// fresh idle report then succeeds.
    #[test]
    fn test_inhibited_idle_then_activate() {
        let (mut policy, mut rx) = policy();
        let mut inhibitors = 0usize;

        // Inhibit("Player", "playing")
        inhibitors += 1;
        policy.check_activation(inhibitors);

        // Idle report refused while the lease is held.
        assert!(!policy.set_session_idle(true, inhibitors));
        assert!(!policy.is_session_idle());

        // UnInhibit: set changes, but the session is not idle, so the
        // re-check does not transition.
        inhibitors -= 1;
        policy.check_activation(inhibitors);
        assert!(!policy.is_active());

        // Second idle report is accepted.
        assert!(policy.set_session_idle(true, inhibitors));
        assert!(policy.is_active());
        assert!(policy.is_session_idle());
        assert_eq!(drain(&mut rx), vec![ServiceEvent::ActiveChanged(true)]);
        assert!(policy.get_active_time() < 5);
    }
}

use std::time::Duration;

use crate::{
    error::ChannelError,
    retry::RetryPolicy,
    types::{BindingId, ChannelState},
};

/// Side effect requested by a transition. The driver applies effects in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEffect {
    /// Announce a new state to observers.
    StateChanged(ChannelState),
    /// Construct exactly one new transport binding with this id.
    OpenTransport(BindingId),
    /// Release the binding with this id.
    CloseTransport(BindingId),
    /// Arm the backoff timer. `attempt` is the counter value at failure time.
    ScheduleReconnect { attempt: u32, delay: Duration },
    /// Drop any armed backoff timer.
    CancelReconnect,
    /// Retries ran out; report through the diagnostic path.
    RetryExhausted(ChannelError),
}

/// Pure lifecycle and retry bookkeeping for one live channel.
///
/// Signals from bindings other than the current one are ignored, so late
/// completions of superseded bindings never move the machine.
#[derive(Debug, Clone)]
pub struct ChannelStateMachine {
    state: ChannelState,
    policy: RetryPolicy,
    retry_counter: u32,
    current_binding: Option<BindingId>,
    next_binding: u64,
}

impl ChannelStateMachine {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            state: ChannelState::Disconnected,
            policy,
            retry_counter: 0,
            current_binding: None,
            next_binding: 1,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn retry_counter(&self) -> u32 {
        self.retry_counter
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn current_binding(&self) -> Option<BindingId> {
        self.current_binding
    }

    pub fn is_current(&self, binding: BindingId) -> bool {
        self.current_binding == Some(binding)
    }

    /// Inbound frames are accepted only from the current, open binding.
    pub fn accepts_frames_from(&self, binding: BindingId) -> bool {
        self.state == ChannelState::Open && self.is_current(binding)
    }

    /// Binding to write to, or `NotConnected` when the channel is not open.
    pub fn writable_binding(&self) -> Result<BindingId, ChannelError> {
        match (self.state, self.current_binding) {
            (ChannelState::Open, Some(binding)) => Ok(binding),
            (state, _) => Err(ChannelError::not_connected(state)),
        }
    }

    /// Begin a connection attempt. No-op while `Connecting` or `Open`.
    pub fn connect(&mut self) -> Vec<ChannelEffect> {
        match self.state {
            ChannelState::Connecting | ChannelState::Open => Vec::new(),
            ChannelState::Disconnected => self.begin_attempt(Vec::new()),
            ChannelState::Failed => {
                self.retry_counter = 0;
                self.begin_attempt(Vec::new())
            }
            ChannelState::Reconnecting => self.begin_attempt(vec![ChannelEffect::CancelReconnect]),
        }
    }

    pub fn on_open(&mut self, binding: BindingId) -> Vec<ChannelEffect> {
        if self.state != ChannelState::Connecting || !self.is_current(binding) {
            return Vec::new();
        }
        self.retry_counter = 0;
        self.transition(ChannelState::Open, Vec::new())
    }

    /// Error or close reported by a binding while `Connecting` or `Open`.
    pub fn on_failure(&mut self, binding: BindingId) -> Vec<ChannelEffect> {
        if !matches!(self.state, ChannelState::Connecting | ChannelState::Open)
            || !self.is_current(binding)
        {
            return Vec::new();
        }

        self.current_binding = None;
        let mut effects = vec![ChannelEffect::CloseTransport(binding)];
        let max_attempts = self.policy.max_attempts();

        if self.retry_counter >= max_attempts {
            effects.push(ChannelEffect::RetryExhausted(ChannelError::retry_exhausted(
                self.retry_counter,
            )));
            return self.transition(ChannelState::Failed, effects);
        }

        let attempt = self.retry_counter;
        let delay = self.policy.delay_for_attempt(attempt);
        self.retry_counter += 1;
        let mut effects = self.transition(ChannelState::Reconnecting, effects);

        if self.retry_counter >= max_attempts {
            effects.push(ChannelEffect::RetryExhausted(ChannelError::retry_exhausted(
                self.retry_counter,
            )));
            return self.transition(ChannelState::Failed, effects);
        }

        effects.push(ChannelEffect::ScheduleReconnect { attempt, delay });
        effects
    }

    /// Backoff timer fired.
    pub fn on_retry_due(&mut self) -> Vec<ChannelEffect> {
        if self.state != ChannelState::Reconnecting {
            return Vec::new();
        }
        self.begin_attempt(Vec::new())
    }

    /// Explicit shutdown. Idempotent.
    pub fn close(&mut self) -> Vec<ChannelEffect> {
        if self.state == ChannelState::Disconnected && self.current_binding.is_none() {
            return Vec::new();
        }

        let mut effects = vec![ChannelEffect::CancelReconnect];
        if let Some(binding) = self.current_binding.take() {
            effects.push(ChannelEffect::CloseTransport(binding));
        }
        self.retry_counter = 0;
        self.transition(ChannelState::Disconnected, effects)
    }

    fn begin_attempt(&mut self, mut effects: Vec<ChannelEffect>) -> Vec<ChannelEffect> {
        let binding = BindingId(self.next_binding);
        self.next_binding += 1;
        self.current_binding = Some(binding);
        effects = self.transition(ChannelState::Connecting, effects);
        effects.push(ChannelEffect::OpenTransport(binding));
        effects
    }

    fn transition(
        &mut self,
        next: ChannelState,
        mut effects: Vec<ChannelEffect>,
    ) -> Vec<ChannelEffect> {
        self.state = next;
        effects.push(ChannelEffect::StateChanged(next));
        effects
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, 1_000, 5_000).expect("policy should be valid")
    }

    fn states(effects: &[ChannelEffect]) -> Vec<ChannelState> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                ChannelEffect::StateChanged(state) => Some(*state),
                _ => None,
            })
            .collect()
    }

    fn opened_binding(effects: &[ChannelEffect]) -> BindingId {
        effects
            .iter()
            .find_map(|effect| match effect {
                ChannelEffect::OpenTransport(binding) => Some(*binding),
                _ => None,
            })
            .expect("transition should open a binding")
    }

    #[test]
    fn connects_and_opens() {
        let mut sm = ChannelStateMachine::new(policy(3));

        let effects = sm.connect();
        assert_eq!(
            effects,
            vec![
                ChannelEffect::StateChanged(ChannelState::Connecting),
                ChannelEffect::OpenTransport(BindingId(1)),
            ]
        );

        let effects = sm.on_open(BindingId(1));
        assert_eq!(effects, vec![ChannelEffect::StateChanged(ChannelState::Open)]);
        assert_eq!(sm.state(), ChannelState::Open);
        assert_eq!(sm.writable_binding(), Ok(BindingId(1)));
    }

    #[test]
    fn connect_is_noop_while_connecting_or_open() {
        let mut sm = ChannelStateMachine::new(policy(3));
        sm.connect();
        assert!(sm.connect().is_empty());

        sm.on_open(BindingId(1));
        assert!(sm.connect().is_empty());
        assert_eq!(sm.current_binding(), Some(BindingId(1)));
    }

    #[test]
    fn three_failures_exhaust_retries() {
        let mut sm = ChannelStateMachine::new(policy(3));
        let mut seen = Vec::new();

        let effects = sm.connect();
        seen.extend(states(&effects));
        let mut binding = opened_binding(&effects);

        for _ in 0..2 {
            let effects = sm.on_failure(binding);
            seen.extend(states(&effects));
            let effects = sm.on_retry_due();
            seen.extend(states(&effects));
            binding = opened_binding(&effects);
        }
        let effects = sm.on_failure(binding);
        seen.extend(states(&effects));

        use ChannelState::*;
        assert_eq!(
            seen,
            vec![
                Connecting,
                Reconnecting,
                Connecting,
                Reconnecting,
                Connecting,
                Reconnecting,
                Failed
            ]
        );
        assert_eq!(sm.retry_counter(), 3);
        assert!(sm.on_retry_due().is_empty());
        assert!(effects
            .iter()
            .any(|effect| matches!(effect, ChannelEffect::RetryExhausted(_))));
    }

    #[test]
    fn backoff_uses_counter_at_failure_time() {
        let mut sm = ChannelStateMachine::new(policy(5));
        let mut binding = opened_binding(&sm.connect());
        let mut delays = Vec::new();

        for _ in 0..4 {
            let effects = sm.on_failure(binding);
            let delay = effects
                .iter()
                .find_map(|effect| match effect {
                    ChannelEffect::ScheduleReconnect { delay, .. } => Some(delay.as_millis()),
                    _ => None,
                })
                .expect("failure should schedule a retry");
            delays.push(delay);
            binding = opened_binding(&sm.on_retry_due());
        }

        assert_eq!(delays, vec![1_000, 2_000, 4_000, 5_000]);
    }

    #[test]
    fn failure_closes_binding_before_scheduling() {
        let mut sm = ChannelStateMachine::new(policy(3));
        sm.connect();
        sm.on_open(BindingId(1));

        let effects = sm.on_failure(BindingId(1));
        assert_eq!(
            effects,
            vec![
                ChannelEffect::CloseTransport(BindingId(1)),
                ChannelEffect::StateChanged(ChannelState::Reconnecting),
                ChannelEffect::ScheduleReconnect {
                    attempt: 0,
                    delay: Duration::from_millis(1_000),
                },
            ]
        );
        assert_eq!(sm.current_binding(), None);
    }

    #[test]
    fn open_resets_retry_counter() {
        let mut sm = ChannelStateMachine::new(policy(3));
        sm.connect();
        sm.on_failure(BindingId(1));
        assert_eq!(sm.retry_counter(), 1);

        sm.on_retry_due();
        sm.on_open(BindingId(2));
        assert_eq!(sm.retry_counter(), 0);
    }

    #[test]
    fn zero_attempts_fails_without_reconnecting() {
        let mut sm = ChannelStateMachine::new(policy(0));
        sm.connect();
        let effects = sm.on_failure(BindingId(1));
        assert_eq!(states(&effects), vec![ChannelState::Failed]);
        assert_eq!(sm.retry_counter(), 0);
    }

    #[test]
    fn manual_connect_from_failed_resets_counter() {
        let mut sm = ChannelStateMachine::new(policy(1));
        sm.connect();
        sm.on_failure(BindingId(1));
        assert_eq!(sm.state(), ChannelState::Failed);
        assert_eq!(sm.retry_counter(), 1);

        let effects = sm.connect();
        assert_eq!(sm.retry_counter(), 0);
        assert_eq!(opened_binding(&effects), BindingId(2));
        assert_eq!(sm.state(), ChannelState::Connecting);
    }

    #[test]
    fn manual_connect_while_reconnecting_cancels_timer() {
        let mut sm = ChannelStateMachine::new(policy(3));
        sm.connect();
        sm.on_failure(BindingId(1));

        let effects = sm.connect();
        assert_eq!(effects[0], ChannelEffect::CancelReconnect);
        assert_eq!(opened_binding(&effects), BindingId(2));
        assert_eq!(sm.retry_counter(), 1);
    }

    #[test]
    fn ignores_signals_from_superseded_bindings() {
        let mut sm = ChannelStateMachine::new(policy(3));
        sm.connect();
        sm.on_failure(BindingId(1));
        sm.on_retry_due();

        assert!(sm.on_open(BindingId(1)).is_empty());
        assert!(sm.on_failure(BindingId(1)).is_empty());
        assert!(!sm.accepts_frames_from(BindingId(1)));
        assert_eq!(sm.state(), ChannelState::Connecting);
    }

    #[test]
    fn close_is_idempotent_and_releases_binding() {
        let mut sm = ChannelStateMachine::new(policy(3));
        sm.connect();

        let effects = sm.close();
        assert_eq!(
            effects,
            vec![
                ChannelEffect::CancelReconnect,
                ChannelEffect::CloseTransport(BindingId(1)),
                ChannelEffect::StateChanged(ChannelState::Disconnected),
            ]
        );
        assert!(sm.close().is_empty());
        assert!(sm.on_open(BindingId(1)).is_empty());
    }

    #[test]
    fn send_requires_open_state() {
        let mut sm = ChannelStateMachine::new(policy(3));
        let err = sm.writable_binding().expect_err("disconnected send must fail");
        assert_eq!(err.code, "not_connected");

        sm.connect();
        assert!(sm.writable_binding().is_err());

        sm.on_failure(BindingId(1));
        assert!(sm.writable_binding().is_err());
    }
}

use std::{collections::VecDeque, pin::Pin};

use tokio::time::{Sleep, sleep};
use tracing::{debug, trace, warn};
use url::Url;

use crate::{
    channel::{SignalHub, SignalKind, SignalReceiver, TransportSignal},
    dispatch::{decode_frame, encode_request},
    error::{ChannelError, ChannelErrorCategory},
    observer::Observers,
    retry::RetryPolicy,
    state_machine::{ChannelEffect, ChannelStateMachine},
    transport::{Transport, TransportBinding},
    types::{AssistantReply, AssistantRequest, BindingId, ChannelEvent, ChannelState},
};

/// Self-healing duplex channel to the assistant service.
///
/// Every transition runs on the task that owns the channel: `connect`, `send` and
/// `close` act synchronously, and `next_event` waits for the next transport signal
/// or backoff expiry. Observers fire during those calls, never concurrently.
pub struct LiveChannel<T: Transport> {
    url: Url,
    machine: ChannelStateMachine,
    transport: T,
    binding: Option<(BindingId, T::Binding)>,
    hub: SignalHub,
    signals: SignalReceiver,
    retry_timer: Option<Pin<Box<Sleep>>>,
    observers: Observers,
    pending: VecDeque<ChannelEvent>,
    closed: bool,
}

enum Wake {
    Signal(Option<TransportSignal>),
    RetryDue,
}

impl<T: Transport> LiveChannel<T> {
    /// Create a disconnected channel. Fails on an invalid endpoint.
    pub fn new(url: &str, policy: RetryPolicy, transport: T) -> Result<Self, ChannelError> {
        let url = parse_channel_url(url)?;
        let (hub, signals) = SignalHub::new();

        Ok(Self {
            url,
            machine: ChannelStateMachine::new(policy),
            transport,
            binding: None,
            hub,
            signals,
            retry_timer: None,
            observers: Observers::default(),
            pending: VecDeque::new(),
            closed: false,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn state(&self) -> ChannelState {
        self.machine.state()
    }

    pub fn retry_counter(&self) -> u32 {
        self.machine.retry_counter()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn on_state_change(&mut self, observer: impl FnMut(ChannelState) + Send + 'static) {
        self.observers.on_state_change(Box::new(observer));
    }

    pub fn on_message(&mut self, observer: impl FnMut(&AssistantReply) + Send + 'static) {
        self.observers.on_message(Box::new(observer));
    }

    pub fn on_diagnostic(&mut self, observer: impl FnMut(&ChannelError) + Send + 'static) {
        self.observers.on_diagnostic(Box::new(observer));
    }

    /// Start a connection attempt. No-op while connecting, open, or after `close`.
    pub fn connect(&mut self) {
        if self.closed {
            debug!(url = %self.url, "ignoring connect on closed channel");
            return;
        }
        let effects = self.machine.connect();
        self.apply(effects);
    }

    /// Write one request frame, or fail with `NotConnected` unless the channel is open.
    pub fn send(&mut self, request: &AssistantRequest) -> Result<(), ChannelError> {
        let binding_id = self.machine.writable_binding()?;
        let frame = encode_request(request)?;

        let binding = match self.binding.as_mut() {
            Some((current, binding)) if *current == binding_id => binding,
            _ => {
                return Err(ChannelError::new(
                    ChannelErrorCategory::Internal,
                    "binding_missing",
                    format!("open channel has no live {binding_id}"),
                ));
            }
        };

        binding.send_text(frame)?;
        debug!(
            binding = %binding_id,
            message_len = request.message.len(),
            drug_count = request.context.drugs.len(),
            "assistant request written"
        );
        Ok(())
    }

    /// Shut the channel down for good. Idempotent.
    ///
    /// The `Disconnected` transition is announced; nothing fires afterwards, even
    /// when a superseded binding completes later.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }

        let effects = self.machine.close();
        self.apply(effects);
        if let Some((binding_id, mut binding)) = self.binding.take() {
            warn!(binding = %binding_id, "releasing binding unknown to state machine");
            binding.close();
        }

        self.retry_timer = None;
        self.closed = true;
        self.pending.clear();
        self.observers.clear();
        debug!(url = %self.url, "live channel closed");
    }

    /// Drive the channel until it emits the next event. `None` once closed.
    ///
    /// Cancel safe: dropping the future loses neither signals nor the backoff timer,
    /// so it can sit in a `tokio::select!` next to user input.
    pub async fn next_event(&mut self) -> Option<ChannelEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            if self.closed {
                return None;
            }

            let wake = tokio::select! {
                signal = self.signals.recv() => Wake::Signal(signal),
                () = wait_for_retry(self.retry_timer.as_mut()) => Wake::RetryDue,
            };

            match wake {
                Wake::Signal(Some(signal)) => self.handle_signal(signal),
                Wake::Signal(None) => return None,
                Wake::RetryDue => {
                    self.retry_timer = None;
                    let effects = self.machine.on_retry_due();
                    self.apply(effects);
                }
            }
        }
    }

    fn handle_signal(&mut self, signal: TransportSignal) {
        let TransportSignal { binding, kind } = signal;
        if !self.machine.is_current(binding) {
            trace!(%binding, "discarding signal from superseded binding");
            return;
        }

        match kind {
            SignalKind::Opened => {
                debug!(%binding, url = %self.url, "transport opened");
                let effects = self.machine.on_open(binding);
                self.apply(effects);
            }
            SignalKind::Frame(text) => self.dispatch_frame(binding, &text),
            SignalKind::Errored(reason) => {
                warn!(
                    %binding,
                    state = %self.machine.state(),
                    %reason,
                    "transport reported error"
                );
                let effects = self.machine.on_failure(binding);
                self.apply(effects);
            }
            SignalKind::Closed => {
                warn!(%binding, state = %self.machine.state(), "transport closed by peer");
                let effects = self.machine.on_failure(binding);
                self.apply(effects);
            }
        }
    }

    fn dispatch_frame(&mut self, binding: BindingId, text: &str) {
        if !self.machine.accepts_frames_from(binding) {
            trace!(%binding, "dropping frame received outside open state");
            return;
        }

        match decode_frame(text) {
            Ok(reply) => {
                trace!(
                    %binding,
                    facility_count = reply.nearby_facilities.len(),
                    "assistant reply received"
                );
                self.emit(ChannelEvent::Message(reply));
            }
            Err(error) => {
                warn!(%binding, %error, "dropping malformed frame");
                self.emit(ChannelEvent::Diagnostic(error));
            }
        }
    }

    fn apply(&mut self, effects: Vec<ChannelEffect>) {
        for effect in effects {
            match effect {
                ChannelEffect::StateChanged(state) => {
                    debug!(
                        %state,
                        retry_counter = self.machine.retry_counter(),
                        "channel state changed"
                    );
                    self.emit(ChannelEvent::StateChanged { state });
                }
                ChannelEffect::OpenTransport(binding_id) => {
                    if let Some((previous_id, mut previous)) = self.binding.take() {
                        warn!(
                            binding = %previous_id,
                            "releasing binding left open before new attempt"
                        );
                        previous.close();
                    }
                    let signals = self.hub.sender_for(binding_id);
                    let binding = self.transport.open(&self.url, signals);
                    self.binding = Some((binding_id, binding));
                }
                ChannelEffect::CloseTransport(binding_id) => match self.binding.take() {
                    Some((current, mut binding)) if current == binding_id => binding.close(),
                    other => self.binding = other,
                },
                ChannelEffect::ScheduleReconnect { attempt, delay } => {
                    let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                    debug!(attempt, delay_ms, "reconnect scheduled");
                    self.retry_timer = Some(Box::pin(sleep(delay)));
                    self.emit(ChannelEvent::RetryScheduled { attempt, delay_ms });
                }
                ChannelEffect::CancelReconnect => {
                    self.retry_timer = None;
                }
                ChannelEffect::RetryExhausted(error) => {
                    warn!(%error, url = %self.url, "automatic reconnection exhausted");
                    self.emit(ChannelEvent::Diagnostic(error));
                }
            }
        }
    }

    fn emit(&mut self, event: ChannelEvent) {
        self.observers.notify(&event);
        self.pending.push_back(event);
    }
}

impl<T: Transport> Drop for LiveChannel<T> {
    fn drop(&mut self) {
        if let Some((_, mut binding)) = self.binding.take() {
            binding.close();
        }
    }
}

impl<T: Transport> std::fmt::Debug for LiveChannel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveChannel")
            .field("url", &self.url.as_str())
            .field("state", &self.machine.state())
            .field("retry_counter", &self.machine.retry_counter())
            .field("binding", &self.binding.as_ref().map(|(id, _)| *id))
            .field("closed", &self.closed)
            .finish()
    }
}

async fn wait_for_retry(timer: Option<&mut Pin<Box<Sleep>>>) {
    match timer {
        Some(timer) => timer.as_mut().await,
        None => std::future::pending().await,
    }
}

fn parse_channel_url(raw: &str) -> Result<Url, ChannelError> {
    let url = Url::parse(raw.trim())
        .map_err(|err| ChannelError::invalid_config("url", err.to_string()))?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(ChannelError::invalid_config(
            "url",
            format!("scheme must be ws or wss, got {other}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    use super::*;
    use crate::{
        channel::SignalSender,
        types::{Location, RequestContext},
    };

    #[derive(Default)]
    struct Script {
        opened: Vec<SignalSender>,
        writes: Vec<(BindingId, String)>,
        closed: Vec<BindingId>,
    }

    #[derive(Clone, Default)]
    struct ScriptedTransport {
        script: Arc<Mutex<Script>>,
    }

    impl ScriptedTransport {
        fn signals(&self, index: usize) -> SignalSender {
            self.script.lock().expect("lock").opened[index].clone()
        }

        fn open_count(&self) -> usize {
            self.script.lock().expect("lock").opened.len()
        }

        fn writes(&self) -> Vec<(BindingId, String)> {
            self.script.lock().expect("lock").writes.clone()
        }

        fn closed(&self) -> Vec<BindingId> {
            self.script.lock().expect("lock").closed.clone()
        }
    }

    struct ScriptedBinding {
        id: BindingId,
        script: Arc<Mutex<Script>>,
    }

    impl Transport for ScriptedTransport {
        type Binding = ScriptedBinding;

        fn open(&mut self, _url: &Url, signals: SignalSender) -> ScriptedBinding {
            let id = signals.binding();
            self.script.lock().expect("lock").opened.push(signals);
            ScriptedBinding {
                id,
                script: Arc::clone(&self.script),
            }
        }
    }

    impl TransportBinding for ScriptedBinding {
        fn send_text(&mut self, text: String) -> Result<(), ChannelError> {
            self.script.lock().expect("lock").writes.push((self.id, text));
            Ok(())
        }

        fn close(&mut self) {
            self.script.lock().expect("lock").closed.push(self.id);
        }
    }

    const URL: &str = "wss://assistant.example.org/agent/ws";

    fn channel(max_attempts: u32) -> (LiveChannel<ScriptedTransport>, ScriptedTransport) {
        let transport = ScriptedTransport::default();
        let policy = RetryPolicy::new(max_attempts, 1_000, 5_000).expect("policy should be valid");
        let channel =
            LiveChannel::new(URL, policy, transport.clone()).expect("channel should build");
        (channel, transport)
    }

    fn request(message: &str) -> AssistantRequest {
        AssistantRequest::new(
            message,
            RequestContext::from_analysis(&["warfarin".into()], None),
            Location::default(),
        )
    }

    async fn next(channel: &mut LiveChannel<ScriptedTransport>) -> ChannelEvent {
        channel
            .next_event()
            .await
            .expect("channel should yield an event")
    }

    async fn next_state(channel: &mut LiveChannel<ScriptedTransport>) -> ChannelState {
        loop {
            if let ChannelEvent::StateChanged { state } = next(channel).await {
                return state;
            }
        }
    }

    fn record_states(
        channel: &mut LiveChannel<ScriptedTransport>,
    ) -> Arc<Mutex<Vec<ChannelState>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        channel.on_state_change(move |state| log.lock().expect("lock").push(state));
        seen
    }

    #[tokio::test]
    async fn opens_sends_and_receives_in_order() {
        let (mut channel, transport) = channel(3);
        channel.connect();
        assert_eq!(next_state(&mut channel).await, ChannelState::Connecting);

        let signals = transport.signals(0);
        signals.opened();
        signals.frame(r#"{"reply":"first"}"#);
        signals.frame(r#"{"reply":"second"}"#);

        assert_eq!(
            next(&mut channel).await,
            ChannelEvent::StateChanged {
                state: ChannelState::Open
            }
        );
        for expected in ["first", "second"] {
            match next(&mut channel).await {
                ChannelEvent::Message(reply) => assert_eq!(reply.reply, expected),
                other => panic!("unexpected event: {other:?}"),
            }
        }

        channel
            .send(&request("can I take these together?"))
            .expect("open channel should accept send");
        let writes = transport.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].0, BindingId(1));
        assert!(writes[0].1.contains("can I take these together?"));
    }

    #[tokio::test]
    async fn send_is_rejected_unless_open() {
        let (mut channel, transport) = channel(3);

        let err = channel.send(&request("hi")).expect_err("disconnected");
        assert_eq!(err.category, ChannelErrorCategory::NotConnected);

        channel.connect();
        assert!(channel.send(&request("hi")).is_err());

        transport.signals(0).errored("refused");
        assert_eq!(next_state(&mut channel).await, ChannelState::Connecting);
        assert_eq!(next_state(&mut channel).await, ChannelState::Reconnecting);
        let err = channel.send(&request("hi")).expect_err("reconnecting");
        assert_eq!(err.message, "cannot send while channel is reconnecting");

        channel.close();
        assert!(channel.send(&request("hi")).is_err());
        assert!(transport.writes().is_empty());
    }

    #[tokio::test]
    async fn malformed_frame_keeps_channel_open() {
        let (mut channel, transport) = channel(3);
        let replies = Arc::new(Mutex::new(0_u32));
        let counter = Arc::clone(&replies);
        channel.on_message(move |_| *counter.lock().expect("lock") += 1);

        channel.connect();
        transport.signals(0).opened();
        transport.signals(0).frame("<html>502 Bad Gateway</html>");

        assert_eq!(next_state(&mut channel).await, ChannelState::Connecting);
        assert_eq!(next_state(&mut channel).await, ChannelState::Open);
        match next(&mut channel).await {
            ChannelEvent::Diagnostic(error) => assert_eq!(error.code, "malformed_message"),
            other => panic!("unexpected event: {other:?}"),
        }

        assert_eq!(channel.state(), ChannelState::Open);
        assert_eq!(*replies.lock().expect("lock"), 0);
        assert_eq!(transport.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn three_consecutive_errors_end_in_failed() {
        let (mut channel, transport) = channel(3);
        let seen = record_states(&mut channel);
        let started = tokio::time::Instant::now();

        channel.connect();
        for attempt in 0..3 {
            transport.signals(attempt).errored("connection refused");
            if attempt < 2 {
                loop {
                    if next_state(&mut channel).await == ChannelState::Connecting
                        && transport.open_count() == attempt + 2
                    {
                        break;
                    }
                }
            }
        }
        while next_state(&mut channel).await != ChannelState::Failed {}

        use ChannelState::*;
        assert_eq!(
            *seen.lock().expect("lock"),
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
        assert_eq!(channel.retry_counter(), 3);
        assert_eq!(started.elapsed(), Duration::from_millis(3_000));
        assert_eq!(transport.closed(), vec![BindingId(1), BindingId(2), BindingId(3)]);

        let idle = tokio::time::timeout(Duration::from_secs(60), channel.next_event()).await;
        assert!(idle.is_err(), "failed channel must not reconnect on its own");
        assert_eq!(transport.open_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn reports_retry_schedule_and_exhaustion() {
        let (mut channel, transport) = channel(2);
        channel.connect();
        transport.signals(0).errored("refused");

        let mut events = Vec::new();
        while events.len() < 4 {
            events.push(next(&mut channel).await);
        }
        assert_eq!(
            events,
            vec![
                ChannelEvent::StateChanged { state: ChannelState::Connecting },
                ChannelEvent::StateChanged { state: ChannelState::Reconnecting },
                ChannelEvent::RetryScheduled {
                    attempt: 0,
                    delay_ms: 1_000
                },
                ChannelEvent::StateChanged { state: ChannelState::Connecting },
            ]
        );

        transport.signals(1).closed();
        assert_eq!(next_state(&mut channel).await, ChannelState::Reconnecting);
        match next(&mut channel).await {
            ChannelEvent::Diagnostic(error) => assert_eq!(error.code, "retry_exhausted"),
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(next_state(&mut channel).await, ChannelState::Failed);
    }

    #[tokio::test]
    async fn close_before_open_discards_late_completion() {
        let (mut channel, transport) = channel(3);
        let seen = record_states(&mut channel);
        let replies = Arc::new(Mutex::new(0_u32));
        let counter = Arc::clone(&replies);
        channel.on_message(move |_| *counter.lock().expect("lock") += 1);

        channel.connect();
        channel.close();
        assert_eq!(
            *seen.lock().expect("lock"),
            vec![ChannelState::Connecting, ChannelState::Disconnected]
        );

        let stale = transport.signals(0);
        stale.opened();
        stale.frame(r#"{"reply":"too late"}"#);
        stale.errored("late failure");

        assert_eq!(channel.next_event().await, None);
        assert_eq!(seen.lock().expect("lock").len(), 2);
        assert_eq!(*replies.lock().expect("lock"), 0);
        assert_eq!(transport.closed(), vec![BindingId(1)]);
        assert_eq!(channel.state(), ChannelState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn close_cancels_pending_backoff() {
        let (mut channel, transport) = channel(3);
        channel.connect();
        transport.signals(0).errored("refused");
        assert_eq!(next_state(&mut channel).await, ChannelState::Connecting);
        assert_eq!(next_state(&mut channel).await, ChannelState::Reconnecting);

        channel.close();
        channel.close();
        tokio::time::advance(Duration::from_secs(30)).await;

        assert_eq!(channel.next_event().await, None);
        assert_eq!(transport.open_count(), 1);
        assert!(channel.is_closed());

        channel.connect();
        assert_eq!(transport.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_connect_recovers_from_failed() {
        let (mut channel, transport) = channel(1);
        channel.connect();
        transport.signals(0).errored("refused");
        while next_state(&mut channel).await != ChannelState::Failed {}
        assert_eq!(channel.retry_counter(), 1);
        let err = channel.send(&request("hi")).expect_err("failed channel");
        assert_eq!(err.code, "not_connected");

        channel.connect();
        assert_eq!(channel.retry_counter(), 0);
        assert_eq!(transport.open_count(), 2);

        transport.signals(1).opened();
        assert_eq!(next_state(&mut channel).await, ChannelState::Connecting);
        assert_eq!(next_state(&mut channel).await, ChannelState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_binding_cannot_open_channel() {
        let (mut channel, transport) = channel(3);
        channel.connect();
        transport.signals(0).errored("refused");
        while transport.open_count() < 2 {
            next(&mut channel).await;
        }

        transport.signals(0).opened();
        transport.signals(1).opened();

        let mut states = Vec::new();
        while states.last() != Some(&ChannelState::Open) {
            states.push(next_state(&mut channel).await);
        }
        assert_eq!(states, vec![ChannelState::Open]);
        assert_eq!(channel.send(&request("hello")), Ok(()));
        assert_eq!(transport.writes()[0].0, BindingId(2));
    }

    #[tokio::test(start_paused = true)]
    async fn peer_close_while_open_reconnects_with_base_delay() {
        let (mut channel, transport) = channel(3);
        channel.connect();
        transport.signals(0).opened();
        while next_state(&mut channel).await != ChannelState::Open {}

        transport.signals(0).closed();
        assert_eq!(next_state(&mut channel).await, ChannelState::Reconnecting);
        assert_eq!(
            next(&mut channel).await,
            ChannelEvent::RetryScheduled {
                attempt: 0,
                delay_ms: 1_000
            }
        );
        assert_eq!(channel.retry_counter(), 1);
    }

    #[test]
    fn rejects_non_websocket_endpoints() {
        let policy = RetryPolicy::default();
        let err = LiveChannel::new(
            "https://example.org/agent",
            policy,
            ScriptedTransport::default(),
        )
        .expect_err("http scheme must fail");
        assert_eq!(err.category, ChannelErrorCategory::Config);

        let err = LiveChannel::new("not a url", policy, ScriptedTransport::default())
            .expect_err("garbage must fail");
        assert_eq!(err.code, "invalid_config");
    }
}

use crate::{
    error::ChannelError,
    types::{AssistantReply, ChannelEvent, ChannelState},
};

/// Callback invoked on every state transition.
pub type StateObserver = Box<dyn FnMut(ChannelState) + Send + 'static>;
/// Callback invoked once per decoded reply.
pub type MessageObserver = Box<dyn FnMut(&AssistantReply) + Send + 'static>;
/// Callback invoked for malformed frames and retry exhaustion.
pub type DiagnosticObserver = Box<dyn FnMut(&ChannelError) + Send + 'static>;

/// Consumer callbacks registered on one channel.
#[derive(Default)]
pub struct Observers {
    state: Vec<StateObserver>,
    message: Vec<MessageObserver>,
    diagnostic: Vec<DiagnosticObserver>,
}

impl Observers {
    pub fn on_state_change(&mut self, observer: StateObserver) {
        self.state.push(observer);
    }

    pub fn on_message(&mut self, observer: MessageObserver) {
        self.message.push(observer);
    }

    pub fn on_diagnostic(&mut self, observer: DiagnosticObserver) {
        self.diagnostic.push(observer);
    }

    /// Invoke every observer interested in `event`, in registration order.
    pub fn notify(&mut self, event: &ChannelEvent) {
        match event {
            ChannelEvent::StateChanged { state } => {
                for observer in &mut self.state {
                    observer(*state);
                }
            }
            ChannelEvent::Message(reply) => {
                for observer in &mut self.message {
                    observer(reply);
                }
            }
            ChannelEvent::Diagnostic(error) => {
                for observer in &mut self.diagnostic {
                    observer(error);
                }
            }
            ChannelEvent::RetryScheduled { .. } => {}
        }
    }

    pub fn clear(&mut self) {
        self.state.clear();
        self.message.clear();
        self.diagnostic.clear();
    }
}

impl std::fmt::Debug for Observers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observers")
            .field("state", &self.state.len())
            .field("message", &self.message.len())
            .field("diagnostic", &self.diagnostic.len())
            .finish()
    }
}

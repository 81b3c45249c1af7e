//! Transcript and status reducer for `nexus-chat`.

use channel_core::{
    AssistantReply, ChannelError, ChannelErrorCategory, ChannelEvent, ChannelState,
    NearbyFacility,
};
use tracing::debug;

const GREETING: &str =
    "Hello. I am Nexus. I've analyzed the medication profile. How can I assist you?";
const OFFLINE_TEXT: &str = "Nexus core temporarily offline.";

/// Author of a transcript entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Agent,
}

/// One transcript entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    pub nearby_facilities: Vec<NearbyFacility>,
}

/// Full view of the chat after a state transition.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatSnapshot {
    pub messages: Vec<ChatMessage>,
    pub status_text: String,
    pub error_text: Option<String>,
    pub loading: bool,
    pub can_send: bool,
    pub show_reconnect_action: bool,
}

/// Mutable chat state fed by channel events and user input.
#[derive(Debug, Clone)]
pub struct ChatState {
    max_messages: usize,
    messages: Vec<ChatMessage>,
    channel_state: ChannelState,
    retry_delay_ms: Option<u64>,
    loading: bool,
    error_text: Option<String>,
}

impl ChatState {
    /// Create a transcript seeded with the assistant greeting.
    pub fn new(max_messages: usize) -> Self {
        Self {
            max_messages: max_messages.max(1),
            messages: vec![ChatMessage {
                role: Role::Agent,
                content: GREETING.to_owned(),
                nearby_facilities: Vec::new(),
            }],
            channel_state: ChannelState::Disconnected,
            retry_delay_ms: None,
            loading: false,
            error_text: None,
        }
    }

    pub fn snapshot(&self) -> ChatSnapshot {
        ChatSnapshot {
            messages: self.messages.clone(),
            status_text: self.status_text(),
            error_text: self.error_text.clone(),
            loading: self.loading,
            can_send: self.can_send(),
            show_reconnect_action: self.show_reconnect_action(),
        }
    }

    pub fn status_text(&self) -> String {
        match self.channel_state {
            ChannelState::Open => "Connected".to_owned(),
            ChannelState::Connecting => "Connecting...".to_owned(),
            ChannelState::Reconnecting => match self.retry_delay_ms {
                Some(delay_ms) => format!("Reconnecting (retry in {delay_ms} ms)"),
                None => "Reconnecting...".to_owned(),
            },
            ChannelState::Disconnected | ChannelState::Failed => "Offline".to_owned(),
        }
    }

    /// Sending is only offered on an open channel with no reply outstanding.
    pub fn can_send(&self) -> bool {
        self.channel_state == ChannelState::Open && !self.loading
    }

    pub fn show_reconnect_action(&self) -> bool {
        matches!(
            self.channel_state,
            ChannelState::Disconnected | ChannelState::Failed
        )
    }

    /// Append the user's message and wait for the assistant.
    pub fn record_user_message(&mut self, text: impl Into<String>) {
        self.push(ChatMessage {
            role: Role::User,
            content: text.into(),
            nearby_facilities: Vec::new(),
        });
        self.loading = true;
        self.error_text = None;
    }

    /// A send was rejected synchronously; nothing is in flight.
    pub fn handle_send_failure(&mut self, err: &ChannelError) {
        self.loading = false;
        self.error_text = Some(match err.category {
            ChannelErrorCategory::NotConnected => format!("{OFFLINE_TEXT} {}", err.message),
            _ => format!("send failed ({}): {}", err.code, err.message),
        });
    }

    pub fn handle_channel_event(&mut self, event: &ChannelEvent) {
        match event {
            ChannelEvent::StateChanged { state } => {
                debug!(%state, "chat observed channel state");
                self.channel_state = *state;
                if *state != ChannelState::Reconnecting {
                    self.retry_delay_ms = None;
                }
                if *state == ChannelState::Open {
                    self.error_text = None;
                } else {
                    // Replies never cross bindings.
                    self.loading = false;
                }
            }
            ChannelEvent::RetryScheduled { delay_ms, .. } => {
                self.retry_delay_ms = Some(*delay_ms);
            }
            ChannelEvent::Message(reply) => self.handle_reply(reply),
            ChannelEvent::Diagnostic(err) => {
                debug!(code = %err.code, "chat recorded channel diagnostic");
                self.error_text = Some(match err.category {
                    ChannelErrorCategory::RetryExhausted => {
                        format!("{OFFLINE_TEXT} {}", err.message)
                    }
                    _ => format!("{}: {}", err.code, err.message),
                });
            }
        }
    }

    fn handle_reply(&mut self, reply: &AssistantReply) {
        self.push(ChatMessage {
            role: Role::Agent,
            content: reply.reply.clone(),
            nearby_facilities: reply.nearby_facilities.clone(),
        });
        self.loading = false;
    }

    fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
        if self.messages.len() > self.max_messages {
            let excess = self.messages.len() - self.max_messages;
            self.messages.drain(0..excess);
        }
    }
}

/// One-line rendering of a suggested facility.
pub fn facility_line(facility: &NearbyFacility) -> String {
    let mut line = format!(
        "{} ({}, {:.1} km)",
        facility.name, facility.kind, facility.distance_km
    );
    if let Some(website) = facility.website.as_deref() {
        line.push_str(" - ");
        line.push_str(website);
    }
    if let Some(contact) = facility.contact.as_deref() {
        line.push_str(" - tel: ");
        line.push_str(contact);
    }
    line
}

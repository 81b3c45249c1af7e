//! Client-side contract for the live assistant channel.
//!
//! This crate defines the request/reply wire types, the retry policy, the
//! reconnecting lifecycle state machine, and the `LiveChannel` driver that owns
//! exactly one transport binding at a time.

/// Binding-tagged transport signal plumbing.
pub mod channel;
/// Inbound frame decoding and outbound request encoding.
pub mod dispatch;
/// Stable channel error types.
pub mod error;
/// Channel driver tying the state machine to a transport.
pub mod live;
/// Consumer callback registry.
pub mod observer;
/// Exponential backoff policy.
pub mod retry;
/// Pure lifecycle and retry state machine.
pub mod state_machine;
/// Transport binding traits.
pub mod transport;
/// Wire and consumer-facing types.
pub mod types;

pub use channel::{SignalHub, SignalKind, SignalReceiver, SignalSender, TransportSignal};
pub use dispatch::{decode_frame, encode_request};
pub use error::{ChannelError, ChannelErrorCategory};
pub use live::LiveChannel;
pub use observer::Observers;
pub use retry::RetryPolicy;
pub use state_machine::{ChannelEffect, ChannelStateMachine};
pub use transport::{Transport, TransportBinding};
pub use types::{
    AnalysisSnapshot, AssistantReply, AssistantRequest, BindingId, ChannelEvent, ChannelState,
    DrugInteraction, Location, NearbyFacility, RequestContext,
};

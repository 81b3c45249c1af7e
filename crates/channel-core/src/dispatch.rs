use crate::{
    error::ChannelError,
    types::{AssistantReply, AssistantRequest},
};

/// Serialize one outbound request into a text frame.
pub fn encode_request(request: &AssistantRequest) -> Result<String, ChannelError> {
    serde_json::to_string(request).map_err(|err| ChannelError::encode_failed(err.to_string()))
}

/// Decode one inbound text frame into an assistant reply.
///
/// A frame that fails to decode is reported as `MalformedMessage`; callers drop it
/// and keep the channel open.
pub fn decode_frame(frame: &str) -> Result<AssistantReply, ChannelError> {
    serde_json::from_str::<AssistantReply>(frame).map_err(|err| {
        ChannelError::malformed_message(format!("{err} (frame: {})", preview(frame)))
    })
}

fn preview(frame: &str) -> String {
    const MAX_CHARS: usize = 80;
    if frame.chars().count() <= MAX_CHARS {
        return frame.to_owned();
    }
    let mut out = frame.chars().take(MAX_CHARS).collect::<String>();
    out.push('…');
    out
}

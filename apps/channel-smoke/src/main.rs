use std::{env, process, time::Duration};

use channel_core::{
    AssistantRequest, ChannelEvent, ChannelState, LiveChannel, Location, RequestContext,
    RetryPolicy,
};
use channel_ws::WsTransport;
use tokio::time::timeout;
use tracing_subscriber::EnvFilter;

const DEFAULT_URL: &str = "wss://pharmnexus.onrender.com/agent/ws";
const DEFAULT_MESSAGE: &str = "Is it safe to take ibuprofen with warfarin?";
const REPLY_TIMEOUT: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();

    let url = env::var("NEXUS_AGENT_WS_URL").unwrap_or_else(|_| DEFAULT_URL.to_owned());
    let message = env::var("NEXUS_SMOKE_MESSAGE").unwrap_or_else(|_| DEFAULT_MESSAGE.to_owned());

    match timeout(REPLY_TIMEOUT, round_trip(&url, &message)).await {
        Ok(Ok(reply)) => println!("{reply}"),
        Ok(Err(err)) => {
            eprintln!("Channel smoke failed: {err}");
            process::exit(1);
        }
        Err(_) => {
            eprintln!("Channel smoke timed out after {REPLY_TIMEOUT:?} waiting on {url}");
            process::exit(1);
        }
    }
}

async fn round_trip(url: &str, message: &str) -> Result<String, String> {
    let mut channel = LiveChannel::new(url, RetryPolicy::default(), WsTransport::default())
        .map_err(|err| err.to_string())?;
    channel.connect();

    let mut sent = false;
    while let Some(event) = channel.next_event().await {
        match event {
            ChannelEvent::StateChanged {
                state: ChannelState::Open,
            } if !sent => {
                let request = AssistantRequest::new(
                    message,
                    RequestContext::from_analysis(&["ibuprofen".into(), "warfarin".into()], None),
                    Location::default(),
                );
                channel.send(&request).map_err(|err| err.to_string())?;
                sent = true;
            }
            ChannelEvent::StateChanged {
                state: ChannelState::Failed,
            } => {
                return Err(format!("gave up connecting to {url}"));
            }
            ChannelEvent::StateChanged { state } => eprintln!("channel {state}"),
            ChannelEvent::RetryScheduled { attempt, delay_ms } => {
                eprintln!("retry {attempt} in {delay_ms} ms");
            }
            ChannelEvent::Message(reply) => {
                channel.close();
                let mut out = reply.reply;
                for facility in reply.nearby_facilities {
                    out.push_str(&format!(
                        "\n* {} ({}, {:.1} km)",
                        facility.name, facility.kind, facility.distance_km
                    ));
                }
                return Ok(out);
            }
            ChannelEvent::Diagnostic(err) => eprintln!("diagnostic: {err}"),
        }
    }

    Err("channel closed before a reply arrived".to_owned())
}

mod analysis;
mod config;
mod logging;
mod state;

use std::process;

use channel_core::{AssistantRequest, ChannelEvent, LiveChannel, RequestContext};
use channel_ws::{WsTransport, WsTransportConfig};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};

use crate::{
    analysis::load_analysis,
    config::ChatConfig,
    state::{ChatMessage, ChatSnapshot, ChatState, Role, facility_line},
};

#[derive(Debug, PartialEq, Eq)]
enum Input<'a> {
    Empty,
    Quit,
    Reconnect,
    Message(&'a str),
}

#[tokio::main]
async fn main() {
    logging::init();

    if let Err(err) = run().await {
        error!(%err, "nexus-chat stopped");
        eprintln!("nexus-chat: {err}");
        process::exit(1);
    }
}

async fn run() -> Result<(), String> {
    let config = ChatConfig::from_env().map_err(|err| err.to_string())?;
    let analysis = match config.analysis_file.as_deref() {
        Some(path) => load_analysis(path)?,
        None => None,
    };
    let context = RequestContext::from_analysis(&config.drugs, analysis.as_ref());
    info!(
        url = %config.agent_ws_url,
        drug_count = context.drugs.len(),
        interaction_count = context.interactions.len(),
        location_known = config.location.is_known(),
        "starting nexus chat"
    );

    let transport = WsTransport::new(WsTransportConfig {
        connect_timeout: config.connect_timeout,
    });
    let mut channel = LiveChannel::new(&config.agent_ws_url, config.retry_policy, transport)
        .map_err(|err| err.to_string())?;
    channel.on_state_change(|state| debug!(%state, "channel state changed"));
    channel.on_message(|reply| {
        info!(
            facility_count = reply.nearby_facilities.len(),
            "assistant reply received"
        );
    });
    channel.on_diagnostic(|err| {
        warn!(code = %err.code, message = %err.message, "channel diagnostic");
    });

    let mut chat = ChatState::new(config.max_messages);
    if let Some(greeting) = chat.snapshot().messages.last() {
        print_message(greeting);
    }
    println!("-- commands: /reconnect, /quit");
    channel.connect();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = line.map_err(|err| format!("failed reading stdin: {err}"))?;
                let Some(line) = line else {
                    debug!("stdin closed");
                    break;
                };

                match parse_input(&line) {
                    Input::Empty => {}
                    Input::Quit => break,
                    Input::Reconnect => channel.connect(),
                    Input::Message(text) => {
                        let snapshot = chat.snapshot();
                        if snapshot.loading {
                            println!("-- waiting for Nexus to answer the previous message");
                            continue;
                        }
                        if !snapshot.can_send {
                            debug!(status = %snapshot.status_text, "send attempted while not connected");
                        }
                        let request = AssistantRequest::new(text, context.clone(), config.location);
                        match channel.send(&request) {
                            Ok(()) => chat.record_user_message(text),
                            Err(err) => {
                                chat.handle_send_failure(&err);
                                print_error(&chat.snapshot());
                            }
                        }
                    }
                }
            }
            event = channel.next_event() => {
                let Some(event) = event else {
                    break;
                };
                chat.handle_channel_event(&event);
                render_event(&chat.snapshot(), &event);
            }
        }
    }

    channel.close();
    Ok(())
}

fn parse_input(line: &str) -> Input<'_> {
    match line.trim() {
        "" => Input::Empty,
        "/quit" | "/exit" => Input::Quit,
        "/reconnect" => Input::Reconnect,
        text => Input::Message(text),
    }
}

fn render_event(snapshot: &ChatSnapshot, event: &ChannelEvent) {
    match event {
        ChannelEvent::StateChanged { .. } => {
            println!("-- {}", snapshot.status_text);
            if snapshot.show_reconnect_action {
                println!("-- type /reconnect to try again");
            }
        }
        ChannelEvent::RetryScheduled { .. } => println!("-- {}", snapshot.status_text),
        ChannelEvent::Message(_) => {
            if let Some(message) = snapshot.messages.last() {
                print_message(message);
            }
        }
        ChannelEvent::Diagnostic(_) => print_error(snapshot),
    }
}

fn print_message(message: &ChatMessage) {
    let speaker = match message.role {
        Role::User => "you",
        Role::Agent => "nexus",
    };
    println!("{speaker}> {}", message.content);
    if !message.nearby_facilities.is_empty() {
        println!("   nearby facilities:");
        for facility in &message.nearby_facilities {
            println!("   * {}", facility_line(facility));
        }
    }
}

fn print_error(snapshot: &ChatSnapshot) {
    if let Some(text) = snapshot.error_text.as_deref() {
        println!("!! {text}");
    }
}

//! WebSocket transport binding for the live assistant channel.
//!
//! Each binding runs its handshake and read/write loop on a dedicated task and
//! reports back only through its `SignalSender`.

use std::time::Duration;

use channel_core::{ChannelError, SignalSender, Transport, TransportBinding};
use futures_util::{SinkExt, StreamExt};
use tokio::{net::TcpStream, sync::mpsc, time::timeout};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

/// WebSocket transport configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WsTransportConfig {
    /// Upper bound on the connection handshake. `None` waits for the OS/TLS stack.
    pub connect_timeout: Option<Duration>,
}

impl Default for WsTransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Some(Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS)),
        }
    }
}

/// Creates one `tokio-tungstenite` connection per binding.
#[derive(Debug, Clone, Default)]
pub struct WsTransport {
    config: WsTransportConfig,
}

impl WsTransport {
    pub fn new(config: WsTransportConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &WsTransportConfig {
        &self.config
    }
}

impl Transport for WsTransport {
    type Binding = WsBinding;

    fn open(&mut self, url: &Url, signals: SignalSender) -> WsBinding {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();

        debug!(binding = %signals.binding(), %url, "opening websocket binding");
        tokio::spawn(run_binding(
            url.clone(),
            self.config.connect_timeout,
            signals,
            outgoing_rx,
            stop.child_token(),
        ));

        WsBinding {
            outgoing: outgoing_tx,
            stop,
        }
    }
}

/// Handle to one websocket connection task. Dropping it releases the connection.
#[derive(Debug)]
pub struct WsBinding {
    outgoing: mpsc::UnboundedSender<String>,
    stop: CancellationToken,
}

impl TransportBinding for WsBinding {
    fn send_text(&mut self, text: String) -> Result<(), ChannelError> {
        self.outgoing
            .send(text)
            .map_err(|_| ChannelError::connection_failed("websocket writer task has stopped"))
    }

    fn close(&mut self) {
        self.stop.cancel();
    }
}

impl Drop for WsBinding {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn run_binding(
    url: Url,
    connect_timeout: Option<Duration>,
    signals: SignalSender,
    mut outgoing: mpsc::UnboundedReceiver<String>,
    stop: CancellationToken,
) {
    let binding = signals.binding();

    let stream = tokio::select! {
        _ = stop.cancelled() => {
            trace!(%binding, "binding released during handshake");
            return;
        }
        result = connect_stream(&url, connect_timeout) => match result {
            Ok(stream) => stream,
            Err(reason) => {
                signals.errored(reason);
                return;
            }
        },
    };

    signals.opened();
    let (mut writer, mut reader) = stream.split();

    loop {
        tokio::select! {
            _ = stop.cancelled() => {
                let _ = writer.send(Message::Close(None)).await;
                debug!(%binding, "websocket binding released");
                return;
            }
            next_outgoing = outgoing.recv() => {
                let Some(text) = next_outgoing else {
                    let _ = writer.send(Message::Close(None)).await;
                    return;
                };
                if let Err(err) = writer.send(Message::Text(text.into())).await {
                    signals.errored(format!("websocket write failed: {err}"));
                    return;
                }
            }
            frame = reader.next() => match frame {
                Some(Ok(Message::Text(text))) => signals.frame(text.as_str()),
                Some(Ok(Message::Close(close_frame))) => {
                    debug!(%binding, ?close_frame, "peer sent close frame");
                    signals.closed();
                    return;
                }
                Some(Ok(Message::Binary(payload))) => {
                    debug!(%binding, len = payload.len(), "ignoring binary frame");
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    signals.errored(format!("websocket read failed: {err}"));
                    return;
                }
                None => {
                    signals.closed();
                    return;
                }
            },
        }
    }
}

async fn connect_stream(url: &Url, connect_timeout: Option<Duration>) -> Result<WsStream, String> {
    let connect = connect_async(url.as_str());
    let result = match connect_timeout {
        Some(limit) => timeout(limit, connect)
            .await
            .map_err(|_| format!("connection timeout after {limit:?}"))?,
        None => connect.await,
    };

    result
        .map(|(stream, _response)| stream)
        .map_err(|err| format!("websocket connect to {url} failed: {err}"))
}

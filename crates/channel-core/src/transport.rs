use url::Url;

use crate::{channel::SignalSender, error::ChannelError};

/// Factory for transport bindings.
///
/// `open` must return immediately; the connection handshake runs in the
/// background and its outcome is reported through `signals`.
pub trait Transport: Send + 'static {
    type Binding: TransportBinding;

    fn open(&mut self, url: &Url, signals: SignalSender) -> Self::Binding;
}

/// One live duplex connection.
pub trait TransportBinding: Send + 'static {
    /// Queue one text frame for writing.
    fn send_text(&mut self, text: String) -> Result<(), ChannelError>;

    /// Release the connection. Signals raised afterwards are ignored by the driver.
    fn close(&mut self);
}

use tokio::sync::mpsc;

use crate::types::BindingId;

/// Notification raised by a transport binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalKind {
    /// The connection handshake completed.
    Opened,
    /// One text frame arrived.
    Frame(String),
    /// The connection failed. Carries a human-readable reason.
    Errored(String),
    /// The peer closed the connection.
    Closed,
}

/// Binding-tagged transport signal delivered to the channel driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportSignal {
    pub binding: BindingId,
    pub kind: SignalKind,
}

/// Receiving half owned by the channel driver.
pub type SignalReceiver = mpsc::UnboundedReceiver<TransportSignal>;

/// Sending half handed to one transport binding.
///
/// Every signal is stamped with the binding id, so a binding cannot report on
/// behalf of another one. Emission is best-effort: once the driver is gone the
/// signal is dropped.
#[derive(Debug, Clone)]
pub struct SignalSender {
    binding: BindingId,
    tx: mpsc::UnboundedSender<TransportSignal>,
}

impl SignalSender {
    pub fn binding(&self) -> BindingId {
        self.binding
    }

    pub fn opened(&self) {
        self.emit(SignalKind::Opened);
    }

    pub fn frame(&self, text: impl Into<String>) {
        self.emit(SignalKind::Frame(text.into()));
    }

    pub fn errored(&self, reason: impl Into<String>) {
        self.emit(SignalKind::Errored(reason.into()));
    }

    pub fn closed(&self) {
        self.emit(SignalKind::Closed);
    }

    /// Whether the driver still listens for signals.
    pub fn is_attached(&self) -> bool {
        !self.tx.is_closed()
    }

    fn emit(&self, kind: SignalKind) {
        let _ = self.tx.send(TransportSignal {
            binding: self.binding,
            kind,
        });
    }
}

/// Fan-in point for signals of every binding a channel creates.
#[derive(Debug, Clone)]
pub struct SignalHub {
    tx: mpsc::UnboundedSender<TransportSignal>,
}

impl SignalHub {
    /// Create a hub and return it with the receiver.
    pub fn new() -> (Self, SignalReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn sender_for(&self, binding: BindingId) -> SignalSender {
        SignalSender {
            binding,
            tx: self.tx.clone(),
        }
    }
}

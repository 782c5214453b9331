use crate::error::TransportError;
use crate::networking::api_message::{InboundFrame, OutboundFrame};

/// What a transport reports to the connection that owns it.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Open,
    Closed,
    Frame(InboundFrame),
}

///
/// The sending half of a persistent message channel. Received frames and
/// open/close notifications arrive separately as `TransportEvent`s.
///
pub trait Transport: Send + Sync {
    /// Queue a frame for writing. Fails if the socket is not open.
    fn send(&self, frame: OutboundFrame) -> Result<(), TransportError>;
}

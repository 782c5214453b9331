use crate::error::TransportError;
use crate::networking::api_message::{InboundFrame, OutboundFrame};
use crate::networking::transport::{Transport, TransportEvent};
use futures::{FutureExt, StreamExt};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_tungstenite::{connect_async, tungstenite, tungstenite::Message};
use tracing::{event, Level};
use url::Url;

type SocketSender = mpsc::UnboundedSender<Message>;

///
/// A websocket transport which keeps redialing its url. Every successful
/// dial reports `Open`, every lost socket `Closed`, and text frames are
/// decoded into `InboundFrame`s.
///
pub struct WsTransport {
    url: Url,
    sender: RwLock<Option<SocketSender>>,
}

impl WsTransport {
    pub fn spawn(
        url: Url,
        redial: Duration,
        shutdown: broadcast::Receiver<()>,
    ) -> (
        Arc<Self>,
        mpsc::UnboundedReceiver<TransportEvent>,
        JoinHandle<()>,
    ) {
        let transport = Arc::new(WsTransport {
            url,
            sender: RwLock::new(None),
        });
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_socket(transport.clone(), events_tx, redial, shutdown));
        (transport, events_rx, handle)
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    fn set_sender(&self, sender: Option<SocketSender>) {
        *self.sender.write().unwrap_or_else(PoisonError::into_inner) = sender;
    }
}

impl Transport for WsTransport {
    fn send(&self, frame: OutboundFrame) -> Result<(), TransportError> {
        let text = frame.serialize()?;
        let sender = self.sender.read().unwrap_or_else(PoisonError::into_inner);
        match sender.as_ref() {
            Some(sender) => sender
                .send(Message::Text(text))
                .map_err(|_| TransportError::NotConnected),
            None => Err(TransportError::NotConnected),
        }
    }
}

async fn run_socket(
    transport: Arc<WsTransport>,
    events: mpsc::UnboundedSender<TransportEvent>,
    redial: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        let ws_stream_result = tokio::select! {
            res = connect_async(transport.url.as_str()) => res,
            _ = shutdown.recv() => return,
        };
        match ws_stream_result {
            Ok((ws_stream, _)) => {
                event!(Level::INFO, "socket open: {}", transport.url);
                let (write_sink, mut read_stream) = ws_stream.split();
                let (socket_sender, socket_rcv) = mpsc::unbounded_channel();
                let writer = tokio::spawn(
                    UnboundedReceiverStream::new(socket_rcv)
                        .map(Ok::<Message, tungstenite::Error>)
                        .forward(write_sink)
                        .map(|result| {
                            if let Err(err) = result {
                                event!(Level::ERROR, "error sending websocket msg: {}", err);
                            }
                        }),
                );
                transport.set_sender(Some(socket_sender));
                if events.send(TransportEvent::Open).is_err() {
                    transport.set_sender(None);
                    writer.abort();
                    return;
                }

                let stop = loop {
                    tokio::select! {
                        message = read_stream.next() => match message {
                            Some(Ok(Message::Text(text))) => match InboundFrame::deserialize(&text) {
                                Ok(frame) => {
                                    if events.send(TransportEvent::Frame(frame)).is_err() {
                                        break true;
                                    }
                                }
                                Err(err) => event!(Level::WARN, "dropping malformed frame: {}", err),
                            },
                            Some(Ok(Message::Close(_))) | None => break false,
                            Some(Ok(_)) => {}
                            Some(Err(err)) => {
                                event!(Level::ERROR, "error reading from socket {}", err);
                                break false;
                            }
                        },
                        _ = shutdown.recv() => break true,
                    }
                };

                transport.set_sender(None);
                writer.abort();
                event!(Level::INFO, "socket closed: {}", transport.url);
                if stop || events.send(TransportEvent::Closed).is_err() {
                    return;
                }
            }
            Err(err) => {
                event!(Level::DEBUG, "error connecting to {}: {}", transport.url, err);
            }
        }

        tokio::select! {
            _ = sleep(redial) => {}
            _ = shutdown.recv() => return,
        }
    }
}

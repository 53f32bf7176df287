use futures_util::future::BoxFuture;
use futures_util::{FutureExt, SinkExt, StreamExt};
use gbcms_core::ClientError;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, warn};
use url::Url;

pub(crate) const LINK_BUFFER: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Text(String),
    Closed(Option<String>),
}

/// One open transport session.
///
/// Text pushed into `outbound` goes to the server; everything the server
/// sends arrives on `inbound`. Dropping `outbound` closes the session.
pub struct Link {
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<LinkEvent>,
}

pub trait Transport: Send + Sync + 'static {
    fn open(&self, url: &Url) -> BoxFuture<'static, Result<Link, ClientError>>;
}

#[derive(Debug, Default, Clone)]
pub struct WsTransport;

impl WsTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Transport for WsTransport {
    fn open(&self, url: &Url) -> BoxFuture<'static, Result<Link, ClientError>> {
        let url = url.clone();
        async move {
            let (ws, _) = connect_async(url.as_str())
                .await
                .map_err(|err| ClientError::Transport(err.to_string()))?;
            let (out_tx, mut out_rx) = mpsc::channel::<String>(LINK_BUFFER);
            let (in_tx, in_rx) = mpsc::channel::<LinkEvent>(LINK_BUFFER);
            let (mut sink, mut stream) = ws.split();

            tokio::spawn(async move {
                let reason = loop {
                    tokio::select! {
                        frame = stream.next() => match frame {
                            Some(Ok(WsMessage::Text(text))) => {
                                if in_tx.send(LinkEvent::Text(text)).await.is_err() {
                                    break None;
                                }
                            }
                            Some(Ok(WsMessage::Close(frame))) => {
                                break Some(frame.map(|f| f.reason.to_string()).unwrap_or_else(|| "closed by server".to_string()));
                            }
                            Some(Ok(_)) => {}
                            Some(Err(err)) => break Some(err.to_string()),
                            None => break Some("stream ended".to_string()),
                        },
                        out = out_rx.recv() => match out {
                            Some(text) => {
                                if let Err(err) = sink.send(WsMessage::Text(text)).await {
                                    warn!("ws_send_error: {err}");
                                    break Some(err.to_string());
                                }
                            }
                            None => {
                                debug!("ws_link_released");
                                let _ = sink.close().await;
                                break None;
                            }
                        },
                    }
                };
                if let Some(reason) = reason {
                    let _ = in_tx.send(LinkEvent::Closed(Some(reason))).await;
                }
            });

            Ok(Link {
                outbound: out_tx,
                inbound: in_rx,
            })
        }
        .boxed()
    }
}

/// Server side of a [`ChannelTransport`] session.
pub struct RemoteEnd {
    sent: mpsc::Receiver<String>,
    events: mpsc::Sender<LinkEvent>,
}

impl RemoteEnd {
    /// Next frame the client sent, or `None` once the client released the link.
    pub async fn next_sent(&mut self) -> Option<String> {
        self.sent.recv().await
    }

    pub async fn push(&self, text: impl Into<String>) -> bool {
        self.events.send(LinkEvent::Text(text.into())).await.is_ok()
    }

    pub async fn close(self, reason: &str) {
        let _ = self.events.send(LinkEvent::Closed(Some(reason.to_string()))).await;
    }
}

/// In-process transport. Every successful `open` hands the server side of
/// the session to whoever holds the acceptor receiver.
#[derive(Clone)]
pub struct ChannelTransport {
    accept_tx: mpsc::UnboundedSender<RemoteEnd>,
    refusals: Arc<AtomicU32>,
}

impl ChannelTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RemoteEnd>) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        (
            Self {
                accept_tx,
                refusals: Arc::new(AtomicU32::new(0)),
            },
            accept_rx,
        )
    }

    /// Fail the next `count` opens; `u32::MAX` refuses forever.
    pub fn refuse_next(&self, count: u32) {
        self.refusals.store(count, Ordering::SeqCst);
    }

    fn take_refusal(&self) -> bool {
        self.refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
                0 => None,
                u32::MAX => Some(u32::MAX),
                n => Some(n - 1),
            })
            .is_ok()
    }
}

impl Transport for ChannelTransport {
    fn open(&self, _url: &Url) -> BoxFuture<'static, Result<Link, ClientError>> {
        let refused = self.take_refusal();
        let accept_tx = self.accept_tx.clone();
        async move {
            if refused {
                return Err(ClientError::Transport("connection refused".to_string()));
            }
            let (out_tx, out_rx) = mpsc::channel(LINK_BUFFER);
            let (in_tx, in_rx) = mpsc::channel(LINK_BUFFER);
            accept_tx
                .send(RemoteEnd {
                    sent: out_rx,
                    events: in_tx,
                })
                .map_err(|_| ClientError::Transport("no listener".to_string()))?;
            Ok(Link {
                outbound: out_tx,
                inbound: in_rx,
            })
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url() -> Url {
        Url::parse("ws://127.0.0.1:9/ws").expect("url")
    }

    #[tokio::test]
    async fn channel_transport_links_both_ends() {
        let (transport, mut accept_rx) = ChannelTransport::new();
        let mut link = transport.open(&url()).await.expect("open");
        let mut remote = accept_rx.recv().await.expect("remote end");

        link.outbound.send("ping".to_string()).await.expect("send");
        assert_eq!(remote.next_sent().await.as_deref(), Some("ping"));

        assert!(remote.push("pong").await);
        assert_eq!(link.inbound.recv().await, Some(LinkEvent::Text("pong".to_string())));

        remote.close("bye").await;
        assert_eq!(
            link.inbound.recv().await,
            Some(LinkEvent::Closed(Some("bye".to_string())))
        );
    }

    #[tokio::test]
    async fn refusals_are_counted_down() {
        let (transport, _accept_rx) = ChannelTransport::new();
        transport.refuse_next(2);
        assert!(transport.open(&url()).await.is_err());
        assert!(transport.open(&url()).await.is_err());
        assert!(transport.open(&url()).await.is_ok());
    }
}

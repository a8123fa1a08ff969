//! Channeled streaming over an upgraded WebSocket, as used by `exec`,
//! `attach`, and `portforward`.
//!
//! Each binary frame leads with a channel id byte. That byte is part of
//! the wire format: outgoing writes are framed with it, incoming frames
//! are demultiplexed on it and only then stripped.
use futures::{SinkExt, StreamExt};
use tokio::{io::{AsyncRead, AsyncWrite}, sync::mpsc};
use tokio_tungstenite::{tungstenite as ws, WebSocketStream};
use tokio_util::sync::CancellationToken;

pub(crate) const STDIN_CHANNEL: u8 = 0;
pub(crate) const STDOUT_CHANNEL: u8 = 1;
pub(crate) const STDERR_CHANNEL: u8 = 2;
pub(crate) const ERROR_CHANNEL: u8 = 3;
pub(crate) const RESIZE_CHANNEL: u8 = 4;

/// Frames travelling from the caller to the remote process
#[derive(Debug)]
pub enum Outbound {
    /// Bytes for the process's stdin
    Stdin(Vec<u8>),
    /// Terminal resize request
    Resize {
        /// Columns
        width: u16,
        /// Rows
        height: u16,
    },
}

/// Demultiplexed frames delivered to the caller's sink
#[derive(Debug)]
pub enum Inbound {
    /// Output on the stdout channel
    Stdout(Vec<u8>),
    /// Output on the stderr channel
    Stderr(Vec<u8>),
    /// A frame on the error channel; under the v4 protocol this is a JSON
    /// `Status` describing how the process ended
    Error(Vec<u8>),
    /// The server closed the session; carries any close payload
    Close(Vec<u8>),
}

/// A live channeled session.
pub struct RemoteSession {
    sender: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl RemoteSession {
    pub(crate) fn new(
        sender: mpsc::Sender<Outbound>,
        cancel: CancellationToken,
        task: tokio::task::JoinHandle<()>,
    ) -> Self {
        Self { sender, cancel, task }
    }

    /// Write to the remote process's stdin
    pub async fn stdin(&self, data: impl Into<Vec<u8>>) -> bool {
        self.sender.send(Outbound::Stdin(data.into())).await.is_ok()
    }

    /// Resize the remote terminal
    pub async fn resize(&self, width: u16, height: u16) -> bool {
        self.sender.send(Outbound::Resize { width, height }).await.is_ok()
    }

    /// Tear the session down
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the pump task to finish
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

/// Pump frames between the socket and the caller until either side closes.
pub(crate) async fn channel_loop<S>(
    stream: WebSocketStream<S>,
    mut outbound: mpsc::Receiver<Outbound>,
    sink: mpsc::Sender<Inbound>,
    cancel: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut server_send, mut server_recv) = stream.split();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = server_send.send(ws::Message::Close(None)).await;
                break;
            }
            message = server_recv.next() => match message {
                Some(Ok(ws::Message::Binary(frame))) => {
                    let delivered = match frame.split_first() {
                        Some((&STDOUT_CHANNEL, data)) => sink.send(Inbound::Stdout(data.to_vec())).await,
                        Some((&STDERR_CHANNEL, data)) => sink.send(Inbound::Stderr(data.to_vec())).await,
                        Some((&ERROR_CHANNEL, data)) => sink.send(Inbound::Error(data.to_vec())).await,
                        _ => Ok(()),
                    };
                    if delivered.is_err() {
                        // caller went away: tear the stream down
                        let _ = server_send.send(ws::Message::Close(None)).await;
                        break;
                    }
                }
                Some(Ok(ws::Message::Close(frame))) => {
                    let data = frame.map(|f| f.reason.into_owned().into_bytes()).unwrap_or_default();
                    let _ = sink.send(Inbound::Close(data)).await;
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(error)) => {
                    tracing::warn!(%error, "remote stream failed");
                    let _ = sink.send(Inbound::Close(Vec::new())).await;
                    break;
                }
                None => {
                    let _ = sink.send(Inbound::Close(Vec::new())).await;
                    break;
                }
            },
            frame = outbound.recv() => match frame {
                Some(Outbound::Stdin(data)) => {
                    let mut framed = Vec::with_capacity(data.len() + 1);
                    framed.push(STDIN_CHANNEL);
                    framed.extend_from_slice(&data);
                    if server_send.send(ws::Message::binary(framed)).await.is_err() {
                        break;
                    }
                }
                Some(Outbound::Resize { width, height }) => {
                    let mut framed = vec![RESIZE_CHANNEL];
                    framed.extend_from_slice(
                        format!(r#"{{"Width":{width},"Height":{height}}}"#).as_bytes(),
                    );
                    if server_send.send(ws::Message::binary(framed)).await.is_err() {
                        break;
                    }
                }
                None => {
                    // caller dropped the handle
                    let _ = server_send.send(ws::Message::Close(None)).await;
                    break;
                }
            },
        }
    }
}

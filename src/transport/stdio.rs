//! Standard-stream transport
//!
//! Reads newline-delimited JSON-RPC messages from a byte stream and writes
//! them to another. Works over the process's own stdin/stdout (server side),
//! a child process's pipes (client side), or any other `AsyncRead`/
//! `AsyncWrite` pair.
//!
//! Two tasks run per instance: a read loop feeding the [`ReadBuffer`] in
//! 8 KiB chunks, and a write loop draining an unbounded outbound queue,
//! serializing and flushing one message at a time. `close()` cancels both
//! loops and joins them before firing the close callback.

use super::{LifecycleGate, ReadBuffer, Transport, TransportEvents};
use crate::error::{McpError, Result};
use crate::protocol::messages::{serialize_message, JsonRpcMessage};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

const READ_CHUNK_SIZE: usize = 8192;

type DynReader = Box<dyn AsyncRead + Send + Unpin>;
type DynWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Transport over a pair of byte streams
pub struct StdioTransport {
    gate: Arc<LifecycleGate>,
    events: Arc<TransportEvents>,
    reader: Mutex<Option<DynReader>>,
    writer: Mutex<Option<DynWriter>>,
    outbound_tx: mpsc::UnboundedSender<JsonRpcMessage>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<JsonRpcMessage>>>,
    cancel: CancellationToken,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl StdioTransport {
    /// Create a transport over arbitrary byte streams.
    pub fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Self {
            gate: Arc::new(LifecycleGate::new()),
            events: Arc::new(TransportEvents::default()),
            reader: Mutex::new(Some(Box::new(reader))),
            writer: Mutex::new(Some(Box::new(writer))),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            cancel: CancellationToken::new(),
            tasks: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    /// Create a transport over this process's stdin and stdout.
    pub fn stdio() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout())
    }

    async fn drain_messages(read_buffer: &mut ReadBuffer, events: &TransportEvents) {
        loop {
            match read_buffer.read_message() {
                Ok(Some(message)) => events.emit_message(message).await,
                Ok(None) => break,
                // Malformed line: report and keep framing.
                Err(e) => events.emit_error(e),
            }
        }
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn start(&self) -> Result<()> {
        self.gate.begin_start()?;
        debug!("starting stdio transport");

        let mut reader = self
            .reader
            .lock()
            .unwrap()
            .take()
            .ok_or(McpError::TransportAlreadyStarted)?;
        let mut writer = self
            .writer
            .lock()
            .unwrap()
            .take()
            .ok_or(McpError::TransportAlreadyStarted)?;
        let mut outbound_rx = self
            .outbound_rx
            .lock()
            .unwrap()
            .take()
            .ok_or(McpError::TransportAlreadyStarted)?;

        let events = self.events.clone();
        let cancel = self.cancel.clone();
        let gate = self.gate.clone();
        let read_task = tokio::spawn(async move {
            let mut read_buffer = ReadBuffer::new();
            let mut chunk = [0u8; READ_CHUNK_SIZE];
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    read = reader.read(&mut chunk) => match read {
                        Ok(0) => {
                            debug!("stdio transport reached end of input");
                            break;
                        }
                        Ok(n) => {
                            read_buffer.append(&chunk[..n]);
                            Self::drain_messages(&mut read_buffer, &events).await;
                        }
                        Err(e) => {
                            error!("stdio read failed: {}", e);
                            events.emit_error(e.into());
                            break;
                        }
                    }
                }
            }
            read_buffer.clear();
            // End of input or I/O error counts as a remote close: stop the
            // write loop and latch the terminal state.
            cancel.cancel();
            gate.force_close();
            events.emit_close();
        });

        let events = self.events.clone();
        let cancel = self.cancel.clone();
        let write_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    message = outbound_rx.recv() => {
                        let Some(message) = message else { break };
                        let line = match serialize_message(&message) {
                            Ok(line) => line,
                            Err(e) => {
                                events.emit_error(e);
                                continue;
                            }
                        };
                        let write = async {
                            writer.write_all(line.as_bytes()).await?;
                            writer.write_all(b"\n").await?;
                            writer.flush().await
                        };
                        if let Err(e) = write.await {
                            error!("stdio write failed: {}", e);
                            events.emit_error(e.into());
                            break;
                        }
                    }
                }
            }
            // Writer termination closes the output stream.
            let _ = writer.shutdown().await;
        });

        self.tasks.lock().await.extend([read_task, write_task]);
        Ok(())
    }

    async fn send(&self, message: JsonRpcMessage) -> Result<()> {
        self.gate.require_running()?;
        self.outbound_tx
            .send(message)
            .map_err(|_| McpError::TransportClosed)
    }

    async fn close(&self) -> Result<()> {
        self.gate.begin_close()?;
        debug!("closing stdio transport");

        self.cancel.cancel();
        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }

        self.events.emit_close();
        Ok(())
    }

    fn events(&self) -> &TransportEvents {
        &self.events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::deserialize_message;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{duplex, AsyncBufReadExt, BufReader};
    use tokio::sync::mpsc::unbounded_channel;

    #[tokio::test]
    async fn test_send_before_start_fails() {
        let (_local, remote) = duplex(1024);
        let (read_half, write_half) = tokio::io::split(remote);
        let transport = StdioTransport::new(read_half, write_half);

        let err = transport
            .send(JsonRpcMessage::notification("ping", None))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::TransportNotStarted));
    }

    #[tokio::test]
    async fn test_round_trip_over_duplex_pipe() {
        let (local, remote) = duplex(4096);
        let (read_half, write_half) = tokio::io::split(remote);
        let transport = StdioTransport::new(read_half, write_half);

        let (received_tx, mut received_rx) = unbounded_channel();
        transport.events().set_on_message(move |message| {
            let received_tx = received_tx.clone();
            Box::pin(async move {
                let _ = received_tx.send(message);
            })
        });

        transport.start().await.unwrap();

        // Inbound: write a framed message into the pipe's far end.
        let (far_read, mut far_write) = tokio::io::split(local);
        far_write
            .write_all(b"{\"jsonrpc\":\"2.0\",\"method\":\"notifications/initialized\"}\n")
            .await
            .unwrap();
        far_write.flush().await.unwrap();

        let inbound = received_rx.recv().await.unwrap();
        match inbound {
            JsonRpcMessage::Notification(n) => {
                assert_eq!(n.method, "notifications/initialized")
            }
            other => panic!("expected notification, got {:?}", other),
        }

        // Outbound: send and read the framed line back on the far end.
        transport
            .send(JsonRpcMessage::notification("ping", None))
            .await
            .unwrap();

        let mut lines = BufReader::new(far_read).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        match deserialize_message(&line).unwrap() {
            JsonRpcMessage::Notification(n) => assert_eq!(n.method, "ping"),
            other => panic!("expected notification, got {:?}", other),
        }

        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_joins_tasks_and_fires_once() {
        let (_local, remote) = duplex(1024);
        let (read_half, write_half) = tokio::io::split(remote);
        let transport = StdioTransport::new(read_half, write_half);

        let closes = Arc::new(AtomicUsize::new(0));
        let counter = closes.clone();
        transport.events().set_on_close(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        transport.start().await.unwrap();
        transport.close().await.unwrap();

        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(matches!(
            transport.close().await.unwrap_err(),
            McpError::TransportClosed
        ));
        assert!(matches!(
            transport
                .send(JsonRpcMessage::notification("ping", None))
                .await
                .unwrap_err(),
            McpError::TransportClosed
        ));
    }

    #[tokio::test]
    async fn test_double_start_fails() {
        let (_local, remote) = duplex(1024);
        let (read_half, write_half) = tokio::io::split(remote);
        let transport = StdioTransport::new(read_half, write_half);

        transport.start().await.unwrap();
        assert!(matches!(
            transport.start().await.unwrap_err(),
            McpError::TransportAlreadyStarted
        ));
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_line_reported_not_fatal() {
        let (local, remote) = duplex(4096);
        let (read_half, write_half) = tokio::io::split(remote);
        let transport = StdioTransport::new(read_half, write_half);

        let errors = Arc::new(AtomicUsize::new(0));
        let error_counter = errors.clone();
        transport.events().set_on_error(move |_| {
            error_counter.fetch_add(1, Ordering::SeqCst);
        });

        let (received_tx, mut received_rx) = unbounded_channel();
        transport.events().set_on_message(move |message| {
            let received_tx = received_tx.clone();
            Box::pin(async move {
                let _ = received_tx.send(message);
            })
        });

        transport.start().await.unwrap();

        let (_far_read, mut far_write) = tokio::io::split(local);
        far_write
            .write_all(b"this is not json\n{\"jsonrpc\":\"2.0\",\"method\":\"ping\"}\n")
            .await
            .unwrap();
        far_write.flush().await.unwrap();

        // The valid message after the bad line still arrives.
        let inbound = received_rx.recv().await.unwrap();
        match inbound {
            JsonRpcMessage::Notification(n) => assert_eq!(n.method, "ping"),
            other => panic!("expected notification, got {:?}", other),
        }
        assert_eq!(errors.load(Ordering::SeqCst), 1);

        transport.close().await.unwrap();
    }
}

//! Newline-delimited JSON request/response over TCP
//!
//! Both directions of the controller ↔ interpreter conversation use the
//! same machinery: an [`RpcServer`] that hands each decoded request to an
//! [`RpcHandler`] on its own task, and an [`RpcClient`] that multiplexes
//! concurrent calls over one connection by request id.

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::protocol::{Envelope, RequestId};
use crate::{AtelierError, Result};

/// Server-side dispatch for one message set
#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    type Request: DeserializeOwned + Send + 'static;
    type Reply: Serialize + Send + 'static;

    async fn handle(&self, request: Self::Request) -> Self::Reply;

    /// Reply sent for a line whose body could not be decoded
    fn malformed(&self, error: String) -> Self::Reply;
}

/// Accepts connections and serves every request on its own task
pub struct RpcServer {
    listener: TcpListener,
}

impl RpcServer {
    /// Bind to `host:port`; port 0 picks a free port.
    pub async fn bind(host: &str, port: u16) -> Result<Self> {
        let listener = TcpListener::bind((host, port))
            .await
            .map_err(|e| AtelierError::Transport(format!("bind {}:{}: {}", host, port, e)))?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until `shutdown` fires. Open connections stop reading new
    /// requests at that point; replies already in flight are still written.
    pub async fn serve<H: RpcHandler>(self, handler: Arc<H>, shutdown: CancellationToken) {
        let addr = self
            .listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        tracing::info!("RPC server listening on {}", addr);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tracing::debug!("Accepted connection from {}", peer);
                        let handler = handler.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(stream, handler, shutdown).await {
                                tracing::warn!("Connection from {} ended: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Accept error: {}", e);
                    }
                }
            }
        }

        tracing::info!("RPC server on {} stopped", addr);
    }
}

async fn serve_connection<H: RpcHandler>(
    stream: TcpStream,
    handler: Arc<H>,
    shutdown: CancellationToken,
) -> Result<()> {
    let (reader, writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<String>();

    let writer_task = tokio::spawn(async move {
        let mut writer = BufWriter::new(writer);
        while let Some(line) = reply_rx.recv().await {
            if writer.write_all(line.as_bytes()).await.is_err()
                || writer.write_all(b"\n").await.is_err()
                || writer.flush().await.is_err()
            {
                break;
            }
        }
    });

    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }

        let envelope: Envelope<Value> = match serde_json::from_str(&line) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!("Dropping unframed line: {}", e);
                continue;
            }
        };

        let handler = handler.clone();
        let reply_tx = reply_tx.clone();
        tokio::spawn(async move {
            let id = envelope.id;
            let reply = match serde_json::from_value::<H::Request>(envelope.body) {
                Ok(request) => handler.handle(request).await,
                Err(e) => handler.malformed(format!("malformed request: {}", e)),
            };
            match serde_json::to_string(&Envelope { id, body: reply }) {
                Ok(json) => {
                    let _ = reply_tx.send(json);
                }
                Err(e) => tracing::error!("Failed to encode reply {}: {}", id, e),
            }
        });
    }

    // Writer drains once every in-flight request has answered
    drop(reply_tx);
    let _ = writer_task.await;
    Ok(())
}

struct Pending<R> {
    waiters: HashMap<RequestId, oneshot::Sender<R>>,
    closed: bool,
}

/// Multiplexing client for one connection
pub struct RpcClient<Req, Reply> {
    addr: String,
    next_id: AtomicU64,
    outbox: mpsc::UnboundedSender<String>,
    pending: Arc<Mutex<Pending<Reply>>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    _request: PhantomData<fn(Req)>,
}

impl<Req, Reply> RpcClient<Req, Reply>
where
    Req: Serialize,
    Reply: DeserializeOwned + Send + 'static,
{
    /// Connect, giving up after `timeout`.
    pub async fn connect(addr: &str, timeout: Duration) -> Result<Self> {
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(AtelierError::Transport(format!("connect {}: {}", addr, e)));
            }
            Err(_) => {
                return Err(AtelierError::Transport(format!(
                    "connect {}: timed out after {:?}",
                    addr, timeout
                )));
            }
        };
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();

        let pending = Arc::new(Mutex::new(Pending {
            waiters: HashMap::new(),
            closed: false,
        }));

        let (outbox, mut outbox_rx) = mpsc::unbounded_channel::<String>();
        let writer = tokio::spawn(async move {
            let mut writer = BufWriter::new(write_half);
            while let Some(line) = outbox_rx.recv().await {
                if writer.write_all(line.as_bytes()).await.is_err()
                    || writer.write_all(b"\n").await.is_err()
                    || writer.flush().await.is_err()
                {
                    break;
                }
            }
        });

        let reader_pending = pending.clone();
        let reader_addr = addr.to_string();
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<Envelope<Reply>>(&line) {
                            Ok(envelope) => {
                                let waiter = reader_pending
                                    .lock()
                                    .ok()
                                    .and_then(|mut p| p.waiters.remove(&envelope.id));
                                match waiter {
                                    Some(tx) => {
                                        let _ = tx.send(envelope.body);
                                    }
                                    None => tracing::warn!(
                                        "Reply {} from {} has no caller",
                                        envelope.id,
                                        reader_addr
                                    ),
                                }
                            }
                            Err(e) => {
                                tracing::warn!("Undecodable reply from {}: {}", reader_addr, e)
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!("Read from {} failed: {}", reader_addr, e);
                        break;
                    }
                }
            }
            // Dropping the senders fails every outstanding call
            if let Ok(mut p) = reader_pending.lock() {
                p.closed = true;
                p.waiters.clear();
            }
            tracing::debug!("Connection to {} closed", reader_addr);
        });

        Ok(Self {
            addr: addr.to_string(),
            next_id: AtomicU64::new(1),
            outbox,
            pending,
            reader,
            writer,
            _request: PhantomData,
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Whether the peer has hung up
    pub fn is_closed(&self) -> bool {
        self.pending.lock().map(|p| p.closed).unwrap_or(true)
    }

    /// Send one request and wait for its reply.
    ///
    /// A peer that goes away mid-call yields
    /// [`AtelierError::ProcessNotRunning`].
    pub async fn call(&self, request: Req) -> Result<Reply> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let line = serde_json::to_string(&Envelope { id, body: request })?;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self
                .pending
                .lock()
                .map_err(|_| AtelierError::Transport(format!("{}: client state poisoned", self.addr)))?;
            if pending.closed {
                return Err(AtelierError::ProcessNotRunning(self.addr.clone()));
            }
            pending.waiters.insert(id, tx);
        }

        if self.outbox.send(line).is_err() {
            if let Ok(mut pending) = self.pending.lock() {
                pending.waiters.remove(&id);
            }
            return Err(AtelierError::ProcessNotRunning(self.addr.clone()));
        }

        rx.await
            .map_err(|_| AtelierError::ProcessNotRunning(self.addr.clone()))
    }
}

impl<Req, Reply> Drop for RpcClient<Req, Reply> {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize)]
    #[serde(tag = "type", rename_all = "snake_case")]
    enum Req {
        Echo { text: String },
        Slow { ms: u64, text: String },
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    #[serde(tag = "type", rename_all = "snake_case")]
    enum Reply {
        Text { text: String },
        Error { message: String },
    }

    struct Echo;

    #[async_trait]
    impl RpcHandler for Echo {
        type Request = Req;
        type Reply = Reply;

        async fn handle(&self, request: Req) -> Reply {
            match request {
                Req::Echo { text } => Reply::Text { text },
                Req::Slow { ms, text } => {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    Reply::Text { text }
                }
            }
        }

        fn malformed(&self, error: String) -> Reply {
            Reply::Error { message: error }
        }
    }

    async fn start() -> (String, CancellationToken) {
        let server = RpcServer::bind("127.0.0.1", 0).await.unwrap();
        let addr = server.local_addr().unwrap().to_string();
        let shutdown = CancellationToken::new();
        tokio::spawn(server.serve(Arc::new(Echo), shutdown.clone()));
        (addr, shutdown)
    }

    #[tokio::test]
    async fn replies_are_correlated_out_of_order() {
        let (addr, shutdown) = start().await;
        let client: Arc<RpcClient<Req, Reply>> =
            Arc::new(RpcClient::connect(&addr, Duration::from_secs(5)).await.unwrap());

        let slow = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .call(Req::Slow {
                        ms: 200,
                        text: "slow".to_string(),
                    })
                    .await
            })
        };
        let fast = client
            .call(Req::Echo {
                text: "fast".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(fast, Reply::Text { text: "fast".to_string() });
        assert!(!slow.is_finished());
        assert_eq!(
            slow.await.unwrap().unwrap(),
            Reply::Text { text: "slow".to_string() }
        );
        shutdown.cancel();
    }

    #[tokio::test]
    async fn undecodable_body_gets_error_reply() {
        let (addr, shutdown) = start().await;
        let stream = TcpStream::connect(&addr).await.unwrap();
        let (r, mut w) = stream.into_split();
        w.write_all(b"{\"id\":9,\"body\":{\"type\":\"nope\"}}\n").await.unwrap();
        let mut lines = BufReader::new(r).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        let env: Envelope<Reply> = serde_json::from_str(&line).unwrap();
        assert_eq!(env.id, 9);
        assert!(matches!(env.body, Reply::Error { .. }));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn dead_peer_is_process_not_running() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            // Accept, read one request, then hang up without answering
            let (stream, _) = listener.accept().await.unwrap();
            let mut lines = BufReader::new(stream).lines();
            let _ = lines.next_line().await;
        });

        let client: RpcClient<Req, Reply> =
            RpcClient::connect(&addr, Duration::from_secs(5)).await.unwrap();
        let err = client
            .call(Req::Echo {
                text: "hello".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AtelierError::ProcessNotRunning(_)));
        assert!(err.is_transport_failure());
    }

    #[tokio::test]
    async fn connect_to_nothing_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let result = RpcClient::<Req, Reply>::connect(&addr, Duration::from_secs(2)).await;
        assert!(matches!(result, Err(AtelierError::Transport(_))));
    }
}

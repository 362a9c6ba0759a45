//! Realtime hub server.
//!
//! Accepts line-framed TCP connections, authenticates each one with the
//! access token carried by its first frame, and relays order events between
//! connections that joined the same branch.

use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::hub::{BranchHub, Connection, FanoutPolicy};
use super::protocol::{
    self, BranchJoined, ClientFrame, ConnectAck, ConnectRejected, ServerFrame,
    DEFAULT_MAX_FRAME_BYTES,
};
use crate::access::{AccessClaims, Role, TokenDecoder};
use crate::error::BridgeError;

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Frames buffered per connection before new ones are dropped for it.
pub const DEFAULT_OUTBOUND_QUEUE: usize = 256;

#[derive(Debug, Clone)]
pub struct RealtimeServerConfig {
    pub handshake_timeout: Duration,
    pub max_frame_bytes: usize,
    pub fanout: FanoutPolicy,
    pub outbound_queue: usize,
}

impl Default for RealtimeServerConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            fanout: FanoutPolicy::ExcludeSender,
            outbound_queue: DEFAULT_OUTBOUND_QUEUE,
        }
    }
}

struct Shared {
    hub: Arc<BranchHub>,
    decoder: TokenDecoder,
    config: RealtimeServerConfig,
}

pub struct RealtimeServer {
    listener: TcpListener,
    shared: Arc<Shared>,
}

impl RealtimeServer {
    pub async fn bind(
        addr: SocketAddr,
        decoder: TokenDecoder,
        config: RealtimeServerConfig,
    ) -> Result<Self, BridgeError> {
        let listener = TcpListener::bind(addr).await?;
        let hub = Arc::new(BranchHub::new(config.fanout));
        Ok(Self {
            listener,
            shared: Arc::new(Shared {
                hub,
                decoder,
                config,
            }),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn hub(&self) -> Arc<BranchHub> {
        Arc::clone(&self.shared.hub)
    }

    /// Run the accept loop until `shutdown` fires, then wait for every open
    /// connection to finish.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<(), BridgeError> {
        let tracker = TaskTracker::new();
        info!(
            addr = ?self.listener.local_addr().ok(),
            verifies_signature = self.shared.decoder.verifies_signature(),
            fanout = ?self.shared.config.fanout,
            outbound_queue = self.shared.config.outbound_queue,
            "realtime hub listening"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let shared = Arc::clone(&self.shared);
                        let cancel = shutdown.child_token();
                        tracker.spawn(handle_connection(stream, peer, shared, cancel));
                    }
                    Err(e) => warn!(error = %e, "realtime accept failed"),
                },
            }
        }

        tracker.close();
        tracker.wait().await;
        info!("realtime hub stopped");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Per-connection session
// ---------------------------------------------------------------------------

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) {
    let mut framed = protocol::framed(stream, shared.config.max_frame_bytes);

    let handshake = tokio::time::timeout(
        shared.config.handshake_timeout,
        read_handshake(&mut framed, &shared.decoder),
    )
    .await
    .unwrap_or(Err(BridgeError::HandshakeTimeout));

    let claims = match handshake {
        Ok(claims) => claims,
        Err(BridgeError::Closed) => {
            debug!(%peer, "peer left before handshake");
            return;
        }
        Err(err) => {
            warn!(%peer, error = %err, "realtime handshake refused");
            reject(&mut framed, err.to_string()).await;
            return;
        }
    };

    let socket_id = Uuid::new_v4().to_string();
    let (tx, mut rx) = mpsc::channel(shared.config.outbound_queue.max(1));
    shared.hub.register(
        Connection::new(&socket_id, claims.role, claims.subject_id.clone()),
        tx,
    );

    let ack = ServerFrame::Connect(ConnectAck {
        socket_id: socket_id.clone(),
    });
    let result = match send_frame(&mut framed, &ack).await {
        Ok(()) => {
            info!(%peer, socket_id = %socket_id, role = %claims.role, "realtime client connected");
            session_loop(&mut framed, &mut rx, &socket_id, &claims, &shared, &cancel).await
        }
        Err(e) => Err(e),
    };

    shared.hub.remove(&socket_id);
    match result {
        Ok(()) => info!(socket_id = %socket_id, "realtime client disconnected"),
        Err(e) => warn!(socket_id = %socket_id, error = %e, "realtime connection dropped"),
    }
}

async fn read_handshake<S>(
    framed: &mut Framed<S, LinesCodec>,
    decoder: &TokenDecoder,
) -> Result<AccessClaims, BridgeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let line = framed.next().await.ok_or(BridgeError::Closed)??;
    match protocol::decode_frame::<ClientFrame>(&line)? {
        ClientFrame::Handshake(handshake) => decoder
            .decode(&handshake.token)
            .map_err(|e| BridgeError::Rejected(e.to_string())),
        other => Err(BridgeError::Rejected(format!(
            "expected handshake, got {}",
            other.event_name()
        ))),
    }
}

async fn reject<S>(framed: &mut Framed<S, LinesCodec>, message: String)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = ServerFrame::ConnectError(ConnectRejected { message });
    if let Err(e) = send_frame(framed, &frame).await {
        debug!(error = %e, "could not deliver connect_error");
    }
    let _ = SinkExt::<String>::close(framed).await;
}

async fn send_frame<S>(
    framed: &mut Framed<S, LinesCodec>,
    frame: &ServerFrame,
) -> Result<(), BridgeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    framed.send(protocol::encode_frame(frame)?).await?;
    Ok(())
}

async fn session_loop<S>(
    framed: &mut Framed<S, LinesCodec>,
    outbound: &mut mpsc::Receiver<ServerFrame>,
    socket_id: &str,
    claims: &AccessClaims,
    shared: &Shared,
    cancel: &CancellationToken,
) -> Result<(), BridgeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            frame = outbound.recv() => match frame {
                Some(frame) => send_frame(framed, &frame).await?,
                None => return Ok(()),
            },
            inbound = framed.next() => match inbound {
                None => return Ok(()),
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    warn!(socket_id, "oversized frame skipped");
                }
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(line)) => handle_client_frame(&line, socket_id, claims, &shared.hub),
            },
        }
    }
}

fn handle_client_frame(line: &str, socket_id: &str, claims: &AccessClaims, hub: &BranchHub) {
    let frame = match protocol::decode_frame::<ClientFrame>(line) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(socket_id, error = %e, "unparseable frame skipped");
            return;
        }
    };

    match frame {
        ClientFrame::Handshake(_) => debug!(socket_id, "repeated handshake ignored"),
        ClientFrame::JoinBranch(join) => {
            let branch_id = join.branch_id.trim();
            if branch_id.is_empty() {
                warn!(socket_id, "join-branch without branch id ignored");
                return;
            }
            // The token role is authoritative; the announced one is only logged.
            if Role::parse(&join.role) != Some(claims.role) {
                debug!(
                    socket_id,
                    announced = %join.role,
                    token_role = %claims.role,
                    "join-branch role differs from token"
                );
            }
            hub.join(socket_id, branch_id);
            hub.send_to(
                socket_id,
                ServerFrame::BranchJoined(BranchJoined {
                    branch_id: branch_id.to_string(),
                }),
            );
        }
        ClientFrame::NewOrder(event) => {
            hub.broadcast_from(socket_id, ServerFrame::NewOrder(event));
        }
        ClientFrame::OrderStatus(event) => {
            hub.broadcast_from(socket_id, ServerFrame::OrderStatus(event));
        }
    }
}

#[cfg(test)]
pub(crate) mod test_server {
    use super::*;

    pub struct RunningServer {
        pub addr: SocketAddr,
        pub hub: Arc<BranchHub>,
        pub shutdown: CancellationToken,
        task: Option<tokio::task::JoinHandle<Result<(), BridgeError>>>,
    }

    impl RunningServer {
        /// Cancel and wait until every connection is closed and the port is free.
        pub async fn stop(mut self) {
            self.shutdown.cancel();
            if let Some(task) = self.task.take() {
                task.await.expect("server task").expect("server shut down cleanly");
            }
        }
    }

    impl Drop for RunningServer {
        fn drop(&mut self) {
            self.shutdown.cancel();
        }
    }

    pub async fn start(config: RealtimeServerConfig) -> RunningServer {
        start_on("127.0.0.1:0".parse().unwrap(), config).await
    }

    pub async fn start_on(addr: SocketAddr, config: RealtimeServerConfig) -> RunningServer {
        let decoder = TokenDecoder::hs256(crate::access::claims::test_tokens::SECRET);
        let server = RealtimeServer::bind(addr, decoder, config)
            .await
            .expect("bind realtime server");
        let addr = server.local_addr().unwrap();
        let hub = server.hub();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(server.serve(shutdown.clone()));
        RunningServer {
            addr,
            hub,
            shutdown,
            task: Some(task),
        }
    }
}

//! Client side of the realtime bridge.
//!
//! A [`SocketBridge`] owns one background task that keeps a connection to
//! the hub alive, re-joins the requested branch after every handshake and
//! dispatches inbound order events to registered listeners. Callers only see
//! the current state; retries stay inside the task.

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::listeners::{ListenerRegistry, Unsubscribe};
use super::protocol::{
    self, ClientFrame, Handshake, JoinBranch, NewOrderEvent, OrderStatusEvent, ServerFrame,
    DEFAULT_MAX_FRAME_BYTES,
};
use super::server::DEFAULT_HANDSHAKE_TIMEOUT;
use crate::access::Role;
use crate::error::BridgeError;

const RECONNECT_INITIAL_MS: u64 = 1_000;
const RECONNECT_MAX_MS: u64 = 30_000;

#[derive(Debug, Clone)]
pub struct BridgeOptions {
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
    pub handshake_timeout: Duration,
    pub max_frame_bytes: usize,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            reconnect_initial: Duration::from_millis(RECONNECT_INITIAL_MS),
            reconnect_max: Duration::from_millis(RECONNECT_MAX_MS),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

/// Point-in-time view of the bridge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeSnapshot {
    pub connected: bool,
    pub socket_id: Option<String>,
    /// Branch requested through [`SocketBridge::join_branch`].
    pub branch_id: Option<String>,
    /// Branch the hub last acknowledged for the current connection.
    pub joined_branch: Option<String>,
    pub last_error: Option<String>,
    /// The background task has stopped and will not reconnect.
    pub closed: bool,
}

#[derive(Default)]
struct Link {
    outbound: Option<mpsc::UnboundedSender<ClientFrame>>,
    branch: Option<JoinBranch>,
}

struct BridgeInner {
    new_order: ListenerRegistry<Value>,
    order_update: ListenerRegistry<OrderStatusEvent>,
    link: Mutex<Link>,
    state: watch::Sender<BridgeSnapshot>,
    cancel: CancellationToken,
}

impl BridgeInner {
    fn link(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Install the outbound queue for a fresh connection and replay the
    /// branch join, under one lock so a concurrent `join_branch` is never lost.
    fn attach(&self, outbound: mpsc::UnboundedSender<ClientFrame>, socket_id: String) {
        let mut link = self.link();
        if let Some(join) = link.branch.clone() {
            let _ = outbound.send(ClientFrame::JoinBranch(join));
        }
        link.outbound = Some(outbound);
        self.state.send_modify(|s| {
            s.connected = true;
            s.socket_id = Some(socket_id);
            s.joined_branch = None;
            s.last_error = None;
        });
    }

    fn detach(&self, error: Option<String>) {
        self.link().outbound = None;
        self.state.send_modify(|s| {
            s.connected = false;
            s.socket_id = None;
            s.joined_branch = None;
            if error.is_some() {
                s.last_error = error;
            }
        });
    }

    fn send(&self, frame: ClientFrame) -> bool {
        let link = self.link();
        match link.outbound.as_ref() {
            Some(tx) => tx.send(frame).is_ok(),
            None => {
                debug!(event = frame.event_name(), "realtime bridge offline, event dropped");
                false
            }
        }
    }

    fn dispatch(&self, frame: ServerFrame) {
        match frame {
            ServerFrame::NewOrder(event) => {
                self.new_order.emit(&event.order);
            }
            ServerFrame::OrderStatus(event) => {
                self.order_update.emit(&event);
            }
            ServerFrame::BranchJoined(joined) => {
                debug!(branch_id = %joined.branch_id, "branch join acknowledged");
                self.state
                    .send_modify(|s| s.joined_branch = Some(joined.branch_id));
            }
            ServerFrame::Connect(_) | ServerFrame::ConnectError(_) => {
                debug!(event = frame.event_name(), "unexpected lifecycle frame ignored");
            }
        }
    }
}

/// One shared connection to the realtime hub.
#[derive(Clone)]
pub struct SocketBridge {
    inner: Arc<BridgeInner>,
}

impl SocketBridge {
    /// Start connecting to `addr` with `token` as handshake credential.
    /// Must be called inside a tokio runtime.
    pub fn connect(addr: impl Into<String>, token: impl Into<String>, options: BridgeOptions) -> Self {
        let (state, _) = watch::channel(BridgeSnapshot::default());
        let inner = Arc::new(BridgeInner {
            new_order: ListenerRegistry::new(protocol::EVENT_NEW_ORDER),
            order_update: ListenerRegistry::new(protocol::EVENT_ORDER_STATUS),
            link: Mutex::new(Link::default()),
            state,
            cancel: CancellationToken::new(),
        });
        tokio::spawn(run(Arc::clone(&inner), addr.into(), token.into(), options));
        Self { inner }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.borrow().connected
    }

    pub fn snapshot(&self) -> BridgeSnapshot {
        self.inner.state.borrow().clone()
    }

    pub fn state(&self) -> watch::Receiver<BridgeSnapshot> {
        self.inner.state.subscribe()
    }

    /// Associate this client with `branch_id`. Safe to call repeatedly; a
    /// different branch replaces the previous one. Sent now if connected and
    /// again after every reconnect.
    pub fn join_branch(&self, branch_id: &str, role: Role) {
        let join = JoinBranch {
            branch_id: branch_id.to_string(),
            role: role.as_str().to_string(),
        };
        {
            let mut link = self.inner.link();
            link.branch = Some(join.clone());
            if let Some(tx) = link.outbound.as_ref() {
                let _ = tx.send(ClientFrame::JoinBranch(join));
            }
        }
        self.inner
            .state
            .send_modify(|s| s.branch_id = Some(branch_id.to_string()));
    }

    pub fn on_new_order<F>(&self, callback: F) -> Unsubscribe
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner.new_order.subscribe(callback)
    }

    pub fn on_order_update<F>(&self, callback: F) -> Unsubscribe
    where
        F: Fn(&OrderStatusEvent) + Send + Sync + 'static,
    {
        self.inner.order_update.subscribe(callback)
    }

    /// Best-effort emit; dropped when offline.
    pub fn notify_new_order(&self, order: Value) {
        self.inner
            .send(ClientFrame::NewOrder(NewOrderEvent { order }));
    }

    /// Best-effort emit; dropped when offline.
    pub fn notify_order_update(&self, event: OrderStatusEvent) {
        self.inner.send(ClientFrame::OrderStatus(event));
    }

    /// Close the connection and stop reconnecting.
    pub fn disconnect(&self) {
        self.inner.cancel.cancel();
        self.inner.detach(None);
        self.inner.state.send_modify(|s| s.closed = true);
    }
}

impl std::fmt::Debug for SocketBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketBridge")
            .field("state", &*self.inner.state.borrow())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Connection task
// ---------------------------------------------------------------------------

async fn run(inner: Arc<BridgeInner>, addr: String, token: String, options: BridgeOptions) {
    let mut delay = options.reconnect_initial;

    loop {
        let outcome = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            outcome = session(&inner, &addr, &token, &options) => outcome,
        };

        match outcome {
            Ok(()) => {
                inner.detach(None);
                delay = options.reconnect_initial;
                info!(addr = %addr, "realtime connection closed by hub");
            }
            Err(BridgeError::Rejected(message)) => {
                warn!(addr = %addr, error = %message, "realtime credential rejected, not reconnecting");
                inner.detach(Some(message));
                break;
            }
            Err(e) => {
                warn!(addr = %addr, error = %e, retry_in_ms = delay.as_millis() as u64, "realtime connection failed");
                inner.detach(Some(e.to_string()));
            }
        }

        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
        delay = (delay * 2).min(options.reconnect_max);
    }

    inner.detach(None);
    inner.state.send_modify(|s| s.closed = true);
    debug!(addr = %addr, "realtime bridge task finished");
}

/// One connection attempt. `Ok` means the handshake succeeded and the hub
/// later closed the stream.
async fn session(
    inner: &BridgeInner,
    addr: &str,
    token: &str,
    options: &BridgeOptions,
) -> Result<(), BridgeError> {
    let stream = TcpStream::connect(addr).await?;
    let mut framed = protocol::framed(stream, options.max_frame_bytes);

    let handshake = ClientFrame::Handshake(Handshake {
        token: token.to_string(),
    });
    framed.send(protocol::encode_frame(&handshake)?).await?;

    let socket_id = tokio::time::timeout(options.handshake_timeout, await_ack(&mut framed))
        .await
        .unwrap_or(Err(BridgeError::HandshakeTimeout))?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    inner.attach(tx, socket_id.clone());
    info!(addr, socket_id = %socket_id, "realtime bridge connected");

    loop {
        tokio::select! {
            frame = rx.recv() => match frame {
                Some(frame) => framed.send(protocol::encode_frame(&frame)?).await?,
                None => return Ok(()),
            },
            inbound = framed.next() => match inbound {
                None => return Ok(()),
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    warn!(socket_id = %socket_id, "oversized frame from hub skipped");
                }
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(line)) => match protocol::decode_frame::<ServerFrame>(&line) {
                    Ok(frame) => inner.dispatch(frame),
                    Err(e) => warn!(socket_id = %socket_id, error = %e, "unparseable hub frame skipped"),
                },
            },
        }
    }
}

async fn await_ack(framed: &mut Framed<TcpStream, LinesCodec>) -> Result<String, BridgeError> {
    let line = framed.next().await.ok_or(BridgeError::Closed)??;
    match protocol::decode_frame::<ServerFrame>(&line)? {
        ServerFrame::Connect(ack) => Ok(ack.socket_id),
        ServerFrame::ConnectError(rejected) => Err(BridgeError::Rejected(rejected.message)),
        other => Err(BridgeError::Rejected(format!(
            "expected connect, got {}",
            other.event_name()
        ))),
    }
}

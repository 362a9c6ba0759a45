//! Wire format for the realtime bridge.
//!
//! One JSON object per line, `{"event": <name>, "data": <payload>}`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LinesCodec};

pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

pub const EVENT_HANDSHAKE: &str = "handshake";
pub const EVENT_CONNECT: &str = "connect";
pub const EVENT_CONNECT_ERROR: &str = "connect_error";
pub const EVENT_JOIN_BRANCH: &str = "join-branch";
pub const EVENT_BRANCH_JOINED: &str = "branch-joined";
pub const EVENT_NEW_ORDER: &str = "new-order";
pub const EVENT_ORDER_STATUS: &str = "order-status-update";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinBranch {
    pub branch_id: String,
    pub role: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectAck {
    pub socket_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectRejected {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchJoined {
    pub branch_id: String,
}

/// A newly created order, exactly as the backend returned it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewOrderEvent {
    pub order: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderStatusEvent {
    pub order_id: String,
    pub status: String,
}

impl OrderStatusEvent {
    pub fn new(order_id: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            order_id: order_id.into(),
            status: status.into(),
        }
    }

    /// Build a status event from a backend order object. Accepts `id`,
    /// `orderId` or `order_id` for the identifier.
    pub fn from_order(order: &Value) -> Option<Self> {
        let order_id = crate::value_id(order, &["id", "orderId", "order_id"])?;
        let status = crate::value_str(order, &["status"])?;
        Some(Self { order_id, status })
    }
}

/// Frames sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientFrame {
    #[serde(rename = "handshake")]
    Handshake(Handshake),
    #[serde(rename = "join-branch")]
    JoinBranch(JoinBranch),
    #[serde(rename = "new-order")]
    NewOrder(NewOrderEvent),
    #[serde(rename = "order-status-update")]
    OrderStatus(OrderStatusEvent),
}

/// Frames sent by the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerFrame {
    #[serde(rename = "connect")]
    Connect(ConnectAck),
    #[serde(rename = "connect_error")]
    ConnectError(ConnectRejected),
    #[serde(rename = "branch-joined")]
    BranchJoined(BranchJoined),
    #[serde(rename = "new-order")]
    NewOrder(NewOrderEvent),
    #[serde(rename = "order-status-update")]
    OrderStatus(OrderStatusEvent),
}

impl ServerFrame {
    pub fn event_name(&self) -> &'static str {
        match self {
            ServerFrame::Connect(_) => EVENT_CONNECT,
            ServerFrame::ConnectError(_) => EVENT_CONNECT_ERROR,
            ServerFrame::BranchJoined(_) => EVENT_BRANCH_JOINED,
            ServerFrame::NewOrder(_) => EVENT_NEW_ORDER,
            ServerFrame::OrderStatus(_) => EVENT_ORDER_STATUS,
        }
    }
}

impl ClientFrame {
    pub fn event_name(&self) -> &'static str {
        match self {
            ClientFrame::Handshake(_) => EVENT_HANDSHAKE,
            ClientFrame::JoinBranch(_) => EVENT_JOIN_BRANCH,
            ClientFrame::NewOrder(_) => EVENT_NEW_ORDER,
            ClientFrame::OrderStatus(_) => EVENT_ORDER_STATUS,
        }
    }
}

pub fn encode_frame<T: Serialize>(frame: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string(frame)
}

pub fn decode_frame<T: DeserializeOwned>(line: &str) -> Result<T, serde_json::Error> {
    serde_json::from_str(line.trim())
}

/// Wrap a byte stream in the line-delimited frame codec.
pub fn framed<S>(stream: S, max_frame_bytes: usize) -> Framed<S, LinesCodec>
where
    S: AsyncRead + AsyncWrite,
{
    Framed::new(stream, LinesCodec::new_with_max_length(max_frame_bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn join_branch_wire_shape() {
        let frame = ClientFrame::JoinBranch(JoinBranch {
            branch_id: "branch-1".into(),
            role: "CASHIER".into(),
        });
        let value: Value = serde_json::from_str(&encode_frame(&frame).unwrap()).unwrap();
        assert_eq!(
            value,
            json!({ "event": "join-branch", "data": { "branchId": "branch-1", "role": "CASHIER" } })
        );
        assert_eq!(frame.event_name(), EVENT_JOIN_BRANCH);
    }

    #[test]
    fn decodes_status_update_from_other_clients() {
        let frame: ServerFrame = decode_frame(
            r#" {"event":"order-status-update","data":{"orderId":"o-9","status":"ready"}} "#,
        )
        .unwrap();
        assert_eq!(
            frame,
            ServerFrame::OrderStatus(OrderStatusEvent::new("o-9", "ready"))
        );
    }

    #[test]
    fn encoded_frames_are_single_lines() {
        let frame = ServerFrame::NewOrder(NewOrderEvent {
            order: json!({ "id": "o-1", "notes": "no onions\nextra sauce" }),
        });
        let line = encode_frame(&frame).unwrap();
        assert!(!line.contains('\n'));
        assert_eq!(decode_frame::<ServerFrame>(&line).unwrap(), frame);
    }

    #[test]
    fn unknown_events_fail_to_decode() {
        assert!(decode_frame::<ClientFrame>(r#"{"event":"drop-tables","data":{}}"#).is_err());
        assert!(decode_frame::<ClientFrame>("not json").is_err());
    }

    #[test]
    fn status_event_from_order_object() {
        let event = OrderStatusEvent::from_order(&json!({ "orderId": "o-3", "status": "preparing" }));
        assert_eq!(event, Some(OrderStatusEvent::new("o-3", "preparing")));
        assert_eq!(OrderStatusEvent::from_order(&json!({ "id": "o-3" })), None);
    }
}

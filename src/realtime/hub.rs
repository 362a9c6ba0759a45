//! Server-side connection registry and branch rooms.
//!
//! The hub is the only owner of branch membership. Connections ask to join;
//! they never read the member list.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use super::protocol::ServerFrame;
use crate::access::Role;

/// One client's live channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub socket_id: String,
    pub branch_id: Option<String>,
    pub role: Role,
    pub subject_id: Option<String>,
    pub connected_at: DateTime<Utc>,
}

impl Connection {
    pub fn new(socket_id: impl Into<String>, role: Role, subject_id: Option<String>) -> Self {
        Self {
            socket_id: socket_id.into(),
            branch_id: None,
            role,
            subject_id,
            connected_at: Utc::now(),
        }
    }
}

/// Whether a broadcast also reaches the connection that sent it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanoutPolicy {
    ExcludeSender,
    IncludeSender,
}

struct Member {
    connection: Connection,
    outbound: mpsc::Sender<ServerFrame>,
}

impl Member {
    /// Queue without waiting. A full queue means the peer stopped reading;
    /// the frame is dropped for that peer only.
    fn queue(&self, frame: ServerFrame) -> bool {
        match self.outbound.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(frame)) => {
                warn!(
                    socket_id = %self.connection.socket_id,
                    event = frame.event_name(),
                    "outbound queue full, frame dropped"
                );
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

#[derive(Default)]
struct HubInner {
    members: HashMap<String, Member>,
    rooms: HashMap<String, HashSet<String>>,
}

impl HubInner {
    fn leave_room(&mut self, socket_id: &str, branch_id: &str) {
        if let Some(room) = self.rooms.get_mut(branch_id) {
            room.remove(socket_id);
            if room.is_empty() {
                self.rooms.remove(branch_id);
            }
        }
    }
}

pub struct BranchHub {
    inner: Mutex<HubInner>,
    policy: FanoutPolicy,
}

impl BranchHub {
    pub fn new(policy: FanoutPolicy) -> Self {
        Self {
            inner: Mutex::new(HubInner::default()),
            policy,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HubInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register(&self, connection: Connection, outbound: mpsc::Sender<ServerFrame>) {
        let socket_id = connection.socket_id.clone();
        self.lock().members.insert(
            socket_id.clone(),
            Member {
                connection,
                outbound,
            },
        );
        debug!(socket_id = %socket_id, "realtime connection registered");
    }

    /// Move the connection into `branch_id`, leaving any previous branch.
    /// Returns the branch it left, or `None` for unknown sockets and first
    /// joins.
    pub fn join(&self, socket_id: &str, branch_id: &str) -> Option<String> {
        let mut inner = self.lock();
        let Some(member) = inner.members.get_mut(socket_id) else {
            warn!(socket_id, "join for unknown connection ignored");
            return None;
        };
        let previous = member.connection.branch_id.replace(branch_id.to_string());
        let role = member.connection.role;

        if let Some(old) = previous.as_deref().filter(|old| *old != branch_id) {
            inner.leave_room(socket_id, old);
        }
        inner
            .rooms
            .entry(branch_id.to_string())
            .or_default()
            .insert(socket_id.to_string());

        info!(
            socket_id,
            branch_id,
            role = %role,
            previous = previous.as_deref().unwrap_or(""),
            "connection joined branch"
        );
        previous
    }

    /// Forget the connection and its branch membership.
    pub fn remove(&self, socket_id: &str) -> Option<Connection> {
        let mut inner = self.lock();
        let member = inner.members.remove(socket_id)?;
        if let Some(branch_id) = member.connection.branch_id.as_deref() {
            inner.leave_room(socket_id, branch_id);
        }
        debug!(socket_id, "realtime connection removed");
        Some(member.connection)
    }

    /// Fan `frame` out to the sender's branch according to the hub policy.
    /// Returns the number of connections the frame was queued for; events
    /// from connections outside any branch are dropped.
    pub fn broadcast_from(&self, sender: &str, frame: ServerFrame) -> usize {
        let inner = self.lock();
        let Some(branch_id) = inner
            .members
            .get(sender)
            .and_then(|m| m.connection.branch_id.clone())
        else {
            warn!(
                socket_id = sender,
                event = frame.event_name(),
                "event from connection without a branch dropped"
            );
            return 0;
        };

        let Some(room) = inner.rooms.get(&branch_id) else {
            return 0;
        };
        let mut delivered = 0;
        for socket_id in room {
            if self.policy == FanoutPolicy::ExcludeSender && socket_id == sender {
                continue;
            }
            let Some(member) = inner.members.get(socket_id) else {
                continue;
            };
            if member.queue(frame.clone()) {
                delivered += 1;
            }
        }
        debug!(
            socket_id = sender,
            branch_id = %branch_id,
            event = frame.event_name(),
            delivered,
            "event fanned out"
        );
        delivered
    }

    /// Queue a frame for one connection.
    pub fn send_to(&self, socket_id: &str, frame: ServerFrame) -> bool {
        self.lock()
            .members
            .get(socket_id)
            .is_some_and(|m| m.queue(frame))
    }

    pub fn connection(&self, socket_id: &str) -> Option<Connection> {
        self.lock()
            .members
            .get(socket_id)
            .map(|m| m.connection.clone())
    }

    pub fn connection_count(&self) -> usize {
        self.lock().members.len()
    }

    pub fn branch_size(&self, branch_id: &str) -> usize {
        self.lock().rooms.get(branch_id).map_or(0, HashSet::len)
    }
}

impl Default for BranchHub {
    fn default() -> Self {
        Self::new(FanoutPolicy::ExcludeSender)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::protocol::{NewOrderEvent, OrderStatusEvent};
    use serde_json::json;
    use tokio::sync::mpsc::Receiver;

    fn connect_with_capacity(hub: &BranchHub, id: &str, capacity: usize) -> Receiver<ServerFrame> {
        let (tx, rx) = mpsc::channel(capacity);
        hub.register(Connection::new(id, Role::Cashier, None), tx);
        rx
    }

    fn connect(hub: &BranchHub, id: &str) -> Receiver<ServerFrame> {
        connect_with_capacity(hub, id, 64)
    }

    fn new_order(id: &str) -> ServerFrame {
        ServerFrame::NewOrder(NewOrderEvent {
            order: json!({ "id": id }),
        })
    }

    #[test]
    fn broadcast_reaches_branch_peers_only() {
        let hub = BranchHub::default();
        let mut a = connect(&hub, "a");
        let mut b = connect(&hub, "b");
        let mut other = connect(&hub, "c");
        hub.join("a", "branch-1");
        hub.join("b", "branch-1");
        hub.join("c", "branch-2");

        assert_eq!(hub.broadcast_from("a", new_order("o-1")), 1);
        assert_eq!(b.try_recv().unwrap(), new_order("o-1"));
        assert!(a.try_recv().is_err(), "sender excluded by default");
        assert!(other.try_recv().is_err());
        assert_eq!(
            hub.connection("b").unwrap().branch_id.as_deref(),
            Some("branch-1")
        );
    }

    #[test]
    fn include_sender_policy_echoes() {
        let hub = BranchHub::new(FanoutPolicy::IncludeSender);
        let mut a = connect(&hub, "a");
        hub.join("a", "branch-1");
        let frame = ServerFrame::OrderStatus(OrderStatusEvent::new("o-1", "ready"));
        assert_eq!(hub.broadcast_from("a", frame.clone()), 1);
        assert_eq!(a.try_recv().unwrap(), frame);
    }

    #[test]
    fn rejoining_switches_branch() {
        let hub = BranchHub::default();
        let _a = connect(&hub, "a");
        let mut b = connect(&hub, "b");
        let mut c = connect(&hub, "c");
        hub.join("b", "branch-1");
        hub.join("c", "branch-2");

        assert_eq!(hub.join("a", "branch-1"), None);
        assert_eq!(hub.join("a", "branch-2"), Some("branch-1".to_string()));
        assert_eq!(hub.branch_size("branch-1"), 1);
        assert_eq!(hub.branch_size("branch-2"), 2);

        hub.broadcast_from("a", new_order("o-2"));
        assert!(b.try_recv().is_err());
        assert_eq!(c.try_recv().unwrap(), new_order("o-2"));

        // Joining the same branch again is a no-op for membership.
        assert_eq!(hub.join("a", "branch-2"), Some("branch-2".to_string()));
        assert_eq!(hub.branch_size("branch-2"), 2);
    }

    #[test]
    fn events_without_branch_are_dropped() {
        let hub = BranchHub::default();
        let _a = connect(&hub, "a");
        let mut b = connect(&hub, "b");
        hub.join("b", "branch-1");
        assert_eq!(hub.broadcast_from("a", new_order("o-3")), 0);
        assert!(b.try_recv().is_err());
        assert_eq!(hub.broadcast_from("ghost", new_order("o-3")), 0);
    }

    #[test]
    fn remove_cleans_up_rooms() {
        let hub = BranchHub::default();
        let _a = connect(&hub, "a");
        hub.join("a", "branch-1");
        let removed = hub.remove("a").unwrap();
        assert_eq!(removed.branch_id.as_deref(), Some("branch-1"));
        assert_eq!(hub.branch_size("branch-1"), 0);
        assert_eq!(hub.connection_count(), 0);
        assert!(hub.remove("a").is_none());
        assert_eq!(hub.join("a", "branch-1"), None);
    }

    #[test]
    fn duplicate_events_are_delivered_twice() {
        let hub = BranchHub::default();
        let _a = connect(&hub, "a");
        let mut b = connect(&hub, "b");
        hub.join("a", "branch-1");
        hub.join("b", "branch-1");
        hub.broadcast_from("a", new_order("o-4"));
        hub.broadcast_from("a", new_order("o-4"));
        assert_eq!(b.try_recv().unwrap(), new_order("o-4"));
        assert_eq!(b.try_recv().unwrap(), new_order("o-4"));
    }

    #[test]
    fn stalled_reader_queue_is_capped() {
        let hub = BranchHub::default();
        let _a = connect(&hub, "a");
        let mut stalled = connect_with_capacity(&hub, "b", 4);
        let mut live = connect(&hub, "c");
        for id in ["a", "b", "c"] {
            hub.join(id, "branch-1");
        }

        let delivered: Vec<usize> = (0..10)
            .map(|i| hub.broadcast_from("a", new_order(&format!("o-{i}"))))
            .collect();
        assert_eq!(&delivered[..4], &[2, 2, 2, 2]);
        assert!(delivered[4..].iter().all(|n| *n == 1));

        for i in 0..4 {
            assert_eq!(stalled.try_recv().unwrap(), new_order(&format!("o-{i}")));
        }
        assert!(stalled.try_recv().is_err(), "overflow is dropped, not buffered");
        for i in 0..10 {
            assert_eq!(live.try_recv().unwrap(), new_order(&format!("o-{i}")));
        }

        // Draining frees room again.
        assert_eq!(hub.broadcast_from("a", new_order("o-10")), 2);
        assert_eq!(stalled.try_recv().unwrap(), new_order("o-10"));
    }
}

//! Application-level owner of the single realtime connection.
//!
//! Mount once at startup, hand out [`RealtimeHandle`] clones to consumers,
//! dispose on shutdown. Handles cannot tear the connection down.

use serde_json::Value;
use tokio::sync::watch;
use tracing::info;

use super::client::{BridgeOptions, BridgeSnapshot, SocketBridge};
use super::listeners::Unsubscribe;
use super::protocol::OrderStatusEvent;
use crate::access::Role;

pub struct RealtimeProvider {
    bridge: SocketBridge,
    disposed: bool,
}

impl RealtimeProvider {
    pub fn mount(addr: impl Into<String>, token: impl Into<String>, options: BridgeOptions) -> Self {
        let addr = addr.into();
        info!(addr = %addr, "realtime provider mounted");
        Self {
            bridge: SocketBridge::connect(addr, token, options),
            disposed: false,
        }
    }

    pub fn handle(&self) -> RealtimeHandle {
        RealtimeHandle {
            bridge: self.bridge.clone(),
        }
    }

    pub fn dispose(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if !self.disposed {
            self.disposed = true;
            self.bridge.disconnect();
            info!("realtime provider disposed");
        }
    }
}

impl Drop for RealtimeProvider {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Consumer view of the shared bridge.
#[derive(Clone, Debug)]
pub struct RealtimeHandle {
    bridge: SocketBridge,
}

impl RealtimeHandle {
    pub fn is_connected(&self) -> bool {
        self.bridge.is_connected()
    }

    pub fn snapshot(&self) -> BridgeSnapshot {
        self.bridge.snapshot()
    }

    pub fn state(&self) -> watch::Receiver<BridgeSnapshot> {
        self.bridge.state()
    }

    pub fn join_branch(&self, branch_id: &str, role: Role) {
        self.bridge.join_branch(branch_id, role);
    }

    pub fn on_new_order<F>(&self, callback: F) -> Unsubscribe
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.bridge.on_new_order(callback)
    }

    pub fn on_order_update<F>(&self, callback: F) -> Unsubscribe
    where
        F: Fn(&OrderStatusEvent) + Send + Sync + 'static,
    {
        self.bridge.on_order_update(callback)
    }

    pub fn notify_new_order(&self, order: Value) {
        self.bridge.notify_new_order(order);
    }

    pub fn notify_order_update(&self, event: OrderStatusEvent) {
        self.bridge.notify_order_update(event);
    }
}

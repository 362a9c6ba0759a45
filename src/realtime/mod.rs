//! Realtime event bridge: branch-scoped order events between terminals.
//!
//! [`server`] hosts the hub, [`client`] keeps one connection per process and
//! [`provider`] exposes it to the rest of the application.

pub mod client;
pub mod hub;
pub mod listeners;
pub mod protocol;
pub mod provider;
pub mod server;

pub use client::{BridgeOptions, BridgeSnapshot, SocketBridge};
pub use hub::{BranchHub, Connection, FanoutPolicy};
pub use listeners::{ListenerRegistry, Unsubscribe};
pub use protocol::{NewOrderEvent, OrderStatusEvent};
pub use provider::{RealtimeHandle, RealtimeProvider};
pub use server::{RealtimeServer, RealtimeServerConfig};

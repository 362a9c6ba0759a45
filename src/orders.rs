//! Order actions that must reach every terminal in the branch.
//!
//! The REST call always goes first. Only the backend's response is
//! broadcast, and a failed call broadcasts nothing.

use serde_json::Value;
use tracing::{info, warn};

use crate::api::{DashboardApi, OrderQuery};
use crate::error::ApiError;
use crate::realtime::{OrderStatusEvent, RealtimeHandle};

#[derive(Clone, Debug)]
pub struct OrderWorkflow {
    api: DashboardApi,
    realtime: RealtimeHandle,
}

impl OrderWorkflow {
    pub fn new(api: DashboardApi, realtime: RealtimeHandle) -> Self {
        Self { api, realtime }
    }

    pub async fn create_order(&self, order: &Value) -> Result<Value, ApiError> {
        let created = self.api.create_order(order).await.map_err(|e| {
            warn!(error = %e, "order creation failed, nothing broadcast");
            e
        })?;
        info!(
            order_id = %crate::value_id(&created, &["id", "orderId"]).unwrap_or_default(),
            connected = self.realtime.is_connected(),
            "order created"
        );
        self.realtime.notify_new_order(created.clone());
        Ok(created)
    }

    pub async fn update_status(
        &self,
        order_id: &str,
        status: &str,
    ) -> Result<OrderStatusEvent, ApiError> {
        let updated = self.api.update_order_status(order_id, status).await.map_err(|e| {
            warn!(order_id, error = %e, "status update failed, nothing broadcast");
            e
        })?;
        let event = OrderStatusEvent::from_order(&updated)
            .unwrap_or_else(|| OrderStatusEvent::new(order_id, status));
        info!(order_id = %event.order_id, status = %event.status, "order status updated");
        self.realtime.notify_order_update(event.clone());
        Ok(event)
    }

    /// Current orders from the backend. Called after reconnecting, since
    /// events missed while offline are not replayed.
    pub async fn refresh(&self, query: &OrderQuery) -> Result<Vec<Value>, ApiError> {
        self.api.fetch_orders(query).await
    }
}

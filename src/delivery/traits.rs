use super::{TransportError, TransportKind};
use crate::queue::QueueEntry;
use crate::router::DeliveryPlan;
use async_trait::async_trait;
use std::path::PathBuf;

/// What a transport reports after handing a message over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportReceipt {
    pub transport: TransportKind,
    /// File written, for transports that leave one behind.
    pub location: Option<PathBuf>,
}

/// One way of handing a formatted message to a recipient.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Deliver `plan.formatted` for `entry`. Must be idempotent per
    /// `entry.queue_id`.
    async fn send(
        &self,
        entry: &QueueEntry,
        plan: &DeliveryPlan,
    ) -> Result<TransportReceipt, TransportError>;
}

//! EventBus port - pub/sub transport の抽象化
//!
//! orchestrator は event type ごとに一度だけ subscribe し、
//! handler 実行成功後に follow-up イベントを emit します。
//!
//! # 設計原則
//! - listener はイベントソースをブロックしてはいけない（重い処理は spawn する）
//! - subscribe は `SubscriptionId` を返し、`unsubscribe` で解除する

use std::sync::Arc;

use crate::domain::{DomainEvent, EventType, SubscriptionId};

/// Callback invoked for every event of the subscribed type.
pub type EventListener = Arc<dyn Fn(DomainEvent) + Send + Sync>;

pub trait EventBus: Send + Sync {
    fn subscribe(&self, event_type: &EventType, listener: EventListener) -> SubscriptionId;

    /// No-op for unknown ids.
    fn unsubscribe(&self, id: SubscriptionId);

    fn emit(&self, event: DomainEvent);
}

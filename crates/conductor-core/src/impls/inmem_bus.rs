//! InMemoryEventBus - 開発・テスト用のイベントバス
//!
//! # 実装詳細
//! - event type ごとに listener を保持（Mutex で排他制御）
//! - emit は listener 一覧を clone してから lock を外して呼び出す
//!   （listener の中から emit / subscribe しても deadlock しない）
//! - emit されたイベントは履歴として残る（トレース確認用）

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::trace;

use crate::domain::{DomainEvent, EventType, SubscriptionId};
use crate::ports::{EventBus, EventListener};

#[derive(Default)]
struct BusState {
    listeners: HashMap<EventType, Vec<(SubscriptionId, EventListener)>>,
    history: Vec<DomainEvent>,
}

#[derive(Default)]
pub struct InMemoryEventBus {
    state: Mutex<BusState>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every event emitted so far, in order.
    pub fn emitted(&self) -> Vec<DomainEvent> {
        self.lock().history.clone()
    }

    pub fn subscriber_count(&self, event_type: &EventType) -> usize {
        self.lock().listeners.get(event_type).map_or(0, Vec::len)
    }
}

impl EventBus for InMemoryEventBus {
    fn subscribe(&self, event_type: &EventType, listener: EventListener) -> SubscriptionId {
        let id = SubscriptionId::generate();
        self.lock()
            .listeners
            .entry(event_type.clone())
            .or_default()
            .push((id, listener));
        trace!(%event_type, subscription_id = %id, "subscribed");
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        let mut state = self.lock();
        for list in state.listeners.values_mut() {
            list.retain(|(sid, _)| *sid != id);
        }
        state.listeners.retain(|_, list| !list.is_empty());
    }

    fn emit(&self, event: DomainEvent) {
        let event_type = event.event_type();
        let listeners: Vec<EventListener> = {
            let mut state = self.lock();
            state.history.push(event.clone());
            state
                .listeners
                .get(&event_type)
                .map(|list| list.iter().map(|(_, l)| l.clone()).collect())
                .unwrap_or_default()
        };
        trace!(%event_type, listeners = listeners.len(), "emit");
        for listener in listeners {
            listener(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Actor, EventPayload};
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn custom(name: &str) -> DomainEvent {
        DomainEvent::new(
            EventPayload::Custom {
                name: name.into(),
                data: json!({}),
            },
            Actor::system(),
        )
    }

    fn counting_listener(counter: &Arc<AtomicUsize>) -> EventListener {
        let counter = counter.clone();
        Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn delivers_only_to_matching_type() {
        let bus = InMemoryEventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        bus.subscribe(&EventType::new("a"), counting_listener(&hits));

        bus.emit(custom("a"));
        bus.emit(custom("b"));

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.emitted().len(), 2);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = InMemoryEventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let e = EventType::new("a");
        let id = bus.subscribe(&e, counting_listener(&hits));
        assert_eq!(bus.subscriber_count(&e), 1);

        bus.unsubscribe(id);
        bus.unsubscribe(id);
        bus.emit(custom("a"));

        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(bus.subscriber_count(&e), 0);
    }

    #[test]
    fn listeners_may_emit_reentrantly() {
        let bus = Arc::new(InMemoryEventBus::new());
        let hits = Arc::new(AtomicUsize::new(0));
        bus.subscribe(&EventType::new("second"), counting_listener(&hits));

        let inner = bus.clone();
        bus.subscribe(
            &EventType::new("first"),
            Arc::new(move |_| inner.emit(custom("second"))),
        );
        bus.emit(custom("first"));

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}

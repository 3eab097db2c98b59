//! HandlerRegistry - event type ごとの handler 一覧
//!
//! # 並行性
//! - バケットは `Arc<[RegisteredHandler]>` のコピーオンライト
//! - 挿入/置換とソートは同じ write lock の中で行うため、
//!   並行する dispatch がソート途中のリストを見ることはない
//! - lookup は Arc を clone するだけ（lock を保持したまま await しない）

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::domain::EventType;
use crate::handler::RegisteredHandler;

/// What `register` did to the bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// First handler for a previously unseen event type.
    NewEventType,
    /// Added to an existing bucket.
    Added,
    /// Replaced a handler with the same id (bucket length unchanged).
    Replaced,
}

/// What `unregister` did to the bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unregistration {
    NotFound,
    Removed,
    /// Removed the last handler; the bucket is gone.
    BucketEmptied,
}

#[derive(Default)]
pub struct HandlerRegistry {
    buckets: RwLock<HashMap<EventType, Arc<[RegisteredHandler]>>>,
    /// Handlers reachable only by id from config-driven steps.
    steps: RwLock<HashMap<String, RegisteredHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace by handler id, then stable-sort by descending priority.
    pub fn register(&self, event_type: EventType, handler: RegisteredHandler) -> Registration {
        let mut buckets = self.buckets.write().unwrap_or_else(PoisonError::into_inner);

        let (mut list, outcome) = match buckets.get(&event_type) {
            None => (Vec::with_capacity(1), Registration::NewEventType),
            Some(existing) => (existing.to_vec(), Registration::Added),
        };

        let outcome = match list.iter().position(|h| h.id() == handler.id()) {
            Some(index) => {
                list[index] = handler;
                Registration::Replaced
            }
            None => {
                list.push(handler);
                outcome
            }
        };

        // sort_by is stable: equal priorities keep registration order.
        list.sort_by(|a, b| b.priority().cmp(&a.priority()));
        buckets.insert(event_type, list.into());
        outcome
    }

    pub fn unregister(&self, event_type: &EventType, handler_id: &str) -> Unregistration {
        let mut buckets = self.buckets.write().unwrap_or_else(PoisonError::into_inner);

        let Some(existing) = buckets.get(event_type) else {
            return Unregistration::NotFound;
        };
        if !existing.iter().any(|h| h.id() == handler_id) {
            return Unregistration::NotFound;
        }

        let remaining: Vec<_> = existing.iter().filter(|h| h.id() != handler_id).cloned().collect();
        if remaining.is_empty() {
            buckets.remove(event_type);
            Unregistration::BucketEmptied
        } else {
            buckets.insert(event_type.clone(), remaining.into());
            Unregistration::Removed
        }
    }

    /// Handlers for `event_type` in dispatch order (empty if none).
    pub fn lookup(&self, event_type: &EventType) -> Arc<[RegisteredHandler]> {
        let buckets = self.buckets.read().unwrap_or_else(PoisonError::into_inner);
        buckets.get(event_type).cloned().unwrap_or_else(|| Arc::from(Vec::new()))
    }

    /// Register a step handler, not bound to any event type.
    /// Returns `true` when it replaced one with the same id.
    pub fn register_step(&self, handler: RegisteredHandler) -> bool {
        let mut steps = self.steps.write().unwrap_or_else(PoisonError::into_inner);
        steps.insert(handler.id().to_string(), handler).is_some()
    }

    pub fn unregister_step(&self, handler_id: &str) -> bool {
        let mut steps = self.steps.write().unwrap_or_else(PoisonError::into_inner);
        steps.remove(handler_id).is_some()
    }

    /// Handler with `handler_id`: step handlers first, then any bucket.
    pub fn find(&self, handler_id: &str) -> Option<RegisteredHandler> {
        let steps = self.steps.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(handler) = steps.get(handler_id) {
            return Some(handler.clone());
        }
        drop(steps);

        let buckets = self.buckets.read().unwrap_or_else(PoisonError::into_inner);
        buckets
            .values()
            .flat_map(|bucket| bucket.iter())
            .find(|h| h.id() == handler_id)
            .cloned()
    }

    pub fn event_types(&self) -> Vec<EventType> {
        let buckets = self.buckets.read().unwrap_or_else(PoisonError::into_inner);
        let mut types: Vec<_> = buckets.keys().cloned().collect();
        types.sort();
        types
    }

    /// Number of registrations across all buckets, plus step handlers.
    pub fn len(&self) -> usize {
        let steps = self.steps.read().unwrap_or_else(PoisonError::into_inner).len();
        let buckets = self.buckets.read().unwrap_or_else(PoisonError::into_inner);
        steps + buckets.values().map(|bucket| bucket.len()).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.buckets.write().unwrap_or_else(PoisonError::into_inner).clear();
        self.steps.write().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DomainEvent, HandlerError, StepResult, WorkflowContext};
    use crate::handler::{HandlerOptions, WorkflowHandler};
    use async_trait::async_trait;

    struct Named(&'static str, &'static str);

    #[async_trait]
    impl WorkflowHandler for Named {
        fn id(&self) -> &str {
            self.0
        }

        fn name(&self) -> &str {
            self.1
        }

        async fn execute(&self, _event: &DomainEvent, _ctx: &WorkflowContext) -> Result<StepResult, HandlerError> {
            Ok(StepResult::success(self.0))
        }
    }

    fn entry(id: &'static str, priority: i32) -> RegisteredHandler {
        entry_named(id, id, priority)
    }

    fn entry_named(id: &'static str, name: &'static str, priority: i32) -> RegisteredHandler {
        RegisteredHandler::new(
            Arc::new(Named(id, name)),
            Some(HandlerOptions::default().with_priority(priority)),
        )
    }

    fn ids(list: &[RegisteredHandler]) -> Vec<&str> {
        list.iter().map(|h| h.id()).collect()
    }

    #[test]
    fn orders_by_descending_priority() {
        let reg = HandlerRegistry::new();
        let e = EventType::new("e");
        reg.register(e.clone(), entry("low", 1));
        reg.register(e.clone(), entry("high", 10));
        reg.register(e.clone(), entry("mid", 5));

        assert_eq!(ids(&reg.lookup(&e)), ["high", "mid", "low"]);
    }

    #[test]
    fn ties_keep_registration_order() {
        let reg = HandlerRegistry::new();
        let e = EventType::new("e");
        reg.register(e.clone(), entry("first", 3));
        reg.register(e.clone(), entry("second", 3));
        reg.register(e.clone(), entry("third", 3));

        assert_eq!(ids(&reg.lookup(&e)), ["first", "second", "third"]);
    }

    #[test]
    fn duplicate_id_replaces_in_place() {
        let reg = HandlerRegistry::new();
        let e = EventType::new("e");
        assert_eq!(reg.register(e.clone(), entry_named("h", "old", 1)), Registration::NewEventType);
        assert_eq!(reg.register(e.clone(), entry("other", 0)), Registration::Added);
        assert_eq!(reg.register(e.clone(), entry_named("h", "new", 1)), Registration::Replaced);

        let list = reg.lookup(&e);
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].handler.name(), "new");
    }

    #[test]
    fn replacement_resorts_on_priority_change() {
        let reg = HandlerRegistry::new();
        let e = EventType::new("e");
        reg.register(e.clone(), entry("a", 5));
        reg.register(e.clone(), entry("b", 1));
        reg.register(e.clone(), entry("b", 9));

        assert_eq!(ids(&reg.lookup(&e)), ["b", "a"]);
    }

    #[test]
    fn unregister_is_a_noop_when_absent() {
        let reg = HandlerRegistry::new();
        let e = EventType::new("e");
        assert_eq!(reg.unregister(&e, "missing"), Unregistration::NotFound);

        reg.register(e.clone(), entry("a", 0));
        reg.register(e.clone(), entry("b", 0));
        assert_eq!(reg.unregister(&e, "missing"), Unregistration::NotFound);
        assert_eq!(reg.unregister(&e, "a"), Unregistration::Removed);
        assert_eq!(reg.unregister(&e, "b"), Unregistration::BucketEmptied);
        assert!(reg.lookup(&e).is_empty());
        assert!(reg.event_types().is_empty());
    }

    #[test]
    fn lookup_snapshot_is_unaffected_by_later_registration() {
        let reg = HandlerRegistry::new();
        let e = EventType::new("e");
        reg.register(e.clone(), entry("a", 0));
        let snapshot = reg.lookup(&e);
        reg.register(e.clone(), entry("b", 10));

        assert_eq!(ids(&snapshot), ["a"]);
        assert_eq!(ids(&reg.lookup(&e)), ["b", "a"]);
    }

    #[test]
    fn find_searches_every_bucket() {
        let reg = HandlerRegistry::new();
        reg.register(EventType::new("x"), entry("in-x", 0));
        reg.register(EventType::new("y"), entry("in-y", 0));

        assert!(reg.find("in-y").is_some());
        assert!(reg.find("nowhere").is_none());
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn step_handlers_are_found_without_an_event_type() {
        let reg = HandlerRegistry::new();
        assert!(!reg.register_step(entry("step", 0)));
        assert!(reg.register_step(entry("step", 0)));

        assert!(reg.find("step").is_some());
        assert!(reg.event_types().is_empty());
        assert_eq!(reg.len(), 1);

        assert!(reg.unregister_step("step"));
        assert!(!reg.unregister_step("step"));
        assert!(reg.find("step").is_none());
    }
}

//! Ports - 外部コラボレータへのインターフェース
//!
//! イベントバスは orchestrator の外側にあり、ここでは契約のみを定義します。

pub mod event_bus;

pub use self::event_bus::{EventBus, EventListener};

//! Impls - ports の実装（開発用・テスト用）
//!
//! 本番用のバス（NATS, Kafka など）は別クレートに配置する想定です。

pub mod inmem_bus;

pub use self::inmem_bus::InMemoryEventBus;

//! Ports - 抽象化レイヤー
//!
//! Queue が外部に依存する箇所を trait として切り出す。
//! - 時刻（Clock）と ID 生成（IdGenerator）はテストで差し替え可能
//! - 処理関数（JobProcessor）とイベント購読（EventSink）は組み込み側が実装する

pub mod clock;
pub mod event_sink;
pub mod id_generator;
pub mod processor;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::event_sink::EventSink;
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::processor::{JobContext, JobProcessor};

//! EventSink port - キューイベントの購読
//!
//! Queue の状態遷移ごとに `emit` が呼ばれる。
//! - 呼び出しは状態ロックの外で行われるので、sink から Queue の参照系 API を呼んでもよい
//! - 遷移が起きた順序のまま、1 本ずつ直列に配送される
//! - sink 内で panic しないこと（配送中のスレッドに伝播する）

use crate::domain::{JobData, QueueEvent};

/// Observer for queue lifecycle events.
pub trait EventSink<P: JobData, R: JobData>: Send + Sync {
    fn emit(&self, event: &QueueEvent<P, R>);
}

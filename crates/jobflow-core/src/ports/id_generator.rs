//! IdGenerator port - ID 生成の抽象化
//!
//! Queue インスタンスごとに注入される（プロセスグローバルなカウンタは持たない）。
//!
//! # 実装
//! - **UlidGenerator**: 単調増加 ULID（時刻 + 同一ミリ秒内カウンタ + 乱数）

use std::sync::{Mutex, PoisonError};
use std::time::SystemTime;

use ulid::{Generator, Ulid};

use crate::domain::JobId;
use crate::ports::Clock;

/// IdGenerator は Job ID を生成
///
/// # Thread Safety
/// - `Send + Sync` を要求（`add()` は複数スレッドから呼ばれうる）
pub trait IdGenerator: Send + Sync {
    fn generate_job_id(&self) -> JobId;
}

/// ULID ベースの ID 生成器
///
/// 同一ミリ秒内で複数回呼ばれた場合は、前回の ULID の乱数部を +1 するため
/// 生成順に厳密に増加する。乱数部が溢れた場合のみ新しい乱数で作り直す。
pub struct UlidGenerator<C> {
    clock: C,
    generator: Mutex<Generator>,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self {
            clock,
            generator: Mutex::new(Generator::new()),
        }
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_job_id(&self) -> JobId {
        let now = self.clock.now();
        let mut generator = self
            .generator
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let ulid = generator
            .generate_from_datetime(SystemTime::from(now))
            .unwrap_or_else(|_| {
                let timestamp_ms = now.timestamp_millis().max(0) as u64;
                Ulid::from_parts(timestamp_ms, rand::random())
            });
        JobId::from_ulid(ulid)
    }
}

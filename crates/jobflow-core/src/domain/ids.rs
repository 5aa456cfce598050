//! Job identifiers.
//!
//! `JobId` は ULID をラップした強い型の ID です。
//! - 先頭 48 bit がミリ秒タイムスタンプなので生成順にソートできる
//! - 同一ミリ秒内では `ports::UlidGenerator` が乱数部をインクリメントするため、
//!   高頻度に生成しても一意かつ単調増加になる

use serde::{Deserialize, Serialize};
use std::fmt;
use ulid::Ulid;

const PREFIX: &str = "job-";

/// Identifier of a job (unit of submission / status / correlation).
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Ulid);

impl JobId {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    pub fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{PREFIX}{}", self.0)
    }
}

//! jobflow-core
//!
//! In-process job processing engine: a priority queue with retry backoff,
//! a worker pool, health monitoring, and structured logging.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（JobId, Job, JobState, QueueEvent）
//! - **ports**: 抽象化レイヤー（Clock, IdGenerator, JobProcessor, EventSink）
//! - **queue**: 優先度付きキュー、リトライ、ディスパッチループ
//! - **worker**: WorkerPool（処理能力の割り当てと集計）
//! - **monitoring**: ヘルス判定とメトリクス
//! - **observability**: tracing の初期化と構造化ロガー
//! - **engine**: 上記をまとめた WorkflowEngine
//! - **config** / **error**: 設定とエラー型

pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod monitoring;
pub mod observability;
pub mod ports;
pub mod queue;
pub mod worker;

pub use config::{EngineConfig, MonitoringConfig, QueueConfig};
pub use domain::{Job, JobFailure, JobId, JobOptions, JobState, QueueEvent};
pub use engine::{SimulatedWorkflow, WorkflowEngine};
pub use error::{ConfigError, EngineError};
pub use monitoring::{HealthState, HealthStatus, Metrics, MonitoringService};
pub use observability::{LogFormat, Logger, init_tracing};
pub use ports::{EventSink, JobContext, JobProcessor};
pub use queue::{Queue, QueueMetrics, RetryPolicy};
pub use worker::{Worker, WorkerOptions, WorkerPermit, WorkerPool};

#![doc = include_str!("../README.md")]

pub mod config;
pub mod error;
pub mod event;
pub mod metrics;
pub mod pipeline;
pub mod types;

// --- 주요 타입 re-export ---

// 에러
pub use error::{
    AuditError, ConfigError, FlowError, FlowgateError, MalformedEvent, PipelineError, RuleError,
};

// 설정
pub use config::FlowgateConfig;

// 이벤트
pub use event::{AlertEvent, AlertKind, EventMetadata, PayloadDescriptor, PayloadEncoding, TrafficEvent};

// 파이프라인 trait
pub use pipeline::{AuditSink, EnforcementHook, HealthStatus, Pipeline};

// 도메인 타입
pub use types::{Action, AnomalyScore, FlowKey, Protocol, Severity, Verdict, VerdictTag};

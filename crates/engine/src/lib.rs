#![doc = include_str!("../README.md")]
//!
//! # 모듈 구성
//!
//! - [`rule`]: YAML 규칙 로딩/검증, 버전이 붙은 불변 스냅샷 스토어
//! - [`matcher`]: 시그니처 매칭 (순수 함수)
//! - [`flow`]: 플로우 추적기 (키별 잠금, 유휴 정리, 한도 축출)
//! - [`anomaly`]: 출발지별 이상 점수
//! - [`decision`]: 판정 우선순위 정책
//! - [`dispatch`]: 차단 훅 호출과 감사 기록 재시도
//! - [`pipeline`]: 이벤트 파이프라인 (Pipeline trait 구현)
//! - [`audit`], [`enforce`]: 기본 감사 싱크와 차단 훅
//! - [`config`]: 엔진 설정 (core 설정 변환)
//! - [`error`]: 도메인 에러 타입

pub mod anomaly;
pub mod audit;
pub mod config;
pub mod decision;
pub mod dispatch;
pub mod enforce;
pub mod error;
pub mod flow;
pub mod matcher;
pub mod pipeline;
pub mod rule;

/// 판정 로그의 tracing 타깃 (판정 결정, 승격, 차단 집행)
pub const VERDICT_LOG_TARGET: &str = "flowgate::verdict";

/// 감사 기록 로그의 tracing 타깃 (재시도, 실패, 지연 재시도)
pub const AUDIT_LOG_TARGET: &str = "flowgate::audit";

// --- 주요 타입 re-export ---

// 파이프라인
pub use pipeline::{Engine, EventPipeline, EventPipelineBuilder, EventStage, FailedEvent};

// 설정
pub use config::{AuditRetryConfig, EngineConfig, FlowTrackerConfig, ScorerConfig};

// 에러
pub use error::EngineError;

// 규칙
pub use rule::{
    IdentityPattern, MatchSpec, PayloadSignature, Rule, RuleDef, RuleLoader, RuleSet,
    RuleSnapshot, RuleStore,
};

// 평가 단계
pub use anomaly::{AnomalyResult, AnomalyScorer};
pub use decision::{Decision, decide};
pub use flow::{FlowTracker, FlowView};
pub use matcher::{MatchResult, match_event};

// 전달
pub use audit::{JsonlAuditSink, MemoryAuditSink};
pub use dispatch::Dispatcher;
pub use enforce::LoggingEnforcer;

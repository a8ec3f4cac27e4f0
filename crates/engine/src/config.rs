//! 엔진 설정
//!
//! [`EngineConfig`]는 core의 [`FlowgateConfig`]에서 파생되며,
//! 초/밀리초 정수 값을 `Duration`으로 바꾸고 기본 동작을 파싱한 형태입니다.
//!
//! # 사용 예시
//! ```ignore
//! use flowgate_core::config::FlowgateConfig;
//! use flowgate_engine::config::EngineConfig;
//!
//! let core_config = FlowgateConfig::default();
//! let config = EngineConfig::from_core(&core_config)?;
//! ```

use std::time::Duration;

use flowgate_core::config::FlowgateConfig;
use flowgate_core::types::Action;

use crate::error::EngineError;

/// 플로우 추적기 설정
#[derive(Debug, Clone)]
pub struct FlowTrackerConfig {
    /// 유휴 플로우 만료 시간
    pub idle_timeout: Duration,
    /// 동시 추적 한도
    pub max_flows: usize,
    /// 축출 대상이 되기 위한 최소 유휴 시간
    pub eviction_idle_grace: Duration,
    /// 정리 주기
    pub reap_interval: Duration,
}

impl Default for FlowTrackerConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            max_flows: 100_000,
            eviction_idle_grace: Duration::from_millis(1_000),
            reap_interval: Duration::from_secs(10),
        }
    }
}

/// 이상 점수기 설정
#[derive(Debug, Clone)]
pub struct ScorerConfig {
    /// 기준선 윈도우 크기
    pub window_size: usize,
    /// 학습된 기준선을 쓰기 위한 최소 샘플 수
    pub min_samples: usize,
    /// 초과 판정 임계값
    pub threshold: f64,
    /// 기준선이 없는 출발지의 가정 도착 간격
    pub prior_interarrival: Duration,
    /// 단기 평균 샘플 수
    pub burst_span: usize,
    /// 기준선 재설정까지의 연속 이상 샘플 수
    pub rebaseline_after: u64,
    /// 출발지 윈도우 정리 기준 유휴 시간
    pub source_idle: Duration,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            window_size: 64,
            min_samples: 16,
            threshold: 3.0,
            prior_interarrival: Duration::from_millis(1_000),
            burst_span: 8,
            rebaseline_after: 4_096,
            source_idle: Duration::from_secs(3_600),
        }
    }
}

/// 감사 기록 재시도 설정
#[derive(Debug, Clone)]
pub struct AuditRetryConfig {
    /// 즉시 기록 시도 횟수
    pub max_attempts: u32,
    /// 선형 백오프 기본 간격 (`base * attempt`)
    pub backoff_base: Duration,
    /// 시도 1회 타임아웃
    pub write_timeout: Duration,
    /// 지연 재시도 큐 용량
    pub queue_capacity: usize,
    /// 지연 재시도 주기
    pub retry_interval: Duration,
}

impl Default for AuditRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_millis(50),
            write_timeout: Duration::from_millis(2_000),
            queue_capacity: 10_000,
            retry_interval: Duration::from_secs(5),
        }
    }
}

/// 엔진 전체 설정
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// 규칙 디렉토리
    pub rule_dir: String,
    /// 스냅샷 기본 동작
    pub default_action: Action,
    /// 병렬 워커 수
    pub workers: usize,
    /// 수신/워커 큐 용량
    pub queue_capacity: usize,
    /// 플로우 추적
    pub flow: FlowTrackerConfig,
    /// 이상 점수
    pub scorer: ScorerConfig,
    /// 감사 재시도
    pub audit: AuditRetryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rule_dir: "/etc/flowgate/rules".to_owned(),
            default_action: Action::Deny,
            workers: 4,
            queue_capacity: 1_024,
            flow: FlowTrackerConfig::default(),
            scorer: ScorerConfig::default(),
            audit: AuditRetryConfig::default(),
        }
    }
}

impl EngineConfig {
    /// core 설정에서 엔진 설정을 생성합니다.
    pub fn from_core(core: &FlowgateConfig) -> Result<Self, EngineError> {
        let default_action =
            core.rules
                .default_action()
                .ok_or_else(|| EngineError::Config {
                    field: "rules.default_action".to_owned(),
                    reason: format!("unknown action '{}'", core.rules.default_action),
                })?;

        let config = Self {
            rule_dir: core.rules.rule_dir.clone(),
            default_action,
            workers: core.pipeline.workers,
            queue_capacity: core.pipeline.queue_capacity,
            flow: FlowTrackerConfig {
                idle_timeout: Duration::from_secs(core.flow.idle_timeout_secs),
                max_flows: core.flow.max_flows,
                eviction_idle_grace: Duration::from_millis(core.flow.eviction_idle_grace_ms),
                reap_interval: Duration::from_secs(core.flow.reap_interval_secs),
            },
            scorer: ScorerConfig {
                window_size: core.anomaly.window_size,
                min_samples: core.anomaly.min_samples,
                threshold: core.anomaly.threshold,
                prior_interarrival: Duration::from_millis(core.anomaly.prior_interarrival_ms),
                burst_span: core.anomaly.burst_span,
                rebaseline_after: core.anomaly.rebaseline_after,
                source_idle: Duration::from_secs(core.anomaly.source_idle_secs),
            },
            audit: AuditRetryConfig {
                max_attempts: core.audit.retry_max_attempts,
                backoff_base: Duration::from_millis(core.audit.retry_backoff_ms),
                write_timeout: Duration::from_millis(core.audit.write_timeout_ms),
                queue_capacity: core.audit.retry_queue_capacity,
                retry_interval: Duration::from_secs(core.audit.retry_interval_secs),
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// 설정값의 유효성을 검증합니다.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.workers == 0 {
            return Err(config_err("workers", "must be at least 1"));
        }
        if self.queue_capacity == 0 {
            return Err(config_err("queue_capacity", "must be at least 1"));
        }
        if self.flow.max_flows == 0 {
            return Err(config_err("flow.max_flows", "must be at least 1"));
        }
        if self.flow.reap_interval.is_zero() {
            return Err(config_err("flow.reap_interval", "must be greater than 0"));
        }
        if !self.scorer.threshold.is_finite() || self.scorer.threshold <= 0.0 {
            return Err(config_err(
                "scorer.threshold",
                "must be a positive finite number",
            ));
        }
        if self.scorer.min_samples < 2 || self.scorer.window_size < self.scorer.min_samples {
            return Err(config_err(
                "scorer.window_size",
                "must satisfy window_size >= min_samples >= 2",
            ));
        }
        if self.scorer.burst_span == 0 || self.scorer.burst_span > self.scorer.window_size {
            return Err(config_err(
                "scorer.burst_span",
                "must be between 1 and window_size",
            ));
        }
        if self.scorer.prior_interarrival.is_zero() {
            return Err(config_err(
                "scorer.prior_interarrival",
                "must be greater than 0",
            ));
        }
        if self.audit.max_attempts == 0 {
            return Err(config_err("audit.max_attempts", "must be at least 1"));
        }
        if self.audit.queue_capacity == 0 {
            return Err(config_err("audit.queue_capacity", "must be at least 1"));
        }
        Ok(())
    }
}

fn config_err(field: &str, reason: &str) -> EngineError {
    EngineError::Config {
        field: field.to_owned(),
        reason: reason.to_owned(),
    }
}

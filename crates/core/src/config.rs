//! 설정 관리 -- flowgate.toml 파싱 및 런타임 설정
//!
//! [`FlowgateConfig`]는 모든 모듈의 설정을 담는 최상위 구조체입니다.
//!
//! # 설정 로딩 우선순위
//! 1. CLI 인자 (최고 우선)
//! 2. 환경변수 (`FLOWGATE_FLOW_MAX_FLOWS=50000` 형식)
//! 3. 설정 파일 (`flowgate.toml`)
//! 4. 기본값 (`Default` 구현)
//!
//! # 사용 예시
//! ```no_run
//! # async fn example() -> Result<(), flowgate_core::error::FlowgateError> {
//! use flowgate_core::config::FlowgateConfig;
//!
//! // 파일에서 로드 + 환경변수 오버라이드
//! let config = FlowgateConfig::load("flowgate.toml").await?;
//!
//! // TOML 문자열에서 직접 파싱
//! let config = FlowgateConfig::parse("[flow]\nmax_flows = 1000")?;
//! # Ok(())
//! # }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ConfigError, FlowgateError};
use crate::types::Action;

/// Flowgate 통합 설정
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowgateConfig {
    /// 일반 설정
    #[serde(default)]
    pub general: GeneralConfig,
    /// 규칙 저장소 설정
    #[serde(default)]
    pub rules: RulesConfig,
    /// 플로우 추적 설정
    #[serde(default)]
    pub flow: FlowConfig,
    /// 이상 점수 설정
    #[serde(default)]
    pub anomaly: AnomalyConfig,
    /// 이벤트 파이프라인 설정
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// 감사 싱크 설정
    #[serde(default)]
    pub audit: AuditConfig,
    /// 메트릭 설정
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl FlowgateConfig {
    /// TOML 파일에서 설정을 로드하고 환경변수 오버라이드를 적용합니다.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, FlowgateError> {
        let mut config = Self::from_file(path).await?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// TOML 파일에서 설정을 로드합니다 (환경변수 오버라이드 없음).
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, FlowgateError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                FlowgateError::Config(ConfigError::FileNotFound {
                    path: path.display().to_string(),
                })
            } else {
                FlowgateError::Io(e)
            }
        })?;
        let config = Self::parse(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// TOML 문자열에서 설정을 파싱합니다.
    pub fn parse(toml_str: &str) -> Result<Self, FlowgateError> {
        toml::from_str(toml_str).map_err(|e| {
            FlowgateError::Config(ConfigError::ParseFailed {
                reason: e.to_string(),
            })
        })
    }

    /// 환경변수로 설정값을 오버라이드합니다.
    ///
    /// 환경변수 네이밍 규칙: `FLOWGATE_{SECTION}_{FIELD}`
    pub fn apply_env_overrides(&mut self) {
        // General
        override_string(&mut self.general.log_level, "FLOWGATE_GENERAL_LOG_LEVEL");
        override_string(&mut self.general.log_format, "FLOWGATE_GENERAL_LOG_FORMAT");
        override_string(
            &mut self.general.verdict_log_level,
            "FLOWGATE_GENERAL_VERDICT_LOG_LEVEL",
        );
        override_string(
            &mut self.general.audit_log_level,
            "FLOWGATE_GENERAL_AUDIT_LOG_LEVEL",
        );

        // Rules
        override_string(&mut self.rules.rule_dir, "FLOWGATE_RULES_RULE_DIR");
        override_string(
            &mut self.rules.default_action,
            "FLOWGATE_RULES_DEFAULT_ACTION",
        );
        override_u64(
            &mut self.rules.reload_interval_secs,
            "FLOWGATE_RULES_RELOAD_INTERVAL_SECS",
        );

        // Flow
        override_u64(
            &mut self.flow.idle_timeout_secs,
            "FLOWGATE_FLOW_IDLE_TIMEOUT_SECS",
        );
        override_usize(&mut self.flow.max_flows, "FLOWGATE_FLOW_MAX_FLOWS");
        override_u64(
            &mut self.flow.eviction_idle_grace_ms,
            "FLOWGATE_FLOW_EVICTION_IDLE_GRACE_MS",
        );
        override_u64(
            &mut self.flow.reap_interval_secs,
            "FLOWGATE_FLOW_REAP_INTERVAL_SECS",
        );

        // Anomaly
        override_usize(&mut self.anomaly.window_size, "FLOWGATE_ANOMALY_WINDOW_SIZE");
        override_usize(&mut self.anomaly.min_samples, "FLOWGATE_ANOMALY_MIN_SAMPLES");
        override_f64(&mut self.anomaly.threshold, "FLOWGATE_ANOMALY_THRESHOLD");
        override_u64(
            &mut self.anomaly.prior_interarrival_ms,
            "FLOWGATE_ANOMALY_PRIOR_INTERARRIVAL_MS",
        );
        override_usize(&mut self.anomaly.burst_span, "FLOWGATE_ANOMALY_BURST_SPAN");
        override_u64(
            &mut self.anomaly.rebaseline_after,
            "FLOWGATE_ANOMALY_REBASELINE_AFTER",
        );
        override_u64(
            &mut self.anomaly.source_idle_secs,
            "FLOWGATE_ANOMALY_SOURCE_IDLE_SECS",
        );

        // Pipeline
        override_usize(&mut self.pipeline.workers, "FLOWGATE_PIPELINE_WORKERS");
        override_usize(
            &mut self.pipeline.queue_capacity,
            "FLOWGATE_PIPELINE_QUEUE_CAPACITY",
        );
        override_string(
            &mut self.pipeline.intake_bind,
            "FLOWGATE_PIPELINE_INTAKE_BIND",
        );
        override_usize(
            &mut self.pipeline.max_connections,
            "FLOWGATE_PIPELINE_MAX_CONNECTIONS",
        );
        override_usize(
            &mut self.pipeline.max_event_bytes,
            "FLOWGATE_PIPELINE_MAX_EVENT_BYTES",
        );

        // Audit
        override_string(&mut self.audit.path, "FLOWGATE_AUDIT_PATH");
        override_u64(&mut self.audit.max_file_bytes, "FLOWGATE_AUDIT_MAX_FILE_BYTES");
        override_usize(&mut self.audit.max_backups, "FLOWGATE_AUDIT_MAX_BACKUPS");
        override_u32(
            &mut self.audit.retry_max_attempts,
            "FLOWGATE_AUDIT_RETRY_MAX_ATTEMPTS",
        );
        override_u64(
            &mut self.audit.retry_backoff_ms,
            "FLOWGATE_AUDIT_RETRY_BACKOFF_MS",
        );
        override_u64(&mut self.audit.write_timeout_ms, "FLOWGATE_AUDIT_WRITE_TIMEOUT_MS");
        override_usize(
            &mut self.audit.retry_queue_capacity,
            "FLOWGATE_AUDIT_RETRY_QUEUE_CAPACITY",
        );
        override_u64(
            &mut self.audit.retry_interval_secs,
            "FLOWGATE_AUDIT_RETRY_INTERVAL_SECS",
        );

        // Metrics
        override_bool(&mut self.metrics.enabled, "FLOWGATE_METRICS_ENABLED");
        override_string(&mut self.metrics.listen_addr, "FLOWGATE_METRICS_LISTEN_ADDR");
        override_u16(&mut self.metrics.port, "FLOWGATE_METRICS_PORT");
    }

    /// 설정값의 유효성을 검증합니다.
    pub fn validate(&self) -> Result<(), FlowgateError> {
        // log_level 검증
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        for (field, level) in [
            ("general.log_level", &self.general.log_level),
            ("general.verdict_log_level", &self.general.verdict_log_level),
            ("general.audit_log_level", &self.general.audit_log_level),
        ] {
            if !valid_levels.contains(&level.as_str()) {
                return Err(invalid(
                    field,
                    format!("must be one of: {}", valid_levels.join(", ")),
                ));
            }
        }

        // log_format 검증
        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.general.log_format.as_str()) {
            return Err(invalid(
                "general.log_format",
                format!("must be one of: {}", valid_formats.join(", ")),
            ));
        }

        if self.rules.default_action().is_none() {
            return Err(invalid(
                "rules.default_action",
                "must be one of: allow, deny, alert".to_owned(),
            ));
        }

        if self.rules.rule_dir.is_empty() {
            return Err(invalid("rules.rule_dir", "must not be empty".to_owned()));
        }

        if self.flow.max_flows == 0 {
            return Err(invalid("flow.max_flows", "must be at least 1".to_owned()));
        }

        if self.flow.idle_timeout_secs == 0 {
            return Err(invalid(
                "flow.idle_timeout_secs",
                "must be greater than 0".to_owned(),
            ));
        }

        if self.flow.reap_interval_secs == 0 {
            return Err(invalid(
                "flow.reap_interval_secs",
                "must be greater than 0".to_owned(),
            ));
        }

        if !self.anomaly.threshold.is_finite() || self.anomaly.threshold <= 0.0 {
            return Err(invalid(
                "anomaly.threshold",
                "must be a positive finite number".to_owned(),
            ));
        }

        if self.anomaly.min_samples < 2 {
            return Err(invalid(
                "anomaly.min_samples",
                "must be at least 2".to_owned(),
            ));
        }

        if self.anomaly.window_size < self.anomaly.min_samples {
            return Err(invalid(
                "anomaly.window_size",
                format!(
                    "must be >= anomaly.min_samples ({})",
                    self.anomaly.min_samples
                ),
            ));
        }

        if self.anomaly.burst_span == 0 || self.anomaly.burst_span > self.anomaly.window_size {
            return Err(invalid(
                "anomaly.burst_span",
                "must be between 1 and anomaly.window_size".to_owned(),
            ));
        }

        if self.anomaly.prior_interarrival_ms == 0 {
            return Err(invalid(
                "anomaly.prior_interarrival_ms",
                "must be greater than 0".to_owned(),
            ));
        }

        if self.pipeline.workers == 0 {
            return Err(invalid("pipeline.workers", "must be at least 1".to_owned()));
        }

        if self.pipeline.queue_capacity == 0 {
            return Err(invalid(
                "pipeline.queue_capacity",
                "must be at least 1".to_owned(),
            ));
        }

        if self.audit.path.is_empty() {
            return Err(invalid("audit.path", "must not be empty".to_owned()));
        }

        if self.audit.retry_max_attempts == 0 {
            return Err(invalid(
                "audit.retry_max_attempts",
                "must be at least 1".to_owned(),
            ));
        }

        if self.audit.retry_queue_capacity == 0 {
            return Err(invalid(
                "audit.retry_queue_capacity",
                "must be at least 1".to_owned(),
            ));
        }

        Ok(())
    }
}

fn invalid(field: &str, reason: String) -> FlowgateError {
    ConfigError::InvalidValue {
        field: field.to_owned(),
        reason,
    }
    .into()
}

/// 일반 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// 로그 레벨 (trace, debug, info, warn, error)
    pub log_level: String,
    /// 로그 형식 (json, pretty)
    pub log_format: String,
    /// 판정 로그(`flowgate::verdict`) 레벨
    pub verdict_log_level: String,
    /// 감사 기록 로그(`flowgate::audit`) 레벨
    pub audit_log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_owned(),
            log_format: "json".to_owned(),
            verdict_log_level: "info".to_owned(),
            audit_log_level: "info".to_owned(),
        }
    }
}

/// 규칙 저장소 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
    /// YAML 규칙 파일 디렉토리
    pub rule_dir: String,
    /// 어떤 규칙도 매칭되지 않을 때의 동작 (allow, deny, alert)
    ///
    /// `allow`는 의도적으로 설정해야 합니다.
    pub default_action: String,
    /// 규칙 디렉토리 재확인 주기 (초, 0이면 비활성)
    pub reload_interval_secs: u64,
}

impl RulesConfig {
    /// 파싱된 기본 동작
    pub fn default_action(&self) -> Option<Action> {
        Action::from_str_loose(&self.default_action)
    }
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            rule_dir: "/etc/flowgate/rules".to_owned(),
            default_action: "deny".to_owned(),
            reload_interval_secs: 30,
        }
    }
}

/// 플로우 추적 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// 유휴 플로우 만료 시간 (초)
    pub idle_timeout_secs: u64,
    /// 동시에 추적할 최대 플로우 수
    pub max_flows: usize,
    /// 한도 도달 시 축출 대상이 되기 위한 최소 유휴 시간 (밀리초)
    pub eviction_idle_grace_ms: u64,
    /// 유휴 플로우 정리 주기 (초)
    pub reap_interval_secs: u64,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 300,
            max_flows: 100_000,
            eviction_idle_grace_ms: 1_000,
            reap_interval_secs: 10,
        }
    }
}

/// 이상 점수 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnomalyConfig {
    /// 출발지별 기준선 윈도우 크기 (샘플 수)
    pub window_size: usize,
    /// 학습된 기준선을 쓰기 위한 최소 샘플 수
    pub min_samples: usize,
    /// 초과 판정 임계값 (정규화 편차)
    pub threshold: f64,
    /// 기준선이 없는 출발지의 가정 도착 간격 (밀리초)
    pub prior_interarrival_ms: u64,
    /// 단기 평균을 계산할 최근 샘플 수
    pub burst_span: usize,
    /// 연속 이상 샘플이 이 수에 도달하면 기준선을 재설정
    pub rebaseline_after: u64,
    /// 이 시간 동안 조용한 출발지 윈도우는 정리됨 (초)
    pub source_idle_secs: u64,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            window_size: 64,
            min_samples: 16,
            threshold: 3.0,
            prior_interarrival_ms: 1_000,
            burst_span: 8,
            rebaseline_after: 4_096,
            source_idle_secs: 3_600,
        }
    }
}

/// 이벤트 파이프라인 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// 병렬 워커 수 (플로우 키 해시로 분배)
    pub workers: usize,
    /// 수신/워커 큐 용량
    pub queue_capacity: usize,
    /// JSON lines TCP 수신 주소
    pub intake_bind: String,
    /// 최대 동시 수신 연결 수
    pub max_connections: usize,
    /// 이벤트 한 줄의 최대 크기 (바이트)
    pub max_event_bytes: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1_024,
            intake_bind: "127.0.0.1:7070".to_owned(),
            max_connections: 64,
            max_event_bytes: 64 * 1024,
        }
    }
}

/// 감사 싱크 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// JSON lines 감사 파일 경로
    pub path: String,
    /// 회전 기준 파일 크기 (바이트)
    pub max_file_bytes: u64,
    /// 보관할 회전 파일 수
    pub max_backups: usize,
    /// 기록 시도 최대 횟수
    pub retry_max_attempts: u32,
    /// 재시도 백오프 기본 간격 (밀리초, 시도마다 선형 증가)
    pub retry_backoff_ms: u64,
    /// 기록 시도 1회 타임아웃 (밀리초)
    pub write_timeout_ms: u64,
    /// 지연 재시도 큐 용량
    pub retry_queue_capacity: usize,
    /// 지연 재시도 주기 (초)
    pub retry_interval_secs: u64,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            path: "/var/log/flowgate/audit.jsonl".to_owned(),
            max_file_bytes: 10 * 1024 * 1024,
            max_backups: 5,
            retry_max_attempts: 3,
            retry_backoff_ms: 50,
            write_timeout_ms: 2_000,
            retry_queue_capacity: 10_000,
            retry_interval_secs: 5,
        }
    }
}

/// 메트릭 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Prometheus exporter 활성화 여부
    pub enabled: bool,
    /// 바인드 주소
    pub listen_addr: String,
    /// 포트
    pub port: u16,
    /// 스크랩 경로
    pub endpoint: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: "127.0.0.1".to_owned(),
            port: 9100,
            endpoint: "/metrics".to_owned(),
        }
    }
}

// --- 환경변수 오버라이드 헬퍼 ---

fn override_string(target: &mut String, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        *target = val;
    }
}

fn override_bool(target: &mut bool, env_key: &str) {
    override_parsed(target, env_key, "bool");
}

fn override_usize(target: &mut usize, env_key: &str) {
    override_parsed(target, env_key, "usize");
}

fn override_u16(target: &mut u16, env_key: &str) {
    override_parsed(target, env_key, "u16");
}

fn override_u32(target: &mut u32, env_key: &str) {
    override_parsed(target, env_key, "u32");
}

fn override_u64(target: &mut u64, env_key: &str) {
    override_parsed(target, env_key, "u64");
}

fn override_f64(target: &mut f64, env_key: &str) {
    override_parsed(target, env_key, "f64");
}

fn override_parsed<T: std::str::FromStr>(target: &mut T, env_key: &str, type_name: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<T>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                expected = type_name,
                "failed to parse env var, ignoring"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_values() {
        let config = FlowgateConfig::default();
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.rules.default_action(), Some(Action::Deny));
        assert_eq!(config.flow.max_flows, 100_000);
        assert_eq!(config.anomaly.threshold, 3.0);
        assert_eq!(config.audit.max_backups, 5);
        assert!(config.metrics.enabled);
    }

    #[test]
    fn default_config_passes_validation() {
        FlowgateConfig::default().validate().unwrap();
    }

    #[test]
    fn from_str_empty_toml_uses_defaults() {
        let config = FlowgateConfig::parse("").unwrap();
        assert_eq!(config.pipeline.workers, 4);
        assert_eq!(config.rules.rule_dir, "/etc/flowgate/rules");
    }

    #[test]
    fn from_str_partial_toml_merges_with_defaults() {
        let toml = r#"
[flow]
max_flows = 500

[anomaly]
threshold = 4.5
"#;
        let config = FlowgateConfig::parse(toml).unwrap();
        assert_eq!(config.flow.max_flows, 500);
        // 나머지 필드는 기본값 유지
        assert_eq!(config.flow.idle_timeout_secs, 300);
        assert_eq!(config.anomaly.threshold, 4.5);
        assert_eq!(config.anomaly.window_size, 64);
    }

    #[test]
    fn from_str_invalid_toml_returns_error() {
        let err = FlowgateConfig::parse("invalid = [[[toml").unwrap_err();
        assert!(matches!(
            err,
            FlowgateError::Config(ConfigError::ParseFailed { .. })
        ));
    }

    #[test]
    fn validate_rejects_invalid_log_level() {
        let mut config = FlowgateConfig::default();
        config.general.log_level = "verbose".to_owned();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("log_level"));
    }

    #[test]
    fn validate_rejects_invalid_target_log_level() {
        let mut config = FlowgateConfig::default();
        config.general.audit_log_level = "loud".to_owned();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("general.audit_log_level"));
    }

    #[test]
    fn validate_rejects_unknown_default_action() {
        let mut config = FlowgateConfig::default();
        config.rules.default_action = "maybe".to_owned();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("default_action"));
    }

    #[test]
    fn validate_accepts_explicit_allow_default() {
        let mut config = FlowgateConfig::default();
        config.rules.default_action = "allow".to_owned();
        config.validate().unwrap();
        assert_eq!(config.rules.default_action(), Some(Action::Allow));
    }

    #[test]
    fn validate_rejects_zero_ceiling() {
        let mut config = FlowgateConfig::default();
        config.flow.max_flows = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_flows"));
    }

    #[test]
    fn validate_rejects_non_finite_threshold() {
        let mut config = FlowgateConfig::default();
        config.anomaly.threshold = f64::NAN;
        assert!(config.validate().is_err());
        config.anomaly.threshold = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_window_smaller_than_min_samples() {
        let mut config = FlowgateConfig::default();
        config.anomaly.window_size = 8;
        config.anomaly.min_samples = 16;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("window_size"));
    }

    #[test]
    fn validate_rejects_zero_workers() {
        let mut config = FlowgateConfig::default();
        config.pipeline.workers = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("workers"));
    }

    #[test]
    fn validate_rejects_zero_audit_attempts() {
        let mut config = FlowgateConfig::default();
        config.audit.retry_max_attempts = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("retry_max_attempts"));
    }

    #[test]
    fn env_override_string() {
        let mut val = "original".to_owned();
        // SAFETY: 테스트 전용 키이며 다른 테스트와 공유하지 않습니다.
        unsafe { std::env::set_var("TEST_FLOWGATE_STR", "overridden") };
        override_string(&mut val, "TEST_FLOWGATE_STR");
        assert_eq!(val, "overridden");
        unsafe { std::env::remove_var("TEST_FLOWGATE_STR") };
    }

    #[test]
    fn env_override_f64_valid() {
        let mut val = 3.0_f64;
        // SAFETY: 테스트 전용 키이며 다른 테스트와 공유하지 않습니다.
        unsafe { std::env::set_var("TEST_FLOWGATE_F64", "2.5") };
        override_f64(&mut val, "TEST_FLOWGATE_F64");
        assert_eq!(val, 2.5);
        unsafe { std::env::remove_var("TEST_FLOWGATE_F64") };
    }

    #[test]
    fn env_override_invalid_keeps_original() {
        let mut val = 10_usize;
        // SAFETY: 테스트 전용 키이며 다른 테스트와 공유하지 않습니다.
        unsafe { std::env::set_var("TEST_FLOWGATE_USIZE_BAD", "ten") };
        override_usize(&mut val, "TEST_FLOWGATE_USIZE_BAD");
        assert_eq!(val, 10); // 원래 값 유지
        unsafe { std::env::remove_var("TEST_FLOWGATE_USIZE_BAD") };
    }

    #[test]
    fn env_override_missing_var_keeps_original() {
        let mut val = true;
        override_bool(&mut val, "TEST_FLOWGATE_NONEXISTENT_12345");
        assert!(val);
    }

    #[test]
    fn config_serialize_roundtrip() {
        let config = FlowgateConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed = FlowgateConfig::parse(&toml_str).unwrap();
        assert_eq!(config.flow.max_flows, parsed.flow.max_flows);
        assert_eq!(config.audit.path, parsed.audit.path);
        assert_eq!(config.anomaly.burst_span, parsed.anomaly.burst_span);
    }

    #[tokio::test]
    async fn from_file_not_found() {
        let err = FlowgateConfig::from_file("/nonexistent/path/flowgate.toml")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FlowgateError::Config(ConfigError::FileNotFound { .. })
        ));
    }
}

//! 에러 타입 -- 도메인별 에러 정의
//!
//! 엔진의 에러 분류는 다음과 같이 대응됩니다.
//!
//! | 분류 | 타입 | 처리 |
//! |---|---|---|
//! | 규칙 검증 실패 | [`RuleError`] | 게시 거부, 이전 스냅샷 유지 |
//! | 플로우 수용 한도 초과 | [`FlowError::ResourceExhausted`] | 이벤트 FAILED, verdict 없음 |
//! | 감사 기록 실패 | [`AuditError`] | 제한된 재시도 후 운영 알림, 지연 재시도 큐 |
//! | 잘못된 이벤트 | [`MalformedEvent`] | 진단 태그가 붙은 DENY verdict |

/// Flowgate 최상위 에러 타입
#[derive(Debug, thiserror::Error)]
pub enum FlowgateError {
    /// 설정 관련 에러
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// 파이프라인 처리 에러
    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// 규칙 로딩/검증 에러
    #[error("rule error: {0}")]
    Rule(#[from] RuleError),

    /// 플로우 추적 에러
    #[error("flow error: {0}")]
    Flow(#[from] FlowError),

    /// 감사 기록 에러
    #[error("audit error: {0}")]
    Audit(#[from] AuditError),

    /// 차단 훅 에러
    #[error("enforcement error: {0}")]
    Enforcement(String),

    /// I/O 에러
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// 설정 관련 에러
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// 설정 파일을 찾을 수 없음
    #[error("config file not found: {path}")]
    FileNotFound { path: String },

    /// 설정 파싱 실패
    #[error("failed to parse config: {reason}")]
    ParseFailed { reason: String },

    /// 유효하지 않은 설정 값
    #[error("invalid config value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

/// 파이프라인 처리 에러
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// 채널 전송 실패
    #[error("channel send failed: {0}")]
    ChannelSend(String),

    /// 파이프라인 초기화 실패
    #[error("pipeline init failed: {0}")]
    InitFailed(String),

    /// 이미 실행 중
    #[error("pipeline is already running")]
    AlreadyRunning,

    /// 실행 중이 아님
    #[error("pipeline is not running")]
    NotRunning,

    /// 활성 규칙 스냅샷이 없어 수신이 중단됨
    #[error("intake halted: {0}")]
    IntakeHalted(String),
}

/// 규칙 로딩/검증 에러
///
/// 게시(publish) 시점에 발생하며, 어떤 경우에도 기존 스냅샷은 그대로 유지됩니다.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuleError {
    /// 규칙 파일/디렉토리 로딩 실패
    #[error("rule load error: {path}: {reason}")]
    Load { path: String, reason: String },

    /// 규칙 술어(predicate)가 문법적으로 잘못됨
    #[error("rule validation error: rule '{rule_id}': {reason}")]
    Validation { rule_id: String, reason: String },

    /// 같은 ID를 가진 규칙이 둘 이상
    #[error("duplicate rule id: '{0}'")]
    DuplicateId(String),

    /// 같은 우선순위의 규칙을 ID로 구분할 수 없음
    #[error("ambiguous priority {priority}: {count} rules share it without a tie-break id")]
    AmbiguousPriority { priority: i32, count: usize },

    /// 규칙 수 초과
    #[error("too many rules: {count} (max: {max})")]
    TooMany { count: usize, max: usize },
}

/// 플로우 추적 에러
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FlowError {
    /// 추적 한도에 도달했고 축출 가능한 유휴 플로우가 없음
    #[error("flow table exhausted: {tracked} flows tracked (ceiling: {ceiling}), none evictable")]
    ResourceExhausted { tracked: usize, ceiling: usize },
}

/// 감사 싱크 에러
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// 싱크 I/O 실패
    #[error("audit io error: {0}")]
    Io(#[from] std::io::Error),

    /// verdict 직렬화 실패
    #[error("audit serialize error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// 싱크가 기록을 거부함
    #[error("audit sink rejected append: {0}")]
    Rejected(String),

    /// 재시도 한도 소진
    #[error("audit write failed for event {event_id} after {attempts} attempts: {reason}")]
    WriteFailed {
        event_id: String,
        attempts: u32,
        reason: String,
    },
}

/// 해석할 수 없는 트래픽 이벤트
///
/// 파이프라인 실패로 취급하지 않고 진단 태그가 붙은 DENY verdict로 변환됩니다.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed event: {reason}")]
pub struct MalformedEvent {
    /// 진단 메시지
    pub reason: String,
}

impl MalformedEvent {
    /// 새 진단 에러를 생성합니다.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_error_converts_to_flowgate_error() {
        let err: FlowgateError = RuleError::DuplicateId("r1".to_owned()).into();
        assert!(matches!(err, FlowgateError::Rule(RuleError::DuplicateId(_))));
        assert!(err.to_string().contains("r1"));
    }

    #[test]
    fn resource_exhausted_display() {
        let err = FlowError::ResourceExhausted {
            tracked: 10,
            ceiling: 10,
        };
        let msg = err.to_string();
        assert!(msg.contains("10 flows"));
        assert!(msg.contains("none evictable"));
    }

    #[test]
    fn audit_write_failed_display() {
        let err = AuditError::WriteFailed {
            event_id: "evt-1".to_owned(),
            attempts: 3,
            reason: "disk full".to_owned(),
        };
        let msg = err.to_string();
        assert!(msg.contains("evt-1"));
        assert!(msg.contains("3 attempts"));
        assert!(msg.contains("disk full"));
    }

    #[test]
    fn malformed_event_display() {
        let err = MalformedEvent::new("empty source identity");
        assert_eq!(err.to_string(), "malformed event: empty source identity");
    }

    #[test]
    fn ambiguous_priority_display() {
        let err = RuleError::AmbiguousPriority {
            priority: 5,
            count: 2,
        };
        assert!(err.to_string().contains("priority 5"));
    }
}

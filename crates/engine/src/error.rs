//! 엔진 에러 타입
//!
//! [`EngineError`]는 엔진 내부에서 발생하는 모든 에러를 표현합니다.
//! `From<EngineError> for FlowgateError` 변환이 구현되어 있어
//! 상위 레이어에서 `?` 연산자로 자연스럽게 전파할 수 있습니다.

use flowgate_core::error::{FlowError, FlowgateError, PipelineError, RuleError};

/// 엔진 도메인 에러
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// 규칙 로딩/검증 실패
    #[error(transparent)]
    Rule(#[from] RuleError),

    /// 플로우 수용 실패
    #[error(transparent)]
    Flow(#[from] FlowError),

    /// 활성 스냅샷이 없어 이벤트를 받을 수 없음
    #[error("intake halted: {0}")]
    IntakeHalted(String),

    /// 종료 중 추적 단계 이전에 포기된 이벤트
    #[error("event {event_id} cancelled before tracking")]
    Cancelled {
        /// 포기된 이벤트 ID
        event_id: String,
    },

    /// 설정 에러
    #[error("config error: {field}: {reason}")]
    Config {
        /// 설정 필드명
        field: String,
        /// 에러 사유
        reason: String,
    },

    /// 채널 통신 에러
    #[error("channel error: {0}")]
    Channel(String),

    /// 이미 실행 중
    #[error("pipeline is already running")]
    AlreadyRunning,

    /// 실행 중이 아님
    #[error("pipeline is not running")]
    NotRunning,
}

impl EngineError {
    /// 메트릭/로그 레이블용 짧은 이름
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Rule(_) => "rule",
            Self::Flow(_) => "resource_exhausted",
            Self::IntakeHalted(_) => "intake_halted",
            Self::Cancelled { .. } => "cancelled",
            Self::Config { .. } => "config",
            Self::Channel(_) => "channel",
            Self::AlreadyRunning => "already_running",
            Self::NotRunning => "not_running",
        }
    }
}

impl From<EngineError> for FlowgateError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Rule(e) => FlowgateError::Rule(e),
            EngineError::Flow(e) => FlowgateError::Flow(e),
            EngineError::IntakeHalted(reason) => {
                FlowgateError::Pipeline(PipelineError::IntakeHalted(reason))
            }
            EngineError::AlreadyRunning => FlowgateError::Pipeline(PipelineError::AlreadyRunning),
            EngineError::NotRunning => FlowgateError::Pipeline(PipelineError::NotRunning),
            EngineError::Channel(reason) => {
                FlowgateError::Pipeline(PipelineError::ChannelSend(reason))
            }
            other => FlowgateError::Pipeline(PipelineError::InitFailed(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_error_keeps_its_kind() {
        let err: EngineError = FlowError::ResourceExhausted {
            tracked: 2,
            ceiling: 2,
        }
        .into();
        assert_eq!(err.kind(), "resource_exhausted");
        let top: FlowgateError = err.into();
        assert!(matches!(top, FlowgateError::Flow(_)));
    }

    #[test]
    fn intake_halted_maps_to_pipeline_error() {
        let top: FlowgateError = EngineError::IntakeHalted("no snapshot".to_owned()).into();
        assert!(matches!(
            top,
            FlowgateError::Pipeline(PipelineError::IntakeHalted(_))
        ));
    }

    #[test]
    fn config_error_display() {
        let err = EngineError::Config {
            field: "flow.max_flows".to_owned(),
            reason: "must be at least 1".to_owned(),
        };
        assert!(err.to_string().contains("flow.max_flows"));
    }

    #[test]
    fn cancelled_display_names_event() {
        let err = EngineError::Cancelled {
            event_id: "evt-9".to_owned(),
        };
        assert!(err.to_string().contains("evt-9"));
        assert_eq!(err.kind(), "cancelled");
    }
}

//! 파이프라인 trait -- 생명주기와 외부 협력자 확장 포인트
//!
//! - [`Pipeline`]: 데몬이 관리하는 모듈의 start/stop/health_check 생명주기
//! - [`AuditSink`]: 추가 전용(append-only) 감사 기록
//! - [`EnforcementHook`]: verdict를 실제 차단 동작으로 옮기는 외부 액추에이터

use std::future::Future;

use serde::Serialize;

use crate::error::{AuditError, FlowgateError};
use crate::types::Verdict;

/// 모듈 헬스 상태
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum HealthStatus {
    /// 정상
    Healthy,
    /// 동작하지만 성능/신뢰성이 저하됨
    Degraded(String),
    /// 동작 불가
    Unhealthy(String),
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }

    pub fn is_unhealthy(&self) -> bool {
        matches!(self, Self::Unhealthy(_))
    }
}

/// 데몬이 관리하는 모듈의 생명주기
pub trait Pipeline: Send {
    /// 백그라운드 태스크를 시작합니다.
    fn start(&mut self) -> impl Future<Output = Result<(), FlowgateError>> + Send;

    /// 진행 중인 작업을 정리하고 정지합니다.
    fn stop(&mut self) -> impl Future<Output = Result<(), FlowgateError>> + Send;

    /// 현재 헬스 상태를 보고합니다.
    fn health_check(&self) -> impl Future<Output = HealthStatus> + Send;
}

/// 감사 싱크 -- 내구성 있는 추가 전용 기록
///
/// 엔진은 실패한 기록을 보고 가능한 에러로 취급하며,
/// 제한된 횟수만 재시도합니다.
pub trait AuditSink: Send + Sync + 'static {
    /// verdict 하나를 기록합니다.
    fn append(&self, verdict: &Verdict) -> impl Future<Output = Result<(), AuditError>> + Send;
}

/// 차단 훅 -- 연결 끊기, 패킷 차단 등의 외부 동작
///
/// DECIDED 이후 별도 태스크에서 호출되며, 엔진은 완료를 기다리지 않습니다.
pub trait EnforcementHook: Send + Sync + 'static {
    /// verdict를 집행합니다.
    fn enforce(&self, verdict: &Verdict) -> impl Future<Output = Result<(), FlowgateError>> + Send;
}

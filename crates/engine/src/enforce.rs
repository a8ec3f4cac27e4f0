//! 차단 훅 구현
//!
//! 실제 패킷 차단/연결 종료는 외부 액추에이터의 몫입니다.
//! [`LoggingEnforcer`]는 DENY 판정을 로그로만 남기는 기본 구현입니다.

use std::sync::atomic::{AtomicU64, Ordering};

use flowgate_core::error::FlowgateError;
use flowgate_core::pipeline::EnforcementHook;
use flowgate_core::types::{Action, Verdict};

/// DENY 판정을 `info!`로 기록하는 차단 훅
#[derive(Debug, Default)]
pub struct LoggingEnforcer {
    enforced: AtomicU64,
}

impl LoggingEnforcer {
    pub fn new() -> Self {
        Self::default()
    }

    /// 지금까지 집행한 DENY 수
    pub fn enforced(&self) -> u64 {
        self.enforced.load(Ordering::Relaxed)
    }
}

impl EnforcementHook for LoggingEnforcer {
    async fn enforce(&self, verdict: &Verdict) -> Result<(), FlowgateError> {
        if verdict.outcome != Action::Deny {
            return Ok(());
        }
        self.enforced.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            target: crate::VERDICT_LOG_TARGET,
            event_id = %verdict.event_id,
            flow_key = %verdict.flow,
            rule_id = verdict.matched_rule_id.as_deref().unwrap_or("-"),
            snapshot_version = verdict.snapshot_version,
            "deny enforced"
        );
        Ok(())
    }
}

//! 판정 엔진 -- 매칭 결과와 이상 점수를 하나의 판정으로 합칩니다.
//!
//! # 우선순위
//!
//! | 매칭 | 이상 점수 초과 | 결과 | 태그 |
//! |---|---|---|---|
//! | 해석 불가 | - | DENY | `Malformed` |
//! | DENY (규칙/기본) | 무관 | DENY | |
//! | ALERT 규칙 | 예 | DENY | `Escalated` |
//! | ALLOW (규칙/기본) | 예 | ALLOW | `FlaggedAllow` |
//! | 그 외 | | 매칭 동작 그대로 | |
//!
//! 기본 동작 ALERT는 규칙 매칭이 아니므로 승격되지 않습니다.
//! [`decide`]는 순수 함수이며, 로깅과 메트릭은 호출자가 담당합니다.

use chrono::Utc;

use flowgate_core::types::{Action, FlowKey, Verdict, VerdictTag};

use crate::anomaly::AnomalyResult;
use crate::matcher::MatchResult;

/// 판정 결과 (이벤트 문맥이 붙기 전)
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    /// 최종 동작
    pub outcome: Action,
    /// 매칭된 규칙 ID
    pub matched_rule_id: Option<String>,
    /// 감사용 이상 점수
    pub anomaly: Option<AnomalyResult>,
    /// 주석 태그
    pub tags: Vec<VerdictTag>,
}

impl Decision {
    /// ALERT → DENY 승격 여부
    pub fn is_escalated(&self) -> bool {
        self.tags.contains(&VerdictTag::Escalated)
    }

    /// 이상 점수 초과이지만 허용된 판정인지
    pub fn is_flagged_allow(&self) -> bool {
        self.tags.contains(&VerdictTag::FlaggedAllow)
    }

    /// 이벤트 문맥을 붙여 최종 verdict를 만듭니다.
    pub fn into_verdict(
        self,
        event_id: impl Into<String>,
        flow: FlowKey,
        snapshot_version: u64,
    ) -> Verdict {
        Verdict {
            event_id: event_id.into(),
            flow,
            outcome: self.outcome,
            matched_rule_id: self.matched_rule_id,
            anomaly: self.anomaly,
            snapshot_version,
            decided_at: Utc::now(),
            tags: self.tags,
        }
    }
}

/// 매칭 결과와 이상 점수를 합쳐 판정합니다.
pub fn decide(matched: MatchResult, anomaly: Option<AnomalyResult>) -> Decision {
    let exceeded = anomaly.is_some_and(|a| a.exceeded);

    match matched {
        MatchResult::Malformed { reason } => Decision {
            outcome: Action::Deny,
            matched_rule_id: None,
            anomaly,
            tags: vec![VerdictTag::Malformed(reason)],
        },
        MatchResult::Rule { rule_id, action } => {
            let (outcome, tags) = match (action, exceeded) {
                (Action::Deny, _) => (Action::Deny, Vec::new()),
                (Action::Alert, true) => (Action::Deny, vec![VerdictTag::Escalated]),
                (Action::Allow, true) => (Action::Allow, vec![VerdictTag::FlaggedAllow]),
                (action, false) => (action, Vec::new()),
            };
            Decision {
                outcome,
                matched_rule_id: Some(rule_id),
                anomaly,
                tags,
            }
        }
        MatchResult::Default(action) => {
            let tags = if action == Action::Allow && exceeded {
                vec![VerdictTag::FlaggedAllow]
            } else {
                Vec::new()
            };
            Decision {
                outcome: action,
                matched_rule_id: None,
                anomaly,
                tags,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowgate_core::types::Protocol;

    fn rule(action: Action) -> MatchResult {
        MatchResult::Rule {
            rule_id: "r1".to_owned(),
            action,
        }
    }

    const EXCEEDED: Option<AnomalyResult> = Some(AnomalyResult {
        score: 4.2,
        exceeded: true,
    });
    const CALM: Option<AnomalyResult> = Some(AnomalyResult {
        score: 0.3,
        exceeded: false,
    });

    #[test]
    fn deny_always_wins() {
        for anomaly in [None, CALM, EXCEEDED] {
            let d = decide(rule(Action::Deny), anomaly);
            assert_eq!(d.outcome, Action::Deny);
            assert!(d.tags.is_empty());
        }
        assert_eq!(decide(MatchResult::Default(Action::Deny), EXCEEDED).outcome, Action::Deny);
    }

    #[test]
    fn alert_with_exceeded_anomaly_escalates() {
        let d = decide(rule(Action::Alert), EXCEEDED);
        assert_eq!(d.outcome, Action::Deny);
        assert!(d.is_escalated());
        assert_eq!(d.matched_rule_id.as_deref(), Some("r1"));
        assert_eq!(d.anomaly, EXCEEDED);
    }

    #[test]
    fn alert_without_anomaly_stays_alert() {
        assert_eq!(decide(rule(Action::Alert), CALM).outcome, Action::Alert);
        assert_eq!(decide(rule(Action::Alert), None).outcome, Action::Alert);
    }

    #[test]
    fn allow_with_exceeded_anomaly_is_flagged_not_denied() {
        let d = decide(rule(Action::Allow), EXCEEDED);
        assert_eq!(d.outcome, Action::Allow);
        assert!(d.is_flagged_allow());
        assert!(!d.is_escalated());

        let d = decide(MatchResult::Default(Action::Allow), EXCEEDED);
        assert_eq!(d.outcome, Action::Allow);
        assert!(d.is_flagged_allow());
    }

    #[test]
    fn default_alert_is_not_escalated() {
        let d = decide(MatchResult::Default(Action::Alert), EXCEEDED);
        assert_eq!(d.outcome, Action::Alert);
        assert!(d.tags.is_empty());
    }

    #[test]
    fn malformed_is_denied_with_diagnostic() {
        let d = decide(
            MatchResult::Malformed {
                reason: "empty source identity".to_owned(),
            },
            None,
        );
        assert_eq!(d.outcome, Action::Deny);
        assert_eq!(d.matched_rule_id, None);
        assert_eq!(
            d.tags,
            vec![VerdictTag::Malformed("empty source identity".to_owned())]
        );
    }

    #[test]
    fn into_verdict_carries_context() {
        let key = FlowKey::new("10.0.0.5", "10.0.0.1", Protocol::Tcp);
        let verdict = decide(MatchResult::Default(Action::Deny), None).into_verdict(
            "evt-1",
            key.clone(),
            7,
        );
        assert_eq!(verdict.event_id, "evt-1");
        assert_eq!(verdict.flow, key);
        assert_eq!(verdict.outcome, Action::Deny);
        assert_eq!(verdict.matched_rule_id, None);
        assert_eq!(verdict.snapshot_version, 7);
    }
}

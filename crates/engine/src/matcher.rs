//! 시그니처 매처 -- 이벤트를 스냅샷의 규칙과 대조합니다.
//!
//! [`match_event`]는 `(event, snapshot)`만의 순수 함수입니다. 숨은 상태가 없으므로
//! 같은 스냅샷에 대한 재평가는 항상 같은 결과를 냅니다.

use flowgate_core::event::TrafficEvent;
use flowgate_core::types::Action;

use crate::rule::RuleSnapshot;

/// 매칭 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchResult {
    /// 활성 규칙이 매칭됨
    Rule {
        /// 매칭된 규칙 ID
        rule_id: String,
        /// 규칙 동작
        action: Action,
    },
    /// 매칭된 규칙이 없어 스냅샷 기본 동작 적용
    Default(Action),
    /// 이벤트를 해석할 수 없음
    Malformed {
        /// 진단 메시지
        reason: String,
    },
}

impl MatchResult {
    /// 매칭이 내린 동작. 해석할 수 없는 이벤트는 DENY입니다.
    pub fn action(&self) -> Action {
        match self {
            Self::Rule { action, .. } => *action,
            Self::Default(action) => *action,
            Self::Malformed { .. } => Action::Deny,
        }
    }

    /// 매칭된 규칙 ID
    pub fn rule_id(&self) -> Option<&str> {
        match self {
            Self::Rule { rule_id, .. } => Some(rule_id),
            _ => None,
        }
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::Malformed { .. })
    }
}

/// 이벤트를 스냅샷의 규칙과 대조합니다.
///
/// 규칙은 `(priority, id)` 순서로 평가되며 처음 매칭되는 활성 규칙이 이깁니다.
pub fn match_event(event: &TrafficEvent, snapshot: &RuleSnapshot) -> MatchResult {
    let payload = match event.validate() {
        Ok(payload) => payload,
        Err(e) => {
            return MatchResult::Malformed { reason: e.reason };
        }
    };

    snapshot
        .rules()
        .iter()
        .filter(|rule| rule.enabled)
        .find(|rule| rule.matches(event, &payload))
        .map(|rule| MatchResult::Rule {
            rule_id: rule.id.clone(),
            action: rule.action,
        })
        .unwrap_or(MatchResult::Default(snapshot.default_action()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowgate_core::event::{PayloadDescriptor, PayloadEncoding};
    use flowgate_core::types::Protocol;

    use crate::rule::{PayloadSignature, RuleDef, RuleSet};

    fn snapshot(rules: Vec<RuleDef>, default_action: Action) -> RuleSnapshot {
        RuleSnapshot::from_rule_set(&RuleSet::new(rules).with_default_action(default_action), 1)
            .unwrap()
    }

    #[test]
    fn no_rule_matches_yields_default_deny() {
        let snap = snapshot(
            vec![RuleDef::new("web", 1, Action::Allow).with_source("192.168.0.0/16")],
            Action::Deny,
        );
        let event = TrafficEvent::new("10.0.0.5", "10.0.0.1", Protocol::Tcp, 100);
        let result = match_event(&event, &snap);
        assert_eq!(result, MatchResult::Default(Action::Deny));
        assert_eq!(result.rule_id(), None);
    }

    #[test]
    fn first_match_wins_by_priority() {
        let snap = snapshot(
            vec![
                RuleDef::new("r2-allow", 2, Action::Allow),
                RuleDef::new("r1-deny", 1, Action::Deny),
            ],
            Action::Allow,
        );
        let event = TrafficEvent::new("a", "b", Protocol::Udp, 1);
        assert_eq!(
            match_event(&event, &snap),
            MatchResult::Rule {
                rule_id: "r1-deny".to_owned(),
                action: Action::Deny
            }
        );
    }

    #[test]
    fn priority_tie_broken_by_id() {
        let snap = snapshot(
            vec![
                RuleDef::new("b-allow", 1, Action::Allow),
                RuleDef::new("a-alert", 1, Action::Alert),
            ],
            Action::Deny,
        );
        let event = TrafficEvent::new("a", "b", Protocol::Tcp, 1);
        assert_eq!(match_event(&event, &snap).rule_id(), Some("a-alert"));
    }

    #[test]
    fn disabled_rules_are_skipped() {
        let snap = snapshot(
            vec![
                RuleDef::new("off", 1, Action::Deny).disabled(),
                RuleDef::new("on", 2, Action::Alert),
            ],
            Action::Deny,
        );
        let event = TrafficEvent::new("a", "b", Protocol::Tcp, 1);
        assert_eq!(match_event(&event, &snap).rule_id(), Some("on"));
    }

    #[test]
    fn payload_signature_participates_in_matching() {
        let snap = snapshot(
            vec![RuleDef::new("telnet", 1, Action::Deny)
                .with_payload(PayloadSignature::Contains("login:".to_owned()))],
            Action::Allow,
        );
        let hit = TrafficEvent::new("a", "b", Protocol::Tcp, 6)
            .with_payload(PayloadDescriptor::text("login:"));
        let miss = TrafficEvent::new("a", "b", Protocol::Tcp, 5)
            .with_payload(PayloadDescriptor::text("hello"));

        assert_eq!(match_event(&hit, &snap).action(), Action::Deny);
        assert_eq!(match_event(&miss, &snap), MatchResult::Default(Action::Allow));
    }

    #[test]
    fn malformed_payload_maps_to_deny() {
        let snap = snapshot(vec![RuleDef::new("all", 1, Action::Allow)], Action::Allow);
        let event = TrafficEvent::new("a", "b", Protocol::Tcp, 3).with_payload(PayloadDescriptor {
            encoding: PayloadEncoding::Base64,
            data: "***".to_owned(),
            declared_len: None,
        });
        let result = match_event(&event, &snap);
        assert!(result.is_malformed());
        assert_eq!(result.action(), Action::Deny);
        assert_eq!(result.rule_id(), None);
    }

    #[test]
    fn empty_source_is_malformed() {
        let snap = snapshot(vec![], Action::Allow);
        let event = TrafficEvent::new("", "b", Protocol::Tcp, 3);
        assert_eq!(
            match_event(&event, &snap),
            MatchResult::Malformed {
                reason: "empty source identity".to_owned()
            }
        );
    }

    #[test]
    fn matching_is_deterministic() {
        let snap = snapshot(
            vec![
                RuleDef::new("glob", 5, Action::Alert).with_destination("web-*"),
                RuleDef::new("net", 3, Action::Deny).with_source("172.16.0.0/12"),
            ],
            Action::Allow,
        );
        let event = TrafficEvent::new("172.16.4.4", "web-01", Protocol::Tcp, 10);
        let first = match_event(&event, &snap);
        for _ in 0..100 {
            assert_eq!(match_event(&event, &snap), first);
        }
    }
}

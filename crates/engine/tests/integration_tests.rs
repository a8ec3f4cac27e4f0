//! 통합 테스트 -- 규칙 게시부터 verdict 전달까지 전체 흐름 검증

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use proptest::prelude::*;
use tokio::sync::mpsc;

use flowgate_core::error::FlowError;
use flowgate_core::event::{AlertKind, PayloadDescriptor, TrafficEvent};
use flowgate_core::pipeline::{HealthStatus, Pipeline};
use flowgate_core::types::{Action, FlowKey, Protocol, VerdictTag};
use flowgate_engine::{
    Engine, EngineConfig, EngineError, EventPipeline, EventPipelineBuilder, FlowTracker,
    FlowTrackerConfig, LoggingEnforcer, MatchResult, MemoryAuditSink, PayloadSignature, RuleDef,
    RuleLoader, RuleSet, RuleSnapshot, RuleStore, match_event,
};

type TestEngine = Engine<MemoryAuditSink, LoggingEnforcer>;

fn config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.workers = 4;
    config.queue_capacity = 256;
    config.flow.max_flows = 1_024;
    config
}

fn engine(
    config: &EngineConfig,
    rules: RuleSet,
) -> (TestEngine, Arc<MemoryAuditSink>, mpsc::Receiver<flowgate_core::event::AlertEvent>) {
    let store = Arc::new(RuleStore::new());
    store.publish(rules).unwrap();
    let audit = Arc::new(MemoryAuditSink::new());
    let (alert_tx, alert_rx) = mpsc::channel(64);
    let engine = Engine::new(
        config,
        store,
        Arc::clone(&audit),
        Arc::new(LoggingEnforcer::new()),
        Some(alert_tx),
    );
    (engine, audit, alert_rx)
}

fn tcp(src: &str, dst: &str, size: u64) -> TrafficEvent {
    TrafficEvent::new(src, dst, Protocol::Tcp, size)
}

/// 매칭 규칙이 없고 기본 동작이 DENY이면 규칙 ID 없이 DENY
#[tokio::test]
async fn unmatched_event_gets_default_deny() {
    let rules = RuleSet::new(vec![
        RuleDef::new("allow-internal", 10, Action::Allow).with_source("192.168.0.0/16"),
    ]);
    let (engine, audit, _alerts) = engine(&config(), rules);

    let verdict = engine.process(&tcp("10.0.0.5", "10.0.0.1", 60)).await.unwrap();
    assert_eq!(verdict.outcome, Action::Deny);
    assert_eq!(verdict.matched_rule_id, None);
    assert_eq!(audit.len(), 1);
}

/// 조용하던 출발지에서 1초 안에 1000개 이벤트 + ALERT 규칙 -> DENY로 승격
#[tokio::test]
async fn burst_against_alert_rule_escalates_to_deny() {
    let rules = RuleSet::new(vec![
        RuleDef::new("watch-ssh", 5, Action::Alert)
            .with_source("10.0.0.9")
            .with_protocol(Protocol::Tcp),
    ]);
    let (engine, _audit, _alerts) = engine(&config(), rules);

    let start = Utc::now();
    let mut last = None;
    for i in 0..1_000 {
        let event = tcp("10.0.0.9", "10.0.0.1", 64)
            .with_timestamp(start + TimeDelta::milliseconds(i));
        last = Some(engine.process(&event).await.unwrap());
    }

    let verdict = last.unwrap();
    assert_eq!(verdict.outcome, Action::Deny);
    assert_eq!(verdict.matched_rule_id.as_deref(), Some("watch-ssh"));
    assert!(verdict.anomaly.is_some_and(|a| a.exceeded));
    assert!(verdict.has_tag(&VerdictTag::Escalated));
}

/// 같은 폭주라도 ALLOW 규칙이면 허용되고 표시만 남음
#[tokio::test]
async fn burst_against_allow_rule_is_flagged_not_denied() {
    let rules = RuleSet::new(vec![
        RuleDef::new("allow-backup", 5, Action::Allow).with_source("10.0.0.9"),
    ]);
    let (engine, _audit, _alerts) = engine(&config(), rules);

    let start = Utc::now();
    let mut last = None;
    for i in 0..100 {
        let event = tcp("10.0.0.9", "10.0.0.1", 64)
            .with_timestamp(start + TimeDelta::milliseconds(i));
        last = Some(engine.process(&event).await.unwrap());
    }

    let verdict = last.unwrap();
    assert_eq!(verdict.outcome, Action::Allow);
    assert!(verdict.has_tag(&VerdictTag::FlaggedAllow));
}

/// 한도에 도달했고 축출 가능한 유휴 플로우가 없으면 FAILED, verdict 기록 없음
#[tokio::test]
async fn ceiling_without_idle_flow_fails_event_without_verdict() {
    let mut config = config();
    config.flow.max_flows = 2;
    config.flow.eviction_idle_grace = Duration::from_secs(60);
    let (engine, audit, _alerts) = engine(&config, RuleSet::new(vec![]));

    engine.process(&tcp("a", "x", 1)).await.unwrap();
    engine.process(&tcp("b", "x", 1)).await.unwrap();

    let overflow = tcp("c", "x", 1);
    let err = engine.process(&overflow).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::Flow(FlowError::ResourceExhausted {
            tracked: 2,
            ceiling: 2
        })
    ));
    assert_eq!(audit.len(), 2);
    assert!(audit.entries().iter().all(|v| v.event_id != overflow.id));
    assert_eq!(engine.flows().len(), 2);

    // 이미 추적 중인 키는 계속 처리됨
    engine.process(&tcp("a", "x", 1)).await.unwrap();
}

/// 유휴 유예를 넘긴 플로우는 축출되어 새 키를 수용
#[tokio::test(start_paused = true)]
async fn ceiling_evicts_least_recently_used_idle_flow() {
    let mut config = config();
    config.flow.max_flows = 2;
    config.flow.eviction_idle_grace = Duration::from_secs(1);
    let (engine, _audit, _alerts) = engine(&config, RuleSet::new(vec![]));

    engine.process(&tcp("old", "x", 1)).await.unwrap();
    tokio::time::advance(Duration::from_secs(5)).await;
    engine.process(&tcp("recent", "x", 1)).await.unwrap();
    tokio::time::advance(Duration::from_secs(2)).await;

    engine.process(&tcp("new", "x", 1)).await.unwrap();
    assert!(engine.flows().peek(&FlowKey::new("old", "x", Protocol::Tcp)).is_none());
    assert!(engine.flows().peek(&FlowKey::new("recent", "x", Protocol::Tcp)).is_some());
    assert!(engine.flows().peek(&FlowKey::new("new", "x", Protocol::Tcp)).is_some());
}

/// 두 규칙이 모두 매칭되면 우선순위가 낮은 값(먼저 평가되는) 규칙이 이김
#[tokio::test]
async fn first_match_wins_by_priority() {
    let rules = RuleSet::new(vec![
        RuleDef::new("r2-allow", 2, Action::Allow),
        RuleDef::new("r1-deny", 1, Action::Deny),
    ])
    .with_default_action(Action::Allow);
    let (engine, _audit, _alerts) = engine(&config(), rules);

    let verdict = engine.process(&tcp("10.0.0.5", "10.0.0.1", 60)).await.unwrap();
    assert_eq!(verdict.outcome, Action::Deny);
    assert_eq!(verdict.matched_rule_id.as_deref(), Some("r1-deny"));
}

/// 페이로드 시그니처 매칭과 해석 불가 페이로드 처리
#[tokio::test]
async fn payload_signature_and_malformed_payload() {
    let rules = RuleSet::new(vec![
        RuleDef::new("telnet-login", 1, Action::Deny)
            .with_payload(PayloadSignature::Contains("login:".to_owned())),
        RuleDef::new("allow-rest", 100, Action::Allow),
    ]);
    let (engine, _audit, _alerts) = engine(&config(), rules);

    let hit = tcp("10.0.0.5", "10.0.0.1", 20).with_payload(PayloadDescriptor::text("ubuntu login: "));
    let verdict = engine.process(&hit).await.unwrap();
    assert_eq!(verdict.matched_rule_id.as_deref(), Some("telnet-login"));

    let miss = tcp("10.0.0.6", "10.0.0.1", 20).with_payload(PayloadDescriptor::text("GET /"));
    let verdict = engine.process(&miss).await.unwrap();
    assert_eq!(verdict.outcome, Action::Allow);

    let mut broken = PayloadDescriptor::text("abc");
    broken.declared_len = Some(99);
    let verdict = engine
        .process(&tcp("10.0.0.7", "10.0.0.1", 3).with_payload(broken))
        .await
        .unwrap();
    assert_eq!(verdict.outcome, Action::Deny);
    assert!(verdict.is_malformed());
}

/// 같은 규칙 집합을 다시 게시하면 버전은 오르지만 판정은 같음
#[tokio::test]
async fn republishing_identical_rules_is_operationally_idempotent() {
    let rules = RuleSet::new(vec![
        RuleDef::new("deny-ten", 1, Action::Deny).with_source("10.*"),
        RuleDef::new("alert-udp", 2, Action::Alert).with_protocol(Protocol::Udp),
    ])
    .with_default_action(Action::Allow);

    let store = RuleStore::new();
    let v1 = store.publish(rules.clone()).unwrap();
    let first = store.current_snapshot().unwrap();
    let v2 = store.publish(rules).unwrap();
    let second = store.current_snapshot().unwrap();
    assert_eq!(v2, v1 + 1);

    let events = [
        tcp("10.1.1.1", "x", 1),
        TrafficEvent::new("172.16.0.1", "x", Protocol::Udp, 1),
        tcp("172.16.0.1", "x", 1),
    ];
    for event in &events {
        assert_eq!(match_event(event, &first), match_event(event, &second));
    }
}

/// 잘못된 규칙 게시는 거부되고 기존 스냅샷이 계속 사용됨
#[tokio::test]
async fn rejected_publish_keeps_active_snapshot() {
    let (engine, _audit, _alerts) = engine(
        &config(),
        RuleSet::new(vec![RuleDef::new("allow-all", 1, Action::Allow)]),
    );

    let bad = RuleSet::new(vec![
        RuleDef::new("dup", 1, Action::Deny),
        RuleDef::new("dup", 2, Action::Deny),
    ]);
    assert!(engine.store().publish(bad).is_err());
    assert_eq!(engine.store().current_version(), Some(1));

    let verdict = engine.process(&tcp("10.0.0.5", "x", 1)).await.unwrap();
    assert_eq!(verdict.outcome, Action::Allow);
    assert_eq!(verdict.snapshot_version, 1);
}

/// 동시 평가 중 게시가 일어나도 관측한 버전은 줄어들지 않음
#[test]
fn snapshot_visibility_is_monotonic_under_concurrent_publish() {
    let store = Arc::new(RuleStore::new());
    store.publish(RuleSet::new(vec![])).unwrap();

    let publisher = {
        let store = Arc::clone(&store);
        std::thread::spawn(move || {
            for i in 0..200 {
                let rules = RuleSet::new(vec![RuleDef::new(format!("r{i}"), i, Action::Alert)]);
                store.publish(rules).unwrap();
            }
        })
    };

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                let event = tcp("10.0.0.5", "x", 1);
                let mut observed = 0;
                for _ in 0..2_000 {
                    let snapshot = store.current_snapshot().unwrap();
                    assert!(snapshot.version() >= observed);
                    observed = snapshot.version();
                    let _ = match_event(&event, &snapshot);
                }
            })
        })
        .collect();

    publisher.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }
    assert_eq!(store.current_version(), Some(201));
}

/// 감사 기록이 계속 실패하면 운영 알림 + 지연 재시도, verdict는 반환됨
#[tokio::test(start_paused = true)]
async fn audit_failure_escalates_and_is_retried_later() {
    let (engine, audit, mut alerts) = engine(&config(), RuleSet::new(vec![]));
    audit.set_failing(true);

    let verdict = engine.process(&tcp("10.0.0.5", "x", 1)).await.unwrap();
    assert_eq!(verdict.outcome, Action::Deny);
    assert_eq!(engine.dispatcher().retry_queue_len(), 1);

    let alert = alerts.recv().await.unwrap();
    assert_eq!(alert.kind, AlertKind::AuditWriteFailed);
    assert_eq!(alert.metadata.trace_id, verdict.event_id);

    audit.set_failing(false);
    assert_eq!(engine.dispatcher().drain_retry_queue().await, 1);
    assert_eq!(audit.entries()[0].event_id, verdict.event_id);
}

/// 규칙 디렉토리에서 로드한 규칙으로 평가
#[tokio::test]
async fn rules_loaded_from_directory_drive_verdicts() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("10-block.yml"),
        r#"
id: block-scanner
title: Block known scanner
priority: 10
action: deny
match:
  source: "203.0.113.0/24"
"#,
    )
    .unwrap();
    std::fs::write(
        dir.path().join("20-allow.yaml"),
        r#"
id: allow-web
priority: 20
action: allow
match:
  destination: "10.0.0.80"
  protocol: tcp
"#,
    )
    .unwrap();
    std::fs::write(
        dir.path().join("05-telnet.yml"),
        r#"
id: block-telnet
priority: 5
action: deny
match:
  protocol: tcp
  payload:
    contains: "login:"
"#,
    )
    .unwrap();

    let set = RuleLoader::load_directory(dir.path(), Action::Deny)
        .await
        .unwrap();
    assert_eq!(set.rules.len(), 3);
    let (engine, _audit, _alerts) = engine(&config(), set);

    let verdict = engine.process(&tcp("203.0.113.7", "10.0.0.80", 1)).await.unwrap();
    assert_eq!(verdict.matched_rule_id.as_deref(), Some("block-scanner"));

    let verdict = engine.process(&tcp("198.51.100.1", "10.0.0.80", 1)).await.unwrap();
    assert_eq!(verdict.outcome, Action::Allow);

    let telnet = tcp("198.51.100.2", "10.0.0.80", 14).with_payload(PayloadDescriptor::text("ubuntu login: "));
    let verdict = engine.process(&telnet).await.unwrap();
    assert_eq!(verdict.outcome, Action::Deny);
    assert_eq!(verdict.matched_rule_id.as_deref(), Some("block-telnet"));
}

fn pipeline(
    verdict_tx: mpsc::Sender<flowgate_core::types::Verdict>,
) -> EventPipeline<MemoryAuditSink, LoggingEnforcer> {
    let store = Arc::new(RuleStore::new());
    store.publish(RuleSet::new(vec![])).unwrap();
    let (pipeline, _alert_rx) = EventPipelineBuilder::new()
        .config(config())
        .store(store)
        .audit_sink(Arc::new(MemoryAuditSink::new()))
        .enforcer(Arc::new(LoggingEnforcer::new()))
        .verdict_sender(verdict_tx)
        .build()
        .unwrap();
    pipeline
}

/// 같은 플로우 키의 verdict는 수신 순서대로 나오고, 카운터는 관측 합과 같음
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn verdicts_are_fifo_per_flow_key() {
    let (verdict_tx, mut verdict_rx) = mpsc::channel(1_024);
    let mut pipeline = pipeline(verdict_tx);
    pipeline.start().await.unwrap();
    let intake = pipeline.intake();

    let sources = ["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4", "10.0.0.5"];
    let mut sent: HashMap<String, Vec<String>> = HashMap::new();
    let mut sizes: HashMap<String, u64> = HashMap::new();
    for i in 0..500u64 {
        let src = sources[(i % sources.len() as u64) as usize];
        let event = tcp(src, "10.0.0.100", i + 1);
        sent.entry(src.to_owned()).or_default().push(event.id.clone());
        *sizes.entry(src.to_owned()).or_default() += i + 1;
        intake.send(event).await.unwrap();
    }

    let mut received: HashMap<String, Vec<String>> = HashMap::new();
    for _ in 0..500 {
        let verdict = tokio::time::timeout(Duration::from_secs(10), verdict_rx.recv())
            .await
            .unwrap()
            .unwrap();
        received
            .entry(verdict.flow.source.clone())
            .or_default()
            .push(verdict.event_id);
    }
    assert_eq!(sent, received);

    for src in sources {
        let view = pipeline
            .engine()
            .flows()
            .peek(&FlowKey::new(src, "10.0.0.100", Protocol::Tcp))
            .unwrap();
        assert_eq!(view.packets, 100);
        assert_eq!(view.bytes, sizes[src]);
    }

    assert_eq!(pipeline.health_check().await, HealthStatus::Healthy);
    pipeline.stop().await.unwrap();
}

proptest! {
    /// 같은 스냅샷에 대한 매칭은 결정적
    #[test]
    fn matching_is_deterministic(
        src in "[0-9]{1,3}\\.[0-9]{1,3}\\.[0-9]{1,3}\\.[0-9]{1,3}",
        payload in "[a-z: ]{0,32}",
        udp in any::<bool>(),
    ) {
        let set = RuleSet::new(vec![
            RuleDef::new("deny-10", 1, Action::Deny).with_source("10.0.0.0/8"),
            RuleDef::new("alert-login", 2, Action::Alert)
                .with_payload(PayloadSignature::Contains("login".to_owned())),
            RuleDef::new("allow-udp", 3, Action::Allow).with_protocol(Protocol::Udp),
        ]);
        let snapshot = RuleSnapshot::from_rule_set(&set, 1).unwrap();
        let protocol = if udp { Protocol::Udp } else { Protocol::Tcp };
        let event = TrafficEvent::new(src, "10.0.0.1", protocol, 1)
            .with_payload(PayloadDescriptor::text(payload));

        let first = match_event(&event, &snapshot);
        for _ in 0..3 {
            prop_assert_eq!(&match_event(&event, &snapshot), &first);
        }
    }

    /// 두 규칙이 모두 매칭되면 우선순위 값이 작은 규칙이 이김
    #[test]
    fn lower_priority_value_wins(deny_priority in -100i32..100, gap in 1i32..100) {
        let set = RuleSet::new(vec![
            RuleDef::new("allow", deny_priority + gap, Action::Allow),
            RuleDef::new("deny", deny_priority, Action::Deny),
        ]);
        let snapshot = RuleSnapshot::from_rule_set(&set, 1).unwrap();
        let result = match_event(&TrafficEvent::new("s", "d", Protocol::Tcp, 1), &snapshot);
        prop_assert_eq!(
            result,
            MatchResult::Rule { rule_id: "deny".to_owned(), action: Action::Deny }
        );
    }

    /// 플로우 카운터는 관측한 이벤트 수와 크기 합과 같음
    #[test]
    fn flow_counters_equal_observed_totals(sizes in prop::collection::vec(0u64..10_000, 1..64)) {
        let tracker = FlowTracker::new(FlowTrackerConfig::default());
        let mut last = None;
        for size in &sizes {
            last = Some(tracker.observe(&TrafficEvent::new("s", "d", Protocol::Udp, *size)).unwrap());
        }
        let view = last.unwrap();
        prop_assert_eq!(view.packets, sizes.len() as u64);
        prop_assert_eq!(view.bytes, sizes.iter().sum::<u64>());
    }
}

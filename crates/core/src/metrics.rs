//! 메트릭 상수 및 설명 등록
//!
//! 모든 Prometheus 메트릭의 이름과 설명을 중앙에서 정의합니다.
//! 각 모듈은 이 상수를 사용하여 `metrics::counter!()`, `metrics::gauge!()`,
//! `metrics::histogram!()` 매크로를 호출합니다.
//!
//! # 네이밍 컨벤션
//!
//! - 접두어: `flowgate_`
//! - 컴포넌트명: `rules_`, `flows_`, `anomaly_`, `pipeline_`, `audit_`, `daemon_`
//! - 접미어: `_total` (counter), `_seconds` (histogram/latency), 없음 (gauge)

// ─── 레이블 키 상수 ────────────────────────────────────────────────

/// 판정 결과 레이블 키 (allow, deny, alert)
pub const LABEL_OUTCOME: &str = "outcome";

/// 실패 사유 레이블 키 (resource_exhausted, intake_halted, cancelled)
pub const LABEL_REASON: &str = "reason";

// ─── Rule Store 메트릭 ─────────────────────────────────────────────

/// 현재 활성 스냅샷 버전 (gauge)
pub const RULES_SNAPSHOT_VERSION: &str = "flowgate_rules_snapshot_version";

/// 활성 스냅샷의 규칙 수 (gauge)
pub const RULES_LOADED: &str = "flowgate_rules_loaded";

/// 검증 실패로 거부된 게시 수 (counter)
pub const RULES_PUBLISH_REJECTED_TOTAL: &str = "flowgate_rules_publish_rejected_total";

/// 아직 참조가 남아 있는 이전 스냅샷 수 (gauge)
pub const RULES_RETAINED_SNAPSHOTS: &str = "flowgate_rules_retained_snapshots";

// ─── Flow Tracker 메트릭 ───────────────────────────────────────────

/// 추적 중인 플로우 수 (gauge)
pub const FLOWS_TRACKED: &str = "flowgate_flows_tracked";

/// 한도 도달로 축출된 플로우 수 (counter)
pub const FLOWS_EVICTED_TOTAL: &str = "flowgate_flows_evicted_total";

/// 유휴 만료로 정리된 플로우 수 (counter)
pub const FLOWS_REAPED_TOTAL: &str = "flowgate_flows_reaped_total";

/// 수용 거부 수 (counter)
pub const FLOWS_ADMISSION_REJECTED_TOTAL: &str = "flowgate_flows_admission_rejected_total";

// ─── Anomaly Scorer 메트릭 ─────────────────────────────────────────

/// 임계값을 넘은 점수 수 (counter)
pub const ANOMALY_EXCEEDED_TOTAL: &str = "flowgate_anomaly_exceeded_total";

/// 추적 중인 출발지 윈도우 수 (gauge)
pub const ANOMALY_SOURCES_TRACKED: &str = "flowgate_anomaly_sources_tracked";

// ─── Event Pipeline 메트릭 ─────────────────────────────────────────

/// 수신된 이벤트 수 (counter)
pub const PIPELINE_EVENTS_RECEIVED_TOTAL: &str = "flowgate_pipeline_events_received_total";

/// 결과별 verdict 수 (counter, label: outcome)
pub const PIPELINE_VERDICTS_TOTAL: &str = "flowgate_pipeline_verdicts_total";

/// FAILED 처리된 이벤트 수 (counter, label: reason)
pub const PIPELINE_EVENTS_FAILED_TOTAL: &str = "flowgate_pipeline_events_failed_total";

/// 진단 태그가 붙은 DENY 수 (counter)
pub const PIPELINE_MALFORMED_TOTAL: &str = "flowgate_pipeline_malformed_total";

/// ALERT → DENY 승격 수 (counter)
pub const PIPELINE_ESCALATIONS_TOTAL: &str = "flowgate_pipeline_escalations_total";

/// 이상 점수를 넘었지만 허용된 수 (counter)
pub const PIPELINE_FLAGGED_ALLOWS_TOTAL: &str = "flowgate_pipeline_flagged_allows_total";

/// 이벤트 평가 지연 시간 (histogram, 초)
pub const PIPELINE_EVALUATION_DURATION_SECONDS: &str =
    "flowgate_pipeline_evaluation_duration_seconds";

/// 차단 훅 실패 수 (counter)
pub const PIPELINE_ENFORCEMENT_FAILURES_TOTAL: &str =
    "flowgate_pipeline_enforcement_failures_total";

/// 수신 단계에서 해석 불가로 버려진 줄 수 (counter)
pub const PIPELINE_INTAKE_REJECTED_TOTAL: &str = "flowgate_pipeline_intake_rejected_total";

// ─── Audit 메트릭 ──────────────────────────────────────────────────

/// 재시도 소진 후 기록 실패 수 (counter)
pub const AUDIT_WRITE_FAILURES_TOTAL: &str = "flowgate_audit_write_failures_total";

/// 지연 재시도 큐 깊이 (gauge)
pub const AUDIT_RETRY_QUEUE_DEPTH: &str = "flowgate_audit_retry_queue_depth";

/// 큐가 가득 차 버려진 verdict 수 (counter)
pub const AUDIT_RETRY_DROPPED_TOTAL: &str = "flowgate_audit_retry_dropped_total";

// ─── Daemon 메트릭 ─────────────────────────────────────────────────

/// 가동 시간 (gauge, 초)
pub const DAEMON_UPTIME_SECONDS: &str = "flowgate_daemon_uptime_seconds";

/// 빌드 정보 (gauge, 항상 1, label: version)
pub const DAEMON_BUILD_INFO: &str = "flowgate_daemon_build_info";

// ─── 히스토그램 버킷 정의 ──────────────────────────────────────────

/// 이벤트 평가 지연 시간 히스토그램 버킷 (초)
///
/// 10us ~ 1s 범위
pub const EVALUATION_DURATION_BUCKETS: [f64; 10] = [
    0.00001, 0.00005, 0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 1.0,
];

// ─── 설명 등록 함수 ────────────────────────────────────────────────

/// 모든 메트릭의 설명(description)을 등록합니다.
///
/// 전역 레코더 설치 후 한 번만 호출해야 합니다.
pub fn describe_all() {
    use metrics::{describe_counter, describe_gauge, describe_histogram};

    // Rule Store
    describe_gauge!(
        RULES_SNAPSHOT_VERSION,
        "Version of the currently active rule snapshot"
    );
    describe_gauge!(RULES_LOADED, "Number of rules in the active snapshot");
    describe_counter!(
        RULES_PUBLISH_REJECTED_TOTAL,
        "Total number of rule publications rejected by validation"
    );
    describe_gauge!(
        RULES_RETAINED_SNAPSHOTS,
        "Superseded rule snapshots still referenced by in-flight evaluations"
    );

    // Flow Tracker
    describe_gauge!(FLOWS_TRACKED, "Number of flows currently tracked");
    describe_counter!(
        FLOWS_EVICTED_TOTAL,
        "Total number of idle flows evicted to admit new flows at the ceiling"
    );
    describe_counter!(
        FLOWS_REAPED_TOTAL,
        "Total number of flows removed after the idle timeout"
    );
    describe_counter!(
        FLOWS_ADMISSION_REJECTED_TOTAL,
        "Total number of events rejected because no flow was evictable"
    );

    // Anomaly Scorer
    describe_counter!(
        ANOMALY_EXCEEDED_TOTAL,
        "Total number of anomaly scores at or above the threshold"
    );
    describe_gauge!(
        ANOMALY_SOURCES_TRACKED,
        "Number of source identities with a live sliding window"
    );

    // Event Pipeline
    describe_counter!(
        PIPELINE_EVENTS_RECEIVED_TOTAL,
        "Total number of traffic events received by the pipeline"
    );
    describe_counter!(PIPELINE_VERDICTS_TOTAL, "Total number of verdicts by outcome");
    describe_counter!(
        PIPELINE_EVENTS_FAILED_TOTAL,
        "Total number of events that ended in the FAILED state"
    );
    describe_counter!(
        PIPELINE_MALFORMED_TOTAL,
        "Total number of malformed events denied with a diagnostic tag"
    );
    describe_counter!(
        PIPELINE_ESCALATIONS_TOTAL,
        "Total number of ALERT matches escalated to DENY by anomaly"
    );
    describe_counter!(
        PIPELINE_FLAGGED_ALLOWS_TOTAL,
        "Total number of ALLOW verdicts flagged by anomaly but still permitted"
    );
    describe_histogram!(
        PIPELINE_EVALUATION_DURATION_SECONDS,
        "Time from receipt to decision for a single event in seconds"
    );
    describe_counter!(
        PIPELINE_ENFORCEMENT_FAILURES_TOTAL,
        "Total number of enforcement hook failures"
    );
    describe_counter!(
        PIPELINE_INTAKE_REJECTED_TOTAL,
        "Total number of intake lines rejected before entering the pipeline"
    );

    // Audit
    describe_counter!(
        AUDIT_WRITE_FAILURES_TOTAL,
        "Total number of audit appends that failed after bounded retries"
    );
    describe_gauge!(
        AUDIT_RETRY_QUEUE_DEPTH,
        "Number of verdicts waiting for a delayed audit retry"
    );
    describe_counter!(
        AUDIT_RETRY_DROPPED_TOTAL,
        "Total number of verdicts dropped from a full audit retry queue"
    );

    // Daemon
    describe_gauge!(DAEMON_UPTIME_SECONDS, "Flowgate daemon uptime in seconds");
    describe_gauge!(
        DAEMON_BUILD_INFO,
        "Build information (always 1, with version label)"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_METRIC_NAMES: &[&str] = &[
        RULES_SNAPSHOT_VERSION,
        RULES_LOADED,
        RULES_PUBLISH_REJECTED_TOTAL,
        RULES_RETAINED_SNAPSHOTS,
        FLOWS_TRACKED,
        FLOWS_EVICTED_TOTAL,
        FLOWS_REAPED_TOTAL,
        FLOWS_ADMISSION_REJECTED_TOTAL,
        ANOMALY_EXCEEDED_TOTAL,
        ANOMALY_SOURCES_TRACKED,
        PIPELINE_EVENTS_RECEIVED_TOTAL,
        PIPELINE_VERDICTS_TOTAL,
        PIPELINE_EVENTS_FAILED_TOTAL,
        PIPELINE_MALFORMED_TOTAL,
        PIPELINE_ESCALATIONS_TOTAL,
        PIPELINE_FLAGGED_ALLOWS_TOTAL,
        PIPELINE_EVALUATION_DURATION_SECONDS,
        PIPELINE_ENFORCEMENT_FAILURES_TOTAL,
        PIPELINE_INTAKE_REJECTED_TOTAL,
        AUDIT_WRITE_FAILURES_TOTAL,
        AUDIT_RETRY_QUEUE_DEPTH,
        AUDIT_RETRY_DROPPED_TOTAL,
        DAEMON_UPTIME_SECONDS,
        DAEMON_BUILD_INFO,
    ];

    #[test]
    fn all_metrics_start_with_flowgate_prefix() {
        for name in ALL_METRIC_NAMES {
            assert!(
                name.starts_with("flowgate_"),
                "Metric '{}' does not start with 'flowgate_' prefix",
                name
            );
        }
    }

    #[test]
    fn metric_names_are_unique() {
        let mut names = ALL_METRIC_NAMES.to_vec();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), ALL_METRIC_NAMES.len());
    }

    #[test]
    fn counters_end_with_total() {
        for name in ALL_METRIC_NAMES {
            if name.contains("_total") {
                assert!(name.ends_with("_total"), "'{}' misplaces _total", name);
            }
        }
    }

    #[test]
    fn describe_all_does_not_panic() {
        // 레코더가 설치되지 않아도 패닉하지 않아야 함
        describe_all();
    }

    #[test]
    fn evaluation_duration_buckets_are_sorted() {
        let buckets = EVALUATION_DURATION_BUCKETS;
        for i in 1..buckets.len() {
            assert!(buckets[i] > buckets[i - 1]);
        }
    }
}

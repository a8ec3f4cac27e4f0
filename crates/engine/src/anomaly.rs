//! 이상 점수기 -- 출발지 식별자별 슬라이딩 윈도우 통계
//!
//! 출발지 하나가 여러 플로우에 걸쳐 보이는 도착 간격과 전송 크기를 모읍니다.
//!
//! # 점수
//! 기준선의 중심 μ는 중앙값, 척도 σ는 MAD(중앙값 절대 편차)에 1.4826을 곱한 값입니다.
//! 몇 개의 튀는 샘플이 기준선을 흔들지 못하게 하기 위함입니다.
//!
//! - 속도 편차: 최근 `burst_span`개 간격의 평균 r로 `(μ - r) / max(σ, 0.25μ)`.
//!   빨라질수록 커집니다.
//! - 크기 편차: 학습된 크기 기준선에 대해 위쪽으로만 `(x - μ) / max(σ, 0.25μ)`.
//! - 점수는 두 값과 0 중 최댓값이며, `threshold` 이상이면 초과입니다.
//!
//! 간격 기준선이 `min_samples`개 미만이면 `prior_interarrival`을 중심값으로,
//! 그 1/4을 척도로 가정합니다. 따라서 조용하던 출발지의 급격한 폭주도
//! 첫 `burst_span`개 간격이 모이는 즉시 감지됩니다.
//!
//! 초과 샘플은 기준선에 넣지 않습니다. 초과가 `rebaseline_after`번 연속되면
//! 그동안 모은 샘플을 새 기준선으로 채택합니다.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use flowgate_core::event::TrafficEvent;
use flowgate_core::metrics as m;
use flowgate_core::types::AnomalyScore;

use crate::config::ScorerConfig;
use crate::flow::FlowView;

/// 점수 결과 `{score, exceeded}`
pub type AnomalyResult = AnomalyScore;

/// 척도 하한
const MIN_DEVIATION: f64 = 1e-9;

/// 중심값 대비 척도 하한 비율
const DEVIATION_FLOOR_RATIO: f64 = 0.25;

/// 정규분포에서 MAD를 표준편차로 환산하는 계수
const MAD_SCALE: f64 = 1.4826;

/// 고정 크기 샘플 버퍼
#[derive(Debug, Default)]
struct Samples {
    values: VecDeque<f64>,
    capacity: usize,
}

impl Samples {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            values: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, value: f64) {
        if self.values.len() == self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(value);
    }

    fn len(&self) -> usize {
        self.values.len()
    }

    fn clear(&mut self) {
        self.values.clear();
    }

    fn mean(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        self.values.iter().sum::<f64>() / self.values.len() as f64
    }

    /// (중앙값, MAD 척도)
    fn median_scale(&self) -> (f64, f64) {
        let mut sorted: Vec<f64> = self.values.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);
        let median = median_of_sorted(&sorted);

        let mut deviations: Vec<f64> = sorted.iter().map(|v| (v - median).abs()).collect();
        deviations.sort_by(f64::total_cmp);
        (median, MAD_SCALE * median_of_sorted(&deviations))
    }
}

fn median_of_sorted(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    match n {
        0 => 0.0,
        _ if n % 2 == 1 => sorted[n / 2],
        _ => (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0,
    }
}

/// 출발지 하나의 윈도우
#[derive(Debug)]
struct SourceWindow {
    last_event_at: Option<DateTime<Utc>>,
    last_touched: Instant,
    baseline_gaps: Samples,
    baseline_sizes: Samples,
    recent_gaps: Samples,
    /// 연속 초과 구간에 모은 샘플 (재기준 후보)
    pending_gaps: Samples,
    pending_sizes: Samples,
    anomalous_streak: u64,
    retired: bool,
}

impl SourceWindow {
    fn new(config: &ScorerConfig, now: Instant) -> Self {
        Self {
            last_event_at: None,
            last_touched: now,
            baseline_gaps: Samples::with_capacity(config.window_size),
            baseline_sizes: Samples::with_capacity(config.window_size),
            recent_gaps: Samples::with_capacity(config.burst_span),
            pending_gaps: Samples::with_capacity(config.window_size),
            pending_sizes: Samples::with_capacity(config.window_size),
            anomalous_streak: 0,
            retired: false,
        }
    }
}

/// 편차를 중심값 대비 하한이 적용된 척도로 정규화합니다.
fn normalized(delta: f64, center: f64, scale: f64) -> f64 {
    let denom = scale.max(DEVIATION_FLOOR_RATIO * center.abs()).max(MIN_DEVIATION);
    delta / denom
}

type WindowSlot = Arc<Mutex<SourceWindow>>;

/// 이상 점수기
pub struct AnomalyScorer {
    windows: DashMap<String, WindowSlot>,
    config: ScorerConfig,
}

impl AnomalyScorer {
    pub fn new(config: ScorerConfig) -> Self {
        Self {
            windows: DashMap::new(),
            config,
        }
    }

    /// 이벤트를 출발지 윈도우에 반영하고 점수를 계산합니다.
    ///
    /// 윈도우 갱신과 점수 계산은 출발지 잠금 하나 안에서 함께 수행됩니다.
    pub fn score(&self, event: &TrafficEvent, flow: &FlowView) -> AnomalyResult {
        let source = flow.key.source.as_str();

        loop {
            let now = Instant::now();
            let slot = self.slot(source, now);
            let mut window = slot.lock();
            if window.retired {
                continue;
            }
            window.last_touched = now;
            let result = self.update(&mut window, event);

            if result.exceeded {
                metrics::counter!(m::ANOMALY_EXCEEDED_TOTAL).increment(1);
                debug!(
                    source,
                    score = result.score,
                    flow_packets = flow.packets,
                    "anomaly threshold exceeded"
                );
            }
            return result;
        }
    }

    fn slot(&self, source: &str, now: Instant) -> WindowSlot {
        if let Some(entry) = self.windows.get(source) {
            return Arc::clone(entry.value());
        }
        let slot = Arc::clone(
            self.windows
                .entry(source.to_owned())
                .or_insert_with(|| Arc::new(Mutex::new(SourceWindow::new(&self.config, now))))
                .value(),
        );
        metrics::gauge!(m::ANOMALY_SOURCES_TRACKED).set(self.windows.len() as f64);
        slot
    }

    fn update(&self, window: &mut SourceWindow, event: &TrafficEvent) -> AnomalyResult {
        let cfg = &self.config;

        let gap_ms = window.last_event_at.map(|prev| {
            (event.timestamp - prev)
                .to_std()
                .map(|d| d.as_secs_f64() * 1000.0)
                .unwrap_or(0.0)
        });
        if window.last_event_at.is_none_or(|prev| event.timestamp > prev) {
            window.last_event_at = Some(event.timestamp);
        }
        if let Some(gap) = gap_ms {
            window.recent_gaps.push(gap);
        }
        let size = event.size as f64;

        let rate_z = if window.recent_gaps.len() >= cfg.burst_span {
            let (mu, sigma) = if window.baseline_gaps.len() >= cfg.min_samples {
                window.baseline_gaps.median_scale()
            } else {
                let prior = cfg.prior_interarrival.as_secs_f64() * 1000.0;
                (prior, DEVIATION_FLOOR_RATIO * prior)
            };
            normalized(mu - window.recent_gaps.mean(), mu, sigma)
        } else {
            0.0
        };

        let size_z = if window.baseline_sizes.len() >= cfg.min_samples {
            let (mu, sigma) = window.baseline_sizes.median_scale();
            normalized(size - mu, mu, sigma)
        } else {
            0.0
        };

        let score = rate_z.max(size_z).max(0.0);
        let exceeded = score >= cfg.threshold;

        if exceeded {
            window.anomalous_streak += 1;
            if let Some(gap) = gap_ms {
                window.pending_gaps.push(gap);
            }
            window.pending_sizes.push(size);

            if window.anomalous_streak >= cfg.rebaseline_after {
                std::mem::swap(&mut window.baseline_gaps, &mut window.pending_gaps);
                std::mem::swap(&mut window.baseline_sizes, &mut window.pending_sizes);
                window.pending_gaps.clear();
                window.pending_sizes.clear();
                window.anomalous_streak = 0;
                info!(
                    source = %event.source,
                    samples = window.baseline_gaps.len(),
                    "sustained deviation adopted as new baseline"
                );
            }
        } else {
            window.anomalous_streak = 0;
            window.pending_gaps.clear();
            window.pending_sizes.clear();
            if let Some(gap) = gap_ms {
                window.baseline_gaps.push(gap);
            }
            window.baseline_sizes.push(size);
        }

        AnomalyResult { score, exceeded }
    }

    /// `source_idle` 동안 이벤트가 없던 출발지 윈도우를 제거합니다.
    pub fn prune_idle(&self, now: Instant) -> usize {
        let idle = self.config.source_idle;

        let candidates: Vec<(String, WindowSlot)> = self
            .windows
            .iter()
            .filter(|entry| {
                entry.value().try_lock().is_some_and(|w| {
                    !w.retired && now.saturating_duration_since(w.last_touched) >= idle
                })
            })
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        let mut pruned = 0;
        for (source, slot) in candidates {
            let mut window = slot.lock();
            if window.retired || now.saturating_duration_since(window.last_touched) < idle {
                continue;
            }
            window.retired = true;
            if self
                .windows
                .remove_if(&source, |_, v| Arc::ptr_eq(v, &slot))
                .is_some()
            {
                pruned += 1;
            }
        }

        metrics::gauge!(m::ANOMALY_SOURCES_TRACKED).set(self.windows.len() as f64);
        if pruned > 0 {
            debug!(pruned, "idle source windows pruned");
        }
        pruned
    }

    /// 윈도우가 있는 출발지 수
    pub fn sources(&self) -> usize {
        self.windows.len()
    }
}

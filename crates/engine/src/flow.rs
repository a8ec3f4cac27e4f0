//! 플로우 추적기 -- `(source, destination, protocol)` 단위 상태 관리
//!
//! 각 플로우는 자기만의 `Mutex<FlowState>`를 가지며, 전역 잠금은 없습니다.
//! 관측(observe), 정리(reap), 축출(evict), 종료(close)는 모두 같은 플로우 잠금을
//! 잡고 상태를 바꾸므로 서로 경합하지 않습니다.
//!
//! # 잠금 순서
//! 플로우 잠금을 기다리는 동안에는 절대 맵 참조를 붙잡지 않습니다.
//! 맵에서 `Arc`를 복제해 참조를 놓은 뒤에 플로우 잠금을 잡습니다.
//! 맵을 순회하며 플로우를 검사할 때는 `try_lock`만 사용합니다.
//!
//! 잠금을 얻었는데 슬롯이 `retired` 상태라면, 그 사이 정리/축출된 것이므로
//! 맵을 다시 조회해 새 슬롯을 만듭니다.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use flowgate_core::error::FlowError;
use flowgate_core::event::TrafficEvent;
use flowgate_core::metrics as m;
use flowgate_core::types::{Action, FlowKey};

use crate::config::FlowTrackerConfig;

/// 축출 후보 재탐색 횟수
const EVICTION_ATTEMPTS: usize = 3;

/// 플로우 하나의 가변 상태
#[derive(Debug)]
struct FlowState {
    first_seen: Instant,
    first_seen_at: DateTime<Utc>,
    last_seen: Instant,
    packets: u64,
    bytes: u64,
    last_verdict: Option<Action>,
    /// 맵에서 제거됨. 이 슬롯을 잡은 관측자는 다시 조회해야 합니다.
    retired: bool,
}

impl FlowState {
    fn new(now: Instant) -> Self {
        Self {
            first_seen: now,
            first_seen_at: Utc::now(),
            last_seen: now,
            packets: 0,
            bytes: 0,
            last_verdict: None,
            retired: false,
        }
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_seen)
    }
}

/// 관측 직후의 읽기 전용 플로우 뷰
#[derive(Debug, Clone, PartialEq)]
pub struct FlowView {
    /// 플로우 키
    pub key: FlowKey,
    /// 최초 관측 시각
    pub first_seen_at: DateTime<Utc>,
    /// 이번 이벤트를 포함한 패킷 수
    pub packets: u64,
    /// 이번 이벤트를 포함한 바이트 수
    pub bytes: u64,
    /// 직전 이벤트의 판정
    pub prior_verdict: Option<Action>,
    /// 같은 플로우의 직전 이벤트 이후 경과 시간 (첫 이벤트면 None)
    pub since_last: Option<Duration>,
    /// 플로우 수명
    pub age: Duration,
}

type FlowSlot = Arc<Mutex<FlowState>>;

/// 플로우 추적기
pub struct FlowTracker {
    flows: DashMap<FlowKey, FlowSlot>,
    /// 새 플로우 수용 직렬화 (한도 검사 + 축출 + 삽입)
    admission: Mutex<()>,
    config: FlowTrackerConfig,
}

impl FlowTracker {
    pub fn new(config: FlowTrackerConfig) -> Self {
        Self {
            flows: DashMap::new(),
            admission: Mutex::new(()),
            config,
        }
    }

    /// 이벤트를 플로우에 반영하고 읽기 전용 뷰를 반환합니다.
    ///
    /// # Errors
    /// 새 플로우를 수용해야 하는데 한도에 도달했고 축출 가능한 유휴 플로우가 없으면
    /// [`FlowError::ResourceExhausted`]를 반환합니다. 이 경우 상태는 바뀌지 않습니다.
    pub fn observe(&self, event: &TrafficEvent) -> Result<FlowView, FlowError> {
        let key = event.flow_key();

        loop {
            let now = Instant::now();
            let existing = self.flows.get(&key).map(|entry| Arc::clone(entry.value()));
            let slot = match existing {
                Some(slot) => slot,
                None => self.admit(&key, now)?,
            };

            let mut state = slot.lock();
            if state.retired {
                continue;
            }

            let since_last = (state.packets > 0).then(|| state.idle_for(now));
            state.packets += 1;
            state.bytes = state.bytes.saturating_add(event.size);
            state.last_seen = now;

            return Ok(FlowView {
                key,
                first_seen_at: state.first_seen_at,
                packets: state.packets,
                bytes: state.bytes,
                prior_verdict: state.last_verdict,
                since_last,
                age: now.saturating_duration_since(state.first_seen),
            });
        }
    }

    /// 새 플로우 슬롯을 만들어 등록합니다. 한도에 도달했으면 먼저 하나를 축출합니다.
    fn admit(&self, key: &FlowKey, now: Instant) -> Result<FlowSlot, FlowError> {
        let _admission = self.admission.lock();

        // 다른 관측자가 먼저 만들었을 수 있음
        if let Some(entry) = self.flows.get(key) {
            return Ok(Arc::clone(entry.value()));
        }

        if self.flows.len() >= self.config.max_flows {
            self.evict_one(now)?;
        }

        let slot = Arc::new(Mutex::new(FlowState::new(now)));
        self.flows.insert(key.clone(), Arc::clone(&slot));
        metrics::gauge!(m::FLOWS_TRACKED).set(self.flows.len() as f64);
        debug!(flow_key = %key, "flow admitted");
        Ok(slot)
    }

    /// 가장 오래 유휴 상태인 축출 가능 플로우 하나를 제거합니다.
    ///
    /// 축출 가능 조건: 잠금이 비어 있고 `eviction_idle_grace` 이상 유휴.
    fn evict_one(&self, now: Instant) -> Result<(), FlowError> {
        let grace = self.config.eviction_idle_grace;

        for _ in 0..EVICTION_ATTEMPTS {
            let mut victim: Option<(FlowKey, FlowSlot, Instant)> = None;
            for entry in self.flows.iter() {
                let Some(state) = entry.value().try_lock() else {
                    continue;
                };
                if state.retired || state.idle_for(now) < grace {
                    continue;
                }
                if victim
                    .as_ref()
                    .is_none_or(|(_, _, last_seen)| state.last_seen < *last_seen)
                {
                    victim = Some((entry.key().clone(), Arc::clone(entry.value()), state.last_seen));
                }
            }

            let Some((key, slot, _)) = victim else {
                break;
            };

            let mut state = slot.lock();
            if state.retired || state.idle_for(now) < grace {
                // 순회와 잠금 사이에 다시 사용됨
                continue;
            }
            state.retired = true;
            self.flows.remove_if(&key, |_, v| Arc::ptr_eq(v, &slot));
            drop(state);

            metrics::counter!(m::FLOWS_EVICTED_TOTAL).increment(1);
            debug!(flow_key = %key, "idle flow evicted at ceiling");
            return Ok(());
        }

        metrics::counter!(m::FLOWS_ADMISSION_REJECTED_TOTAL).increment(1);
        Err(FlowError::ResourceExhausted {
            tracked: self.flows.len(),
            ceiling: self.config.max_flows,
        })
    }

    /// 플로우의 최신 판정을 기록합니다.
    pub fn record_verdict(&self, key: &FlowKey, outcome: Action) {
        let slot = self.flows.get(key).map(|entry| Arc::clone(entry.value()));
        if let Some(slot) = slot {
            let mut state = slot.lock();
            if !state.retired {
                state.last_verdict = Some(outcome);
            }
        }
    }

    /// 세션 종료 등으로 플로우를 명시적으로 제거합니다.
    pub fn close(&self, key: &FlowKey) -> bool {
        let Some(slot) = self.flows.get(key).map(|entry| Arc::clone(entry.value())) else {
            return false;
        };

        let mut state = slot.lock();
        if state.retired {
            return false;
        }
        state.retired = true;
        let removed = self
            .flows
            .remove_if(key, |_, v| Arc::ptr_eq(v, &slot))
            .is_some();
        drop(state);

        metrics::gauge!(m::FLOWS_TRACKED).set(self.flows.len() as f64);
        debug!(flow_key = %key, "flow closed");
        removed
    }

    /// `idle_timeout`을 넘긴 플로우를 제거하고 제거한 수를 반환합니다.
    ///
    /// 사용 중인(잠긴) 플로우는 이번 주기에서 건너뜁니다.
    pub fn reap_idle(&self, now: Instant) -> usize {
        let timeout = self.config.idle_timeout;

        let candidates: Vec<(FlowKey, FlowSlot)> = self
            .flows
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .try_lock()
                    .is_some_and(|state| !state.retired && state.idle_for(now) >= timeout)
            })
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        let mut reaped = 0;
        for (key, slot) in candidates {
            let mut state = slot.lock();
            if state.retired || state.idle_for(now) < timeout {
                continue;
            }
            state.retired = true;
            if self
                .flows
                .remove_if(&key, |_, v| Arc::ptr_eq(v, &slot))
                .is_some()
            {
                reaped += 1;
            }
        }

        if reaped > 0 {
            metrics::counter!(m::FLOWS_REAPED_TOTAL).increment(reaped as u64);
            debug!(reaped, remaining = self.flows.len(), "idle flows reaped");
        }
        metrics::gauge!(m::FLOWS_TRACKED).set(self.flows.len() as f64);
        reaped
    }

    /// 주기적으로 유휴 플로우를 정리하는 백그라운드 태스크를 시작합니다.
    pub fn spawn_reaper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let tracker = Arc::clone(self);
        let period = self.config.reap_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // 첫 tick은 즉시 발생
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        tracker.reap_idle(Instant::now());
                    }
                }
            }
            info!("flow reaper stopped");
        })
    }

    /// 특정 플로우의 현재 상태 (관측 없이 조회)
    pub fn peek(&self, key: &FlowKey) -> Option<FlowView> {
        let slot = self.flows.get(key).map(|entry| Arc::clone(entry.value()))?;
        let state = slot.lock();
        if state.retired {
            return None;
        }
        let now = Instant::now();
        Some(FlowView {
            key: key.clone(),
            first_seen_at: state.first_seen_at,
            packets: state.packets,
            bytes: state.bytes,
            prior_verdict: state.last_verdict,
            since_last: None,
            age: now.saturating_duration_since(state.first_seen),
        })
    }

    /// 추적 중인 플로우 수
    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// 추적 한도
    pub fn ceiling(&self) -> usize {
        self.config.max_flows
    }

    /// 한도 대비 사용률 (0.0 ~ 1.0)
    pub fn occupancy(&self) -> f64 {
        self.flows.len() as f64 / self.config.max_flows.max(1) as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowgate_core::types::Protocol;

    fn config(max_flows: usize) -> FlowTrackerConfig {
        FlowTrackerConfig {
            idle_timeout: Duration::from_secs(60),
            max_flows,
            eviction_idle_grace: Duration::from_secs(1),
            reap_interval: Duration::from_secs(10),
        }
    }

    fn event(src: &str, size: u64) -> TrafficEvent {
        TrafficEvent::new(src, "10.0.0.1", Protocol::Tcp, size)
    }

    #[test]
    fn counters_accumulate_per_key() {
        let tracker = FlowTracker::new(config(10));
        let first = tracker.observe(&event("a", 100)).unwrap();
        assert_eq!(first.packets, 1);
        assert_eq!(first.bytes, 100);
        assert!(first.since_last.is_none());

        let second = tracker.observe(&event("a", 50)).unwrap();
        assert_eq!(second.packets, 2);
        assert_eq!(second.bytes, 150);
        assert!(second.since_last.is_some());
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn distinct_keys_get_distinct_flows() {
        let tracker = FlowTracker::new(config(10));
        tracker.observe(&event("a", 1)).unwrap();
        tracker.observe(&event("b", 1)).unwrap();
        tracker
            .observe(&TrafficEvent::new("a", "10.0.0.1", Protocol::Udp, 1))
            .unwrap();
        assert_eq!(tracker.len(), 3);
    }

    #[test]
    fn prior_verdict_is_visible_on_next_observe() {
        let tracker = FlowTracker::new(config(10));
        let view = tracker.observe(&event("a", 1)).unwrap();
        assert_eq!(view.prior_verdict, None);

        tracker.record_verdict(&view.key, Action::Alert);
        let view = tracker.observe(&event("a", 1)).unwrap();
        assert_eq!(view.prior_verdict, Some(Action::Alert));
    }

    #[tokio::test(start_paused = true)]
    async fn ceiling_without_idle_flow_is_exhausted() {
        let tracker = FlowTracker::new(config(2));
        tracker.observe(&event("a", 1)).unwrap();
        tracker.observe(&event("b", 1)).unwrap();

        // 두 플로우 모두 grace(1s) 이내
        tokio::time::advance(Duration::from_millis(500)).await;
        let err = tracker.observe(&event("c", 1)).unwrap_err();
        assert_eq!(
            err,
            FlowError::ResourceExhausted {
                tracked: 2,
                ceiling: 2
            }
        );
        assert_eq!(tracker.len(), 2);
        assert!(tracker.peek(&event("c", 1).flow_key()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn ceiling_evicts_least_recently_used_idle_flow() {
        let tracker = FlowTracker::new(config(2));
        tracker.observe(&event("old", 1)).unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        tracker.observe(&event("newer", 1)).unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;

        tracker.observe(&event("fresh", 1)).unwrap();
        assert_eq!(tracker.len(), 2);
        assert!(tracker.peek(&event("old", 1).flow_key()).is_none());
        assert!(tracker.peek(&event("newer", 1).flow_key()).is_some());
        assert!(tracker.peek(&event("fresh", 1).flow_key()).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn existing_flow_is_observed_at_ceiling() {
        let tracker = FlowTracker::new(config(1));
        tracker.observe(&event("a", 1)).unwrap();
        let view = tracker.observe(&event("a", 2)).unwrap();
        assert_eq!(view.bytes, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn reaper_removes_only_idle_flows() {
        let tracker = FlowTracker::new(config(10));
        tracker.observe(&event("idle", 1)).unwrap();
        tokio::time::advance(Duration::from_secs(45)).await;
        tracker.observe(&event("active", 1)).unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;

        let reaped = tracker.reap_idle(Instant::now());
        assert_eq!(reaped, 1);
        assert!(tracker.peek(&event("idle", 1).flow_key()).is_none());
        assert!(tracker.peek(&event("active", 1).flow_key()).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn reaped_flow_restarts_counters() {
        let tracker = FlowTracker::new(config(10));
        tracker.observe(&event("a", 10)).unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        tracker.reap_idle(Instant::now());

        let view = tracker.observe(&event("a", 5)).unwrap();
        assert_eq!(view.packets, 1);
        assert_eq!(view.bytes, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_reaper_runs_until_cancelled() {
        let tracker = Arc::new(FlowTracker::new(config(10)));
        tracker.observe(&event("a", 1)).unwrap();

        let cancel = CancellationToken::new();
        let handle = tracker.spawn_reaper(cancel.clone());

        tokio::time::sleep(Duration::from_secs(75)).await;
        assert!(tracker.is_empty());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn close_removes_flow() {
        let tracker = FlowTracker::new(config(10));
        let view = tracker.observe(&event("a", 1)).unwrap();
        assert!(tracker.close(&view.key));
        assert!(!tracker.close(&view.key));
        assert!(tracker.is_empty());
    }

    #[test]
    fn concurrent_observes_on_one_key_are_serialized() {
        let tracker = Arc::new(FlowTracker::new(config(10)));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tracker = Arc::clone(&tracker);
                std::thread::spawn(move || {
                    for _ in 0..1_000 {
                        tracker.observe(&event("shared", 3)).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let view = tracker.peek(&event("shared", 0).flow_key()).unwrap();
        assert_eq!(view.packets, 8_000);
        assert_eq!(view.bytes, 24_000);
    }

    #[test]
    fn occupancy_reports_fraction_of_ceiling() {
        let tracker = FlowTracker::new(config(4));
        tracker.observe(&event("a", 1)).unwrap();
        assert!((tracker.occupancy() - 0.25).abs() < f64::EPSILON);
    }
}

//! 이벤트 파이프라인 -- 수신부터 전달까지 이벤트 하나의 생명주기를 관리합니다.
//!
//! [`EventPipeline`]은 core의 [`Pipeline`] trait을 구현하여
//! `flowgate-daemon`에서 시작/정지/헬스 체크로 관리됩니다.
//!
//! # 이벤트 상태
//! ```text
//! RECEIVED -> TRACKED -> EVALUATED -> DECIDED -> DISPATCHED
//!     \           \
//!      +-----------+--> FAILED (intake halted / resource exhausted / cancelled)
//! ```
//!
//! # 내부 아키텍처
//! ```text
//! intake mpsc -> router --hash(flow key)--> worker[0..n] mpsc -> Engine::process -> verdict mpsc
//! ```
//! 같은 플로우 키의 이벤트는 항상 같은 워커로 가므로 키별 verdict 순서는 수신 순서와 같습니다.

use std::fmt;
use std::hash::{BuildHasher, RandomState};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use flowgate_core::error::{FlowgateError, PipelineError};
use flowgate_core::event::{AlertEvent, TrafficEvent};
use flowgate_core::metrics as m;
use flowgate_core::pipeline::{AuditSink, EnforcementHook, HealthStatus, Pipeline};
use flowgate_core::types::{FlowKey, Verdict, VerdictTag};

use crate::anomaly::AnomalyScorer;
use crate::config::EngineConfig;
use crate::decision::decide;
use crate::dispatch::Dispatcher;
use crate::error::EngineError;
use crate::flow::FlowTracker;
use crate::matcher::match_event;
use crate::rule::RuleStore;

/// 헬스 체크에서 Degraded로 보는 플로우 테이블 점유율
const FLOW_OCCUPANCY_DEGRADED: f64 = 0.9;

/// 이벤트 처리 단계
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStage {
    Received,
    Tracked,
    Evaluated,
    Decided,
    Dispatched,
    Failed,
}

impl EventStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Tracked => "tracked",
            Self::Evaluated => "evaluated",
            Self::Decided => "decided",
            Self::Dispatched => "dispatched",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for EventStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// FAILED로 끝난 이벤트 보고
#[derive(Debug, Clone)]
pub struct FailedEvent {
    /// 이벤트 ID
    pub event_id: String,
    /// 플로우 키
    pub flow: FlowKey,
    /// 실패 직전에 도달한 단계
    pub stage: EventStage,
    /// 실패 종류 (`intake_halted`, `resource_exhausted`, `cancelled`)
    pub kind: &'static str,
    /// 상세 사유
    pub reason: String,
}

impl FailedEvent {
    fn new(event: &TrafficEvent, err: &EngineError) -> Self {
        Self {
            event_id: event.id.clone(),
            flow: event.flow_key(),
            stage: EventStage::Received,
            kind: err.kind(),
            reason: err.to_string(),
        }
    }
}

/// 판정 엔진 -- 이벤트 하나를 verdict로 만드는 단계들의 묶음
///
/// 워커 없이 직접 [`Engine::process`]를 호출해 동기적으로 평가할 수도 있습니다.
pub struct Engine<A, H> {
    store: Arc<RuleStore>,
    flows: Arc<FlowTracker>,
    scorer: Arc<AnomalyScorer>,
    dispatcher: Arc<Dispatcher<A, H>>,
    cancel: CancellationToken,
}

impl<A: AuditSink, H: EnforcementHook> Engine<A, H> {
    pub fn new(
        config: &EngineConfig,
        store: Arc<RuleStore>,
        audit: Arc<A>,
        enforcer: Arc<H>,
        alert_tx: Option<mpsc::Sender<AlertEvent>>,
    ) -> Self {
        Self {
            store,
            flows: Arc::new(FlowTracker::new(config.flow.clone())),
            scorer: Arc::new(AnomalyScorer::new(config.scorer.clone())),
            dispatcher: Arc::new(Dispatcher::new(
                audit,
                enforcer,
                alert_tx,
                config.audit.clone(),
            )),
            cancel: CancellationToken::new(),
        }
    }

    /// 이벤트 하나를 처리합니다.
    ///
    /// 감사 기록이 재시도 후에도 실패해도 verdict는 반환됩니다
    /// (verdict는 지연 재시도 큐에 남습니다).
    ///
    /// # Errors
    /// - [`EngineError::IntakeHalted`]: 활성 스냅샷이 없거나 수신이 중단됨
    /// - [`EngineError::Cancelled`]: 추적 전에 종료가 시작됨
    /// - [`EngineError::Flow`]: 플로우 테이블 한도에 도달했고 축출할 플로우가 없음
    pub async fn process(&self, event: &TrafficEvent) -> Result<Verdict, EngineError> {
        let started = Instant::now();
        metrics::counter!(m::PIPELINE_EVENTS_RECEIVED_TOTAL).increment(1);

        let verdict = match self.evaluate(event) {
            Ok(verdict) => verdict,
            Err(e) => {
                metrics::counter!(m::PIPELINE_EVENTS_FAILED_TOTAL, m::LABEL_REASON => e.kind())
                    .increment(1);
                debug!(event_id = %event.id, reason = e.kind(), error = %e, "event failed");
                return Err(e);
            }
        };

        metrics::histogram!(m::PIPELINE_EVALUATION_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        metrics::counter!(m::PIPELINE_VERDICTS_TOTAL, m::LABEL_OUTCOME => verdict.outcome.as_str())
            .increment(1);

        // 감사 실패는 dispatcher가 알림과 지연 재시도로 처리함
        let _ = self.dispatcher.dispatch(&verdict).await;
        trace!(event_id = %verdict.event_id, stage = %EventStage::Dispatched, "event dispatched");

        Ok(verdict)
    }

    /// RECEIVED -> DECIDED
    fn evaluate(&self, event: &TrafficEvent) -> Result<Verdict, EngineError> {
        if let Some(reason) = self.store.halted_reason() {
            return Err(EngineError::IntakeHalted(reason));
        }
        // 평가가 끝날 때까지 이 스냅샷을 붙잡음
        let snapshot = self
            .store
            .current_snapshot()
            .ok_or_else(|| EngineError::IntakeHalted("no active rule snapshot".to_owned()))?;

        if self.cancel.is_cancelled() {
            return Err(EngineError::Cancelled {
                event_id: event.id.clone(),
            });
        }

        let flow = self.flows.observe(event)?;
        trace!(event_id = %event.id, stage = %EventStage::Tracked, packets = flow.packets, "event tracked");

        let matched = match_event(event, &snapshot);
        let anomaly = if matched.is_malformed() {
            None
        } else {
            Some(self.scorer.score(event, &flow))
        };
        trace!(event_id = %event.id, stage = %EventStage::Evaluated, "event evaluated");

        let decision = decide(matched, anomaly);
        if let Some(reason) = event_malformed_reason(&decision.tags) {
            metrics::counter!(m::PIPELINE_MALFORMED_TOTAL).increment(1);
            warn!(
                target: crate::VERDICT_LOG_TARGET,
                event_id = %event.id,
                flow_key = %flow.key,
                reason,
                "malformed event denied"
            );
        }
        if decision.is_escalated() {
            metrics::counter!(m::PIPELINE_ESCALATIONS_TOTAL).increment(1);
            info!(
                target: crate::VERDICT_LOG_TARGET,
                event_id = %event.id,
                flow_key = %flow.key,
                rule_id = decision.matched_rule_id.as_deref().unwrap_or("-"),
                score = anomaly.map(|a| a.score).unwrap_or_default(),
                "alert escalated to deny by anomaly"
            );
        }
        if decision.is_flagged_allow() {
            metrics::counter!(m::PIPELINE_FLAGGED_ALLOWS_TOTAL).increment(1);
            warn!(
                target: crate::VERDICT_LOG_TARGET,
                event_id = %event.id,
                flow_key = %flow.key,
                rule_id = decision.matched_rule_id.as_deref().unwrap_or("-"),
                score = anomaly.map(|a| a.score).unwrap_or_default(),
                "anomalous traffic flagged but permitted"
            );
        }

        let verdict = decision.into_verdict(event.id.clone(), flow.key, snapshot.version());
        self.flows.record_verdict(&verdict.flow, verdict.outcome);
        debug!(
            target: crate::VERDICT_LOG_TARGET,
            event_id = %verdict.event_id,
            flow_key = %verdict.flow,
            outcome = %verdict.outcome,
            rule_id = verdict.matched_rule_id.as_deref().unwrap_or("-"),
            snapshot_version = verdict.snapshot_version,
            "verdict decided"
        );

        Ok(verdict)
    }

    pub fn store(&self) -> &Arc<RuleStore> {
        &self.store
    }

    pub fn flows(&self) -> &Arc<FlowTracker> {
        &self.flows
    }

    pub fn scorer(&self) -> &Arc<AnomalyScorer> {
        &self.scorer
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher<A, H>> {
        &self.dispatcher
    }

    /// 종료를 알립니다. 이후 추적 전 단계의 이벤트는 `Cancelled`로 실패합니다.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

fn event_malformed_reason(tags: &[VerdictTag]) -> Option<&str> {
    tags.iter().find_map(|tag| match tag {
        VerdictTag::Malformed(reason) => Some(reason.as_str()),
        _ => None,
    })
}

/// 파이프라인 실행 상태
#[derive(Debug, Clone, PartialEq, Eq)]
enum PipelineState {
    /// 초기화됨, 아직 시작하지 않음
    Initialized,
    /// 실행 중
    Running,
    /// 정지됨
    Stopped,
}

/// 이벤트 파이프라인
///
/// # 사용 예시
/// ```ignore
/// use flowgate_engine::{EventPipelineBuilder, JsonlAuditSink, LoggingEnforcer};
///
/// let (mut pipeline, alert_rx) = EventPipelineBuilder::new()
///     .config(config)
///     .store(store)
///     .audit_sink(Arc::new(audit))
///     .enforcer(Arc::new(LoggingEnforcer::new()))
///     .build()?;
///
/// let intake = pipeline.intake();
/// pipeline.start().await?;
/// intake.send(event).await?;
/// ```
pub struct EventPipeline<A, H> {
    config: EngineConfig,
    state: PipelineState,
    engine: Arc<Engine<A, H>>,
    intake_tx: mpsc::Sender<TrafficEvent>,
    intake_rx: Option<mpsc::Receiver<TrafficEvent>>,
    verdict_tx: Option<mpsc::Sender<Verdict>>,
    failure_tx: Option<mpsc::Sender<FailedEvent>>,
    cancel: CancellationToken,
    router: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
    background: Vec<JoinHandle<()>>,
}

impl<A: AuditSink, H: EnforcementHook> EventPipeline<A, H> {
    /// 현재 상태를 반환합니다.
    pub fn state_name(&self) -> &str {
        match self.state {
            PipelineState::Initialized => "initialized",
            PipelineState::Running => "running",
            PipelineState::Stopped => "stopped",
        }
    }

    /// 이벤트 수신 채널. 큐가 가득 차면 `send`가 대기합니다.
    pub fn intake(&self) -> mpsc::Sender<TrafficEvent> {
        self.intake_tx.clone()
    }

    pub fn engine(&self) -> &Arc<Engine<A, H>> {
        &self.engine
    }

    pub fn store(&self) -> &Arc<RuleStore> {
        self.engine.store()
    }

    fn spawn_router(&mut self, mut intake_rx: mpsc::Receiver<TrafficEvent>) {
        let cancel = self.cancel.clone();
        let mut shards = Vec::with_capacity(self.config.workers);

        for index in 0..self.config.workers {
            let (tx, rx) = mpsc::channel(self.config.queue_capacity);
            shards.push(tx);
            self.workers.push(spawn_worker(
                index,
                Arc::clone(&self.engine),
                rx,
                self.verdict_tx.clone(),
                self.failure_tx.clone(),
            ));
        }

        self.router = Some(tokio::spawn(async move {
            let hasher = RandomState::new();
            let mut closed = false;

            loop {
                let next = if closed {
                    intake_rx.recv().await
                } else {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            // 남은 이벤트는 워커로 보내 cancelled로 보고되게 함
                            intake_rx.close();
                            closed = true;
                            continue;
                        }
                        event = intake_rx.recv() => event,
                    }
                };
                let Some(event) = next else {
                    break;
                };

                let shard = (hasher.hash_one(event.flow_key()) % shards.len() as u64) as usize;
                if shards[shard].send(event).await.is_err() {
                    warn!(shard, "worker queue closed, router stopping");
                    break;
                }
            }
            debug!("event router stopped");
        }));
    }

    /// 오래된 출발지 윈도우와 이전 스냅샷 기록을 정리하는 태스크
    fn spawn_maintenance(&mut self) {
        let engine = Arc::clone(&self.engine);
        let cancel = self.cancel.clone();
        let period = self.config.flow.reap_interval;

        self.background.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        engine.scorer.prune_idle(Instant::now());
                        engine.store.prune_retired();
                    }
                }
            }
            debug!("engine maintenance stopped");
        }));
    }
}

fn spawn_worker<A: AuditSink, H: EnforcementHook>(
    index: usize,
    engine: Arc<Engine<A, H>>,
    mut rx: mpsc::Receiver<TrafficEvent>,
    verdict_tx: Option<mpsc::Sender<Verdict>>,
    failure_tx: Option<mpsc::Sender<FailedEvent>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut processed: u64 = 0;
        while let Some(event) = rx.recv().await {
            match engine.process(&event).await {
                Ok(verdict) => {
                    processed += 1;
                    if let Some(tx) = &verdict_tx {
                        if tx.send(verdict).await.is_err() {
                            debug!(worker = index, "verdict receiver dropped");
                        }
                    }
                }
                Err(e) => {
                    if let Some(tx) = &failure_tx {
                        if tx.send(FailedEvent::new(&event, &e)).await.is_err() {
                            debug!(worker = index, "failure receiver dropped");
                        }
                    }
                }
            }
        }
        debug!(worker = index, processed, "pipeline worker stopped");
    })
}

async fn join_task(name: &str, handle: JoinHandle<()>) {
    if let Err(e) = handle.await {
        warn!(task = name, error = %e, "pipeline task ended abnormally");
    }
}

impl<A: AuditSink, H: EnforcementHook> Pipeline for EventPipeline<A, H> {
    async fn start(&mut self) -> Result<(), FlowgateError> {
        match self.state {
            PipelineState::Running => return Err(PipelineError::AlreadyRunning.into()),
            PipelineState::Stopped => {
                return Err(PipelineError::InitFailed(
                    "pipeline cannot be restarted after stop".to_owned(),
                )
                .into());
            }
            PipelineState::Initialized => {}
        }

        let intake_rx = self
            .intake_rx
            .take()
            .ok_or_else(|| EngineError::Channel("intake receiver already taken".to_owned()))?;

        info!(
            workers = self.config.workers,
            queue_capacity = self.config.queue_capacity,
            max_flows = self.config.flow.max_flows,
            "starting event pipeline"
        );

        self.spawn_router(intake_rx);
        self.background
            .push(self.engine.flows.spawn_reaper(self.cancel.clone()));
        self.background.push(
            self.engine
                .dispatcher
                .spawn_retry_drainer(self.cancel.clone()),
        );
        self.spawn_maintenance();

        if let Some(reason) = self.engine.store.halted_reason() {
            warn!(reason = %reason, "event pipeline started with intake halted");
        }

        self.state = PipelineState::Running;
        info!("event pipeline started");
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), FlowgateError> {
        if self.state != PipelineState::Running {
            return Err(PipelineError::NotRunning.into());
        }

        info!("stopping event pipeline");
        self.cancel.cancel();
        self.engine.cancel();

        // 1. 라우터와 워커: 큐에 남은 이벤트를 모두 처리(또는 cancelled 보고)할 때까지 대기
        if let Some(router) = self.router.take() {
            join_task("router", router).await;
        }
        for worker in self.workers.drain(..) {
            join_task("worker", worker).await;
        }
        for task in self.background.drain(..) {
            join_task("background", task).await;
        }

        // 2. 지연 재시도 큐 마지막 비우기
        let flushed = self.engine.dispatcher.drain_retry_queue().await;
        let pending = self.engine.dispatcher.retry_queue_len();
        if pending > 0 {
            warn!(pending, flushed, "verdicts still awaiting audit retry at shutdown");
        }

        self.state = PipelineState::Stopped;
        info!("event pipeline stopped");
        Ok(())
    }

    async fn health_check(&self) -> HealthStatus {
        match self.state {
            PipelineState::Running => {
                if let Some(reason) = self.engine.store.halted_reason() {
                    return HealthStatus::Unhealthy(format!("intake halted: {reason}"));
                }
                let pending = self.engine.dispatcher.retry_queue_len();
                if pending > 0 {
                    return HealthStatus::Degraded(format!(
                        "{pending} verdicts awaiting audit retry"
                    ));
                }
                let occupancy = self.engine.flows.occupancy();
                if occupancy > FLOW_OCCUPANCY_DEGRADED {
                    return HealthStatus::Degraded(format!(
                        "flow table occupancy high: {:.1}%",
                        occupancy * 100.0
                    ));
                }
                HealthStatus::Healthy
            }
            PipelineState::Initialized => HealthStatus::Unhealthy("not started".to_owned()),
            PipelineState::Stopped => HealthStatus::Unhealthy("stopped".to_owned()),
        }
    }
}

/// 이벤트 파이프라인 빌더
///
/// 감사 싱크와 차단 훅은 필수입니다. 스냅샷 스토어를 주지 않으면
/// 빈 스토어로 시작하며, 첫 게시 전까지 수신은 중단 상태입니다.
pub struct EventPipelineBuilder<A, H> {
    config: EngineConfig,
    store: Option<Arc<RuleStore>>,
    audit: Option<Arc<A>>,
    enforcer: Option<Arc<H>>,
    alert_tx: Option<mpsc::Sender<AlertEvent>>,
    alert_channel_capacity: usize,
    verdict_tx: Option<mpsc::Sender<Verdict>>,
    failure_tx: Option<mpsc::Sender<FailedEvent>>,
}

impl<A: AuditSink, H: EnforcementHook> EventPipelineBuilder<A, H> {
    /// 새 빌더를 생성합니다.
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            store: None,
            audit: None,
            enforcer: None,
            alert_tx: None,
            alert_channel_capacity: 1024,
            verdict_tx: None,
            failure_tx: None,
        }
    }

    /// 엔진 설정을 지정합니다.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// 규칙 스토어를 지정합니다. 리로드 태스크와 공유할 때 사용합니다.
    pub fn store(mut self, store: Arc<RuleStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn audit_sink(mut self, audit: Arc<A>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn enforcer(mut self, enforcer: Arc<H>) -> Self {
        self.enforcer = Some(enforcer);
        self
    }

    /// 외부 운영 알림 채널을 설정합니다.
    ///
    /// 설정하지 않으면 빌더가 새 채널을 생성합니다.
    pub fn alert_sender(mut self, tx: mpsc::Sender<AlertEvent>) -> Self {
        self.alert_tx = Some(tx);
        self
    }

    /// 알림 채널 용량을 설정합니다 (외부 채널 미사용 시).
    pub fn alert_channel_capacity(mut self, capacity: usize) -> Self {
        self.alert_channel_capacity = capacity;
        self
    }

    /// 확정된 verdict를 받을 채널
    pub fn verdict_sender(mut self, tx: mpsc::Sender<Verdict>) -> Self {
        self.verdict_tx = Some(tx);
        self
    }

    /// FAILED 이벤트를 받을 채널
    pub fn failure_sender(mut self, tx: mpsc::Sender<FailedEvent>) -> Self {
        self.failure_tx = Some(tx);
        self
    }

    /// 파이프라인을 빌드합니다.
    ///
    /// # Returns
    /// - `EventPipeline`: 파이프라인 인스턴스
    /// - `Option<mpsc::Receiver<AlertEvent>>`: 운영 알림 수신 채널
    ///   (외부 alert_sender를 설정한 경우 None)
    pub fn build(
        self,
    ) -> Result<(EventPipeline<A, H>, Option<mpsc::Receiver<AlertEvent>>), EngineError> {
        self.config.validate()?;

        let audit = self.audit.ok_or_else(|| EngineError::Config {
            field: "audit_sink".to_owned(),
            reason: "an audit sink is required".to_owned(),
        })?;
        let enforcer = self.enforcer.ok_or_else(|| EngineError::Config {
            field: "enforcer".to_owned(),
            reason: "an enforcement hook is required".to_owned(),
        })?;

        let (alert_tx, alert_rx) = if let Some(tx) = self.alert_tx {
            (tx, None)
        } else {
            let (tx, rx) = mpsc::channel(self.alert_channel_capacity);
            (tx, Some(rx))
        };

        let store = self.store.unwrap_or_default();
        let engine = Engine::new(&self.config, store, audit, enforcer, Some(alert_tx));
        let (intake_tx, intake_rx) = mpsc::channel(self.config.queue_capacity);

        let pipeline = EventPipeline {
            config: self.config,
            state: PipelineState::Initialized,
            engine: Arc::new(engine),
            intake_tx,
            intake_rx: Some(intake_rx),
            verdict_tx: self.verdict_tx,
            failure_tx: self.failure_tx,
            cancel: CancellationToken::new(),
            router: None,
            workers: Vec::new(),
            background: Vec::new(),
        };

        Ok((pipeline, alert_rx))
    }
}

impl<A: AuditSink, H: EnforcementHook> Default for EventPipelineBuilder<A, H> {
    fn default() -> Self {
        Self::new()
    }
}

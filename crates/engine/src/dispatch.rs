//! verdict 전달 -- 차단 훅 호출과 감사 기록
//!
//! - 차단 훅은 별도 태스크에서 호출되며 파이프라인은 완료를 기다리지 않습니다.
//! - 감사 기록은 `max_attempts`번까지 선형 백오프로 재시도합니다.
//!   모두 실패하면 운영 알림을 보내고 verdict를 지연 재시도 큐에 넣습니다.
//! - 기록은 별도 태스크에서 실행되며 시간 초과로 취소되지 않습니다. 재시도는
//!   진행 중인 기록을 이어서 기다리므로 같은 verdict가 두 번 기록되지 않습니다.
//! - 큐가 가득 차면 가장 오래된 verdict를 버리고 알림을 보냅니다.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use flowgate_core::error::AuditError;
use flowgate_core::event::{AlertEvent, AlertKind};
use flowgate_core::metrics as m;
use flowgate_core::pipeline::{AuditSink, EnforcementHook};
use flowgate_core::types::{Severity, Verdict};

use crate::config::AuditRetryConfig;

/// 진행 중인 감사 기록 태스크
type AppendTask = JoinHandle<Result<(), AuditError>>;

/// 지연 재시도 큐 항목
struct QueuedVerdict {
    verdict: Verdict,
    /// 시간 초과 후에도 아직 끝나지 않은 기록
    in_flight: Option<AppendTask>,
}

/// verdict 전달기
pub struct Dispatcher<A, H> {
    audit: Arc<A>,
    enforcer: Arc<H>,
    alert_tx: Option<mpsc::Sender<AlertEvent>>,
    retry_queue: parking_lot::Mutex<VecDeque<QueuedVerdict>>,
    /// 지연 재시도 직렬화
    drain_lock: tokio::sync::Mutex<()>,
    config: AuditRetryConfig,
}

impl<A: AuditSink, H: EnforcementHook> Dispatcher<A, H> {
    pub fn new(
        audit: Arc<A>,
        enforcer: Arc<H>,
        alert_tx: Option<mpsc::Sender<AlertEvent>>,
        config: AuditRetryConfig,
    ) -> Self {
        Self {
            audit,
            enforcer,
            alert_tx,
            retry_queue: parking_lot::Mutex::new(VecDeque::new()),
            drain_lock: tokio::sync::Mutex::new(()),
            config,
        }
    }

    /// verdict를 차단 훅과 감사 싱크로 보냅니다.
    ///
    /// 감사 기록이 재시도 후에도 실패하면 `AuditError::WriteFailed`를 반환하지만,
    /// 그 verdict는 지연 재시도 큐에 보관되어 잃어버리지 않습니다.
    pub async fn dispatch(&self, verdict: &Verdict) -> Result<(), AuditError> {
        self.spawn_enforcement(verdict.clone());

        match self.append_with_retry(verdict).await {
            Ok(()) => Ok(()),
            Err((e, in_flight)) => {
                metrics::counter!(m::AUDIT_WRITE_FAILURES_TOTAL).increment(1);
                error!(
                    target: crate::AUDIT_LOG_TARGET,
                    event_id = %verdict.event_id,
                    flow_key = %verdict.flow,
                    error = %e,
                    "audit write failed, verdict queued for delayed retry"
                );
                self.send_alert(AlertEvent::with_trace(
                    AlertKind::AuditWriteFailed,
                    Severity::High,
                    e.to_string(),
                    verdict.event_id.clone(),
                ));
                self.enqueue(QueuedVerdict {
                    verdict: verdict.clone(),
                    in_flight,
                });
                Err(e)
            }
        }
    }

    fn spawn_enforcement(&self, verdict: Verdict) {
        let enforcer = Arc::clone(&self.enforcer);
        tokio::spawn(async move {
            if let Err(e) = enforcer.enforce(&verdict).await {
                metrics::counter!(m::PIPELINE_ENFORCEMENT_FAILURES_TOTAL).increment(1);
                warn!(
                    event_id = %verdict.event_id,
                    outcome = %verdict.outcome,
                    error = %e,
                    "enforcement hook failed"
                );
            }
        });
    }

    fn spawn_append(&self, verdict: &Verdict) -> AppendTask {
        let audit = Arc::clone(&self.audit);
        let verdict = verdict.clone();
        tokio::spawn(async move { audit.append(&verdict).await })
    }

    /// 기록 태스크를 최대 `write_timeout`만큼 기다립니다.
    ///
    /// 시간 안에 끝나지 않으면 태스크를 그대로 돌려줍니다.
    async fn await_append(
        &self,
        mut task: AppendTask,
    ) -> Result<Result<(), AuditError>, AppendTask> {
        match tokio::time::timeout(self.config.write_timeout, &mut task).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(join_error)) => Ok(Err(AuditError::Rejected(format!(
                "audit append task failed: {join_error}"
            )))),
            Err(_elapsed) => Err(task),
        }
    }

    /// 제한된 횟수만큼 감사 기록을 시도합니다.
    ///
    /// 실패 시 아직 끝나지 않은 기록 태스크가 있으면 함께 돌려줍니다.
    async fn append_with_retry(
        &self,
        verdict: &Verdict,
    ) -> Result<(), (AuditError, Option<AppendTask>)> {
        let mut last_error = None;
        let mut in_flight = None;

        for attempt in 0..self.config.max_attempts {
            if attempt > 0 {
                let backoff = self.config.backoff_base * attempt;
                warn!(
                    target: crate::AUDIT_LOG_TARGET,
                    event_id = %verdict.event_id,
                    attempt,
                    backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                    "retrying audit append"
                );
                tokio::time::sleep(backoff).await;
            }

            // 시간 초과된 기록이 남아 있으면 새로 쓰지 않고 그 결과를 기다립니다.
            let task = match in_flight.take() {
                Some(task) => task,
                None => self.spawn_append(verdict),
            };

            match self.await_append(task).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => last_error = Some(e.to_string()),
                Err(task) => {
                    last_error = Some("append timed out".to_owned());
                    in_flight = Some(task);
                }
            }
        }

        let error = AuditError::WriteFailed {
            event_id: verdict.event_id.clone(),
            attempts: self.config.max_attempts,
            reason: last_error.unwrap_or_else(|| "unknown error".to_owned()),
        };
        Err((error, in_flight))
    }

    fn enqueue(&self, entry: QueuedVerdict) {
        let dropped = {
            let mut queue = self.retry_queue.lock();
            let dropped = if queue.len() >= self.config.queue_capacity {
                queue.pop_front()
            } else {
                None
            };
            queue.push_back(entry);
            metrics::gauge!(m::AUDIT_RETRY_QUEUE_DEPTH).set(queue.len() as f64);
            dropped
        };

        if let Some(QueuedVerdict { verdict: dropped, .. }) = dropped {
            metrics::counter!(m::AUDIT_RETRY_DROPPED_TOTAL).increment(1);
            error!(
                target: crate::AUDIT_LOG_TARGET,
                event_id = %dropped.event_id,
                capacity = self.config.queue_capacity,
                "audit retry queue full, oldest verdict dropped"
            );
            self.send_alert(AlertEvent::with_trace(
                AlertKind::AuditRetryDropped,
                Severity::Critical,
                format!(
                    "audit retry queue full ({}), verdict dropped",
                    self.config.queue_capacity
                ),
                dropped.event_id,
            ));
        }
    }

    fn send_alert(&self, alert: AlertEvent) {
        let Some(tx) = &self.alert_tx else {
            return;
        };
        if let Err(e) = tx.try_send(alert) {
            warn!(error = %e, "failed to deliver operational alert");
        }
    }

    /// 지연 재시도 큐를 앞에서부터 기록합니다.
    ///
    /// 순서를 지키기 위해 첫 실패에서 멈춥니다. 기록한 수를 반환합니다.
    pub async fn drain_retry_queue(&self) -> usize {
        let _drain = self.drain_lock.lock().await;
        let mut written = 0;

        loop {
            let next = self
                .retry_queue
                .lock()
                .front_mut()
                .map(|front| (front.verdict.clone(), front.in_flight.take()));
            let Some((verdict, in_flight)) = next else {
                break;
            };

            let task = match in_flight {
                Some(task) => task,
                None => self.spawn_append(&verdict),
            };

            match self.await_append(task).await {
                Ok(Ok(())) => {
                    let mut queue = self.retry_queue.lock();
                    // 기록 중 넘침으로 이미 버려졌을 수 있음
                    if queue
                        .front()
                        .is_some_and(|front| front.verdict.event_id == verdict.event_id)
                    {
                        queue.pop_front();
                    }
                    written += 1;
                }
                Ok(Err(e)) => {
                    debug!(
                        target: crate::AUDIT_LOG_TARGET,
                        event_id = %verdict.event_id,
                        error = %e,
                        "delayed audit retry failed"
                    );
                    break;
                }
                Err(task) => {
                    debug!(
                        target: crate::AUDIT_LOG_TARGET,
                        event_id = %verdict.event_id,
                        "delayed audit retry timed out"
                    );
                    if let Some(front) = self.retry_queue.lock().front_mut() {
                        if front.verdict.event_id == verdict.event_id {
                            front.in_flight = Some(task);
                        }
                    }
                    break;
                }
            }
        }

        let depth = self.retry_queue_len();
        metrics::gauge!(m::AUDIT_RETRY_QUEUE_DEPTH).set(depth as f64);
        if written > 0 {
            info!(
                target: crate::AUDIT_LOG_TARGET,
                written,
                remaining = depth,
                "delayed audit retries written"
            );
        }
        written
    }

    /// 지연 재시도 대기 중인 verdict 수
    pub fn retry_queue_len(&self) -> usize {
        self.retry_queue.lock().len()
    }

    /// `retry_interval`마다 지연 재시도 큐를 비우는 태스크를 시작합니다.
    pub fn spawn_retry_drainer(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let dispatcher = Arc::clone(self);
        let period = self.config.retry_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if dispatcher.retry_queue_len() > 0 {
                            dispatcher.drain_retry_queue().await;
                        }
                    }
                }
            }
            debug!("audit retry drainer stopped");
        })
    }
}

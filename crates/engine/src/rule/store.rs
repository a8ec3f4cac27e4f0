//! 규칙 스토어 -- 버전이 붙은 불변 스냅샷의 원자적 교체
//!
//! 평가기는 [`RuleStore::current_snapshot`]으로 `Arc<RuleSnapshot>`을 얻어
//! 평가가 끝날 때까지 붙잡습니다. 게시는 새 스냅샷을 만든 뒤 포인터 하나를
//! 교체할 뿐이므로, 평가기는 게시를 기다리지 않고 게시도 평가기를 기다리지 않습니다.
//! 이전 스냅샷은 마지막 참조가 사라지는 순간 해제됩니다.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};

use flowgate_core::error::RuleError;
use flowgate_core::metrics as m;
use flowgate_core::types::Action;

use super::loader::MAX_RULES_COUNT;
use super::types::{Rule, RuleSet};

/// 스냅샷이 없을 때 보고되는 중단 사유
const NO_SNAPSHOT_REASON: &str = "no rule snapshot has been published";

/// 불변 규칙 스냅샷
///
/// 규칙은 `(priority, id)` 오름차순으로 정렬되어 있습니다.
#[derive(Debug)]
pub struct RuleSnapshot {
    version: u64,
    created_at: DateTime<Utc>,
    rules: Vec<Rule>,
    default_action: Action,
}

impl RuleSnapshot {
    /// 규칙 집합을 검증/컴파일하여 스냅샷을 만듭니다.
    ///
    /// 스토어를 거치지 않는 재현/테스트 용도로도 사용할 수 있습니다.
    pub fn from_rule_set(set: &RuleSet, version: u64) -> Result<Self, RuleError> {
        validate_ids(set)?;

        let mut rules = set
            .rules
            .iter()
            .map(Rule::compile)
            .collect::<Result<Vec<_>, _>>()?;
        rules.sort_by(|a, b| a.order_key().cmp(&b.order_key()));

        Ok(Self {
            version,
            created_at: Utc::now(),
            rules,
            default_action: set.default_action,
        })
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// 정렬된 규칙 목록
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// 매칭되는 규칙이 없을 때의 동작
    pub fn default_action(&self) -> Action {
        self.default_action
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// ID로 규칙을 찾습니다.
    pub fn get(&self, id: &str) -> Option<&Rule> {
        self.rules.iter().find(|r| r.id == id)
    }
}

/// 규칙 ID 검증: 빈 ID, 중복 ID, 규칙 수 한도
fn validate_ids(set: &RuleSet) -> Result<(), RuleError> {
    if set.rules.len() > MAX_RULES_COUNT {
        return Err(RuleError::TooMany {
            count: set.rules.len(),
            max: MAX_RULES_COUNT,
        });
    }

    let mut per_priority: HashMap<i32, usize> = HashMap::new();
    for rule in &set.rules {
        *per_priority.entry(rule.priority).or_default() += 1;
    }

    let mut seen = HashSet::with_capacity(set.rules.len());
    for rule in &set.rules {
        if rule.id.trim().is_empty() {
            let count = per_priority.get(&rule.priority).copied().unwrap_or(1);
            if count > 1 {
                return Err(RuleError::AmbiguousPriority {
                    priority: rule.priority,
                    count,
                });
            }
            return Err(RuleError::Validation {
                rule_id: "(empty)".to_owned(),
                reason: "rule id must not be empty".to_owned(),
            });
        }
        if !seen.insert(rule.id.as_str()) {
            return Err(RuleError::DuplicateId(rule.id.clone()));
        }
    }
    Ok(())
}

/// 규칙 스토어
///
/// # 사용 예시
/// ```ignore
/// let store = RuleStore::new();
/// let version = store.publish(rule_set)?;
///
/// let snapshot = store.current_snapshot().ok_or(EngineError::IntakeHalted(..))?;
/// let result = match_event(&event, &snapshot);
/// ```
pub struct RuleStore {
    current: ArcSwapOption<RuleSnapshot>,
    /// 게시 직렬화 + 마지막으로 발급한 버전
    publish_lock: Mutex<u64>,
    /// 교체되었지만 아직 참조가 남아 있을 수 있는 스냅샷
    retired: Mutex<Vec<Weak<RuleSnapshot>>>,
    /// 명시적 수신 중단 사유
    halted: RwLock<Option<String>>,
}

impl RuleStore {
    /// 스냅샷이 없는 빈 스토어를 생성합니다. 첫 게시 전까지 수신은 중단 상태입니다.
    pub fn new() -> Self {
        Self {
            current: ArcSwapOption::empty(),
            publish_lock: Mutex::new(0),
            retired: Mutex::new(Vec::new()),
            halted: RwLock::new(None),
        }
    }

    /// 새 규칙 집합을 게시하고 발급된 버전을 반환합니다.
    ///
    /// 검증과 컴파일은 잠금 밖에서 수행하고, 버전 발급과 포인터 교체만
    /// 게시 잠금 안에서 수행합니다. 실패 시 기존 스냅샷은 그대로 유지됩니다.
    pub fn publish(&self, set: RuleSet) -> Result<u64, RuleError> {
        let mut snapshot = match RuleSnapshot::from_rule_set(&set, 0) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                metrics::counter!(m::RULES_PUBLISH_REJECTED_TOTAL).increment(1);
                tracing::warn!(
                    error = %e,
                    active_version = self.current_version().unwrap_or(0),
                    "rule publish rejected, keeping active snapshot"
                );
                return Err(e);
            }
        };

        let rule_count = snapshot.len();
        let (version, previous) = {
            let mut last_version = self.publish_lock.lock();
            let version = *last_version + 1;
            snapshot.version = version;
            snapshot.created_at = Utc::now();
            let previous = self.current.swap(Some(Arc::new(snapshot)));
            *last_version = version;
            (version, previous)
        };

        if let Some(previous) = previous {
            self.retired.lock().push(Arc::downgrade(&previous));
        }
        self.prune_retired();

        if let Some(reason) = self.halted.write().take() {
            tracing::info!(reason = %reason, "intake resumed by new rule snapshot");
        }

        metrics::gauge!(m::RULES_SNAPSHOT_VERSION).set(version as f64);
        metrics::gauge!(m::RULES_LOADED).set(rule_count as f64);
        tracing::info!(
            version,
            rules = rule_count,
            default_action = %set.default_action,
            "rule snapshot published"
        );

        Ok(version)
    }

    /// 현재 활성 스냅샷. 잠금 없이 읽습니다.
    pub fn current_snapshot(&self) -> Option<Arc<RuleSnapshot>> {
        self.current.load_full()
    }

    /// 현재 활성 스냅샷 버전
    pub fn current_version(&self) -> Option<u64> {
        self.current.load_full().map(|s| s.version)
    }

    /// 교체되었지만 평가 중인 곳에서 아직 참조하는 스냅샷 수
    pub fn retained_snapshots(&self) -> usize {
        self.retired
            .lock()
            .iter()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    /// 참조가 모두 사라진 이전 스냅샷 기록을 정리하고 남은 수를 반환합니다.
    pub fn prune_retired(&self) -> usize {
        let mut retired = self.retired.lock();
        retired.retain(|w| w.strong_count() > 0);
        let live = retired.len();
        metrics::gauge!(m::RULES_RETAINED_SNAPSHOTS).set(live as f64);
        live
    }

    /// 수신을 명시적으로 중단합니다. 다음 게시 성공 시 해제됩니다.
    pub fn halt(&self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::error!(reason = %reason, "intake halted");
        *self.halted.write() = Some(reason);
    }

    /// 수신 중단 여부. 스냅샷이 없으면 항상 중단 상태입니다.
    pub fn is_halted(&self) -> bool {
        self.halted_reason().is_some()
    }

    /// 수신 중단 사유
    pub fn halted_reason(&self) -> Option<String> {
        if let Some(reason) = self.halted.read().as_ref() {
            return Some(reason.clone());
        }
        if self.current.load().is_none() {
            return Some(NO_SNAPSHOT_REASON.to_owned());
        }
        None
    }
}

impl Default for RuleStore {
    fn default() -> Self {
        Self::new()
    }
}

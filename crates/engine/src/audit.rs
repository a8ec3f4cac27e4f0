//! 감사 싱크 구현
//!
//! - [`JsonlAuditSink`]: verdict 하나당 JSON 한 줄을 파일에 추가하고 크기 기준으로 회전
//! - [`MemoryAuditSink`]: 메모리에 보관하는 싱크. 실패를 주입할 수 있어 테스트와 임베딩에 사용

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use flowgate_core::config::AuditConfig;
use flowgate_core::error::AuditError;
use flowgate_core::pipeline::AuditSink;
use flowgate_core::types::Verdict;

/// 열린 감사 파일과 현재 크기
struct OpenLog {
    file: File,
    size: u64,
}

/// JSON lines 파일 감사 싱크
///
/// `path`가 `max_file_bytes`를 넘으면 `path.1`, `path.2`, ... 순으로 밀어내고
/// 최대 `max_backups`개를 보관합니다.
pub struct JsonlAuditSink {
    path: PathBuf,
    max_file_bytes: u64,
    max_backups: usize,
    log: Mutex<Option<OpenLog>>,
}

impl JsonlAuditSink {
    /// 감사 파일을 열거나 생성합니다. 상위 디렉토리가 없으면 만듭니다.
    pub async fn open(
        path: impl Into<PathBuf>,
        max_file_bytes: u64,
        max_backups: usize,
    ) -> Result<Self, AuditError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let log = open_append(&path).await?;
        info!(
            path = %path.display(),
            size = log.size,
            max_file_bytes,
            max_backups,
            "audit log opened"
        );

        Ok(Self {
            path,
            max_file_bytes,
            max_backups,
            log: Mutex::new(Some(log)),
        })
    }

    /// 설정에서 싱크를 엽니다.
    pub async fn from_config(config: &AuditConfig) -> Result<Self, AuditError> {
        Self::open(&config.path, config.max_file_bytes, config.max_backups).await
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn backup_path(&self, index: usize) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(format!(".{index}"));
        PathBuf::from(name)
    }

    /// 현재 파일을 `.1`로 밀어내고 새 파일을 엽니다.
    async fn rotate(&self) -> Result<OpenLog, AuditError> {
        if self.max_backups == 0 {
            tokio::fs::remove_file(&self.path).await?;
        } else {
            for index in (1..self.max_backups).rev() {
                let from = self.backup_path(index);
                if tokio::fs::try_exists(&from).await? {
                    tokio::fs::rename(&from, self.backup_path(index + 1)).await?;
                }
            }
            tokio::fs::rename(&self.path, self.backup_path(1)).await?;
        }

        debug!(path = %self.path.display(), "audit log rotated");
        open_append(&self.path).await
    }
}

async fn open_append(path: &Path) -> Result<OpenLog, AuditError> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    let size = file.metadata().await?.len();
    Ok(OpenLog { file, size })
}

impl AuditSink for JsonlAuditSink {
    async fn append(&self, verdict: &Verdict) -> Result<(), AuditError> {
        let mut line = serde_json::to_vec(verdict)?;
        line.push(b'\n');
        let len = line.len() as u64;

        let mut guard = self.log.lock().await;
        let mut log = match guard.take() {
            Some(log) => log,
            None => open_append(&self.path).await?,
        };

        if log.size > 0 && log.size + len > self.max_file_bytes {
            drop(log);
            log = self.rotate().await?;
        }

        // 실패하면 핸들을 버리고 다음 기록에서 다시 엽니다.
        log.file.write_all(&line).await?;
        log.file.flush().await?;
        log.size += len;
        *guard = Some(log);
        Ok(())
    }
}

/// 메모리 감사 싱크
#[derive(Default)]
pub struct MemoryAuditSink {
    entries: parking_lot::Mutex<Vec<Verdict>>,
    fail_next: AtomicUsize,
    failing: AtomicBool,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// 다음 `n`번의 기록을 실패시킵니다.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// 해제될 때까지 모든 기록을 실패시킵니다.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// 기록된 verdict 사본
    pub fn entries(&self) -> Vec<Verdict> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn should_fail(&self) -> bool {
        if self.failing.load(Ordering::SeqCst) {
            return true;
        }
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl AuditSink for MemoryAuditSink {
    async fn append(&self, verdict: &Verdict) -> Result<(), AuditError> {
        if self.should_fail() {
            return Err(AuditError::Rejected("injected failure".to_owned()));
        }
        self.entries.lock().push(verdict.clone());
        Ok(())
    }
}

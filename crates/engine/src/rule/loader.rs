//! 규칙 파일 로더 -- YAML 규칙 파일을 디스크에서 로드합니다.
//!
//! 규칙 디렉토리 내의 `.yml`/`.yaml` 파일을 스캔하고 파싱합니다.
//! 디렉토리 전체가 하나의 스냅샷으로 게시되므로, 한 파일이라도 실패하면
//! 전체 로딩이 실패합니다.

use std::path::{Path, PathBuf};

use flowgate_core::error::RuleError;
use flowgate_core::types::Action;

use super::types::{RuleDef, RuleSet};

/// 규칙 파일 하나의 최대 크기
const MAX_RULE_FILE_SIZE: u64 = 1024 * 1024; // 1MB
/// 스냅샷 하나의 최대 규칙 수
pub const MAX_RULES_COUNT: usize = 10_000;

/// 규칙 파일 로더
pub struct RuleLoader;

impl RuleLoader {
    /// 디렉토리에서 모든 YAML 규칙 파일을 로드합니다.
    ///
    /// 파일은 이름순으로 읽습니다. 매칭 순서는 이후 `(priority, id)`로 정해지므로
    /// 파일 순서는 에러 보고 순서에만 영향을 줍니다.
    ///
    /// # Errors
    /// - 디렉토리를 읽을 수 없는 경우
    /// - 어떤 파일이라도 읽기/파싱에 실패한 경우
    /// - 규칙 수가 `MAX_RULES_COUNT`를 초과하는 경우
    pub async fn load_directory(
        dir: impl AsRef<Path>,
        default_action: Action,
    ) -> Result<RuleSet, RuleError> {
        let dir = dir.as_ref();
        let paths = Self::rule_files(dir).await?;

        if paths.len() > MAX_RULES_COUNT {
            return Err(RuleError::TooMany {
                count: paths.len(),
                max: MAX_RULES_COUNT,
            });
        }

        let mut rules = Vec::with_capacity(paths.len());
        for path in &paths {
            rules.push(Self::load_file(path).await?);
        }

        tracing::info!(
            dir = %dir.display(),
            count = rules.len(),
            default_action = %default_action,
            "loaded rule files"
        );

        Ok(RuleSet::new(rules).with_default_action(default_action))
    }

    /// 디렉토리 내 규칙 파일 경로를 이름순으로 반환합니다.
    pub async fn rule_files(dir: &Path) -> Result<Vec<PathBuf>, RuleError> {
        let load_err = |reason: String| RuleError::Load {
            path: dir.display().to_string(),
            reason,
        };

        let mut entries = tokio::fs::read_dir(dir)
            .await
            .map_err(|e| load_err(format!("failed to read directory: {e}")))?;

        let mut paths = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| load_err(format!("failed to read directory entry: {e}")))?
        {
            let path = entry.path();
            let is_yaml = path
                .extension()
                .is_some_and(|ext| ext == "yml" || ext == "yaml");
            if is_yaml {
                paths.push(path);
            }
        }

        paths.sort();
        Ok(paths)
    }

    /// 단일 YAML 파일에서 규칙을 로드합니다.
    pub async fn load_file(path: impl AsRef<Path>) -> Result<RuleDef, RuleError> {
        let path = path.as_ref();
        let load_err = |reason: String| RuleError::Load {
            path: path.display().to_string(),
            reason,
        };

        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| load_err(format!("failed to read file metadata: {e}")))?;

        if metadata.len() > MAX_RULE_FILE_SIZE {
            return Err(load_err(format!(
                "file too large: {} bytes (max: {MAX_RULE_FILE_SIZE})",
                metadata.len()
            )));
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| load_err(format!("failed to read file: {e}")))?;

        Self::parse_yaml(&content, &path.display().to_string())
    }

    /// YAML 문자열을 파싱하여 규칙 정의를 생성합니다.
    ///
    /// 술어 검증은 게시 시점에 스토어가 수행합니다.
    pub fn parse_yaml(yaml_str: &str, source: &str) -> Result<RuleDef, RuleError> {
        serde_yaml::from_str(yaml_str).map_err(|e| RuleError::Load {
            path: source.to_owned(),
            reason: format!("YAML parse error: {e}"),
        })
    }
}

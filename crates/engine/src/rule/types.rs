//! 규칙 데이터 타입
//!
//! YAML 규칙 파일에서 역직렬화되는 [`RuleDef`]와, 게시 시점에 컴파일되어
//! 스냅샷에 담기는 [`Rule`]을 정의합니다.

use flowgate_core::error::RuleError;
use flowgate_core::event::TrafficEvent;
use flowgate_core::types::{Action, Protocol};
use aho_corasick::{AhoCorasick, AhoCorasickBuilder, MatchKind};
use regex::bytes::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use super::pattern::IdentityPattern;

/// 규칙 ID 최대 길이
const MAX_RULE_ID_LEN: usize = 256;

/// 컴파일된 정규식 크기 한도 (바이트)
const REGEX_SIZE_LIMIT: usize = 1 << 20;

/// 필터링 규칙 정의 -- 하나의 YAML 규칙 파일에 대응합니다.
///
/// # YAML 스키마
/// ```yaml
/// id: block-telnet
/// title: Block telnet
/// priority: 10
/// action: deny
/// enabled: true
/// match:
///   source: "10.0.0.0/8"
///   destination: "*"
///   protocol: tcp
///   payload:
///     contains: "login:"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDef {
    /// 규칙 고유 ID (우선순위 동률 시 정렬 기준)
    pub id: String,
    /// 규칙 제목
    #[serde(default)]
    pub title: String,
    /// 규칙 설명
    #[serde(default)]
    pub description: String,
    /// 우선순위 (낮을수록 먼저 평가)
    pub priority: i32,
    /// 매칭 시 동작
    pub action: Action,
    /// 활성화 여부
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 매칭 술어
    #[serde(rename = "match", default)]
    pub predicate: MatchSpec,
}

fn default_enabled() -> bool {
    true
}

impl RuleDef {
    /// 모든 트래픽에 매칭되는 규칙을 생성합니다.
    pub fn new(id: impl Into<String>, priority: i32, action: Action) -> Self {
        Self {
            id: id.into(),
            title: String::new(),
            description: String::new(),
            priority,
            action,
            enabled: true,
            predicate: MatchSpec::default(),
        }
    }

    pub fn with_source(mut self, pattern: impl Into<String>) -> Self {
        self.predicate.source = Some(pattern.into());
        self
    }

    pub fn with_destination(mut self, pattern: impl Into<String>) -> Self {
        self.predicate.destination = Some(pattern.into());
        self
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.predicate.protocol = Some(protocol);
        self
    }

    pub fn with_payload(mut self, signature: PayloadSignature) -> Self {
        self.predicate.payload = Some(signature);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// 매칭 술어 -- 모든 필드가 AND로 결합되며, 생략된 필드는 전부 매칭입니다.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchSpec {
    /// 출발지 식별자 패턴
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// 목적지 식별자 패턴
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    /// 프로토콜
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Protocol>,
    /// 페이로드 시그니처
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<PayloadSignature>,
}

/// 페이로드 시그니처
///
/// YAML에서는 키가 정확히 하나인 맵으로 표기합니다 (`contains: "login:"`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "PayloadSpec", into = "PayloadSpec")]
pub enum PayloadSignature {
    /// 부분 바이트열 포함
    Contains(String),
    /// 접두사 일치
    Prefix(String),
    /// 바이트 정규식
    Regex(String),
}

/// `PayloadSignature`의 파일 표현
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct PayloadSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    contains: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    regex: Option<String>,
}

impl TryFrom<PayloadSpec> for PayloadSignature {
    type Error = String;

    fn try_from(spec: PayloadSpec) -> Result<Self, Self::Error> {
        match (spec.contains, spec.prefix, spec.regex) {
            (Some(needle), None, None) => Ok(Self::Contains(needle)),
            (None, Some(prefix), None) => Ok(Self::Prefix(prefix)),
            (None, None, Some(pattern)) => Ok(Self::Regex(pattern)),
            _ => Err("payload must set exactly one of 'contains', 'prefix' or 'regex'".to_owned()),
        }
    }
}

impl From<PayloadSignature> for PayloadSpec {
    fn from(signature: PayloadSignature) -> Self {
        match signature {
            PayloadSignature::Contains(needle) => Self {
                contains: Some(needle),
                ..Self::default()
            },
            PayloadSignature::Prefix(prefix) => Self {
                prefix: Some(prefix),
                ..Self::default()
            },
            PayloadSignature::Regex(pattern) => Self {
                regex: Some(pattern),
                ..Self::default()
            },
        }
    }
}

/// 규칙 집합 -- 게시 단위
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    /// 규칙 목록 (순서 무관, 게시 시 정렬됨)
    #[serde(default)]
    pub rules: Vec<RuleDef>,
    /// 어떤 규칙도 매칭되지 않을 때의 동작
    #[serde(default = "default_action")]
    pub default_action: Action,
}

fn default_action() -> Action {
    Action::Deny
}

impl RuleSet {
    /// 기본 동작이 DENY인 규칙 집합을 생성합니다.
    pub fn new(rules: Vec<RuleDef>) -> Self {
        Self {
            rules,
            default_action: Action::Deny,
        }
    }

    /// 기본 동작을 지정합니다. ALLOW는 의도적으로만 설정해야 합니다.
    pub fn with_default_action(mut self, action: Action) -> Self {
        self.default_action = action;
        self
    }
}

impl Default for RuleSet {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

/// 컴파일된 페이로드 시그니처
#[derive(Debug, Clone)]
enum CompiledSignature {
    Contains(AhoCorasick),
    Prefix(Vec<u8>),
    Regex(Regex),
}

impl CompiledSignature {
    fn compile(rule_id: &str, signature: &PayloadSignature) -> Result<Self, RuleError> {
        let invalid = |reason: String| RuleError::Validation {
            rule_id: rule_id.to_owned(),
            reason,
        };

        match signature {
            PayloadSignature::Contains(needle) => {
                if needle.is_empty() {
                    return Err(invalid("payload 'contains' must not be empty".to_owned()));
                }
                AhoCorasickBuilder::new()
                    .match_kind(MatchKind::LeftmostFirst)
                    .build([needle.as_bytes()])
                    .map(Self::Contains)
                    .map_err(|e| invalid(format!("invalid payload 'contains': {e}")))
            }
            PayloadSignature::Prefix(prefix) => {
                if prefix.is_empty() {
                    return Err(invalid("payload 'prefix' must not be empty".to_owned()));
                }
                Ok(Self::Prefix(prefix.as_bytes().to_vec()))
            }
            PayloadSignature::Regex(pattern) => RegexBuilder::new(pattern)
                .size_limit(REGEX_SIZE_LIMIT)
                .build()
                .map(Self::Regex)
                .map_err(|e| invalid(format!("invalid payload regex: {e}"))),
        }
    }

    fn matches(&self, payload: &[u8]) -> bool {
        match self {
            Self::Contains(literal) => literal.is_match(payload),
            Self::Prefix(prefix) => payload.starts_with(prefix),
            Self::Regex(regex) => regex.is_match(payload),
        }
    }
}

/// 컴파일된 규칙 -- 스냅샷에 게시된 후 변경되지 않습니다.
#[derive(Debug, Clone)]
pub struct Rule {
    /// 규칙 ID
    pub id: String,
    /// 규칙 제목
    pub title: String,
    /// 우선순위
    pub priority: i32,
    /// 매칭 시 동작
    pub action: Action,
    /// 활성화 여부
    pub enabled: bool,
    source: IdentityPattern,
    destination: IdentityPattern,
    protocol: Option<Protocol>,
    payload: Option<CompiledSignature>,
}

impl Rule {
    /// 규칙 정의의 술어를 검증하고 컴파일합니다.
    pub fn compile(def: &RuleDef) -> Result<Self, RuleError> {
        if def.id.len() > MAX_RULE_ID_LEN {
            return Err(RuleError::Validation {
                rule_id: def.id.chars().take(32).collect(),
                reason: format!("rule id must not exceed {MAX_RULE_ID_LEN} characters"),
            });
        }

        let pattern = |field: &str, raw: &Option<String>| -> Result<IdentityPattern, RuleError> {
            match raw {
                None => Ok(IdentityPattern::Any),
                Some(raw) => IdentityPattern::parse(raw).map_err(|reason| RuleError::Validation {
                    rule_id: def.id.clone(),
                    reason: format!("invalid {field} pattern: {reason}"),
                }),
            }
        };

        let source = pattern("source", &def.predicate.source)?;
        let destination = pattern("destination", &def.predicate.destination)?;
        let payload = def
            .predicate
            .payload
            .as_ref()
            .map(|sig| CompiledSignature::compile(&def.id, sig))
            .transpose()?;

        Ok(Self {
            id: def.id.clone(),
            title: def.title.clone(),
            priority: def.priority,
            action: def.action,
            enabled: def.enabled,
            source,
            destination,
            protocol: def.predicate.protocol,
            payload,
        })
    }

    /// 이벤트와 디코딩된 페이로드가 술어를 만족하는지 평가합니다.
    ///
    /// 비용이 낮은 필드부터 검사합니다.
    pub fn matches(&self, event: &TrafficEvent, payload: &[u8]) -> bool {
        if let Some(protocol) = self.protocol {
            if protocol != event.protocol {
                return false;
            }
        }

        if !self.source.matches(&event.source) || !self.destination.matches(&event.destination) {
            return false;
        }

        match &self.payload {
            Some(signature) => signature.matches(payload),
            None => true,
        }
    }

    /// 정렬 키 `(priority, id)`
    pub fn order_key(&self) -> (i32, &str) {
        (self.priority, self.id.as_str())
    }
}

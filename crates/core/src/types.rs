//! 도메인 타입 -- 시스템 전역에서 사용되는 공통 타입
//!
//! 규칙 동작([`Action`]), 프로토콜([`Protocol`]), 플로우 키([`FlowKey`]),
//! 최종 판정([`Verdict`]) 등 모든 크레이트가 공유하는 데이터 구조를 정의합니다.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// 규칙 동작 / 판정 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// 허용
    Allow,
    /// 차단
    Deny,
    /// 허용하되 경보
    Alert,
}

impl Action {
    /// 문자열에서 동작을 파싱합니다. 대소문자를 구분하지 않습니다.
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "allow" | "permit" | "pass" => Some(Self::Allow),
            "deny" | "drop" | "block" => Some(Self::Deny),
            "alert" => Some(Self::Alert),
            _ => None,
        }
    }

    /// 메트릭 레이블 등에 쓰이는 소문자 이름
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
            Self::Alert => "alert",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allow => write!(f, "ALLOW"),
            Self::Deny => write!(f, "DENY"),
            Self::Alert => write!(f, "ALERT"),
        }
    }
}

/// 전송 프로토콜
///
/// 문자열(`"tcp"`)과 IP 프로토콜 번호(`6`) 양쪽 형식으로 역직렬화됩니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    /// 그 밖의 IP 프로토콜 번호
    Other(u8),
}

impl Protocol {
    /// IP 프로토콜 번호로부터 변환합니다.
    pub fn from_number(n: u8) -> Self {
        match n {
            6 => Self::Tcp,
            17 => Self::Udp,
            1 => Self::Icmp,
            other => Self::Other(other),
        }
    }

    /// IP 프로토콜 번호
    pub fn number(&self) -> u8 {
        match self {
            Self::Tcp => 6,
            Self::Udp => 17,
            Self::Icmp => 1,
            Self::Other(n) => *n,
        }
    }

    /// 이름 또는 숫자 문자열에서 파싱합니다.
    pub fn from_str_loose(s: &str) -> Option<Self> {
        let s = s.trim().to_lowercase();
        match s.as_str() {
            "tcp" => Some(Self::Tcp),
            "udp" => Some(Self::Udp),
            "icmp" => Some(Self::Icmp),
            other => other.parse::<u8>().ok().map(Self::from_number),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
            Self::Icmp => write!(f, "icmp"),
            Self::Other(n) => write!(f, "{n}"),
        }
    }
}

impl Serialize for Protocol {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Protocol {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Number(u8),
            Name(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Number(n) => Ok(Self::from_number(n)),
            Repr::Name(name) => Self::from_str_loose(&name).ok_or_else(|| {
                serde::de::Error::custom(format!("unknown protocol '{name}'"))
            }),
        }
    }
}

/// 플로우 식별자 -- (출발지, 목적지, 프로토콜)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowKey {
    /// 검증된 출발지 식별자
    pub source: String,
    /// 목적지 식별자
    pub destination: String,
    /// 프로토콜
    pub protocol: Protocol,
}

impl FlowKey {
    pub fn new(source: impl Into<String>, destination: impl Into<String>, protocol: Protocol) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            protocol,
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}/{}", self.source, self.destination, self.protocol)
    }
}

/// 심각도 레벨
///
/// 운영 알림([`AlertEvent`](crate::event::AlertEvent))의 심각도를 나타냅니다.
/// `Ord` 구현으로 비교가 가능합니다 (`Info < Low < Medium < High < Critical`).
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Severity {
    /// 정보성 이벤트
    #[default]
    Info,
    /// 낮은 심각도
    Low,
    /// 중간 심각도
    Medium,
    /// 높은 심각도
    High,
    /// 치명적 -- 즉시 대응 필요
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "Info"),
            Self::Low => write!(f, "Low"),
            Self::Medium => write!(f, "Medium"),
            Self::High => write!(f, "High"),
            Self::Critical => write!(f, "Critical"),
        }
    }
}

/// verdict에 기록되는 이상 점수
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnomalyScore {
    /// 정규화된 편차 점수
    pub score: f64,
    /// 임계값 초과 여부
    pub exceeded: bool,
}

/// verdict 주석 태그
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "tag", content = "detail")]
pub enum VerdictTag {
    /// ALERT 매칭이 이상 점수 초과로 DENY 승격됨
    Escalated,
    /// ALLOW 매칭이지만 이상 점수가 초과됨 (차단하지 않음)
    FlaggedAllow,
    /// 이벤트를 해석할 수 없어 기본 차단됨
    Malformed(String),
}

/// 이벤트 하나에 대한 최종 판정
///
/// 생성 후 변경되지 않으며, 감사 싱크에 그대로 기록됩니다.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    /// 원본 이벤트 ID
    pub event_id: String,
    /// 이벤트가 속한 플로우
    pub flow: FlowKey,
    /// 판정 결과
    pub outcome: Action,
    /// 매칭된 규칙 ID (기본 동작이면 None)
    pub matched_rule_id: Option<String>,
    /// 이상 점수 (계산되지 않았으면 None)
    pub anomaly: Option<AnomalyScore>,
    /// 평가에 사용된 규칙 스냅샷 버전
    pub snapshot_version: u64,
    /// 판정 시각
    pub decided_at: DateTime<Utc>,
    /// 주석 태그
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<VerdictTag>,
}

impl Verdict {
    /// 특정 태그가 붙어 있는지 확인합니다.
    pub fn has_tag(&self, tag: &VerdictTag) -> bool {
        self.tags.contains(tag)
    }

    /// 진단 태그가 붙은 잘못된 이벤트 판정인지 확인합니다.
    pub fn is_malformed(&self) -> bool {
        self.tags.iter().any(|t| matches!(t, VerdictTag::Malformed(_)))
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Verdict[{}] {} {} rule={} v{}",
            &self.event_id[..8.min(self.event_id.len())],
            self.flow,
            self.outcome,
            self.matched_rule_id.as_deref().unwrap_or("-"),
            self.snapshot_version,
        )
    }
}

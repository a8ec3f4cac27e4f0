//! 이벤트 -- 엔진 입력과 운영 알림
//!
//! [`TrafficEvent`]는 파이프라인이 소비하는 트래픽 이벤트이며 직접 저장되지 않습니다
//! (저장되는 것은 [`Verdict`](crate::types::Verdict)뿐입니다).
//! [`AlertEvent`]는 감사 기록 실패 같은 운영상 문제를 알리는 이벤트입니다.

use std::fmt;

use base64::Engine as _;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MalformedEvent;
use crate::types::{FlowKey, Protocol, Severity};

// --- 모듈명 상수 ---

/// 엔진 모듈명
pub const MODULE_ENGINE: &str = "flowgate-engine";
/// 데몬 모듈명
pub const MODULE_DAEMON: &str = "flowgate-daemon";

/// 이벤트 메타데이터 -- 운영 알림의 발생 시각, 생성 모듈, 추적 ID
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMetadata {
    /// 이벤트 발생 시각
    pub timestamp: DateTime<Utc>,
    /// 이벤트를 생성한 모듈명
    pub source_module: String,
    /// 추적 ID -- 관련 트래픽 이벤트 ID를 그대로 사용합니다
    pub trace_id: String,
}

impl EventMetadata {
    /// 기존 trace_id를 사용하여 새 메타데이터를 생성합니다.
    pub fn new(source_module: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            source_module: source_module.into(),
            trace_id: trace_id.into(),
        }
    }

    /// 새로운 UUID v4 trace_id로 메타데이터를 만듭니다.
    pub fn with_new_trace(source_module: impl Into<String>) -> Self {
        Self::new(source_module, uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for EventMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] source={} trace={}",
            self.timestamp.timestamp(),
            self.source_module,
            self.trace_id,
        )
    }
}

/// 페이로드 인코딩
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadEncoding {
    /// UTF-8 텍스트 그대로
    #[default]
    Text,
    /// 표준 base64
    Base64,
}

/// 복호화가 끝난 페이로드 기술자
///
/// 암호화 계층이 넘겨준 평문을 담습니다. `declared_len`이 있으면
/// 디코딩된 바이트 길이와 일치해야 합니다.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadDescriptor {
    /// `data` 필드의 인코딩
    #[serde(default)]
    pub encoding: PayloadEncoding,
    /// 인코딩된 페이로드
    #[serde(default)]
    pub data: String,
    /// 송신측이 선언한 페이로드 길이 (바이트)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub declared_len: Option<usize>,
}

impl PayloadDescriptor {
    /// 텍스트 페이로드를 만듭니다.
    pub fn text(data: impl Into<String>) -> Self {
        let data = data.into();
        Self {
            encoding: PayloadEncoding::Text,
            declared_len: Some(data.len()),
            data,
        }
    }

    /// 바이너리 페이로드를 base64로 감쌉니다.
    pub fn binary(data: &[u8]) -> Self {
        Self {
            encoding: PayloadEncoding::Base64,
            data: base64::engine::general_purpose::STANDARD.encode(data),
            declared_len: Some(data.len()),
        }
    }

    /// 페이로드를 디코딩하고 선언된 길이를 검증합니다.
    pub fn decode(&self) -> Result<Bytes, MalformedEvent> {
        let bytes = match self.encoding {
            PayloadEncoding::Text => Bytes::copy_from_slice(self.data.as_bytes()),
            PayloadEncoding::Base64 => base64::engine::general_purpose::STANDARD
                .decode(self.data.as_bytes())
                .map(Bytes::from)
                .map_err(|e| MalformedEvent::new(format!("payload is not valid base64: {e}")))?,
        };

        if let Some(declared) = self.declared_len {
            if declared != bytes.len() {
                return Err(MalformedEvent::new(format!(
                    "declared payload length {declared} does not match decoded length {}",
                    bytes.len()
                )));
            }
        }

        Ok(bytes)
    }
}

fn new_event_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// 트래픽 이벤트 -- 파이프라인의 입력 단위
///
/// 인증 계층이 검증한 출발지 식별자를 그대로 신뢰합니다.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficEvent {
    /// 이벤트 고유 ID (없으면 UUID v4 생성)
    #[serde(default = "new_event_id")]
    pub id: String,
    /// 출발지 식별자
    pub source: String,
    /// 목적지 식별자
    pub destination: String,
    /// 프로토콜
    pub protocol: Protocol,
    /// 페이로드 기술자
    #[serde(default)]
    pub payload: PayloadDescriptor,
    /// 관측 시각 (없으면 수신 시각)
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    /// 전송 크기 (바이트)
    #[serde(default)]
    pub size: u64,
}

impl TrafficEvent {
    /// 새 이벤트를 생성합니다. 시각은 현재 시각입니다.
    pub fn new(
        source: impl Into<String>,
        destination: impl Into<String>,
        protocol: Protocol,
        size: u64,
    ) -> Self {
        Self {
            id: new_event_id(),
            source: source.into(),
            destination: destination.into(),
            protocol,
            payload: PayloadDescriptor::default(),
            timestamp: Utc::now(),
            size,
        }
    }

    /// 페이로드를 지정합니다.
    pub fn with_payload(mut self, payload: PayloadDescriptor) -> Self {
        self.payload = payload;
        self
    }

    /// 관측 시각을 지정합니다.
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// 이 이벤트의 플로우 키
    pub fn flow_key(&self) -> FlowKey {
        FlowKey::new(self.source.clone(), self.destination.clone(), self.protocol)
    }

    /// 식별자와 페이로드를 검증하고 디코딩된 페이로드를 반환합니다.
    pub fn validate(&self) -> Result<Bytes, MalformedEvent> {
        if self.source.trim().is_empty() {
            return Err(MalformedEvent::new("empty source identity"));
        }
        if self.destination.trim().is_empty() {
            return Err(MalformedEvent::new("empty destination identity"));
        }
        self.payload.decode()
    }
}

impl fmt::Display for TrafficEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TrafficEvent[{}] {} -> {} proto={} size={}",
            &self.id[..8.min(self.id.len())],
            self.source,
            self.destination,
            self.protocol,
            self.size,
        )
    }
}

/// 운영 알림 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// 재시도 후에도 감사 기록 실패 -- verdict는 지연 재시도 큐에 보관됨
    AuditWriteFailed,
    /// 지연 재시도 큐가 가득 차 가장 오래된 verdict를 버림
    AuditRetryDropped,
    /// 규칙 스냅샷이 없어 수신 중단
    IntakeHalted,
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AuditWriteFailed => write!(f, "audit_write_failed"),
            Self::AuditRetryDropped => write!(f, "audit_retry_dropped"),
            Self::IntakeHalted => write!(f, "intake_halted"),
        }
    }
}

/// 운영 알림 이벤트
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertEvent {
    /// 이벤트 고유 ID
    pub id: String,
    /// 이벤트 메타데이터
    pub metadata: EventMetadata,
    /// 알림 종류
    pub kind: AlertKind,
    /// 심각도
    pub severity: Severity,
    /// 상세 메시지
    pub message: String,
}

impl AlertEvent {
    /// 새로운 trace를 시작하는 알림을 생성합니다.
    pub fn new(kind: AlertKind, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            id: new_event_id(),
            metadata: EventMetadata::with_new_trace(MODULE_ENGINE),
            kind,
            severity,
            message: message.into(),
        }
    }

    /// 트래픽 이벤트 ID에 연결된 알림을 생성합니다.
    pub fn with_trace(
        kind: AlertKind,
        severity: Severity,
        message: impl Into<String>,
        trace_id: impl Into<String>,
    ) -> Self {
        Self {
            id: new_event_id(),
            metadata: EventMetadata::new(MODULE_ENGINE, trace_id),
            kind,
            severity,
            message: message.into(),
        }
    }
}

impl fmt::Display for AlertEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "AlertEvent[{}] kind={} severity={} {}",
            &self.id[..8.min(self.id.len())],
            self.kind,
            self.severity,
            self.message,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_payload_decodes() {
        let payload = PayloadDescriptor::text("GET / HTTP/1.1");
        assert_eq!(payload.decode().unwrap().as_ref(), b"GET / HTTP/1.1");
    }

    #[test]
    fn binary_payload_roundtrips_through_base64() {
        let payload = PayloadDescriptor::binary(&[0x00, 0xff, 0x10]);
        assert_eq!(payload.encoding, PayloadEncoding::Base64);
        assert_eq!(payload.decode().unwrap().as_ref(), &[0x00, 0xff, 0x10]);
    }

    #[test]
    fn invalid_base64_is_malformed() {
        let payload = PayloadDescriptor {
            encoding: PayloadEncoding::Base64,
            data: "%%%not-base64%%%".to_owned(),
            declared_len: None,
        };
        let err = payload.decode().unwrap_err();
        assert!(err.reason.contains("base64"));
    }

    #[test]
    fn declared_length_mismatch_is_malformed() {
        let payload = PayloadDescriptor {
            encoding: PayloadEncoding::Text,
            data: "abc".to_owned(),
            declared_len: Some(10),
        };
        let err = payload.decode().unwrap_err();
        assert!(err.reason.contains("declared payload length 10"));
    }

    #[test]
    fn empty_payload_is_valid() {
        let payload = PayloadDescriptor::default();
        assert!(payload.decode().unwrap().is_empty());
    }

    #[test]
    fn event_with_empty_source_is_malformed() {
        let event = TrafficEvent::new("", "10.0.0.1", Protocol::Tcp, 10);
        let err = event.validate().unwrap_err();
        assert_eq!(err.reason, "empty source identity");
    }

    #[test]
    fn event_deserializes_with_defaults() {
        let json = r#"{"source":"10.0.0.5","destination":"10.0.0.1","protocol":"tcp","size":60}"#;
        let event: TrafficEvent = serde_json::from_str(json).unwrap();
        assert!(!event.id.is_empty());
        assert_eq!(event.protocol, Protocol::Tcp);
        assert_eq!(event.size, 60);
        assert!(event.payload.data.is_empty());
        assert!(event.validate().is_ok());
    }

    #[test]
    fn event_deserializes_payload_and_timestamp() {
        let json = r#"{
            "id": "evt-42",
            "source": "10.0.0.5",
            "destination": "10.0.0.1",
            "protocol": 17,
            "payload": {"encoding": "text", "data": "hello", "declared_len": 5},
            "timestamp": "2026-01-01T00:00:00Z",
            "size": 5
        }"#;
        let event: TrafficEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.id, "evt-42");
        assert_eq!(event.protocol, Protocol::Udp);
        assert_eq!(event.timestamp.timestamp(), 1_767_225_600);
        assert_eq!(event.validate().unwrap().as_ref(), b"hello");
    }

    #[test]
    fn flow_key_from_event() {
        let event = TrafficEvent::new("a", "b", Protocol::Icmp, 0);
        assert_eq!(event.flow_key(), FlowKey::new("a", "b", Protocol::Icmp));
    }

    #[test]
    fn alert_event_with_trace_keeps_trace_id() {
        let alert = AlertEvent::with_trace(
            AlertKind::AuditWriteFailed,
            Severity::High,
            "disk full",
            "evt-1",
        );
        assert_eq!(alert.metadata.trace_id, "evt-1");
        assert_eq!(alert.metadata.source_module, MODULE_ENGINE);
        assert!(alert.to_string().contains("audit_write_failed"));
    }
}

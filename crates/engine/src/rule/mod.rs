//! 필터링 규칙 -- YAML 정의, 술어 컴파일, 버전 스냅샷 스토어
//!
//! # 아키텍처
//! - [`types`]: YAML 규칙 정의([`RuleDef`])와 컴파일된 규칙([`Rule`])
//! - [`pattern`]: 출발지/목적지 식별자 패턴 (any, exact, glob, CIDR)
//! - [`loader`]: 규칙 디렉토리 로딩
//! - [`store`]: 불변 스냅샷의 원자적 게시와 조회

pub mod loader;
pub mod pattern;
pub mod store;
pub mod types;

pub use loader::RuleLoader;
pub use pattern::IdentityPattern;
pub use store::{RuleSnapshot, RuleStore};
pub use types::{MatchSpec, PayloadSignature, Rule, RuleDef, RuleSet};

//! 식별자 패턴 -- 출발지/목적지 매칭
//!
//! | 형식 | 예시 | 의미 |
//! |---|---|---|
//! | `*`, `any` | `*` | 모든 식별자 |
//! | CIDR | `10.0.0.0/8` | IP로 해석되는 식별자 중 대역 안에 있는 것 |
//! | glob | `web-*`, `host-?` | `*`(0자 이상), `?`(정확히 1자) |
//! | 그 외 | `10.0.0.5` | 정확히 일치 |

use std::net::{IpAddr, SocketAddr};

use ipnet::IpNet;

/// 컴파일된 식별자 패턴
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityPattern {
    /// 모든 식별자
    Any,
    /// 정확히 일치
    Exact(String),
    /// glob 패턴
    Glob(String),
    /// IP 대역
    Cidr(IpNet),
}

impl IdentityPattern {
    /// 패턴 문자열을 해석합니다.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err("pattern must not be empty".to_owned());
        }
        if raw == "*" || raw.eq_ignore_ascii_case("any") {
            return Ok(Self::Any);
        }
        if raw.contains('/') {
            return raw
                .parse::<IpNet>()
                .map(Self::Cidr)
                .map_err(|e| format!("'{raw}' is not a valid CIDR block: {e}"));
        }
        if raw.contains('*') || raw.contains('?') {
            return Ok(Self::Glob(raw.to_owned()));
        }
        Ok(Self::Exact(raw.to_owned()))
    }

    /// 식별자가 패턴에 매칭되는지 확인합니다.
    pub fn matches(&self, identity: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(expected) => expected == identity,
            Self::Glob(pattern) => glob_match(pattern, identity),
            Self::Cidr(net) => identity_addr(identity).is_some_and(|addr| net.contains(&addr)),
        }
    }
}

/// 식별자를 IP 주소로 해석합니다. `ip:port` 형식도 허용합니다.
fn identity_addr(identity: &str) -> Option<IpAddr> {
    identity
        .parse::<IpAddr>()
        .ok()
        .or_else(|| identity.parse::<SocketAddr>().ok().map(|sa| sa.ip()))
}

/// `*`와 `?`를 지원하는 glob 매칭
///
/// 재귀 없이 마지막 `*` 위치로 되돌아가는 방식이라 입력 길이에 비례해 동작합니다.
fn glob_match(pattern: &str, text: &str) -> bool {
    if pattern == "*" {
        return true;
    }

    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();

    let mut p = 0;
    let mut t = 0;
    let mut star: Option<usize> = None;
    let mut star_t = 0;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some(p);
            star_t = t;
            p += 1;
        } else if let Some(sp) = star {
            p = sp + 1;
            star_t += 1;
            t = star_t;
        } else {
            return false;
        }
    }

    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }

    p == pattern.len()
}

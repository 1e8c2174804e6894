//! Capability - source が宣言する能力と、そのマッチング

use serde::{Deserialize, Serialize};
use std::fmt;

/// Capability は source が宣言する能力
///
/// # マッチング規則
/// - `Exact("graph.query")` は `graph.query` のみ
/// - `Domain("graph")`（表記 `graph.*`）は `graph.query`, `graph.write.bulk` など
/// - `Any`（表記 `*`）はすべて
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum Capability {
    Exact(String),
    Domain(String),
    Any,
}

impl Capability {
    pub fn parse(s: &str) -> Self {
        let s = s.trim();
        if s == "*" {
            return Capability::Any;
        }
        match s.strip_suffix(".*") {
            Some(domain) if !domain.is_empty() => Capability::Domain(domain.to_string()),
            _ => Capability::Exact(s.to_string()),
        }
    }

    /// 宣言された capability が `requested` を満たすか
    pub fn matches(&self, requested: &str) -> bool {
        match self {
            Capability::Any => true,
            Capability::Exact(name) => name == requested,
            Capability::Domain(domain) => requested
                .strip_prefix(domain.as_str())
                .is_some_and(|rest| rest.starts_with('.')),
        }
    }

    /// 小さいほど具体的。マッチした source の順位付けに使う
    pub fn specificity(&self) -> u8 {
        match self {
            Capability::Exact(_) => 0,
            Capability::Domain(_) => 1,
            Capability::Any => 2,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Exact(name) => f.write_str(name),
            Capability::Domain(domain) => write!(f, "{domain}.*"),
            Capability::Any => f.write_str("*"),
        }
    }
}

impl From<&str> for Capability {
    fn from(s: &str) -> Self {
        Self::parse(s)
    }
}

impl From<String> for Capability {
    fn from(s: String) -> Self {
        Self::parse(&s)
    }
}

impl From<Capability> for String {
    fn from(c: Capability) -> Self {
        c.to_string()
    }
}

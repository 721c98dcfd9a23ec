//! Backend scopes, document sources, and collection naming
//!
//! A request is routed by two closed selectors:
//! - [`ScopeSelector`]: which vector-store deployment to use (personal or department)
//! - [`SourceType`]: which logical collection inside that deployment (mail or doc)
//!
//! Concrete collection names are derived by [`CollectionNamingPolicy`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Named vector-store deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeSelector {
    /// Local instance owned by the user
    Personal,
    /// Shared department instance
    Dept,
}

impl ScopeSelector {
    /// Every configured scope, in status-report order
    pub const ALL: [ScopeSelector; 2] = [ScopeSelector::Personal, ScopeSelector::Dept];

    pub fn as_str(&self) -> &'static str {
        match self {
            ScopeSelector::Personal => "personal",
            ScopeSelector::Dept => "dept",
        }
    }
}

impl fmt::Display for ScopeSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a selector value is outside its closed set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownSelector {
    pub kind: &'static str,
    pub value: String,
}

impl fmt::Display for UnknownSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {} '{}'", self.kind, self.value)
    }
}

impl std::error::Error for UnknownSelector {}

impl FromStr for ScopeSelector {
    type Err = UnknownSelector;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "personal" => Ok(ScopeSelector::Personal),
            "dept" => Ok(ScopeSelector::Dept),
            _ => Err(UnknownSelector {
                kind: "scope",
                value: s.to_string(),
            }),
        }
    }
}

/// Logical document category searched within a scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Mail,
    Doc,
}

impl SourceType {
    pub const ALL: [SourceType; 2] = [SourceType::Mail, SourceType::Doc];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Mail => "mail",
            SourceType::Doc => "doc",
        }
    }

    /// The other source, used when deriving legacy collection names
    pub fn sibling(&self) -> SourceType {
        match self {
            SourceType::Mail => SourceType::Doc,
            SourceType::Doc => SourceType::Mail,
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceType {
    type Err = UnknownSelector;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mail" => Ok(SourceType::Mail),
            "doc" => Ok(SourceType::Doc),
            _ => Err(UnknownSelector {
                kind: "source",
                value: s.to_string(),
            }),
        }
    }
}

/// Canonical collection name: `{scope}_{environment}_{source}_{base_name}`
pub fn resolve(scope: ScopeSelector, environment: &str, source: SourceType, base_name: &str) -> String {
    format!("{}_{}_{}_{}", scope, environment, source, base_name)
}

/// Pre-convention collection names, most specific first
///
/// For `mail` + `my_documents` this is
/// `["mail_my_documents", "doc_my_documents", "my_documents"]`.
pub fn fallback_candidates(source: SourceType, base_name: &str) -> Vec<String> {
    vec![
        format!("{}_{}", source, base_name),
        format!("{}_{}", source.sibling(), base_name),
        base_name.to_string(),
    ]
}

/// Naming policy bound to one deployment environment
#[derive(Debug, Clone)]
pub struct CollectionNamingPolicy {
    environment: String,
    base_name: String,
    /// Operator-supplied legacy names; replaces the derived list when non-empty
    legacy_override: Vec<String>,
}

impl CollectionNamingPolicy {
    pub fn new(environment: impl Into<String>, base_name: impl Into<String>) -> Self {
        Self {
            environment: environment.into(),
            base_name: base_name.into(),
            legacy_override: Vec::new(),
        }
    }

    /// Use a fixed legacy fallback list instead of the derived one
    pub fn with_legacy_names(mut self, names: Vec<String>) -> Self {
        self.legacy_override = names
            .into_iter()
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .collect();
        self
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn base_name(&self) -> &str {
        &self.base_name
    }

    /// Primary collection name for a scope and source
    pub fn primary(&self, scope: ScopeSelector, source: SourceType) -> String {
        resolve(scope, &self.environment, source, &self.base_name)
    }

    /// Legacy names to try, in priority order
    pub fn legacy(&self, source: SourceType) -> Vec<String> {
        if self.legacy_override.is_empty() {
            fallback_candidates(source, &self.base_name)
        } else {
            self.legacy_override.clone()
        }
    }

    /// Primary name followed by legacy names, without duplicates
    pub fn candidates(&self, scope: ScopeSelector, source: SourceType) -> Vec<String> {
        let mut names = vec![self.primary(scope, source)];
        for name in self.legacy(source) {
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }

    /// Prefix shared by every canonical collection of a scope
    pub fn namespace_prefix(&self, scope: ScopeSelector) -> String {
        format!("{}_{}_", scope, self.environment)
    }
}

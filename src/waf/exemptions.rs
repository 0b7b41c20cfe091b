//! Declarative WAF exemption table.
//!
//! Each entry names a path (exact, or prefix when it ends in `*`), an optional
//! method set and the rule categories it skips:
//!
//! ```text
//! POST /auth/login=sqli;* /webhooks/*=sqli+xss;GET,HEAD /docs/*=xss
//! ```
//!
//! An exemption only ever skips its own categories; other rules still run.

use std::collections::HashSet;
use std::str::FromStr;

use axum::http::Method;

use super::rules::RuleCategory;

/// How an exemption matches the request path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathMatcher {
    Exact(String),
    Prefix(String),
}

impl PathMatcher {
    pub fn matches(&self, path: &str) -> bool {
        match self {
            PathMatcher::Exact(p) => path == p,
            PathMatcher::Prefix(p) => path.starts_with(p.as_str()),
        }
    }
}

/// One row of the exemption table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WafExemption {
    pub path: PathMatcher,
    /// `None` applies to every method.
    pub methods: Option<Vec<Method>>,
    pub categories: Vec<RuleCategory>,
}

impl WafExemption {
    pub fn applies_to(&self, method: &Method, path: &str) -> bool {
        self.path.matches(path)
            && self
                .methods
                .as_ref()
                .is_none_or(|methods| methods.contains(method))
    }
}

impl FromStr for WafExemption {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (target, categories) = s
            .split_once('=')
            .ok_or_else(|| format!("expected 'METHOD path=categories', got '{s}'"))?;

        let target = target.trim();
        let (methods, path) = match target.split_once(char::is_whitespace) {
            Some((methods, path)) => (methods.trim(), path.trim()),
            None => ("*", target),
        };

        if !path.starts_with('/') {
            return Err(format!("exemption path must start with '/', got '{path}'"));
        }
        let path = match path.strip_suffix('*') {
            Some(prefix) => PathMatcher::Prefix(prefix.to_string()),
            None => PathMatcher::Exact(path.to_string()),
        };

        let methods = if methods == "*" {
            None
        } else {
            let parsed = methods
                .split(',')
                .map(|m| {
                    Method::from_str(&m.trim().to_ascii_uppercase())
                        .map_err(|e| format!("invalid method '{m}': {e}"))
                })
                .collect::<Result<Vec<_>, _>>()?;
            Some(parsed)
        };

        let categories = categories
            .split('+')
            .map(str::parse)
            .collect::<Result<Vec<RuleCategory>, _>>()?;
        if categories.is_empty() {
            return Err(format!("exemption '{s}' names no categories"));
        }

        Ok(Self {
            path,
            methods,
            categories,
        })
    }
}

/// All exemptions, evaluated together.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExemptionTable {
    entries: Vec<WafExemption>,
}

impl ExemptionTable {
    pub fn new(entries: Vec<WafExemption>) -> Self {
        Self { entries }
    }

    /// The login endpoint carries credential fields by design.
    pub fn default_policy() -> Self {
        Self::new(vec![WafExemption {
            path: PathMatcher::Exact("/auth/login".to_string()),
            methods: Some(vec![Method::POST]),
            categories: vec![RuleCategory::Sqli],
        }])
    }

    /// Union of categories exempted for this method and path.
    pub fn exempted_categories(&self, method: &Method, path: &str) -> HashSet<RuleCategory> {
        self.entries
            .iter()
            .filter(|e| e.applies_to(method, path))
            .flat_map(|e| e.categories.iter().copied())
            .collect()
    }

    pub fn entries(&self) -> &[WafExemption] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromStr for ExemptionTable {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.split(';')
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(str::parse)
            .collect::<Result<Vec<_>, _>>()
            .map(Self::new)
    }
}

//! Heuristic web application firewall.
//!
//! [`WafFilter::inspect`] checks the request path (raw and percent-decoded),
//! the percent-decoded query string and the body (lossy UTF-8, additionally
//! decoded when it is `application/x-www-form-urlencoded`) against the
//! built-in rules. Rules are
//! evaluated in a fixed order, so the same request always produces the same
//! verdict. Exemptions from the [`ExemptionTable`] skip whole categories for a
//! path; skipped rules are still evaluated so that would-have-matched hits
//! show up as false-positive signals in metrics and logs.

pub mod exemptions;
pub mod rules;

use std::borrow::Cow;

use axum::http::Method;
use tracing::{debug, warn};

use crate::metrics;

pub use exemptions::{ExemptionTable, PathMatcher, WafExemption};
pub use rules::{RuleCategory, WafRule, builtin_rules};

/// Rule id reported when a body exceeds the inspection limit.
pub const BODY_LIMIT_RULE_ID: &str = "body-001";
/// Category reported when a body exceeds the inspection limit.
pub const BODY_LIMIT_CATEGORY: &str = "oversize_body";

const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";

/// Default inspection limit for request bodies (1 MiB).
pub const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;

/// WAF settings.
#[derive(Debug, Clone)]
pub struct WafConfig {
    pub max_body_bytes: usize,
    pub exemptions: ExemptionTable,
}

impl Default for WafConfig {
    fn default() -> Self {
        Self {
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            exemptions: ExemptionTable::default_policy(),
        }
    }
}

/// The parts of a request the WAF looks at.
#[derive(Debug, Clone, Copy)]
pub struct WafRequest<'a> {
    pub method: &'a Method,
    pub path: &'a str,
    pub query: Option<&'a str>,
    /// `Content-Type` header value, if any.
    pub content_type: Option<&'a str>,
    pub body: &'a [u8],
}

impl WafRequest<'_> {
    fn is_form_encoded(&self) -> bool {
        self.content_type.is_some_and(|ct| {
            ct.split(';')
                .next()
                .is_some_and(|mime| mime.trim().eq_ignore_ascii_case(FORM_URLENCODED))
        })
    }
}

/// Outcome of an inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WafVerdict {
    Pass,
    Block {
        rule_id: &'static str,
        category: &'static str,
    },
}

impl WafVerdict {
    pub fn is_blocked(&self) -> bool {
        matches!(self, WafVerdict::Block { .. })
    }
}

/// Compiled rule set plus exemption policy.
#[derive(Debug, Clone)]
pub struct WafFilter {
    rules: Vec<WafRule>,
    exemptions: ExemptionTable,
    max_body_bytes: usize,
}

impl WafFilter {
    /// Build a filter with the built-in rules.
    pub fn new(config: WafConfig) -> Result<Self, regex::Error> {
        Ok(Self::with_rules(builtin_rules()?, config))
    }

    pub fn with_rules(rules: Vec<WafRule>, config: WafConfig) -> Self {
        Self {
            rules,
            exemptions: config.exemptions,
            max_body_bytes: config.max_body_bytes,
        }
    }

    pub fn max_body_bytes(&self) -> usize {
        self.max_body_bytes
    }

    /// Verdict for a body that could not be read within the inspection limit.
    pub fn oversize_verdict(&self, path: &str) -> WafVerdict {
        warn!(
            rule_id = BODY_LIMIT_RULE_ID,
            path = %path,
            limit = self.max_body_bytes,
            "WAF blocked request body over inspection limit"
        );
        metrics::record_waf_block(BODY_LIMIT_RULE_ID, BODY_LIMIT_CATEGORY);
        WafVerdict::Block {
            rule_id: BODY_LIMIT_RULE_ID,
            category: BODY_LIMIT_CATEGORY,
        }
    }

    /// Inspect a request. Deterministic for a given request.
    pub fn inspect(&self, req: &WafRequest<'_>) -> WafVerdict {
        if req.body.len() > self.max_body_bytes {
            return self.oversize_verdict(req.path);
        }

        let exempted = self.exemptions.exempted_categories(req.method, req.path);
        let path = decode_path(req.path);
        let query = req.query.map(decode_query).unwrap_or_default();
        let body = String::from_utf8_lossy(req.body);
        let form = if req.is_form_encoded() {
            decode_query(&body)
        } else {
            String::new()
        };
        let targets: [&str; 5] = [req.path, &path, &query, &body, &form];

        for rule in &self.rules {
            let hit = targets.iter().any(|t| !t.is_empty() && rule.matches(t));
            let category = rule.category.as_str();

            if exempted.contains(&rule.category) {
                metrics::record_waf_exempted(category);
                if hit {
                    metrics::record_waf_false_positive(rule.id, category);
                    warn!(
                        rule_id = rule.id,
                        category,
                        path = %req.path,
                        method = %req.method,
                        "WAF rule matched on exempted route, skipping"
                    );
                } else {
                    debug!(rule_id = rule.id, category, path = %req.path, "WAF rule skipped by exemption");
                }
                continue;
            }

            if hit {
                metrics::record_waf_block(rule.id, category);
                warn!(
                    rule_id = rule.id,
                    category,
                    path = %req.path,
                    method = %req.method,
                    "WAF blocked request"
                );
                return WafVerdict::Block {
                    rule_id: rule.id,
                    category,
                };
            }
        }

        WafVerdict::Pass
    }
}

/// Percent-decode a path (`+` stays literal), lossy on invalid UTF-8.
fn decode_path(path: &str) -> String {
    if !path.contains('%') {
        return String::new();
    }
    String::from_utf8_lossy(&urlencoding::decode_binary(path.as_bytes())).into_owned()
}

/// Percent-decode a query string (`+` as space), lossy on invalid UTF-8.
fn decode_query(query: &str) -> String {
    let spaced: Cow<'_, str> = if query.contains('+') {
        Cow::Owned(query.replace('+', " "))
    } else {
        Cow::Borrowed(query)
    };
    let bytes = urlencoding::decode_binary(spaced.as_bytes());
    String::from_utf8_lossy(&bytes).into_owned()
}

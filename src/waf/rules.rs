//! Built-in WAF detection rules.

use std::fmt;
use std::str::FromStr;

use regex::Regex;

/// Family of attack a rule detects. Exemptions are expressed per category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleCategory {
    Sqli,
    Xss,
    PathTraversal,
}

impl RuleCategory {
    pub const ALL: [RuleCategory; 3] = [
        RuleCategory::Sqli,
        RuleCategory::Xss,
        RuleCategory::PathTraversal,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RuleCategory::Sqli => "sqli",
            RuleCategory::Xss => "xss",
            RuleCategory::PathTraversal => "path_traversal",
        }
    }
}

impl fmt::Display for RuleCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuleCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqli" => Ok(RuleCategory::Sqli),
            "xss" => Ok(RuleCategory::Xss),
            "path_traversal" | "traversal" => Ok(RuleCategory::PathTraversal),
            other => Err(format!(
                "unknown WAF category '{other}' (expected sqli, xss or path_traversal)"
            )),
        }
    }
}

/// A compiled detection rule.
#[derive(Debug, Clone)]
pub struct WafRule {
    pub id: &'static str,
    pub category: RuleCategory,
    pattern: Regex,
}

impl WafRule {
    pub fn new(id: &'static str, category: RuleCategory, pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            id,
            category,
            pattern: Regex::new(pattern)?,
        })
    }

    pub fn matches(&self, input: &str) -> bool {
        self.pattern.is_match(input)
    }
}

const BUILTIN_RULES: &[(&str, RuleCategory, &str)] = &[
    // SQL injection
    (
        "sqli-001",
        RuleCategory::Sqli,
        r#"(?i)['"]\s*(or|and)\s+['"]?\w+['"]?\s*(=|like)\s*['"]?\w+"#,
    ),
    ("sqli-002", RuleCategory::Sqli, r"(?i)\b(or|and)\s+\d+\s*=\s*\d+"),
    ("sqli-003", RuleCategory::Sqli, r"(?i)\bunion\b(\s+all)?\s+select\b"),
    (
        "sqli-004",
        RuleCategory::Sqli,
        r"(?i);\s*(drop|delete|insert|update|alter|create|truncate|exec)\b",
    ),
    ("sqli-005", RuleCategory::Sqli, r#"(?i)['"]\s*(--|#|/\*)"#),
    (
        "sqli-006",
        RuleCategory::Sqli,
        r#"(?i)\b(password|passwd|pwd|username)\b\s*['"]?\s*[:=]"#,
    ),
    // Cross-site scripting
    ("xss-001", RuleCategory::Xss, r"(?i)<\s*/?\s*script\b"),
    (
        "xss-002",
        RuleCategory::Xss,
        r"(?i)\bon(error|load|click|mouseover|focus|blur|submit|change|keydown|keyup)\s*=",
    ),
    ("xss-003", RuleCategory::Xss, r"(?i)javascript\s*:"),
    ("xss-004", RuleCategory::Xss, r"(?i)<\s*(iframe|object|embed|svg)\b"),
    // Path traversal
    ("pt-001", RuleCategory::PathTraversal, r"\.\.[/\\]"),
    (
        "pt-002",
        RuleCategory::PathTraversal,
        r"(?i)(%2e%2e|\.%2e|%2e\.)(%2f|%5c|/|\\)|\.\.(%2f|%5c)|%252e%252e",
    ),
    (
        "pt-003",
        RuleCategory::PathTraversal,
        r"(?i)(/etc/(passwd|shadow|hosts)|/proc/self/|c:\\windows\\|/bin/(ba)?sh\b)",
    ),
];

/// Compile the built-in rule set, in evaluation order.
pub fn builtin_rules() -> Result<Vec<WafRule>, regex::Error> {
    BUILTIN_RULES
        .iter()
        .map(|(id, category, pattern)| WafRule::new(id, *category, pattern))
        .collect()
}

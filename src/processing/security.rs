//! Heuristic security scan of generated code.
//!
//! Line-oriented pattern matching. Findings are advisory annotations; the
//! scan never alters or blocks the code.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use crate::inference::tokens::truncate_utf8;

/// Longest snippet attached to a finding, in bytes.
const MAX_SNIPPET_BYTES: usize = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityCategory {
    DynamicEvaluation,
    HtmlInjection,
    ShellInjection,
    HardcodedCredential,
    PrivateKey,
}

impl fmt::Display for SecurityCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SecurityCategory::DynamicEvaluation => "dynamic_evaluation",
            SecurityCategory::HtmlInjection => "html_injection",
            SecurityCategory::ShellInjection => "shell_injection",
            SecurityCategory::HardcodedCredential => "hardcoded_credential",
            SecurityCategory::PrivateKey => "private_key",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecurityFinding {
    pub category: SecurityCategory,
    /// 1-based line number.
    pub line: usize,
    pub message: &'static str,
    pub snippet: String,
}

struct Rule {
    category: SecurityCategory,
    message: &'static str,
    pattern: Regex,
}

const RULE_SOURCES: &[(SecurityCategory, &str, &str)] = &[
    (
        SecurityCategory::DynamicEvaluation,
        "dynamic code evaluation",
        r"(?:^|[^.\w])(?:eval|exec)\s*\(",
    ),
    (
        SecurityCategory::DynamicEvaluation,
        "function constructed from a string",
        r"\bnew\s+Function\s*\(",
    ),
    (
        SecurityCategory::DynamicEvaluation,
        "timer with string argument",
        r#"\bset(?:Timeout|Interval)\s*\(\s*["'`]"#,
    ),
    (
        SecurityCategory::HtmlInjection,
        "raw HTML assignment",
        r"\.(?:inner|outer)HTML\s*\+?=",
    ),
    (
        SecurityCategory::HtmlInjection,
        "document.write sink",
        r"\bdocument\.write(?:ln)?\s*\(",
    ),
    (
        SecurityCategory::HtmlInjection,
        "unsanitized HTML insertion",
        r"dangerouslySetInnerHTML|\binsertAdjacentHTML\s*\(|\bv-html\b",
    ),
    (
        SecurityCategory::ShellInjection,
        "subprocess with shell=True",
        r"\bshell\s*=\s*True\b",
    ),
    (
        SecurityCategory::ShellInjection,
        "shell command execution",
        r"\bos\.(?:system|popen)\s*\(|\bexecSync\s*\(|\bchild_process\b.*\bexec\s*\(|Runtime\.getRuntime\(\)\.exec\s*\(",
    ),
    (
        SecurityCategory::ShellInjection,
        "command run through a shell interpreter",
        r#"Command::new\(\s*"(?:sh|bash|cmd|powershell)"\s*\)"#,
    ),
    (
        SecurityCategory::HardcodedCredential,
        "hardcoded credential literal",
        r#"(?i)\b(?:password|passwd|pwd|secret|api[_-]?key|access[_-]?token|auth[_-]?token|client[_-]?secret)\b["']?\s*[:=]\s*["'][^"'\s]{4,}["']"#,
    ),
    (
        SecurityCategory::HardcodedCredential,
        "provider access key",
        r"\bAKIA[0-9A-Z]{16}\b|\bgh[pousr]_[A-Za-z0-9]{36}\b|\bsk-[A-Za-z0-9_-]{20,}",
    ),
    (
        SecurityCategory::PrivateKey,
        "embedded private key",
        r"-----BEGIN (?:[A-Z]+ )?PRIVATE KEY-----",
    ),
];

fn rules() -> &'static [Rule] {
    static RULES: OnceLock<Vec<Rule>> = OnceLock::new();
    RULES.get_or_init(|| {
        RULE_SOURCES
            .iter()
            .filter_map(|(category, message, source)| match Regex::new(source) {
                Ok(pattern) => Some(Rule {
                    category: *category,
                    message: *message,
                    pattern,
                }),
                Err(e) => {
                    tracing::error!(%category, error = %e, "invalid security pattern");
                    None
                }
            })
            .collect()
    })
}

/// Scan `code` and return findings in line order.
///
/// At most one finding per category per line.
pub fn scan(code: &str) -> Vec<SecurityFinding> {
    let mut findings: Vec<SecurityFinding> = Vec::new();
    for (index, line) in code.lines().enumerate() {
        for rule in rules() {
            if !rule.pattern.is_match(line) {
                continue;
            }
            let line_no = index + 1;
            if findings
                .iter()
                .any(|f| f.line == line_no && f.category == rule.category)
            {
                continue;
            }
            findings.push(SecurityFinding {
                category: rule.category,
                line: line_no,
                message: rule.message,
                snippet: truncate_utf8(line.trim(), MAX_SNIPPET_BYTES).to_string(),
            });
        }
    }
    findings
}

//! Best-effort structural validation.
//!
//! Not a parser: counts delimiters and quotes and reports mismatches as
//! findings. Nothing here rejects code.

use std::fmt;

use serde::Serialize;

const DELIMITER_PAIRS: [(char, char); 3] = [('(', ')'), ('[', ']'), ('{', '}')];

/// Languages without meaningful bracket structure.
const UNSTRUCTURED_LANGUAGES: &[&str] = &["text", "plaintext", "markdown", "txt"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationFinding {
    DelimiterMismatch {
        open: char,
        close: char,
        opened: usize,
        closed: usize,
    },
    UnevenQuotes {
        quote: char,
        count: usize,
    },
}

impl fmt::Display for ValidationFinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationFinding::DelimiterMismatch {
                open,
                close,
                opened,
                closed,
            } => write!(f, "unbalanced '{open}{close}': {opened} opening vs {closed} closing"),
            ValidationFinding::UnevenQuotes { quote, count } => {
                write!(f, "odd number of {quote} quotes ({count})")
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Validity {
    pub balanced: bool,
    pub findings: Vec<ValidationFinding>,
}

/// Check delimiter and quote balance of `code`.
pub fn validate_structure(code: &str, language: Option<&str>) -> Validity {
    let language = language.map(|l| l.to_ascii_lowercase());
    if language
        .as_deref()
        .is_some_and(|l| UNSTRUCTURED_LANGUAGES.contains(&l))
    {
        return Validity {
            balanced: true,
            findings: Vec::new(),
        };
    }

    let mut quotes: Vec<char> = vec!['"', '`'];
    // Rust lifetimes and char literals make single quotes unreliable.
    if language.as_deref() != Some("rust") {
        quotes.push('\'');
    }

    let counts = count_unescaped(code);
    let mut findings = Vec::new();

    for (open, close) in DELIMITER_PAIRS {
        let opened = counts.get(open);
        let closed = counts.get(close);
        if opened != closed {
            findings.push(ValidationFinding::DelimiterMismatch {
                open,
                close,
                opened,
                closed,
            });
        }
    }
    for quote in quotes {
        let count = counts.get(quote);
        if count % 2 != 0 {
            findings.push(ValidationFinding::UnevenQuotes { quote, count });
        }
    }

    Validity {
        balanced: findings.is_empty(),
        findings,
    }
}

#[derive(Default)]
struct CharCounts {
    counts: [usize; 9],
}

impl CharCounts {
    const TRACKED: [char; 9] = ['(', ')', '[', ']', '{', '}', '"', '\'', '`'];

    fn bump(&mut self, c: char) {
        if let Some(i) = Self::TRACKED.iter().position(|t| *t == c) {
            self.counts[i] += 1;
        }
    }

    fn get(&self, c: char) -> usize {
        Self::TRACKED
            .iter()
            .position(|t| *t == c)
            .map(|i| self.counts[i])
            .unwrap_or(0)
    }
}

/// Count tracked characters, skipping any preceded by a backslash.
fn count_unescaped(code: &str) -> CharCounts {
    let mut counts = CharCounts::default();
    let mut chars = code.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            chars.next();
            continue;
        }
        counts.bump(c);
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_closing_brace() {
        let v = validate_structure("function f() { return 1;", Some("javascript"));
        assert!(!v.balanced);
        assert_eq!(
            v.findings,
            vec![ValidationFinding::DelimiterMismatch {
                open: '{',
                close: '}',
                opened: 1,
                closed: 0,
            }]
        );
    }

    #[test]
    fn test_balanced_code() {
        let v = validate_structure("def f(x):\n    return [x, {'a': \"b\"}]", Some("python"));
        assert!(v.balanced);
        assert!(v.findings.is_empty());
    }

    #[test]
    fn test_escaped_quotes_ignored() {
        let v = validate_structure(r#"let s = "say \"hi\"";"#, None);
        assert!(v.balanced, "{:?}", v.findings);
    }

    #[test]
    fn test_uneven_quotes_reported() {
        let v = validate_structure("print(\"oops)", Some("python"));
        assert_eq!(v.findings, vec![ValidationFinding::UnevenQuotes { quote: '"', count: 1 }]);
        assert_eq!(v.findings[0].to_string(), "odd number of \" quotes (1)");
    }

    #[test]
    fn test_rust_lifetimes_not_counted() {
        let v = validate_structure("fn f<'a>(s: &'a str) -> &'a str { s }", Some("rust"));
        assert!(v.balanced);
        let v = validate_structure("fn f<'a>(s: &'a str) -> &'a str { s }", Some("go"));
        assert!(!v.balanced);
    }

    #[test]
    fn test_prose_languages_skipped() {
        let v = validate_structure("a (dangling thought", Some("markdown"));
        assert!(v.balanced);
    }
}

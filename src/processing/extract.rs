//! Code extraction from free-form model output.
//!
//! Fenced blocks win. Without fences, the whole text is treated as code only
//! if it looks like code; otherwise it passes through unchanged.

use serde::Serialize;

/// Share of structural lines that unfenced text must exceed to count as code.
const STRUCTURAL_LINE_RATIO: f64 = 0.5;

const IMPORT_PREFIXES: &[&str] = &[
    "import ", "export ", "from ", "#include", "use ", "require(", "package ",
];

const CONTROL_FLOW_PREFIXES: &[&str] = &[
    "if ", "if(", "for ", "for(", "while ", "while(", "fn ", "pub fn ", "def ", "async def ",
    "function ", "async function ", "class ", "return ", "return;", "switch ", "switch(",
    "match ", "else", "try", "catch", "} else", "elif ",
];

/// Where the extracted code came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CodeOrigin {
    /// A complete fenced block.
    Fenced,
    /// An opening fence with no closing fence.
    UnterminatedFence,
    /// No fences, but the text looks like code.
    Heuristic,
    /// No fences and not code-like; text returned as-is.
    Passthrough,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    pub code: String,
    pub language: Option<String>,
    pub origin: CodeOrigin,
}

#[derive(Debug)]
struct FencedBlock {
    tag: Option<String>,
    body: String,
    terminated: bool,
}

/// Extract the code portion of `raw`.
///
/// With several fenced blocks, the first whose tag matches `language_hint`
/// is chosen, else the first block.
pub fn extract_code(raw: &str, language_hint: Option<&str>) -> Extraction {
    let hint = language_hint
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .map(canonical_language);
    let blocks = find_fenced_blocks(raw);

    let complete: Vec<&FencedBlock> = blocks.iter().filter(|b| b.terminated).collect();
    let chosen = if complete.is_empty() {
        blocks.iter().find(|b| !b.terminated)
    } else {
        hint.as_deref()
            .and_then(|h| {
                complete
                    .iter()
                    .copied()
                    .find(|b| b.tag.as_deref().map(canonical_language).as_deref() == Some(h))
            })
            .or_else(|| complete.first().copied())
    };

    if let Some(block) = chosen {
        return Extraction {
            code: block.body.clone(),
            language: block.tag.as_deref().map(canonical_language).or(hint),
            origin: if block.terminated {
                CodeOrigin::Fenced
            } else {
                CodeOrigin::UnterminatedFence
            },
        };
    }

    let origin = if looks_like_code(raw) {
        CodeOrigin::Heuristic
    } else {
        CodeOrigin::Passthrough
    };
    Extraction {
        code: raw.to_string(),
        language: hint,
        origin,
    }
}

/// Scan for ```` ``` ```` fences line by line.
fn find_fenced_blocks(raw: &str) -> Vec<FencedBlock> {
    let mut blocks = Vec::new();
    let mut open: Option<(Option<String>, Vec<&str>)> = None;

    for line in raw.lines() {
        let trimmed = line.trim();
        match open.take() {
            None => {
                if let Some(rest) = trimmed.strip_prefix("```") {
                    let tag = rest
                        .split_whitespace()
                        .next()
                        .map(|t| t.trim_matches('{').trim_matches('}').to_string())
                        .filter(|t| !t.is_empty());
                    open = Some((tag, Vec::new()));
                }
            }
            Some((tag, mut body)) => {
                if trimmed == "```" {
                    blocks.push(FencedBlock {
                        tag,
                        body: body.join("\n"),
                        terminated: true,
                    });
                } else {
                    body.push(line);
                    open = Some((tag, body));
                }
            }
        }
    }

    if let Some((tag, body)) = open {
        blocks.push(FencedBlock {
            tag,
            body: body.join("\n").trim_end().to_string(),
            terminated: false,
        });
    }
    blocks
}

/// Heuristic: does unfenced text read as source code?
pub fn looks_like_code(text: &str) -> bool {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    if lines.is_empty() {
        return false;
    }

    let has_import = lines
        .iter()
        .any(|l| IMPORT_PREFIXES.iter().any(|p| l.trim_start().starts_with(p)) && !is_prose(l));
    if has_import {
        return true;
    }

    let has_control_flow = lines.iter().any(|l| {
        let t = l.trim();
        starts_with_control_flow(t) && ends_structurally(t)
    });
    if has_control_flow {
        return true;
    }

    if lines.len() < 2 {
        return false;
    }
    let structural = lines
        .iter()
        .filter(|l| ends_structurally(l.trim_end()) || l.starts_with("    ") || l.starts_with('\t'))
        .count();
    structural as f64 / lines.len() as f64 > STRUCTURAL_LINE_RATIO
}

fn starts_with_control_flow(line: &str) -> bool {
    CONTROL_FLOW_PREFIXES.iter().any(|p| line.starts_with(p))
}

/// A trailing `:` only counts after a keyword; prose lead-ins end in `:` too.
fn ends_structurally(line: &str) -> bool {
    line.ends_with(';')
        || line.ends_with('{')
        || line.ends_with('}')
        || (line.ends_with(':') && starts_with_control_flow(line.trim_start()))
        || (line.contains('(') && line.ends_with(')'))
}

/// Sentences ending in a period are prose even if they start like an import.
fn is_prose(line: &str) -> bool {
    let t = line.trim_end();
    t.ends_with('.') && t.split_whitespace().count() > 4
}

/// Normalize common language aliases.
pub fn canonical_language(tag: &str) -> String {
    let lower = tag.trim().to_ascii_lowercase();
    let canonical = match lower.as_str() {
        "py" | "python3" => "python",
        "js" | "jsx" | "node" => "javascript",
        "ts" | "tsx" => "typescript",
        "rs" => "rust",
        "sh" | "bash" | "zsh" | "shell" => "shell",
        "c++" | "cc" | "hpp" => "cpp",
        "golang" => "go",
        "yml" => "yaml",
        "md" => "markdown",
        other => other,
    };
    canonical.to_string()
}

//! Post-processing of raw model output into code.
//!
//! Extraction, structural validation, and the security scan each produce
//! metadata; none of them can fail or reject a response.

pub mod extract;
pub mod security;
pub mod validate;

use serde::Serialize;

pub use extract::{extract_code, looks_like_code, CodeOrigin};
pub use security::{SecurityCategory, SecurityFinding};
pub use validate::{ValidationFinding, Validity};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedResponse {
    pub code: String,
    pub language: Option<String>,
    pub origin: CodeOrigin,
    pub validity: Validity,
    pub security_findings: Vec<SecurityFinding>,
}

impl ProcessedResponse {
    /// Nothing was flagged.
    pub fn is_clean(&self) -> bool {
        self.validity.balanced && self.security_findings.is_empty()
    }
}

/// Stateless processor. Held by the app state so callers share one
/// configuration.
#[derive(Debug, Clone, Default)]
pub struct ResponseProcessor {
    /// Skip the security scan.
    pub skip_security_scan: bool,
}

impl ResponseProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process(&self, raw: &str, language: Option<&str>) -> ProcessedResponse {
        let extraction = extract_code(raw, language);
        // Passthrough text is prose; apostrophes and parentheticals are not code.
        let validity = if extraction.origin == CodeOrigin::Passthrough {
            Validity {
                balanced: true,
                findings: Vec::new(),
            }
        } else {
            validate::validate_structure(&extraction.code, extraction.language.as_deref())
        };
        let security_findings = if self.skip_security_scan {
            Vec::new()
        } else {
            security::scan(&extraction.code)
        };

        tracing::debug!(
            origin = ?extraction.origin,
            language = extraction.language.as_deref().unwrap_or("unknown"),
            code_bytes = extraction.code.len(),
            balanced = validity.balanced,
            validation_findings = validity.findings.len(),
            security_findings = security_findings.len(),
            "response processed"
        );

        ProcessedResponse {
            code: extraction.code,
            language: extraction.language,
            origin: extraction.origin,
            validity,
            security_findings,
        }
    }
}

/// Process with the default processor.
pub fn process(raw: &str, language: Option<&str>) -> ProcessedResponse {
    ResponseProcessor::default().process(raw, language)
}

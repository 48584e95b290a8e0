//! Diagnostics reported back to the host engine
//!
//! Every reconciler failure mode maps to a `Diagnostic` with an optional
//! attribute path, so the engine can point at the offending field in the
//! user's configuration. Warnings do not abort an apply.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Diagnostic severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

/// Path to an attribute in the resource configuration
///
/// Dotted steps with optional index segments, e.g. `processes[1].memory`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributePath {
    steps: Vec<String>,
}

impl AttributePath {
    pub fn root(attribute: impl Into<String>) -> Self {
        Self {
            steps: vec![attribute.into()],
        }
    }

    pub fn attribute(mut self, name: impl Into<String>) -> Self {
        self.steps.push(name.into());
        self
    }

    pub fn index(mut self, idx: usize) -> Self {
        if let Some(last) = self.steps.last_mut() {
            last.push_str(&format!("[{}]", idx));
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl fmt::Display for AttributePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.steps.join("."))
    }
}

/// A single diagnostic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub summary: String,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute: Option<AttributePath>,
}

impl Diagnostic {
    pub fn error(summary: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            summary: summary.into(),
            detail: detail.into(),
            attribute: None,
        }
    }

    pub fn warning(summary: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            summary: summary.into(),
            detail: detail.into(),
            attribute: None,
        }
    }

    /// Attach the attribute path this diagnostic points at
    pub fn with_path(mut self, path: AttributePath) -> Self {
        self.attribute = Some(path);
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sev = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        match &self.attribute {
            Some(path) => write!(f, "{} [{}]: {}: {}", sev, path, self.summary, self.detail),
            None => write!(f, "{}: {}: {}", sev, self.summary, self.detail),
        }
    }
}

/// Ordered collection of diagnostics produced by one reconciler entry point
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostics {
    entries: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, diag: Diagnostic) {
        self.entries.push(diag);
    }

    pub fn error(&mut self, summary: impl Into<String>, detail: impl Into<String>) {
        self.push(Diagnostic::error(summary, detail));
    }

    pub fn error_at(
        &mut self,
        path: AttributePath,
        summary: impl Into<String>,
        detail: impl Into<String>,
    ) {
        self.push(Diagnostic::error(summary, detail).with_path(path));
    }

    pub fn warning(&mut self, summary: impl Into<String>, detail: impl Into<String>) {
        self.push(Diagnostic::warning(summary, detail));
    }

    pub fn extend(&mut self, other: Diagnostics) {
        self.entries.extend(other.entries);
    }

    pub fn has_errors(&self) -> bool {
        self.entries
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.entries.iter()
    }

    /// All error entries joined into one message, for logging
    pub fn error_summary(&self) -> String {
        self.entries
            .iter()
            .filter(|d| d.severity == Severity::Error)
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

impl FromIterator<Diagnostic> for Diagnostics {
    fn from_iter<T: IntoIterator<Item = Diagnostic>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for Diagnostics {
    type Item = Diagnostic;
    type IntoIter = std::vec::IntoIter<Diagnostic>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attribute_path_display() {
        let path = AttributePath::root("processes").index(1).attribute("memory");
        assert_eq!(path.to_string(), "processes[1].memory");
    }

    #[test]
    fn test_has_errors_ignores_warnings() {
        let mut diags = Diagnostics::new();
        diags.warning("credentials unavailable", "broker returned 500");
        assert!(!diags.has_errors());

        diags.error("create failed", "boom");
        assert!(diags.has_errors());
        assert_eq!(diags.len(), 2);
    }

    #[test]
    fn test_diagnostic_display_with_path() {
        let d = Diagnostic::error("conflicting attributes", "cannot set both")
            .with_path(AttributePath::root("no_route"));
        let rendered = d.to_string();
        assert!(rendered.contains("no_route"));
        assert!(rendered.contains("conflicting attributes"));
    }

    #[test]
    fn test_error_summary_skips_warnings() {
        let mut diags = Diagnostics::new();
        diags.warning("w", "warned");
        diags.error("e", "failed");
        let summary = diags.error_summary();
        assert!(summary.contains("failed"));
        assert!(!summary.contains("warned"));
    }
}

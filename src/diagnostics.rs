//! Findings reported by checkers.
//!
//! A diagnostic is data, not an error: emitting one never halts traversal.
//! The records implement `miette::Diagnostic` so drivers can render them with
//! their usual reporting pipeline, and serialize with serde for machine
//! consumption.

use std::fmt;

use serde::Serialize;

use crate::ast::Position;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub message: String,
    pub pos: Position,
    pub severity: Severity,
}

impl Diagnostic {
    pub fn warning(message: impl Into<String>, pos: Position) -> Diagnostic {
        Diagnostic { message: message.into(), pos, severity: Severity::Warning }
    }

    pub fn error(message: impl Into<String>, pos: Position) -> Diagnostic {
        Diagnostic { message: message.into(), pos, severity: Severity::Error }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.pos, self.message)
    }
}

impl std::error::Error for Diagnostic {}

impl miette::Diagnostic for Diagnostic {
    fn severity(&self) -> Option<miette::Severity> {
        Some(match self.severity {
            Severity::Warning => miette::Severity::Warning,
            Severity::Error => miette::Severity::Error,
        })
    }
}

/// Render a batch of diagnostics as a JSON array.
pub fn to_json(diagnostics: &[Diagnostic]) -> serde_json::Result<String> {
    serde_json::to_string(diagnostics)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_position_and_message() {
        let d = Diagnostic::warning("variable dereferenced before check 'p'", Position::line(4));
        assert_eq!(format!("{d}"), "4:0 variable dereferenced before check 'p'");
    }

    #[test]
    fn test_json_rendering() {
        let d = Diagnostic::error("boom", Position::new(1, 2, 3));
        let json = to_json(std::slice::from_ref(&d)).unwrap();
        assert!(json.contains("\"boom\""));
        assert!(json.contains("\"line\":2"));
    }

    #[test]
    fn test_miette_severity_mapping() {
        use miette::Diagnostic as _;
        let warn = Diagnostic::warning("w", Position::default());
        assert_eq!(warn.severity(), Some(miette::Severity::Warning));
        let err = Diagnostic::error("e", Position::default());
        assert_eq!(err.severity(), Some(miette::Severity::Error));
    }
}

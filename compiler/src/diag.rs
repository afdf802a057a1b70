// diag.rs — Unified diagnostics model
//
// Diagnostic types shared by the schedule core, the directive front end, and
// the driver. Scheduling-API misuse surfaces as a `ScheduleError` (fatal) or
// as a warning-level `Diagnostic` pushed into the caller's sink.
//
// Preconditions: none (types only).
// Postconditions: none (types only).
// Failure modes: none.
// Side effects: none.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::ast::Span;

// ── Diagnostic code ──────────────────────────────────────────────────────

/// A stable diagnostic code (e.g., `E0500`, `W0500`).
///
/// Once assigned, a code must never be reassigned to a different meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiagCode(pub &'static str);

impl fmt::Display for DiagCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub mod codes {
    use super::DiagCode;

    // E01xx: directive script syntax
    pub const E0100: DiagCode = DiagCode("E0100");

    // E02xx: directive application
    pub const E0200: DiagCode = DiagCode("E0200"); // unknown stage
    pub const E0201: DiagCode = DiagCode("E0201"); // malformed directive
    pub const E0202: DiagCode = DiagCode("E0202"); // duplicate stage declaration

    // E05xx / W05xx: schedule core
    pub const E0500: DiagCode = DiagCode("E0500"); // named wrapper redefinition
    pub const E0501: DiagCode = DiagCode("E0501"); // deep copy of undefined schedule
    pub const W0500: DiagCode = DiagCode("W0500"); // default wrapper replaced

    // E06xx: clone verification
    pub const E0600: DiagCode = DiagCode("E0600");
}

// ── Severity level ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagLevel {
    Error,
    Warning,
}

impl DiagLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            DiagLevel::Error => "error",
            DiagLevel::Warning => "warning",
        }
    }
}

// ── Diagnostic ───────────────────────────────────────────────────────────

/// A diagnostic emitted by the schedule core or the driver.
///
/// Scheduling-API calls have no source location; `span` is filled in by the
/// directive applier when the call came from a script.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub code: Option<DiagCode>,
    pub level: DiagLevel,
    pub span: Option<Span>,
    pub message: String,
    pub hint: Option<String>,
}

impl Diagnostic {
    pub fn new(level: DiagLevel, message: impl Into<String>) -> Self {
        Self {
            code: None,
            level,
            span: None,
            message: message.into(),
            hint: None,
        }
    }

    pub fn error(code: DiagCode, message: impl Into<String>) -> Self {
        Self::new(DiagLevel::Error, message).with_code(code)
    }

    pub fn warning(code: DiagCode, message: impl Into<String>) -> Self {
        Self::new(DiagLevel::Warning, message).with_code(code)
    }

    /// Attach a stable diagnostic code.
    pub fn with_code(mut self, code: DiagCode) -> Self {
        self.code = Some(code);
        self
    }

    /// Attach a remediation hint.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Attach a source location unless one is already present.
    pub fn at(mut self, span: Span) -> Self {
        self.span.get_or_insert(span);
        self
    }

    pub fn is_error(&self) -> bool {
        self.level == DiagLevel::Error
    }

    /// Machine-readable form for `--diag-format json`.
    pub fn report(&self) -> DiagnosticReport {
        DiagnosticReport {
            code: self.code.map(|c| c.0),
            level: self.level.as_str(),
            message: self.message.clone(),
            hint: self.hint.clone(),
            span: self.span.map(|s| [s.start, s.end]),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = self.level.as_str();
        if let Some(code) = &self.code {
            write!(f, "{}[{}]: {}", level, code, self.message)?;
        } else {
            write!(f, "{}: {}", level, self.message)?;
        }
        if let Some(hint) = &self.hint {
            write!(f, "\n  hint: {}", hint)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticReport {
    pub code: Option<&'static str>,
    pub level: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span: Option<[usize; 2]>,
}

// ── Fatal schedule errors ────────────────────────────────────────────────

/// A fatal scheduling outcome. Aborts the current compilation; never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("wrapper redefinition for callsite \"{name}\" is not allowed")]
    WrapperRedefinition { name: String },

    #[error("internal error: cannot deep-copy an undefined schedule")]
    UndefinedSchedule,
}

impl ScheduleError {
    pub fn code(&self) -> DiagCode {
        match self {
            ScheduleError::WrapperRedefinition { .. } => codes::E0500,
            ScheduleError::UndefinedSchedule => codes::E0501,
        }
    }

    pub fn to_diagnostic(&self) -> Diagnostic {
        let diag = Diagnostic::error(self.code(), self.to_string());
        match self {
            ScheduleError::WrapperRedefinition { .. } => {
                diag.with_hint("each named callsite may be wrapped at most once")
            }
            ScheduleError::UndefinedSchedule => diag,
        }
    }
}

impl From<ScheduleError> for Diagnostic {
    fn from(err: ScheduleError) -> Self {
        err.to_diagnostic()
    }
}

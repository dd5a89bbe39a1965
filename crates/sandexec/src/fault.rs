//! The uniform error object every failed call produces.
//!
//! A [`SandboxFault`] is terminal: nothing in the pipeline retries. Its
//! `Display` form is the user-facing message
//! (`"<Kind>: <detail>"` or `"<Kind> at line <n>: <detail>"`), and
//! [`SandboxFault::payload`] is what the HTTP boundary sends back.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Status code used for every fault: sandbox and user-code failures are bad input.
pub const FAULT_STATUS: u16 = 400;

/// Fault classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultKind {
    KeyError,
    SyntaxError,
    TypeError,
    ValueError,
    /// Malformed or unresolvable module configuration.
    ModuleConfig,
    /// Any other exception, carrying its concrete class name.
    Other(String),
}

impl FaultKind {
    /// The name shown at the start of the message.
    pub fn name(&self) -> &str {
        match self {
            FaultKind::KeyError => "KeyError",
            FaultKind::SyntaxError => "SyntaxError",
            FaultKind::TypeError => "TypeError",
            FaultKind::ValueError => "ValueError",
            FaultKind::ModuleConfig => "ModuleConfigError",
            FaultKind::Other(name) => name,
        }
    }

    /// `true` for the four kinds recognized by class.
    pub fn is_recognized(&self) -> bool {
        matches!(
            self,
            FaultKind::KeyError
                | FaultKind::SyntaxError
                | FaultKind::TypeError
                | FaultKind::ValueError
        )
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A terminal failure of one call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}", self.message())]
pub struct SandboxFault {
    pub kind: FaultKind,
    /// Class name shown in the message. Differs from `kind` for subclasses
    /// of the recognized exceptions.
    pub class_name: String,
    pub detail: String,
    /// 1-based source line, when one could be derived.
    pub line_number: Option<u32>,
    pub status_code: u16,
}

/// JSON body sent to the client for a fault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultPayload {
    pub message: String,
    #[serde(rename = "lineNumber", skip_serializing_if = "Option::is_none", default)]
    pub line_number: Option<u32>,
}

impl SandboxFault {
    pub fn new(kind: FaultKind, detail: impl Into<String>, line_number: Option<u32>) -> Self {
        Self {
            class_name: kind.name().to_string(),
            kind,
            detail: detail.into(),
            line_number,
            status_code: FAULT_STATUS,
        }
    }

    /// Overrides the class name used in the message.
    pub fn with_class_name(mut self, class_name: impl Into<String>) -> Self {
        self.class_name = class_name.into();
        self
    }

    pub fn syntax(detail: impl Into<String>, line_number: Option<u32>) -> Self {
        Self::new(FaultKind::SyntaxError, detail, line_number)
    }

    pub fn type_error(detail: impl Into<String>) -> Self {
        Self::new(FaultKind::TypeError, detail, None)
    }

    pub fn value_error(detail: impl Into<String>) -> Self {
        Self::new(FaultKind::ValueError, detail, None)
    }

    pub fn module_config(detail: impl Into<String>) -> Self {
        Self::new(FaultKind::ModuleConfig, detail, None)
    }

    pub fn other(class_name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(FaultKind::Other(class_name.into()), detail, None)
    }

    /// The user-facing message.
    pub fn message(&self) -> String {
        match self.line_number {
            Some(line) => format!("{} at line {}: {}", self.class_name, line, self.detail),
            None => format!("{}: {}", self.class_name, self.detail),
        }
    }

    pub fn payload(&self) -> FaultPayload {
        FaultPayload {
            message: self.message(),
            line_number: self.line_number,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_without_line() {
        let fault = SandboxFault::type_error("unsupported operand");
        assert_eq!(fault.message(), "TypeError: unsupported operand");
        assert_eq!(fault.to_string(), fault.message());
    }

    #[test]
    fn test_message_with_line() {
        let fault = SandboxFault::new(FaultKind::KeyError, "'missing'", Some(3));
        assert_eq!(fault.message(), "KeyError at line 3: 'missing'");
    }

    #[test]
    fn test_other_kind_uses_class_name() {
        let fault = SandboxFault::new(
            FaultKind::Other("ZeroDivisionError".into()),
            "division by zero",
            Some(1),
        );
        assert_eq!(fault.message(), "ZeroDivisionError at line 1: division by zero");
        assert!(!fault.kind.is_recognized());
    }

    #[test]
    fn test_subclass_name_is_shown() {
        let fault = SandboxFault::new(FaultKind::ValueError, "bad", None)
            .with_class_name("JSONDecodeError");
        assert_eq!(fault.message(), "JSONDecodeError: bad");
        assert_eq!(fault.kind, FaultKind::ValueError);
    }

    #[test]
    fn test_payload_omits_absent_line_number() {
        let fault = SandboxFault::value_error("bad value");
        let json = serde_json::to_value(fault.payload()).expect("encode");
        assert_eq!(json, json!({"message": "ValueError: bad value"}));
    }

    #[test]
    fn test_payload_carries_line_number() {
        let fault = SandboxFault::syntax("invalid syntax", Some(2));
        let json = serde_json::to_value(fault.payload()).expect("encode");
        assert_eq!(
            json,
            json!({"message": "SyntaxError at line 2: invalid syntax", "lineNumber": 2})
        );
    }

    #[test]
    fn test_every_fault_is_a_client_error() {
        let faults = [
            SandboxFault::module_config("bad"),
            SandboxFault::other("TimeoutError", "slow"),
            SandboxFault::syntax("x", None),
        ];
        for fault in faults {
            assert_eq!(fault.status_code, 400);
        }
    }
}

//! What a command produced: a typed result or a classified error.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::deck::Point;
use crate::ids::ErrorId;

/// Result payload of a successful command.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum CommandResult {
    #[default]
    Empty,
    Moved {
        position: Point,
    },
    #[serde(rename_all = "camelCase")]
    TipPickedUp {
        tip_volume: f64,
    },
    Aspirated {
        volume: f64,
    },
    Dispensed {
        volume: f64,
    },
    TemperatureReached {
        celsius: f64,
    },
}

impl CommandResult {
    /// Liquid volume moved by this command, if it reports one.
    pub fn volume(&self) -> Option<f64> {
        match self {
            CommandResult::Aspirated { volume } | CommandResult::Dispensed { volume } => {
                Some(*volume)
            }
            _ => None,
        }
    }
}

/// Stable tags for hardware failures the command layer knows how to describe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorType {
    TipNotDetected,
    TipNotRemoved,
    LiquidNotFound,
    Overpressure,
    StallOrCollision,
    LabwareNotFound,
    ModuleNotReady,
}

impl ErrorType {
    pub const ALL: [ErrorType; 7] = [
        ErrorType::TipNotDetected,
        ErrorType::TipNotRemoved,
        ErrorType::LiquidNotFound,
        ErrorType::Overpressure,
        ErrorType::StallOrCollision,
        ErrorType::LabwareNotFound,
        ErrorType::ModuleNotReady,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::TipNotDetected => "tip-not-detected",
            ErrorType::TipNotRemoved => "tip-not-removed",
            ErrorType::LiquidNotFound => "liquid-not-found",
            ErrorType::Overpressure => "overpressure",
            ErrorType::StallOrCollision => "stall-or-collision",
            ErrorType::LabwareNotFound => "labware-not-found",
            ErrorType::ModuleNotReady => "module-not-ready",
        }
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ErrorType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown error type: {}", s))
    }
}

/// A classified failure with a recovery path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefinedError {
    pub id: ErrorId,
    pub error_type: ErrorType,
    pub detail: String,
}

impl DefinedError {
    pub fn new(error_type: ErrorType, detail: impl Into<String>) -> Self {
        Self {
            id: ErrorId::new(),
            error_type,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for DefinedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error_type, self.detail)
    }
}

/// Error recorded on a failed command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum CommandError {
    Defined(DefinedError),
    /// Anything the command layer did not classify. Never recoverable.
    Undefined { id: ErrorId, detail: String },
}

impl CommandError {
    pub fn undefined(detail: impl Into<String>) -> Self {
        CommandError::Undefined {
            id: ErrorId::new(),
            detail: detail.into(),
        }
    }

    pub fn id(&self) -> &ErrorId {
        match self {
            CommandError::Defined(e) => &e.id,
            CommandError::Undefined { id, .. } => id,
        }
    }

    pub fn as_defined(&self) -> Option<&DefinedError> {
        match self {
            CommandError::Defined(e) => Some(e),
            CommandError::Undefined { .. } => None,
        }
    }

    pub fn error_type(&self) -> Option<ErrorType> {
        self.as_defined().map(|e| e.error_type)
    }
}

impl From<DefinedError> for CommandError {
    fn from(error: DefinedError) -> Self {
        CommandError::Defined(error)
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::Defined(e) => write!(f, "{}", e),
            CommandError::Undefined { detail, .. } => write!(f, "undefined error: {}", detail),
        }
    }
}

/// Terminal outcome handed to the queue and the state store.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    Succeeded(CommandResult),
    Failed(CommandError),
}

impl CommandOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CommandOutcome::Succeeded(_))
    }
}

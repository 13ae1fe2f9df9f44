//! Type-safe ID wrappers for runs, commands and entities.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Generates an ID newtype. Random IDs carry a prefix so logs stay readable.
macro_rules! define_id {
    ($name:ident, $prefix:literal) => {
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Creates a new random ID.
            pub fn new() -> Self {
                Self(format!("{}-{}", $prefix, Uuid::new_v4()))
            }

            /// Creates an ID from an existing string.
            pub fn from_string(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Returns the inner string.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Returns true if the ID is empty or only whitespace.
            pub fn is_blank(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

define_id!(RunId, "run");
define_id!(CommandId, "cmd");
define_id!(ErrorId, "err");

// Entity IDs are chosen by the protocol author in load commands.
define_id!(PipetteId, "pipette");
define_id!(LabwareId, "labware");
define_id!(ModuleId, "module");
define_id!(LiquidId, "liquid");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_id_prefix() {
        let id = RunId::new();
        assert!(id.as_str().starts_with("run-"));
    }

    #[test]
    fn test_command_ids_are_unique() {
        assert_ne!(CommandId::new(), CommandId::new());
    }

    #[test]
    fn test_id_serializes_transparently() {
        let id = PipetteId::from_string("left-p300");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"left-p300\"");

        let parsed: PipetteId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_blank_id() {
        assert!(LabwareId::from_string("  ").is_blank());
        assert!(!LabwareId::from_string("plate-1").is_blank());
    }
}

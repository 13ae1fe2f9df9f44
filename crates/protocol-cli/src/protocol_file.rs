//! Protocol files for `simulate`.
//!
//! A protocol file is JSON: either a bare array of command requests or an
//! object with a `commands` array.
//!
//! ```json
//! {"commands": [
//!   {"commandType": "loadPipette", "intent": "setup",
//!    "params": {"pipetteId": "p1", "pipetteName": "p300_single", "mount": "left", "maxVolume": 300}},
//!   {"commandType": "home", "params": {}}
//! ]}
//! ```

use std::fs;
use std::path::Path;

use protocol_models::{CommandIntent, CommandRequest};
use serde_json::Value;

use crate::commands::Result;

/// Commands loaded from a protocol file, each with a key.
#[derive(Debug, Clone)]
pub struct ProtocolFile {
    pub commands: Vec<CommandRequest>,
}

impl ProtocolFile {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
        Self::parse(&text).map_err(|e| format!("{}: {}", path.display(), e).into())
    }

    pub fn parse(text: &str) -> Result<Self> {
        let document: Value = serde_json::from_str(text)?;
        let list = match document {
            Value::Array(_) => document,
            Value::Object(mut object) => object
                .remove("commands")
                .ok_or("expected a \"commands\" array")?,
            _ => return Err("expected an array of commands".into()),
        };

        let mut commands: Vec<CommandRequest> = Vec::new();
        for (i, value) in array_items(list)?.into_iter().enumerate() {
            let request: CommandRequest = serde_json::from_value(value)
                .map_err(|e| format!("command {}: {}", i + 1, e))?;
            if request.intent == CommandIntent::Fixit {
                return Err(format!(
                    "command {}: fixit commands can only be queued during recovery",
                    i + 1
                )
                .into());
            }
            commands.push(request);
        }
        if commands.is_empty() {
            return Err("protocol has no commands".into());
        }

        Ok(Self::with_keys(commands))
    }

    /// Keyless commands get `step-N`, N being their 1-based position.
    fn with_keys(commands: Vec<CommandRequest>) -> Self {
        let commands = commands
            .into_iter()
            .enumerate()
            .map(|(i, request)| match request.key {
                Some(_) => request,
                None => request.with_key(format!("step-{}", i + 1)),
            })
            .collect();
        Self { commands }
    }

    /// Key of the command at a 1-based position.
    pub fn key_at(&self, index: usize) -> Option<&str> {
        index
            .checked_sub(1)
            .and_then(|i| self.commands.get(i))
            .and_then(|r| r.key.as_deref())
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

fn array_items(value: Value) -> Result<Vec<Value>> {
    match value {
        Value::Array(items) => Ok(items),
        _ => Err("\"commands\" must be an array".into()),
    }
}

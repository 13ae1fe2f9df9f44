//! Deck-level value types shared by commands and state.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ids::{LabwareId, ModuleId};

/// Pipette mount on the gantry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mount {
    Left,
    Right,
}

impl fmt::Display for Mount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mount::Left => write!(f, "left"),
            Mount::Right => write!(f, "right"),
        }
    }
}

/// A point in deck coordinates, in millimeters.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Point {
    /// Creates a new point.
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Returns true if every component is finite.
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

/// Where a piece of labware sits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "id")]
pub enum LabwareLocation {
    /// A deck slot such as `"D1"`.
    Slot(String),
    /// On top of a loaded module.
    Module(ModuleId),
    OffDeck,
}

/// Module hardware models the engine knows how to track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ModuleModel {
    TemperatureModule,
    MagneticModule,
}

/// Axes that can be homed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MotorAxis {
    X,
    Y,
    LeftZ,
    RightZ,
    LeftPlunger,
    RightPlunger,
}

/// Last known location of a pipette.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum PipetteLocation {
    #[serde(rename_all = "camelCase")]
    Well {
        labware_id: LabwareId,
        well_name: String,
    },
    Coordinates {
        point: Point,
    },
}

//! Persisted machine state.
//!
//! The document is plain JSON with PascalCase field names; nibbles are
//! stored as 4-element boolean arrays, MSB first.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::components::alu::Flags;
use crate::components::interrupts::InterruptState;
use crate::error::{EmuError, Result};
use crate::system_config::ADDRESS_SPACE;
use crate::types::Nibble;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CpuState {
    pub registers: [Nibble; 4],
    #[serde(rename = "PC")]
    pub pc: Nibble,
    pub memory: [Nibble; ADDRESS_SPACE],
    pub labels: BTreeMap<String, Nibble>,
    pub call_stack: Vec<Nibble>,
    pub flags: Flags,
    pub interrupts: InterruptState,
}

impl CpuState {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| EmuError::format("<state>", e))
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(|e| EmuError::format(path, e))?;
        fs::write(path, json).map_err(|e| EmuError::io(path, e))?;
        info!(path = %path.display(), "state saved");
        Ok(())
    }

    pub fn read_from(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path).map_err(|e| EmuError::io(path, e))?;
        let state = serde_json::from_str(&json).map_err(|e| EmuError::format(path, e))?;
        info!(path = %path.display(), "state loaded");
        Ok(state)
    }
}

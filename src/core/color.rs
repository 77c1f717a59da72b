use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A named swatch from the note color picker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Swatch {
    pub name: &'static str,
    pub value: &'static str,
}

pub const PALETTE: [Swatch; 10] = [
    Swatch { name: "White", value: "#ffffff" },
    Swatch { name: "Red", value: "#fecaca" },
    Swatch { name: "Orange", value: "#fed7aa" },
    Swatch { name: "Yellow", value: "#fef08a" },
    Swatch { name: "Green", value: "#bbf7d0" },
    Swatch { name: "Teal", value: "#99f6e4" },
    Swatch { name: "Blue", value: "#bfdbfe" },
    Swatch { name: "Purple", value: "#e9d5ff" },
    Swatch { name: "Pink", value: "#fbcfe8" },
    Swatch { name: "Gray", value: "#e2e8f0" },
];

/// Background color token for a note, always a lowercase `#rrggbb` string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NoteColor(String);

impl NoteColor {
    pub fn white() -> Self {
        Self(PALETTE[0].value.to_string())
    }

    /// Accept a palette name ("Teal") or any `#rrggbb` token from the advanced picker.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some(swatch) = PALETTE.iter().find(|p| p.name.eq_ignore_ascii_case(s)) {
            return Ok(Self(swatch.value.to_string()));
        }
        let hex = s
            .strip_prefix('#')
            .ok_or_else(|| Error::InvalidInput(format!("not a color: {}", s)))?;
        if hex.len() != 6 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::InvalidInput(format!("not a color: {}", s)));
        }
        Ok(Self(format!("#{}", hex.to_ascii_lowercase())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Palette name when the token is one of the preset swatches.
    pub fn name(&self) -> Option<&'static str> {
        PALETTE.iter().find(|p| p.value == self.0).map(|p| p.name)
    }
}

impl Default for NoteColor {
    fn default() -> Self {
        Self::white()
    }
}

impl fmt::Display for NoteColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Categories of privacy-sensitive content the processor can redact.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionKind {
    LicensePlates,
    StreetSigns,
    BlockNumbers,
}

impl DetectionKind {
    /// Processing order within a frame.
    pub const ALL: [DetectionKind; 3] = [
        DetectionKind::LicensePlates,
        DetectionKind::BlockNumbers,
        DetectionKind::StreetSigns,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionKind::LicensePlates => "license_plates",
            DetectionKind::StreetSigns => "street_signs",
            DetectionKind::BlockNumbers => "block_numbers",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            DetectionKind::LicensePlates => "License Plates",
            DetectionKind::StreetSigns => "Street Signs",
            DetectionKind::BlockNumbers => "Block Numbers",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            DetectionKind::LicensePlates => "YOLO-based vehicle license plate detection",
            DetectionKind::StreetSigns => "Green street sign detection by HSV color masking",
            DetectionKind::BlockNumbers => "OCR block number detection",
        }
    }

    /// Short name of the detection technique.
    pub fn method(&self) -> &'static str {
        match self {
            DetectionKind::LicensePlates => "YOLO",
            DetectionKind::StreetSigns => "HSV",
            DetectionKind::BlockNumbers => "OCR",
        }
    }
}

impl fmt::Display for DetectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DetectionKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_lowercase().replace('-', "_").as_str() {
            "license_plates" | "plates" => Ok(DetectionKind::LicensePlates),
            "street_signs" | "signs" => Ok(DetectionKind::StreetSigns),
            "block_numbers" | "blocks" => Ok(DetectionKind::BlockNumbers),
            other => Err(anyhow!("unknown detection kind '{}'", other)),
        }
    }
}

/// Per-kind on/off toggles. Everything is off until the user enables it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionSettings {
    pub license_plates: bool,
    pub street_signs: bool,
    pub block_numbers: bool,
}

impl DetectionSettings {
    pub fn all() -> Self {
        Self {
            license_plates: true,
            street_signs: true,
            block_numbers: true,
        }
    }

    pub fn is_enabled(&self, kind: DetectionKind) -> bool {
        match kind {
            DetectionKind::LicensePlates => self.license_plates,
            DetectionKind::StreetSigns => self.street_signs,
            DetectionKind::BlockNumbers => self.block_numbers,
        }
    }

    pub fn set(&mut self, kind: DetectionKind, enabled: bool) {
        match kind {
            DetectionKind::LicensePlates => self.license_plates = enabled,
            DetectionKind::StreetSigns => self.street_signs = enabled,
            DetectionKind::BlockNumbers => self.block_numbers = enabled,
        }
    }

    /// Enabled kinds in processing order.
    pub fn enabled(&self) -> Vec<DetectionKind> {
        DetectionKind::ALL
            .into_iter()
            .filter(|kind| self.is_enabled(*kind))
            .collect()
    }

    /// Parse a comma-separated list of kinds; listed kinds are enabled, the rest disabled.
    pub fn from_csv(value: &str) -> Result<Self> {
        let mut settings = Self::default();
        for entry in value.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            settings.set(entry.parse()?, true);
        }
        Ok(settings)
    }

    /// Parse a live settings update. The toggles may be sent bare or wrapped
    /// as `{"detection_settings": {...}}`; a body naming no known toggle is
    /// rejected so a malformed update cannot switch redaction off.
    pub fn from_update(body: &serde_json::Value) -> Result<Self> {
        let inner = body.get("detection_settings").unwrap_or(body);
        let fields = inner
            .as_object()
            .ok_or_else(|| anyhow!("detection settings must be a JSON object"))?;
        if !DetectionKind::ALL
            .iter()
            .any(|kind| fields.contains_key(kind.as_str()))
        {
            return Err(anyhow!("settings update names no detection kind"));
        }
        Ok(serde_json::from_value(inner.clone())?)
    }
}

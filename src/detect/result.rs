use serde::{Deserialize, Serialize};

use crate::region::Region;
use crate::settings::DetectionKind;

/// A region of sensitive content found in a frame.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub kind: DetectionKind,
    pub region: Region,
    /// 0..=1. Fixed-region fallbacks report 0.
    pub confidence: f32,
    /// Placed by a fallback rather than found in the frame. Still redacted,
    /// but not counted as a detection.
    #[serde(default)]
    pub fixed: bool,
}

impl Detection {
    pub fn new(kind: DetectionKind, region: Region, confidence: f32) -> Self {
        Self {
            kind,
            region,
            confidence,
            fixed: false,
        }
    }

    /// A region blurred unconditionally because no real detector is available.
    pub fn fixed(kind: DetectionKind, region: Region) -> Self {
        Self {
            kind,
            region,
            confidence: 0.0,
            fixed: true,
        }
    }
}

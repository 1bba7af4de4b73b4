//! Capture selection types and frame states
//!
//! These are the knobs a caller can turn on a capture session (TV norm,
//! physical input, scan policy) and the completeness state carried by every
//! assembled frame.

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Analog TV norm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TvNorm {
    /// 525 lines, 720x480 picture
    #[default]
    Ntsc,
    /// 625 lines, 720x576 picture
    Pal,
}

impl TvNorm {
    /// Full picture width in pixels
    pub fn width(self) -> u32 {
        720
    }

    /// Full (two-field) picture height in lines
    pub fn height(self) -> u32 {
        match self {
            TvNorm::Ntsc => 480,
            TvNorm::Pal => 576,
        }
    }
}

/// Physical video input on the capture stick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TvInput {
    #[default]
    Composite,
    #[serde(alias = "s-video")]
    Svideo,
}

/// Mapping from packet sequence number to destination buffer offset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanType {
    /// Every field becomes its own half-height picture
    #[default]
    Progressive,
    /// Only odd fields are kept, even fields are ignored
    Discard,
    /// Odd and even fields are woven into one full-height picture
    Interleaved,
}

impl ScanType {
    /// Whether emitted pictures carry both fields
    pub fn is_full_height(self) -> bool {
        matches!(self, ScanType::Interleaved)
    }
}

/// Completeness of an assembled frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameState {
    /// Freshly acquired, nothing written yet
    #[default]
    Start,
    /// Field packets are being written
    InProgress,
    /// Terminal packet reached with every packet accounted for
    Complete,
    /// Terminal packet reached with packets missing
    Partial,
}

impl FrameState {
    /// True once the terminal sequence number has been evaluated
    pub fn is_finished(self) -> bool {
        matches!(self, FrameState::Complete | FrameState::Partial)
    }
}

macro_rules! selection_impls {
    ($ty:ident, $kind:literal, [$(($num:literal, $name:literal, $variant:ident)),+ $(,)?]) => {
        impl TryFrom<i32> for $ty {
            type Error = ProtocolError;

            fn try_from(value: i32) -> Result<Self, Self::Error> {
                match value {
                    $($num => Ok($ty::$variant),)+
                    _ => Err(ProtocolError::InvalidSelection { kind: $kind, value }),
                }
            }
        }

        impl FromStr for $ty {
            type Err = ProtocolError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let lower = s.trim().to_ascii_lowercase();
                $(if lower == $name {
                    return Ok($ty::$variant);
                })+
                match lower.parse::<i32>() {
                    Ok(n) => $ty::try_from(n),
                    Err(_) => Err(ProtocolError::InvalidSelection { kind: $kind, value: -1 }),
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let name = match self {
                    $($ty::$variant => $name,)+
                };
                f.write_str(name)
            }
        }
    };
}

selection_impls!(TvNorm, "norm", [(0, "ntsc", Ntsc), (1, "pal", Pal)]);
selection_impls!(TvInput, "input", [(0, "composite", Composite), (1, "svideo", Svideo)]);
selection_impls!(
    ScanType,
    "scan type",
    [
        (0, "progressive", Progressive),
        (1, "discard", Discard),
        (2, "interleaved", Interleaved)
    ]
);

pub mod disassemble;
pub mod inject;
pub mod integrity;
pub mod layout;
pub mod patcher;
pub mod session;
pub mod variants;

pub mod image {
    pub use resopatch_image::*;
}
pub mod scanner {
    pub use resopatch_scanner::*;
}
pub mod text {
    pub use resopatch_text::*;
}

use std::path::PathBuf;

use resopatch_image::MemoryAccessError;
use resopatch_text::TextError;

#[cfg(feature = "serde")]
use serde::Serialize;

pub use layout::{LayoutParameters, Resolution};
pub use patcher::FixKind;
pub use session::{patch_file, PatchOptions, PatchReport, PatchSession};
pub use variants::{Game, Variant, VariantProfile};

/// Step of a patch run, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "lowercase")]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub enum Stage {
    Validate,
    Read,
    Identify,
    Layout,
    Fields,
    Inject,
    Fixes,
    Text,
    Write,
}

#[derive(Debug)]
pub enum PatchError {
    UnrecognizedVariant {
        checksum: u32,
    },
    OutOfRangeRequest {
        width: u16,
        height: u16,
        violation: layout::RangeViolation,
    },
    MissingImage {
        path: PathBuf,
    },
    Io {
        stage: Stage,
        path: PathBuf,
        source: std::io::Error,
    },
    ImageAccess {
        stage: Stage,
        source: MemoryAccessError,
    },
    FieldOverflow {
        stage: Stage,
        name: &'static str,
        value: i64,
    },
    MalformedFragment {
        name: &'static str,
        offset: usize,
    },
    Text(TextError),
    IntegrityCheckFailed {
        stage: Stage,
    },
}

impl PatchError {
    /// Step the run failed in
    pub fn stage(&self) -> Stage {
        match self {
            Self::UnrecognizedVariant { .. } => Stage::Identify,
            Self::OutOfRangeRequest { .. } => Stage::Validate,
            Self::MissingImage { .. } => Stage::Read,
            Self::Io { stage, .. }
            | Self::ImageAccess { stage, .. }
            | Self::FieldOverflow { stage, .. }
            | Self::IntegrityCheckFailed { stage } => *stage,
            Self::MalformedFragment { .. } => Stage::Inject,
            Self::Text(_) => Stage::Text,
        }
    }
    pub fn reason(&self) -> FailureReason {
        match self {
            Self::UnrecognizedVariant { .. } => FailureReason::UnrecognizedVariant,
            Self::OutOfRangeRequest { .. } => FailureReason::OutOfRangeRequest,
            Self::MissingImage { .. } => FailureReason::MissingImage,
            Self::Io { .. } => FailureReason::Io,
            Self::ImageAccess { .. } | Self::MalformedFragment { .. } => {
                FailureReason::ImageAccess
            }
            Self::FieldOverflow { .. } => FailureReason::FieldOverflow,
            Self::Text(_) => FailureReason::Text,
            Self::IntegrityCheckFailed { .. } => FailureReason::Integrity,
        }
    }
}

impl std::error::Error for PatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::ImageAccess { source, .. } => Some(source),
            Self::Text(source) => Some(source),
            _ => None,
        }
    }
}

impl std::fmt::Display for PatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: ", self.stage())?;
        match self {
            Self::UnrecognizedVariant { checksum } => {
                write!(f, "unrecognized executable (checksum {checksum:#010x})")
            }
            Self::OutOfRangeRequest {
                width,
                height,
                violation,
            } => write!(f, "{width}x{height} rejected: {violation}"),
            Self::MissingImage { path } => write!(f, "{} does not exist", path.display()),
            Self::Io { path, source, .. } => write!(f, "{}: {source}", path.display()),
            Self::ImageAccess { source, .. } => write!(f, "{source}"),
            Self::FieldOverflow { name, value, .. } => {
                write!(f, "value {value} does not fit field {name}")
            }
            Self::MalformedFragment { name, offset } => {
                write!(f, "{name} slot at {offset} lies outside its fragment")
            }
            Self::Text(source) => write!(f, "{source}"),
            Self::IntegrityCheckFailed { .. } => write!(f, "integrity check failed"),
        }
    }
}

impl From<TextError> for PatchError {
    fn from(value: TextError) -> Self {
        Self::Text(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub enum FailureReason {
    UnrecognizedVariant,
    OutOfRangeRequest,
    MissingImage,
    Io,
    ImageAccess,
    FieldOverflow,
    Text,
    Integrity,
}

/// Outcome summary of a patch run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct PatchResult {
    pub successful: bool,
    pub reason: Option<FailureReason>,
}

impl<T> From<&Result<T, PatchError>> for PatchResult {
    fn from(result: &Result<T, PatchError>) -> Self {
        match result {
            Ok(_) => Self {
                successful: true,
                reason: None,
            },
            Err(e) => Self {
                successful: false,
                reason: Some(e.reason()),
            },
        }
    }
}

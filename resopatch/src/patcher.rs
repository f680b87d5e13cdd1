use std::ops::Range;

use resopatch_image::{MemoryMutTrait, Scalar};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{layout::LayoutParameters, variants::FieldPatch, PatchError, Stage};

/// Optional fix independent of the requested resolution
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[strum(serialize_all = "kebab-case")]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum FixKind {
    /// Zero the per-frame delays that make animations run fast at high frame rates
    AnimationTiming,
    /// Skip the exclusive fullscreen switch
    WindowedMode,
    /// Raise the cap on sprites drawn per frame
    SpriteLimit,
}

/// Constant written at a fixed offset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawPatch {
    pub offset: usize,
    pub value: Scalar,
}

impl RawPatch {
    pub const fn new(offset: usize, value: Scalar) -> Self {
        Self { offset, value }
    }
    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.value.width()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fix {
    pub kind: FixKind,
    pub patches: &'static [RawPatch],
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct AppliedField {
    pub name: &'static str,
    pub offset: usize,
    pub value: Scalar,
}

/// Resolve every field for `layout`, then write them. A field that does not fit its width
/// fails the whole set before anything is written.
pub fn apply_fields<M: MemoryMutTrait>(
    image: &mut M,
    fields: &[FieldPatch],
    layout: &LayoutParameters,
) -> Result<Vec<AppliedField>, PatchError> {
    let resolved = fields
        .iter()
        .map(|field| {
            field
                .resolve(layout)
                .map(|value| AppliedField {
                    name: field.name,
                    offset: field.offset,
                    value,
                })
                .ok_or(PatchError::FieldOverflow {
                    stage: Stage::Fields,
                    name: field.name,
                    value: field.raw_value(layout),
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    for field in &resolved {
        image
            .write_scalar(field.offset, field.value)
            .map_err(|source| PatchError::ImageAccess {
                stage: Stage::Fields,
                source,
            })?;
        tracing::debug!(
            field = field.name,
            offset = format_args!("{:#x}", field.offset),
            value = %field.value,
            "patched field"
        );
    }
    Ok(resolved)
}

/// Apply every write of `fix` in order
pub fn apply_fix<M: MemoryMutTrait>(image: &mut M, fix: &Fix) -> Result<(), PatchError> {
    for patch in fix.patches {
        image
            .write_scalar(patch.offset, patch.value)
            .map_err(|source| PatchError::ImageAccess {
                stage: Stage::Fixes,
                source,
            })?;
    }
    tracing::debug!(fix = %fix.kind, writes = fix.patches.len(), "applied fix");
    Ok(())
}

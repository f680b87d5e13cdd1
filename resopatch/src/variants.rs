//! Allow-list of supported executables.
//!
//! Every known build is one immutable [`VariantProfile`] keyed by the checksum of its
//! file. Supporting another build means appending a profile; existing entries never
//! change.

pub mod emperor;
pub mod fragments;
pub mod zeus;

use std::{collections::HashMap, ops::Range};

use anyhow::{bail, ensure, Result};
use itertools::Itertools;
use resopatch_image::{ExeImage, Scalar};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{
    inject::{CaveInjection, SlotKind, JMP_LEN},
    layout::{LayoutParameters, LayoutValue, ViewportMetrics},
    patcher::{Fix, FixKind},
};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString, strum::EnumIter,
)]
#[strum(ascii_case_insensitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Game {
    Zeus,
    Emperor,
}

impl Game {
    pub fn metrics(self) -> &'static ViewportMetrics {
        match self {
            Game::Zeus => &zeus::METRICS,
            Game::Emperor => &emperor::METRICS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumIter)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Variant {
    Unrecognized,
    ZeusRetail,
    ZeusDigital,
    EmperorRetail,
    EmperorDigital,
}

impl Variant {
    pub fn game(self) -> Option<Game> {
        match self {
            Variant::Unrecognized => None,
            Variant::ZeusRetail | Variant::ZeusDigital => Some(Game::Zeus),
            Variant::EmperorRetail | Variant::EmperorDigital => Some(Game::Emperor),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldWidth {
    U8,
    U16,
    U32,
}

impl FieldWidth {
    pub const fn len(self) -> usize {
        match self {
            FieldWidth::U8 => 1,
            FieldWidth::U16 => 2,
            FieldWidth::U32 => 4,
        }
    }
    /// `None` if `value` does not fit
    pub fn encode(self, value: i64) -> Option<Scalar> {
        Some(match self {
            FieldWidth::U8 => Scalar::U8(value.try_into().ok()?),
            FieldWidth::U16 => Scalar::U16(value.try_into().ok()?),
            FieldWidth::U32 => Scalar::U32(value.try_into().ok()?),
        })
    }
}

/// Fixed-offset field overwritten with a layout value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldPatch {
    pub name: &'static str,
    pub offset: usize,
    pub width: FieldWidth,
    pub source: LayoutValue,
    /// Added to the layout value before encoding
    pub adjust: i32,
}

impl FieldPatch {
    pub const fn new(
        name: &'static str,
        offset: usize,
        width: FieldWidth,
        source: LayoutValue,
    ) -> Self {
        Self {
            name,
            offset,
            width,
            source,
            adjust: 0,
        }
    }
    pub const fn u8(name: &'static str, offset: usize, source: LayoutValue) -> Self {
        Self::new(name, offset, FieldWidth::U8, source)
    }
    pub const fn u16(name: &'static str, offset: usize, source: LayoutValue) -> Self {
        Self::new(name, offset, FieldWidth::U16, source)
    }
    pub const fn u32(name: &'static str, offset: usize, source: LayoutValue) -> Self {
        Self::new(name, offset, FieldWidth::U32, source)
    }
    pub const fn adjust(mut self, adjust: i32) -> Self {
        self.adjust = adjust;
        self
    }
    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.width.len()
    }
    /// Unencoded value for `layout`, may be out of range for the field
    pub fn raw_value(&self, layout: &LayoutParameters) -> i64 {
        layout.value(self.source) as i64 + self.adjust as i64
    }
    pub fn resolve(&self, layout: &LayoutParameters) -> Option<Scalar> {
        self.width.encode(self.raw_value(layout))
    }
}

/// Location of the options-menu resolution label in the string table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextTarget {
    pub file_name: &'static str,
    pub group: usize,
    pub index: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct VariantProfile {
    pub variant: Variant,
    pub game: Game,
    pub name: &'static str,
    pub checksum: u32,
    /// File size of the unmodified build
    pub image_len: usize,
    pub image_base: usize,
    pub metrics: &'static ViewportMetrics,
    pub fields: &'static [FieldPatch],
    /// Empty when no cave has been located for this build
    pub caves: &'static [CaveInjection],
    pub fixes: &'static [Fix],
    pub text: Option<TextTarget>,
}

pub static VARIANTS: &[VariantProfile] = &[
    zeus::RETAIL,
    zeus::DIGITAL,
    emperor::RETAIL,
    emperor::DIGITAL,
];

pub fn lookup(table: &[VariantProfile], checksum: u32) -> Option<&VariantProfile> {
    table.iter().find(|p| p.checksum == checksum)
}

/// Profile matching the image checksum exactly, if any
pub fn identify<'t>(table: &'t [VariantProfile], image: &ExeImage) -> Option<&'t VariantProfile> {
    let checksum = image.checksum();
    let profile = lookup(table, checksum);
    tracing::debug!(
        checksum = format_args!("{checksum:#010x}"),
        variant = %profile.map_or(Variant::Unrecognized, |p| p.variant),
        "identified image"
    );
    profile
}

impl VariantProfile {
    pub fn fix(&self, kind: FixKind) -> Option<&Fix> {
        self.fixes.iter().find(|f| f.kind == kind)
    }

    pub fn cave(&self, name: &str) -> Option<&CaveInjection> {
        self.caves.iter().find(|c| c.name == name)
    }

    /// Every byte range the profile writes to, labelled
    pub fn write_ranges(&self) -> Vec<(String, Range<usize>)> {
        let fields = self.fields.iter().map(|f| (f.name.to_string(), f.range()));
        let caves = self.caves.iter().flat_map(|c| {
            [
                (format!("{} cave", c.name), c.cave_range()),
                (format!("{} entry", c.name), c.entry_range()),
            ]
        });
        let fixes = self.fixes.iter().flat_map(|f| {
            f.patches
                .iter()
                .map(move |p| (format!("{} fix", f.kind), p.range()))
        });
        fields.chain(caves).chain(fixes).collect()
    }

    /// Check the profile is internally consistent: no two writes overlap, every write is
    /// inside the image, and every fragment is well formed.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.variant.game() == Some(self.game),
            "{}: variant {} does not belong to {}",
            self.name,
            self.variant,
            self.game
        );
        ensure!(!self.fields.is_empty(), "{}: no fields", self.name);

        for (name, range) in self.write_ranges() {
            ensure!(
                !range.is_empty() && range.end <= self.image_len,
                "{}: {name} {range:x?} outside image of {:#x} bytes",
                self.name,
                self.image_len
            );
        }

        // furthest reaching write so far, per owner: `None` for fields and caves, the fix
        // label for fixes. Fixes may revisit bytes of another fix, never a field or cave.
        let mut reach: HashMap<Option<String>, (String, Range<usize>)> = HashMap::new();
        for (name, range) in self
            .write_ranges()
            .into_iter()
            .sorted_by_key(|(_, r)| (r.start, r.end))
        {
            let owner = name.ends_with(" fix").then(|| name.clone());
            let conflict = reach
                .iter()
                .filter(|(key, _)| owner.is_none() || key.is_none() || **key == owner)
                .map(|(_, earlier)| earlier)
                .find(|(_, earlier)| earlier.end > range.start);
            if let Some((earlier_name, earlier)) = conflict {
                bail!(
                    "{}: {earlier_name} {earlier:x?} overlaps {name} {range:x?}",
                    self.name,
                );
            }
            match reach.get(&owner) {
                Some((_, furthest)) if furthest.end >= range.end => {}
                _ => {
                    reach.insert(owner, (name, range));
                }
            }
        }

        let image_range = self.image_base..self.image_base + self.image_len;
        for cave in self.caves {
            ensure!(
                cave.entry_len >= JMP_LEN,
                "{}: {} entry of {} bytes cannot hold a jmp rel32",
                self.name,
                cave.name,
                cave.entry_len
            );
            let mut resumes = 0;
            for (a, b) in cave
                .fragment
                .slots
                .iter()
                .sorted_by_key(|s| s.offset)
                .tuple_windows()
            {
                ensure!(
                    a.range().end <= b.offset,
                    "{}: {} slots at {} and {} overlap",
                    self.name,
                    cave.name,
                    a.offset,
                    b.offset
                );
            }
            for slot in cave.fragment.slots {
                ensure!(
                    slot.range().end <= cave.fragment.len(),
                    "{}: {} slot at {} outside fragment",
                    self.name,
                    cave.name,
                    slot.offset
                );
                match slot.kind {
                    SlotKind::Call { target } => ensure!(
                        image_range.contains(&(target as usize)),
                        "{}: {} call target {target:#x} outside image",
                        self.name,
                        cave.name
                    ),
                    SlotKind::Continue => resumes += 1,
                    _ => {}
                }
            }
            ensure!(
                resumes == 1,
                "{}: {} must return exactly once, found {resumes}",
                self.name,
                cave.name
            );
        }
        Ok(())
    }
}

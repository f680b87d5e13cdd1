//! One patch run: identify, compute layout, write fields, inject caves, apply fixes and
//! optionally rewrite the text container.
//!
//! Everything happens on an in-memory copy. Output files are only written once every
//! in-memory step succeeded, and each is written to a temporary sibling first and then
//! renamed over the destination.

use std::{
    path::{Path, PathBuf},
};

use itertools::Itertools;
use resopatch_image::ExeImage;
use resopatch_text::{resolution_label, write_replace, StagedFile, TextContainer, TextError};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{
    inject::{inject, InjectedCave},
    integrity::{IntegrityCheck, Trusted},
    layout::{compute, LayoutParameters, Resolution},
    patcher::{apply_fields, apply_fix, AppliedField, FixKind},
    variants::{identify, Variant, VariantProfile, VARIANTS},
    PatchError, PatchResult, Stage,
};

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PatchOptions {
    /// Fields, caves and text are only touched when set
    pub resolution: Option<Resolution>,
    pub fixes: Vec<FixKind>,
    pub inject_caves: bool,
    /// Directory holding the variant's string table
    pub text_dir: Option<PathBuf>,
}

impl Default for PatchOptions {
    fn default() -> Self {
        Self {
            resolution: None,
            fixes: vec![],
            inject_caves: true,
            text_dir: None,
        }
    }
}

impl PatchOptions {
    pub fn resolution(resolution: Resolution) -> Self {
        Self {
            resolution: Some(resolution),
            ..Default::default()
        }
    }
}

/// Requested feature the variant has no data for
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct SkippedFeature {
    pub feature: String,
    pub reason: &'static str,
}

#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct PatchReport {
    pub variant: Variant,
    pub checksum: u32,
    pub layout: Option<LayoutParameters>,
    pub fields: Vec<AppliedField>,
    pub caves: Vec<InjectedCave>,
    pub fixes: Vec<FixKind>,
    pub skipped: Vec<SkippedFeature>,
    /// String table rewritten alongside the executable
    pub text: Option<PathBuf>,
}

impl PatchReport {
    fn skip(&mut self, feature: impl ToString, reason: &'static str) {
        let feature = feature.to_string();
        tracing::warn!(%feature, reason, "skipping feature");
        self.skipped.push(SkippedFeature { feature, reason });
    }
}

pub struct PatchSession<'a> {
    table: &'a [VariantProfile],
    integrity: &'a dyn IntegrityCheck,
}

impl Default for PatchSession<'static> {
    fn default() -> Self {
        Self {
            table: VARIANTS,
            integrity: &Trusted,
        }
    }
}

impl<'a> PatchSession<'a> {
    pub fn new(table: &'a [VariantProfile], integrity: &'a dyn IntegrityCheck) -> Self {
        Self { table, integrity }
    }

    pub fn table(&self) -> &'a [VariantProfile] {
        self.table
    }

    fn check_integrity(&self, stage: Stage) -> Result<(), PatchError> {
        if cfg!(feature = "integrity-check") && !self.integrity.verify_integrity() {
            tracing::error!(%stage, "integrity check failed");
            return Err(PatchError::IntegrityCheckFailed { stage });
        }
        Ok(())
    }

    /// Patch `image` in place. On error the buffer may be partially modified and must be
    /// discarded.
    pub fn patch_image(
        &self,
        image: &mut ExeImage,
        options: &PatchOptions,
    ) -> Result<PatchReport, PatchError> {
        self.patch_in_memory(image, options).map(|(report, _)| report)
    }

    fn patch_in_memory(
        &self,
        image: &mut ExeImage,
        options: &PatchOptions,
    ) -> Result<(PatchReport, &'a VariantProfile), PatchError> {
        self.check_integrity(Stage::Validate)?;

        if let Some(resolution) = options.resolution {
            resolution
                .validate()
                .map_err(|violation| PatchError::OutOfRangeRequest {
                    width: resolution.width,
                    height: resolution.height,
                    violation,
                })?;
        }

        let checksum = image.checksum();
        let profile = identify(self.table, image)
            .ok_or(PatchError::UnrecognizedVariant { checksum })?;
        tracing::info!(variant = %profile.variant, name = profile.name, "identified");

        let mut report = PatchReport {
            variant: profile.variant,
            checksum,
            layout: None,
            fields: vec![],
            caves: vec![],
            fixes: vec![],
            skipped: vec![],
            text: None,
        };

        if let Some(resolution) = options.resolution {
            let layout = compute(resolution, profile.metrics);
            tracing::info!(
                %resolution,
                width_multiplier = layout.width_multiplier,
                height_multiplier = layout.height_multiplier,
                "computed layout"
            );
            report.layout = Some(layout);

            report.fields = apply_fields(image, profile.fields, &layout)?;
            tracing::info!(count = report.fields.len(), "patched fields");

            if !options.inject_caves {
                tracing::debug!("cave injection disabled");
            } else if profile.caves.is_empty() {
                report.skip("caves", "no code cave data for this variant");
            } else {
                for cave in profile.caves {
                    report
                        .caves
                        .push(inject(image, cave, profile.image_base, &layout)?);
                }
                tracing::info!(count = report.caves.len(), "injected caves");
            }
        }

        for kind in options.fixes.iter().unique() {
            match profile.fix(*kind) {
                Some(fix) => {
                    apply_fix(image, fix)?;
                    report.fixes.push(*kind);
                }
                None => report.skip(kind, "fix not available for this variant"),
            }
        }
        if !report.fixes.is_empty() {
            tracing::info!(fixes = %report.fixes.iter().join(", "), "applied fixes");
        }

        Ok((report, profile))
    }

    /// Load and rewrite the string table in memory
    fn prepare_text(
        &self,
        profile: &VariantProfile,
        options: &PatchOptions,
        report: &mut PatchReport,
    ) -> Result<Option<(PathBuf, TextContainer)>, PatchError> {
        let Some(dir) = &options.text_dir else {
            return Ok(None);
        };
        let Some(resolution) = options.resolution else {
            report.skip("text", "no resolution requested");
            return Ok(None);
        };
        let Some(target) = profile.text else {
            report.skip("text", "no string table entry for this variant");
            return Ok(None);
        };

        let path = dir.join(target.file_name);
        let mut container = TextContainer::load(&path)?;
        container.replace_string(
            target.group,
            target.index,
            resolution_label(resolution.width, resolution.height),
        )?;
        Ok(Some((path, container)))
    }

    /// Patch the executable at `input` and write the result to `output`
    pub fn patch_file(
        &self,
        input: &Path,
        output: &Path,
        options: &PatchOptions,
    ) -> Result<PatchReport, PatchError> {
        let mut image = ExeImage::read(input).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                PatchError::MissingImage {
                    path: input.to_owned(),
                }
            } else {
                PatchError::Io {
                    stage: Stage::Read,
                    path: input.to_owned(),
                    source,
                }
            }
        })?;

        let (mut report, profile) = self.patch_in_memory(&mut image, options)?;
        let text = self.prepare_text(profile, options, &mut report)?;

        self.check_integrity(Stage::Write)?;
        let exe = StagedFile::new(output, image.as_bytes()).map_err(|source| PatchError::Io {
            stage: Stage::Write,
            path: output.to_owned(),
            source,
        })?;
        let text = text
            .map(|(path, container)| container.stage(path))
            .transpose()?;

        report.text = commit(exe, text)?;
        Ok(report)
    }

    /// [`Self::patch_file`] reduced to a success flag and failure reason
    pub fn run(&self, input: &Path, output: &Path, options: &PatchOptions) -> PatchResult {
        let result = self.patch_file(input, output, options);
        if let Err(e) = &result {
            tracing::error!("{e}");
        }
        PatchResult::from(&result)
    }
}

/// Patch `input` into `output` using the built-in variant table
pub fn patch_file<I: AsRef<Path>, O: AsRef<Path>>(
    input: I,
    output: O,
    options: &PatchOptions,
) -> Result<PatchReport, PatchError> {
    PatchSession::default().patch_file(input.as_ref(), output.as_ref(), options)
}

/// Move both staged files into place. If the string table cannot be committed the output
/// executable is put back the way it was, so a run never leaves one file patched alone.
fn commit(exe: StagedFile, text: Option<StagedFile>) -> Result<Option<PathBuf>, PatchError> {
    let output = exe.path().to_owned();
    let write_error = |source| PatchError::Io {
        stage: Stage::Write,
        path: output.clone(),
        source,
    };

    let previous = match std::fs::read(&output) {
        Ok(bytes) => Some(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(write_error(e)),
    };
    exe.commit().map_err(write_error)?;
    tracing::info!(path = %output.display(), "wrote executable");

    let Some(text) = text else {
        return Ok(None);
    };
    let text_path = text.path().to_owned();
    match text.commit() {
        Ok(path) => {
            tracing::info!(path = %path.display(), "wrote string table");
            Ok(Some(path))
        }
        Err(source) => {
            let restored = match previous {
                Some(bytes) => write_replace(&output, &bytes),
                None => std::fs::remove_file(&output),
            };
            if let Err(e) = restored {
                tracing::error!(path = %output.display(), "failed to roll back executable: {e}");
            }
            Err(TextError::Io {
                path: text_path,
                source,
            }
            .into())
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        disassemble::branch_target,
        layout::RangeViolation,
        variants::{emperor, zeus},
        FailureReason,
    };
    use resopatch_image::MemoryTrait;
    use rand::prelude::*;

    /// Random bytes the size of `profile`'s build with zeroed caves, and a single entry
    /// table recognising exactly that buffer
    fn synthetic(profile: &VariantProfile, seed: u64) -> (ExeImage, [VariantProfile; 1]) {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut data = vec![0; profile.image_len];
        rng.fill_bytes(&mut data);
        for cave in profile.caves {
            data[cave.cave_range()].fill(0);
        }
        let image = ExeImage::new(data);
        let table = [VariantProfile {
            checksum: image.checksum(),
            ..*profile
        }];
        (image, table)
    }

    fn session(table: &[VariantProfile]) -> PatchSession<'_> {
        PatchSession::new(table, &Trusted)
    }

    fn all_fixes() -> Vec<FixKind> {
        vec![
            FixKind::AnimationTiming,
            FixKind::WindowedMode,
            FixKind::SpriteLimit,
        ]
    }

    #[rustfmt::skip]
    const ZEUS_RETAIL_1920X1080: &[(usize, &[u8])] = &[
        (0x0001A6F3, &[0x80, 0x07, 0x00, 0x00]),
        (0x0001A6FA, &[0x38, 0x04, 0x00, 0x00]),
        (0x0001B2C6, &[0x80, 0x07, 0x00, 0x00]),
        (0x0001B2CD, &[0x38, 0x04, 0x00, 0x00]),
        (0x0004E1A9, &[0x1C]),
        (0x0004E1AB, &[0x35]),
        (0x0004E3F1, &[0x8E, 0x06, 0x00, 0x00]),
        (0x0004E3FB, &[0x2E, 0x04, 0x00, 0x00]),
        (0x00051C82, &[0xC6, 0x06, 0x00, 0x00]),
        (0x00051D17, &[0xCE, 0x06, 0x00, 0x00]),
        (0x00052040, &[0xCA, 0x06, 0x00, 0x00]),
        (0x00059A0E, &[0x80, 0x07, 0x00, 0x00]),
        (0x00073D25, &[0xC0, 0x01, 0x00, 0x00]),
        (0x00073D2C, &[0x9C, 0x00, 0x00, 0x00]),
        (0x000840B8, &[0x7F, 0x07, 0x00, 0x00]),
        (0x000840C5, &[0x37, 0x04, 0x00, 0x00]),
        (0x000912E4, &[0x2E, 0x04]),
        (0x000C4A11, &[0x80, 0x07, 0x00, 0x00]),
        (0x000C4A18, &[0x1A, 0x04, 0x00, 0x00]),
        // jmp gap_filler
        (0x0004E512, &[0xE9, 0x39, 0x9A, 0x19, 0x00]),
        // jmp menubar_extender; nop
        (0x00059A20, &[0xE9, 0xFB, 0xE4, 0x18, 0x00, 0x90]),
        // gap_filler: pushad; push 0; push 1080; push 56; push 0; push 1678; call fill_rect
        (0x001E7F50, &[
            0x60, 0x6A, 0x00, 0x68, 0x38, 0x04, 0x00, 0x00, 0x68, 0x38, 0x00, 0x00, 0x00,
            0x6A, 0x00, 0x68, 0x8E, 0x06, 0x00, 0x00, 0xE8, 0xA7, 0xBC, 0xEF, 0xFF,
        ]),
        // gap_filler: jmp continue
        (0x001E7F8D, &[0xE9, 0x85, 0x65, 0xE6, 0xFF]),
    ];

    #[rustfmt::skip]
    const ZEUS_DIGITAL_1920X1080: &[(usize, &[u8])] = &[
        (0x0001BB23, &[0x80, 0x07, 0x00, 0x00]),
        (0x0001BB2A, &[0x38, 0x04, 0x00, 0x00]),
        (0x0001C6F6, &[0x80, 0x07, 0x00, 0x00]),
        (0x0001C6FD, &[0x38, 0x04, 0x00, 0x00]),
        (0x0004F5D9, &[0x1C]),
        (0x0004F5DB, &[0x35]),
        (0x0004F821, &[0x8E, 0x06, 0x00, 0x00]),
        (0x0004F82B, &[0x2E, 0x04, 0x00, 0x00]),
        (0x000530B2, &[0xC6, 0x06, 0x00, 0x00]),
        (0x00053147, &[0xCE, 0x06, 0x00, 0x00]),
        (0x00053470, &[0xCA, 0x06, 0x00, 0x00]),
        (0x0005AE3E, &[0x80, 0x07, 0x00, 0x00]),
        (0x00075155, &[0xC0, 0x01, 0x00, 0x00]),
        (0x0007515C, &[0x9C, 0x00, 0x00, 0x00]),
        (0x000854E8, &[0x7F, 0x07, 0x00, 0x00]),
        (0x000854F5, &[0x37, 0x04, 0x00, 0x00]),
        (0x00092714, &[0x2E, 0x04]),
        (0x000C5E41, &[0x80, 0x07, 0x00, 0x00]),
        (0x000C5E48, &[0x1A, 0x04, 0x00, 0x00]),
        // jmp menubar_extender
        (0x0005AE50, &[0xE9, 0xFB, 0xE4, 0x18, 0x00, 0x90]),
        // menubar_extender
        (0x001E9350, &[
            0x60, 0xBE, 0x00, 0x04, 0x00, 0x00, 0x56, 0xE8, 0x14, 0x1D, 0xE7, 0xFF, 0x83,
            0xC4, 0x04, 0x81, 0xC6, 0x00, 0x01, 0x00, 0x00, 0x81, 0xFE, 0x80, 0x07, 0x00,
            0x00, 0x7C, 0xE9, 0x61, 0x8B, 0x0D, 0x28, 0x59, 0x9D, 0x00, 0xE9, 0xDD, 0x1A,
            0xE7, 0xFF,
        ]),
        // jmp gap_filler
        (0x0004F942, &[0xE9, 0x39, 0x9A, 0x19, 0x00]),
        // gap_filler
        (0x001E9380, &[
            0x60, 0x6A, 0x00, 0x68, 0x38, 0x04, 0x00, 0x00, 0x68, 0x38, 0x00, 0x00, 0x00,
            0x6A, 0x00, 0x68, 0x8E, 0x06, 0x00, 0x00, 0xE8, 0xA7, 0xBC, 0xEF, 0xFF, 0x83,
            0xC4, 0x14, 0x6A, 0x00, 0x68, 0x0A, 0x00, 0x00, 0x00, 0x68, 0xC6, 0x06, 0x00,
            0x00, 0x68, 0x2E, 0x04, 0x00, 0x00, 0x6A, 0x00, 0xE8, 0x8C, 0xBC, 0xEF, 0xFF,
            0x83, 0xC4, 0x14, 0x61, 0xE8, 0xE3, 0x9B, 0xE6, 0xFF, 0xE9, 0x85, 0x65, 0xE6,
            0xFF,
        ]),
    ];

    #[rustfmt::skip]
    const EMPEROR_DIGITAL_1920X1080: &[(usize, &[u8])] = &[
        (0x000245B4, &[0x80, 0x07, 0x00, 0x00]),
        (0x000245BB, &[0x38, 0x04, 0x00, 0x00]),
        (0x0002547E, &[0x80, 0x07, 0x00, 0x00]),
        (0x00025485, &[0x38, 0x04, 0x00, 0x00]),
        (0x0006CE32, &[0x15]),
        (0x0006CE34, &[0x1B]),
        (0x0006D08D, &[0x8E, 0x06, 0x00, 0x00]),
        (0x0006D097, &[0x28, 0x04, 0x00, 0x00]),
        (0x00073903, &[0x9E, 0x06, 0x00, 0x00]),
        (0x0007399A, &[0xA8, 0x06, 0x00, 0x00]),
        (0x0007E131, &[0x80, 0x07, 0x00, 0x00]),
        (0x000A0F82, &[0xC0, 0x01, 0x00, 0x00]),
        (0x000A0F89, &[0x9C, 0x00, 0x00, 0x00]),
        (0x000B36E4, &[0x7F, 0x07, 0x00, 0x00]),
        (0x000B36F1, &[0x37, 0x04, 0x00, 0x00]),
        (0x000F4872, &[0x20, 0x04, 0x00, 0x00]),
        (0x000F48AA, &[0x80, 0x07]),
        // jmp menubar_extender
        (0x0007E140, &[0xE9, 0xFB, 0x3D, 0x22, 0x00, 0x90]),
        // menubar_extender
        (0x002A1F40, &[
            0x60, 0xBE, 0x00, 0x04, 0x00, 0x00, 0x56, 0xE8, 0x94, 0xA5, 0xDD, 0xFF, 0x83,
            0xC4, 0x04, 0x81, 0xC6, 0x00, 0x01, 0x00, 0x00, 0x81, 0xFE, 0x80, 0x07, 0x00,
            0x00, 0x7C, 0xE9, 0x61, 0x8B, 0x0D, 0xC0, 0xB6, 0xA1, 0x00, 0xE9, 0xDD, 0xC1,
            0xDD, 0xFF,
        ]),
        // jmp gap_filler
        (0x0006D2A0, &[0xE9, 0xCB, 0x4C, 0x23, 0x00]),
        // gap_filler
        (0x002A1F70, &[
            0x60, 0x6A, 0x00, 0x68, 0x38, 0x04, 0x00, 0x00, 0x68, 0x10, 0x00, 0x00, 0x00,
            0x6A, 0x00, 0x68, 0x8E, 0x06, 0x00, 0x00, 0xE8, 0x67, 0x88, 0xE8, 0xFF, 0x83,
            0xC4, 0x14, 0x6A, 0x00, 0x68, 0x10, 0x00, 0x00, 0x00, 0x68, 0x9E, 0x06, 0x00,
            0x00, 0x68, 0x28, 0x04, 0x00, 0x00, 0x6A, 0x00, 0xE8, 0x4C, 0x88, 0xE8, 0xFF,
            0x83, 0xC4, 0x14, 0x61, 0xE8, 0xA3, 0x11, 0xDD, 0xFF, 0xE9, 0xF3, 0xB2, 0xDC,
            0xFF,
        ]),
    ];


    /// Patch a synthetic `profile` build for 1920x1080 and compare against `golden`. Bytes
    /// outside the profile's write ranges must be untouched.
    fn assert_golden(
        profile: &VariantProfile,
        golden: &[(usize, &[u8])],
        seed: u64,
    ) -> PatchReport {
        let (mut image, table) = synthetic(profile, seed);
        let before = image.clone();

        let report = session(&table)
            .patch_image(&mut image, &PatchOptions::resolution(Resolution::new(1920, 1080)))
            .unwrap();
        assert_eq!(profile.variant, report.variant);
        assert!(report.skipped.is_empty());
        assert_eq!(profile.caves.len(), report.caves.len());

        for (offset, bytes) in golden {
            assert_eq!(
                *bytes,
                image.range(*offset..*offset + bytes.len()).unwrap(),
                "{} at {offset:#x}",
                profile.name
            );
        }

        for cave in profile.caves {
            let entry = image.range(cave.entry_range()).unwrap();
            assert_eq!(
                Some(cave.cave_va(profile.image_base) as u64),
                branch_target(entry, cave.entry_va(profile.image_base) as u64)
            );
        }

        let mut touched = vec![false; image.len()];
        for (_, range) in profile.write_ranges() {
            touched[range].fill(true);
        }
        let changed = before
            .as_bytes()
            .iter()
            .zip(image.as_bytes())
            .enumerate()
            .filter(|(i, (a, b))| a != b && !touched[*i])
            .count();
        assert_eq!(0, changed);
        report
    }

    #[test]
    fn test_zeus_retail_1920x1080() {
        let report = assert_golden(&zeus::RETAIL, ZEUS_RETAIL_1920X1080, 1);
        let layout = report.layout.unwrap();
        assert_eq!(53, layout.height_multiplier);
        assert_eq!(28, layout.width_multiplier);
        assert_eq!(2, report.caves.len());
    }

    #[test]
    fn test_zeus_digital_1920x1080() {
        assert_golden(&zeus::DIGITAL, ZEUS_DIGITAL_1920X1080, 12);
    }

    #[test]
    fn test_emperor_digital_1920x1080() {
        let report = assert_golden(&emperor::DIGITAL, EMPEROR_DIGITAL_1920X1080, 13);
        let layout = report.layout.unwrap();
        assert_eq!(27, layout.height_multiplier);
        assert_eq!(21, layout.width_multiplier);
        // every table entry is written by the profile
        assert_eq!(
            emperor::DIGITAL.fields.len() + 2 * emperor::DIGITAL.caves.len(),
            EMPEROR_DIGITAL_1920X1080.len()
        );
    }

    #[test]
    fn test_deterministic() {
        for profile in [zeus::RETAIL, zeus::DIGITAL, emperor::RETAIL, emperor::DIGITAL] {
            let (image, table) = synthetic(&profile, 2);
            let options = PatchOptions {
                fixes: all_fixes(),
                ..PatchOptions::resolution(Resolution::new(2560, 1440))
            };
            let run = || {
                let mut image = image.clone();
                session(&table).patch_image(&mut image, &options).unwrap();
                image
            };
            let first = run();
            assert_ne!(image, first);
            assert_eq!(first, run());
        }
    }

    #[test]
    fn test_height_clamp_written() {
        let (mut image, table) = synthetic(&zeus::DIGITAL, 3);
        session(&table)
            .patch_image(&mut image, &PatchOptions::resolution(Resolution::new(1920, 2572)))
            .unwrap();
        let field = |name: &str| {
            zeus::DIGITAL
                .fields
                .iter()
                .find(|f| f.name == name)
                .unwrap()
                .offset
        };
        assert_eq!(127, image.u8(field("viewport_height_multiplier")).unwrap());
        assert_eq!(2550, image.u32_le(field("viewport_pixel_height")).unwrap());
        assert_eq!(2550, image.u16_le(field("city_clip_height")).unwrap());
    }

    #[test]
    fn test_out_of_range_rejected_first() {
        let (image, table) = synthetic(&zeus::RETAIL, 4);
        // an unrecognised buffer still reports the range violation
        let unknown = ExeImage::new(vec![0xAB; 0x2000]);
        for (w, h, violation) in [
            (800, 600, RangeViolation::WidthTooSmall),
            (1920, 4400, RangeViolation::HeightTooLarge),
            (1921, 1080, RangeViolation::WidthUnaligned),
            (1920, 1082, RangeViolation::HeightUnaligned),
        ] {
            for original in [&image, &unknown] {
                let mut copy = original.clone();
                let options = PatchOptions {
                    fixes: all_fixes(),
                    ..PatchOptions::resolution(Resolution::new(w, h))
                };
                let err = session(&table).patch_image(&mut copy, &options).unwrap_err();
                match err {
                    PatchError::OutOfRangeRequest {
                        width,
                        height,
                        violation: v,
                    } => assert_eq!((w, h, violation), (width, height, v)),
                    other => panic!("unexpected {other}"),
                }
                assert_eq!(Stage::Validate, err_stage(&session(&table), original, w, h));
                assert_eq!(original, &copy);
            }
        }
    }

    fn err_stage(session: &PatchSession, image: &ExeImage, w: u16, h: u16) -> Stage {
        let mut image = image.clone();
        session
            .patch_image(&mut image, &PatchOptions::resolution(Resolution::new(w, h)))
            .unwrap_err()
            .stage()
    }

    #[test]
    fn test_unrecognized() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut data = vec![0; 0x20000];
        rng.fill_bytes(&mut data);
        let mut image = ExeImage::new(data);
        let before = image.clone();

        let err = PatchSession::default()
            .patch_image(&mut image, &PatchOptions::resolution(Resolution::new(1920, 1080)))
            .unwrap_err();
        assert!(
            matches!(err, PatchError::UnrecognizedVariant { checksum } if checksum == before.checksum())
        );
        assert_eq!(Stage::Identify, err.stage());
        assert_eq!(before, image);
    }

    #[test]
    fn test_emperor_retail_skips_missing_features() {
        let (mut image, table) = synthetic(&emperor::RETAIL, 6);
        let options = PatchOptions {
            fixes: all_fixes(),
            ..PatchOptions::resolution(Resolution::new(1920, 1080))
        };
        let report = session(&table).patch_image(&mut image, &options).unwrap();

        assert!(report.caves.is_empty());
        assert_eq!(
            vec![FixKind::AnimationTiming, FixKind::WindowedMode],
            report.fixes
        );
        assert_eq!(
            vec!["caves", "sprite-limit"],
            report
                .skipped
                .iter()
                .map(|s| s.feature.as_str())
                .collect::<Vec<_>>()
        );
        assert_eq!(0xEB, image.u8(0x00021B38).unwrap());
        assert_eq!(0, image.u8(0x0003C1D2).unwrap());
        assert_eq!(1920, image.u32_le(0x00021B44).unwrap());
        assert_eq!(27, image.u8(0x0006A3C4).unwrap());
    }

    #[test]
    fn test_fixes_without_resolution() {
        let (mut image, table) = synthetic(&zeus::RETAIL, 7);
        let before = image.clone();
        let options = PatchOptions {
            fixes: vec![FixKind::SpriteLimit, FixKind::SpriteLimit],
            ..Default::default()
        };
        let report = session(&table).patch_image(&mut image, &options).unwrap();

        assert!(report.layout.is_none());
        assert!(report.fields.is_empty());
        assert!(report.caves.is_empty());
        assert_eq!(vec![FixKind::SpriteLimit], report.fixes);
        assert_eq!(0x2000, image.u16_le(0x000A7713).unwrap());
        assert_eq!(0x2000, image.u16_le(0x000A77A2).unwrap());
        let field = zeus::RETAIL.fields[0];
        assert_eq!(
            before.range(field.range()).unwrap(),
            image.range(field.range()).unwrap()
        );
    }

    #[test]
    fn test_caves_disabled() {
        let (mut image, table) = synthetic(&zeus::RETAIL, 8);
        let options = PatchOptions {
            inject_caves: false,
            ..PatchOptions::resolution(Resolution::new(1920, 1080))
        };
        let report = session(&table).patch_image(&mut image, &options).unwrap();
        assert!(report.caves.is_empty());
        assert!(report.skipped.is_empty());
        for cave in zeus::RETAIL.caves {
            assert!(image
                .range(cave.cave_range())
                .unwrap()
                .iter()
                .all(|b| *b == 0));
        }
    }

    /// String table with `count` labels in `group`
    fn text_container(group: usize, count: usize) -> Vec<u8> {
        use resopatch_text::{HEADER_LEN, INDEX_ENTRIES};
        let mut out = b"TEXT FILE\0\0\0\0\0\0\0".to_vec();
        out.extend(1u32.to_le_bytes());
        out.extend((count as u32).to_le_bytes());
        out.extend(0u32.to_le_bytes());
        let mut index = vec![0u8; INDEX_ENTRIES * 8];
        index[group * 8 + 4..group * 8 + 8].copy_from_slice(&(count as u32).to_le_bytes());
        out.extend(index);
        assert_eq!(HEADER_LEN + INDEX_ENTRIES * 8, out.len());
        for i in 0..count {
            out.extend(format!("{}x768", 1024 + i * 4).as_bytes());
            out.push(0);
        }
        out
    }

    #[test]
    fn test_patch_file() {
        let dir = tempfile::tempdir().unwrap();
        let (image, table) = synthetic(&zeus::RETAIL, 9);
        let input = dir.path().join("Zeus.exe");
        let output = dir.path().join("Zeus_patched.exe");
        std::fs::write(&input, image.as_bytes()).unwrap();

        let text = zeus::RETAIL.text.unwrap();
        let text_path = dir.path().join(text.file_name);
        std::fs::write(&text_path, text_container(text.group, 8)).unwrap();

        let options = PatchOptions {
            text_dir: Some(dir.path().to_owned()),
            fixes: vec![FixKind::WindowedMode],
            ..PatchOptions::resolution(Resolution::new(1920, 1080))
        };
        let report = session(&table).patch_file(&input, &output, &options).unwrap();
        assert_eq!(Some(text_path.clone()), report.text);

        assert_eq!(image.as_bytes(), std::fs::read(&input).unwrap());
        let mut expected = image.clone();
        session(&table).patch_image(&mut expected, &options).unwrap();
        assert_eq!(expected.as_bytes(), std::fs::read(&output).unwrap());

        let container = TextContainer::load(&text_path).unwrap();
        assert_eq!(b"1920x1080", container.string(text.group, text.index).unwrap());
        assert_eq!(b"1024x768", container.string(text.group, 0).unwrap());

        // no temporary files left behind
        assert_eq!(3, std::fs::read_dir(dir.path()).unwrap().count());
    }

    #[test]
    fn test_failures_write_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.exe");

        let err = patch_file(
            dir.path().join("missing.exe"),
            &output,
            &PatchOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, PatchError::MissingImage { .. }));
        assert_eq!(FailureReason::MissingImage, err.reason());

        let input = dir.path().join("other.exe");
        std::fs::write(&input, vec![0x4D; 0x3000]).unwrap();
        let result = PatchSession::default().run(
            &input,
            &output,
            &PatchOptions::resolution(Resolution::new(1920, 1080)),
        );
        assert_eq!(
            PatchResult {
                successful: false,
                reason: Some(FailureReason::UnrecognizedVariant)
            },
            result
        );

        // recognised, but the requested string table is absent
        let (image, table) = synthetic(&zeus::RETAIL, 10);
        std::fs::write(&input, image.as_bytes()).unwrap();
        let options = PatchOptions {
            text_dir: Some(dir.path().join("no-such-dir")),
            ..PatchOptions::resolution(Resolution::new(1920, 1080))
        };
        let err = session(&table)
            .patch_file(&input, &output, &options)
            .unwrap_err();
        assert_eq!(Stage::Text, err.stage());

        assert!(!output.exists());
    }

    #[test]
    fn test_text_commit_failure_rolls_back_executable() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("Zeus.exe");
        let text_path = dir.path().join("Zeus_Text.eng");

        let stage = |previous: Option<&[u8]>| {
            if let Some(bytes) = previous {
                std::fs::write(&output, bytes).unwrap();
            }
            let exe = StagedFile::new(&output, b"patched").unwrap();
            let text = StagedFile::new(&text_path, b"text").unwrap();
            // a non-empty directory at the destination makes the rename fail
            std::fs::create_dir_all(&text_path).unwrap();
            std::fs::write(text_path.join("keep"), b"").unwrap();
            (exe, text)
        };

        let (exe, text) = stage(None);
        let err = commit(exe, Some(text)).unwrap_err();
        assert_eq!(Stage::Text, err.stage());
        assert!(matches!(err, PatchError::Text(TextError::Io { .. })));
        assert!(!output.exists());

        let (exe, text) = stage(Some(b"original"));
        assert!(commit(exe, Some(text)).is_err());
        assert_eq!(b"original".as_slice(), std::fs::read(&output).unwrap());

        // only the two destinations remain, no temporary files
        assert_eq!(2, std::fs::read_dir(dir.path()).unwrap().count());

        std::fs::remove_dir_all(&text_path).unwrap();
        let exe = StagedFile::new(&output, b"patched").unwrap();
        let text = StagedFile::new(&text_path, b"text").unwrap();
        assert_eq!(Some(text_path.clone()), commit(exe, Some(text)).unwrap());
        assert_eq!(b"patched".as_slice(), std::fs::read(&output).unwrap());
        assert_eq!(b"text".as_slice(), std::fs::read(&text_path).unwrap());
    }

    #[test]
    fn test_patch_result() {
        let ok: Result<(), PatchError> = Ok(());
        assert_eq!(
            PatchResult {
                successful: true,
                reason: None
            },
            PatchResult::from(&ok)
        );
        let err: Result<(), PatchError> = Err(PatchError::OutOfRangeRequest {
            width: 1,
            height: 1,
            violation: RangeViolation::WidthTooSmall,
        });
        assert_eq!(
            Some(FailureReason::OutOfRangeRequest),
            PatchResult::from(&err).reason
        );
    }

    #[cfg(feature = "integrity-check")]
    #[test]
    fn test_integrity_check() {
        let (mut image, table) = synthetic(&zeus::RETAIL, 11);
        let before = image.clone();
        let failing = || false;
        let err = PatchSession::new(&table, &failing)
            .patch_image(&mut image, &PatchOptions::resolution(Resolution::new(1920, 1080)))
            .unwrap_err();
        assert!(matches!(
            err,
            PatchError::IntegrityCheckFailed {
                stage: Stage::Validate
            }
        ));
        assert_eq!(before, image);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_options_from_json() {
        let options: PatchOptions = serde_json::from_str(
            r#"{ "resolution": { "width": 2560, "height": 1440 }, "fixes": ["windowed-mode"] }"#,
        )
        .unwrap();
        assert_eq!(
            PatchOptions {
                fixes: vec![FixKind::WindowedMode],
                ..PatchOptions::resolution(Resolution::new(2560, 1440))
            },
            options
        );
        assert!(options.inject_caves);
    }
}

//! Code cave injection.
//!
//! A fragment is assembled in a private copy of its template, copied into an unused
//! zero-filled region of the image, and reached through a `jmp rel32` written over the
//! instruction(s) at the entry point. The fragment ends with its own `jmp rel32` back to
//! the first byte after the overwritten entry.

use resopatch_image::{MemoryMutTrait, MemoryTrait};

#[cfg(feature = "serde")]
use serde::Serialize;

use crate::{
    layout::{LayoutParameters, LayoutValue},
    variants::FieldWidth,
    PatchError, Stage,
};

pub const JMP_REL32: u8 = 0xE9;
pub const CALL_REL32: u8 = 0xE8;
pub const NOP: u8 = 0x90;
/// Size of `jmp rel32`
pub const JMP_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    /// Computed layout value, little-endian
    Layout {
        value: LayoutValue,
        width: FieldWidth,
    },
    /// rel32 displacement to a subroutine at `target` (virtual address)
    Call { target: u32 },
    /// Absolute virtual address
    Address { target: u32 },
    /// rel32 displacement back to the instruction following the entry jump
    Continue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub offset: usize,
    pub kind: SlotKind,
}

impl Slot {
    pub const fn layout(offset: usize, value: LayoutValue, width: FieldWidth) -> Self {
        Self {
            offset,
            kind: SlotKind::Layout { value, width },
        }
    }
    pub const fn call(offset: usize, target: u32) -> Self {
        Self {
            offset,
            kind: SlotKind::Call { target },
        }
    }
    pub const fn address(offset: usize, target: u32) -> Self {
        Self {
            offset,
            kind: SlotKind::Address { target },
        }
    }
    pub const fn resume(offset: usize) -> Self {
        Self {
            offset,
            kind: SlotKind::Continue,
        }
    }
    pub fn len(&self) -> usize {
        match self.kind {
            SlotKind::Layout { width, .. } => width.len(),
            _ => 4,
        }
    }
    pub fn range(&self) -> std::ops::Range<usize> {
        self.offset..self.offset + self.len()
    }
}

/// Pre-assembled machine code with holes to be filled at injection time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeFragment {
    pub bytes: &'static [u8],
    pub slots: &'static [Slot],
}

impl CodeFragment {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaveInjection {
    pub name: &'static str,
    /// File offset of the zero-filled region receiving the fragment
    pub cave_offset: usize,
    /// File offset of the instruction(s) replaced by the entry jump
    pub entry_offset: usize,
    /// Bytes overwritten at the entry, at least [`JMP_LEN`]
    pub entry_len: usize,
    pub fragment: CodeFragment,
}

impl CaveInjection {
    pub fn cave_range(&self) -> std::ops::Range<usize> {
        self.cave_offset..self.cave_offset + self.fragment.len()
    }
    pub fn entry_range(&self) -> std::ops::Range<usize> {
        self.entry_offset..self.entry_offset + self.entry_len
    }
    pub fn cave_va(&self, image_base: usize) -> u32 {
        va(image_base, self.cave_offset)
    }
    pub fn entry_va(&self, image_base: usize) -> u32 {
        va(image_base, self.entry_offset)
    }
    pub fn continue_va(&self, image_base: usize) -> u32 {
        va(image_base, self.entry_offset + self.entry_len)
    }

    /// Working copy of the fragment with every slot filled for `layout`
    pub fn assemble(
        &self,
        image_base: usize,
        layout: &LayoutParameters,
    ) -> Result<Vec<u8>, PatchError> {
        let mut code = self.fragment.bytes.to_vec();
        let cave_va = self.cave_va(image_base);

        for slot in self.fragment.slots {
            let bytes = match slot.kind {
                SlotKind::Layout { value, width } => {
                    let raw = layout.value(value);
                    let scalar = width.encode(raw as i64).ok_or(PatchError::FieldOverflow {
                        stage: Stage::Inject,
                        name: self.name,
                        value: raw as i64,
                    })?;
                    scalar_bytes(scalar)
                }
                SlotKind::Call { target } => {
                    displacement(slot_va(cave_va, slot.offset), target)
                        .to_le_bytes()
                        .to_vec()
                }
                SlotKind::Address { target } => target.to_le_bytes().to_vec(),
                SlotKind::Continue => displacement(
                    slot_va(cave_va, slot.offset),
                    self.continue_va(image_base),
                )
                .to_le_bytes()
                .to_vec(),
            };
            let dst = code
                .get_mut(slot.range())
                .ok_or(PatchError::MalformedFragment {
                    name: self.name,
                    offset: slot.offset,
                })?;
            dst.copy_from_slice(&bytes);
            tracing::trace!(cave = self.name, slot = slot.offset, ?slot.kind, ?bytes, "filled slot");
        }
        Ok(code)
    }

    /// `jmp cave` padded with `nop` to the length of the overwritten entry
    pub fn entry_patch(&self, image_base: usize) -> Vec<u8> {
        let entry_va = self.entry_va(image_base);
        let mut patch = Vec::with_capacity(self.entry_len.max(JMP_LEN));
        patch.push(JMP_REL32);
        patch.extend(displacement(slot_va(entry_va, 1), self.cave_va(image_base)).to_le_bytes());
        patch.resize(self.entry_len.max(JMP_LEN), NOP);
        patch
    }
}

fn scalar_bytes(scalar: resopatch_image::Scalar) -> Vec<u8> {
    use resopatch_image::Scalar;
    match scalar {
        Scalar::U8(v) => vec![v],
        Scalar::U16(v) => v.to_le_bytes().to_vec(),
        Scalar::U32(v) => v.to_le_bytes().to_vec(),
    }
}

/// Virtual address of a file offset. The supported linkers align sections identically on
/// disk and in memory, so this is a plain rebase.
pub fn va(image_base: usize, offset: usize) -> u32 {
    (image_base + offset) as u32
}

fn slot_va(base: u32, offset: usize) -> u32 {
    base.wrapping_add(offset as u32)
}

/// rel32 stored at `slot_va` that reaches `target`; the CPU adds it to the address of the
/// next instruction, which is `slot_va + 4`
pub fn displacement(slot_va: u32, target: u32) -> i32 {
    target.wrapping_sub(slot_va.wrapping_add(4)) as i32
}

/// Inverse of [`displacement`]
pub fn resolve_displacement(slot_va: u32, rel: i32) -> u32 {
    slot_va.wrapping_add(4).wrapping_add(rel as u32)
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct InjectedCave {
    pub name: &'static str,
    pub cave_va: u32,
    pub entry_va: u32,
    pub continue_va: u32,
    pub len: usize,
}

/// Assemble `cave` and write it plus its entry jump into `image`. Both target ranges are
/// checked before either is written.
pub fn inject<M: MemoryMutTrait>(
    image: &mut M,
    cave: &CaveInjection,
    image_base: usize,
    layout: &LayoutParameters,
) -> Result<InjectedCave, PatchError> {
    let code = cave.assemble(image_base, layout)?;
    let entry = cave.entry_patch(image_base);

    let access = |source| PatchError::ImageAccess {
        stage: Stage::Inject,
        source,
    };
    image.range(cave.cave_range()).map_err(access)?;
    image.range(cave.entry_range()).map_err(access)?;

    image.write_bytes(cave.cave_offset, &code).map_err(access)?;
    image.write_bytes(cave.entry_offset, &entry).map_err(access)?;

    let injected = InjectedCave {
        name: cave.name,
        cave_va: cave.cave_va(image_base),
        entry_va: cave.entry_va(image_base),
        continue_va: cave.continue_va(image_base),
        len: code.len(),
    };
    tracing::debug!(
        cave = cave.name,
        cave_va = format_args!("{:#x}", injected.cave_va),
        entry_va = format_args!("{:#x}", injected.entry_va),
        len = injected.len,
        "injected code cave"
    );
    Ok(injected)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        disassemble::{branch_target, disassemble},
        layout::{compute, Resolution},
        variants::{fragments, Game},
    };
    use resopatch_image::ExeImage;

    const BASE: usize = 0x400000;

    const GAP_SLOTS: [Slot; 10] = fragments::gap_filler_slots(0x4E3C10, 0x457E30);
    const GAP: CaveInjection = CaveInjection {
        name: "gap_filler",
        cave_offset: 0x1800,
        entry_offset: 0x0400,
        entry_len: 5,
        fragment: CodeFragment {
            bytes: fragments::GAP_FILLER,
            slots: &GAP_SLOTS,
        },
    };

    const MENUBAR_SLOTS: [Slot; 4] = fragments::menubar_extender_slots(0x4612A0, 0x984A20);
    const MENUBAR: CaveInjection = CaveInjection {
        name: "menubar_extender",
        cave_offset: 0x1900,
        entry_offset: 0x0800,
        entry_len: 6,
        fragment: CodeFragment {
            bytes: fragments::MENUBAR_EXTENDER,
            slots: &MENUBAR_SLOTS,
        },
    };

    fn layout() -> LayoutParameters {
        compute(Resolution::new(1920, 1080), Game::Zeus.metrics())
    }

    fn rel_at(code: &[u8], offset: usize) -> i32 {
        i32::from_le_bytes(code[offset..offset + 4].try_into().unwrap())
    }

    #[test]
    fn test_displacement_round_trip() {
        for (slot, target) in [
            (0x5E7F24u32, 0x4612A0u32),
            (0x401000, 0x401000),
            (0x401000, 0x7FFF_FFF0),
            (0x7FFF_FFF0, 0x401000),
            (0xFFFF_FFFE, 0x10),
        ] {
            let rel = displacement(slot, target);
            assert_eq!(target, resolve_displacement(slot, rel));
        }
        assert_eq!(-4, displacement(0x401000, 0x401000));
        assert_eq!(0x1B, displacement(0x401000, 0x40101F));
    }

    #[test]
    fn test_entry_patch() {
        // cave 0x401800, entry 0x400400: 0x401800 - 0x400405
        assert_eq!(vec![0xE9, 0xFB, 0x13, 0x00, 0x00], GAP.entry_patch(BASE));

        let patch = MENUBAR.entry_patch(BASE);
        assert_eq!(vec![0xE9, 0xFB, 0x10, 0x00, 0x00, 0x90], patch);
        assert_eq!(
            Some(MENUBAR.cave_va(BASE) as u64),
            branch_target(&patch, MENUBAR.entry_va(BASE) as u64)
        );
    }

    #[test]
    fn test_assemble_gap_filler() {
        let layout = layout();
        let code = GAP.assemble(BASE, &layout).unwrap();
        let cave_va = GAP.cave_va(BASE);

        assert_eq!(fragments::GAP_FILLER.len(), code.len());
        assert_eq!(1080, rel_at(&code, 4));
        assert_eq!(56, rel_at(&code, 9));
        assert_eq!(1678, rel_at(&code, 16));
        assert_eq!(10, rel_at(&code, 31));
        assert_eq!(1734, rel_at(&code, 36));
        assert_eq!(1070, rel_at(&code, 41));

        for (offset, target) in [(21, 0x4E3C10), (48, 0x4E3C10), (57, 0x457E30)] {
            assert_eq!(
                target,
                resolve_displacement(cave_va + offset as u32, rel_at(&code, offset))
            );
        }
        assert_eq!(
            GAP.continue_va(BASE),
            resolve_displacement(cave_va + 62, rel_at(&code, 62))
        );

        // bytes outside the slots come from the template unchanged
        let mut masked = code.clone();
        for slot in GAP.fragment.slots {
            masked[slot.range()].copy_from_slice(&fragments::GAP_FILLER[slot.range()]);
        }
        assert_eq!(fragments::GAP_FILLER, masked);
    }

    #[test]
    fn test_assembled_code_decodes() {
        let code = MENUBAR.assemble(BASE, &layout()).unwrap();
        let cave_va = MENUBAR.cave_va(BASE) as u64;
        let lines = disassemble(&code, cave_va);

        assert_eq!(code.len(), lines.iter().map(|l| l.bytes.len()).sum::<usize>());
        let targets = lines
            .iter()
            .filter_map(|l| l.branch_target)
            .collect::<Vec<_>>();
        assert_eq!(
            vec![
                0x4612A0,
                cave_va + 6,
                MENUBAR.continue_va(BASE) as u64
            ],
            targets
        );
        assert!(lines.iter().any(|l| l.text.contains("780h")));
        assert!(lines.iter().any(|l| l.text.contains("984A20h")));
    }

    #[test]
    fn test_inject() {
        let mut data = vec![0xCC; 0x2000];
        data[GAP.cave_range()].fill(0);
        let mut image = ExeImage::new(data);
        let before = image.clone();

        let injected = inject(&mut image, &GAP, BASE, &layout()).unwrap();
        assert_eq!(
            InjectedCave {
                name: "gap_filler",
                cave_va: 0x401800,
                entry_va: 0x400400,
                continue_va: 0x400405,
                len: 66,
            },
            injected
        );

        let bytes = image.as_bytes();
        assert_eq!(
            GAP.assemble(BASE, &layout()).unwrap(),
            &bytes[GAP.cave_range()]
        );
        assert_eq!(&GAP.entry_patch(BASE)[..], &bytes[GAP.entry_range()]);
        for (i, (a, b)) in before.as_bytes().iter().zip(bytes).enumerate() {
            if !GAP.cave_range().contains(&i) && !GAP.entry_range().contains(&i) {
                assert_eq!(a, b, "byte {i:#x} changed");
            }
        }
    }

    #[test]
    fn test_inject_out_of_bounds_writes_nothing() {
        let mut image = ExeImage::new(vec![0; 0x1820]);
        let before = image.clone();
        assert!(matches!(
            inject(&mut image, &GAP, BASE, &layout()),
            Err(PatchError::ImageAccess {
                stage: Stage::Inject,
                ..
            })
        ));
        assert_eq!(before, image);
    }

    #[test]
    fn test_slot_overflow() {
        const SLOTS: [Slot; 1] = [Slot::layout(0, LayoutValue::ScreenWidth, FieldWidth::U8)];
        let cave = CaveInjection {
            name: "narrow",
            fragment: CodeFragment {
                bytes: &[0x6A, 0x00],
                slots: &SLOTS,
            },
            ..GAP
        };
        assert!(matches!(
            cave.assemble(BASE, &layout()),
            Err(PatchError::FieldOverflow {
                stage: Stage::Inject,
                name: "narrow",
                value: 1920
            })
        ));
    }

    #[test]
    fn test_slot_outside_fragment() {
        const SLOTS: [Slot; 1] = [Slot::resume(1)];
        let cave = CaveInjection {
            fragment: CodeFragment {
                bytes: &[0xE9, 0, 0],
                slots: &SLOTS,
            },
            ..GAP
        };
        assert!(matches!(
            cave.assemble(BASE, &layout()),
            Err(PatchError::MalformedFragment { offset: 1, .. })
        ));
    }
}

use std::ops::Range;

use anyhow::{bail, Context, Result};
use object::{Object, ObjectSection, SectionKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionInfo {
    pub name: String,
    pub virtual_address: usize,
    pub virtual_size: usize,
    pub file_range: Range<usize>,
    pub kind: SectionKind,
}

impl SectionInfo {
    pub fn is_code(&self) -> bool {
        self.kind == SectionKind::Text
    }
    /// Translate a virtual address inside this section to a file offset
    pub fn file_offset(&self, address: usize) -> Option<usize> {
        let rel = address.checked_sub(self.virtual_address)?;
        let offset = self.file_range.start + rel;
        self.file_range.contains(&offset).then_some(offset)
    }
}

/// Header level view of a PE image. Only used by the inspection tooling; patching is
/// driven entirely by the per-variant offset tables.
#[derive(Debug, Clone)]
pub struct PeInfo {
    pub image_base: usize,
    pub entry_point: usize,
    pub sections: Vec<SectionInfo>,
}

impl PeInfo {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let object = object::File::parse(data).context("parsing executable")?;
        if object.format() != object::BinaryFormat::Pe {
            bail!("expected PE image, found {:?}", object.format());
        }

        let image_base = object.relative_address_base() as usize;
        let sections = object
            .sections()
            .map(|s| -> Result<SectionInfo> {
                let (start, len) = s.file_range().unwrap_or_default();
                Ok(SectionInfo {
                    name: s.name()?.to_owned(),
                    virtual_address: s.address() as usize,
                    virtual_size: s.size() as usize,
                    file_range: start as usize..(start + len) as usize,
                    kind: s.kind(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(
            image_base = format_args!("{image_base:#x}"),
            sections = sections.len(),
            "parsed PE headers"
        );

        Ok(Self {
            image_base,
            entry_point: object.entry() as usize,
            sections,
        })
    }

    pub fn section_containing(&self, address: usize) -> Option<&SectionInfo> {
        self.sections
            .iter()
            .find(|s| (s.virtual_address..s.virtual_address + s.virtual_size).contains(&address))
    }

    /// Translate a virtual address to a file offset using the section table
    pub fn file_offset(&self, address: usize) -> Option<usize> {
        self.section_containing(address)?.file_offset(address)
    }

    /// Sections holding code
    pub fn code_sections(&self) -> impl Iterator<Item = &SectionInfo> {
        self.sections.iter().filter(|s| s.is_code())
    }
}

/// Section table of a PE image
pub fn sections(data: &[u8]) -> Result<Vec<SectionInfo>> {
    Ok(PeInfo::parse(data)?.sections)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_rejects_non_pe() {
        assert!(PeInfo::parse(&[]).is_err());
        assert!(PeInfo::parse(&[0x4D, 0x5A, 0, 0]).is_err());
        assert!(PeInfo::parse(&vec![0xCC; 0x1000]).is_err());
        assert!(sections(b"not an executable").is_err());
    }

    #[test]
    fn test_section_offsets() {
        let text = SectionInfo {
            name: ".text".into(),
            virtual_address: 0x401000,
            virtual_size: 0x2000,
            file_range: 0x400..0x2400,
            kind: SectionKind::Text,
        };
        let info = PeInfo {
            image_base: 0x400000,
            entry_point: 0x401000,
            sections: vec![text.clone()],
        };

        assert!(text.is_code());
        assert_eq!(Some(0x400), info.file_offset(0x401000));
        assert_eq!(Some(0x23FF), info.file_offset(0x402FFF));
        assert_eq!(None, info.file_offset(0x403000));
        assert_eq!(None, info.file_offset(0x400FFF));
        assert_eq!(1, info.code_sections().count());
    }
}

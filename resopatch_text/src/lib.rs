//! Reader and writer for the game's string-table container.
//!
//! ```text
//! 0x0000  magic         [u8; 16]   NUL padded ASCII
//! 0x0010  group_count   u32
//! 0x0014  string_count  u32
//! 0x0018  word_count    u32
//! 0x001C  index         [(offset: u32, count: u32); 1000]
//! 0x1F5C  pool          NUL terminated strings
//! ```
//!
//! Index offsets are relative to the start of the pool. A group with a non-zero count owns
//! `count` consecutive strings starting at its offset. Whatever lies between the end of a
//! group's last string and the start of the next group (usually surplus NULs), and whatever
//! follows the last group, is kept verbatim so an unmodified container re-encodes to the
//! identical bytes.

use std::{
    io::Write,
    ops::Range,
    path::{Path, PathBuf},
};

pub const MAGIC_LEN: usize = 16;
pub const HEADER_LEN: usize = MAGIC_LEN + 3 * 4;
pub const INDEX_ENTRIES: usize = 1000;
pub const INDEX_LEN: usize = INDEX_ENTRIES * 8;
pub const POOL_START: usize = HEADER_LEN + INDEX_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Header,
    Index,
    Pool,
}

#[derive(Debug)]
pub enum TextError {
    BadMagic([u8; MAGIC_LEN]),
    Truncated {
        section: Section,
        needed: usize,
        len: usize,
    },
    GroupOutOfRange {
        group: usize,
    },
    StringOutOfRange {
        group: usize,
        index: usize,
        count: usize,
    },
    MissingTerminator {
        group: usize,
        index: usize,
    },
    OverlappingGroups {
        group: usize,
        start: usize,
        previous_end: usize,
    },
    ContainsNul {
        group: usize,
        index: usize,
    },
    PoolTooLarge {
        len: usize,
    },
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}
impl std::error::Error for TextError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}
impl std::fmt::Display for TextError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadMagic(magic) => write!(f, "bad text container signature {magic:02X?}"),
            Self::Truncated {
                section,
                needed,
                len,
            } => write!(
                f,
                "text container truncated in {section:?}: need {needed} bytes, have {len}"
            ),
            Self::GroupOutOfRange { group } => {
                write!(f, "group {group} is outside the {INDEX_ENTRIES} entry index")
            }
            Self::StringOutOfRange {
                group,
                index,
                count,
            } => write!(f, "string {index} out of range for group {group} of {count}"),
            Self::MissingTerminator { group, index } => {
                write!(f, "string {group}:{index} has no NUL terminator")
            }
            Self::OverlappingGroups {
                group,
                start,
                previous_end,
            } => write!(
                f,
                "group {group} starts at {start:#x} inside the previous group ending at {previous_end:#x}"
            ),
            Self::ContainsNul { group, index } => {
                write!(f, "replacement for string {group}:{index} contains NUL")
            }
            Self::PoolTooLarge { len } => {
                write!(f, "string pool of {len} bytes does not fit 32 bit offsets")
            }
            Self::Io { path, source } => write!(f, "{}: {source}", path.display()),
        }
    }
}

pub type Result<T, E = TextError> = std::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub offset: u32,
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Group {
    index: usize,
    strings: Vec<Vec<u8>>,
    /// Bytes between the last terminator and the next group (or end of file)
    tail: Vec<u8>,
    /// Pool range the group occupied when parsed
    parsed: Range<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextContainer {
    magic: [u8; MAGIC_LEN],
    pub group_count: u32,
    pub string_count: u32,
    pub word_count: u32,
    index: Vec<IndexEntry>,
    /// Pool bytes before the first used group
    lead: Vec<u8>,
    groups: Vec<Group>,
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    let mut buf = [0; 4];
    buf.copy_from_slice(&data[offset..offset + 4]);
    u32::from_le_bytes(buf)
}

fn check_magic(magic: &[u8; MAGIC_LEN]) -> bool {
    let text_len = magic.iter().position(|b| *b == 0).unwrap_or(MAGIC_LEN);
    text_len > 0
        && magic[..text_len]
            .iter()
            .all(|b| b.is_ascii_graphic() || *b == b' ')
        && magic[text_len..].iter().all(|b| *b == 0)
}

impl TextContainer {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let truncated = |section, needed| TextError::Truncated {
            section,
            needed,
            len: data.len(),
        };
        if data.len() < HEADER_LEN {
            return Err(truncated(Section::Header, HEADER_LEN));
        }
        if data.len() < POOL_START {
            return Err(truncated(Section::Index, POOL_START));
        }

        let mut magic = [0; MAGIC_LEN];
        magic.copy_from_slice(&data[..MAGIC_LEN]);
        if !check_magic(&magic) {
            return Err(TextError::BadMagic(magic));
        }

        let index = (0..INDEX_ENTRIES)
            .map(|i| {
                let at = HEADER_LEN + i * 8;
                IndexEntry {
                    offset: read_u32(data, at),
                    count: read_u32(data, at + 4),
                }
            })
            .collect::<Vec<_>>();

        let pool = &data[POOL_START..];
        let used = index
            .iter()
            .enumerate()
            .filter(|(_, e)| e.count > 0)
            .collect::<Vec<_>>();

        let lead_end = used.first().map_or(pool.len(), |(_, e)| e.offset as usize);
        if lead_end > pool.len() {
            return Err(truncated(Section::Pool, POOL_START + lead_end));
        }
        let lead = pool[..lead_end].to_vec();

        let mut groups = Vec::with_capacity(used.len());
        for (n, (group, entry)) in used.iter().enumerate() {
            let group = *group;
            let mut pos = entry.offset as usize;
            if pos > pool.len() {
                return Err(truncated(Section::Pool, POOL_START + pos));
            }

            let mut strings = Vec::with_capacity(entry.count as usize);
            for index in 0..entry.count as usize {
                let len = memchr::memchr(0, &pool[pos..])
                    .ok_or(TextError::MissingTerminator { group, index })?;
                strings.push(pool[pos..pos + len].to_vec());
                pos += len + 1;
            }

            let next = used
                .get(n + 1)
                .map_or(pool.len(), |(_, e)| e.offset as usize);
            if next < pos {
                return Err(TextError::OverlappingGroups {
                    group: used[n + 1].0,
                    start: next,
                    previous_end: pos,
                });
            }
            if next > pool.len() {
                return Err(truncated(Section::Pool, POOL_START + next));
            }

            groups.push(Group {
                index: group,
                strings,
                tail: pool[pos..next].to_vec(),
                parsed: entry.offset as usize..next,
            });
        }

        tracing::debug!(
            groups = groups.len(),
            strings = groups.iter().map(|g| g.strings.len()).sum::<usize>(),
            pool = pool.len(),
            "parsed text container"
        );

        Ok(Self {
            magic,
            group_count: read_u32(data, MAGIC_LEN),
            string_count: read_u32(data, MAGIC_LEN + 4),
            word_count: read_u32(data, MAGIC_LEN + 8),
            index,
            lead,
            groups,
        })
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path).map_err(|source| TextError::Io {
            path: path.to_owned(),
            source,
        })?;
        Self::parse(&data)
    }

    pub fn magic(&self) -> &[u8; MAGIC_LEN] {
        &self.magic
    }

    /// Index table as it will be written by [`Self::to_bytes`]. Empty entries pointing into
    /// the pool move by the size change of every group that ended at or before them.
    pub fn index(&self) -> Result<Vec<IndexEntry>> {
        let encode = |offset: usize| {
            u32::try_from(offset).map_err(|_| TextError::PoolTooLarge { len: offset })
        };

        let mut index = self.index.clone();
        let mut offset = self.lead.len();
        for group in &self.groups {
            index[group.index].offset = encode(offset)?;
            offset += group.encoded_len();
        }

        for entry in index.iter_mut().filter(|e| e.count == 0 && e.offset > 0) {
            let at = entry.offset as usize;
            let grown = self
                .groups
                .iter()
                .filter(|g| g.parsed.end <= at)
                .map(|g| g.encoded_len() as isize - g.parsed.len() as isize)
                .sum::<isize>();
            entry.offset = encode(at.saturating_add_signed(grown))?;
        }
        Ok(index)
    }

    fn group(&self, group: usize) -> Result<Option<&Group>> {
        if group >= INDEX_ENTRIES {
            return Err(TextError::GroupOutOfRange { group });
        }
        Ok(self.groups.iter().find(|g| g.index == group))
    }

    /// Number of strings in `group`
    pub fn group_len(&self, group: usize) -> Result<usize> {
        Ok(self.group(group)?.map_or(0, |g| g.strings.len()))
    }

    pub fn string(&self, group: usize, index: usize) -> Result<&[u8]> {
        let g = self.group(group)?;
        let count = g.map_or(0, |g| g.strings.len());
        g.and_then(|g| g.strings.get(index))
            .map(Vec::as_slice)
            .ok_or(TextError::StringOutOfRange {
                group,
                index,
                count,
            })
    }

    /// Replace string `index` of `group`. Returns the previous value.
    pub fn replace_string(
        &mut self,
        group: usize,
        index: usize,
        value: impl Into<Vec<u8>>,
    ) -> Result<Vec<u8>> {
        let value = value.into();
        if memchr::memchr(0, &value).is_some() {
            return Err(TextError::ContainsNul { group, index });
        }
        if group >= INDEX_ENTRIES {
            return Err(TextError::GroupOutOfRange { group });
        }
        let count = self.group_len(group)?;
        let slot = self
            .groups
            .iter_mut()
            .find(|g| g.index == group)
            .and_then(|g| g.strings.get_mut(index))
            .ok_or(TextError::StringOutOfRange {
                group,
                index,
                count,
            })?;

        tracing::debug!(
            group,
            index,
            old = %String::from_utf8_lossy(slot),
            new = %String::from_utf8_lossy(&value),
            "replacing string"
        );
        Ok(std::mem::replace(slot, value))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let index = self.index()?;
        let pool_len = self.lead.len() + self.groups.iter().map(Group::encoded_len).sum::<usize>();
        if u32::try_from(pool_len).is_err() {
            return Err(TextError::PoolTooLarge { len: pool_len });
        }

        let mut out = Vec::with_capacity(POOL_START + pool_len);
        out.extend(self.magic);
        out.extend(self.group_count.to_le_bytes());
        out.extend(self.string_count.to_le_bytes());
        out.extend(self.word_count.to_le_bytes());
        for entry in index {
            out.extend(entry.offset.to_le_bytes());
            out.extend(entry.count.to_le_bytes());
        }
        out.extend(&self.lead);
        for group in &self.groups {
            for string in &group.strings {
                out.extend(string);
                out.push(0);
            }
            out.extend(&group.tail);
        }
        Ok(out)
    }

    /// Encode into a temporary file beside `path`. Nothing is visible at `path` until the
    /// returned file is committed.
    pub fn stage<P: AsRef<Path>>(&self, path: P) -> Result<StagedFile> {
        let path = path.as_ref();
        let bytes = self.to_bytes()?;
        StagedFile::new(path, &bytes).map_err(|source| TextError::Io {
            path: path.to_owned(),
            source,
        })
    }

    /// Write to a temporary file beside `path` and move it into place
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        self.stage(path)?.commit().map_err(|source| TextError::Io {
            path: path.to_owned(),
            source,
        })?;
        Ok(())
    }
}

impl Group {
    fn encoded_len(&self) -> usize {
        self.strings.iter().map(|s| s.len() + 1).sum::<usize>() + self.tail.len()
    }
}

/// File contents written and synced to a temporary sibling of their destination. Dropping
/// it without committing deletes the temporary file.
#[derive(Debug)]
pub struct StagedFile {
    path: PathBuf,
    tmp: tempfile::NamedTempFile,
}

impl StagedFile {
    pub fn new(path: &Path, bytes: &[u8]) -> std::io::Result<Self> {
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_all()?;
        Ok(Self {
            path: path.to_owned(),
            tmp,
        })
    }

    /// Destination the contents are moved to on commit
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rename over the destination
    pub fn commit(self) -> std::io::Result<PathBuf> {
        self.tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(self.path)
    }
}

/// Replace `path` with `bytes` through a temporary sibling
pub fn write_replace(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    StagedFile::new(path, bytes)?.commit()?;
    Ok(())
}

/// Text shown for a resolution entry in the options menu
pub fn resolution_label(width: u16, height: u16) -> String {
    format!("{width}x{height}")
}

/// Rewrite one resolution label of the container at `path` in place
pub fn patch_resolution_string<P: AsRef<Path>>(
    path: P,
    group: usize,
    index: usize,
    width: u16,
    height: u16,
) -> Result<()> {
    let path = path.as_ref();
    let mut container = TextContainer::load(path)?;
    container.replace_string(group, index, resolution_label(width, height))?;
    container.save(path)?;
    tracing::info!(path = %path.display(), group, index, width, height, "patched resolution text");
    Ok(())
}

use std::{collections::HashMap, fmt::Display, ops::Range};

use anyhow::{bail, Context, Error, Result};

#[derive(Clone, Eq, PartialEq)]
pub struct PatternSimple {
    pub sig: Vec<u8>,
    pub mask: Vec<u8>,
}
impl PatternSimple {
    #[inline(always)]
    pub fn is_match(&self, data: &[u8], index: usize) -> bool {
        for i in 0..self.len() {
            if data[index + i] & self.mask[i] != self.sig[i] {
                return false;
            }
        }
        true
    }
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.sig.len()
    }
    pub fn iter(&self) -> std::iter::Zip<std::slice::Iter<u8>, std::slice::Iter<u8>> {
        self.sig.iter().zip(&self.mask)
    }
}
impl Display for PatternSimple {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, (sig, mask)) in self.iter().enumerate() {
            if i != 0 {
                write!(f, " ")?;
            }
            write_byte(f, *sig, *mask)?;
        }
        Ok(())
    }
}
impl std::fmt::Debug for PatternSimple {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PatternSimple(\"{self}\")")
    }
}

fn write_byte(f: &mut std::fmt::Formatter<'_>, sig: u8, mask: u8) -> std::fmt::Result {
    match mask {
        0 => write!(f, "??"),
        0xff => write!(f, "{:02X}", sig),
        _ => {
            for i in (0..8).rev() {
                if mask & (1 << i) == 0 {
                    write!(f, "?")?;
                } else if sig & (1 << i) == 0 {
                    write!(f, "0")?;
                } else {
                    write!(f, "1")?;
                }
            }
            Ok(())
        }
    }
}

/// Byte pattern used to locate code and data when authoring a variant profile.
///
/// Words are separated by whitespace:
/// - `8B`, `?F`, `??` hex bytes with nibble wildcards
/// - `01?10?11` single byte given bit by bit
/// - `|` marks the offset reported for a match
/// - `[` `]` delimit a capture
/// - `X0x45A3F0` four wildcard bytes that must encode a rel32 pointing at the address
#[derive(Clone, Eq, PartialEq)]
pub struct Pattern {
    pub simple: PatternSimple,
    pub custom_offset: usize,
    pub captures: Vec<Range<usize>>,
    pub xrefs: Vec<(usize, Xref)>,
}

#[derive(Debug, Eq, PartialEq)]
pub struct Capture<'data> {
    pub address: usize,
    pub data: &'data [u8],
}

impl TryFrom<String> for Pattern {
    type Error = Error;
    fn try_from(string: String) -> Result<Self, <Self as TryFrom<String>>::Error> {
        Self::new(string)
    }
}
impl TryFrom<&str> for Pattern {
    type Error = Error;
    fn try_from(string: &str) -> Result<Self, <Self as TryFrom<&str>>::Error> {
        Self::new(string)
    }
}

impl Pattern {
    fn parse_binary_pattern(s: &str) -> Option<(u8, u8)> {
        if s.len() == 8 {
            let mut sig = 0;
            let mut mask = 0;
            for (i, b) in s.chars().enumerate() {
                let i = 7 - i;
                match b {
                    '0' => {
                        mask |= 1 << i;
                    }
                    '1' => {
                        sig |= 1 << i;
                        mask |= 1 << i;
                    }
                    '?' => {}
                    _ => return None,
                }
            }
            Some((sig, mask))
        } else {
            None
        }
    }

    fn parse_hex_pattern(s: &str) -> Option<(u8, u8)> {
        if s.len() == 2 {
            let mut sig = 0;
            let mut mask = 0;
            for (i, b) in s.chars().enumerate() {
                let i = (1 - i) * 4;
                if let Some(digit) = b.to_digit(16) {
                    sig |= (digit as u8) << i;
                    mask |= 0xf << i;
                } else if b != '?' {
                    return None;
                }
            }
            Some((sig, mask))
        } else {
            None
        }
    }

    pub fn parse_maybe_hex(s: &str) -> Result<usize> {
        Ok(s.strip_prefix("0x")
            .map(|s| usize::from_str_radix(s, 16))
            .unwrap_or_else(|| s.parse())?)
    }

    pub fn new<S: AsRef<str>>(s: S) -> Result<Self> {
        let mut sig = vec![];
        let mut mask = vec![];
        let mut custom_offset = 0;

        let mut capture_stack = vec![];
        let mut captures = vec![];
        let mut xrefs = vec![];

        for w in s.as_ref().split_whitespace() {
            if let Some((s, m)) =
                Self::parse_hex_pattern(w).or_else(|| Self::parse_binary_pattern(w))
            {
                sig.push(s);
                mask.push(m);
                continue;
            }
            match w {
                "|" => {
                    custom_offset = sig.len();
                }
                "[" => {
                    capture_stack.push(sig.len());
                }
                "]" => {
                    let Some(start) = capture_stack.pop() else {
                        bail!("unexpected closing capture at byte {}", sig.len());
                    };
                    captures.push(start..sig.len());
                }
                _ => {
                    let Some(xref) = w.strip_prefix('X').map(Self::parse_maybe_hex) else {
                        bail!("bad pattern word \"{}\"", w)
                    };
                    let xref = Xref(xref.with_context(|| format!("failed to parse xref {w}"))?);
                    xrefs.push((sig.len(), xref));
                    sig.extend([0; 4]);
                    mask.extend([0; 4]);
                }
            }
        }
        if let Some(start) = capture_stack.pop() {
            bail!("unclosed capture at byte {start}");
        }
        if sig.is_empty() {
            bail!("pattern must match at least one byte");
        }

        Ok(Self {
            simple: PatternSimple { sig, mask },
            custom_offset,
            captures,
            xrefs,
        })
    }
    /// Create a pattern from literal bytes with `mask` filled with 0xff and `custom_offset = 0`.
    pub fn from_bytes(sig: Vec<u8>) -> Result<Self> {
        if sig.is_empty() {
            bail!("pattern must match at least one byte");
        }
        Ok(Self {
            simple: PatternSimple {
                mask: vec![0xff; sig.len()],
                sig,
            },
            custom_offset: 0,
            captures: vec![],
            xrefs: vec![],
        })
    }
    #[inline(always)]
    pub fn is_match(&self, data: &[u8], base_address: usize, index: usize) -> bool {
        self.simple.is_match(data, index)
            && self.xrefs.iter().all(|(offset, xref)| {
                let rel = &data[index + offset..index + offset + 4];
                rel32_target(base_address + index + offset, rel) == Some(xref.0)
            })
    }
    pub fn captures<'data>(
        &self,
        data: &'data [u8],
        base_address: usize,
        index: usize,
    ) -> Option<Vec<Capture<'data>>> {
        (index + self.simple.len() <= data.len() && self.is_match(data, base_address, index))
            .then(|| {
                self.captures
                    .iter()
                    .map(|c| Capture {
                        address: base_address + index + c.start,
                        data: &data[c.start + index..c.end + index],
                    })
                    .collect()
            })
    }
    /// compute address from address relative to block as well as account for custom_offset
    pub fn compute_result(&self, base_address: usize, index: usize) -> usize {
        base_address + index + self.custom_offset
    }
}

impl Display for Pattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut i = 0;
        while i < self.simple.len() {
            if i != 0 {
                write!(f, " ")?;
                if i == self.custom_offset {
                    write!(f, "| ")?;
                }
            }
            if let Some((_, xref)) = self.xrefs.iter().find(|(offset, _)| *offset == i) {
                write!(f, "X0x{:X}", xref.0)?;
                i += 4;
            } else {
                write_byte(f, self.simple.sig[i], self.simple.mask[i])?;
                i += 1;
            }
        }
        Ok(())
    }
}
impl std::fmt::Debug for Pattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Pattern(\"{self}\")")
    }
}

/// Address targeted by a rel32 operand stored at `address`
#[derive(Debug, Clone, Copy, Hash, Eq, Ord, PartialEq, PartialOrd)]
pub struct Xref(pub usize);

/// Resolve the 4 byte displacement `rel` located at `address` (relative to the next instruction)
pub fn rel32_target(address: usize, rel: &[u8]) -> Option<usize> {
    let rel = i32::from_le_bytes(rel.try_into().ok()?);
    (address + 4).checked_add_signed(rel as isize)
}

fn chunk_size(len: usize) -> usize {
    (len / std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1))
    .max(1)
}

/// Scan `data` for every pattern. Returns one bin of match addresses per pattern.
pub fn scan_pattern(patterns: &[&Pattern], base_address: usize, data: &[u8]) -> Vec<Vec<usize>> {
    use rayon::prelude::*;

    let mut bins = patterns.iter().map(|_| vec![]).collect::<Vec<_>>();

    let Some(max) = patterns.iter().map(|p| p.simple.len()).max() else {
        return bins;
    };

    let mut by_first: HashMap<Option<u8>, Vec<(usize, &Pattern)>> = HashMap::new();
    for (pi, p) in patterns.iter().enumerate() {
        let first = (p.simple.mask[0] == 0xff).then_some(p.simple.sig[0]);
        by_first.entry(first).or_default().push((pi, p));
    }

    // cut middle short such that even the longest pattern doesn't have to bounds check
    let middle = data.len().saturating_sub(max - 1);
    let chunk_size = chunk_size(middle);

    let mut matches = (0..middle)
        .step_by(chunk_size)
        .collect::<Vec<_>>()
        .par_iter()
        .map(|&offset| {
            let chunk = &data[offset..(offset + chunk_size).min(middle)];
            let mut matches = vec![];
            for (first, patterns) in &by_first {
                let mut check = |j: usize| {
                    for (pi, p) in patterns {
                        if p.is_match(data, base_address, j) {
                            matches.push((*pi, p.compute_result(base_address, j)));
                        }
                    }
                };
                match first {
                    Some(first) => memchr::memchr_iter(*first, chunk).for_each(|i| check(offset + i)),
                    None => (0..chunk.len()).for_each(|i| check(offset + i)),
                }
            }
            matches
        })
        .flatten()
        .collect::<Vec<_>>();

    // suffix: shorter patterns may still fit between `middle` and the end of data
    for (pi, p) in patterns.iter().enumerate() {
        for i in middle..(data.len() + 1).saturating_sub(p.simple.len()) {
            if p.is_match(data, base_address, i) {
                matches.push((pi, p.compute_result(base_address, i)));
            }
        }
    }

    matches.sort_unstable();
    for (pi, addr) in matches {
        bins[pi].push(addr);
    }

    bins
}

/// Scan `data` for rel32 displacements pointing at any of `xrefs`. Returns one bin of
/// displacement addresses per xref.
pub fn scan_xref(xrefs: &[&Xref], base_address: usize, data: &[u8]) -> Vec<Vec<usize>> {
    use rayon::prelude::*;

    let mut bins = xrefs.iter().map(|_| vec![]).collect::<Vec<_>>();

    if xrefs.is_empty() || data.len() < 4 {
        return bins;
    }

    let mut targets: HashMap<usize, Vec<usize>> = HashMap::new();
    for (i, xref) in xrefs.iter().enumerate() {
        targets.entry(xref.0).or_default().push(i);
    }

    let end = data.len() - 3;
    let chunk_size = chunk_size(end);

    let matches = (0..end)
        .step_by(chunk_size)
        .collect::<Vec<_>>()
        .par_iter()
        .map(|&offset| {
            let mut matches = vec![];
            for j in offset..(offset + chunk_size).min(end) {
                let address = base_address + j;
                if let Some(indexes) = rel32_target(address, &data[j..j + 4])
                    .and_then(|target| targets.get(&target))
                {
                    matches.extend(indexes.iter().map(|i| (*i, address)));
                }
            }
            matches
        })
        .flatten()
        .collect::<Vec<_>>();

    for (i, addr) in matches {
        bins[i].push(addr);
    }
    for bin in &mut bins {
        bin.sort_unstable();
    }

    bins
}

/// Find runs of at least `min_len` zero bytes, candidates for a code cave.
pub fn find_zero_runs(data: &[u8], base_address: usize, min_len: usize) -> Vec<Range<usize>> {
    let min_len = min_len.max(1);
    let mut runs = vec![];
    let mut start = None;
    for (i, b) in data.iter().enumerate() {
        match (*b == 0, start) {
            (true, None) => start = Some(i),
            (false, Some(s)) => {
                if i - s >= min_len {
                    runs.push(base_address + s..base_address + i);
                }
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        if data.len() - s >= min_len {
            runs.push(base_address + s..base_address + data.len());
        }
    }
    runs
}

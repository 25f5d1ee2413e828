use std::{collections::HashMap, fmt::Display};

use anyhow::{bail, Context, Result};
use itertools::Itertools;

/// Number of bytes compared before a full signature comparison is attempted. Also the stride of
/// [`scan_strided`].
pub const PREFIX: usize = 4;

/// Number of byte offsets past the cursor searched for the next value of a sparse sequence.
pub const SPARSE_WINDOW: usize = 8;

/// Length of a binary GUID.
pub const GUID_LEN: usize = 16;

#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, strum::Display)]
#[strum(serialize_all = "lowercase")]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum WordSize {
    Byte,
    Dword,
    Qword,
}
impl WordSize {
    pub fn bytes(self) -> usize {
        match self {
            Self::Byte => 1,
            Self::Dword => 4,
            Self::Qword => 8,
        }
    }
    pub fn max_value(self) -> u64 {
        match self {
            Self::Byte => u8::MAX as u64,
            Self::Dword => u32::MAX as u64,
            Self::Qword => u64::MAX,
        }
    }
}

#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, strum::Display)]
#[strum(serialize_all = "lowercase")]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Endian {
    Little,
    Big,
}
impl Endian {
    pub fn read_u32(self, bytes: [u8; 4]) -> u32 {
        match self {
            Self::Little => u32::from_le_bytes(bytes),
            Self::Big => u32::from_be_bytes(bytes),
        }
    }
    fn push(self, value: u64, size: WordSize, out: &mut Vec<u8>) {
        match (size, self) {
            (WordSize::Byte, _) => out.push(value as u8),
            (WordSize::Dword, Self::Little) => out.extend((value as u32).to_le_bytes()),
            (WordSize::Dword, Self::Big) => out.extend((value as u32).to_be_bytes()),
            (WordSize::Qword, Self::Little) => out.extend(value.to_le_bytes()),
            (WordSize::Qword, Self::Big) => out.extend(value.to_be_bytes()),
        }
    }
}

/// Concrete byte form of a catalog entry, ready for exact comparison.
#[derive(Clone, Eq, PartialEq)]
pub struct Signature {
    pub bytes: Vec<u8>,
    /// Byte order the values were packed with (meaningless for byte arrays)
    pub endian: Endian,
}
impl Signature {
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }
}
impl Display for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02X}", self.bytes.iter().format(" "))
    }
}
impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature({}, \"{self}\")", self.endian)
    }
}

/// Pack `values` as `size` wide words in `endian` byte order, concatenated in order.
pub fn pack(values: &[u64], size: WordSize, endian: Endian) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(values.len() * size.bytes());
    for &value in values {
        if value > size.max_value() {
            bail!("value {value:#x} does not fit in a {size}");
        }
        endian.push(value, size, &mut out);
    }
    Ok(out)
}

/// Build every signature of an array constant: the raw bytes for byte arrays, otherwise the
/// little endian form followed by the big endian form.
pub fn build_signatures(values: &[u64], size: WordSize) -> Result<Vec<Signature>> {
    if values.is_empty() {
        bail!("array constant must contain at least one value");
    }
    let endians: &[Endian] = match size {
        WordSize::Byte => &[Endian::Little],
        _ => &[Endian::Little, Endian::Big],
    };
    endians
        .iter()
        .map(|&endian| {
            Ok(Signature {
                bytes: pack(values, size, endian)?,
                endian,
            })
        })
        .collect()
}

fn parse_hex_field(field: &str, digits: usize) -> Result<u64> {
    if field.len() != digits {
        bail!("field \"{field}\" must be {digits} hex digits");
    }
    if !field.chars().all(|c| c.is_ascii_hexdigit()) {
        bail!("field \"{field}\" is not hex");
    }
    u64::from_str_radix(field, 16).with_context(|| format!("failed to parse field \"{field}\""))
}

/// Build the in-memory layout of a textual GUID such as `0F87369F-A4E5-4CFC-BD3E-73E6154572DD`.
///
/// The first three fields are stored little endian, the fourth big endian and the last six
/// bytes verbatim.
pub fn guid_signature(text: &str) -> Result<[u8; GUID_LEN]> {
    let fields = text.trim().split('-').collect_vec();
    let [data1, data2, data3, data4, node] = fields[..] else {
        bail!(
            "expected 5 hyphen separated fields in \"{text}\", found {}",
            fields.len()
        );
    };

    let mut sig = [0; GUID_LEN];
    sig[0..4].copy_from_slice(&(parse_hex_field(data1, 8)? as u32).to_le_bytes());
    sig[4..6].copy_from_slice(&(parse_hex_field(data2, 4)? as u16).to_le_bytes());
    sig[6..8].copy_from_slice(&(parse_hex_field(data3, 4)? as u16).to_le_bytes());
    sig[8..10].copy_from_slice(&(parse_hex_field(data4, 4)? as u16).to_be_bytes());
    parse_hex_field(node, 12)?;
    for (i, dst) in sig[10..].iter_mut().enumerate() {
        *dst = u8::from_str_radix(&node[i * 2..i * 2 + 2], 16)?;
    }
    Ok(sig)
}

#[derive(Debug, Default, Eq, PartialEq)]
pub struct StridedScan {
    /// (signature index, address) of every full match
    pub matches: Vec<(usize, usize)>,
    /// (signature index, address) of matches cut short by the end of `data`
    pub truncated: Vec<(usize, usize)>,
}

/// Scan `data` in [`PREFIX`] sized strides for `signatures`.
///
/// Candidates are gated on their first [`PREFIX`] bytes and tested in slice order; the first
/// full match wins and scanning resumes past it. Signatures shorter than [`PREFIX`] never match.
/// Comparisons never read beyond `data`: a signature whose available head (longer than the
/// prefix) matches but whose tail lies past the end is reported in [`StridedScan::truncated`].
pub fn scan_strided(signatures: &[&[u8]], base_address: usize, data: &[u8]) -> StridedScan {
    let mut result = StridedScan::default();

    let mut bins: HashMap<[u8; PREFIX], Vec<usize>> = Default::default();
    for (i, sig) in signatures.iter().enumerate() {
        if let Some(prefix) = sig.get(..PREFIX) {
            let mut buf = [0; PREFIX];
            buf.copy_from_slice(prefix);
            bins.entry(buf).or_default().push(i);
        }
    }
    if bins.is_empty() {
        return result;
    }

    let mut offset = 0;
    while let Some(key) = data.get(offset..offset + PREFIX) {
        if let Some(candidates) = bins.get(key) {
            for &i in candidates {
                let sig = signatures[i];
                match data.get(offset..offset + sig.len()) {
                    Some(window) if window == sig => {
                        result.matches.push((i, base_address + offset));
                        offset += sig.len() - PREFIX;
                        break;
                    }
                    Some(_) => {}
                    None => {
                        let rest = &data[offset..];
                        if rest.len() > PREFIX && sig.starts_with(rest) {
                            result.truncated.push((i, base_address + offset));
                        }
                    }
                }
            }
        }
        offset += PREFIX;
    }

    result
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SparseMatch {
    /// index of the matched sequence
    pub index: usize,
    /// address of the first value
    pub address: usize,
    /// address just past the last value
    pub end: usize,
}

/// Scan `data` byte by byte for ordered dword `sequences` whose values may be separated by up
/// to [`SPARSE_WINDOW`] - 1 bytes of unrelated data.
///
/// After a match scanning resumes at the end of the matched sequence. Words are read in
/// `endian` byte order and never past the end of `data`.
pub fn scan_sparse(
    sequences: &[&[u32]],
    endian: Endian,
    base_address: usize,
    data: &[u8],
) -> Vec<SparseMatch> {
    let word = |offset: usize| -> Option<u32> {
        let bytes = data.get(offset..offset.checked_add(4)?)?;
        Some(endian.read_u32(bytes.try_into().ok()?))
    };

    let mut bins: HashMap<u32, Vec<usize>> = Default::default();
    for (i, seq) in sequences.iter().enumerate() {
        if let Some(first) = seq.first() {
            bins.entry(*first).or_default().push(i);
        }
    }

    let mut matches = vec![];
    if bins.is_empty() {
        return matches;
    }

    let mut offset = 0;
    while offset < data.len() {
        let mut next = offset + 1;
        if let Some(candidates) = word(offset).and_then(|w| bins.get(&w)) {
            for &i in candidates {
                if let Some(end) = complete_sparse(&word, &sequences[i][1..], offset + 4) {
                    matches.push(SparseMatch {
                        index: i,
                        address: base_address + offset,
                        end: base_address + end,
                    });
                    next = end;
                    break;
                }
            }
        }
        offset = next;
    }

    matches
}

fn complete_sparse(
    word: impl Fn(usize) -> Option<u32>,
    rest: &[u32],
    mut cursor: usize,
) -> Option<usize> {
    for expected in rest {
        let hit = (0..SPARSE_WINDOW).find(|i| word(cursor + i) == Some(*expected))?;
        cursor += hit + 4;
    }
    Some(cursor)
}

/// Find every (possibly overlapping) occurrence of `needle` in `data`.
pub fn find_all(needle: &[u8], base_address: usize, data: &[u8]) -> Vec<usize> {
    let mut found = vec![];
    if needle.is_empty() {
        return found;
    }
    let finder = memchr::memmem::Finder::new(needle);
    let mut pos = 0;
    while let Some(i) = data.get(pos..).and_then(|rest| finder.find(rest)) {
        found.push(base_address + pos + i);
        pos += i + 1;
    }
    found
}

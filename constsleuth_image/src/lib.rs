pub mod disassemble;
pub mod image;

pub mod scanner {
    pub use constsleuth_scanner::*;
}

use std::{
    borrow::Cow,
    ops::{Range, RangeFrom},
};

use scanner::Endian;

pub use image::{Image, ImageBuilder};

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MemoryAccessError {
    MemoryOutOfBoundsError,
}
impl std::error::Error for MemoryAccessError {}
impl std::fmt::Display for MemoryAccessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MemoryOutOfBoundsError => write!(f, "MemoryOutOfBoundsError"),
        }
    }
}

/// Continuous section of memory
pub trait MemoryBlockTrait<'data> {
    /// Return starting address of block
    fn address(&self) -> usize;
    /// Returned contained memory
    fn data(&self) -> &[u8];
}

/// Potentially sparse section of memory
pub trait MemoryTrait<'data> {
    /// Return u8 at `address`
    fn index(&self, address: usize) -> Result<u8, MemoryAccessError>;
    /// Return slice of u8 at `range`
    fn range(&self, range: Range<usize>) -> Result<&[u8], MemoryAccessError>;
    /// Return slice of u8 from start of `range` to end of block
    fn range_from(&self, range: RangeFrom<usize>) -> Result<&[u8], MemoryAccessError>;

    /// Return u32 at `address`
    fn u32_le(&self, address: usize) -> Result<u32, MemoryAccessError> {
        let bytes = self.range(address..address + std::mem::size_of::<u32>())?;
        bytes
            .try_into()
            .map(u32::from_le_bytes)
            .map_err(|_| MemoryAccessError::MemoryOutOfBoundsError)
    }
}

impl<'data, T: MemoryBlockTrait<'data>> MemoryTrait<'data> for T {
    fn index(&self, address: usize) -> Result<u8, MemoryAccessError> {
        address
            .checked_sub(self.address())
            .and_then(|offset| self.data().get(offset))
            .copied()
            .ok_or(MemoryAccessError::MemoryOutOfBoundsError)
    }
    fn range(&self, range: Range<usize>) -> Result<&[u8], MemoryAccessError> {
        let start = range.start.checked_sub(self.address());
        let end = range.end.checked_sub(self.address());
        start
            .zip(end)
            .and_then(|(start, end)| self.data().get(start..end))
            .ok_or(MemoryAccessError::MemoryOutOfBoundsError)
    }
    fn range_from(&self, range: RangeFrom<usize>) -> Result<&[u8], MemoryAccessError> {
        range
            .start
            .checked_sub(self.address())
            .and_then(|start| self.data().get(start..))
            .ok_or(MemoryAccessError::MemoryOutOfBoundsError)
    }
}

impl<'data> MemoryTrait<'data> for Memory<'data> {
    fn index(&self, address: usize) -> Result<u8, MemoryAccessError> {
        self.get_section_containing(address)?.index(address)
    }
    fn range(&self, range: Range<usize>) -> Result<&[u8], MemoryAccessError> {
        self.get_section_containing(range.start)?.range(range)
    }
    fn range_from(&self, range: RangeFrom<usize>) -> Result<&[u8], MemoryAccessError> {
        self.get_section_containing(range.start)?.range_from(range)
    }
}

#[derive(Default, Debug, Clone, PartialEq)]
pub struct SectionFlags {
    pub kind: Option<object::SectionKind>,
    /// section contains executable code
    pub code: bool,
}

pub struct NamedMemorySection<'data> {
    name: String,
    flags: SectionFlags,
    address: usize,
    data: Cow<'data, [u8]>,
}

impl<'data> NamedMemorySection<'data> {
    pub fn new<D: Into<Cow<'data, [u8]>>>(
        name: String,
        address: usize,
        flags: SectionFlags,
        data: D,
    ) -> Self {
        Self {
            name,
            flags,
            address,
            data: data.into(),
        }
    }
}
impl NamedMemorySection<'_> {
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn flags(&self) -> &SectionFlags {
        &self.flags
    }
    pub fn len(&self) -> usize {
        self.data.len()
    }
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
    pub fn address_range(&self) -> Range<usize> {
        self.address..self.address + self.data.len()
    }
}
impl<'data> MemoryBlockTrait<'data> for NamedMemorySection<'data> {
    fn address(&self) -> usize {
        self.address
    }
    fn data(&self) -> &[u8] {
        &self.data
    }
}

#[derive(Default)]
pub struct Memory<'data> {
    pub sections: Vec<NamedMemorySection<'data>>,
}
impl<'data> Memory<'data> {
    pub fn new(sections: Vec<NamedMemorySection<'data>>) -> Self {
        Self { sections }
    }
    pub fn sections(&self) -> &[NamedMemorySection<'data>] {
        &self.sections
    }
    pub fn get_section_containing(
        &self,
        address: usize,
    ) -> Result<&NamedMemorySection<'data>, MemoryAccessError> {
        self.sections
            .iter()
            .find(|section| section.address_range().contains(&address))
            .ok_or(MemoryAccessError::MemoryOutOfBoundsError)
    }
}

/// Contiguous range of the address space as seen by the scanners.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SegmentInfo {
    pub name: String,
    pub range: Range<usize>,
    /// segment holds code
    pub code: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Function {
    pub range: Range<usize>,
    /// statically linked library code
    pub library: bool,
    /// function only forwards to another function
    pub thunk: bool,
}
impl Function {
    pub fn new(range: Range<usize>) -> Self {
        Self {
            range,
            library: false,
            thunk: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum OperandKind {
    Register,
    Immediate,
    Memory,
    Branch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Operand {
    pub kind: OperandKind,
    /// immediate value, branch target, memory displacement or register number
    pub value: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedInstruction {
    pub address: usize,
    pub length: usize,
    pub operands: Vec<Operand>,
}
impl DecodedInstruction {
    pub fn immediates(&self) -> impl Iterator<Item = u64> + '_ {
        self.operands
            .iter()
            .filter(|op| op.kind == OperandKind::Immediate)
            .map(|op| op.value)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecodeError {
    Memory(MemoryAccessError),
    Invalid(usize),
    UnsupportedArchitecture(String),
}
impl std::error::Error for DecodeError {}
impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Memory(err) => write!(f, "{err}"),
            Self::Invalid(address) => write!(f, "invalid instruction at {address:#x}"),
            Self::UnsupportedArchitecture(arch) => {
                write!(f, "cannot decode instructions for {arch}")
            }
        }
    }
}
impl From<MemoryAccessError> for DecodeError {
    fn from(value: MemoryAccessError) -> Self {
        Self::Memory(value)
    }
}

/// Read-only view of a disassembled image.
pub trait AddressSpace: Sync {
    /// Segments in image order
    fn segments(&self) -> Vec<SegmentInfo>;
    /// Return `len` bytes at `address`; fails if the range leaves the containing segment
    fn read_bytes(&self, address: usize, len: usize) -> Result<&[u8], MemoryAccessError>;
    /// Known functions sorted by start address
    fn functions(&self) -> Vec<Function>;
    fn decode_instruction(&self, address: usize) -> Result<DecodedInstruction, DecodeError>;
    /// Start of the closest instruction that begins before `address`
    fn previous_head(&self, address: usize) -> Option<usize>;
    fn bitness(&self) -> u32;
    fn endian(&self) -> Endian;
    /// Whether [`AddressSpace::decode_instruction`] supports this image's architecture
    fn can_decode(&self) -> bool;
}

#[cfg(feature = "image-pe")]
pub mod pe;

use std::{borrow::Cow, collections::HashMap, ops::Range};

use anyhow::{bail, Context, Result};
use itertools::Itertools;
use object::{
    Architecture, Object, ObjectKind, ObjectSection, ObjectSymbol, SectionIndex, SectionKind,
    SymbolKind,
};
use tracing::debug;

use crate::{scanner::Endian, *};

pub struct Image<'data> {
    pub base_address: usize,
    pub memory: Memory<'data>,
    /// sorted by start address
    pub functions: Vec<Function>,
    pub bitness: u32,
    pub endian: Endian,
    /// set when instructions of this architecture cannot be decoded
    pub unsupported_architecture: Option<String>,
}

impl<'data> Image<'data> {
    pub fn builder() -> ImageBuilder<'data> {
        Default::default()
    }
    pub fn read(data: &'data [u8]) -> Result<Image<'data>> {
        Self::builder().build(data)
    }

    pub fn get_function_containing(&self, address: usize) -> Option<&Function> {
        let i = self
            .functions
            .partition_point(|f| f.range.start <= address);
        i.checked_sub(1)
            .map(|i| &self.functions[i])
            .filter(|f| f.range.contains(&address))
    }

    fn from_object(builder: ImageBuilder<'data>, object: object::File<'data>) -> Result<Self> {
        let (bitness, unsupported_architecture) = match object.architecture() {
            Architecture::X86_64 => (64, None),
            Architecture::X86_64_X32 | Architecture::I386 => (32, None),
            arch => (
                if object.is_64() { 64 } else { 32 },
                Some(format!("{arch:?}")),
            ),
        };
        let endian = if object.is_little_endian() {
            Endian::Little
        } else {
            Endian::Big
        };

        let layout = section_layout(&object, builder.base_address.unwrap_or_default());

        let mut sections = vec![];
        for section in object.sections() {
            let kind = section.kind();
            if !is_loaded(kind) {
                continue;
            }
            let data = section
                .data()
                .with_context(|| format!("failed to read section {:?}", section.name()))?;
            if data.is_empty() {
                continue;
            }
            let address = layout
                .get(&section.index())
                .copied()
                .unwrap_or(section.address() as usize);
            sections.push(NamedMemorySection::new(
                section.name()?.to_string(),
                address,
                SectionFlags {
                    kind: Some(kind),
                    code: kind == SectionKind::Text,
                },
                data,
            ));
        }

        let mut image = Image {
            base_address: object.relative_address_base() as usize,
            memory: Memory::new(sections),
            functions: vec![],
            bitness,
            endian,
            unsupported_architecture,
        };

        let discovered = if builder.functions {
            image.discover_functions(&object, &layout)?
        } else {
            vec![]
        };
        image.set_functions(discovered, builder.extra_functions, builder.functions);
        Ok(image)
    }

    fn discover_functions(
        &self,
        object: &object::File<'data>,
        layout: &HashMap<SectionIndex, usize>,
    ) -> Result<Vec<Function>> {
        #[cfg(feature = "image-pe")]
        {
            let ranges = match object {
                object::File::Pe32(pe) => {
                    Some(pe::exception_functions(pe, &self.memory, self.base_address)?)
                }
                object::File::Pe64(pe) => {
                    Some(pe::exception_functions(pe, &self.memory, self.base_address)?)
                }
                _ => None,
            };
            if let Some(ranges) = ranges.filter(|r| !r.is_empty()) {
                debug!("read {} functions from exception directory", ranges.len());
                return Ok(ranges
                    .into_iter()
                    .map(|range| self.classify(range, false))
                    .collect());
            }
        }

        let functions = object
            .symbols()
            .chain(object.dynamic_symbols())
            .filter(|s| s.kind() == SymbolKind::Text && s.is_definition() && s.size() > 0)
            .map(|s| {
                let section = s
                    .section_index()
                    .and_then(|i| object.section_by_index(i).ok());
                let offset = section
                    .as_ref()
                    .and_then(|section| layout.get(&section.index()))
                    .copied()
                    .unwrap_or_default();
                let plt = section
                    .and_then(|section| section.name().ok().map(|n| n.starts_with(".plt")))
                    .unwrap_or(false);
                let start = offset + s.address() as usize;
                self.classify(start..start + s.size() as usize, plt)
            })
            .collect::<Vec<_>>();
        debug!("read {} functions from symbols", functions.len());
        Ok(functions)
    }

    fn classify(&self, range: Range<usize>, thunk: bool) -> Function {
        let thunk = thunk
            || (self.unsupported_architecture.is_none()
                && self
                    .memory
                    .range(range.clone())
                    .map(|data| disassemble::is_thunk(self.bitness, data, range.start))
                    .unwrap_or(false));
        Function {
            range,
            library: false,
            thunk,
        }
    }

    fn set_functions(&mut self, discovered: Vec<Function>, extra: Vec<Function>, fallback: bool) {
        let mut functions = discovered.into_iter().chain(extra).collect::<Vec<_>>();
        functions.sort_by_key(|f| (f.range.start, f.range.end));
        functions.dedup_by_key(|f| f.range.start);

        if functions.is_empty() && fallback {
            functions = self
                .memory
                .sections()
                .iter()
                .filter(|s| s.flags().code)
                .map(|s| Function::new(s.address_range()))
                .collect();
            debug!(
                "no functions discovered, treating {} code segments as functions",
                functions.len()
            );
        }
        self.functions = functions;
    }
}

/// Sections of relocatable objects all start at 0 so lay them out back to back.
fn section_layout(object: &object::File<'_>, base: usize) -> HashMap<SectionIndex, usize> {
    let mut layout = HashMap::new();
    if object.kind() != ObjectKind::Relocatable {
        return layout;
    }
    let mut cursor = base;
    for section in object.sections().filter(|s| is_loaded(s.kind())) {
        let align = (section.align() as usize).max(1);
        cursor = cursor.div_ceil(align) * align;
        layout.insert(section.index(), cursor);
        cursor += section.size() as usize;
    }
    layout
}

fn is_loaded(kind: SectionKind) -> bool {
    matches!(
        kind,
        SectionKind::Text
            | SectionKind::Data
            | SectionKind::ReadOnlyData
            | SectionKind::ReadOnlyDataWithRel
            | SectionKind::ReadOnlyString
            | SectionKind::Tls
    )
}

pub struct ImageBuilder<'data> {
    functions: bool,
    raw: bool,
    base_address: Option<usize>,
    bitness: Option<u32>,
    endian: Option<Endian>,
    sections: Vec<NamedMemorySection<'data>>,
    extra_functions: Vec<Function>,
}
impl Default for ImageBuilder<'_> {
    fn default() -> Self {
        Self {
            functions: true,
            raw: false,
            base_address: None,
            bitness: None,
            endian: None,
            sections: vec![],
            extra_functions: vec![],
        }
    }
}
impl<'data> ImageBuilder<'data> {
    /// Discover functions (on by default). When none are found every code segment is
    /// treated as one function.
    pub fn functions(mut self, functions: bool) -> Self {
        self.functions = functions;
        self
    }
    /// Load input that is not a recognized object file as a single code segment
    pub fn raw(mut self, raw: bool) -> Self {
        self.raw = raw;
        self
    }
    pub fn base_address(mut self, base_address: usize) -> Self {
        self.base_address = Some(base_address);
        self
    }
    pub fn bitness(mut self, bitness: u32) -> Self {
        self.bitness = Some(bitness);
        self
    }
    pub fn endian(mut self, endian: Endian) -> Self {
        self.endian = Some(endian);
        self
    }
    pub fn segment<D: Into<Cow<'data, [u8]>>>(
        mut self,
        name: impl Into<String>,
        address: usize,
        code: bool,
        data: D,
    ) -> Self {
        let kind = if code {
            SectionKind::Text
        } else {
            SectionKind::Data
        };
        self.sections.push(NamedMemorySection::new(
            name.into(),
            address,
            SectionFlags {
                kind: Some(kind),
                code,
            },
            data,
        ));
        self
    }
    pub fn function(mut self, function: Function) -> Self {
        self.extra_functions.push(function);
        self
    }

    pub fn build(self, data: &'data [u8]) -> Result<Image<'data>> {
        match object::File::parse(data) {
            Ok(object) => Image::from_object(self, object),
            Err(err) if self.raw => {
                debug!("not an object file ({err}), loading as raw image");
                let base_address = self.base_address.unwrap_or_default();
                self.segment("raw", base_address, true, data).build_segments()
            }
            Err(err) => Err(err).context("failed to parse object file"),
        }
    }

    /// Build an image from the segments and functions added to this builder.
    pub fn build_segments(self) -> Result<Image<'data>> {
        let bitness = self.bitness.unwrap_or(64);
        if ![16, 32, 64].contains(&bitness) {
            bail!("unsupported bitness {bitness}");
        }

        let mut sections = self.sections;
        sections.retain(|s| !s.is_empty());
        sections.sort_by_key(|s| s.address());
        if let Some((a, b)) = sections
            .iter()
            .tuple_windows()
            .find(|(a, b)| a.address_range().end > b.address())
        {
            bail!("segments {:?} and {:?} overlap", a.name(), b.name());
        }

        let mut image = Image {
            base_address: self
                .base_address
                .or_else(|| sections.first().map(|s| s.address()))
                .unwrap_or_default(),
            memory: Memory::new(sections),
            functions: vec![],
            bitness,
            endian: self.endian.unwrap_or(Endian::Little),
            unsupported_architecture: None,
        };
        image.set_functions(vec![], self.extra_functions, self.functions);
        Ok(image)
    }
}

impl AddressSpace for Image<'_> {
    fn segments(&self) -> Vec<SegmentInfo> {
        self.memory
            .sections()
            .iter()
            .map(|s| SegmentInfo {
                name: s.name().to_string(),
                range: s.address_range(),
                code: s.flags().code,
            })
            .collect()
    }
    fn read_bytes(&self, address: usize, len: usize) -> Result<&[u8], MemoryAccessError> {
        let end = address
            .checked_add(len)
            .ok_or(MemoryAccessError::MemoryOutOfBoundsError)?;
        self.memory.range(address..end)
    }
    fn functions(&self) -> Vec<Function> {
        self.functions.clone()
    }
    fn decode_instruction(&self, address: usize) -> Result<DecodedInstruction, DecodeError> {
        if let Some(arch) = &self.unsupported_architecture {
            return Err(DecodeError::UnsupportedArchitecture(arch.clone()));
        }
        disassemble::decode(self.bitness, self.memory.range_from(address..)?, address)
    }
    fn previous_head(&self, address: usize) -> Option<usize> {
        if !self.can_decode() {
            return None;
        }
        let start = match self.get_function_containing(address) {
            Some(f) => f.range.start,
            None => self.memory.get_section_containing(address).ok()?.address(),
        };
        let data = self.memory.range_from(start..).ok()?;
        disassemble::previous_head(self.bitness, data, start, address)
    }
    fn bitness(&self) -> u32 {
        self.bitness
    }
    fn endian(&self) -> Endian {
        self.endian
    }
    fn can_decode(&self) -> bool {
        self.unsupported_architecture.is_none()
    }
}

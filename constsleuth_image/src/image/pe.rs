use std::ops::Range;

use anyhow::{Context, Result};
use object::read::pe::{ImageNtHeaders, PeFile};
use object::ReadRef;

use crate::{MemoryAccessError, MemoryTrait};

/// Size of a RUNTIME_FUNCTION entry
const RUNTIME_FUNCTION_SIZE: usize = 12;

#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeFunction {
    pub range: Range<usize>,
    pub unwind: usize,
}
impl RuntimeFunction {
    pub fn read<'data>(
        memory: &(impl MemoryTrait<'data> + ?Sized),
        base_address: usize,
        address: usize,
    ) -> Result<Self, MemoryAccessError> {
        let addr_begin = base_address + memory.u32_le(address)? as usize;
        let addr_end = base_address + memory.u32_le(address + 4)? as usize;
        let unwind = base_address + memory.u32_le(address + 8)? as usize;

        Ok(RuntimeFunction {
            range: addr_begin..addr_end,
            unwind,
        })
    }
}

/// Read every function (or chained function chunk) listed in the exception directory.
pub fn exception_functions<'data, 'm, Pe, R>(
    pe: &PeFile<'data, Pe, R>,
    memory: &(impl MemoryTrait<'m> + ?Sized),
    base_address: usize,
) -> Result<Vec<Range<usize>>>
where
    Pe: ImageNtHeaders,
    R: ReadRef<'data>,
{
    let Some(directory) = pe.data_directory(object::pe::IMAGE_DIRECTORY_ENTRY_EXCEPTION) else {
        return Ok(vec![]);
    };
    let (address, size) = directory.address_range();
    let start = base_address + address as usize;
    let count = size as usize / RUNTIME_FUNCTION_SIZE;

    let mut functions = Vec::with_capacity(count);
    for i in 0..count {
        let entry = start + i * RUNTIME_FUNCTION_SIZE;
        let f = RuntimeFunction::read(memory, base_address, entry)
            .with_context(|| format!("failed to read RUNTIME_FUNCTION at {entry:#x}"))?;
        if !f.range.is_empty() {
            functions.push(f.range);
        }
    }
    Ok(functions)
}

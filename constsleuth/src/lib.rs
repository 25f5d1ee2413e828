pub mod annotate;
pub mod catalog;
pub mod crypt;
pub mod guid;

pub mod scanner {
    pub use constsleuth_scanner::*;
}
pub mod image {
    pub use constsleuth_image::*;
}

use std::fmt::Display;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::warn;

use scanner::Endian;

pub use annotate::{Annotation, AnnotationError, Annotator, DataType, MemoryAnnotations};
pub use catalog::{Catalog, ConstantEntry, ConstantKind};
pub use crypt::find_crypto;
pub use guid::{find_guids, GuidEntry, GuidList};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// prepended to names given to constant arrays
    pub name_prefix: String,
    /// prepended to comments left on instructions
    pub comment_prefix: String,
    /// shard the search phase across threads
    pub parallel: bool,
}
impl Default for Config {
    fn default() -> Self {
        Self {
            name_prefix: "FC_".to_string(),
            comment_prefix: "FC: ".to_string(),
            parallel: false,
        }
    }
}

/// Catalog entry a match was produced for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchedEntry<'c> {
    Constant(&'c ConstantEntry),
    Guid(&'c GuidEntry),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MatchKind {
    NonSparse { endian: Endian },
    Sparse { end: usize },
    Operand { value: u64 },
    Guid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MatchResult<'c> {
    pub address: usize,
    pub entry: MatchedEntry<'c>,
    pub kind: MatchKind,
    /// name or comment actually written, `None` if naming failed
    pub applied_name: Option<String>,
}
impl MatchResult<'_> {
    pub fn name(&self) -> &str {
        match self.entry {
            MatchedEntry::Constant(e) => &e.name,
            MatchedEntry::Guid(e) => &e.name,
        }
    }
    /// algorithm of a constant or text form of a GUID
    pub fn detail(&self) -> &str {
        match self.entry {
            MatchedEntry::Constant(e) => &e.algorithm,
            MatchedEntry::Guid(e) => &e.guid,
        }
    }
}

/// Non-fatal problem encountered during a run. The affected item is skipped and the run goes on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Problem {
    MalformedSignatureInput { entry: String, reason: String },
    NameCollisionExhausted { address: usize, name: String },
    InstructionDecodeFailure { address: usize, reason: String },
    OutOfRangeRead { address: usize, entry: String },
    Annotation { address: usize, reason: String },
}
impl Display for Problem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MalformedSignatureInput { entry, reason } => {
                write!(f, "malformed entry {entry}: {reason}")
            }
            Self::NameCollisionExhausted { address, name } => {
                write!(f, "{address:#x}: failed to apply {name}")
            }
            Self::InstructionDecodeFailure { address, reason } => {
                write!(f, "{address:#x}: failed to decode instruction: {reason}")
            }
            Self::OutOfRangeRead { address, entry } => {
                write!(f, "{address:#x}: {entry} runs past the end of its segment")
            }
            Self::Annotation { address, reason } => {
                write!(f, "{address:#x}: failed to annotate: {reason}")
            }
        }
    }
}

#[derive(Debug, Default, Serialize)]
pub struct Report<'c> {
    pub matches: Vec<MatchResult<'c>>,
    pub problems: Vec<Problem>,
}
impl<'c> Report<'c> {
    pub(crate) fn problem(&mut self, problem: Problem) {
        warn!("{problem}");
        self.problems.push(problem);
    }
}

/// Receives progress of a run. Called from worker threads when running in parallel.
pub trait Observer: Sync {
    fn begin(&self, _stage: &str, _total: usize) {}
    fn advance(&self, _n: usize) {}
    fn finish(&self) {}
}
impl Observer for () {}

fn map_items<T, R, F>(items: &[T], parallel: bool, f: F) -> Vec<R>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Sync + Send,
{
    if parallel {
        items.par_iter().map(f).collect()
    } else {
        items.iter().map(f).collect()
    }
}

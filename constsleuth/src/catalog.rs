pub mod tables;

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Deserializer, Serialize};

use crate::scanner::{build_signatures, Signature, WordSize, PREFIX};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConstantKind {
    /// contiguous array
    NonSparse,
    /// dword sequence with gaps, usually immediates loaded by consecutive instructions
    Sparse,
    /// single immediate operand
    Operand,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstantEntry {
    pub name: String,
    pub algorithm: String,
    pub kind: ConstantKind,
    pub word_size: WordSize,
    /// integers or hex strings such as `"0x67452301"`
    #[serde(deserialize_with = "deserialize_values")]
    pub values: Vec<u64>,
}

fn deserialize_values<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u64>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Value {
        Int(u64),
        Text(String),
    }
    Vec::<Value>::deserialize(deserializer)?
        .into_iter()
        .map(|value| match value {
            Value::Int(v) => Ok(v),
            Value::Text(s) => {
                let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                    Some(hex) => u64::from_str_radix(hex, 16),
                    None => s.parse(),
                };
                parsed.map_err(|e| serde::de::Error::custom(format!("bad value {s:?}: {e}")))
            }
        })
        .collect()
}

impl ConstantEntry {
    pub fn new(
        name: impl Into<String>,
        algorithm: impl Into<String>,
        kind: ConstantKind,
        word_size: WordSize,
        values: impl IntoIterator<Item = u64>,
    ) -> Self {
        Self {
            name: name.into(),
            algorithm: algorithm.into(),
            kind,
            word_size,
            values: values.into_iter().collect(),
        }
    }

    /// Length of the in-memory form of a non-sparse entry.
    pub fn byte_len(&self) -> usize {
        self.values.len() * self.word_size.bytes()
    }

    pub fn validate(&self) -> Result<()> {
        if self.values.is_empty() {
            bail!("no values");
        }
        if let Some(v) = self
            .values
            .iter()
            .find(|&&v| v > self.word_size.max_value())
        {
            bail!("value {v:#x} does not fit in a {}", self.word_size);
        }
        match self.kind {
            ConstantKind::NonSparse => {
                if self.byte_len() < PREFIX {
                    bail!(
                        "array of {} bytes is shorter than the {PREFIX} byte prefix",
                        self.byte_len()
                    );
                }
            }
            ConstantKind::Sparse => {
                if self.word_size != WordSize::Dword {
                    bail!("sparse constants must be dwords");
                }
            }
            ConstantKind::Operand => {
                if self.values.len() != 1 {
                    bail!("operand constant must have exactly one value");
                }
                if self.word_size == WordSize::Byte {
                    bail!("operand constant must be a dword or qword");
                }
            }
        }
        Ok(())
    }

    /// Signatures of a non-sparse entry, little endian first.
    pub fn signatures(&self) -> Result<Vec<Signature>> {
        self.validate()?;
        if self.kind != ConstantKind::NonSparse {
            bail!("{} constants have no byte signature", self.kind);
        }
        build_signatures(&self.values, self.word_size)
    }

    /// Whether an immediate operand holds this operand constant. A dword constant also matches
    /// a 64-bit immediate that is its sign extension.
    pub fn matches_immediate(&self, immediate: u64) -> bool {
        let Some(&value) = self.values.first() else {
            return false;
        };
        immediate == value
            || (self.word_size == WordSize::Dword
                && immediate as u32 as u64 == value
                && immediate as u32 as i32 as i64 as u64 == immediate)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Catalog {
    pub entries: Vec<ConstantEntry>,
}
impl Catalog {
    pub fn new(entries: Vec<ConstantEntry>) -> Self {
        Self { entries }
    }

    pub fn builtin() -> Self {
        use tables::*;
        use ConstantKind::*;
        use WordSize::*;

        let bytes = |b: &[u8]| b.iter().map(|&b| b as u64).collect::<Vec<_>>();
        let dwords = |d: &[u32]| d.iter().map(|&d| d as u64).collect::<Vec<_>>();

        let mut entries = vec![
            ConstantEntry::new("AES_sbox", "AES", NonSparse, Byte, bytes(&AES_SBOX)),
            ConstantEntry::new("AES_inv_sbox", "AES", NonSparse, Byte, bytes(&AES_INV_SBOX)),
            ConstantEntry::new("AES_Te0", "AES", NonSparse, Dword, dwords(&AES_TE0)),
            ConstantEntry::new("AES_Td0", "AES", NonSparse, Dword, dwords(&AES_TD0)),
            ConstantEntry::new("AES_rcon", "AES", NonSparse, Dword, dwords(&AES_RCON)),
            ConstantEntry::new("SHA256_K", "SHA-256", NonSparse, Dword, dwords(&SHA256_K)),
            ConstantEntry::new("SHA512_K", "SHA-512", NonSparse, Qword, SHA512_K),
            ConstantEntry::new("MD5_T", "MD5", NonSparse, Dword, dwords(&MD5_T)),
            ConstantEntry::new("CRC32_table", "CRC-32", NonSparse, Dword, dwords(&CRC32_TABLE)),
            ConstantEntry::new("Blowfish_P", "Blowfish", NonSparse, Dword, dwords(&BLOWFISH_P)),
            ConstantEntry::new("Base64_alphabet", "Base64", NonSparse, Byte, bytes(BASE64_ALPHABET)),
            // SHA-1 before MD5: its initial state starts with the MD5 one
            ConstantEntry::new("SHA1_init", "SHA-1", Sparse, Dword, dwords(&SHA1_INIT)),
            ConstantEntry::new("MD5_init", "MD5", Sparse, Dword, dwords(&MD5_INIT)),
            ConstantEntry::new("SHA224_init", "SHA-224", Sparse, Dword, dwords(&SHA224_INIT)),
            ConstantEntry::new("SHA256_init", "SHA-256", Sparse, Dword, dwords(&SHA256_INIT)),
        ];
        entries.extend(OPERANDS.iter().map(|&(name, algorithm, value)| {
            let size = if value > u32::MAX as u64 { Qword } else { Dword };
            ConstantEntry::new(name, algorithm, Operand, size, [value])
        }));
        Self { entries }
    }

    /// Parse a JSON array of entries.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read catalog {}", path.display()))?;
        Self::from_json(&json).with_context(|| format!("failed to parse catalog {}", path.display()))
    }

    pub fn extend(&mut self, other: Catalog) {
        self.entries.extend(other.entries);
    }

    pub fn retain(&mut self, f: impl FnMut(&ConstantEntry) -> bool) {
        self.entries.retain(f);
    }

    pub fn of_kind(&self, kind: ConstantKind) -> impl Iterator<Item = &ConstantEntry> {
        self.entries.iter().filter(move |e| e.kind == kind)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

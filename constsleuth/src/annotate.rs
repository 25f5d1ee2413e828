use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::scanner::WordSize;

/// Number of numbered suffixes tried once a name is taken.
pub const NAME_SUFFIXES: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DataType {
    Array { element: WordSize, count: usize },
    Struct { name: String, size: usize },
}
impl DataType {
    pub fn size(&self) -> usize {
        match self {
            Self::Array { element, count } => element.bytes() * count,
            Self::Struct { size, .. } => *size,
        }
    }
}
impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Array { element, count } => write!(f, "{element}[{count}]"),
            Self::Struct { name, .. } => write!(f, "{name}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructField {
    pub name: String,
    pub offset: usize,
    pub size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructDef {
    pub name: String,
    pub fields: Vec<StructField>,
}
impl StructDef {
    pub fn size(&self) -> usize {
        self.fields
            .iter()
            .map(|f| f.offset + f.size)
            .max()
            .unwrap_or_default()
    }
    pub fn data_type(&self) -> DataType {
        DataType::Struct {
            name: self.name.clone(),
            size: self.size(),
        }
    }
    pub fn guid() -> Self {
        let field = |name: &str, offset, size| StructField {
            name: name.to_string(),
            offset,
            size,
        };
        Self {
            name: "GUID".to_string(),
            fields: vec![
                field("Data1", 0, 4),
                field("Data2", 4, 2),
                field("Data3", 6, 2),
                field("Data4", 8, 8),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Annotation {
    /// Name the address
    Name(String),
    /// Merge into the comment at the address
    Comment(String),
    /// Classify the bytes at the address, replacing overlapping classifications
    Type(DataType),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnnotationError {
    NameInUse { name: String, owner: usize },
    Backend(String),
}
impl std::error::Error for AnnotationError {}
impl std::fmt::Display for AnnotationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NameInUse { name, owner } => write!(f, "name {name} is used by {owner:#x}"),
            Self::Backend(err) => write!(f, "{err}"),
        }
    }
}

/// Persistent store of names, comments and data types keyed by address.
pub trait Annotator {
    fn annotate(&mut self, address: usize, annotation: Annotation) -> Result<(), AnnotationError>;
    fn name_exists(&self, name: &str) -> Result<bool, AnnotationError>;
    fn name_of(&self, address: usize) -> Result<Option<String>, AnnotationError>;
    fn comment(&self, address: usize) -> Result<Option<String>, AnnotationError>;
    fn struct_exists(&self, name: &str) -> Result<bool, AnnotationError>;
    fn define_struct(&mut self, def: &StructDef) -> Result<(), AnnotationError>;
}

/// Combine `text` with an existing comment. Returns `None` if `text` is already present.
pub fn merge_comment(existing: Option<&str>, text: &str) -> Option<String> {
    match existing {
        None | Some("") => Some(text.to_string()),
        Some(existing) => {
            let present = existing == text
                || existing.starts_with(&format!("{text} "))
                || existing.ends_with(&format!(" {text}"))
                || existing.contains(&format!(" {text} "));
            (!present).then(|| format!("{existing} {text}"))
        }
    }
}

/// Name `address` `base`, falling back to `base_0` through `base_99` when the name belongs to
/// another address. Returns the applied name or `None` if every candidate is taken.
pub fn apply_unique_name(
    annotator: &mut (impl Annotator + ?Sized),
    address: usize,
    base: &str,
) -> Result<Option<String>, AnnotationError> {
    let candidates =
        std::iter::once(base.to_string()).chain((0..NAME_SUFFIXES).map(|i| format!("{base}_{i}")));
    for name in candidates {
        match annotator.annotate(address, Annotation::Name(name.clone())) {
            Ok(()) => return Ok(Some(name)),
            Err(AnnotationError::NameInUse { .. }) => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(None)
}

/// In-memory [`Annotator`].
#[derive(Debug, Default, Clone, Serialize)]
pub struct MemoryAnnotations {
    names: BTreeMap<usize, String>,
    #[serde(skip)]
    owners: HashMap<String, usize>,
    comments: BTreeMap<usize, String>,
    types: BTreeMap<usize, DataType>,
    structs: BTreeMap<String, StructDef>,
}
impl MemoryAnnotations {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn names(&self) -> &BTreeMap<usize, String> {
        &self.names
    }
    pub fn comments(&self) -> &BTreeMap<usize, String> {
        &self.comments
    }
    pub fn types(&self) -> &BTreeMap<usize, DataType> {
        &self.types
    }
    pub fn structs(&self) -> &BTreeMap<String, StructDef> {
        &self.structs
    }
}
impl Annotator for MemoryAnnotations {
    fn annotate(&mut self, address: usize, annotation: Annotation) -> Result<(), AnnotationError> {
        match annotation {
            Annotation::Name(name) => {
                if let Some(&owner) = self.owners.get(&name) {
                    if owner != address {
                        return Err(AnnotationError::NameInUse { name, owner });
                    }
                    return Ok(());
                }
                if let Some(old) = self.names.insert(address, name.clone()) {
                    self.owners.remove(&old);
                }
                self.owners.insert(name, address);
            }
            Annotation::Comment(text) => {
                let existing = self.comments.get(&address).map(String::as_str);
                if let Some(merged) = merge_comment(existing, &text) {
                    self.comments.insert(address, merged);
                }
            }
            Annotation::Type(data_type) => {
                let end = address + data_type.size();
                let overlapping = self
                    .types
                    .range(..end)
                    .filter(|(&start, t)| start + t.size() > address)
                    .map(|(&start, _)| start)
                    .collect::<Vec<_>>();
                for start in overlapping {
                    self.types.remove(&start);
                }
                self.types.insert(address, data_type);
            }
        }
        Ok(())
    }
    fn name_exists(&self, name: &str) -> Result<bool, AnnotationError> {
        Ok(self.owners.contains_key(name))
    }
    fn name_of(&self, address: usize) -> Result<Option<String>, AnnotationError> {
        Ok(self.names.get(&address).cloned())
    }
    fn comment(&self, address: usize) -> Result<Option<String>, AnnotationError> {
        Ok(self.comments.get(&address).cloned())
    }
    fn struct_exists(&self, name: &str) -> Result<bool, AnnotationError> {
        Ok(self.structs.contains_key(name))
    }
    fn define_struct(&mut self, def: &StructDef) -> Result<(), AnnotationError> {
        self.structs.insert(def.name.clone(), def.clone());
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_names() {
        let mut db = MemoryAnnotations::new();
        db.annotate(0x10, Annotation::Name("a".into())).unwrap();
        assert_eq!(
            db.annotate(0x20, Annotation::Name("a".into())),
            Err(AnnotationError::NameInUse {
                name: "a".into(),
                owner: 0x10
            })
        );
        // renaming releases the old name
        db.annotate(0x10, Annotation::Name("b".into())).unwrap();
        assert!(!db.name_exists("a").unwrap());
        db.annotate(0x20, Annotation::Name("a".into())).unwrap();
        assert_eq!(db.name_of(0x20).unwrap().as_deref(), Some("a"));
        assert_eq!(db.name_of(0x10).unwrap().as_deref(), Some("b"));
    }

    #[test]
    fn test_unique_name() {
        let mut db = MemoryAnnotations::new();
        assert_eq!(
            apply_unique_name(&mut db, 0x10, "IID_IUnknown"),
            Ok(Some("IID_IUnknown".into()))
        );
        assert_eq!(
            apply_unique_name(&mut db, 0x20, "IID_IUnknown"),
            Ok(Some("IID_IUnknown_0".into()))
        );
        // same address keeps its name
        assert_eq!(
            apply_unique_name(&mut db, 0x20, "IID_IUnknown"),
            Ok(Some("IID_IUnknown_0".into()))
        );
        assert_eq!(
            apply_unique_name(&mut db, 0x30, "IID_IUnknown"),
            Ok(Some("IID_IUnknown_1".into()))
        );
    }

    #[test]
    fn test_unique_name_exhausted() {
        let mut db = MemoryAnnotations::new();
        db.annotate(0, Annotation::Name("x".into())).unwrap();
        for i in 0..NAME_SUFFIXES {
            db.annotate(i + 1, Annotation::Name(format!("x_{i}")))
                .unwrap();
        }
        assert_eq!(apply_unique_name(&mut db, 0x1000, "x"), Ok(None));
        assert_eq!(db.name_of(0x1000).unwrap(), None);
    }

    #[test]
    fn test_merge_comment() {
        assert_eq!(merge_comment(None, "FC: MD5").as_deref(), Some("FC: MD5"));
        assert_eq!(
            merge_comment(Some("init"), "FC: MD5").as_deref(),
            Some("init FC: MD5")
        );
        assert_eq!(merge_comment(Some("FC: MD5"), "FC: MD5"), None);
        assert_eq!(merge_comment(Some("init FC: MD5"), "FC: MD5"), None);
        assert_eq!(
            merge_comment(Some("FC: MD5_x"), "FC: MD5").as_deref(),
            Some("FC: MD5_x FC: MD5")
        );
    }

    #[test]
    fn test_types_replace_overlapping() {
        let mut db = MemoryAnnotations::new();
        let dwords = |count| DataType::Array {
            element: WordSize::Dword,
            count,
        };
        db.annotate(0x100, Annotation::Type(dwords(4))).unwrap();
        db.annotate(0x110, Annotation::Type(dwords(4))).unwrap();
        db.annotate(0x130, Annotation::Type(dwords(1))).unwrap();
        db.annotate(0x10c, Annotation::Type(StructDef::guid().data_type()))
            .unwrap();
        assert_eq!(
            db.types().keys().copied().collect::<Vec<_>>(),
            [0x10c, 0x130]
        );
        assert_eq!(db.types()[&0x10c].to_string(), "GUID");
    }

    #[test]
    fn test_guid_struct() {
        let def = StructDef::guid();
        assert_eq!(def.size(), 16);
        assert_eq!(
            def.fields.iter().map(|f| f.offset).collect::<Vec<_>>(),
            [0, 4, 6, 8]
        );
    }
}

use std::{borrow::Cow, path::Path};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, info_span};

use crate::{
    annotate::{apply_unique_name, Annotation, Annotator, StructDef},
    image::AddressSpace,
    map_items,
    scanner::{find_all, guid_signature, GUID_LEN},
    Config, MatchKind, MatchResult, MatchedEntry, Observer, Problem, Report,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GuidEntry {
    pub name: String,
    pub prefix: String,
    /// hyphenated text form
    pub guid: String,
}
impl GuidEntry {
    pub fn full_name(&self) -> String {
        format!("{}{}", self.prefix, self.name)
    }
    pub fn signature(&self) -> Result<[u8; GUID_LEN]> {
        guid_signature(&self.guid)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GuidList {
    pub kind: String,
    pub prefix: String,
    pub entries: Vec<GuidEntry>,
    /// lines that could not be parsed
    #[serde(skip)]
    pub malformed: Vec<Problem>,
}

const BUILTIN: &[(&str, &str, &str)] = &[
    ("Class ID", "CLSID_", include_str!("../data/guids/class.txt")),
    ("Interface ID", "IID_", include_str!("../data/guids/interface.txt")),
    ("Folder ID", "FOLDERID_", include_str!("../data/guids/folder.txt")),
    ("Media Type", "", include_str!("../data/guids/media.txt")),
];

impl GuidList {
    /// Parse `<guid> <name>` lines. Blank lines and lines starting with `#` are skipped.
    pub fn parse(kind: impl Into<String>, prefix: impl Into<String>, text: &str) -> Self {
        let kind = kind.into();
        let prefix = prefix.into();
        let mut entries = vec![];
        let mut malformed = vec![];

        for (i, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields = line.split_whitespace().collect::<Vec<_>>();
            match fields[..] {
                [guid, name] => entries.push(GuidEntry {
                    name: name.to_string(),
                    prefix: prefix.clone(),
                    guid: guid.to_string(),
                }),
                _ => malformed.push(Problem::MalformedSignatureInput {
                    entry: format!("{kind} line {}", i + 1),
                    reason: format!("expected \"<guid> <name>\", found {line:?}"),
                }),
            }
        }

        Self {
            kind,
            prefix,
            entries,
            malformed,
        }
    }

    pub fn load<P: AsRef<Path>>(
        kind: impl Into<String>,
        prefix: impl Into<String>,
        path: P,
    ) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read GUID list {}", path.display()))?;
        Ok(Self::parse(kind, prefix, &text))
    }

    pub fn builtin() -> Vec<Self> {
        BUILTIN
            .iter()
            .map(|(kind, prefix, text)| Self::parse(*kind, *prefix, text))
            .collect()
    }

    pub fn retain(&mut self, f: impl FnMut(&GuidEntry) -> bool) {
        self.entries.retain(f);
    }
}

/// Stretches of the address space with no gaps. Adjacent segments are joined into one run.
fn contiguous_runs(space: &dyn AddressSpace) -> Vec<(usize, Cow<'_, [u8]>)> {
    let mut segments = space.segments();
    segments.sort_by_key(|s| s.range.start);

    let mut runs: Vec<(usize, Cow<[u8]>)> = vec![];
    for segment in &segments {
        let Ok(data) = space.read_bytes(segment.range.start, segment.range.len()) else {
            continue;
        };
        let joins = runs
            .last()
            .is_some_and(|(start, run)| start + run.len() == segment.range.start);
        if !joins {
            runs.push((segment.range.start, Cow::Borrowed(data)));
        } else if let Some((_, run)) = runs.last_mut() {
            run.to_mut().extend_from_slice(data);
        }
    }
    runs
}

fn search_runs(runs: &[(usize, Cow<[u8]>)], signature: &[u8]) -> Vec<usize> {
    runs.iter()
        .flat_map(|(start, data)| find_all(signature, *start, data))
        .collect()
}

/// Every address holding the binary form of `signature`, overlapping occurrences and
/// occurrences straddling adjacent segments included.
pub fn locate(space: &dyn AddressSpace, signature: &[u8]) -> Vec<usize> {
    search_runs(&contiguous_runs(space), signature)
}

fn ensure_guid_struct(annotator: &mut dyn Annotator) -> Result<(), crate::AnnotationError> {
    if !annotator.struct_exists("GUID")? {
        info!("create GUID struct");
        annotator.define_struct(&StructDef::guid())?;
    }
    Ok(())
}

/// Find, classify and name every GUID of `lists` in `space`.
pub fn find_guids<'c>(
    lists: &'c [GuidList],
    space: &dyn AddressSpace,
    annotator: &mut dyn Annotator,
    config: &Config,
    observer: &dyn Observer,
) -> Report<'c> {
    let mut report = Report::default();
    let guid_type = StructDef::guid().data_type();
    let mut struct_ready = false;

    let runs = contiguous_runs(space);
    let total = lists.iter().map(|l| l.entries.len()).sum();
    observer.begin("guids", total);

    for list in lists {
        let _span = info_span!("guid list", kind = %list.kind).entered();
        info!("scanning {}", list.kind);
        for problem in &list.malformed {
            report.problem(problem.clone());
        }

        let found = map_items(&list.entries, config.parallel, |entry| {
            let found = entry.signature().map(|sig| search_runs(&runs, &sig));
            observer.advance(1);
            found
        });

        for (entry, found) in list.entries.iter().zip(found) {
            let addresses = match found {
                Ok(addresses) => addresses,
                Err(err) => {
                    report.problem(Problem::MalformedSignatureInput {
                        entry: entry.full_name(),
                        reason: format!("{err:#}"),
                    });
                    continue;
                }
            };

            for address in addresses {
                if !struct_ready {
                    struct_ready = true;
                    if let Err(err) = ensure_guid_struct(annotator) {
                        report.problem(Problem::Annotation {
                            address,
                            reason: err.to_string(),
                        });
                    }
                }
                if let Err(err) = annotator.annotate(address, Annotation::Type(guid_type.clone()))
                {
                    report.problem(Problem::Annotation {
                        address,
                        reason: err.to_string(),
                    });
                }

                let name = entry.full_name();
                let applied_name = match apply_unique_name(annotator, address, &name) {
                    Ok(Some(applied)) => {
                        info!("{address:#x}: {applied}");
                        Some(applied)
                    }
                    Ok(None) => {
                        report.problem(Problem::NameCollisionExhausted { address, name });
                        None
                    }
                    Err(err) => {
                        report.problem(Problem::Annotation {
                            address,
                            reason: err.to_string(),
                        });
                        None
                    }
                };
                report.matches.push(MatchResult {
                    address,
                    entry: MatchedEntry::Guid(entry),
                    kind: MatchKind::Guid,
                    applied_name,
                });
            }
        }
    }

    observer.finish();
    info!("finished");
    report
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{annotate::NAME_SUFFIXES, image::Image, DataType, MemoryAnnotations};

    const TASK_SCHEDULER: [u8; 16] = [
        0x9f, 0x36, 0x87, 0x0f, 0xe5, 0xa4, 0xfc, 0x4c, 0xbd, 0x3e, 0x73, 0xe6, 0x15, 0x45, 0x72,
        0xdd,
    ];

    fn list() -> Vec<GuidList> {
        vec![GuidList::parse(
            "Class ID",
            "CLSID_",
            "0F87369F-A4E5-4CFC-BD3E-73E6154572DD TaskScheduler\n",
        )]
    }

    fn image_with(placements: &[(usize, &[u8])]) -> Image<'static> {
        let mut data = vec![0u8; 0x100];
        for (offset, bytes) in placements {
            data[*offset..*offset + bytes.len()].copy_from_slice(bytes);
        }
        Image::builder()
            .segment(".rdata", 0x2000, false, data)
            .build_segments()
            .unwrap()
    }

    #[test]
    fn test_parse() {
        let list = GuidList::parse(
            "Interface ID",
            "IID_",
            "# comment\n\n00000000-0000-0000-C000-000000000046 IUnknown\nbroken line here\n",
        );
        assert_eq!(list.entries.len(), 1);
        assert_eq!(list.entries[0].full_name(), "IID_IUnknown");
        assert_eq!(
            list.malformed,
            [Problem::MalformedSignatureInput {
                entry: "Interface ID line 4".into(),
                reason: "expected \"<guid> <name>\", found \"broken line here\"".into(),
            }]
        );
    }

    #[test]
    fn test_builtin_lists() {
        let lists = GuidList::builtin();
        assert_eq!(
            lists.iter().map(|l| l.prefix.as_str()).collect::<Vec<_>>(),
            ["CLSID_", "IID_", "FOLDERID_", ""]
        );
        for list in &lists {
            assert!(list.malformed.is_empty(), "{:?}", list.malformed);
            assert!(!list.entries.is_empty());
            for entry in &list.entries {
                entry.signature().unwrap();
            }
        }
    }

    #[test]
    fn test_find_guids() {
        let image = image_with(&[(0x10, &TASK_SCHEDULER[..]), (0x80, &TASK_SCHEDULER[..])]);
        let lists = list();
        let mut db = MemoryAnnotations::new();
        let report = find_guids(&lists, &image, &mut db, &Config::default(), &());

        assert!(report.problems.is_empty());
        assert_eq!(
            report
                .matches
                .iter()
                .map(|m| (m.address, m.applied_name.as_deref()))
                .collect::<Vec<_>>(),
            [
                (0x2010, Some("CLSID_TaskScheduler")),
                (0x2080, Some("CLSID_TaskScheduler_0")),
            ]
        );
        assert!(db.structs().contains_key("GUID"));
        assert_eq!(
            db.types().get(&0x2010),
            Some(&DataType::Struct {
                name: "GUID".into(),
                size: 16
            })
        );
    }

    #[test]
    fn test_find_guids_rerun_is_stable() {
        let image = image_with(&[(0x10, &TASK_SCHEDULER[..]), (0x80, &TASK_SCHEDULER[..])]);
        let lists = list();
        let mut db = MemoryAnnotations::new();
        let first = find_guids(&lists, &image, &mut db, &Config::default(), &());
        let second = find_guids(&lists, &image, &mut db, &Config::default(), &());
        assert_eq!(first.matches, second.matches);
        assert_eq!(db.names().len(), 2);
    }

    #[test]
    fn test_overlapping_occurrences() {
        // 0xaa repeated, a GUID of all 0xaa occurs at every offset of the run
        let image = image_with(&[(0x20, &[0xaa; 18][..])]);
        let lists = vec![GuidList::parse(
            "Test",
            "",
            "AAAAAAAA-AAAA-AAAA-AAAA-AAAAAAAAAAAA run",
        )];
        let mut db = MemoryAnnotations::new();
        let report = find_guids(&lists, &image, &mut db, &Config::default(), &());
        assert_eq!(
            report.matches.iter().map(|m| m.address).collect::<Vec<_>>(),
            [0x2020, 0x2021, 0x2022]
        );
        // classifying each occurrence replaces the overlapping previous one
        assert_eq!(db.types().keys().copied().collect::<Vec<_>>(), [0x2022]);
    }

    #[test]
    fn test_guid_across_adjacent_segments() {
        let mut rdata = vec![0u8; 0x100];
        rdata[0xf8..].copy_from_slice(&TASK_SCHEDULER[..8]);
        let mut data = TASK_SCHEDULER[8..].to_vec();
        data.resize(0x100, 0);
        // same split, but a gap separates the halves
        let mut tail = vec![0u8; 0x100];
        tail[0xf8..].copy_from_slice(&TASK_SCHEDULER[..8]);
        let detached = TASK_SCHEDULER[8..].to_vec();

        let image = Image::builder()
            .segment(".rdata", 0x2000, false, rdata)
            .segment(".data", 0x2100, false, data)
            .segment(".tail", 0x3000, false, tail)
            .segment(".detached", 0x3200, false, detached)
            .build_segments()
            .unwrap();

        assert_eq!(locate(&image, &TASK_SCHEDULER), [0x20f8]);
        let mut db = MemoryAnnotations::new();
        let lists = list();
        let report = find_guids(&lists, &image, &mut db, &Config::default(), &());
        assert_eq!(
            report.matches.iter().map(|m| m.address).collect::<Vec<_>>(),
            [0x20f8]
        );
        assert_eq!(db.names()[&0x20f8], "CLSID_TaskScheduler");
    }

    #[test]
    fn test_collision_exhausted() {
        let image = image_with(&[(0x10, &TASK_SCHEDULER[..])]);
        let lists = list();
        let mut db = MemoryAnnotations::new();
        db.annotate(0x9000, Annotation::Name("CLSID_TaskScheduler".into()))
            .unwrap();
        for i in 0..NAME_SUFFIXES {
            db.annotate(0x9100 + i, Annotation::Name(format!("CLSID_TaskScheduler_{i}")))
                .unwrap();
        }

        let report = find_guids(&lists, &image, &mut db, &Config::default(), &());
        assert_eq!(report.matches.len(), 1);
        assert_eq!(report.matches[0].applied_name, None);
        assert_eq!(
            report.problems,
            [Problem::NameCollisionExhausted {
                address: 0x2010,
                name: "CLSID_TaskScheduler".into()
            }]
        );
        // the classification is kept
        assert!(db.types().contains_key(&0x2010));
    }

    #[test]
    fn test_malformed_guid_skipped() {
        let image = image_with(&[(0x10, &TASK_SCHEDULER[..])]);
        let lists = vec![GuidList::parse(
            "Class ID",
            "CLSID_",
            "0F87369F-A4E5-4CFC-BD3E Short\n0F87369F-A4E5-4CFC-BD3E-73E6154572DD TaskScheduler",
        )];
        let mut db = MemoryAnnotations::new();
        let report = find_guids(&lists, &image, &mut db, &Config::default(), &());
        assert_eq!(report.matches.len(), 1);
        assert!(matches!(
            &report.problems[..],
            [Problem::MalformedSignatureInput { entry, .. }] if entry == "CLSID_Short"
        ));
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let image = image_with(&[(0x10, &TASK_SCHEDULER[..]), (0x40, &TASK_SCHEDULER[..])]);
        let lists = GuidList::builtin()
            .into_iter()
            .chain(list())
            .collect::<Vec<_>>();

        let mut a = MemoryAnnotations::new();
        let sequential = find_guids(&lists, &image, &mut a, &Config::default(), &());
        let mut b = MemoryAnnotations::new();
        let config = Config {
            parallel: true,
            ..Default::default()
        };
        let parallel = find_guids(&lists, &image, &mut b, &config, &());
        assert_eq!(sequential.matches, parallel.matches);
        assert_eq!(a.names(), b.names());
    }
}

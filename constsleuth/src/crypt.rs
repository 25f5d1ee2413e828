use tracing::{debug, debug_span, info, warn};

use crate::{
    annotate::{apply_unique_name, Annotation, Annotator, DataType},
    catalog::{Catalog, ConstantEntry, ConstantKind},
    image::{AddressSpace, Function, SegmentInfo},
    map_items,
    scanner::{scan_sparse, scan_strided, Signature, SparseMatch, StridedScan},
    Config, MatchKind, MatchResult, MatchedEntry, Observer, Problem, Report,
};

/// Catalog entries turned into their search forms.
struct Prepared<'c> {
    arrays: Vec<(&'c ConstantEntry, Signature)>,
    sparse: Vec<(&'c ConstantEntry, Vec<u32>)>,
    operands: Vec<&'c ConstantEntry>,
}
impl<'c> Prepared<'c> {
    fn new(catalog: &'c Catalog, report: &mut Report<'c>) -> Self {
        let mut prepared = Self {
            arrays: vec![],
            sparse: vec![],
            operands: vec![],
        };
        for entry in &catalog.entries {
            let result = entry.validate().and_then(|()| {
                match entry.kind {
                    ConstantKind::NonSparse => prepared
                        .arrays
                        .extend(entry.signatures()?.into_iter().map(|sig| (entry, sig))),
                    ConstantKind::Sparse => prepared
                        .sparse
                        .push((entry, entry.values.iter().map(|&v| v as u32).collect())),
                    ConstantKind::Operand => prepared.operands.push(entry),
                }
                Ok(())
            });
            if let Err(err) = result {
                report.problem(Problem::MalformedSignatureInput {
                    entry: entry.name.clone(),
                    reason: format!("{err:#}"),
                });
            }
        }
        prepared
    }
}

#[derive(Default)]
struct SegmentHits {
    strided: StridedScan,
    sparse: Vec<SparseMatch>,
}

fn scan_segment(
    space: &dyn AddressSpace,
    segment: &SegmentInfo,
    prepared: &Prepared,
) -> SegmentHits {
    let _span = debug_span!("segment", name = %segment.name).entered();
    let Ok(data) = space.read_bytes(segment.range.start, segment.range.len()) else {
        return SegmentHits::default();
    };

    let signatures = prepared
        .arrays
        .iter()
        .map(|(_, sig)| sig.bytes.as_slice())
        .collect::<Vec<_>>();
    let strided = scan_strided(&signatures, segment.range.start, data);

    let sparse = if segment.code {
        let sequences = prepared
            .sparse
            .iter()
            .map(|(_, seq)| seq.as_slice())
            .collect::<Vec<_>>();
        scan_sparse(&sequences, space.endian(), segment.range.start, data)
    } else {
        vec![]
    };

    SegmentHits { strided, sparse }
}

#[derive(Default)]
struct FunctionHits {
    /// (instruction address, operand entry index, immediate)
    hits: Vec<(usize, usize, u64)>,
    problems: Vec<Problem>,
}

fn scan_function(
    space: &dyn AddressSpace,
    function: &Function,
    operands: &[&ConstantEntry],
) -> FunctionHits {
    let mut result = FunctionHits::default();
    let mut address = function.range.start;
    while address < function.range.end {
        let instruction = match space.decode_instruction(address) {
            Ok(instruction) => instruction,
            Err(err) => {
                result.problems.push(Problem::InstructionDecodeFailure {
                    address,
                    reason: err.to_string(),
                });
                address += 1;
                continue;
            }
        };
        let immediates = instruction.immediates().collect::<Vec<_>>();
        if !immediates.is_empty() {
            let hit = operands.iter().enumerate().find_map(|(i, entry)| {
                immediates
                    .iter()
                    .find(|&&imm| entry.matches_immediate(imm))
                    .map(|&imm| (address, i, imm))
            });
            result.hits.extend(hit);
        }
        address += instruction.length.max(1);
    }
    result
}

fn comment(
    annotator: &mut dyn Annotator,
    report: &mut Report,
    address: usize,
    text: String,
) -> Option<String> {
    match annotator.annotate(address, Annotation::Comment(text.clone())) {
        Ok(()) => Some(text),
        Err(err) => {
            report.problem(Problem::Annotation {
                address,
                reason: err.to_string(),
            });
            None
        }
    }
}

/// Search `space` for every constant of `catalog`, annotating matches.
///
/// Non-sparse arrays are searched in every segment, sparse sequences in code segments and
/// operand constants in the immediates of every function that is not library code or a thunk.
pub fn find_crypto<'c>(
    catalog: &'c Catalog,
    space: &dyn AddressSpace,
    annotator: &mut dyn Annotator,
    config: &Config,
    observer: &dyn Observer,
) -> Report<'c> {
    let mut report = Report::default();
    info!("loading crypto constants");
    let prepared = Prepared::new(catalog, &mut report);

    let segments = space.segments();
    observer.begin("segments", segments.len());
    let segment_hits = map_items(&segments, config.parallel, |segment| {
        let hits = scan_segment(space, segment, &prepared);
        observer.advance(1);
        hits
    });

    for (segment, hits) in segments.iter().zip(segment_hits) {
        info!("searching for crypto constants in {}", segment.name);

        for (i, address) in hits.strided.truncated {
            report.problem(Problem::OutOfRangeRead {
                address,
                entry: prepared.arrays[i].0.name.clone(),
            });
        }

        for (i, address) in hits.strided.matches {
            let (entry, signature) = &prepared.arrays[i];
            let entry = *entry;
            info!(
                "{address:#x}: found const array {} (used in {})",
                entry.name, entry.algorithm
            );
            let array = DataType::Array {
                element: entry.word_size,
                count: entry.values.len(),
            };
            if let Err(err) = annotator.annotate(address, Annotation::Type(array)) {
                report.problem(Problem::Annotation {
                    address,
                    reason: err.to_string(),
                });
            }
            let name = format!("{}{}", config.name_prefix, entry.name);
            let applied_name = match apply_unique_name(annotator, address, &name) {
                Ok(Some(applied)) => Some(applied),
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
                entry: MatchedEntry::Constant(entry),
                kind: MatchKind::NonSparse {
                    endian: signature.endian,
                },
                applied_name,
            });
        }

        for hit in hits.sparse {
            let entry = prepared.sparse[hit.index].0;
            info!(
                "{:#x}: found sparse constants for {}",
                hit.address, entry.algorithm
            );
            let at = space.previous_head(hit.address).unwrap_or(hit.address);
            let text = format!("{}{}", config.comment_prefix, entry.name);
            let applied_name = comment(annotator, &mut report, at, text);
            report.matches.push(MatchResult {
                address: hit.address,
                entry: MatchedEntry::Constant(entry),
                kind: MatchKind::Sparse { end: hit.end },
                applied_name,
            });
        }
    }

    if prepared.operands.is_empty() {
        debug!("no operand constants to search for");
    } else if !space.can_decode() {
        warn!("cannot decode instructions of this image, skipping immediate operands");
    } else {
        info!("searching for crypto constants in immediate operand");
        let functions = space
            .functions()
            .into_iter()
            .filter(|f| !f.library && !f.thunk)
            .collect::<Vec<_>>();
        observer.begin("functions", functions.len());
        let function_hits = map_items(&functions, config.parallel, |function| {
            let hits = scan_function(space, function, &prepared.operands);
            observer.advance(1);
            hits
        });

        for hits in function_hits {
            for problem in hits.problems {
                report.problem(problem);
            }
            for (address, i, value) in hits.hits {
                let entry = prepared.operands[i];
                info!(
                    "{address:#x}: found immediate operand constants for {}",
                    entry.algorithm
                );
                let text = format!("{}{}", config.comment_prefix, entry.name);
                let applied_name = comment(annotator, &mut report, address, text);
                report.matches.push(MatchResult {
                    address,
                    entry: MatchedEntry::Constant(entry),
                    kind: MatchKind::Operand { value },
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
    use crate::{
        catalog::tables,
        image::Image,
        scanner::{pack, Endian, WordSize},
        MemoryAnnotations,
    };

    fn entry(
        name: &str,
        kind: ConstantKind,
        word_size: WordSize,
        values: impl IntoIterator<Item = u64>,
    ) -> ConstantEntry {
        ConstantEntry::new(name, "test", kind, word_size, values)
    }

    fn run<'c>(catalog: &'c Catalog, image: &Image, db: &mut MemoryAnnotations) -> Report<'c> {
        find_crypto(catalog, image, db, &Config::default(), &())
    }

    #[test]
    fn test_non_sparse() {
        let sha256_k = pack(
            &tables::SHA256_K.map(|v| v as u64),
            WordSize::Dword,
            Endian::Big,
        )
        .unwrap();
        let mut data = vec![0u8; 0x400];
        data[0x40..0x40 + 256].copy_from_slice(&tables::AES_SBOX);
        data[0x180..0x180 + 256].copy_from_slice(&sha256_k);

        let image = Image::builder()
            .segment(".rdata", 0x4000, false, data)
            .build_segments()
            .unwrap();
        let catalog = Catalog::builtin();
        let mut db = MemoryAnnotations::new();
        let report = run(&catalog, &image, &mut db);

        assert!(report.problems.is_empty(), "{:?}", report.problems);
        assert_eq!(
            report
                .matches
                .iter()
                .map(|m| (m.address, m.name(), m.kind))
                .collect::<Vec<_>>(),
            [
                (
                    0x4040,
                    "AES_sbox",
                    MatchKind::NonSparse {
                        endian: Endian::Little
                    }
                ),
                (
                    0x4180,
                    "SHA256_K",
                    MatchKind::NonSparse {
                        endian: Endian::Big
                    }
                ),
            ]
        );
        assert_eq!(db.names()[&0x4040], "FC_AES_sbox");
        assert_eq!(
            db.types()[&0x4180],
            DataType::Array {
                element: WordSize::Dword,
                count: 64
            }
        );
    }

    #[test]
    fn test_first_candidate_wins() {
        let short = entry(
            "short",
            ConstantKind::NonSparse,
            WordSize::Dword,
            [0x11111111, 0x22222222],
        );
        let long = entry(
            "long",
            ConstantKind::NonSparse,
            WordSize::Dword,
            [0x11111111, 0x22222222, 0x33333333],
        );
        let bytes = pack(&long.values, WordSize::Dword, Endian::Little).unwrap();
        let mut data = vec![0u8; 0x40];
        data[0x10..0x10 + bytes.len()].copy_from_slice(&bytes);
        let image = Image::builder()
            .segment(".data", 0, false, data)
            .build_segments()
            .unwrap();

        let catalog = Catalog::new(vec![short.clone(), long.clone()]);
        let report = run(&catalog, &image, &mut MemoryAnnotations::new());
        assert_eq!(
            report.matches.iter().map(|m| m.name()).collect::<Vec<_>>(),
            ["short"]
        );

        let catalog = Catalog::new(vec![long, short]);
        let report = run(&catalog, &image, &mut MemoryAnnotations::new());
        assert_eq!(
            report.matches.iter().map(|m| m.name()).collect::<Vec<_>>(),
            ["long"]
        );
    }

    #[test]
    fn test_out_of_range_read() {
        let values = [0x11223344, 0x55667788, 0x99aabbcc];
        let bytes = pack(&values, WordSize::Dword, Endian::Little).unwrap();
        let mut data = vec![0u8; 0x18];
        data[0x10..].copy_from_slice(&bytes[..8]);
        let image = Image::builder()
            .segment(".data", 0x1000, false, data)
            .build_segments()
            .unwrap();
        let catalog = Catalog::new(vec![entry(
            "cut",
            ConstantKind::NonSparse,
            WordSize::Dword,
            values,
        )]);
        let report = run(&catalog, &image, &mut MemoryAnnotations::new());
        assert!(report.matches.is_empty());
        assert_eq!(
            report.problems,
            [Problem::OutOfRangeRead {
                address: 0x1010,
                entry: "cut".into()
            }]
        );
    }

    #[test]
    fn test_malformed_entries_skipped() {
        let catalog = Catalog::new(vec![
            entry("wide", ConstantKind::NonSparse, WordSize::Byte, [0x1ff, 0, 0, 0]),
            entry("ok", ConstantKind::NonSparse, WordSize::Byte, [1, 2, 3, 4]),
        ]);
        let image = Image::builder()
            .segment(".data", 0, false, vec![0, 0, 0, 0, 1, 2, 3, 4])
            .build_segments()
            .unwrap();
        let report = run(&catalog, &image, &mut MemoryAnnotations::new());
        assert_eq!(report.matches.len(), 1);
        assert_eq!(report.matches[0].address, 4);
        assert!(matches!(
            &report.problems[..],
            [Problem::MalformedSignatureInput { entry, .. }] if entry == "wide"
        ));
    }

    // mov dword ptr [rbp-0x20], imm32
    fn store(imm: u32) -> Vec<u8> {
        let mut code = vec![0xc7, 0x45, 0xe0];
        code.extend(imm.to_le_bytes());
        code
    }

    #[test]
    fn test_sparse() {
        // push rbp; mov rbp, rsp; then the SHA-256 initial state stored word by word
        let mut code = vec![0x55, 0x48, 0x89, 0xe5];
        for v in tables::SHA256_INIT {
            code.extend(store(v));
        }
        code.extend([0x5d, 0xc3]);
        let len = code.len();

        let image = Image::builder()
            .segment(".text", 0x1000, true, code.clone())
            .segment(".data", 0x2000, false, code)
            .build_segments()
            .unwrap();
        let catalog = Catalog::new(
            Catalog::builtin()
                .of_kind(ConstantKind::Sparse)
                .cloned()
                .collect(),
        );
        let mut db = MemoryAnnotations::new();
        let report = run(&catalog, &image, &mut db);

        // data segments are not searched for sparse constants
        assert_eq!(report.matches.len(), 1);
        let m = &report.matches[0];
        assert_eq!(m.name(), "SHA256_init");
        assert_eq!(m.address, 0x1007);
        assert_eq!(m.kind, MatchKind::Sparse { end: 0x1000 + len - 2 });
        // comment goes on the instruction holding the first value
        assert_eq!(db.comment(0x1004).unwrap().as_deref(), Some("FC: SHA256_init"));
        assert_eq!(m.applied_name.as_deref(), Some("FC: SHA256_init"));
    }

    #[test]
    fn test_operands() {
        let mut code = vec![0x55, 0x48, 0x89, 0xe5];
        // mov eax, ebx
        code.extend([0x89, 0xd8]);
        // mov eax, 0x9e3779b9
        code.extend([0xb8, 0xb9, 0x79, 0x37, 0x9e]);
        // mov rax, -0x61c88647 (sign extended TEA delta)
        code.extend([0x48, 0xc7, 0xc0, 0xb9, 0x79, 0x37, 0x9e]);
        code.extend([0x5d, 0xc3]);
        let len = code.len();

        let thunk_entry = vec![0xe9, 0x00, 0x00, 0x00, 0x00];
        let mut thunk = Function::new(0x2000..0x2005);
        thunk.thunk = true;

        let mut text = code;
        text.resize(0x1000, 0xcc);
        text.extend(thunk_entry);
        let image = Image::builder()
            .segment(".text", 0x1000, true, text)
            .function(Function::new(0x1000..0x1000 + len))
            .function(thunk)
            .build_segments()
            .unwrap();

        let catalog = Catalog::new(vec![entry(
            "TEA_delta",
            ConstantKind::Operand,
            WordSize::Dword,
            [0x9e3779b9],
        )]);
        let mut db = MemoryAnnotations::new();
        let report = run(&catalog, &image, &mut db);
        assert!(report.problems.is_empty(), "{:?}", report.problems);
        assert_eq!(
            report
                .matches
                .iter()
                .map(|m| (m.address, m.kind))
                .collect::<Vec<_>>(),
            [
                (0x1006, MatchKind::Operand { value: 0x9e3779b9 }),
                (
                    0x100b,
                    MatchKind::Operand {
                        value: 0xffffffff9e3779b9
                    }
                ),
            ]
        );
        assert_eq!(db.comment(0x1006).unwrap().as_deref(), Some("FC: TEA_delta"));
        assert_eq!(db.comment(0x1004).unwrap(), None);
    }

    #[test]
    fn test_operands_ignore_displacements_and_branches() {
        let code = [
            // mov eax, [0x9e3779b9]
            0x8b, 0x05, 0xb9, 0x79, 0x37, 0x9e,
            // jmp 0x9e3779b9
            0xe9, 0xae, 0x69, 0x37, 0x9e,
            0xc3,
        ];
        let image = Image::builder()
            .bitness(32)
            .segment(".text", 0x1000, true, code.to_vec())
            .function(Function::new(0x1000..0x1000 + code.len()))
            .build_segments()
            .unwrap();
        let catalog = Catalog::new(vec![entry(
            "TEA_delta",
            ConstantKind::Operand,
            WordSize::Dword,
            [0x9e3779b9],
        )]);
        let mut db = MemoryAnnotations::new();
        let report = run(&catalog, &image, &mut db);
        assert!(report.matches.is_empty(), "{:?}", report.matches);
        assert!(report.problems.is_empty(), "{:?}", report.problems);
        assert_eq!(db.comment(0x1000).unwrap(), None);
        assert_eq!(db.comment(0x1006).unwrap(), None);
    }

    #[test]
    fn test_operands_every_immediate_in_table_order() {
        let code = [
            // enter 0x1234, 0x56
            0xc8, 0x34, 0x12, 0x56,
            // enter 0x1234, 0
            0xc8, 0x34, 0x12, 0x00,
            0xc3,
        ];
        let image = Image::builder()
            .segment(".text", 0x1000, true, code.to_vec())
            .function(Function::new(0x1000..0x1000 + code.len()))
            .build_segments()
            .unwrap();
        let catalog = Catalog::new(vec![
            entry("level", ConstantKind::Operand, WordSize::Dword, [0x56]),
            entry("frame", ConstantKind::Operand, WordSize::Dword, [0x1234]),
        ]);
        let mut db = MemoryAnnotations::new();
        let report = run(&catalog, &image, &mut db);
        assert!(report.problems.is_empty(), "{:?}", report.problems);
        assert_eq!(
            report
                .matches
                .iter()
                .map(|m| (m.address, m.name(), m.kind))
                .collect::<Vec<_>>(),
            [
                (0x1000, "level", MatchKind::Operand { value: 0x56 }),
                (0x1004, "frame", MatchKind::Operand { value: 0x1234 }),
            ]
        );
        assert_eq!(db.comment(0x1000).unwrap().as_deref(), Some("FC: level"));
        assert_eq!(db.comment(0x1004).unwrap().as_deref(), Some("FC: frame"));
    }

    #[test]
    fn test_decode_failure() {
        // push es is invalid in 64-bit mode; nop follows
        let image = Image::builder()
            .segment(".text", 0x1000, true, vec![0x06, 0x90, 0xb8, 0xb9, 0x79, 0x37, 0x9e])
            .build_segments()
            .unwrap();
        let catalog = Catalog::new(vec![entry(
            "TEA_delta",
            ConstantKind::Operand,
            WordSize::Dword,
            [0x9e3779b9],
        )]);
        let report = run(&catalog, &image, &mut MemoryAnnotations::new());
        assert_eq!(report.matches.len(), 1);
        assert_eq!(report.matches[0].address, 0x1002);
        assert!(matches!(
            &report.problems[..],
            [Problem::InstructionDecodeFailure { address: 0x1000, .. }]
        ));
    }

    #[test]
    fn test_rerun_is_idempotent() {
        let mut code = vec![0x55, 0x48, 0x89, 0xe5];
        for v in tables::MD5_INIT {
            code.extend(store(v));
        }
        code.extend([0xb8, 0xb9, 0x79, 0x37, 0x9e, 0xc3]);
        let mut data = tables::AES_SBOX.to_vec();
        data.extend(tables::AES_SBOX);

        let image = Image::builder()
            .segment(".text", 0x1000, true, code)
            .segment(".rdata", 0x2000, false, data)
            .build_segments()
            .unwrap();
        let catalog = Catalog::builtin();
        let mut db = MemoryAnnotations::new();
        let first = run(&catalog, &image, &mut db);
        let snapshot = db.clone();
        let second = run(&catalog, &image, &mut db);

        assert_eq!(first.matches, second.matches);
        assert_eq!(db.names(), snapshot.names());
        assert_eq!(db.comments(), snapshot.comments());
        assert_eq!(db.names()[&0x2100], "FC_AES_sbox_0");
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let mut text = vec![0x55, 0x48, 0x89, 0xe5];
        for v in tables::SHA1_INIT {
            text.extend(store(v));
        }
        text.extend([0xc3]);
        let mut rdata = vec![0u8; 0x10];
        rdata.extend(tables::AES_INV_SBOX);
        rdata.extend(tables::BASE64_ALPHABET);

        let image = Image::builder()
            .segment(".text", 0x1000, true, text.clone())
            .segment(".text2", 0x3000, true, text)
            .segment(".rdata", 0x5000, false, rdata)
            .build_segments()
            .unwrap();
        let catalog = Catalog::builtin();

        let mut a = MemoryAnnotations::new();
        let sequential = find_crypto(&catalog, &image, &mut a, &Config::default(), &());
        let mut b = MemoryAnnotations::new();
        let config = Config {
            parallel: true,
            ..Default::default()
        };
        let parallel = find_crypto(&catalog, &image, &mut b, &config, &());

        assert_eq!(sequential.matches, parallel.matches);
        assert_eq!(sequential.problems, parallel.problems);
        assert_eq!(a.names(), b.names());
        assert_eq!(a.comments(), b.comments());
        assert_eq!(
            sequential
                .matches
                .iter()
                .map(|m| m.name())
                .collect::<Vec<_>>(),
            ["SHA1_init", "SHA1_init", "AES_inv_sbox", "Base64_alphabet"]
        );
    }
}

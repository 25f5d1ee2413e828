mod db;

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use clap::Parser;
use colored::Colorize;
use constsleuth::image::{AddressSpace, Image};
use constsleuth::{
    find_crypto, find_guids, Annotator, Catalog, Config, ConstantKind, GuidList, MatchKind,
    MemoryAnnotations, Observer, Report,
};
use indicatif::{ProgressBar, ProgressStyle};
use itertools::Itertools;
use prettytable::{row, Cell, Row, Table};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use db::SqliteAnnotations;

#[derive(Parser)]
#[command(version)]
enum Commands {
    /// Find and annotate cryptographic constants
    Crypt(CommandCrypt),
    /// Find and annotate well known GUIDs
    Guid(CommandGuid),
    /// Show the constant table and the signatures derived from it
    Catalog(CommandCatalog),
}

fn parse_maybe_hex(s: &str) -> Result<usize> {
    Ok(s.strip_prefix("0x")
        .map(|s| usize::from_str_radix(s, 16))
        .unwrap_or_else(|| s.parse())?)
}

#[derive(Parser)]
struct InputArgs {
    /// Binary to scan. PE, ELF and Mach-O images are parsed, anything else needs --base or --bits
    input: PathBuf,

    /// SQLite database to keep annotations in between runs (in memory if omitted)
    #[arg(long)]
    db: Option<PathBuf>,

    /// Load address of a raw binary
    #[arg(long, value_parser(|s: &str| parse_maybe_hex(s)))]
    base: Option<usize>,

    /// Bitness of a raw binary (16, 32 or 64)
    #[arg(long)]
    bits: Option<u32>,

    /// Search segments and functions on multiple threads
    #[arg(long)]
    parallel: bool,

    /// Show scan progress
    #[arg(long)]
    progress: bool,

    /// Print the report as JSON instead of a table
    #[arg(long)]
    json: bool,

    /// Write the report to reports/
    #[arg(long)]
    report: bool,
}

#[derive(Parser)]
struct CommandCrypt {
    #[command(flatten)]
    input: InputArgs,

    /// A JSON constant catalog appended to the built-in one (can be specified multiple times)
    #[arg(long)]
    catalog: Vec<PathBuf>,

    /// Do not search for the built-in constants
    #[arg(long)]
    no_builtin: bool,

    /// Only search for constants whose name matches
    #[arg(long)]
    filter: Option<regex::Regex>,

    /// Prefix of names given to constant arrays
    #[arg(long)]
    name_prefix: Option<String>,

    /// Prefix of comments left on instructions
    #[arg(long)]
    comment_prefix: Option<String>,
}

/// A GUID list file and the prefix given to names from it
#[derive(Debug, Clone)]
struct ListSpec {
    prefix: String,
    path: PathBuf,
}
impl FromStr for ListSpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        if let Some((prefix, path)) = s.split_once(':') {
            if !path.is_empty() {
                return Ok(ListSpec {
                    prefix: prefix.to_owned(),
                    path: path.into(),
                });
            }
        }
        bail!("failed to parse GUID list: expected format <prefix>:<path.txt>")
    }
}

#[derive(Parser)]
struct CommandGuid {
    #[command(flatten)]
    input: InputArgs,

    /// A GUID list as <prefix>:<path> (can be specified multiple times)
    #[arg(long)]
    list: Vec<ListSpec>,

    /// Do not search for the built-in GUIDs
    #[arg(long)]
    no_builtin: bool,

    /// Only search for GUIDs whose name matches
    #[arg(long)]
    filter: Option<regex::Regex>,
}

#[derive(Parser)]
struct CommandCatalog {
    /// A JSON constant catalog appended to the built-in one (can be specified multiple times)
    #[arg(long)]
    catalog: Vec<PathBuf>,

    /// Leave out the built-in constants
    #[arg(long)]
    no_builtin: bool,

    /// Print the catalog as JSON
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match Commands::parse() {
        Commands::Crypt(command) => crypt(command),
        Commands::Guid(command) => guid(command),
        Commands::Catalog(command) => catalog(command),
    }
}

fn load_catalog(no_builtin: bool, paths: &[PathBuf]) -> Result<Catalog> {
    let mut catalog = if no_builtin {
        Catalog::default()
    } else {
        Catalog::builtin()
    };
    for path in paths {
        catalog.extend(Catalog::load(path)?);
    }
    Ok(catalog)
}

fn crypt(command: CommandCrypt) -> Result<()> {
    let mut catalog = load_catalog(command.no_builtin, &command.catalog)?;
    if let Some(filter) = &command.filter {
        catalog.retain(|entry| filter.is_match(&entry.name));
    }
    if catalog.is_empty() {
        bail!("no constants to search for");
    }

    let defaults = Config::default();
    let config = Config {
        name_prefix: command.name_prefix.unwrap_or(defaults.name_prefix),
        comment_prefix: command.comment_prefix.unwrap_or(defaults.comment_prefix),
        parallel: command.input.parallel,
    };

    command
        .input
        .run("crypt", |space, annotator, observer| {
            find_crypto(&catalog, space, annotator, &config, observer)
        })
}

fn guid(command: CommandGuid) -> Result<()> {
    let mut lists = if command.no_builtin {
        vec![]
    } else {
        GuidList::builtin()
    };
    for spec in &command.list {
        let kind = spec
            .path
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_else(|| spec.path.display().to_string());
        lists.push(GuidList::load(kind, spec.prefix.as_str(), &spec.path)?);
    }
    if let Some(filter) = &command.filter {
        for list in &mut lists {
            list.retain(|entry| filter.is_match(&entry.name) || filter.is_match(&entry.full_name()));
        }
    }
    if lists.iter().all(|list| list.entries.is_empty()) {
        bail!("no GUIDs to search for");
    }

    let config = Config {
        parallel: command.input.parallel,
        ..Default::default()
    };

    command
        .input
        .run("guid", |space, annotator, observer| {
            find_guids(&lists, space, annotator, &config, observer)
        })
}

fn catalog(command: CommandCatalog) -> Result<()> {
    let catalog = load_catalog(command.no_builtin, &command.catalog)?;

    if command.json {
        println!("{}", serde_json::to_string_pretty(&catalog)?);
        return Ok(());
    }

    let mut table = Table::new();
    table.set_titles(row!["name", "algorithm", "kind", "size", "signature"]);
    for entry in &catalog.entries {
        let signature = match entry.kind {
            ConstantKind::NonSparse => match entry.signatures() {
                Ok(signatures) => signatures
                    .iter()
                    .map(|s| {
                        let head = s.bytes.iter().take(16).map(|b| format!("{b:02X}")).join(" ");
                        let more = if s.len() > 16 { " .." } else { "" };
                        format!("{}: {head}{more}", s.endian)
                    })
                    .join("\n"),
                Err(err) => err.to_string().red().to_string(),
            },
            ConstantKind::Sparse | ConstantKind::Operand => {
                entry.values.iter().map(|v| format!("{v:#x}")).join(" ")
            }
        };
        table.add_row(Row::new(vec![
            Cell::new(&entry.name),
            Cell::new(&entry.algorithm),
            Cell::new(&entry.kind.to_string()),
            Cell::new(&format!("{} x {}", entry.values.len(), entry.word_size)),
            Cell::new(&signature),
        ]));
    }
    table.printstd();
    Ok(())
}

/// Drives an indicatif bar from scan progress.
struct ProgressObserver(ProgressBar);
impl ProgressObserver {
    fn new() -> Result<Self> {
        let bar = ProgressBar::new(0);
        bar.set_style(ProgressStyle::with_template(
            "{msg:>10} [{elapsed_precise}] {wide_bar} {pos}/{len}",
        )?);
        Ok(Self(bar))
    }
}
impl Observer for ProgressObserver {
    fn begin(&self, stage: &str, total: usize) {
        self.0.reset();
        self.0.set_length(total as u64);
        self.0.set_message(stage.to_string());
    }
    fn advance(&self, n: usize) {
        self.0.inc(n as u64);
    }
    fn finish(&self) {
        self.0.finish_and_clear();
    }
}

impl InputArgs {
    fn run<'c, F>(&self, command: &str, scan: F) -> Result<()>
    where
        F: FnOnce(&dyn AddressSpace, &mut dyn Annotator, &dyn Observer) -> Report<'c>,
    {
        let data = fs::read(&self.input)
            .with_context(|| format!("failed to read {}", self.input.display()))?;

        let mut builder = Image::builder().raw(self.base.is_some() || self.bits.is_some());
        if let Some(base) = self.base {
            builder = builder.base_address(base);
        }
        if let Some(bits) = self.bits {
            builder = builder.bitness(bits);
        }
        let image = builder
            .build(&data)
            .with_context(|| format!("failed to load {}", self.input.display()))?;
        info!(
            "loaded {} ({}-bit, {} segments, {} functions)",
            self.input.display(),
            image.bitness(),
            image.segments().len(),
            image.functions().len()
        );

        let mut annotator: Box<dyn Annotator> = match &self.db {
            Some(path) => Box::new(SqliteAnnotations::open(path)?),
            None => Box::new(MemoryAnnotations::new()),
        };

        let progress = self.progress.then(ProgressObserver::new).transpose()?;
        let observer: &dyn Observer = match &progress {
            Some(progress) => progress,
            None => &(),
        };

        let report = scan(&image, annotator.as_mut(), observer);

        if self.json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            print_report(&report);
        }

        if self.report {
            let path = write_report(command, &self.input, &report)?;
            info!("wrote {}", path.display());
        }

        Ok(())
    }
}

fn format_kind(kind: &MatchKind) -> String {
    match kind {
        MatchKind::NonSparse { endian } => format!("array ({endian})"),
        MatchKind::Sparse { end } => format!("sparse (to {end:#x})"),
        MatchKind::Operand { value } => format!("operand {value:#x}"),
        MatchKind::Guid => "guid".to_string(),
    }
}

fn print_report(report: &Report) {
    let mut table = Table::new();
    table.set_titles(row!["address", "entry", "kind", "detail", "annotation"]);
    for m in &report.matches {
        let applied = match &m.applied_name {
            Some(name) => name.normal().to_string(),
            None => "not applied".red().to_string(),
        };
        table.add_row(Row::new(vec![
            Cell::new(&format!("{:016x}", m.address)),
            Cell::new(m.name()),
            Cell::new(&format_kind(&m.kind)),
            Cell::new(m.detail()),
            Cell::new(&applied),
        ]));
    }
    if !report.matches.is_empty() {
        table.printstd();
    }

    for problem in &report.problems {
        println!("{}", problem.to_string().yellow());
    }

    let summary = format!(
        "{} matches, {} problems",
        report.matches.len(),
        report.problems.len()
    );
    if report.problems.is_empty() {
        println!("{}", summary.green());
    } else {
        println!("{}", summary.yellow());
    }
}

#[derive(Serialize)]
struct ReportFile<'a, 'c> {
    command: &'a str,
    input: String,
    version: &'a str,
    #[serde(flatten)]
    report: &'a Report<'c>,
}

fn report_file_name(time: &str, git_hash: Option<&str>, dirty: bool) -> String {
    // the dirty flag is only meaningful next to a commit hash
    let version = git_hash
        .map(|hash| {
            let hash = hash.get(..10).unwrap_or(hash);
            if dirty {
                format!("-{hash}-dirty")
            } else {
                format!("-{hash}")
            }
        })
        .unwrap_or_default();
    format!("{time}{version}.json")
}

fn write_report(command: &str, input: &Path, report: &Report) -> Result<PathBuf> {
    let time = time::OffsetDateTime::now_local()?.format(time::macros::format_description!(
        "[year]-[month]-[day]_[hour]-[minute]-[second]"
    ))?;

    let dir = PathBuf::from("reports");
    fs::create_dir_all(&dir)?;
    let path = dir.join(report_file_name(
        &time,
        option_env!("GIT_HASH"),
        option_env!("GIT_DIRTY").is_some(),
    ));
    let file = ReportFile {
        command,
        input: input.display().to_string(),
        version: env!("CARGO_PKG_VERSION"),
        report,
    };
    fs::write(&path, serde_json::to_vec_pretty(&file)?)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}

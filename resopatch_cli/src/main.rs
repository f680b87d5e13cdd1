mod disassemble;
mod logging;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::ProgressBar;
use itertools::Itertools;
use rayon::prelude::*;
use resopatch::{
    image::{pe, ExeImage, MemoryTrait},
    inject::{va, SlotKind},
    layout::{compute, LayoutValue},
    scanner::{Pattern, Xref},
    variants::identify,
    FixKind, Game, PatchOptions, PatchReport, PatchSession, Resolution, VariantProfile,
};
use strum::IntoEnumIterator;

const DEFAULT_IMAGE_BASE: usize = 0x400000;

#[derive(Parser)]
#[command(name = "resopatch", about = "Widescreen resolution patcher for Zeus and Emperor")]
struct Cli {
    /// Log every field and slot written
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Identify(CommandIdentify),
    Layout(CommandLayout),
    Patch(CommandPatch),
    Batch(CommandBatch),
    Disasm(CommandDisasm),
    Scan(CommandScan),
    Caves(CommandCaves),
}

fn parse_maybe_hex(s: &str) -> Result<usize> {
    Pattern::parse_maybe_hex(s)
}

/// Print the checksum and recognised variant of an executable
#[derive(Parser)]
struct CommandIdentify {
    exe: PathBuf,
}

/// Print the layout computed for a resolution
#[derive(Parser)]
struct CommandLayout {
    #[arg(short, long)]
    game: Game,

    #[arg(short, long)]
    resolution: Resolution,

    /// Print as JSON
    #[arg(long)]
    json: bool,
}

/// Patch one executable
#[derive(Parser)]
struct CommandPatch {
    input: PathBuf,

    /// Where to write the patched executable
    #[arg(short, long)]
    output: Option<PathBuf>,

    #[arg(short, long)]
    resolution: Option<Resolution>,

    /// A fix to apply (can be specified multiple times)
    #[arg(short, long)]
    fix: Vec<FixKind>,

    /// Only patch fields, leaving the renderer code untouched
    #[arg(long)]
    no_caves: bool,

    /// Directory holding the game's string table
    #[arg(long)]
    text_dir: Option<PathBuf>,

    /// A path to a JSON options file. Flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Patch in memory and print the report without writing anything
    #[arg(long)]
    dry_run: bool,
}

/// Patch one executable for several resolutions in parallel
#[derive(Parser)]
struct CommandBatch {
    input: PathBuf,

    #[arg(long)]
    out_dir: PathBuf,

    /// A resolution to build (can be specified multiple times)
    #[arg(short, long, required = true)]
    resolution: Vec<Resolution>,

    /// A fix to apply to every output (can be specified multiple times)
    #[arg(short, long)]
    fix: Vec<FixKind>,
}

/// Show the code injected for each cave
#[derive(Parser)]
struct CommandDisasm {
    exe: PathBuf,

    /// Only show the named cave
    #[arg(long)]
    cave: Option<String>,

    /// Resolution to assemble the caves for
    #[arg(short, long, default_value = "1920x1080")]
    resolution: Resolution,
}

/// Search an executable for byte patterns and rel32 references
#[derive(Parser)]
struct CommandScan {
    exe: PathBuf,

    /// A pattern to scan for (can be specified multiple times)
    #[arg(short, long, value_parser(|s: &_| Pattern::new(s)))]
    patterns: Vec<Pattern>,

    /// An xref to scan for (can be specified multiple times)
    #[arg(short, long, value_parser(|s: &str| parse_maybe_hex(s).map(Xref)))]
    xref: Vec<Xref>,
}

/// List zero-filled regions large enough to hold a code cave
#[derive(Parser)]
struct CommandCaves {
    exe: PathBuf,

    #[arg(long, default_value_t = 64)]
    min_len: usize,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::setup_logging(cli.verbose);

    match cli.command {
        Commands::Identify(command) => identify_exe(command),
        Commands::Layout(command) => layout(command),
        Commands::Patch(command) => patch(command),
        Commands::Batch(command) => batch(command),
        Commands::Disasm(command) => disasm(command),
        Commands::Scan(command) => scan(command),
        Commands::Caves(command) => caves(command),
    }
}

fn read_image(path: &Path) -> Result<ExeImage> {
    ExeImage::read(path).with_context(|| format!("reading {}", path.display()))
}

fn recognise(image: &ExeImage) -> Result<&'static VariantProfile> {
    match identify(resopatch::variants::VARIANTS, image) {
        Some(profile) => Ok(profile),
        None => bail!(
            "unrecognized executable (checksum {:#010x})",
            image.checksum()
        ),
    }
}

/// Base address used to label file offsets: the PE header's if it parses
fn image_base(image: &ExeImage) -> usize {
    pe::PeInfo::parse(image.as_bytes())
        .map(|info| info.image_base)
        .unwrap_or(DEFAULT_IMAGE_BASE)
}

fn section_name(sections: &[pe::SectionInfo], offset: usize) -> String {
    sections
        .iter()
        .find(|s| s.file_range.contains(&offset))
        .map(|s| s.name.clone())
        .unwrap_or_else(|| "-".to_string())
}

fn identify_exe(command: CommandIdentify) -> Result<()> {
    use prettytable::{row, Table};

    let image = read_image(&command.exe)?;
    let checksum = image.checksum();
    let Some(profile) = identify(resopatch::variants::VARIANTS, &image) else {
        println!(
            "{} {}",
            format!("{checksum:#010x}").bright_red(),
            "unrecognized".red()
        );
        return Ok(());
    };

    println!(
        "{} {} ({})",
        format!("{checksum:#010x}").bright_green(),
        profile.variant.to_string().bold(),
        profile.name
    );

    let mut table = Table::new();
    table.set_titles(row!["feature", "available"]);
    table.add_row(row!["fields", profile.fields.len()]);
    table.add_row(row![
        "caves",
        if profile.caves.is_empty() {
            "-".to_string()
        } else {
            profile.caves.iter().map(|c| c.name).join(", ")
        }
    ]);
    for kind in FixKind::iter() {
        let available = profile.fix(kind).is_some();
        table.add_row(row![
            kind,
            if available { "yes".green() } else { "no".red() }
        ]);
    }
    table.add_row(row![
        "text",
        profile
            .text
            .map(|t| format!("{} [{}:{}]", t.file_name, t.group, t.index))
            .unwrap_or_else(|| "-".to_string())
    ]);
    table.printstd();
    Ok(())
}

fn layout(command: CommandLayout) -> Result<()> {
    use prettytable::{row, Table};

    let resolution = command
        .resolution
        .validate()
        .map_err(|violation| anyhow::anyhow!("{} rejected: {violation}", command.resolution))?;
    let layout = compute(resolution, command.game.metrics());

    if command.json {
        println!("{}", serde_json::to_string_pretty(&layout)?);
        return Ok(());
    }

    let mut table = Table::new();
    table.set_titles(row![format!("{} {}", command.game, resolution), "value"]);
    for value in LayoutValue::iter() {
        table.add_row(row![value, layout.value(value)]);
    }
    table.printstd();
    Ok(())
}

fn load_options(command: &CommandPatch) -> Result<PatchOptions> {
    let mut options = match &command.config {
        Some(path) => {
            let file =
                fs::read(path).with_context(|| format!("reading {}", path.display()))?;
            let options = serde_json::from_slice::<PatchOptions>(&file)
                .with_context(|| format!("parsing {}", path.display()))?;
            tracing::debug!(config = %path.display(), ?options, "loaded patch options");
            options
        }
        None => PatchOptions::default(),
    };
    if command.resolution.is_some() {
        options.resolution = command.resolution;
    }
    options.fixes.extend(command.fix.iter().copied());
    if command.no_caves {
        options.inject_caves = false;
    }
    if command.text_dir.is_some() {
        options.text_dir = command.text_dir.clone();
    }
    Ok(options)
}

fn print_report(report: &PatchReport) {
    use prettytable::{row, Table};

    println!(
        "{} {:#010x}",
        report.variant.to_string().bold(),
        report.checksum
    );
    if let Some(layout) = &report.layout {
        println!(
            "{}x{}: {} x {} tiles, viewport {}x{}",
            layout.screen_width,
            layout.screen_height,
            layout.width_multiplier,
            layout.height_multiplier,
            layout.viewport_width,
            layout.viewport_height
        );
    }

    if !report.fields.is_empty() {
        let mut table = Table::new();
        table.set_titles(row!["field", "offset", "value"]);
        for field in &report.fields {
            table.add_row(row![
                field.name,
                format!("{:#x}", field.offset),
                field.value
            ]);
        }
        table.printstd();
    }

    for cave in &report.caves {
        println!(
            "{} {}: {:#010x} -> {:#010x} ({} bytes) -> {:#010x}",
            "cave".green(),
            cave.name,
            cave.entry_va,
            cave.cave_va,
            cave.len,
            cave.continue_va
        );
    }
    for fix in &report.fixes {
        println!("{} {fix}", "fix".green());
    }
    for skipped in &report.skipped {
        println!(
            "{} {}: {}",
            "skipped".yellow(),
            skipped.feature,
            skipped.reason
        );
    }
    if let Some(text) = &report.text {
        println!("{} {}", "text".green(), text.display());
    }
}

fn patch(command: CommandPatch) -> Result<()> {
    let options = load_options(&command)?;
    let session = PatchSession::default();

    let report = if command.dry_run {
        let mut image = read_image(&command.input)?;
        session.patch_image(&mut image, &options)?
    } else {
        let Some(output) = &command.output else {
            bail!("--output is required unless --dry-run is given");
        };
        session.patch_file(&command.input, output, &options)?
    };

    print_report(&report);
    Ok(())
}

fn batch_output(input: &Path, out_dir: &Path, resolution: Resolution) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "patched".to_string());
    let ext = input
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    out_dir.join(format!("{stem}_{resolution}{ext}"))
}

fn batch(command: CommandBatch) -> Result<()> {
    use prettytable::{row, Table};

    fs::create_dir_all(&command.out_dir)
        .with_context(|| format!("creating {}", command.out_dir.display()))?;

    let resolutions = command.resolution.iter().copied().unique().collect_vec();
    tracing::info!(
        input = %command.input.display(),
        builds = resolutions.len(),
        "starting batch"
    );
    let progress = ProgressBar::new(resolutions.len() as u64);

    let results = resolutions
        .par_iter()
        .map(|&resolution| {
            let output = batch_output(&command.input, &command.out_dir, resolution);
            let options = PatchOptions {
                fixes: command.fix.clone(),
                ..PatchOptions::resolution(resolution)
            };
            let result = resopatch::patch_file(&command.input, &output, &options);
            if let Err(err) = &result {
                progress.println(format!("{resolution}: {err}"));
            }
            progress.inc(1);
            (resolution, output, result)
        })
        .collect::<Vec<_>>();
    progress.finish_and_clear();

    let mut table = Table::new();
    table.set_titles(row!["resolution", "output", "result"]);
    let mut failed = 0;
    for (resolution, output, result) in &results {
        let status = match result {
            Ok(_) => "ok".green(),
            Err(err) => {
                failed += 1;
                err.reason().to_string().red()
            }
        };
        table.add_row(row![resolution, output.display(), status]);
    }
    table.printstd();

    if failed > 0 {
        bail!("{failed} of {} builds failed", results.len());
    }
    Ok(())
}

fn disasm(command: CommandDisasm) -> Result<()> {
    let resolution = command
        .resolution
        .validate()
        .map_err(|violation| anyhow::anyhow!("{} rejected: {violation}", command.resolution))?;

    let mut image = read_image(&command.exe)?;
    let profile = recognise(&image)?;
    let layout = compute(resolution, profile.metrics);

    let caves = profile
        .caves
        .iter()
        .filter(|c| command.cave.as_deref().map(|n| n == c.name).unwrap_or(true))
        .collect_vec();
    if caves.is_empty() {
        match &command.cave {
            Some(name) => bail!("{} has no cave named {name}", profile.variant),
            None => bail!("{} has no code caves", profile.variant),
        }
    }

    for cave in caves {
        let original_entry = image.range(cave.entry_range())?.to_vec();
        resopatch::inject::inject(&mut image, cave, profile.image_base, &layout)?;

        let base = profile.image_base;
        let continue_va = cave.continue_va(base);
        let cave_va = cave.cave_va(base);
        let calls = cave
            .fragment
            .slots
            .iter()
            .filter_map(|slot| match slot.kind {
                SlotKind::Call { target } => Some(target),
                _ => None,
            })
            .collect_vec();
        let label = |target: u32| {
            if target == continue_va {
                Some("continue".to_string())
            } else if target == cave_va {
                Some(cave.name.to_string())
            } else if calls.contains(&target) {
                Some(format!("sub_{target:08x}"))
            } else {
                None
            }
        };

        println!(
            "{}",
            disassemble::disassemble_bytes(
                &format!("{} entry (was {:02x})", cave.name, original_entry.iter().format(" ")),
                cave.entry_va(base),
                image.range(cave.entry_range())?,
                &[],
                &label,
            )
        );
        let slots = cave.fragment.slots.iter().map(|s| s.range()).collect_vec();
        println!(
            "{}",
            disassemble::disassemble_bytes(
                &format!("{} cave", cave.name),
                cave_va,
                image.range(cave.cave_range())?,
                &slots,
                &label,
            )
        );
    }
    Ok(())
}

fn scan(command: CommandScan) -> Result<()> {
    use prettytable::{row, Table};

    if command.patterns.is_empty() && command.xref.is_empty() {
        bail!("nothing to scan for: pass at least one --patterns or --xref");
    }

    let image = read_image(&command.exe)?;
    let base = image_base(&image);
    let sections = pe::sections(image.as_bytes()).unwrap_or_default();

    let patterns = command.patterns.iter().collect_vec();
    let xrefs = command.xref.iter().collect_vec();
    let pattern_results = image.scan(&patterns, base);
    let xref_results = image.scan_xref(&xrefs, base);

    let mut table = Table::new();
    table.set_titles(row!["query", "address", "offset", "section"]);
    let queries = patterns
        .iter()
        .map(|p| p.to_string())
        .chain(xrefs.iter().map(|x| format!("xref {:#x}", x.0)));
    let results = pattern_results.iter().chain(xref_results.iter());
    for (query, addresses) in queries.zip(results) {
        if addresses.is_empty() {
            table.add_row(row![query, "not found".red(), "", ""]);
        }
        for address in addresses {
            let offset = address.wrapping_sub(base);
            table.add_row(row![
                query,
                format!("{address:#010x}"),
                format!("{offset:#x}"),
                section_name(&sections, offset)
            ]);
        }
    }
    table.printstd();
    Ok(())
}

fn caves(command: CommandCaves) -> Result<()> {
    use prettytable::{row, Table};

    let image = read_image(&command.exe)?;
    let base = image_base(&image);
    let sections = pe::sections(image.as_bytes()).unwrap_or_default();

    let mut table = Table::new();
    table.set_titles(row!["offset", "address", "length", "section"]);
    for run in image.zero_runs(command.min_len) {
        let section = section_name(&sections, run.start);
        let is_code = sections
            .iter()
            .any(|s| s.is_code() && s.file_range.contains(&run.start));
        table.add_row(row![
            format!("{:#x}", run.start),
            format!("{:#010x}", va(base, run.start)),
            run.len(),
            if is_code { section.green() } else { section.normal() }
        ]);
    }
    table.printstd();
    Ok(())
}

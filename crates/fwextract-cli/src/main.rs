//! fwextract - Extract Kingst logic analyzer firmware for sigrok
//!
//! This tool reads the resource archive compiled into the KingstVIS
//! application, decodes the MCU firmware and FPGA bitstreams it carries,
//! and writes them under the file names the sigrok driver loads.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use fwextract_core::{
    extract, open_bundles, EntryOutcome, ExtractOptions, ExtractionReport, LocatorConfig,
    MappingTable, NamingScheme,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{debug, info, trace, Level};
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

/// Executable name inside an install directory or app bundle
const EXECUTABLE_NAME: &str = "KingstVIS";

const DOWNLOAD_HELP: &str = "\
KingstVIS is required to extract the firmware. It is a free download:

  1. Go to https://www.qdkingst.com/en/vis
  2. Download KingstVIS for your platform
  3. Install it (on macOS, drag KingstVIS.app to /Applications)
  4. Run fwextract again, or pass the path to the KingstVIS executable

KingstVIS does not need to be launched or registered, only installed.";

/// Extract Kingst logic analyzer firmware from the KingstVIS application
#[derive(Parser, Debug)]
#[command(name = "fwextract")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Extract the firmware files into a directory
    Extract(ExtractArgs),
    /// List every file in the embedded resource tree
    List(ListArgs),
}

#[derive(Args, Debug)]
struct ExtractArgs {
    /// KingstVIS executable or a directory containing it [default: probe install locations]
    binary: Option<PathBuf>,

    /// Output directory [default: ~/.local/share/sigrok-firmware, with a kingst/ subdirectory for the legacy scheme]
    output: Option<PathBuf>,

    /// Output file naming scheme
    #[arg(long, value_enum, default_value = "sigrok")]
    scheme: Scheme,

    /// Dry run - decode everything but don't write files
    #[arg(long)]
    dry_run: bool,
}

#[derive(Args, Debug)]
struct ListArgs {
    /// KingstVIS executable or a directory containing it [default: probe install locations]
    binary: Option<PathBuf>,
}

/// Output naming scheme
#[derive(Debug, Clone, Copy, ValueEnum)]
enum Scheme {
    /// Names expected by the sigrok kingst-la2016 driver
    Sigrok,
    /// MCU images only, kept as the stored fw01AN.hex text
    Legacy,
}

impl From<Scheme> for NamingScheme {
    fn from(scheme: Scheme) -> Self {
        match scheme {
            Scheme::Sigrok => NamingScheme::Sigrok,
            Scheme::Legacy => NamingScheme::Legacy,
        }
    }
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Initialize tracing
    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Extract(args) => run_extract(&args),
        Command::List(args) => run_list(&args),
    }
}

/// Extract every mapped firmware file
fn run_extract(args: &ExtractArgs) -> Result<ExitCode> {
    let binary = resolve_binary(args.binary.as_deref())?;
    let output = match &args.output {
        Some(output) => output.clone(),
        None => default_output_dir(args.scheme.into())?,
    };

    let table = MappingTable::for_scheme(args.scheme.into());
    let options = ExtractOptions::new().dry_run(args.dry_run);
    info!(
        "Extracting {} entries ({} scheme) from {}",
        table.len(),
        NamingScheme::from(args.scheme),
        binary.display()
    );

    let report = extract(&binary, &output, &table, &options)
        .with_context(|| format!("Failed to extract firmware from {}", binary.display()))?;

    print_report(&report, &output, args.dry_run);

    if report.all_failed() {
        eprintln!("No firmware could be extracted from {}", binary.display());
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

/// List the files of every resource bundle
fn run_list(args: &ListArgs) -> Result<ExitCode> {
    let binary = resolve_binary(args.binary.as_deref())?;
    let bundles = open_bundles(&binary, &LocatorConfig::default())
        .with_context(|| format!("Failed to read resources of {}", binary.display()))?;

    for (index, bundle) in bundles.iter().enumerate() {
        if bundles.len() > 1 {
            println!("# bundle {} (tree at {:#x})", index, bundle.origin.tree);
        }
        for (path, file) in bundle.tree.files() {
            let size = file.declared_size.unwrap_or(file.data_size);
            println!("{:<40} {:>10}  {}", path, size, file.compression.as_str());
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn print_report(report: &ExtractionReport, output: &Path, dry_run: bool) {
    for result in &report.results {
        let name = &result.mapping.output_filename;
        match &result.outcome {
            EntryOutcome::Written {
                size, kind, digest, ..
            } => {
                println!(
                    "  wrote    {name:<34} {size:>9} bytes  {kind:<9}  blake3:{}",
                    short_digest(digest)
                );
            }
            EntryOutcome::DryRun { size, kind } => {
                println!("  decoded  {name:<34} {size:>9} bytes  {kind}");
            }
            EntryOutcome::NotFoundInTree => {
                println!("  missing  {name:<34} ({} not in resource tree)", result.mapping.tree_path);
            }
            EntryOutcome::DecodeError(e) | EntryOutcome::WriteError(e) => {
                println!("  failed   {name:<34} ({e})");
            }
        }
    }

    let total = report.results.len();
    let succeeded = report.success_count();
    if dry_run {
        println!("\n{succeeded} of {total} firmware file(s) decoded (dry run, nothing written)");
    } else {
        println!(
            "\n{succeeded} of {total} firmware file(s) extracted to {}",
            output.display()
        );
    }
}

/// First 8 hex digits of a content digest
fn short_digest(digest: &str) -> &str {
    digest.get(..8).unwrap_or(digest)
}

/// Well-known KingstVIS install locations, in probe order
fn default_binary_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from(
        "/Applications/KingstVIS.app/Contents/MacOS/KingstVIS",
    )];
    let home = dirs::home_dir();
    if let Some(home) = &home {
        paths.push(home.join("Downloads/KingstVIS.app/Contents/MacOS/KingstVIS"));
    }
    paths.push(PathBuf::from("/opt/KingstVIS/KingstVIS"));
    if let Some(home) = &home {
        paths.push(home.join("KingstVIS/KingstVIS"));
    }
    paths
}

fn default_output_dir(scheme: NamingScheme) -> Result<PathBuf> {
    let base = dirs::home_dir()
        .map(|home| home.join(".local/share/sigrok-firmware"))
        .context("Cannot determine the home directory; pass OUTPUT_DIR explicitly")?;
    Ok(match scheme {
        NamingScheme::Sigrok => base,
        NamingScheme::Legacy => base.join("kingst"),
    })
}

/// Resolve the binary argument, probing install locations when absent
fn resolve_binary(arg: Option<&Path>) -> Result<PathBuf> {
    let Some(path) = arg else {
        for candidate in default_binary_paths() {
            trace!("Probing {}", candidate.display());
            if candidate.is_file() {
                info!("Auto-detected KingstVIS at {}", candidate.display());
                return Ok(candidate);
            }
        }
        bail!("KingstVIS not found in the default locations.\n\n{DOWNLOAD_HELP}");
    };

    if !path.exists() {
        bail!("Input file does not exist: {}\n\n{DOWNLOAD_HELP}", path.display());
    }
    if path.is_dir() {
        return find_in_directory(path);
    }
    Ok(path.to_path_buf())
}

/// Walk an install directory or app bundle for the KingstVIS executable
fn find_in_directory(directory: &Path) -> Result<PathBuf> {
    debug!("Searching {} for {}", directory.display(), EXECUTABLE_NAME);

    WalkDir::new(directory)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .find(|entry| entry.file_type().is_file() && entry.file_name() == EXECUTABLE_NAME)
        .map(|entry| entry.into_path())
        .with_context(|| {
            format!(
                "No {} executable found under {}",
                EXECUTABLE_NAME,
                directory.display()
            )
        })
}

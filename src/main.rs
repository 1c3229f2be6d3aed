use anyhow::{anyhow, Context, Result};
use clap::Parser;
use colored::Colorize;
use env_logger::Builder;
use log::{info, warn, Level, LevelFilter};
use srpatch::{EditSession, SearchOptions};
use std::fs;
use std::io::Write;
use std::path::PathBuf;

const DEFAULT_FUZZY_THRESHOLD: f64 = 0.8;

// --- Main Application Entry Point ---

fn main() {
    // 1. Parse command-line arguments using `clap`.
    let args = Args::parse();

    setup_logging(&args);

    // 2. Call the main logic function.
    //    All complex logic and error handling is inside `run`.
    if let Err(e) = run(args) {
        // 3. Print a user-facing message and set the exit code.
        //    Using {:?} ensures the full error chain from `anyhow` is printed.
        eprintln!("{} {:?}", "error:".red().bold(), e);
        std::process::exit(1);
    }
}

/// Contains the primary logic of the application.
fn run(args: Args) -> Result<()> {
    // --- Argument Validation ---
    if !(0.0..=1.0).contains(&args.fuzzy_threshold) {
        return Err(anyhow!("Fuzzy threshold must be between 0.0 and 1.0."));
    }

    // --- Input Reading ---
    let diff_text = fs::read_to_string(&args.diff_file)
        .with_context(|| format!("Failed to read diff file '{}'", args.diff_file.display()))?;
    let original_content = fs::read_to_string(&args.target_file).with_context(|| {
        format!("Failed to read target file '{}'", args.target_file.display())
    })?;

    let options = SearchOptions::builder()
        .fuzzy_threshold(args.fuzzy_threshold)
        .enable_fuzzy_matching(!args.no_fuzzy)
        .build();

    if options.enable_fuzzy_matching {
        info!(
            "Fuzzy matching enabled with threshold: {:.2}",
            options.fuzzy_threshold
        );
    } else {
        info!("Fuzzy matching disabled; only exact and whitespace matches will apply.");
    }

    // --- Core Edit Logic ---
    let session = EditSession::new(options);
    let outcome = session.apply_diff(&diff_text, &original_content);

    if let Some(diff) = &outcome.diff {
        println!(
            "----- Proposed Changes for {} -----",
            args.target_file.display()
        );
        print!("{}", diff);
        println!("------------------------------------");
    }

    if !outcome.applied {
        if let Some(feedback) = &outcome.feedback {
            eprintln!("{}", feedback);
        }
        return Err(anyhow!(
            "No changes were applied to '{}'.",
            args.target_file.display()
        ));
    }

    if let Some(feedback) = &outcome.feedback {
        // Applied, but some blocks matched fuzzily. Worth surfacing.
        warn!("Some blocks matched with differences:\n{}", feedback);
    }

    if args.dry_run {
        info!("DRY RUN completed. No files were modified.");
        return Ok(());
    }

    fs::write(&args.target_file, &outcome.new_content).with_context(|| {
        format!("Failed to write target file '{}'", args.target_file.display())
    })?;
    info!(
        "Applied {} block(s) to '{}'.",
        outcome.blocks.len(),
        args.target_file.display()
    );

    Ok(())
}

// --- Helper Structs and Functions ---

/// Defines the command-line arguments for the application.
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Apply SEARCH/REPLACE edit blocks to a file, locating the content by similarity rather than line numbers.",
    long_about = "Tolerates the malformed block syntax language models emit (missing markers, markdown fences, inline marker content) and falls back to fuzzy matching when the SEARCH content does not match the file exactly. Either every block applies or none do."
)]
struct Args {
    /// Path to the file containing SEARCH/REPLACE blocks.
    diff_file: PathBuf,
    /// Path to the file to edit.
    target_file: PathBuf,
    /// If set, show what would be done, but don't modify any files.
    #[arg(
        short = 'n',
        long,
        help = "Show what would be done, but don't modify files."
    )]
    dry_run: bool,
    /// The minimum similarity for a fuzzy match to be accepted (0.0 to 1.0).
    /// Higher is stricter. Exact matches always apply.
    #[arg(short = 't', long, default_value_t = DEFAULT_FUZZY_THRESHOLD, help = "Minimum similarity for a fuzzy match to be accepted (0.0 to 1.0). Higher is stricter.")]
    fuzzy_threshold: f64,
    /// Accept only exact and whitespace-insensitive matches.
    #[arg(long, help = "Disable fuzzy matching entirely.")]
    no_fuzzy: bool,
    /// Increase logging verbosity. Can be used multiple times.
    /// -v for info, -vv for debug, -vvv for trace.
    #[arg(
        short,
        long,
        action = clap::ArgAction::Count,
        long_help = "Increase logging verbosity.\n-v for info, -vv for debug, -vvv for trace."
    )]
    verbose: u8,
}

/// Sets up the global logger with a colored, prefix-per-level format.
fn setup_logging(args: &Args) {
    let log_level = match args.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace, // -vvv and higher
    };

    Builder::new()
        .filter_level(log_level)
        .format(|buf, record| match record.level() {
            Level::Error => writeln!(buf, "{} {}", "error:".red().bold(), record.args()),
            Level::Warn => writeln!(buf, "{} {}", "warning:".yellow().bold(), record.args()),
            Level::Info => writeln!(buf, "{}", record.args()),
            Level::Debug => writeln!(buf, "{} {}", "debug:".blue().bold(), record.args()),
            Level::Trace => writeln!(buf, "{} {}", "trace:".cyan().bold(), record.args()),
        })
        .init();
}

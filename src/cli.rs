use clap::Parser;
use std::path::PathBuf;

use crate::error::PipelineError;

// Optional backends (compile-time)
#[cfg(feature = "openexr")]
const EXR_BACKEND: &str = "openexr-rs 0.11 (C++, DWAA/DWAB)";
#[cfg(not(feature = "openexr"))]
const EXR_BACKEND: &str = "exrs (pure Rust)";
#[cfg(feature = "raw")]
const RAW_BACKEND: &str = "rawloader";
#[cfg(not(feature = "raw"))]
const RAW_BACKEND: &str = "disabled";

const VERSION_INFO: &str = const_format::concatcp!(
    env!("CARGO_PKG_VERSION"), "\n",
    "EXR:    ", EXR_BACKEND, "\n",
    "Raw:    ", RAW_BACKEND, "\n",
    "Target: ", std::env::consts::ARCH, "-", std::env::consts::OS
);

/// Decode image sequences in the background and report each frame
#[derive(Parser, Debug)]
#[command(author, version = VERSION_INFO, about, long_about = None)]
pub struct Args {
    /// Files or glob patterns of the sequence ("-" reads standard input)
    #[arg(value_name = "FILES", required = true)]
    pub files: Vec<String>,

    /// Combine the sequence with --with sequences (RPN, e.g. "x y -")
    #[arg(short = 'e', long = "edit", value_name = "EXPR")]
    pub edit: Option<String>,

    /// Additional input sequence for --edit (file or glob pattern, repeatable)
    #[arg(short = 'w', long = "with", value_name = "PATTERN", requires = "edit")]
    pub with: Vec<String>,

    /// Only request this frame (0-based)
    #[arg(long = "frame", value_name = "N")]
    pub frame: Option<usize>,

    /// Hide this frame of the sequence before reading
    #[arg(long = "remove", value_name = "N")]
    pub remove: Option<usize>,

    /// Block the worker while idle instead of polling
    #[arg(long = "wait")]
    pub wait: bool,

    /// Skip format sniffing, use the generic decoder for stills
    #[arg(long = "force-generic")]
    pub force_generic: bool,

    /// Do not watch source files for changes
    #[arg(long = "no-watch")]
    pub no_watch: bool,

    /// Configuration file (JSON)
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable debug logging to file (default: seqload.log)
    #[arg(short = 'l', long = "log", value_name = "LOG_FILE")]
    pub log_file: Option<Option<PathBuf>>,

    /// Increase logging verbosity (default: warn, -v: info, -vv: debug, -vvv+: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbosity: u8,
}

/// Expand glob patterns into a file list in natural order ("f_9" before "f_10").
///
/// Arguments without glob metacharacters (and "-") are taken literally,
/// in their given order.
pub fn expand_patterns(patterns: &[String]) -> Result<Vec<PathBuf>, PipelineError> {
    let mut out = Vec::new();
    for pattern in patterns {
        if !pattern.contains(['*', '?', '[']) {
            out.push(PathBuf::from(pattern));
            continue;
        }
        let paths = glob::glob(pattern)
            .map_err(|e| PipelineError::Config(format!("bad pattern '{}': {}", pattern, e)))?;
        let mut matched: Vec<PathBuf> = paths.filter_map(Result::ok).collect();
        if matched.is_empty() {
            return Err(PipelineError::Config(format!("no file matches '{}'", pattern)));
        }
        matched.sort_by(|a, b| natord::compare(&a.to_string_lossy(), &b.to_string_lossy()));
        out.extend(matched);
    }
    Ok(out)
}

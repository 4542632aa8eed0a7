use clap::{Parser, Subcommand, ValueEnum};
use simplelog::LevelFilter;
use std::path::PathBuf;

/// Default index file name, created in the working directory unless
/// `--index` points elsewhere.
pub const DEFAULT_INDEX_FILE: &str = "mediadedup.db";

#[derive(Parser, Debug)]
#[command(author, version, about = "Finds duplicate photos and videos and safely consolidates them")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Write a log file at this path
    #[arg(long, global = true)]
    pub log: Option<PathBuf>,

    /// Log level for file logging (debug, info, warn, error)
    #[arg(long, default_value_t = LevelFilter::Debug, global = true)]
    pub log_level: LevelFilter,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Scan directory trees and build duplicate groups.
    ///
    /// Walks every given root, extracts metadata, computes perceptual
    /// signatures, and records duplicate groups in the index. Nothing is
    /// merged or deleted by this command.
    Scan {
        /// Authorized root directories to scan
        #[arg(required = true)]
        roots: Vec<PathBuf>,

        /// Index database file
        #[arg(long, default_value = DEFAULT_INDEX_FILE)]
        index: PathBuf,

        /// JSON options file (thresholds, limits, policies, weights)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Skip files whose size and mtime are unchanged since a prior scan
        #[arg(long)]
        incremental: bool,

        /// Follow symbolic links while walking
        #[arg(long)]
        follow_symlinks: bool,

        /// Also compute pHash signatures (dHash is always computed)
        #[arg(long)]
        phash: bool,

        /// Exclude paths matching this glob (repeatable)
        #[arg(long)]
        exclude: Vec<String>,

        /// Exclude paths containing this substring (repeatable)
        #[arg(long)]
        exclude_contains: Vec<String>,
    },

    /// List duplicate groups found by the last scan
    Groups {
        /// Index database file
        #[arg(long, default_value = DEFAULT_INDEX_FILE)]
        index: PathBuf,

        /// Output format
        #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
        output: OutputFormat,
    },

    /// Merge duplicate groups: keep the best copy, fill its metadata from
    /// the losers, and move the losers to trash staging.
    Merge {
        /// Index database file
        #[arg(long, default_value = DEFAULT_INDEX_FILE)]
        index: PathBuf,

        /// JSON options file (thresholds, limits, policies, weights)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Merge only this group id
        #[arg(long)]
        group: Option<i64>,

        /// Merge every complete group
        #[arg(long)]
        all: bool,

        /// Show what each merge would do without touching anything
        #[arg(long)]
        dry_run: bool,

        /// Merge without interactive confirmation
        #[arg(long)]
        yes: bool,
    },

    /// Undo the most recent committed merge
    Undo {
        /// Index database file
        #[arg(long, default_value = DEFAULT_INDEX_FILE)]
        index: PathBuf,
    },

    /// Show index statistics
    Stats {
        /// Index database file
        #[arg(long, default_value = DEFAULT_INDEX_FILE)]
        index: PathBuf,
    },

    /// Drop expired merge transactions and empty their trash staging
    Cleanup {
        /// Index database file
        #[arg(long, default_value = DEFAULT_INDEX_FILE)]
        index: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table
    Table,
    /// JSON output
    Json,
}

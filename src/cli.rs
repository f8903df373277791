use clap::{Args, Parser, Subcommand};
use pics_common::{Preset, ResizeCondition, SaveMode};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "pics")]
#[command(author, version, about = "Batch image compression that never loses or grows a file")]
pub struct Cli {
    /// Path to engine config file (JSON)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Compress image files and directories
    Compress(CompressArgs),

    /// Check which external encoders are available
    CheckTools,

    /// Validate configuration file
    Validate {
        /// Config file to validate (uses default if not specified)
        config: Option<PathBuf>,
    },

    /// Display version information
    Version,
}

#[derive(Args, Debug, Clone)]
pub struct CompressArgs {
    /// Files or directories to compress; directories are walked recursively
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,

    /// Quality preset: quality, balanced, saving or custom
    #[arg(long)]
    pub preset: Option<Preset>,

    /// Where to write output: suffix, separate-folder or overwrite
    #[arg(long)]
    pub save_mode: Option<SaveMode>,

    /// Number of files processed in parallel
    #[arg(short, long)]
    pub jobs: Option<usize>,

    /// Settings file (JSON, camelCase keys) used as the base for flags
    #[arg(long)]
    pub settings: Option<PathBuf>,

    /// Append per-file outcomes to this CSV log
    #[arg(long)]
    pub log: Option<PathBuf>,

    /// Persist lifetime statistics to this JSON file
    #[arg(long)]
    pub stats: Option<PathBuf>,

    /// Skip GIF files instead of running gifsicle
    #[arg(long)]
    pub no_gifsicle: bool,

    /// Allow lossy GIF optimisation
    #[arg(long)]
    pub gif_lossy: bool,

    /// Downscale so the constrained side is at most this many pixels
    #[arg(long)]
    pub resize: Option<u32>,

    /// Which side --resize constrains: fit, width or height
    #[arg(long, default_value = "fit")]
    pub resize_condition: ResizeCondition,

    /// Normalise pixels to 8-bit sRGB before encoding
    #[arg(long)]
    pub srgb: bool,

    /// Drop metadata where the encoder supports it
    #[arg(long)]
    pub strip_metadata: bool,

    /// Print the batch report as JSON
    #[arg(long)]
    pub json: bool,
}

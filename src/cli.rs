use clap::Parser;
use std::path::PathBuf;

/// Frame-loading scheduler demo: runs a synthetic viewer session
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Number of stacks (viewports) to attach
    #[arg(short = 's', long = "stacks", value_name = "N", default_value_t = 3)]
    pub stacks: usize,

    /// Frames per stack
    #[arg(short = 'n', long = "frames", value_name = "N", default_value_t = 120)]
    pub frames: usize,

    /// Clip playback rate for the first stack (negative plays in reverse)
    #[arg(long = "fps", value_name = "FPS", allow_hyphen_values = true)]
    pub fps: Option<f64>,

    /// Stop playback at the end of the stack instead of wrapping
    #[arg(long = "no-loop")]
    pub no_loop: bool,

    /// Prefetch window per side (default: unbounded)
    #[arg(long = "max-prefetch", value_name = "N")]
    pub max_prefetch: Option<usize>,

    /// Concurrency hint (max simultaneous transfers)
    #[arg(long = "concurrency", value_name = "N")]
    pub concurrency: Option<usize>,

    /// Synthetic load latency per frame
    #[arg(long = "latency-ms", value_name = "MS", default_value_t = 15)]
    pub latency_ms: u64,

    /// Fail every N-th synthetic load
    #[arg(long = "fail-every", value_name = "N")]
    pub fail_every: Option<u64>,

    /// Session length
    #[arg(short = 'd', long = "duration-ms", value_name = "MS", default_value_t = 3000)]
    pub duration_ms: u64,

    /// Configuration file (default: stackfetch.json in the config directory)
    #[arg(long = "config", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Custom configuration directory (overrides default platform paths)
    #[arg(short = 'c', long = "config-dir", value_name = "DIR")]
    pub config_dir: Option<PathBuf>,

    /// Enable debug logging to file (default: stackfetch.log)
    #[arg(short = 'l', long = "log", value_name = "LOG_FILE")]
    pub log_file: Option<Option<PathBuf>>,

    /// Increase logging verbosity (default: warn, -v: info, -vv: debug, -vvv+: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbosity: u8,
}

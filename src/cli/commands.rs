//! CLI command definitions

use clap::{Args, ValueEnum};

/// Compile a pipeline spec into a manifest
#[derive(Debug, Args, Clone)]
pub struct CompileCommand {
    /// Path to the pipeline spec YAML
    pub spec: String,

    /// Output directory for the manifest
    #[arg(short, long)]
    pub out: String,

    /// Registry document merged over the built-in components
    #[arg(long)]
    pub registry: Option<String>,

    /// Profile to activate
    #[arg(long)]
    pub profile: Option<String>,

    /// Parameter overrides (name=value), highest precedence
    #[arg(long = "param", value_parser = parse_key_value)]
    pub params: Vec<(String, String)>,

    /// Manifest cache behavior
    #[arg(long, value_enum, default_value_t = CacheMode::Auto)]
    pub cache: CacheMode,

    /// Stamp the generation timestamp into manifest meta
    #[arg(long)]
    pub stamp: bool,
}

/// Run a compiled manifest
#[derive(Debug, Args, Clone)]
pub struct RunCommand {
    /// Path to the compiled manifest
    pub manifest: String,

    /// Execution backend
    #[arg(long, value_enum, default_value_t = BackendArg::Local)]
    pub backend: BackendArg,

    /// Output directory for run artifacts
    #[arg(short, long)]
    pub out: String,

    /// Whole-run timeout in seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Sandbox heartbeat cadence in milliseconds
    #[arg(long, default_value_t = 500)]
    pub heartbeat_interval_ms: u64,

    /// Host stall tolerance on the control channel in milliseconds
    #[arg(long, default_value_t = 10_000)]
    pub stall_window_ms: u64,
}

/// Manifest cache modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CacheMode {
    /// Reuse an existing manifest when its input fingerprints match
    Auto,
    /// Recompile and overwrite unconditionally
    Force,
    /// Recompile without consulting any existing manifest
    Never,
}

/// Execution backend argument
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendArg {
    Local,
    Remote,
}

/// Parse key=value pairs
pub fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("invalid key=value pair: {}", s))?;
    if key.is_empty() {
        return Err(format!("empty key in pair: {}", s));
    }
    Ok((key.to_string(), value.to_string()))
}

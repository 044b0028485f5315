use anyhow::{Context, Result};
use omlrun::cli::commands::{BackendArg, CacheMode, CompileCommand, RunCommand};
use omlrun::cli::{Cli, Command};
use omlrun::compiler::fingerprint::{digest, digest_str};
use omlrun::compiler::params::{parse_scalar, ENV_PARAM_PREFIX};
use omlrun::compiler::{compile, CompileOptions, ResolvedParams, TimestampPolicy, COMPILER_VERSION};
use omlrun::core::{Manifest, PipelineSpec, RegistryView};
use omlrun::execution::{orchestrate, LocalAdapter, RunConfig, RunOutcome};
use omlrun::sandbox::{run_sandbox_side, RemoteSandboxAdapter};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = Cli::from_args();

    // stdout is the control channel in the sandbox entry; all logging goes
    // to stderr on every path
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if cli.verbose { "debug" } else { "info" }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let code = match &cli.command {
        Command::Compile(cmd) => compile_pipeline(cmd),
        Command::Run(cmd) => run_manifest(cmd).await,
        Command::Sandbox => match run_sandbox_side().await {
            Ok(()) => 0,
            Err(e) => {
                error!("sandbox runner failed: {:#}", e);
                1
            }
        },
    };
    std::process::exit(code);
}

/// Exit status: 0 success, 2 validation/secret/param/cycle error, 1 internal
fn compile_pipeline(cmd: &CompileCommand) -> i32 {
    let spec = match PipelineSpec::from_file(&cmd.spec) {
        Ok(spec) => spec,
        Err(e) => {
            error!("invalid pipeline spec: {:#}", e);
            return 2;
        }
    };

    let registry = match &cmd.registry {
        Some(path) => match RegistryView::from_file(path) {
            Ok(r) => r,
            Err(e) => {
                error!("invalid registry: {:#}", e);
                return 2;
            }
        },
        None => RegistryView::builtin(),
    };

    let profile_overrides = match &cmd.profile {
        Some(name) => match spec.profiles.get(name) {
            Some(overrides) => Some(overrides.clone()),
            None => {
                error!("unknown profile '{}'", name);
                return 2;
            }
        },
        None => None,
    };

    let env_vars: BTreeMap<String, String> = std::env::vars()
        .filter(|(k, _)| k.starts_with(ENV_PARAM_PREFIX))
        .collect();
    let cli_params: BTreeMap<String, serde_json::Value> = cmd
        .params
        .iter()
        .map(|(k, v)| (k.clone(), parse_scalar(v)))
        .collect();
    let params = ResolvedParams::resolve(
        &spec.declared_defaults(),
        profile_overrides.as_ref(),
        &env_vars,
        &cli_params,
    );

    let manifest_path = Path::new(&cmd.out).join("manifest");
    if cmd.cache == CacheMode::Auto {
        if let Ok(existing) = Manifest::load(&manifest_path) {
            let cached = &existing.fingerprints;
            if cached.oml_fp == digest(&spec.as_value())
                && cached.registry_fp == digest(&registry.as_value())
                && cached.params_fp == digest(&params.as_value())
                && cached.compiler_fp == digest_str(COMPILER_VERSION)
            {
                info!(manifest = %manifest_path.display(), "manifest up to date (cache hit)");
                return 0;
            }
        }
    }

    let options = CompileOptions {
        profile: cmd.profile.clone(),
        timestamp: if cmd.stamp {
            TimestampPolicy::Stamp
        } else {
            TimestampPolicy::Omit
        },
    };
    match compile(&spec, &registry, &params, &options, COMPILER_VERSION) {
        Ok(manifest) => {
            if let Err(e) = manifest.save(&manifest_path) {
                error!("write manifest: {:#}", e);
                return 1;
            }
            info!(
                manifest = %manifest_path.display(),
                steps = manifest.steps.len(),
                fp = %manifest.fingerprints.manifest_fp,
                "compiled"
            );
            0
        }
        Err(e) => {
            error!("compile failed ({}): {}", e.category(), e);
            e.exit_code()
        }
    }
}

async fn run_manifest(cmd: &RunCommand) -> i32 {
    match try_run(cmd).await {
        Ok(RunOutcome::Completed) => 0,
        Ok(RunOutcome::Failed) | Ok(RunOutcome::TimedOut) => 1,
        Err(e) => {
            error!("run failed: {:#}", e);
            1
        }
    }
}

async fn try_run(cmd: &RunCommand) -> Result<RunOutcome> {
    let manifest = Manifest::load(&cmd.manifest).context("load manifest")?;
    let cfg = RunConfig {
        out_dir: cmd.out.clone().into(),
        run_timeout: cmd.timeout.map(Duration::from_secs),
        heartbeat_interval: Duration::from_millis(cmd.heartbeat_interval_ms),
        stall_window: Duration::from_millis(cmd.stall_window_ms),
        env: std::env::vars().collect(),
    };

    let summary = match cmd.backend {
        BackendArg::Local => orchestrate(&LocalAdapter::default(), &manifest, &cfg).await?,
        BackendArg::Remote => {
            let adapter =
                RemoteSandboxAdapter::current_exe().map_err(|e| anyhow::anyhow!(e.to_string()))?;
            orchestrate(&adapter, &manifest, &cfg).await?
        }
    };

    for (step_id, status) in &summary.statuses {
        info!(step = %step_id, status = ?status, "step result");
    }
    info!(outcome = ?summary.outcome, out = %summary.out_dir.display(), "run complete");
    Ok(summary.outcome)
}

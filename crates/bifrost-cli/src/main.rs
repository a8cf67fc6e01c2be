use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Parser;
use tokio::signal;

use bifrost::sync::ENV_SYNC_ROOT;
use bifrost::{
    Bridge, BridgeConfig, CancellationToken, CompanionConfig, JsonFileSync, RunError, RunOutcome,
    Variable, VariableSet,
};

#[derive(Parser)]
#[command(name = "bifrost")]
#[command(about = "Run scripts in a long-lived companion runtime")]
#[command(version)]
struct Cli {
    /// Script files, run in order in the same companion
    #[arg(required = true)]
    scripts: Vec<PathBuf>,

    /// Companion executable
    #[arg(long, env = "BIFROST_COMPANION")]
    companion: Option<PathBuf>,

    /// Argument passed to the companion before the bridge arguments (repeatable)
    #[arg(long = "runtime-arg", value_name = "ARG", allow_hyphen_values = true)]
    runtime_args: Vec<String>,

    /// Dependency directory added to the companion's module search path
    #[arg(long, value_name = "DIR")]
    dependency_dir: Option<PathBuf>,

    /// Working directory for the companion
    #[arg(long, value_name = "DIR")]
    cwd: Option<PathBuf>,

    /// Shared segment name (random by default)
    #[arg(long)]
    segment: Option<String>,

    /// Tell the companion it runs inside a notebook
    #[arg(long)]
    notebook: bool,

    /// Per-script timeout in seconds
    #[arg(long, value_name = "SECS")]
    timeout: Option<f64>,

    /// Variable pushed before the first script (repeatable)
    #[arg(long = "var", value_name = "NAME=JSON", value_parser = parse_var)]
    vars: Vec<(String, Variable)>,

    /// Directory holding variable segments
    #[arg(long, env = ENV_SYNC_ROOT, value_name = "DIR")]
    sync_root: Option<PathBuf>,

    /// Skip variables that fail to sync instead of failing the run
    #[arg(long)]
    warn: bool,
}

fn parse_var(raw: &str) -> Result<(String, Variable), String> {
    let (name, json) = raw
        .split_once('=')
        .filter(|(name, _)| !name.trim().is_empty())
        .ok_or_else(|| "variables must be in NAME=JSON form".to_string())?;
    let value: serde_json::Value =
        serde_json::from_str(json).map_err(|e| format!("invalid JSON for {name}: {e}"))?;
    Ok((name.trim().to_string(), Variable::new(value)))
}

fn parse_timeout(secs: Option<f64>) -> anyhow::Result<Option<Duration>> {
    secs.map(|s| Duration::try_from_secs_f64(s).with_context(|| format!("invalid timeout {s}")))
        .transpose()
}

fn companion_config(cli: &Cli, sync_root: &std::path::Path) -> CompanionConfig {
    let mut config = CompanionConfig::from_env();
    if let Some(program) = &cli.companion {
        config.program = program.clone();
    }
    if !cli.runtime_args.is_empty() {
        config = config.with_runtime_args(cli.runtime_args.iter().cloned());
    }
    if let Some(dir) = &cli.dependency_dir {
        config = config.with_dependency_dir(dir);
    }
    if let Some(cwd) = &cli.cwd {
        config = config.with_cwd(cwd);
    }
    if let Some(segment) = &cli.segment {
        config = config.with_segment_name(segment);
    }
    if cli.notebook {
        config = config.with_notebook(true);
    }
    config.with_env(ENV_SYNC_ROOT, sync_root.display().to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    bifrost::logging::init_tracing();
    let cli = Cli::parse();

    let timeout = parse_timeout(cli.timeout)?;
    let sync_root = cli.sync_root.clone().unwrap_or_else(std::env::temp_dir);
    let companion = companion_config(&cli, &sync_root);
    let sync = JsonFileSync::new(&sync_root, &companion.segment_name);

    let bridge_config = BridgeConfig::new()
        .with_default_timeout(timeout)
        .with_warn_on_sync_failure(cli.warn);
    let mut bridge = Bridge::start(companion, Arc::new(sync.clone()))
        .context("failed to start companion")?
        .with_config(bridge_config);

    let interrupt = CancellationToken::new();
    let trigger = interrupt.clone();
    tokio::spawn(async move {
        let _ = signal::ctrl_c().await;
        trigger.cancel();
    });

    let mut variables: VariableSet = cli.vars.into_iter().collect();
    let result = run_scripts(
        &mut bridge,
        &cli.scripts,
        &mut variables,
        timeout,
        &interrupt,
    )
    .await;

    bridge.shutdown().await;
    if let Err(e) = sync.cleanup() {
        tracing::warn!(
            dir = %sync.dir().display(),
            error = %e,
            "Failed to remove variable segment"
        );
    }
    result?;

    println!("{}", serde_json::to_string_pretty(&variables)?);
    Ok(())
}

async fn run_scripts(
    bridge: &mut Bridge,
    scripts: &[PathBuf],
    variables: &mut VariableSet,
    timeout: Option<Duration>,
    interrupt: &CancellationToken,
) -> anyhow::Result<()> {
    for script in scripts {
        let report = match bridge.run_file(script, variables, timeout, interrupt).await {
            Ok(report) => report,
            Err(RunError::Interrupted { elapsed }) => {
                bail!("interrupted after {elapsed:?} while running {}", script.display())
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to run {}", script.display()));
            }
        };

        match report.outcome {
            RunOutcome::Completed { completion } if completion.is_trustworthy() => {
                tracing::info!(
                    script = %script.display(),
                    elapsed = ?report.elapsed,
                    "Script completed"
                );
            }
            RunOutcome::Completed { completion } => {
                bail!("companion stopped while running {}: {completion:?}", script.display())
            }
            RunOutcome::TimedOut { elapsed } => {
                bail!("{} timed out after {elapsed:?}", script.display())
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use serde_json::json;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn vars_parse_as_typed_json() {
        let (name, var) = parse_var("x=5").unwrap();
        assert_eq!(name, "x");
        assert_eq!(var, Variable::new(json!(5)));

        let (_, var) = parse_var("s=\"a=b\"").unwrap();
        assert_eq!(var.value, json!("a=b"));

        assert!(parse_var("=1").is_err());
        assert!(parse_var("x").is_err());
        assert!(parse_var("x=not json").is_err());
    }

    #[test]
    fn timeout_rejects_negative_seconds() {
        assert_eq!(parse_timeout(None).unwrap(), None);
        assert_eq!(
            parse_timeout(Some(1.5)).unwrap(),
            Some(Duration::from_millis(1500))
        );
        assert!(parse_timeout(Some(-1.0)).is_err());
    }

    #[test]
    fn flags_override_environment_defaults() {
        let cli = Cli::try_parse_from([
            "bifrost",
            "--companion",
            "/usr/bin/node",
            "--runtime-arg",
            "--max-old-space-size=32000",
            "--runtime-arg",
            "main.js",
            "--segment",
            "seg_cli",
            "--notebook",
            "script.js",
        ])
        .unwrap();
        let config = companion_config(&cli, std::path::Path::new("/tmp/sync"));

        assert_eq!(config.program, PathBuf::from("/usr/bin/node"));
        assert_eq!(config.runtime_args, vec!["--max-old-space-size=32000", "main.js"]);
        assert_eq!(config.segment_name, "seg_cli");
        assert!(config.notebook);
        assert!(
            config
                .envs
                .contains(&(ENV_SYNC_ROOT.to_string(), "/tmp/sync".to_string()))
        );
    }
}

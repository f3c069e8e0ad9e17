mod sink;

use std::{path::PathBuf, sync::Arc};

use {
    anyhow::Context,
    clap::{Parser, Subcommand},
    skiff_channels::{ChannelPlugin, ChannelStatus},
    skiff_config::SkiffConfig,
    skiff_slack::{SlackPlugin, SlackWorkspace, SlackWorkspaceConfig},
    tracing::{error, info, warn},
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

use crate::sink::StdoutSink;

#[derive(Parser)]
#[command(name = "skiff", about = "skiff: real-time team chat in the terminal", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file (overrides discovery of skiff.{toml,yaml,yml,json}).
    #[arg(long, global = true, env = "SKIFF_CONFIG")]
    config: Option<PathBuf>,

    /// Only start these workspaces (repeatable).
    #[arg(long = "workspace", short = 'w', global = true)]
    workspaces: Vec<String>,

    /// Log level (trace, debug, info, warn, error). Defaults to the config value.
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect configured workspaces and print their traffic (default).
    Run,
    /// Fetch channels, users and memberships once, then exit.
    Crawl,
    /// Validate workspace configuration.
    Check,
}

fn init_telemetry(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

fn load(cli: &Cli) -> anyhow::Result<SkiffConfig> {
    match &cli.config {
        Some(path) => skiff_config::load_config(path),
        None => Ok(skiff_config::discover_and_load()),
    }
}

/// Workspaces to act on, honouring `--workspace`.
fn selected<'a>(cli: &Cli, config: &'a SkiffConfig) -> anyhow::Result<Vec<(&'a str, &'a serde_json::Value)>> {
    let names = config.workspace_names();
    for wanted in &cli.workspaces {
        if !names.contains(&wanted.as_str()) {
            anyhow::bail!("workspace {wanted} is not configured");
        }
    }
    Ok(names
        .into_iter()
        .filter(|name| cli.workspaces.is_empty() || cli.workspaces.iter().any(|w| w.as_str() == *name))
        .filter_map(|name| config.workspaces.get(name).map(|v| (name, v)))
        .collect())
}

async fn run(cli: &Cli, config: &SkiffConfig) -> anyhow::Result<()> {
    let workspaces = selected(cli, config)?;
    if workspaces.is_empty() {
        anyhow::bail!("no workspaces configured");
    }

    let mut plugin = SlackPlugin::new(Arc::new(StdoutSink));
    let mut started = Vec::new();
    for (name, value) in workspaces {
        match plugin.start_account(name, value.clone()).await {
            Ok(()) => started.push(name),
            Err(e) => error!(workspace = name, error = %e, "failed to start workspace"),
        }
    }
    if started.is_empty() {
        anyhow::bail!("no workspace could be started");
    }

    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")?;
    info!("shutting down");

    for name in started {
        if let Ok(snapshot) = plugin.probe(name).await {
            info!(
                workspace = name,
                connected = snapshot.connected,
                details = snapshot.details.as_deref().unwrap_or(""),
                "final status"
            );
        }
        plugin.stop_account(name).await?;
    }
    Ok(())
}

async fn crawl(cli: &Cli, config: &SkiffConfig) -> anyhow::Result<()> {
    for (name, value) in selected(cli, config)? {
        let ws_config: SlackWorkspaceConfig = serde_json::from_value(value.clone())
            .with_context(|| format!("invalid config for workspace {name}"))?;
        let workspace = SlackWorkspace::new(name, ws_config, Arc::new(StdoutSink))?;
        let report = workspace.crawl_all().await;

        let state = workspace.state();
        let st = state
            .read()
            .map_err(|_| anyhow::anyhow!("workspace state lock poisoned"))?;
        println!(
            "{name}: {} channels, {} users, {} requests, {} failures",
            st.channels().len(),
            st.user_count(),
            report.requests,
            report.failures
        );
        for channel in st.channels() {
            println!("  #{:<24} {:>4} members", channel.name, channel.members.len());
        }
    }
    Ok(())
}

fn check(cli: &Cli, config: &SkiffConfig) -> anyhow::Result<()> {
    let workspaces = selected(cli, config)?;
    if workspaces.is_empty() {
        warn!("no workspaces configured");
    }
    let mut failures = 0;
    for (name, value) in workspaces {
        let result = serde_json::from_value::<SlackWorkspaceConfig>(value.clone())
            .map_err(anyhow::Error::from)
            .and_then(|cfg| {
                SlackWorkspace::new(name, cfg, Arc::new(StdoutSink)).map_err(anyhow::Error::from)
            });
        match result {
            Ok(_) => println!("{name}: ok"),
            Err(e) => {
                failures += 1;
                println!("{name}: {e}");
            },
        }
    }
    if failures > 0 {
        anyhow::bail!("{failures} workspace(s) have invalid configuration");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = load(&cli)?;

    let level = cli.log_level.as_deref().unwrap_or(&config.log.level);
    init_telemetry(level, cli.json_logs || config.log.json);

    info!(version = env!("CARGO_PKG_VERSION"), "skiff starting");

    match cli.command {
        None | Some(Commands::Run) => run(&cli, &config).await,
        Some(Commands::Crawl) => crawl(&cli, &config).await,
        Some(Commands::Check) => check(&cli, &config),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {super::*, serde_json::json};

    fn config() -> SkiffConfig {
        let mut cfg = SkiffConfig::default();
        cfg.workspaces.insert("beta".into(), json!({"token": "b"}));
        cfg.workspaces.insert("acme".into(), json!({"token": "a"}));
        cfg
    }

    #[test]
    fn selects_all_workspaces_sorted() {
        let cli = Cli::parse_from(["skiff"]);
        let cfg = config();
        let names: Vec<_> = selected(&cli, &cfg).unwrap().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["acme", "beta"]);
    }

    #[test]
    fn workspace_filter() {
        let cli = Cli::parse_from(["skiff", "-w", "beta", "check"]);
        let cfg = config();
        let names: Vec<_> = selected(&cli, &cfg).unwrap().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["beta"]);
        assert!(matches!(cli.command, Some(Commands::Check)));

        let cli = Cli::parse_from(["skiff", "-w", "gamma"]);
        assert!(selected(&cli, &cfg).is_err());
    }

    #[test]
    fn check_reports_missing_token() {
        let mut cfg = SkiffConfig::default();
        cfg.workspaces.insert("acme".into(), json!({}));
        let cli = Cli::parse_from(["skiff", "check"]);
        assert!(check(&cli, &cfg).is_err());
        assert!(check(&cli, &config()).is_ok());
    }
}

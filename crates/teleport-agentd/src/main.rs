use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, bail};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use teleport_core::Agent;
use teleport_model::{AgentPaths, ProxyConfig, RuntimeConfig, SharedConfig};
use teleport_observe::{LoggerConfig, MetricsConfig, MetricsSink, logger_init, prune_rotated_files};

/// Remote HTTP-execution agent: long-polls the ArmorCode control plane for
/// request descriptors, executes them against internal targets, and posts
/// the results back.
#[derive(Parser, Debug, Clone)]
#[command(name = "teleport-agentd", version)]
struct Cli {
    /// Control-plane base URL (falls back to the `server_url` env var).
    #[arg(long = "serverUrl")]
    server_url: Option<String>,
    /// Bearer token for the control plane (falls back to `api_key`).
    #[arg(long = "apiKey")]
    api_key: Option<String>,
    /// Agent index, used to name the log file.
    #[arg(long, default_value = "_prod")]
    index: String,
    #[arg(long)]
    timeout: Option<u64>,
    /// Verify TLS certificates on outbound calls.
    #[arg(long, value_parser = parse_flag, num_args = 0..=1, default_missing_value = "true")]
    verify: Option<bool>,
    #[arg(long = "debugMode", value_parser = parse_flag, num_args = 0..=1, default_missing_value = "true")]
    debug_mode: Option<bool>,
    #[arg(long = "envName", default_value = "")]
    env_name: String,

    #[arg(long = "inwardProxyHttp")]
    inward_proxy_http: Option<String>,
    #[arg(long = "inwardProxyHttps")]
    inward_proxy_https: Option<String>,
    #[arg(long = "outgoingProxyHttp")]
    outgoing_proxy_http: Option<String>,
    #[arg(long = "outgoingProxyHttps")]
    outgoing_proxy_https: Option<String>,

    #[arg(long = "poolSize", default_value_t = 5)]
    pool_size: usize,
    #[arg(long = "rateLimitPerMin", default_value_t = 250)]
    rate_limit_per_min: u32,
    #[arg(long = "metricsRetentionDays", default_value_t = 7)]
    metrics_retention_days: u32,
    /// Upload large results to ArmorCode instead of object storage.
    /// Present without a value means true.
    #[arg(long = "uploadToAc", value_parser = parse_flag, num_args = 0..=1, default_missing_value = "true", default_value = "true")]
    upload_to_ac: bool,

    #[arg(long = "getTaskStaleThreshold", default_value_t = 3600)]
    get_task_stale_threshold: u64,
    #[arg(long = "taskReceivedStaleThreshold", default_value_t = 43200)]
    task_received_stale_threshold: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = build_config(cli.clone())?;

    let paths = AgentPaths::new();
    prepare_scratch_dirs(&paths)?;

    let log_prefix = format!("app_log{}.log", cli.index);
    let log_handle = logger_init(&LoggerConfig::new(paths.log_dir(), log_prefix.clone()))
        .context("failed to initialize logger")?;
    if config.debug_mode {
        log_handle.level().set_debug(true);
    }

    for prefix in [log_prefix.as_str(), "metrics.json"] {
        if let Err(e) =
            prune_rotated_files(&paths.log_dir(), prefix, config.metrics_retention_days)
        {
            warn!(prefix, "failed to prune rotated files: {e}");
        }
    }

    info!(
        server_url = %config.server_url,
        verify = config.verify_cert,
        timeout = config.timeout_secs,
        outgoing_proxy = ?config.outgoing_proxy,
        inward_proxy = ?config.inward_proxy,
        upload_to_ac = config.upload_to_ac,
        "agent started"
    );

    let metrics = if config.metrics_enabled() {
        MetricsSink::new(&MetricsConfig::new(paths.log_dir()))
            .context("failed to initialize metrics sink")?
    } else {
        MetricsSink::disabled()
    };

    let shared = SharedConfig::new(config);
    let agent = Agent::new(shared, paths, metrics, Some(log_handle.level()))
        .context("failed to initialize agent")?;

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    agent.run(shutdown).await?;
    info!("agent exited cleanly");
    Ok(())
}

/// Merge CLI arguments with the environment fallbacks (`server_url`,
/// `api_key`, `verify`, `timeout`) and validate the required fields.
fn build_config(cli: Cli) -> anyhow::Result<RuntimeConfig> {
    let server_url = cli
        .server_url
        .or_else(|| std::env::var("server_url").ok())
        .filter(|s| !s.is_empty());
    let api_key = cli
        .api_key
        .or_else(|| std::env::var("api_key").ok())
        .filter(|s| !s.is_empty());

    let (Some(server_url), Some(api_key)) = (server_url, api_key) else {
        bail!("server URL and API key must be provided either as arguments or environment variables");
    };

    let mut config = RuntimeConfig::new(server_url, api_key);
    config.agent_id = generate_agent_id();
    config.agent_version = env!("CARGO_PKG_VERSION").to_string();

    config.verify_cert = cli
        .verify
        .or_else(|| std::env::var("verify").ok().and_then(|v| parse_flag(&v).ok()))
        .unwrap_or(false);
    config.debug_mode = cli.debug_mode.unwrap_or(false);
    if !cli.env_name.is_empty() {
        config.env_name = Some(cli.env_name);
    }
    config.timeout_secs = cli
        .timeout
        .or_else(|| {
            std::env::var("timeout")
                .ok()
                .and_then(|v| v.parse().ok())
        })
        .unwrap_or(30);

    config.inward_proxy = ProxyConfig {
        http: cli.inward_proxy_http,
        https: cli.inward_proxy_https,
    };
    config.outgoing_proxy = ProxyConfig {
        http: cli.outgoing_proxy_http,
        https: cli.outgoing_proxy_https,
    };

    config.pool_size = cli.pool_size.max(1);
    config.rate_limit_per_min = cli.rate_limit_per_min;
    config.metrics_retention_days = cli.metrics_retention_days;
    config.upload_to_ac = cli.upload_to_ac;
    config.get_task_stale_threshold = cli.get_task_stale_threshold;
    config.task_received_stale_threshold = cli.task_received_stale_threshold;

    Ok(config)
}

/// `<unix-seconds>_<6 hex>` once per process.
fn generate_agent_id() -> String {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("{timestamp}_{}", &hex[..6])
}

/// Boolean-ish flag values, matching the historical CLI: absent value means
/// true, otherwise yes/no/true/false/t/f/1/0.
fn parse_flag(value: &str) -> Result<bool, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "" | "yes" | "true" | "t" | "1" => Ok(true),
        "no" | "false" | "f" | "0" => Ok(false),
        other => Err(format!("boolean value expected, got {other:?}")),
    }
}

/// Create the scratch tree and delete response spools left over from a
/// previous run.
fn prepare_scratch_dirs(paths: &AgentPaths) -> anyhow::Result<()> {
    std::fs::create_dir_all(paths.log_dir()).context("failed to create log directory")?;
    std::fs::create_dir_all(paths.output_dir()).context("failed to create output directory")?;

    for entry in std::fs::read_dir(paths.output_dir())? {
        let Ok(entry) = entry else { continue };
        let path = entry.path();
        if path.is_file()
            && let Err(e) = std::fs::remove_file(&path)
        {
            eprintln!("failed to remove stale output file {}: {e}", path.display());
        }
    }
    Ok(())
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(sig) => sig,
                    Err(e) => {
                        warn!("failed to install SIGTERM handler: {e}");
                        let _ = ctrl_c.await;
                        shutdown.cancel();
                        return;
                    }
                };
            tokio::select! {
                _ = ctrl_c => info!("received interrupt"),
                _ = sigterm.recv() => info!("received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            info!("received interrupt");
        }
        shutdown.cancel();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_parsing_follows_the_historical_convention() {
        assert_eq!(parse_flag("true"), Ok(true));
        assert_eq!(parse_flag("Yes"), Ok(true));
        assert_eq!(parse_flag("1"), Ok(true));
        assert_eq!(parse_flag("false"), Ok(false));
        assert_eq!(parse_flag("f"), Ok(false));
        assert!(parse_flag("maybe").is_err());
    }

    #[test]
    fn agent_id_has_timestamp_and_hex_suffix() {
        let id = generate_agent_id();
        let (timestamp, hex) = id.split_once('_').unwrap();
        assert!(timestamp.parse::<u64>().is_ok());
        assert_eq!(hex.len(), 6);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn upload_to_ac_defaults_to_true_and_accepts_bare_flag() {
        let cli = Cli::parse_from(["agentd"]);
        assert!(cli.upload_to_ac);

        let cli = Cli::parse_from(["agentd", "--uploadToAc"]);
        assert!(cli.upload_to_ac);

        let cli = Cli::parse_from(["agentd", "--uploadToAc", "false"]);
        assert!(!cli.upload_to_ac);
    }
}

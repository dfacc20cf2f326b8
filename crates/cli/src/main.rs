use std::collections::{BTreeMap, BTreeSet};
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, ValueEnum};
use nodereaper_core::config::{parse_bool, parse_duration, parse_list, parse_pairs};
use nodereaper_core::{ConfigError, PolicyConfig};
use nodereaper_engine::Reaper;
use nodereaper_kubehub::KubeSnapshot;
use nodereaper_notify::{NotificationDispatcher, SlackNotifier};
use nodereaper_ops::KubeNodeOps;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "nodereaper", version, about = "Remove empty, unreachable and cordoned nodes; unstick terminating ones")]
struct Cli {
    /// Summary format printed on stdout
    #[arg(short = 'o', long = "output", value_enum, default_value_t = Output::Human)]
    output: Output,

    /// Log every decision but never mutate the cluster
    #[arg(long, env = "DRY_RUN", value_parser = parse_bool, action = ArgAction::Set,
          num_args = 0..=1, default_value = "false", default_missing_value = "true")]
    dry_run: bool,

    /// Minimum node age before a node may be deleted (e.g. 10m)
    #[arg(long, env = "NODE_MIN_AGE", value_parser = parse_duration, default_value = "10m")]
    node_min_age: chrono::Duration,

    /// Grace period for another controller that tainted a node for deletion
    #[arg(long, env = "DELETION_TIMEOUT", value_parser = parse_duration, default_value = "15m")]
    deletion_timeout: chrono::Duration,

    /// Taint keys that mark a node as being deleted by another controller
    #[arg(long, env = "DELETION_TAINTS", value_parser = parse_list, default_value = "")]
    deletion_taints: BTreeSet<String>,

    /// key=value annotations that protect a node from deletion
    #[arg(long, env = "PROTECTION_ANNOTATIONS", value_parser = parse_pairs, default_value = "")]
    protection_annotations: BTreeMap<String, String>,

    /// key=value labels that protect a node from deletion
    #[arg(long, env = "PROTECTION_LABELS", value_parser = parse_pairs, default_value = "")]
    protection_labels: BTreeMap<String, String>,

    #[arg(long, env = "ENABLE_FINALIZER_CLEANUP", value_parser = parse_bool, action = ArgAction::Set,
          num_args = 0..=1, default_value = "true", default_missing_value = "true")]
    enable_finalizer_cleanup: bool,

    /// How long a node may sit in termination before stuck finalizers are removed
    #[arg(long, env = "FINALIZER_TIMEOUT", value_parser = parse_duration, default_value = "5m")]
    finalizer_timeout: chrono::Duration,

    #[arg(long, env = "FINALIZER_WHITELIST", value_parser = parse_list, default_value = "")]
    finalizer_whitelist: BTreeSet<String>,

    /// Finalizers never removed, even when whitelisted
    #[arg(long, env = "FINALIZER_BLACKLIST", value_parser = parse_list, default_value = "")]
    finalizer_blacklist: BTreeSet<String>,

    /// Only consider nodes carrying all of these key=value labels
    #[arg(long, env = "NODE_LABEL_SELECTOR", value_parser = parse_pairs, default_value = "")]
    node_label_selector: BTreeMap<String, String>,

    #[arg(long, env = "CLUSTER_NAME", default_value = "unknown")]
    cluster_name: String,

    /// Slack incoming webhook; enables Slack notifications
    #[arg(long, env = "SLACK_WEBHOOK_URL", hide_env_values = true)]
    slack_webhook_url: Option<String>,

    /// Nodes evaluated and acted on concurrently
    #[arg(long, env = "MAX_CONCURRENCY", default_value_t = 8)]
    max_concurrency: usize,

    /// Overall deadline; nodes not started by then are left for the next run
    #[arg(long, env = "RUN_TIMEOUT", value_parser = parse_duration, default_value = "5m")]
    run_timeout: chrono::Duration,

    /// tracing env-filter directive (e.g. "info" or "nodereaper_engine=debug")
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[arg(long = "json-logs", env = "ENABLE_JSON_LOGS", value_parser = parse_bool, action = ArgAction::Set,
          num_args = 0..=1, default_value = "true", default_missing_value = "true")]
    json_logs: bool,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

impl Cli {
    fn policy(&self) -> Result<PolicyConfig, ConfigError> {
        let policy = PolicyConfig {
            min_age: self.node_min_age,
            deletion_taints: self.deletion_taints.clone(),
            protection_annotations: self.protection_annotations.clone(),
            protection_labels: self.protection_labels.clone(),
            deletion_timeout: self.deletion_timeout,
            enable_finalizer_cleanup: self.enable_finalizer_cleanup,
            finalizer_timeout: self.finalizer_timeout,
            finalizer_whitelist: self.finalizer_whitelist.clone(),
            finalizer_blacklist: self.finalizer_blacklist.clone(),
            node_label_selector: self.node_label_selector.clone(),
            dry_run: self.dry_run,
            cluster_name: self.cluster_name.clone(),
        };
        policy.validate()?;
        Ok(policy)
    }

    fn notifiers(&self) -> Result<NotificationDispatcher> {
        let mut dispatcher = NotificationDispatcher::new();
        match self.slack_webhook_url.as_deref().filter(|u| !u.trim().is_empty()) {
            Some(url) => {
                let slack = SlackNotifier::new(url).context("configuring Slack notifier")?;
                dispatcher.register_all(Arc::new(slack));
            }
            None => info!("no Slack webhook configured; notifications disabled"),
        }
        Ok(dispatcher)
    }
}

fn init_tracing(level: &str, json: bool) {
    let filter = tracing_subscriber::EnvFilter::from_str(level).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).with_target(true).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
    }
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("NODEREAPER_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid NODEREAPER_METRICS_ADDR; expected host:port");
        }
    }
}

/// Cancel the run on deadline or Ctrl-C.
fn spawn_canceller(cancel: CancellationToken, deadline: std::time::Duration) {
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(deadline) => warn!(timeout_secs = deadline.as_secs(), "run deadline reached; not starting new nodes"),
            res = signal::ctrl_c() => match res {
                Ok(()) => warn!("interrupted; not starting new nodes"),
                Err(e) => {
                    warn!(error = %e, "cannot listen for Ctrl-C");
                    tokio::time::sleep(deadline).await;
                }
            },
        }
        cancel.cancel();
    });
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let policy = cli.policy().context("invalid configuration")?;
    let deadline = policy_deadline(&cli)?;
    let notifier = cli.notifiers()?;

    let client = nodereaper_kubehub::get_kube_client().await?;
    let snapshot = Arc::new(KubeSnapshot::new(client.clone()));
    let ops = Arc::new(KubeNodeOps::new(client));
    let reaper = Reaper::new(snapshot, ops, notifier, cli.max_concurrency).context("invalid configuration")?;

    info!(
        cluster = %policy.cluster_name,
        dry_run = policy.dry_run,
        min_age_secs = policy.min_age.num_seconds(),
        deletion_taints = ?policy.deletion_taints,
        finalizer_cleanup = policy.enable_finalizer_cleanup,
        "starting nodereaper run"
    );
    let cancel = CancellationToken::new();
    spawn_canceller(cancel.clone(), deadline);
    let summary = reaper.run(&policy, cancel).await?;

    match cli.output {
        Output::Human => print!("{}", summary),
        Output::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
    }
    if summary.has_failures() {
        error!(failures = summary.errors.len(), "some node actions failed");
        return Ok(ExitCode::from(1));
    }
    Ok(ExitCode::SUCCESS)
}

fn policy_deadline(cli: &Cli) -> Result<std::time::Duration, ConfigError> {
    cli.run_timeout
        .to_std()
        .ok()
        .filter(|d| !d.is_zero())
        .ok_or_else(|| ConfigError::Invalid { field: "run_timeout", reason: "must be positive".into() })
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.json_logs);
    init_metrics();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{:#}", e), "nodereaper run aborted");
            eprintln!("nodereaper: {:#}", e);
            ExitCode::from(2)
        }
    }
}

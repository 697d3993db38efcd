use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tracing::{debug, error, info};
use tracing_appender::non_blocking::WorkerGuard;

use email_triage::config::{DEFAULT_STATE_DB, TriageConfig, expand_tilde};
use email_triage::mailbox::JmapClient;
use email_triage::mailbox::types::split_addresses;
use email_triage::pipeline::daemon::{self, LoopOptions, StopSignal};
use email_triage::pipeline::{CycleParams, EnginePolicy, FallbackClassifier, TriageEngine};
use email_triage::report;
use email_triage::store::{Ledger, LibSqlLedger, RunSummary, VipSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// One cycle, applying side effects.
    Once,
    /// One cycle, classify and record only.
    Dry,
    /// Loop, applying side effects.
    Daemon,
    /// Loop in dry-run.
    DaemonDry,
    /// One rule-only cycle. Dry-run unless `--apply`.
    Rules,
    /// Rule-only loop. Dry-run unless `--apply`.
    RulesDaemon,
    /// Set every ledger record back to `triaged`.
    ResetStatus,
    /// Show the latest recorded run.
    Status,
}

impl Mode {
    fn is_loop(self) -> bool {
        matches!(self, Self::Daemon | Self::DaemonDry | Self::RulesDaemon)
    }

    fn apply(self, apply_flag: bool) -> bool {
        match self {
            Self::Once | Self::Daemon => true,
            Self::Dry | Self::DaemonDry => false,
            _ => apply_flag,
        }
    }

    fn allows_ai(self) -> bool {
        !matches!(self, Self::Rules | Self::RulesDaemon)
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "email-triage",
    version,
    about = "Triage a JMAP inbox: classify, draft replies, archive the rest"
)]
struct Cli {
    /// What to run. Without a mode, one cycle runs in dry-run unless `--apply`.
    #[arg(value_enum)]
    mode: Option<Mode>,

    /// Config file (YAML or JSON).
    #[arg(long)]
    config: Option<PathBuf>,

    /// State database path. List management needs nothing else.
    #[arg(long)]
    state_db: Option<PathBuf>,

    /// Create drafts and archive messages.
    #[arg(long, default_value_t = false)]
    apply: bool,

    /// Rule-only classification.
    #[arg(long, default_value_t = false)]
    no_codex: bool,

    /// Override `automation.max_emails_per_cycle`.
    #[arg(long)]
    limit: Option<usize>,

    /// Reprocess messages that were already drafted, archived or skipped.
    #[arg(long, default_value_t = false)]
    reprocess: bool,

    /// Print summaries as JSON.
    #[arg(long, default_value_t = false)]
    json: bool,

    /// Override `automation.loop_interval_seconds`.
    #[arg(long)]
    interval_seconds: Option<u64>,

    /// Stop the loop after this many cycles.
    #[arg(long)]
    cycles: Option<u32>,

    /// List VIP senders and exit.
    #[arg(long, default_value_t = false)]
    vip_list: bool,

    /// Add VIP sender(s). Repeat or comma-separate.
    #[arg(long, value_name = "EMAIL")]
    vip_add: Vec<String>,

    /// Remove VIP sender(s). Repeat or comma-separate.
    #[arg(long, value_name = "EMAIL")]
    vip_remove: Vec<String>,

    /// List draft-blocked senders and exit.
    #[arg(long, default_value_t = false)]
    draft_block_list: bool,

    /// Block sender(s) from reply drafts. Repeat or comma-separate.
    #[arg(long, value_name = "EMAIL")]
    draft_block_add: Vec<String>,

    /// Unblock sender(s). Repeat or comma-separate.
    #[arg(long, value_name = "EMAIL")]
    draft_block_remove: Vec<String>,
}

impl Cli {
    fn vip_ops(&self) -> bool {
        self.vip_list || !self.vip_add.is_empty() || !self.vip_remove.is_empty()
    }

    fn block_ops(&self) -> bool {
        self.draft_block_list || !self.draft_block_add.is_empty() || !self.draft_block_remove.is_empty()
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<u8> {
    let loaded = TriageConfig::load(cli.config.as_deref());
    let log_dir = loaded
        .as_ref()
        .ok()
        .and_then(|(config, _)| config.logging.dir.as_deref())
        .map(expand_tilde);
    let _guard = init_tracing(log_dir.as_deref());

    // ── Administration: state DB only ───────────────────────────────
    if cli.vip_ops() || cli.block_ops() {
        let ledger = open_admin_ledger(&cli, loaded.as_ref().ok().map(|(c, _)| c)).await?;
        manage_lists(&cli, &ledger).await?;
        return Ok(0);
    }

    match cli.mode {
        Some(Mode::Status) => {
            let ledger = open_admin_ledger(&cli, loaded.as_ref().ok().map(|(c, _)| c)).await?;
            let latest = ledger.latest_run().await?;
            match (&latest, cli.json) {
                (Some(summary), true) => println!("{}", report::render_summary_json(summary)?),
                _ => print!("{}", report::render_status(latest.as_ref())),
            }
            return Ok(0);
        }
        Some(Mode::ResetStatus) => {
            let ledger = open_admin_ledger(&cli, loaded.as_ref().ok().map(|(c, _)| c)).await?;
            let updated = ledger.reset_all_to_triaged().await?;
            println!("Reset {updated} record(s) to triaged.");
            return Ok(0);
        }
        _ => {}
    }

    // ── Triage cycles ───────────────────────────────────────────────
    let (config, config_path) = loaded?;
    info!(path = %config_path.display(), "Configuration loaded");

    let mode = cli.mode;
    let apply = mode.map_or(cli.apply, |m| m.apply(cli.apply));
    let use_ai = mode.is_none_or(Mode::allows_ai) && !cli.no_codex;
    let looping = mode.is_some_and(Mode::is_loop);

    let db_path = state_db_path(&cli, Some(&config));
    let ledger: Arc<dyn Ledger> = Arc::new(
        LibSqlLedger::new_local(&db_path)
            .await
            .with_context(|| format!("failed to open state database {}", db_path.display()))?,
    );
    let mailbox = Arc::new(JmapClient::from_config(&config)?);
    let classifier = Arc::new(FallbackClassifier::from_config(&config, use_ai).await?);
    let policy = EnginePolicy::from_config(&config)?;
    let engine = TriageEngine::new(policy, mailbox, ledger, classifier);
    engine.seed_vips(&config.triage.vip_senders).await?;

    let params = CycleParams {
        batch_limit: cli
            .limit
            .unwrap_or(config.automation.max_emails_per_cycle)
            .max(1),
        apply,
        allow_ai: use_ai,
        force_reprocess: cli.reprocess,
    };

    let stop = Arc::new(StopSignal::new());
    let _signals = daemon::spawn_signal_listener(Arc::clone(&stop));

    if looping {
        let options = LoopOptions {
            interval: cli
                .interval_seconds
                .map(|s| Duration::from_secs(s.max(1)))
                .unwrap_or_else(|| config.automation.loop_interval()),
            max_cycles: cli.cycles,
        };
        let stats = daemon::run_loop(&engine, &params, &options, &stop, |summary| {
            print_summary(summary, cli.json);
        })
        .await;

        if stats.cycles == 0 {
            return Ok(0);
        }
        let last = if stats.last_failed {
            None
        } else {
            stats.last_summary.as_ref()
        };
        return Ok(exit_code(last));
    }

    match engine.run_cycle(&params, stop.flag()).await {
        Ok(summary) => {
            print_summary(&summary, cli.json);
            Ok(exit_code(Some(&summary)))
        }
        Err(e) => {
            error!(error = %e, "Cycle failed");
            Ok(exit_code(None))
        }
    }
}

fn exit_code(summary: Option<&RunSummary>) -> u8 {
    u8::try_from(report::exit_code(summary)).unwrap_or(1)
}

fn print_summary(summary: &RunSummary, json: bool) {
    if json {
        match report::render_summary_json(summary) {
            Ok(text) => println!("{text}"),
            Err(e) => error!(error = %e, "Failed to serialise summary"),
        }
    } else {
        print!("{}", report::render_summary(summary));
    }
}

/// stderr always; a daily rolling file as well when `dir` is set.
fn init_tracing(dir: Option<&Path>) -> Option<WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let (file_layer, guard) = match dir.map(|d| (d, std::fs::create_dir_all(d))) {
        Some((dir, Ok(()))) => {
            let appender = tracing_appender::rolling::daily(dir, "email-triage.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);
            (Some(layer), Some(guard))
        }
        Some((dir, Err(e))) => {
            eprintln!("Warning: cannot create log directory {}: {e}", dir.display());
            (None, None)
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .with(file_layer)
        .init();

    guard
}

fn state_db_path(cli: &Cli, config: Option<&TriageConfig>) -> PathBuf {
    if let Some(path) = &cli.state_db {
        return expand_tilde(&path.to_string_lossy());
    }
    config.map_or_else(|| expand_tilde(DEFAULT_STATE_DB), TriageConfig::state_db_path)
}

async fn open_admin_ledger(cli: &Cli, config: Option<&TriageConfig>) -> anyhow::Result<LibSqlLedger> {
    if cli.state_db.is_none() && config.is_none() {
        debug!("No usable config, using the default state database");
    }
    let path = state_db_path(cli, config);
    LibSqlLedger::new_local(&path)
        .await
        .with_context(|| format!("failed to open state database {}", path.display()))
}

async fn manage_lists(cli: &Cli, ledger: &LibSqlLedger) -> anyhow::Result<()> {
    for address in split_addresses(&cli.vip_add) {
        let change = ledger.add_vip(&address, VipSource::Manual).await?;
        println!("{}", report::render_list_change("VIP", &address, change));
    }
    for address in split_addresses(&cli.vip_remove) {
        let change = ledger.remove_vip(&address).await?;
        println!("{}", report::render_list_change("VIP", &address, change));
    }
    for address in split_addresses(&cli.draft_block_add) {
        let change = ledger.add_blocked(&address).await?;
        println!("{}", report::render_list_change("draft-block", &address, change));
    }
    for address in split_addresses(&cli.draft_block_remove) {
        let change = ledger.remove_blocked(&address).await?;
        println!("{}", report::render_list_change("draft-block", &address, change));
    }

    if cli.vip_ops() {
        let vips = ledger.list_vips().await?;
        if cli.json {
            println!("{}", serde_json::to_string_pretty(&vips)?);
        } else {
            print!("{}", report::render_vips(&vips));
        }
    }
    if cli.block_ops() {
        let blocked = ledger.list_blocked().await?;
        if cli.json {
            println!("{}", serde_json::to_string_pretty(&blocked)?);
        } else {
            print!("{}", report::render_blocked(&blocked));
        }
    }
    Ok(())
}

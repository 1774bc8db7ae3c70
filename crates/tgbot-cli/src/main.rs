// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! tgbot entry point
//!
//! Loads the configuration, probes the multiplexer, reconciles the tab
//! registry, and runs the dispatcher behind either a long-poll loop or a
//! webhook listener. Exit codes: 0 normal shutdown, 2 configuration error,
//! 3 multiplexer unavailable.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tgbot_core::audit::AuditLog;
use tgbot_core::auth::AuthManager;
use tgbot_core::config::AppConfig;
use tgbot_core::edit::EditManager;
use tgbot_core::output::ChunkLimits;
use tgbot_core::policy::CommandPolicy;
use tgbot_core::registry::TagRegistry;
use tgbot_core::rules::PromptRuleEngine;
use tgbot_core::state::UserStateStore;
use tgbot_mux::{PaneGeometry, TerminalDriver, TmuxDriver};
use tgbot_service::scheduler::{Scheduler, SchedulerDeps};
use tgbot_service::telegram::TelegramApi;
use tgbot_service::{webhook, Dispatcher, DispatcherDeps, UpdateSource, UserLocks};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

const EXIT_CONFIG: u8 = 2;
const EXIT_MUX: u8 = 3;

#[derive(Debug, Parser)]
#[command(name = "tgbot", about = "Terminal multiplexer sessions over a chat bot")]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Mark tabs broken instead of recreating missing sessions at startup.
    #[arg(long)]
    no_create_missing: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match AppConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    init_logging(&config);

    match run(args, config).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "fatal error");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.logging.file.is_empty() {
        builder.init();
    } else {
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.logging.file)
        {
            Ok(file) => builder.with_writer(Arc::new(file)).with_ansi(false).init(),
            Err(e) => {
                eprintln!("cannot open log file {}: {e}, logging to stdout", config.logging.file);
                tracing_subscriber::fmt().init();
            }
        }
    }
}

async fn run(args: Args, config: AppConfig) -> anyhow::Result<ExitCode> {
    if config.telegram.bot_token.is_empty() {
        error!("telegram.bot_token is not configured");
        return Ok(ExitCode::from(EXIT_CONFIG));
    }

    let policy = match CommandPolicy::compile(&config.command_policy) {
        Ok(policy) => Arc::new(policy),
        Err(e) => {
            error!(error = %e, "invalid command policy");
            return Ok(ExitCode::from(EXIT_CONFIG));
        }
    };
    let rules = match PromptRuleEngine::load(&config.paths.prompt_rules_path) {
        Ok(rules) => Arc::new(rules),
        Err(e) => {
            error!(error = %e, "invalid prompt rules");
            return Ok(ExitCode::from(EXIT_CONFIG));
        }
    };

    let driver = TmuxDriver::new(PaneGeometry {
        width: config.tmux.width,
        height: config.tmux.height,
    });
    if !driver.is_available().await {
        error!("tmux is not available on this host");
        return Ok(ExitCode::from(EXIT_MUX));
    }
    let driver: Arc<dyn TerminalDriver> = Arc::new(driver);

    let registry = Arc::new(TagRegistry::load(&config.paths.tag_registry_path)?);
    let states = Arc::new(UserStateStore::load(&config.paths.state_path)?);
    let auth = Arc::new(AuthManager::new(config.clone(), args.config.clone()));
    let edit = Arc::new(EditManager::new(config.edit.page_size));
    let audit = Arc::new(AuditLog::new(config.audit.clone()));
    let locks = Arc::new(UserLocks::new());

    // Startup reconciliation: align persisted tabs with live sessions, then
    // drop dangling active-tab references.
    let report = registry.reconcile(driver.as_ref(), !args.no_create_missing).await?;
    if !report.recreated.is_empty() || !report.broken.is_empty() || !report.orphans.is_empty() {
        info!(
            recreated = report.recreated.len(),
            broken = report.broken.len(),
            orphans = report.orphans.len(),
            "reconciliation finished"
        );
    }
    states.sanitize(|tab_id| registry.get(tab_id).is_some())?;

    let telegram = Arc::new(TelegramApi::new(&config.telegram.bot_token));
    let limits = ChunkLimits {
        max_chars: config.transport.max_chars,
        max_bytes: config.transport.max_bytes,
        max_line_length: config.transport.max_line_length,
    };

    let scheduler = Scheduler::new(SchedulerDeps {
        driver: driver.clone(),
        registry: registry.clone(),
        states: states.clone(),
        rules,
        transport: telegram.clone(),
        locks: locks.clone(),
        limits,
        scrollback: config.tmux.scrollback,
        fallback_lines: config.scheduler.fallback_lines,
    });

    let dispatcher = Dispatcher::new(DispatcherDeps {
        driver,
        registry,
        states: states.clone(),
        auth,
        policy,
        edit,
        audit,
        transport: telegram.clone(),
        scheduler: scheduler.clone(),
        locks,
        limits,
        scrollback: config.tmux.scrollback,
    });

    // Resume periodic captures for users that were active before the restart.
    for user_id in states.users() {
        scheduler.sync_user(&user_id);
    }

    if config.telegram.use_webhook {
        if config.telegram.webhook_url.is_empty() {
            error!("use_webhook requires webhook_url");
            return Ok(ExitCode::from(EXIT_CONFIG));
        }
        let addr: SocketAddr = format!(
            "{}:{}",
            config.telegram.listen_host, config.telegram.listen_port
        )
        .parse()
        .map_err(|e| anyhow::anyhow!("bad listen address: {e}"))?;
        tokio::select! {
            result = webhook::serve(dispatcher.clone(), addr) => {
                result?;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
            }
        }
    } else {
        info!("long polling started");
        loop {
            tokio::select! {
                batch = telegram.next_batch() => {
                    match batch {
                        Ok(updates) => {
                            for update in updates {
                                dispatcher.dispatch(update);
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "poll failed, backing off");
                            tokio::time::sleep(Duration::from_secs(3)).await;
                        }
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }
    }

    // Drain per-user queues, then stop the timers.
    dispatcher.shutdown(SHUTDOWN_GRACE).await;
    scheduler.shutdown();
    info!("bye");
    Ok(ExitCode::SUCCESS)
}

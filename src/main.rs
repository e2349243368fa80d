//! moodle-courier: binary entrypoint.
//! Loads settings, wires the Moodle client, providers and state store into the
//! pipeline, and runs the selected command.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use moodle_courier::config::{Settings, ENV_CONFIG_PATH};
use moodle_courier::logging::{self, LogFormat};
use moodle_courier::metrics::Metrics;
use moodle_courier::notify::{Dispatcher, Registry};
use moodle_courier::pipeline::{self, HealthMonitor, Pipeline, PipelineConfig, Shutdown};
use moodle_courier::source::MoodleClient;
use moodle_courier::state::StateStore;
use moodle_courier::transform::summarize::build_summarizer;

#[derive(Parser, Debug)]
#[command(name = "moodle-courier", version, about = "Moodle notifications, delivered elsewhere")]
struct Cli {
    /// Path to the TOML settings file.
    #[arg(long, short, env = ENV_CONFIG_PATH)]
    config: Option<PathBuf>,

    /// Overrides `[logging] format`.
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Poll forever (default).
    Run,
    /// Run exactly one cycle and exit.
    Once,
    /// Send a synthetic notification to every enabled provider. State is not touched.
    TestNotification,
    /// List the available providers and their parameters.
    Providers,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::Run);

    if command == Command::Providers {
        logging::init(cli.log_format.unwrap_or_default(), None);
        print_providers(&Registry::builtin());
        return Ok(());
    }

    let settings = match Settings::load(cli.config.as_deref()) {
        Ok(s) => s,
        Err(e) => {
            logging::init(cli.log_format.unwrap_or_default(), None);
            error!(error = %e, "invalid configuration");
            return Err(e).context("loading configuration");
        }
    };
    logging::init(
        cli.log_format.unwrap_or(settings.logging.format),
        settings.logging.filter.as_deref(),
    );

    let registry = Registry::builtin();
    let loaded = registry.load_enabled(&settings.providers);
    if loaded.providers.is_empty() {
        warn!("no providers loaded; notifications will only be recorded");
    }
    let dispatcher = Arc::new(Dispatcher::new(
        loaded.providers,
        settings.notification.provider_timeout(),
    ));
    let summarizer = build_summarizer(&settings.ai);
    let summary_timeout = PipelineConfig::from_settings(&settings).summary_timeout;

    if command == Command::TestNotification {
        let report =
            pipeline::send_test_notification(&dispatcher, summarizer.as_deref(), summary_timeout).await;
        for o in &report.outcomes {
            match &o.result {
                Ok(()) => println!("{:<10} ok ({} ms)", o.provider, o.elapsed_ms),
                Err(e) => println!("{:<10} FAILED: {e}", o.provider),
            }
        }
        if report.attempted() == 0 {
            bail!("no providers are enabled");
        }
        if report.all_failed() {
            bail!("every provider failed");
        }
        return Ok(());
    }

    let metrics = match Metrics::init() {
        Ok(m) => m,
        Err(e) => {
            warn!(error = %e, "prometheus recorder not installed; using a detached handle");
            Metrics::detached()
        }
    };

    let store = StateStore::from_settings(&settings.state);
    let state = store
        .open(settings.state.on_corrupt)
        .context("opening pipeline state")?;
    let client = MoodleClient::new(&settings.moodle, &settings.notification)
        .context("building Moodle client")?;
    let health = HealthMonitor::new(&settings.health, state.state.consecutive_failure_count);

    let mut pipeline = Pipeline::new(
        Arc::new(client),
        dispatcher,
        store,
        state,
        PipelineConfig::from_settings(&settings),
    )
    .with_summarizer(summarizer)
    .with_health(health);

    if command == Command::Once {
        let report = pipeline.run_once().await;
        info!(?report, "cycle finished");
        if let Some(e) = report.error {
            bail!("cycle failed: {e}");
        }
        return Ok(());
    }

    let (stop_tx, shutdown) = Shutdown::channel();

    if settings.server.enabled {
        let app = moodle_courier::router(pipeline.subscribe(), &metrics);
        let listener = tokio::net::TcpListener::bind(&settings.server.bind)
            .await
            .with_context(|| format!("binding status server on {}", settings.server.bind))?;
        info!(addr = %settings.server.bind, "status server listening");
        let mut server_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let serve = axum::serve(listener, app)
                .with_graceful_shutdown(async move { server_shutdown.requested().await });
            if let Err(e) = serve.await {
                error!(error = %e, "status server stopped");
            }
        });
    }

    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown requested; finishing the current cycle");
        let _ = stop_tx.send(true);
    });

    pipeline.run(shutdown).await;
    Ok(())
}

fn print_providers(registry: &Registry) {
    for d in registry.discover() {
        println!("{}: {}", d.name, d.description);
        for p in d.params {
            let mut flags = Vec::new();
            if p.required {
                flags.push("required".to_string());
            }
            if let Some(default) = p.default {
                flags.push(format!("default {default:?}"));
            }
            if p.secret {
                flags.push("secret".to_string());
            }
            println!("    {:<16} {} [{}]", p.name, p.help, flags.join(", "));
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "ctrl-c handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;

use clap::{Arg, Command};
use log::{error, info, LevelFilter};
use tokio::time::Duration;
use tokio_cron_scheduler::{Job, JobScheduler};

use mailhub_sync::classify::HttpClassifier;
use mailhub_sync::registry::AccountRegistry;
use mailhub_sync::settings::{self, SettingsStore};
use mailhub_sync::sync::EngineConfig;

fn setup_logger(level: LevelFilter) -> Result<(), fern::InitError> {
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stdout())
        .apply()?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("mailhub-sync")
        .about("Multi-account mail synchronization daemon")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .default_value("settings.yaml"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .default_value("info"),
        )
        .get_matches();

    let level = matches
        .get_one::<String>("log-level")
        .map(String::as_str)
        .unwrap_or("info")
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::Info);
    setup_logger(level)?;

    let config_path = matches
        .get_one::<String>("config")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("settings.yaml"));
    let config = settings::load_settings(Path::new(&config_path))?;

    let settings_store = Arc::new(SettingsStore::new(config.app.clone()));
    let registry = Arc::new(AccountRegistry::new(
        PathBuf::from(&config.daemon.data_dir),
        settings_store,
        Arc::new(HttpClassifier::new()),
        EngineConfig::from(&config.daemon),
    ));

    let loaded = registry.load_persisted()?;
    info!("loaded {} persisted accounts", loaded);
    for account in &config.accounts {
        if let Err(e) = registry.ensure_account(account.clone()) {
            error!("cannot register account {}: {}", account.email, e);
        }
    }

    registry.sync_all();

    let sched = JobScheduler::new().await?;

    // Clone for the closure
    let registry_clone = registry.clone();

    // Add a job that runs every sync interval
    sched
        .add(Job::new_repeated_async(
            Duration::from_secs(config.daemon.sync_interval_seconds),
            move |_uuid, _l| {
                let registry = registry_clone.clone();
                Box::pin(async move {
                    registry.sync_all();
                })
            },
        )?)
        .await?;

    // Start the scheduler
    tokio::spawn(async move {
        if let Err(e) = sched.start().await {
            eprintln!("Scheduler error: {}", e);
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    registry.shutdown().await;
    Ok(())
}

mod config;
mod errors;
mod models;
mod monitor;
mod shutdown;
mod utils;

use std::process::ExitCode;

use anyhow::{Context, Result};
use dotenv::dotenv;
use log::{error, info, LevelFilter};
use simplelog::{ColorChoice, TermLogger, TerminalMode};

use crate::config::{ChannelConfig, Config, NotifyConfig, PortalKind};
use crate::errors::ConfigError;
use crate::monitor::{MonitorSettings, ScoreMonitor};
use crate::shutdown::Shutdown;
use crate::utils::baseline::BaselineStore;
use crate::utils::mail::SmtpChannel;
use crate::utils::notifier::{DeliveryChannel, Notifier};
use crate::utils::pages::PagedPortalClient;
use crate::utils::portal::{HttpPortalClient, PortalClient};
use crate::utils::telegram::TelegramChannel;

#[tokio::main]
async fn main() -> ExitCode {
    // Loads environment variables from a `.env` file, if present.
    dotenv().ok();

    let config = Config::from_env();
    let level = config.as_ref().map(|c| c.log_level).unwrap_or(LevelFilter::Info);
    if let Err(e) = TermLogger::init(level, simplelog::Config::default(), TerminalMode::Mixed, ColorChoice::Auto) {
        eprintln!("Logger already initialised: {e}");
    }

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    match run(config).await {
        Ok(()) => {
            info!("Stopped cleanly");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<()> {
    let (trigger, shutdown) = shutdown::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, finishing up");
            trigger.trigger();
        }
    });

    let notifier = build_notifier(&config.notify, shutdown.clone()).context("Failed to set up notifications")?;

    match config.portal.kind {
        PortalKind::Json => {
            let portal = HttpPortalClient::new(config.portal.base_url.clone()).context("Failed to build the client")?;
            watch(portal, &config, notifier, &shutdown).await
        }
        PortalKind::Html => {
            let portal = PagedPortalClient::new(config.portal.base_url.clone()).context("Failed to build the client")?;
            watch(portal, &config, notifier, &shutdown).await
        }
    }
}

async fn watch<P: PortalClient>(portal: P, config: &Config, notifier: Notifier, shutdown: &Shutdown) -> Result<()> {
    let settings = MonitorSettings {
        poll_interval: config.poll_interval,
        notify_on_update: config.notify.notify_on_update,
    };
    let store = BaselineStore::new(&config.baseline_path);
    let mut monitor =
        ScoreMonitor::new(portal, config.portal.credentials.clone(), config.query, notifier, store, settings);

    monitor.start().await.context("Portal rejected the login, check your credentials and try again")?;
    monitor.run(shutdown).await;
    Ok(())
}

fn build_notifier(config: &NotifyConfig, shutdown: Shutdown) -> Result<Notifier, ConfigError> {
    if !config.enabled {
        info!("Notification delivery disabled, new grades will only be logged");
        return Ok(Notifier::disabled());
    }
    let channel: Box<dyn DeliveryChannel> = match &config.channel {
        Some(ChannelConfig::Smtp(smtp)) => Box::new(SmtpChannel::new(smtp)?),
        Some(ChannelConfig::Telegram(telegram)) => Box::new(TelegramChannel::new(telegram)),
        None => return Err(ConfigError::Missing("NOTIFY_CHANNEL")),
    };
    info!("Notifications go out via {} (up to {} attempts)", channel.name(), config.max_retries);
    Ok(Notifier::new(channel, config.max_retries, config.retry_delay, shutdown))
}

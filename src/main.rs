mod config;
mod error;
mod message;
mod net_link;
mod netatmo;
mod scheduler;
mod speaker;
mod speech;
mod status_bridge;
mod supervisor;
mod trigger_bridge;

use chrono::Utc;
use config::Config;
use message::MessagePolicy;
use net_link::{LinkProbe, TcpLinkProbe};
use netatmo::NetatmoClient;
use scheduler::{Pipeline, PollScheduler};
use speaker::CastCli;
use speech::TranslateTts;
use status_bridge::{NoIndicator, Status, StatusBridge, StatusIndicator};
use std::sync::Arc;
use supervisor::{ExecRestart, RetryDelays, Stage, Supervisor};
use tokio::signal;
use tokio::sync::mpsc;
use trigger_bridge::{TriggerBridge, TriggerEvent};

async fn status_indicator(config: &Config) -> Arc<dyn StatusIndicator> {
    if config.status.remote_port == 0 {
        return Arc::new(NoIndicator);
    }
    match StatusBridge::new(&config.status).await {
        Ok(bridge) => Arc::new(bridge),
        Err(e) => {
            log::warn!("Status LED bridge unavailable: {}", e);
            Arc::new(NoIndicator)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::new()?;
    log::info!("{} {} starting", config.app_name, config.app_version);

    let indicator = status_indicator(&config).await;
    indicator.show(Status::Booting).await;

    let mut supervisor = Supervisor::new(
        config.resilience.initial_fuse,
        RetryDelays::from_config(&config.resilience),
        Box::new(ExecRestart),
        indicator.clone(),
    );

    // Nothing works until the link is up; this shares the fuse with the poll cycle.
    log::info!("Waiting for network to connect");
    let probe = TcpLinkProbe::new(&config.network);
    let probe = &probe;
    let local = supervisor.guard(Stage::Link, move || probe.check()).await?;
    log::info!("connected");
    net_link::log_link_identity(&local);
    log::info!("Current time: {}", Utc::now().to_rfc2822());

    let trigger_rx = if config.trigger.local_port == 0 {
        log::info!("Button input disabled");
        None
    } else {
        let (tx_trigger, rx_trigger) = mpsc::channel::<TriggerEvent>(8);
        let trigger_bridge = TriggerBridge::new(&config.trigger, tx_trigger).await?;
        log::info!("Listening for button presses on {}", trigger_bridge.local_addr()?);
        tokio::spawn(async move {
            if let Err(e) = trigger_bridge.run().await {
                log::error!("TriggerBridge error: {}", e);
            }
        });
        Some(rx_trigger)
    };

    let pipeline = Pipeline {
        station: Arc::new(NetatmoClient::new(
            config.netatmo.clone(),
            config.user_agent(),
            config.http_timeout(),
        )),
        synthesizer: Arc::new(TranslateTts::new(
            config.speech.clone(),
            config.user_agent(),
            config.http_timeout(),
        )),
        speaker: Arc::new(CastCli::new(&config.speaker)),
        location: config.monitor.target_location.clone(),
        speaker_name: config.speaker.name.clone(),
        language: config.speech.language.clone(),
        policy: MessagePolicy::new(config.monitor.warning_level, &config.message),
    };

    let mut scheduler = PollScheduler::new(pipeline, supervisor, config.monitor.interval(), indicator);
    log::info!(
        "Monitoring {} every {} minute(s), warning at {} ppm",
        config.monitor.target_location,
        config.monitor.interval_minutes,
        config.monitor.warning_level
    );

    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Received Ctrl+C, shutting down...");
        }
        result = scheduler.run(trigger_rx) => {
            if let Err(e) = result {
                log::error!("Scheduler stopped: {}", e);
                return Err(e.into());
            }
        }
    }

    if scheduler.supervisor().is_depleted() {
        log::warn!("Exiting with a depleted fuse");
    }
    Ok(())
}

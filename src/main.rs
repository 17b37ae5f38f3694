//! SAEGW-C daemon entry point: CLI, logging, configuration, event loop.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;

use saegwcd::config::AppConfig;
use saegwcd::event::Event;
use saegwcd::gtp_handler::Orchestrator;
use saegwcd::path::{
    execute_actions, LogChargingSink, LogNorthPath, LogPolicyClient, LogSouthPath,
};

/// EPC SAE Gateway Control Plane
#[derive(Parser, Debug)]
#[command(name = "saegwcd")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "EPC SAE Gateway Control Plane")]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/saegwc/saegwc.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Run in daemon mode
    #[arg(short, long)]
    daemon: bool,
}

/// The daemon: one orchestrator on one control thread, fed by an event queue
pub struct SaegwApp {
    running: Arc<AtomicBool>,
    orchestrator: Orchestrator,
    events: mpsc::Receiver<Event>,
    sender: mpsc::Sender<Event>,
}

impl SaegwApp {
    pub fn new(config: &AppConfig) -> Self {
        let (sender, events) = mpsc::channel();
        Self {
            running: Arc::new(AtomicBool::new(true)),
            orchestrator: Orchestrator::new(config),
            events,
            sender,
        }
    }

    /// Event injection handle for the transport collaborators
    pub fn event_sender(&self) -> mpsc::Sender<Event> {
        self.sender.clone()
    }

    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Single control thread: take one event, run it to completion, carry
    /// out the produced actions, repeat.
    pub fn run(&mut self) -> Result<()> {
        log::info!("SAEGW-C running as {}", self.orchestrator.role.name());
        let north = LogNorthPath;
        let south = LogSouthPath;
        let charging = LogChargingSink;
        let policy = LogPolicyClient;

        while self.running.load(Ordering::SeqCst) {
            let actions = match self.events.recv_timeout(Duration::from_millis(100)) {
                Ok(event) => {
                    log::debug!("Event {}", event.name());
                    match event {
                        Event::NorthMessage {
                            peer,
                            local_teid,
                            msg,
                        } => self.orchestrator.handle_north(peer, local_teid, msg),
                        Event::SouthResponse(resp) => self.orchestrator.handle_south(resp),
                        Event::SessionReport(report) => {
                            self.orchestrator.handle_session_report(report)
                        }
                        Event::TimerTick => self.orchestrator.poll_timers(Instant::now()),
                    }
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    self.orchestrator.poll_timers(Instant::now())
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            };
            execute_actions(actions, &north, &south, &charging, &policy);
        }

        log::info!("SAEGW-C main loop exited");
        Ok(())
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "info" => log::LevelFilter::Info,
        "warn" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        _ => log::LevelFilter::Info,
    };
    env_logger::Builder::new()
        .filter_level(log_level)
        .format_timestamp_millis()
        .init();

    log::info!("SAEGW-C v{}", env!("CARGO_PKG_VERSION"));

    let config = if args.config.exists() {
        AppConfig::load(&args.config)?
    } else {
        log::warn!(
            "Configuration {} not found, using defaults",
            args.config.display()
        );
        AppConfig::default()
    };

    let mut app = SaegwApp::new(&config);

    let running = app.running_flag();
    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal");
        running.store(false, Ordering::SeqCst);
    })?;

    app.run()?;

    log::info!("SAEGW-C terminated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_stop() {
        let app = SaegwApp::new(&AppConfig::default());
        assert!(app.running.load(Ordering::SeqCst));
        app.stop();
        assert!(!app.running.load(Ordering::SeqCst));
    }

    #[test]
    fn test_run_drains_queue_and_exits() {
        let mut app = SaegwApp::new(&AppConfig::default());
        let sender = app.event_sender();
        sender.send(Event::TimerTick).unwrap();
        app.stop();
        app.run().unwrap();
    }
}

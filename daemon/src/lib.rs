//! loopfx daemon library.
//!
//! Runs the processor service against a simulated platform and drives it
//! from console commands.

mod commands;
mod config;
mod sim;

pub use commands::{parse_line, ConsoleAction};
pub use config::{DaemonConfig, SimulatedSession};

use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{Receiver, Sender};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use loopfx_dsp::{LoggingCallbacks, MemoryPreferences, NativeEngine};
use loopfx_engine::{create_service, AppContext, Platform};
use loopfx_ipc::{command_channel, event_channel, DumpMethod, ServiceCommand, ServiceEvent};

use crate::sim::{GainEngine, SimAudioHost, SimDumpProvider, SimEffectHost, SimPlatform, SimResolver};

/// Initialize logging.
fn init_logging() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "loopfx=info,loopfx_lib=info,loopfx_engine=info,loopfx_session=info,loopfx_audio=info,loopfx_dsp=info".into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Run the daemon until `quit`, end of input or the configured run time.
pub fn run() -> Result<()> {
    init_logging();
    info!("loopfx starting");

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = DaemonConfig::load(config_path.as_deref())?;

    let (sim, notifications) = SimPlatform::new(config.sessions.clone(), config.sample_rate);
    let platform = Platform {
        audio: Arc::new(SimAudioHost::new(Arc::clone(&sim))),
        effects: Arc::new(SimEffectHost),
        dump_providers: vec![
            Arc::new(SimDumpProvider::new(Arc::clone(&sim), DumpMethod::AudioPolicyService)),
            Arc::new(SimDumpProvider::new(Arc::clone(&sim), DumpMethod::AudioService)),
        ],
        resolver: Arc::new(SimResolver::new(Arc::clone(&sim))),
        engine_factory: Arc::new(|| Ok(Box::new(GainEngine::new()) as Box<dyn NativeEngine>)),
        preferences: Arc::new(MemoryPreferences::from_map(config.preferences.clone())),
        callbacks: Arc::new(LoggingCallbacks),
        notifications,
    };
    let context = Arc::new(AppContext::new(config.own_uid, config.own_package.clone()));

    // Create IPC channels
    let (command_tx, command_rx) = command_channel();
    let (event_tx, event_rx) = event_channel();

    let mut service = create_service(platform, context, command_rx, event_tx)
        .context("Failed to create processor service")?;
    let service_thread = thread::Builder::new()
        .name("loopfx-service".into())
        .spawn(move || {
            info!("Service thread starting");
            service.run();
            info!("Service thread stopped");
        })
        .context("Failed to spawn service thread")?;

    let event_sim = Arc::clone(&sim);
    thread::Builder::new()
        .name("loopfx-events".into())
        .spawn(move || log_events(event_rx, event_sim))
        .context("Failed to spawn event thread")?;

    let send = |command| commands::send(&command_tx, command).map_err(|e| anyhow!(e));
    send(ServiceCommand::SetBlocklist(config.blocklist.clone()))?;
    send(ServiceCommand::SetDumpMethod(config.dump_method))?;
    send(ServiceCommand::Start {
        config: config.service.clone(),
    })?;

    match config.run_seconds {
        Some(seconds) => {
            info!(seconds, "Running for a fixed time");
            thread::sleep(Duration::from_secs(seconds));
        }
        None => run_console(&command_tx, &sim, &config),
    }

    send(ServiceCommand::Shutdown)?;
    service_thread
        .join()
        .map_err(|_| anyhow!("Service thread panicked"))?;

    info!(rendered_samples = sim.rendered_samples(), "loopfx stopped");
    Ok(())
}

fn run_console(command_tx: &Sender<ServiceCommand>, sim: &SimPlatform, config: &DaemonConfig) {
    println!("{}", commands::HELP);

    for line in io::stdin().lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                error!("Failed to read console input: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let result = match parse_line(&line, &config.service) {
            Ok(ConsoleAction::Service(command)) => commands::send(command_tx, command),
            Ok(ConsoleAction::AddSession(session)) => {
                sim.add_session(session);
                Ok(())
            }
            Ok(ConsoleAction::RemoveSession(session_id)) => {
                if !sim.remove_session(session_id) {
                    warn!(session_id, "No such session");
                }
                Ok(())
            }
            Ok(ConsoleAction::SetSampleRate(sample_rate)) => {
                sim.set_sample_rate(Some(sample_rate));
                commands::send(command_tx, ServiceCommand::SampleRateUpdated)
            }
            Ok(ConsoleAction::Revoke) => {
                if !sim.revoke_authorization() {
                    warn!("No capture authorization to revoke");
                }
                Ok(())
            }
            Ok(ConsoleAction::Help) => {
                println!("{}", commands::HELP);
                Ok(())
            }
            Ok(ConsoleAction::Quit) => break,
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            warn!("{}", e);
        }
    }
}

fn log_events(event_rx: Receiver<ServiceEvent>, sim: Arc<SimPlatform>) {
    for event in event_rx {
        match event {
            ServiceEvent::StateChanged { previous, current } => {
                info!(previous = previous.name(), current = current.name(), "State changed");
            }
            ServiceEvent::SessionsChanged(sessions) => {
                let packages: Vec<&str> = sessions.iter().map(|s| s.package_name.as_str()).collect();
                info!(count = sessions.len(), ?packages, "Muted sessions");
            }
            ServiceEvent::Stats(stats) => {
                info!(
                    buffers = stats.buffers_processed,
                    read_errors = stats.read_errors,
                    write_errors = stats.write_errors,
                    recreates = stats.recreates,
                    uptime = stats.uptime_seconds,
                    rendered = sim.rendered_samples(),
                    peak = sim.take_peak(),
                    "Pipeline stats"
                );
            }
            ServiceEvent::SessionLost { uid, package_name } => {
                warn!(uid, package = %package_name, "Lost control of session");
            }
            ServiceEvent::AppProblemDetected { uid, package_name } => {
                warn!(uid, package = %package_name, "App cannot be muted");
            }
            ServiceEvent::CaptureAuthorizationRevoked => warn!("Capture authorization revoked"),
            ServiceEvent::Error { recoverable, message } => {
                error!(recoverable, "Service error: {}", message);
            }
            ServiceEvent::Ready => info!("Service ready"),
            ServiceEvent::Shutdown => {
                info!("Service shut down");
                break;
            }
        }
    }
}

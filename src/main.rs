use anyhow::Context;
use dtu_bridge::bridge::Bridge;
use dtu_bridge::config::Settings;
use dtu_bridge::network;
use dtu_bridge::serial::UartSerial;
use dtu_bridge::transport;
use dtu_bridge::utils::logger::LoggerConfig;
use dtu_bridge::utils::{CancelToken, HealthFlag};
use signal_hook::consts::TERM_SIGNALS;
use signal_hook::flag;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "dtu_config.json";
const TERM_POLL: Duration = Duration::from_millis(100);

fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let _log_guard = LoggerConfig::from_env().init()?;

    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("DTU_CONFIG").ok())
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let settings = Settings::from_file(&path).with_context(|| format!("load settings from {path}"))?;
    let system = settings.system().context("system_config")?;
    let uart = settings.uart().context("uart_config")?;

    let term = Arc::new(AtomicBool::new(false));
    for sig in TERM_SIGNALS {
        flag::register(*sig, term.clone()).with_context(|| format!("register signal {sig}"))?;
    }

    // Readiness waits until the flag is observed; a TERM during boot cancels it.
    let boot = CancelToken::new_root();
    let watcher = {
        let term = term.clone();
        let boot = boot.clone();
        std::thread::Builder::new()
            .name("dtu-boot-term".into())
            .spawn(move || {
                while !boot.is_cancelled() {
                    if term.load(Ordering::Relaxed) {
                        boot.cancel();
                        break;
                    }
                    std::thread::sleep(TERM_POLL);
                }
            })
            .context("spawn boot watcher")?
    };

    let readiness = network::from_config(settings.readiness()?.as_ref());
    tracing::info!("[Main] waiting for network");
    if !readiness.wait_network_ready(&boot) {
        tracing::warn!("[Main] terminated before the network came up");
        let _ = watcher.join();
        return Ok(());
    }

    let link = transport::from_settings(&settings, readiness)?;
    if !link.connect() {
        link.reconnect();
    }
    link.listen();

    let serial = Arc::new(UartSerial::open(&uart)?);
    let bridge = Bridge::new(serial, link);
    bridge.run();

    boot.cancel();
    let _ = watcher.join();

    heartbeat(&term, system.heartbeat_interval(), system.heartbeat_file.as_deref());

    tracing::warn!("[Main] termination signal received");
    bridge.shutdown();
    Ok(())
}

/// Toggle the liveness flag until a termination signal arrives.
fn heartbeat(term: &AtomicBool, interval: Duration, file: Option<&str>) {
    let alive = HealthFlag::new(false);
    let interval = interval.max(TERM_POLL);
    let mut next = std::time::Instant::now();

    while !term.load(Ordering::Relaxed) {
        let now = std::time::Instant::now();
        if now >= next {
            let state = alive.toggle();
            tracing::trace!("[Main] heartbeat {}", state);
            if let Some(path) = file {
                touch(Path::new(path));
            }
            next = now + interval;
        }
        std::thread::sleep(TERM_POLL);
    }
}

fn touch(path: &Path) {
    let stamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    if let Err(err) = std::fs::write(path, stamp.to_string()) {
        dtu_bridge::warn_throttled!(Duration::from_secs(60), "[Main] heartbeat file {}: {}", path.display(), err);
    }
}

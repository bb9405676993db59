use crate::config::ReadinessConfig;
use crate::utils::CancelToken;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

/// Failed checks after which the modem radio is soft-restarted.
pub const SOFT_RESTART_AFTER: u32 = 3;
/// Failed checks after which the modem is power cycled.
pub const POWER_CYCLE_AFTER: u32 = 6;

/// Gate every (re)connect passes through.
pub trait NetworkReadiness: Send + Sync {
    /// Block until the network is usable. Returns false if `cancel` tripped
    /// first.
    fn wait_network_ready(&self, cancel: &CancelToken) -> bool;
}

/// For wired links and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysReady;

impl NetworkReadiness for AlwaysReady {
    fn wait_network_ready(&self, cancel: &CancelToken) -> bool {
        !cancel.is_cancelled()
    }
}

/// Recovery actions on the cellular modem.
pub trait ModemControl: Send + Sync {
    /// Toggle the radio off and on.
    fn soft_restart(&self);
    /// Full power cycle of the modem.
    fn power_cycle(&self);
}

/// Modem control for hosts without a modem: actions are only logged.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogOnlyModem;

impl ModemControl for LogOnlyModem {
    fn soft_restart(&self) {
        tracing::warn!("[Network] soft restart requested, no modem control attached");
    }

    fn power_cycle(&self) {
        tracing::warn!("[Network] power cycle requested, no modem control attached");
    }
}

/// Anything that answers "is the network up right now".
pub trait Probe: Send + Sync {
    fn check(&self) -> bool;
}

/// Probe by opening a TCP connection to a known endpoint.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    pub target: String,
    pub timeout: Duration,
}

impl Probe for TcpProbe {
    fn check(&self) -> bool {
        let addrs = match self.target.to_socket_addrs() {
            Ok(addrs) => addrs,
            Err(err) => {
                tracing::debug!("[Network] cannot resolve {}: {}", self.target, err);
                return false;
            }
        };
        addrs
            .into_iter()
            .any(|addr| TcpStream::connect_timeout(&addr, self.timeout).is_ok())
    }
}

/// Readiness by polling a [`Probe`], escalating through [`ModemControl`]
/// while the network stays down: soft restart on checks 3 to 5, power cycle
/// from check 6 on.
pub struct ProbeReadiness {
    probe: Arc<dyn Probe>,
    modem: Arc<dyn ModemControl>,
    retry_interval: Duration,
}

impl ProbeReadiness {
    pub fn new(probe: Arc<dyn Probe>, modem: Arc<dyn ModemControl>, retry_interval: Duration) -> Self {
        Self {
            probe,
            modem,
            retry_interval,
        }
    }

    pub fn from_config(cfg: &ReadinessConfig, modem: Arc<dyn ModemControl>) -> Self {
        let probe = TcpProbe {
            target: cfg.probe.clone(),
            timeout: Duration::from_secs(cfg.probe_timeout_secs),
        };
        Self::new(Arc::new(probe), modem, Duration::from_secs(cfg.retry_interval_secs))
    }
}

impl NetworkReadiness for ProbeReadiness {
    fn wait_network_ready(&self, cancel: &CancelToken) -> bool {
        let mut failures = 0u32;
        loop {
            if cancel.is_cancelled() {
                return false;
            }
            tracing::info!("[Network] checking network readiness");
            if self.probe.check() {
                tracing::info!("[Network] network is ready");
                return true;
            }

            tracing::warn!("[Network] network not ready, failed checks: {}", failures + 1);
            if (SOFT_RESTART_AFTER..POWER_CYCLE_AFTER).contains(&failures) {
                tracing::warn!("[Network] soft restarting modem");
                self.modem.soft_restart();
            } else if failures >= POWER_CYCLE_AFTER {
                tracing::warn!("[Network] power cycling modem");
                self.modem.power_cycle();
            }
            failures = failures.saturating_add(1);

            if !cancel.sleep_cancellable(self.retry_interval) {
                return false;
            }
        }
    }
}

/// Readiness gate for a configuration: probing when a `network_config`
/// section exists, otherwise always ready.
pub fn from_config(cfg: Option<&ReadinessConfig>) -> Arc<dyn NetworkReadiness> {
    match cfg {
        Some(cfg) => Arc::new(ProbeReadiness::from_config(cfg, Arc::new(LogOnlyModem))),
        None => Arc::new(AlwaysReady),
    }
}

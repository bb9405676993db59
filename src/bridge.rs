use crate::error::QueueError;
use crate::serial::SerialEndpoint;
use crate::thread::ManagedThread;
use crate::transport::Transport;
use crate::utils::CancelToken;
use crate::{error_throttled, warn_throttled};
use std::sync::Arc;
use std::time::Duration;

/// Bytes requested from the serial port per uplink read.
pub const UPLINK_READ_SIZE: usize = 1024;

const DOWNLINK_POLL: Duration = Duration::from_millis(500);
const ERROR_PAUSE: Duration = Duration::from_millis(100);
const LOG_EVERY: Duration = Duration::from_secs(5);

/// Serial/cloud pump.
///
/// Uplink: serial read -> `frame` -> `send`. Downlink: `recv` -> serial
/// write. Each direction runs on its own managed thread and never stops on
/// an error; failures are logged (throttled) and the loop carries on.
pub struct Bridge {
    serial: Arc<dyn SerialEndpoint>,
    transport: Arc<dyn Transport>,
    uplink: ManagedThread<()>,
    downlink: ManagedThread<()>,
    cancel: CancelToken,
}

impl Bridge {
    pub fn new(serial: Arc<dyn SerialEndpoint>, transport: Arc<dyn Transport>) -> Self {
        let cancel = CancelToken::new_root();

        let uplink = ManagedThread::new("dtu-uplink", {
            let serial = serial.clone();
            let transport = transport.clone();
            move |cancel: &CancelToken| {
                uplink_loop(serial.as_ref(), transport.as_ref(), cancel);
                Ok(())
            }
        })
        .with_parent(&cancel);

        let downlink = ManagedThread::new("dtu-downlink", {
            let serial = serial.clone();
            let transport = transport.clone();
            move |cancel: &CancelToken| {
                downlink_loop(serial.as_ref(), transport.as_ref(), cancel);
                Ok(())
            }
        })
        .with_parent(&cancel);

        Self {
            serial,
            transport,
            uplink,
            downlink,
            cancel,
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn serial(&self) -> &Arc<dyn SerialEndpoint> {
        &self.serial
    }

    /// Start both pumps. Pumps already running are left alone.
    pub fn run(&self) {
        tracing::info!("[Bridge] running over {}", self.transport.name());
        if self.uplink.start(Duration::ZERO).is_some() {
            tracing::info!("[Bridge] uplink worker started");
        }
        if self.downlink.start(Duration::ZERO).is_some() {
            tracing::info!("[Bridge] downlink worker started");
        }
    }

    pub fn is_running(&self) -> bool {
        self.uplink.is_running() && self.downlink.is_running()
    }

    /// Stop both pumps and close the transport.
    pub fn shutdown(&self) {
        tracing::info!("[Bridge] shutting down");
        self.cancel.cancel();
        self.transport.close();
        self.uplink.join();
        self.downlink.join();
        tracing::info!("[Bridge] stopped");
    }
}

fn uplink_loop(serial: &dyn SerialEndpoint, transport: &dyn Transport, cancel: &CancelToken) {
    while !cancel.is_cancelled() {
        match serial.read(UPLINK_READ_SIZE) {
            Ok(data) if data.is_empty() => {}
            Ok(data) => {
                tracing::debug!("[Bridge] up transfer {} bytes", data.len());
                if !transport.send(transport.frame(data)) {
                    warn_throttled!(LOG_EVERY, "[Bridge] uplink unit not delivered");
                }
            }
            Err(err) => {
                error_throttled!(LOG_EVERY, "[Bridge] up transfer error: {:#}", err);
                cancel.sleep_cancellable(ERROR_PAUSE);
            }
        }
    }
}

fn downlink_loop(serial: &dyn SerialEndpoint, transport: &dyn Transport, cancel: &CancelToken) {
    while !cancel.is_cancelled() {
        match transport.recv_timeout(DOWNLINK_POLL) {
            Ok(unit) => {
                tracing::debug!("[Bridge] down transfer {} bytes", unit.payload.len());
                match serial.write(&unit.payload) {
                    Ok(true) => {}
                    Ok(false) => {
                        warn_throttled!(LOG_EVERY, "[Bridge] serial write incomplete");
                    }
                    Err(err) => {
                        error_throttled!(LOG_EVERY, "[Bridge] down transfer error: {:#}", err);
                    }
                }
            }
            Err(QueueError::Empty) => {}
            Err(QueueError::Closed) => {
                tracing::info!("[Bridge] transport closed, downlink exits");
                break;
            }
            Err(err) => {
                error_throttled!(LOG_EVERY, "[Bridge] down transfer error: {}", err);
                cancel.sleep_cancellable(ERROR_PAUSE);
            }
        }
    }
}

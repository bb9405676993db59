use crate::config::UartConfig;
use anyhow::{Context, bail};
use bytes::Bytes;
use parking_lot::Mutex;
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::io::{self, Read, Write};
use std::time::Duration;

/// Byte pipe to the attached device.
pub trait SerialEndpoint: Send + Sync {
    /// Read up to `max` bytes. Blocks at most the endpoint's read timeout;
    /// nothing read within it is an empty result, not an error.
    fn read(&self, max: usize) -> anyhow::Result<Bytes>;

    /// Write all of `data`; returns whether every byte went out.
    fn write(&self, data: &[u8]) -> anyhow::Result<bool>;
}

fn data_bits(n: u8) -> anyhow::Result<DataBits> {
    Ok(match n {
        5 => DataBits::Five,
        6 => DataBits::Six,
        7 => DataBits::Seven,
        8 => DataBits::Eight,
        other => bail!("unsupported data bits {other}"),
    })
}

fn parity(n: u8) -> anyhow::Result<Parity> {
    Ok(match n {
        0 => Parity::None,
        1 => Parity::Even,
        2 => Parity::Odd,
        other => bail!("unsupported parity {other}"),
    })
}

fn stop_bits(n: u8) -> anyhow::Result<StopBits> {
    Ok(match n {
        1 => StopBits::One,
        2 => StopBits::Two,
        other => bail!("unsupported stop bits {other}"),
    })
}

fn flow_control(n: u8) -> anyhow::Result<FlowControl> {
    Ok(match n {
        0 => FlowControl::None,
        1 => FlowControl::Hardware,
        2 => FlowControl::Software,
        other => bail!("unsupported flow control {other}"),
    })
}

/// UART endpoint. Reader and writer are separate handles to the same port so
/// the uplink read never waits behind a downlink write.
pub struct UartSerial {
    name: String,
    reader: Mutex<Box<dyn SerialPort>>,
    writer: Mutex<Box<dyn SerialPort>>,
}

impl UartSerial {
    pub fn open(cfg: &UartConfig) -> anyhow::Result<Self> {
        let port = serialport::new(&cfg.port, cfg.baudrate)
            .data_bits(data_bits(cfg.bytesize)?)
            .parity(parity(cfg.parity)?)
            .stop_bits(stop_bits(cfg.stopbits)?)
            .flow_control(flow_control(cfg.flowctl)?)
            .timeout(Duration::from_millis(cfg.read_timeout_ms.max(1)))
            .open()
            .with_context(|| format!("failed to open serial port {}", cfg.port))?;
        let writer = port
            .try_clone()
            .with_context(|| format!("failed to clone serial port {}", cfg.port))?;

        tracing::info!("[Serial] opened {} at {} baud", cfg.port, cfg.baudrate);
        Ok(Self {
            name: cfg.port.clone(),
            reader: Mutex::new(port),
            writer: Mutex::new(writer),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl SerialEndpoint for UartSerial {
    fn read(&self, max: usize) -> anyhow::Result<Bytes> {
        let mut buf = vec![0u8; max];
        match self.reader.lock().read(&mut buf) {
            Ok(n) => {
                buf.truncate(n);
                Ok(Bytes::from(buf))
            }
            Err(err) if matches!(err.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => Ok(Bytes::new()),
            Err(err) => Err(anyhow::Error::new(err).context(format!("read from {}", self.name))),
        }
    }

    fn write(&self, data: &[u8]) -> anyhow::Result<bool> {
        let mut writer = self.writer.lock();
        writer
            .write_all(data)
            .with_context(|| format!("write to {}", self.name))?;
        writer.flush().with_context(|| format!("flush {}", self.name))?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_settings_map_from_config_codes() {
        assert_eq!(data_bits(8).unwrap(), DataBits::Eight);
        assert_eq!(parity(2).unwrap(), Parity::Odd);
        assert_eq!(stop_bits(2).unwrap(), StopBits::Two);
        assert_eq!(flow_control(1).unwrap(), FlowControl::Hardware);
        assert!(data_bits(9).is_err());
        assert!(parity(3).is_err());
    }

    #[test]
    fn missing_port_fails_to_open() {
        let cfg = UartConfig {
            port: "/dev/dtu-no-such-port".into(),
            baudrate: 115_200,
            bytesize: 8,
            parity: 0,
            stopbits: 1,
            flowctl: 0,
            read_timeout_ms: 100,
        };
        assert!(UartSerial::open(&cfg).is_err());
    }
}

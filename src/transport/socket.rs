use super::{Connection, Connector, Inbound, Outbound};
use crate::config::{SocketConfig, SocketProtocol};
use crate::utils::HealthFlag;
use anyhow::{Context, anyhow};
use bytes::Bytes;
use socket2::{SockRef, TcpKeepalive};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::time::Duration;

const READ_CHUNK: usize = 1024;
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// UDP has nothing to shut down, so its reads are always bounded.
const UDP_READ_POLL: Duration = Duration::from_secs(1);

/// Raw TCP/UDP connector. Streams are unframed: every inbound read becomes
/// one unit and uplink payloads are written as-is.
#[derive(Debug, Clone)]
pub struct SocketConnector {
    cfg: SocketConfig,
    name: String,
}

impl SocketConnector {
    pub fn new(cfg: SocketConfig) -> Self {
        let name = match cfg.protocol {
            SocketProtocol::Tcp => "TcpLink",
            SocketProtocol::Udp => "UdpLink",
        };
        Self {
            cfg,
            name: name.to_string(),
        }
    }

    fn resolve(&self) -> anyhow::Result<SocketAddr> {
        (self.cfg.domain.as_str(), self.cfg.port)
            .to_socket_addrs()
            .with_context(|| format!("dns lookup failed for {}:{}", self.cfg.domain, self.cfg.port))?
            .next()
            .ok_or_else(|| anyhow!("no address for {}:{}", self.cfg.domain, self.cfg.port))
    }

    fn timeout(&self) -> Option<Duration> {
        (self.cfg.timeout > 0).then(|| Duration::from_secs(self.cfg.timeout))
    }
}

impl Connector for SocketConnector {
    type Conn = SocketConn;

    fn name(&self) -> &str {
        &self.name
    }

    fn open(&self) -> anyhow::Result<SocketConn> {
        let peer = self.resolve()?;
        let timeout = self.timeout();

        let channel = match self.cfg.protocol {
            SocketProtocol::Tcp => {
                let stream = TcpStream::connect_timeout(&peer, timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT))
                    .with_context(|| format!("tcp connect to {peer} failed"))?;
                stream.set_read_timeout(timeout).context("set read timeout")?;
                stream.set_nodelay(true).context("set nodelay")?;
                if let Some(idle) = self.cfg.keep_alive.filter(|s| *s > 0) {
                    let keepalive = TcpKeepalive::new().with_time(Duration::from_secs(idle));
                    SockRef::from(&stream)
                        .set_tcp_keepalive(&keepalive)
                        .context("set tcp keepalive")?;
                }
                Channel::Tcp(stream)
            }
            SocketProtocol::Udp => {
                let local = if peer.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
                let socket = UdpSocket::bind(local).context("udp bind failed")?;
                socket
                    .connect(peer)
                    .with_context(|| format!("udp connect to {peer} failed"))?;
                socket
                    .set_read_timeout(Some(timeout.unwrap_or(UDP_READ_POLL).min(UDP_READ_POLL)))
                    .context("set read timeout")?;
                Channel::Udp(socket)
            }
        };

        tracing::info!("[{}] connected to {}", self.name, peer);
        Ok(SocketConn {
            channel,
            peer,
            health: HealthFlag::new(true),
        })
    }

    fn frame(&self, payload: Bytes) -> Outbound {
        Outbound::Raw(payload)
    }
}

#[derive(Debug)]
enum Channel {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

#[derive(Debug)]
pub struct SocketConn {
    channel: Channel,
    peer: SocketAddr,
    health: HealthFlag,
}

impl SocketConn {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

impl Connection for SocketConn {
    fn receive(&self) -> anyhow::Result<Option<Inbound>> {
        let mut buf = [0u8; READ_CHUNK];
        let read = match &self.channel {
            Channel::Tcp(stream) => (&*stream).read(&mut buf),
            Channel::Udp(socket) => socket.recv(&mut buf),
        };

        match read {
            Ok(0) if matches!(self.channel, Channel::Tcp(_)) => {
                self.health.down();
                Err(anyhow!("peer {} closed the connection", self.peer))
            }
            Ok(n) => Ok(Some(Inbound::raw(Bytes::copy_from_slice(&buf[..n])))),
            Err(err) if is_timeout(&err) => Ok(None),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => Ok(None),
            Err(err) => {
                self.health.down();
                Err(anyhow::Error::new(err).context(format!("read from {}", self.peer)))
            }
        }
    }

    fn write(&self, unit: &Outbound) -> anyhow::Result<bool> {
        let payload = unit.payload();
        let written = match &self.channel {
            Channel::Tcp(stream) => (&*stream).write_all(payload).map(|()| true),
            Channel::Udp(socket) => socket.send(payload).map(|n| n == payload.len()),
        };
        written.map_err(|err| {
            self.health.down();
            anyhow::Error::new(err).context(format!("write to {}", self.peer))
        })
    }

    fn is_healthy(&self) -> bool {
        self.health.get()
    }

    fn shutdown(&self) {
        self.health.down();
        if let Channel::Tcp(stream) = &self.channel {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

use super::codec::{Connect, Packet, Publish, connack_reason};
use crate::config::MqttConfig;
use crate::transport::{Connection, Connector, Inbound, Outbound, UPLINK_TOPIC_KEY};
use crate::utils::HealthFlag;
use anyhow::{Context, anyhow, bail};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{Duration, Instant};

const READ_CHUNK: usize = 1024;
/// Bound on one blocking read, so keep-alive is serviced between packets.
const READ_POLL: Duration = Duration::from_millis(500);
const DISCONNECT_GRACE: Duration = Duration::from_millis(200);
const SUBACK_FAILURE: u8 = 0x80;

/// Opens MQTT 3.1.1 sessions over plain TCP and subscribes every configured
/// topic on each connect.
#[derive(Debug, Clone)]
pub struct MqttConnector {
    cfg: MqttConfig,
}

impl MqttConnector {
    pub fn new(cfg: MqttConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &MqttConfig {
        &self.cfg
    }

    fn resolve(&self) -> anyhow::Result<SocketAddr> {
        (self.cfg.server.as_str(), self.cfg.port)
            .to_socket_addrs()
            .with_context(|| format!("dns lookup failed for {}:{}", self.cfg.server, self.cfg.port))?
            .next()
            .ok_or_else(|| anyhow!("no address for {}:{}", self.cfg.server, self.cfg.port))
    }

    fn connect_packet(&self) -> Packet {
        Packet::Connect(Connect {
            client_id: self.cfg.client_id.clone(),
            keepalive: self.cfg.keepalive,
            clean_session: self.cfg.clean_session,
            username: self.cfg.user.clone(),
            password: self.cfg.password.as_ref().map(|p| p.value().to_string()),
        })
    }
}

impl Connector for MqttConnector {
    type Conn = MqttConnection;

    fn name(&self) -> &str {
        "MqttLink"
    }

    fn open(&self) -> anyhow::Result<MqttConnection> {
        if self.cfg.qos > 1 {
            bail!("qos {} is not supported, use 0 or 1", self.cfg.qos);
        }
        let peer = self.resolve()?;
        let connect_timeout = Duration::from_secs(self.cfg.connect_timeout_secs.max(1));

        let stream = TcpStream::connect_timeout(&peer, connect_timeout)
            .with_context(|| format!("tcp connect to broker {peer} failed"))?;
        stream.set_nodelay(true).context("set nodelay")?;
        stream.set_read_timeout(Some(READ_POLL)).context("set read timeout")?;

        let conn = MqttConnection {
            socket: stream.try_clone().context("clone broker socket")?,
            reader: Mutex::new(Reader {
                stream: stream.try_clone().context("clone broker socket")?,
                buf: BytesMut::with_capacity(READ_CHUNK),
                pending: VecDeque::new(),
            }),
            writer: Mutex::new(stream),
            health: HealthFlag::new(true),
            keepalive: (self.cfg.keepalive > 0).then(|| Duration::from_secs(u64::from(self.cfg.keepalive))),
            ping: Mutex::new(PingState {
                last_sent: Instant::now(),
                outstanding: None,
            }),
            next_pkid: AtomicU16::new(1),
            publish_topics: self.cfg.publish.clone(),
            qos: self.cfg.qos,
            peer,
        };

        let deadline = Instant::now() + connect_timeout;
        conn.handshake(self.connect_packet(), deadline)?;
        conn.subscribe_all(self.cfg.subscribe.values(), deadline)?;

        tracing::info!("[MqttLink] session open with {} as {}", peer, self.cfg.client_id);
        Ok(conn)
    }

    fn frame(&self, payload: Bytes) -> Outbound {
        Outbound::Topic {
            key: UPLINK_TOPIC_KEY.to_string(),
            payload,
        }
    }
}

struct Reader {
    stream: TcpStream,
    buf: BytesMut,
    /// Publishes that arrived while waiting for a handshake reply.
    pending: VecDeque<Publish>,
}

impl Reader {
    /// Pull more bytes off the socket. `Ok(false)` on read timeout.
    fn fill(&mut self) -> io::Result<bool> {
        let mut chunk = [0u8; READ_CHUNK];
        match self.stream.read(&mut chunk) {
            Ok(0) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "broker closed the connection",
            )),
            Ok(n) => {
                self.buf.extend_from_slice(&chunk[..n]);
                Ok(true)
            }
            Err(err) if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => Ok(false),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => Ok(true),
            Err(err) => Err(err),
        }
    }

    fn next_packet(&mut self) -> anyhow::Result<Option<Packet>> {
        Packet::decode(&mut self.buf).context("bad packet from broker")
    }
}

struct PingState {
    last_sent: Instant,
    outstanding: Option<Instant>,
}

/// One MQTT session.
///
/// The listener thread drives `receive`, which also services keep-alive;
/// `write` runs concurrently on its own socket handle.
pub struct MqttConnection {
    socket: TcpStream,
    reader: Mutex<Reader>,
    writer: Mutex<TcpStream>,
    health: HealthFlag,
    keepalive: Option<Duration>,
    ping: Mutex<PingState>,
    next_pkid: AtomicU16,
    publish_topics: BTreeMap<String, String>,
    qos: u8,
    peer: SocketAddr,
}

impl MqttConnection {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    fn next_pkid(&self) -> u16 {
        loop {
            let id = self.next_pkid.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    fn write_packet(&self, packet: &Packet) -> anyhow::Result<()> {
        let mut buf = BytesMut::new();
        packet.encode(&mut buf).context("encode packet")?;
        let written = self.writer.lock().write_all(&buf);
        if let Err(err) = written {
            self.health.down();
            return Err(anyhow::Error::new(err).context(format!("write to broker {}", self.peer)));
        }
        self.ping.lock().last_sent = Instant::now();
        Ok(())
    }

    /// Read until `pick` accepts a packet. Publishes seen meanwhile are kept
    /// for `receive`.
    fn await_reply<T>(&self, deadline: Instant, what: &str, mut pick: impl FnMut(&Packet) -> Option<T>) -> anyhow::Result<T> {
        let mut reader = self.reader.lock();
        loop {
            while let Some(packet) = reader.next_packet()? {
                if let Some(found) = pick(&packet) {
                    return Ok(found);
                }
                if let Packet::Publish(publish) = packet {
                    reader.pending.push_back(publish);
                }
            }
            if Instant::now() >= deadline {
                bail!("timed out waiting for {what}");
            }
            reader.fill().with_context(|| format!("waiting for {what}"))?;
        }
    }

    fn handshake(&self, connect: Packet, deadline: Instant) -> anyhow::Result<()> {
        self.write_packet(&connect)?;
        let code = self.await_reply(deadline, "CONNACK", |p| match p {
            Packet::ConnAck { code, .. } => Some(*code),
            _ => None,
        })?;
        if code != 0 {
            bail!("broker refused connection: {} ({})", connack_reason(code), code);
        }
        Ok(())
    }

    fn subscribe_all<'a>(&self, topics: impl Iterator<Item = &'a String>, deadline: Instant) -> anyhow::Result<()> {
        let filters: Vec<(String, u8)> = topics.map(|t| (t.clone(), self.qos)).collect();
        if filters.is_empty() {
            return Ok(());
        }

        let pkid = self.next_pkid();
        self.write_packet(&Packet::Subscribe {
            pkid,
            filters: filters.clone(),
        })?;
        let codes = self.await_reply(deadline, "SUBACK", |p| match p {
            Packet::SubAck { pkid: id, codes } if *id == pkid => Some(codes.clone()),
            _ => None,
        })?;

        for ((topic, _), code) in filters.iter().zip(codes.iter().chain(std::iter::repeat(&SUBACK_FAILURE))) {
            if *code == SUBACK_FAILURE {
                bail!("broker refused subscription to {topic}");
            }
            tracing::info!("[MqttLink] subscribed {} (qos {})", topic, code);
        }
        Ok(())
    }

    /// Send PINGREQ when idle for half the keep-alive, fail when a PINGREQ
    /// went unanswered for a whole keep-alive.
    fn keep_alive(&self) -> anyhow::Result<()> {
        let Some(interval) = self.keepalive else {
            return Ok(());
        };

        let due = {
            let ping = self.ping.lock();
            if let Some(sent) = ping.outstanding {
                if sent.elapsed() >= interval {
                    self.health.down();
                    bail!("no PINGRESP from {} within {:?}", self.peer, interval);
                }
                false
            } else {
                ping.last_sent.elapsed() >= interval / 2
            }
        };

        if due {
            self.write_packet(&Packet::PingReq)?;
            self.ping.lock().outstanding = Some(Instant::now());
        }
        Ok(())
    }

    fn deliver(&self, publish: Publish) -> anyhow::Result<Inbound> {
        if publish.qos == 1 {
            self.write_packet(&Packet::PubAck { pkid: publish.pkid })?;
        }
        Ok(Inbound::on_topic(publish.topic, publish.payload))
    }
}

impl fmt::Debug for MqttConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MqttConnection")
            .field("peer", &self.peer)
            .field("healthy", &self.health.get())
            .field("qos", &self.qos)
            .finish_non_exhaustive()
    }
}

impl Connection for MqttConnection {
    fn receive(&self) -> anyhow::Result<Option<Inbound>> {
        self.keep_alive()?;

        let mut reader = self.reader.lock();
        loop {
            if let Some(publish) = reader.pending.pop_front() {
                // Only QoS 0/1 are subscribed; a QoS 2 flow is never completed.
                if publish.qos > 1 {
                    tracing::warn!(
                        "[MqttLink] dropped qos {} publish on {} (pkid {})",
                        publish.qos,
                        publish.topic,
                        publish.pkid
                    );
                    continue;
                }
                drop(reader);
                return self.deliver(publish).map(Some);
            }

            match reader.next_packet() {
                Ok(Some(Packet::Publish(publish))) => reader.pending.push_back(publish),
                Ok(Some(Packet::PingResp)) => self.ping.lock().outstanding = None,
                Ok(Some(other)) => tracing::debug!("[MqttLink] ignoring {:?}", other),
                Ok(None) => match reader.fill() {
                    Ok(true) => {}
                    Ok(false) => return Ok(None),
                    Err(err) => {
                        self.health.down();
                        return Err(anyhow::Error::new(err).context(format!("read from broker {}", self.peer)));
                    }
                },
                Err(err) => {
                    self.health.down();
                    return Err(err);
                }
            }
        }
    }

    fn write(&self, unit: &Outbound) -> anyhow::Result<bool> {
        let (key, payload) = match unit {
            Outbound::Topic { key, payload } => (key, payload),
            Outbound::Raw(_) => {
                tracing::warn!("[MqttLink] raw unit without topic key, dropped");
                return Ok(false);
            }
        };
        let Some(topic) = self.publish_topics.get(key) else {
            tracing::warn!("[MqttLink] no publish topic configured for key {:?}", key);
            return Ok(false);
        };

        let pkid = if self.qos > 0 { self.next_pkid() } else { 0 };
        self.write_packet(&Packet::Publish(Publish {
            topic: topic.clone(),
            payload: payload.clone(),
            qos: self.qos,
            retain: false,
            dup: false,
            pkid,
        }))?;
        Ok(true)
    }

    fn is_healthy(&self) -> bool {
        self.health.get()
    }

    fn shutdown(&self) {
        if self.health.get()
            && let Some(mut writer) = self.writer.try_lock_for(DISCONNECT_GRACE)
        {
            let mut buf = BytesMut::new();
            if Packet::Disconnect.encode(&mut buf).is_ok() {
                let _ = writer.write_all(&buf);
            }
        }
        self.health.down();
        let _ = self.socket.shutdown(Shutdown::Both);
    }
}

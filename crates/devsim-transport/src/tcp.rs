//! MQTT 3.1.1 over TCP

use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use devsim_core::{DeviceError, DeviceResult};
use devsim_wire::{ConnAck, Connect, Packet, Publish, QoS, Subscribe, SUBACK_FAILURE};

use crate::{BrokerHandler, BrokerSession, BrokerTransport, ConnectOptions};

/// Largest inbound packet accepted from a broker
pub const MAX_INBOUND_PACKET: usize = 1024 * 1024;

const READ_BUFFER_SIZE: usize = 4096;

type SharedWriter = Arc<tokio::sync::Mutex<OwnedWriteHalf>>;

/// MQTT transport over plain TCP
#[derive(Clone, Copy, Debug, Default)]
pub struct MqttTcpTransport;

impl MqttTcpTransport {
    pub fn new() -> Self {
        MqttTcpTransport
    }
}

#[async_trait]
impl BrokerTransport for MqttTcpTransport {
    async fn connect(
        &self,
        options: &ConnectOptions,
        handler: Arc<dyn BrokerHandler>,
    ) -> DeviceResult<Arc<dyn BrokerSession>> {
        options.validate()?;
        let (reader, writer, buf, ack) = timeout(options.connect_timeout, handshake(options))
            .await
            .map_err(|_| {
                DeviceError::ConnectTimeout(options.connect_timeout.as_millis() as u64)
            })??;

        let session = Arc::new(TcpSession::new(
            writer,
            options.endpoint(),
            options.write_timeout,
        ));

        let filters = handler.on_connect(&ack);
        if !filters.is_empty() {
            let subscribe = Packet::Subscribe(Subscribe {
                packet_id: session.next_packet_id(),
                filters: filters.into_iter().map(|f| (f, QoS::AtMostOnce)).collect(),
            });
            write_packet(&session.writer, &subscribe, session.write_timeout).await?;
        }

        let keep_alive = Duration::from_secs(u64::from(options.keep_alive_secs()));
        session.start(reader, buf, handler, keep_alive);
        Ok(session)
    }
}

async fn handshake(
    options: &ConnectOptions,
) -> DeviceResult<(OwnedReadHalf, OwnedWriteHalf, BytesMut, ConnAck)> {
    let stream = TcpStream::connect(options.endpoint()).await?;
    stream.set_nodelay(true)?;
    let (mut reader, mut writer) = stream.into_split();

    let connect = Packet::Connect(Connect {
        client_id: options.client_id.clone(),
        keep_alive: options.keep_alive_secs(),
        clean_session: options.clean_session,
    });
    writer.write_all(&connect.to_bytes()?).await?;

    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
    match read_packet(&mut reader, &mut buf).await? {
        Some(Packet::ConnAck(ack)) if ack.code.is_accepted() => Ok((reader, writer, buf, ack)),
        Some(Packet::ConnAck(ack)) => Err(DeviceError::ConnectionRefused(ack.code.to_byte())),
        Some(other) => Err(DeviceError::InvalidWireFormat(format!(
            "Expected CONNACK, got {:?}",
            other.packet_type()
        ))),
        None => Err(DeviceError::transport("Broker closed the connection during handshake")),
    }
}

/// Read the next packet, buffering partial reads in `buf`.
///
/// `Ok(None)` on a clean end of stream.
async fn read_packet(
    reader: &mut OwnedReadHalf,
    buf: &mut BytesMut,
) -> DeviceResult<Option<Packet>> {
    loop {
        if let Some((packet, used)) = Packet::decode(buf)? {
            buf.advance(used);
            return Ok(Some(packet));
        }
        if buf.len() > MAX_INBOUND_PACKET {
            return Err(DeviceError::InvalidWireFormat(format!(
                "Inbound packet exceeds {} bytes",
                MAX_INBOUND_PACKET
            )));
        }
        if reader.read_buf(buf).await? == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(DeviceError::transport("Connection closed mid-packet"));
        }
    }
}

/// Write one packet, giving up once `limit` passes.
///
/// The limit covers waiting for the writer lock as well as the write itself.
async fn write_packet(
    writer: &SharedWriter,
    packet: &Packet,
    limit: Duration,
) -> DeviceResult<()> {
    let bytes = packet.to_bytes()?;
    let write = async {
        let mut writer = writer.lock().await;
        writer.write_all(&bytes).await
    };
    match timeout(limit, write).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(DeviceError::transport(format!(
            "{:?} write timed out after {:?}",
            packet.packet_type(),
            limit
        ))),
    }
}

/// A live MQTT session over TCP
pub struct TcpSession {
    writer: SharedWriter,
    alive: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    next_packet_id: AtomicU16,
    endpoint: String,
    write_timeout: Duration,
}

impl TcpSession {
    fn new(writer: OwnedWriteHalf, endpoint: String, write_timeout: Duration) -> Self {
        TcpSession {
            writer: Arc::new(tokio::sync::Mutex::new(writer)),
            alive: Arc::new(AtomicBool::new(true)),
            tasks: Mutex::new(Vec::new()),
            next_packet_id: AtomicU16::new(1),
            endpoint,
            write_timeout,
        }
    }

    fn next_packet_id(&self) -> u16 {
        loop {
            let id = self.next_packet_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    fn start(
        &self,
        reader: OwnedReadHalf,
        buf: BytesMut,
        handler: Arc<dyn BrokerHandler>,
        keep_alive: Duration,
    ) {
        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(receive_loop(
            reader,
            buf,
            handler,
            Arc::clone(&self.alive),
            self.endpoint.clone(),
        )));

        if !keep_alive.is_zero() {
            tasks.push(tokio::spawn(keepalive_loop(
                Arc::clone(&self.writer),
                Arc::clone(&self.alive),
                keep_alive / 2,
                self.write_timeout,
            )));
        }
    }

    fn abort_tasks(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

#[async_trait]
impl BrokerSession for TcpSession {
    async fn publish(&self, topic: &str, payload: Bytes) -> DeviceResult<()> {
        if !self.is_alive() {
            return Err(DeviceError::LinkDown);
        }
        let packet = Packet::Publish(Publish::at_most_once(topic, payload));
        if let Err(e) = write_packet(&self.writer, &packet, self.write_timeout).await {
            self.alive.store(false, Ordering::SeqCst);
            return Err(e);
        }
        Ok(())
    }

    fn halt(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.abort_tasks();
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

impl Drop for TcpSession {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

async fn receive_loop(
    mut reader: OwnedReadHalf,
    mut buf: BytesMut,
    handler: Arc<dyn BrokerHandler>,
    alive: Arc<AtomicBool>,
    endpoint: String,
) {
    loop {
        match read_packet(&mut reader, &mut buf).await {
            Ok(Some(Packet::Publish(publish))) => {
                handler.on_message(&publish.topic, &publish.payload);
            }
            Ok(Some(Packet::SubAck(ack))) => {
                if ack.return_codes.contains(&SUBACK_FAILURE) {
                    tracing::warn!(
                        "Broker {} rejected a subscription: {:?}",
                        endpoint,
                        ack.return_codes
                    );
                } else {
                    tracing::debug!("Subscribed on {} (packet {})", endpoint, ack.packet_id);
                }
            }
            Ok(Some(Packet::PingResp)) => {
                tracing::trace!("PINGRESP from {}", endpoint);
            }
            Ok(Some(other)) => {
                tracing::warn!("Unexpected {:?} from broker {}", other.packet_type(), endpoint);
            }
            Ok(None) => {
                tracing::warn!("Broker {} closed the connection", endpoint);
                break;
            }
            Err(e) => {
                tracing::warn!("MQTT receive error from {}: {}", endpoint, e);
                break;
            }
        }
    }
    alive.store(false, Ordering::SeqCst);
}

async fn keepalive_loop(
    writer: SharedWriter,
    alive: Arc<AtomicBool>,
    period: Duration,
    write_timeout: Duration,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if let Err(e) = write_packet(&writer, &Packet::PingReq, write_timeout).await {
            tracing::warn!("Keepalive failed: {}", e);
            alive.store(false, Ordering::SeqCst);
            break;
        }
    }
}

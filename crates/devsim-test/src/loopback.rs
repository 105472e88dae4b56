//! TCP loopback broker
//!
//! A minimal MQTT 3.1.1 broker for end-to-end tests of the TCP transport:
//! CONNECT/CONNACK, SUBSCRIBE/SUBACK, QoS 0 PUBLISH fan-out and
//! PINGREQ/PINGRESP. Like a real broker it drops a client that stays silent
//! for 1.5x its announced keepalive.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use devsim_core::{DeviceError, DeviceResult};
use devsim_wire::{
    topic_matches, validate_filter, ConnAck, Packet, Publish, SubAck, SUBACK_FAILURE,
};

/// What the broker observed, in order
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BrokerEvent {
    Connected(String),
    Subscribed(String, Vec<String>),
    Published { client_id: String, topic: String },
    Ping(String),
    /// The client closed its socket
    Closed(String),
    /// The client went silent past its keepalive
    KeepaliveExpired(String),
}

struct Client {
    client_id: String,
    filters: Vec<String>,
    outbound: mpsc::UnboundedSender<Bytes>,
}

#[derive(Default)]
struct Shared {
    clients: Mutex<HashMap<u64, Client>>,
    events: Mutex<Vec<BrokerEvent>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    next_id: AtomicU64,
}

impl Shared {
    fn record(&self, event: BrokerEvent) {
        tracing::debug!(?event, "loopback broker");
        self.events.lock().push(event);
    }

    fn route(&self, topic: &str, packet: Bytes) {
        for client in self.clients.lock().values() {
            if client.filters.iter().any(|f| topic_matches(f, topic)) {
                tracing::trace!(client = %client.client_id, topic, "loopback broker delivering");
                let _ = client.outbound.send(packet.clone());
            }
        }
    }
}

pub struct TcpLoopbackBroker {
    addr: SocketAddr,
    shared: Arc<Shared>,
    accept_task: JoinHandle<()>,
}

impl TcpLoopbackBroker {
    /// Listen on an ephemeral localhost port
    pub async fn bind() -> DeviceResult<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let addr = listener.local_addr()?;
        let shared = Arc::new(Shared::default());
        let accept_task = tokio::spawn(accept_loop(listener, Arc::clone(&shared)));
        Ok(TcpLoopbackBroker {
            addr,
            shared,
            accept_task,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn events(&self) -> Vec<BrokerEvent> {
        self.shared.events.lock().clone()
    }

    pub fn connected_clients(&self) -> usize {
        self.shared.clients.lock().len()
    }
}

impl Drop for TcpLoopbackBroker {
    fn drop(&mut self) {
        self.accept_task.abort();
        for task in self.shared.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tracing::trace!(%peer, "loopback broker accepted");
                let task = tokio::spawn(serve_client(stream, Arc::clone(&shared)));
                shared.tasks.lock().push(task);
            }
            Err(e) => {
                tracing::warn!("loopback broker accept failed: {}", e);
                break;
            }
        }
    }
}

async fn serve_client(stream: TcpStream, shared: Arc<Shared>) {
    let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
    let (mut reader, mut writer) = stream.into_split();
    let (outbound, mut queue) = mpsc::unbounded_channel::<Bytes>();

    let write_task = tokio::spawn(async move {
        while let Some(bytes) = queue.recv().await {
            if writer.write_all(&bytes).await.is_err() {
                break;
            }
        }
    });

    let mut buf = BytesMut::with_capacity(4096);
    let mut client_id = String::new();
    // Until CONNECT arrives there is no keepalive to enforce
    let mut silence_limit: Option<Duration> = None;

    loop {
        let next = match silence_limit {
            Some(limit) => {
                match tokio::time::timeout(limit, next_packet(&mut reader, &mut buf)).await {
                    Ok(next) => next,
                    Err(_) => {
                        shared.record(BrokerEvent::KeepaliveExpired(client_id.clone()));
                        break;
                    }
                }
            }
            None => next_packet(&mut reader, &mut buf).await,
        };

        let packet = match next {
            Ok(Some(packet)) => packet,
            Ok(None) => {
                shared.record(BrokerEvent::Closed(client_id.clone()));
                break;
            }
            Err(e) => {
                tracing::warn!(%client_id, "loopback broker dropped client: {}", e);
                break;
            }
        };

        let reply = match packet {
            Packet::Connect(connect) => {
                client_id = connect.client_id.clone();
                if connect.keep_alive > 0 {
                    silence_limit =
                        Some(Duration::from_millis(u64::from(connect.keep_alive) * 1500));
                }
                shared.clients.lock().insert(
                    id,
                    Client {
                        client_id: client_id.clone(),
                        filters: Vec::new(),
                        outbound: outbound.clone(),
                    },
                );
                shared.record(BrokerEvent::Connected(client_id.clone()));
                Some(Packet::ConnAck(ConnAck::accepted()))
            }
            Packet::Subscribe(subscribe) => {
                let mut return_codes = Vec::with_capacity(subscribe.filters.len());
                let mut accepted = Vec::new();
                for (filter, _requested) in subscribe.filters {
                    if validate_filter(&filter).is_ok() {
                        // Only QoS 0 is granted
                        return_codes.push(0);
                        accepted.push(filter);
                    } else {
                        return_codes.push(SUBACK_FAILURE);
                    }
                }
                if let Some(client) = shared.clients.lock().get_mut(&id) {
                    client.filters.extend(accepted.iter().cloned());
                }
                shared.record(BrokerEvent::Subscribed(client_id.clone(), accepted));
                Some(Packet::SubAck(SubAck {
                    packet_id: subscribe.packet_id,
                    return_codes,
                }))
            }
            Packet::Publish(publish) => {
                shared.record(BrokerEvent::Published {
                    client_id: client_id.clone(),
                    topic: publish.topic.clone(),
                });
                let echo = Packet::Publish(Publish::at_most_once(
                    publish.topic.clone(),
                    publish.payload,
                ));
                match echo.to_bytes() {
                    Ok(bytes) => shared.route(&publish.topic, bytes),
                    Err(e) => tracing::warn!("loopback broker could not re-encode: {}", e),
                }
                None
            }
            Packet::PingReq => {
                shared.record(BrokerEvent::Ping(client_id.clone()));
                Some(Packet::PingResp)
            }
            _ => None,
        };

        if let Some(reply) = reply {
            match reply.to_bytes() {
                Ok(bytes) => {
                    let _ = outbound.send(bytes);
                }
                Err(e) => tracing::warn!("loopback broker could not encode reply: {}", e),
            }
        }
    }

    shared.clients.lock().remove(&id);
    write_task.abort();
}

async fn next_packet(
    reader: &mut OwnedReadHalf,
    buf: &mut BytesMut,
) -> DeviceResult<Option<Packet>> {
    loop {
        if let Some((packet, used)) = Packet::decode(buf)? {
            buf.advance(used);
            return Ok(Some(packet));
        }
        if reader.read_buf(buf).await? == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(DeviceError::transport("client closed mid-packet"));
        }
    }
}

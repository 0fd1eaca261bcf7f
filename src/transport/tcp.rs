//! Plain TCP transport using the rumqttc v4 codec

use super::{Endpoint, Outbound, Transport, TransportError, TransportLink};
use async_trait::async_trait;
use bytes::BytesMut;
use rumqttc::mqttbytes::v4::{self, Packet};
use rumqttc::mqttbytes::Error as CodecError;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Opens one TCP connection per connect attempt
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn open(&self, endpoint: &Endpoint) -> Result<TransportLink, TransportError> {
        let stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await?;
        stream.set_nodelay(true)?;
        debug!(target: "mqtt_transport", "TCP connection established to {}", endpoint);

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let endpoint = endpoint.clone();
        tokio::spawn(async move {
            let (reader, writer) = stream.into_split();
            let link = LinkIo::new(reader, writer, &endpoint);
            if let Err(e) = link.run(outbound_rx, &inbound_tx).await {
                warn!(target: "mqtt_transport", "Link to {} failed: {}", endpoint, e);
                let _ = inbound_tx.send(Err(e));
            }
            debug!(target: "mqtt_transport", "Link to {} closed", endpoint);
        });

        Ok(TransportLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

/// Socket halves plus codec buffers for one link
struct LinkIo {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    read_buf: BytesMut,
    write_buf: BytesMut,
    keep_alive: Duration,
    max_packet_size: usize,
    last_read: Instant,
    last_write: Instant,
}

impl LinkIo {
    fn new(reader: OwnedReadHalf, writer: OwnedWriteHalf, endpoint: &Endpoint) -> Self {
        let now = Instant::now();
        Self {
            reader,
            writer,
            read_buf: BytesMut::with_capacity(4096),
            write_buf: BytesMut::with_capacity(4096),
            keep_alive: endpoint.keep_alive,
            max_packet_size: endpoint.max_packet_size,
            last_read: now,
            last_write: now,
        }
    }

    /// Pump frames until either side closes; `Ok` means an orderly close
    async fn run(
        mut self,
        mut outbound: mpsc::UnboundedReceiver<Outbound>,
        inbound: &mpsc::UnboundedSender<Result<Packet, TransportError>>,
    ) -> Result<(), TransportError> {
        let keep_alive_enabled = !self.keep_alive.is_zero();
        let tick = if keep_alive_enabled {
            self.keep_alive / 2
        } else {
            Duration::from_secs(3600)
        };
        let mut ticker = tokio::time::interval(tick);

        loop {
            tokio::select! {
                biased;

                frame = outbound.recv() => match frame {
                    Some(Outbound::Packet(packet)) => self.write_packet(&packet).await?,
                    Some(Outbound::Disconnect) => {
                        self.write_packet(&Packet::Disconnect).await?;
                        let _ = self.writer.shutdown().await;
                        return Ok(());
                    }
                    None => {
                        let _ = self.writer.shutdown().await;
                        return Ok(());
                    }
                },

                _ = inbound.closed() => return Ok(()),

                read = self.reader.read_buf(&mut self.read_buf) => {
                    if read? == 0 {
                        return Err(TransportError::Closed(
                            "connection closed by broker".to_string(),
                        ));
                    }
                    self.last_read = Instant::now();
                    self.decode_frames(inbound)?;
                }

                _ = ticker.tick(), if keep_alive_enabled => {
                    let limit = self.keep_alive * 3 / 2;
                    if self.last_read.elapsed() > limit {
                        return Err(TransportError::KeepAliveTimeout(limit));
                    }
                    if self.last_write.elapsed() >= self.keep_alive {
                        debug!(target: "mqtt_transport", "Sending PINGREQ");
                        self.write_packet(&Packet::PingReq).await?;
                    }
                }
            }
        }
    }

    fn decode_frames(
        &mut self,
        inbound: &mpsc::UnboundedSender<Result<Packet, TransportError>>,
    ) -> Result<(), TransportError> {
        loop {
            match v4::read(&mut self.read_buf, self.max_packet_size) {
                Ok(packet) => {
                    if inbound.send(Ok(packet)).is_err() {
                        return Ok(());
                    }
                }
                Err(CodecError::InsufficientBytes(_)) => return Ok(()),
                Err(e) => return Err(TransportError::Codec(e.to_string())),
            }
        }
    }

    async fn write_packet(&mut self, packet: &Packet) -> Result<(), TransportError> {
        self.write_buf.clear();
        let size = encode(packet, &mut self.write_buf)
            .map_err(|e| TransportError::Codec(e.to_string()))?;
        if size > self.max_packet_size {
            return Err(TransportError::PacketTooLarge {
                size,
                max: self.max_packet_size,
            });
        }
        self.writer.write_all(&self.write_buf).await?;
        self.last_write = Instant::now();
        Ok(())
    }
}

/// Append the wire form of `packet` to `buf`, returning the frame length
fn encode(packet: &Packet, buf: &mut BytesMut) -> Result<usize, CodecError> {
    match packet {
        Packet::Connect(connect) => connect.write(buf),
        Packet::ConnAck(ack) => ack.write(buf),
        Packet::Publish(publish) => publish.write(buf),
        Packet::PubAck(ack) => ack.write(buf),
        Packet::PubRec(rec) => rec.write(buf),
        Packet::PubRel(rel) => rel.write(buf),
        Packet::PubComp(comp) => comp.write(buf),
        Packet::Subscribe(subscribe) => subscribe.write(buf),
        Packet::SubAck(ack) => ack.write(buf),
        Packet::Unsubscribe(unsubscribe) => unsubscribe.write(buf),
        Packet::UnsubAck(ack) => ack.write(buf),
        Packet::PingReq => v4::PingReq.write(buf),
        Packet::PingResp => v4::PingResp.write(buf),
        Packet::Disconnect => v4::Disconnect.write(buf),
    }
}

//! Client implementation.
//!
//! The client maintains:
//! - One TCP connection, split into a reader task and a write half
//! - The replicated world mirror
//! - A wrapping input sequence number
//!
//! Incoming frames are queued by the reader task and applied in
//! [`GameClient::poll`], so the caller decides when world state changes.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{bail, Context};
use bytes::Bytes;
use shooter_shared::{
    config::ClientConfig,
    math::Vec2,
    net::{FrameReader, FrameWriter, ReliableConn},
    object::ObjectId,
    packets::{
        DisconnectPacket, InputPacket, JoinPacket, NetMessage, PingPacket, PROTOCOL_VERSION,
    },
    protocol::{decode_frame, encode_frame, PacketRegistry},
};
use tokio::{sync::mpsc, task::JoinHandle, time::Instant};
use tracing::{debug, info, warn};

use crate::{
    input::{build_input, InputState},
    world::ClientWorld,
};

/// How long `connect` waits for the server to accept the join.
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);
/// Buffer for client packets; they are all small.
const OUTGOING_FRAME_BYTES: usize = 128;
const INBOUND_QUEUE: usize = 256;

/// Connection state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientState {
    Connected,
    /// The server sent a Disconnect or the socket closed.
    Disconnected { reason: String },
}

/// High-level game client.
pub struct GameClient {
    pub player_id: ObjectId,
    pub world_size: Vec2,
    pub world: ClientWorld,
    pub state: ClientState,

    registry: Arc<PacketRegistry>,
    writer: FrameWriter,
    frames: mpsc::Receiver<Bytes>,
    reader_task: JoinHandle<()>,
    server_addr: SocketAddr,

    sequence: u16,
    started: Instant,
    last_rtt: Option<Duration>,
}

impl GameClient {
    /// Connects, joins and waits for the server to accept.
    pub async fn connect(cfg: &ClientConfig) -> anyhow::Result<Self> {
        cfg.validate().context("invalid client config")?;
        let server_addr: SocketAddr = cfg.server_addr.parse().context("parse server_addr")?;
        info!(server = %server_addr, name = %cfg.player_name, "Connecting to server");

        let registry = Arc::new(PacketRegistry::standard());
        let mut conn = ReliableConn::connect(server_addr).await?;
        let join = JoinPacket {
            protocol_version: PROTOCOL_VERSION,
            name: cfg.player_name.clone(),
        };
        conn.send(&encode_frame(&registry, &[join.into()], OUTGOING_FRAME_BYTES)?)
            .await?;

        let reply = tokio::time::timeout(JOIN_TIMEOUT, conn.recv())
            .await
            .context("timed out waiting for Joined")??;
        let joined = match decode_frame(&registry, &reply)
            .context("decode join reply")?
            .into_iter()
            .next()
        {
            Some(NetMessage::Joined(joined)) => joined,
            Some(NetMessage::Disconnect(d)) => bail!("server refused join: {}", d.reason),
            other => bail!("expected Joined, got {other:?}"),
        };
        info!(player = %joined.player_id, "Joined server");

        let (reader, writer) = conn.into_split();
        let (tx, frames) = mpsc::channel(INBOUND_QUEUE);
        let reader_task = tokio::spawn(read_loop(reader, tx));

        Ok(Self {
            player_id: joined.player_id,
            world_size: Vec2::new(joined.world_width, joined.world_height),
            world: ClientWorld::new(),
            state: ClientState::Connected,
            registry,
            writer,
            frames,
            reader_task,
            server_addr,
            sequence: 0,
            started: Instant::now(),
            last_rtt: None,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.state == ClientState::Connected
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    /// Round trip of the last answered ping.
    pub fn last_rtt(&self) -> Option<Duration> {
        self.last_rtt
    }

    async fn send(&mut self, message: NetMessage) -> anyhow::Result<()> {
        let frame = encode_frame(&self.registry, &[message], OUTGOING_FRAME_BYTES)
            .context("encode packet")?;
        self.writer.write_frame(&frame).await
    }

    /// Sends this tick's input and returns the packet that went out.
    pub async fn send_input(&mut self, input: InputState) -> anyhow::Result<InputPacket> {
        self.sequence = self.sequence.wrapping_add(1);
        let packet = build_input(self.sequence, input);
        self.send(packet.clone().into()).await?;
        Ok(packet)
    }

    pub async fn ping(&mut self) -> anyhow::Result<()> {
        let timestamp = self.started.elapsed().as_millis() as u32;
        self.send(PingPacket { timestamp }.into()).await
    }

    /// Tells the server we are leaving and closes the write half.
    pub async fn disconnect(&mut self, reason: &str) -> anyhow::Result<()> {
        self.send(
            DisconnectPacket {
                reason: reason.to_string(),
            }
            .into(),
        )
        .await?;
        self.writer.shutdown().await?;
        self.state = ClientState::Disconnected {
            reason: reason.to_string(),
        };
        Ok(())
    }

    /// Waits up to `timeout` for a frame, then applies it and everything
    /// else already queued. Returns how many frames were handled.
    pub async fn poll(&mut self, timeout: Duration) -> anyhow::Result<usize> {
        let first = match tokio::time::timeout(timeout, self.frames.recv()).await {
            Err(_) => return Ok(0),
            Ok(None) => {
                self.closed("connection closed by server");
                return Ok(0);
            }
            Ok(Some(frame)) => frame,
        };
        self.handle_frame(&first);
        let mut handled = 1;
        while let Ok(frame) = self.frames.try_recv() {
            self.handle_frame(&frame);
            handled += 1;
        }
        Ok(handled)
    }

    fn closed(&mut self, reason: &str) {
        if self.is_connected() {
            info!(reason, "Disconnected from server");
            self.state = ClientState::Disconnected {
                reason: reason.to_string(),
            };
        }
    }

    fn handle_frame(&mut self, frame: &[u8]) {
        let messages = match decode_frame(&self.registry, frame) {
            Ok(messages) => messages,
            Err(e) => {
                warn!(error = %e, bytes = frame.len(), "Dropping malformed frame");
                return;
            }
        };
        for message in messages {
            match message {
                NetMessage::Update(update) => {
                    if let Err(e) = self.world.apply_update(&update) {
                        warn!(error = %e, "Update rejected");
                    }
                }
                NetMessage::Ping(ping) => {
                    let now = self.started.elapsed().as_millis() as u32;
                    let rtt = Duration::from_millis(now.wrapping_sub(ping.timestamp) as u64);
                    debug!(rtt_ms = rtt.as_millis() as u64, "Ping answered");
                    self.last_rtt = Some(rtt);
                }
                NetMessage::Disconnect(d) => self.closed(&d.reason),
                other => debug!(message = other.name(), "Unhandled message"),
            }
        }
    }

    /// Human readable summary, one line per entry.
    pub fn status(&self) -> Vec<String> {
        let mut out = vec![
            format!("State: {:?}", self.state),
            format!("Player: {}", self.player_id),
            format!("Objects known: {}", self.world.len()),
            format!("Updates applied: {}", self.world.updates_applied()),
        ];
        if let Some(data) = self.world.player_data() {
            out.push(format!("Health: {:.0} Kills: {}", data.health, data.kills));
        }
        if let Some(alive) = self.world.alive_count() {
            out.push(format!("Alive: {alive}"));
        }
        if let Some(rtt) = self.last_rtt {
            out.push(format!("RTT: {} ms", rtt.as_millis()));
        }
        out
    }
}

impl Drop for GameClient {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

async fn read_loop(mut reader: FrameReader, tx: mpsc::Sender<Bytes>) {
    loop {
        match reader.read_frame().await {
            Ok(Some(frame)) => {
                if tx.send(frame).await.is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(e) => {
                debug!(error = %e, "Read failed");
                return;
            }
        }
    }
}

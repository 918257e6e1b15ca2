//! Server implementation.
//!
//! An authoritative fixed-tick loop. Sockets are serviced by background
//! tasks; the simulation itself is single threaded:
//! - An accept task splits every connection into a reader task and a writer
//!   task.
//! - Readers forward raw frames over one mpsc channel, drained at the start
//!   of each tick.
//! - Writers own a bounded queue of encoded frames.
//!
//! Determinism notes:
//! - Keep simulation in a fixed timestep.
//! - Connections are served in `ClientId` order.

use std::{
    collections::BTreeMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use bytes::Bytes;
use shooter_shared::{
    config::ServerConfig,
    net::{ClientId, FrameReader, FrameWriter, ReliableListener},
    object::ObjectId,
    packets::{DisconnectPacket, JoinPacket, JoinedPacket, NetMessage, PROTOCOL_VERSION},
    protocol::{decode_frame, encode_frame, PacketRegistry},
};
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::{JoinHandle, JoinSet},
    time::Instant,
};
use tracing::{debug, info, warn};

use crate::game::Game;
use crate::replication::Viewer;

/// Frames waiting in one connection's writer before it counts as stalled.
const OUTBOUND_QUEUE: usize = 64;
/// Events buffered between the socket tasks and the tick loop.
const INBOUND_QUEUE: usize = 4096;
/// Buffer for control packets (Joined, Ping, Disconnect).
const CONTROL_FRAME_BYTES: usize = 256;

/// What the socket tasks report to the tick loop.
#[derive(Debug)]
enum InboundEvent {
    Connected {
        id: ClientId,
        addr: SocketAddr,
        outbound: mpsc::Sender<Bytes>,
    },
    Frame {
        id: ClientId,
        frame: Bytes,
    },
    Closed {
        id: ClientId,
    },
}

/// Result of queueing a frame for a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Queued,
    Stalled,
    Inert,
}

/// Connected client state.
struct Connection {
    addr: SocketAddr,
    /// `None` once the writer is gone; the connection is then skipped.
    outbound: Option<mpsc::Sender<Bytes>>,
    player: Option<ObjectId>,
    viewer: Viewer,
}

impl Connection {
    fn deliver(&mut self, frame: Bytes) -> Delivery {
        let Some(tx) = &self.outbound else {
            return Delivery::Inert;
        };
        match tx.try_send(frame) {
            Ok(()) => Delivery::Queued,
            Err(TrySendError::Full(_)) => Delivery::Stalled,
            Err(TrySendError::Closed(_)) => {
                self.outbound = None;
                Delivery::Inert
            }
        }
    }

    fn is_inert(&self) -> bool {
        self.outbound.is_none()
    }
}

/// Game server.
pub struct GameServer {
    pub cfg: ServerConfig,
    registry: Arc<PacketRegistry>,
    game: Game,
    connections: BTreeMap<ClientId, Connection>,
    inbound: mpsc::Receiver<InboundEvent>,
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
    tick: u64,
}

impl GameServer {
    /// Binds the listener and generates the world.
    pub async fn new(cfg: ServerConfig) -> anyhow::Result<Self> {
        let addr: SocketAddr = cfg.server_addr.parse().context("parse server_addr")?;
        let listener = ReliableListener::bind(addr).await?;
        Self::with_listener(cfg, listener)
    }

    fn with_listener(mut cfg: ServerConfig, listener: ReliableListener) -> anyhow::Result<Self> {
        let local_addr = listener.local_addr()?;
        cfg.server_addr = local_addr.to_string();
        let game = Game::new(cfg.clone()).context("create world")?;

        let (tx, inbound) = mpsc::channel(INBOUND_QUEUE);
        let accept_task = tokio::spawn(accept_loop(listener, tx));

        Ok(Self {
            cfg,
            registry: Arc::new(PacketRegistry::standard()),
            game,
            connections: BTreeMap::new(),
            inbound,
            local_addr,
            accept_task,
            tick: 0,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn game(&self) -> &Game {
        &self.game
    }

    pub fn tick_count(&self) -> u64 {
        self.tick
    }

    /// Connections that have not closed.
    pub fn client_count(&self) -> usize {
        self.connections.values().filter(|c| !c.is_inert()).count()
    }

    /// Human readable summary, one line per entry.
    pub fn status(&self) -> Vec<String> {
        let mut out = vec![
            format!("Tick: {}", self.tick),
            format!(
                "Objects: {} ({} players, {} alive)",
                self.game.objects().len(),
                self.game.player_count(),
                self.game.alive_count()
            ),
            format!("Clients: {}", self.connections.len()),
        ];
        for (id, c) in &self.connections {
            out.push(format!(
                "  {id:?}: addr={} player={:?} visible={} inert={}",
                c.addr,
                c.player,
                c.viewer.visible().len(),
                c.is_inert()
            ));
        }
        out
    }

    /// Runs the server for a number of ticks.
    pub async fn run_for_ticks(&mut self, ticks: u32) -> anyhow::Result<()> {
        let dt = Duration::from_secs_f32(1.0 / self.cfg.tick_hz as f32);
        let mut next = Instant::now();

        for _ in 0..ticks {
            next += dt;
            self.step(dt.as_secs_f32())?;
            tokio::time::sleep_until(next).await;
        }
        Ok(())
    }

    /// Executes one fixed simulation step.
    pub fn step(&mut self, dt_sec: f32) -> anyhow::Result<()> {
        self.drain_inbound();
        self.game.tick(dt_sec);
        if let Err(e) = self.game.bake() {
            // Skipped objects are logged by the replicator; the tick goes on.
            warn!(tick = self.tick, error = %e, "Some snapshots were not baked");
        }
        self.send_updates();
        self.game.end_tick();
        self.tick += 1;
        Ok(())
    }

    fn drain_inbound(&mut self) {
        while let Ok(event) = self.inbound.try_recv() {
            match event {
                InboundEvent::Connected { id, addr, outbound } => {
                    info!(client_id = ?id, %addr, "Client connected");
                    let viewer =
                        Viewer::new(Arc::clone(&self.registry), self.cfg.outgoing_buffer_bytes);
                    self.connections.insert(
                        id,
                        Connection {
                            addr,
                            outbound: Some(outbound),
                            player: None,
                            viewer,
                        },
                    );
                }
                InboundEvent::Frame { id, frame } => self.on_frame(id, &frame),
                InboundEvent::Closed { id } => self.drop_connection(id, "connection closed"),
            }
        }
    }

    fn on_frame(&mut self, id: ClientId, frame: &[u8]) {
        // A frame is applied whole or not at all.
        let messages = match decode_frame(&self.registry, frame) {
            Ok(messages) => messages,
            Err(e) => {
                warn!(client_id = ?id, error = %e, bytes = frame.len(), "Dropping malformed frame");
                return;
            }
        };
        for message in messages {
            self.on_message(id, message);
        }
    }

    fn on_message(&mut self, id: ClientId, message: NetMessage) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        if conn.is_inert() {
            return;
        }
        match message {
            NetMessage::Join(join) => self.on_join(id, join),
            NetMessage::Input(input) => {
                if let Some(player) = conn.player {
                    self.game.apply_input(player, &input);
                } else {
                    debug!(client_id = ?id, "Input before join ignored");
                }
            }
            NetMessage::Ping(ping) => {
                self.send_control(id, NetMessage::Ping(ping));
            }
            NetMessage::Disconnect(d) => {
                info!(client_id = ?id, reason = %d.reason, "Client disconnected");
                self.drop_connection(id, "client disconnect");
            }
            other => {
                warn!(client_id = ?id, message = other.name(), "Unexpected message from client");
            }
        }
    }

    fn on_join(&mut self, id: ClientId, join: JoinPacket) {
        let Some(conn) = self.connections.get(&id) else {
            return;
        };
        if conn.player.is_some() {
            warn!(client_id = ?id, "Duplicate join ignored");
            return;
        }
        if join.protocol_version != PROTOCOL_VERSION {
            warn!(
                client_id = ?id,
                client = join.protocol_version,
                server = PROTOCOL_VERSION,
                "Protocol mismatch"
            );
            self.refuse(id, format!("protocol version {PROTOCOL_VERSION} required"));
            return;
        }
        match self.game.spawn_player(&join.name) {
            Ok(player) => {
                if let Some(conn) = self.connections.get_mut(&id) {
                    conn.player = Some(player);
                }
                let world = self.game.world_size();
                self.send_control(
                    id,
                    NetMessage::Joined(JoinedPacket {
                        player_id: player,
                        world_width: world.x,
                        world_height: world.y,
                    }),
                );
                info!(client_id = ?id, player = %player, name = %join.name, "Client joined");
            }
            Err(e) => {
                warn!(client_id = ?id, error = %e, "Join refused");
                self.refuse(id, e.to_string());
            }
        }
    }

    /// Sends a Disconnect and stops talking to the client. The writer
    /// flushes what is queued, then closes the socket.
    fn refuse(&mut self, id: ClientId, reason: String) {
        self.send_control(id, NetMessage::Disconnect(DisconnectPacket { reason }));
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.outbound = None;
        }
    }

    fn send_control(&mut self, id: ClientId, message: NetMessage) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        let frame = match encode_frame(&self.registry, &[message], CONTROL_FRAME_BYTES) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(client_id = ?id, error = %e, "Failed to encode control packet");
                return;
            }
        };
        if conn.deliver(frame) == Delivery::Stalled {
            warn!(client_id = ?id, "Outbound queue full, control packet dropped");
        }
    }

    fn drop_connection(&mut self, id: ClientId, why: &str) {
        if let Some(conn) = self.connections.remove(&id) {
            if let Some(player) = conn.player {
                self.game.remove_player(player);
            }
            info!(client_id = ?id, addr = %conn.addr, why, "Connection dropped");
        }
    }

    fn send_updates(&mut self) {
        let mut order = Vec::new();
        let mut viewers = Vec::new();
        for (id, conn) in self.connections.iter_mut() {
            let Some(player) = conn.player else {
                continue;
            };
            if conn.is_inert() {
                continue;
            }
            order.push(*id);
            viewers.push((player, &mut conn.viewer));
        }

        let results = self.game.serve_viewers(viewers);
        for (id, result) in order.into_iter().zip(results) {
            let Some(conn) = self.connections.get_mut(&id) else {
                continue;
            };
            match result {
                Ok(Some(frame)) => match conn.deliver(frame) {
                    Delivery::Queued => {}
                    Delivery::Stalled => {
                        warn!(client_id = ?id, "Outbound queue full, update dropped");
                        conn.viewer.update_lost();
                    }
                    Delivery::Inert => debug!(client_id = ?id, "Writer gone, update discarded"),
                },
                Ok(None) => {}
                Err(e) => warn!(client_id = ?id, error = %e, "Update dropped"),
            }
        }
    }
}

impl Drop for GameServer {
    fn drop(&mut self) {
        // Owns the JoinSet holding every reader and writer task.
        self.accept_task.abort();
    }
}

async fn accept_loop(listener: ReliableListener, tx: mpsc::Sender<InboundEvent>) {
    let mut tasks = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (conn, addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        continue;
                    }
                };
                let id = ClientId::new_unique();
                let (reader, writer) = conn.into_split();
                let (outbound, queue) = mpsc::channel(OUTBOUND_QUEUE);
                // Connected must reach the tick loop before any of its frames.
                if tx.send(InboundEvent::Connected { id, addr, outbound }).await.is_err() {
                    break;
                }
                tasks.spawn(write_loop(id, writer, queue));
                tasks.spawn(read_loop(id, reader, tx.clone()));
            }
            Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
        }
    }
}

async fn read_loop(id: ClientId, mut reader: FrameReader, tx: mpsc::Sender<InboundEvent>) {
    loop {
        match reader.read_frame().await {
            Ok(Some(frame)) => {
                if tx.send(InboundEvent::Frame { id, frame }).await.is_err() {
                    return;
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(client_id = ?id, error = %e, "Read failed");
                break;
            }
        }
    }
    let _ = tx.send(InboundEvent::Closed { id }).await;
}

async fn write_loop(id: ClientId, mut writer: FrameWriter, mut queue: mpsc::Receiver<Bytes>) {
    while let Some(frame) = queue.recv().await {
        if let Err(e) = writer.write_frame(&frame).await {
            debug!(client_id = ?id, error = %e, "Write failed");
            return;
        }
    }
    let _ = writer.shutdown().await;
}

/// Helper for tests: bind to an ephemeral port.
pub async fn bind_ephemeral(tick_hz: u32) -> anyhow::Result<(GameServer, ServerConfig)> {
    bind_ephemeral_with(ServerConfig {
        tick_hz,
        ..Default::default()
    })
    .await
}

/// Like [`bind_ephemeral`], keeping every other field of `cfg`.
pub async fn bind_ephemeral_with(cfg: ServerConfig) -> anyhow::Result<(GameServer, ServerConfig)> {
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
    let listener = ReliableListener::bind(addr).await?;
    let server = GameServer::with_listener(cfg, listener)?;
    let cfg = server.cfg.clone();
    Ok((server, cfg))
}

#[cfg(test)]
mod tests {
    use shooter_shared::{
        net::ReliableConn,
        packets::{PingPacket, UpdatePacket},
    };

    use super::*;

    fn small_world() -> ServerConfig {
        ServerConfig {
            obstacle_count: 10,
            loot_count: 5,
            seed: 3,
            ..Default::default()
        }
    }

    async fn pump_until<F: Fn(&GameServer) -> bool>(server: &mut GameServer, done: F) {
        for _ in 0..200 {
            server.step(1.0 / 30.0).unwrap();
            if done(server) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    fn frame(registry: &Arc<PacketRegistry>, message: NetMessage) -> Bytes {
        encode_frame(registry, &[message], 256).unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn join_spawns_player_and_streams_updates() -> anyhow::Result<()> {
        let (mut server, cfg) = bind_ephemeral_with(small_world()).await?;
        let registry = Arc::new(PacketRegistry::standard());
        let mut conn = ReliableConn::connect(cfg.server_addr.parse()?).await?;
        conn.send(&frame(
            &registry,
            JoinPacket {
                protocol_version: PROTOCOL_VERSION,
                name: "alice".into(),
            }
            .into(),
        ))
        .await?;

        pump_until(&mut server, |s| s.game().player_count() == 1).await;

        let joined = decode_frame(&registry, &conn.recv().await?)?;
        let player_id = match &joined[..] {
            [NetMessage::Joined(j)] => j.player_id,
            other => panic!("unexpected {other:?}"),
        };
        // The tick that spawned the player also served it.
        let update: UpdatePacket = match decode_frame(&registry, &conn.recv().await?)?.remove(0) {
            NetMessage::Update(u) => u,
            other => panic!("unexpected {other:?}"),
        };
        assert!(update.full_objects.iter().any(|e| e.id == player_id));
        assert!(update.player_data.is_some());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn wrong_version_is_refused() -> anyhow::Result<()> {
        let (mut server, cfg) = bind_ephemeral_with(small_world()).await?;
        let registry = Arc::new(PacketRegistry::standard());
        let mut conn = ReliableConn::connect(cfg.server_addr.parse()?).await?;
        conn.send(&frame(
            &registry,
            JoinPacket {
                protocol_version: PROTOCOL_VERSION + 1,
                name: "old".into(),
            }
            .into(),
        ))
        .await?;

        pump_until(&mut server, |s| s.connections.values().any(|c| c.is_inert())).await;
        match decode_frame(&registry, &conn.recv().await?)?.remove(0) {
            NetMessage::Disconnect(d) => assert!(d.reason.contains("protocol")),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(server.game().player_count(), 0);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn malformed_frames_are_dropped_and_ping_is_echoed() -> anyhow::Result<()> {
        let (mut server, cfg) = bind_ephemeral_with(small_world()).await?;
        let registry = Arc::new(PacketRegistry::standard());
        let mut conn = ReliableConn::connect(cfg.server_addr.parse()?).await?;
        // Unknown tag.
        conn.send(&[0xEE, 0x01]).await?;
        conn.send(&frame(&registry, PingPacket { timestamp: 77 }.into()))
            .await?;

        let reply = tokio::spawn(async move { conn.recv().await });
        for _ in 0..50 {
            server.step(1.0 / 30.0)?;
            if reply.is_finished() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let bytes = reply.await??;
        assert_eq!(
            decode_frame(&registry, &bytes)?,
            vec![NetMessage::Ping(PingPacket { timestamp: 77 })]
        );
        assert_eq!(server.client_count(), 1);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn closing_the_socket_removes_the_player() -> anyhow::Result<()> {
        let (mut server, cfg) = bind_ephemeral_with(small_world()).await?;
        let registry = Arc::new(PacketRegistry::standard());
        let mut conn = ReliableConn::connect(cfg.server_addr.parse()?).await?;
        conn.send(&frame(
            &registry,
            JoinPacket {
                protocol_version: PROTOCOL_VERSION,
                name: "bob".into(),
            }
            .into(),
        ))
        .await?;
        pump_until(&mut server, |s| s.game().player_count() == 1).await;

        drop(conn);
        pump_until(&mut server, |s| s.game().player_count() == 0).await;
        assert_eq!(server.client_count(), 0);
        Ok(())
    }
}

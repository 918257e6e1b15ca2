//! Full socket-based integration tests for client ↔ server communication.

use std::time::Duration;

use shooter_client::input::InputState;
use shooter_client::GameClient;
use shooter_server::server::bind_ephemeral_with;
use shooter_server::GameServer;
use shooter_shared::config::{ClientConfig, ServerConfig};
use shooter_shared::object::ObjectKind;
use tokio::{sync::oneshot, task::JoinHandle};

const TICK_HZ: u32 = 60;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();
}

/// Steps the server in the background until `stop` fires, then hands it back.
async fn spawn_server(
    cfg: ServerConfig,
) -> anyhow::Result<(String, oneshot::Sender<()>, JoinHandle<anyhow::Result<GameServer>>)> {
    let (mut server, cfg) = bind_ephemeral_with(ServerConfig {
        tick_hz: TICK_HZ,
        ..cfg
    })
    .await?;
    let (stop, mut stopped) = oneshot::channel();
    let handle = tokio::spawn(async move {
        let dt = Duration::from_secs_f32(1.0 / TICK_HZ as f32);
        while stopped.try_recv().is_err() {
            server.step(dt.as_secs_f32())?;
            tokio::time::sleep(dt).await;
        }
        Ok::<_, anyhow::Error>(server)
    });
    Ok((cfg.server_addr, stop, handle))
}

fn client_cfg(server_addr: &str, name: &str) -> ClientConfig {
    ClientConfig {
        server_addr: server_addr.to_string(),
        player_name: name.to_string(),
        tick_hz: TICK_HZ,
    }
}

/// Polls until `done` holds or about three seconds pass.
async fn poll_until(
    client: &mut GameClient,
    done: impl Fn(&GameClient) -> bool,
) -> anyhow::Result<bool> {
    for _ in 0..150 {
        client.poll(Duration::from_millis(20)).await?;
        if done(client) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Full integration: join, receive the world, walk, and see the move echoed.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_server_full_roundtrip() -> anyhow::Result<()> {
    init_tracing();
    let (addr, stop, server) = spawn_server(ServerConfig {
        obstacle_count: 0,
        loot_count: 0,
        ..Default::default()
    })
    .await?;

    let mut client = GameClient::connect(&client_cfg(&addr, "walker")).await?;
    let me = client.player_id;
    assert!(poll_until(&mut client, |c| c.world.contains(c.player_id)).await?);
    assert_eq!(client.world.alive_count(), Some(1));
    let data = client.world.player_data().expect("player data with first update");
    assert_eq!(data.kills, 0);

    let start = client.world.get(me).unwrap().position();
    let walk = InputState {
        // Walk away from the nearer vertical edge.
        right: start.x < client.world_size.x / 2.0,
        left: start.x >= client.world_size.x / 2.0,
        ..Default::default()
    };
    let mut moved = false;
    for _ in 0..150 {
        client.send_input(walk).await?;
        client.poll(Duration::from_millis(20)).await?;
        let now = client.world.get(me).unwrap().position();
        if (now.x - start.x).abs() > 2.0 {
            moved = true;
            break;
        }
    }
    assert!(moved, "player never moved");
    assert_eq!(client.world.get(me).unwrap().position().y, start.y);

    client.ping().await?;
    assert!(poll_until(&mut client, |c| c.last_rtt().is_some()).await?);

    let _ = stop.send(());
    let server = server.await??;
    assert_eq!(server.game().player_count(), 1);
    Ok(())
}

/// With a view covering the whole map, a client mirrors every obstacle.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_mirrors_visible_obstacles() -> anyhow::Result<()> {
    init_tracing();
    let cfg = ServerConfig {
        obstacle_count: 40,
        loot_count: 5,
        view_radius: 1024.0,
        seed: 21,
        ..Default::default()
    };
    let (addr, stop, server) = spawn_server(cfg).await?;

    let mut client = GameClient::connect(&client_cfg(&addr, "looker")).await?;
    assert!(poll_until(&mut client, |c| c.world.count_of(ObjectKind::Obstacle) > 0).await?);

    let _ = stop.send(());
    let server = server.await??;
    let obstacles = server
        .game()
        .objects()
        .iter()
        .filter(|(_, o)| o.as_obstacle().is_some())
        .count();
    assert_eq!(client.world.count_of(ObjectKind::Obstacle), obstacles);
    assert!(client.world.count_of(ObjectKind::Loot) <= 5);
    Ok(())
}

/// Players see each other, and a leaving player is deleted from the other's
/// world.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn departure_is_replicated_as_delete() -> anyhow::Result<()> {
    init_tracing();
    let (addr, stop, server) = spawn_server(ServerConfig {
        obstacle_count: 0,
        loot_count: 0,
        view_radius: 1024.0,
        ..Default::default()
    })
    .await?;

    let mut a = GameClient::connect(&client_cfg(&addr, "a")).await?;
    let mut b = GameClient::connect(&client_cfg(&addr, "b")).await?;
    let a_id = a.player_id;
    let b_id = b.player_id;
    assert_ne!(a_id, b_id);

    assert!(poll_until(&mut a, |c| c.world.contains(b_id)).await?);
    assert!(poll_until(&mut b, |c| c.world.contains(a_id)).await?);
    assert!(poll_until(&mut b, |c| c.world.alive_count() == Some(2)).await?);

    a.disconnect("done").await?;
    assert!(!a.is_connected());
    assert!(poll_until(&mut b, |c| !c.world.contains(a_id)).await?);
    assert!(poll_until(&mut b, |c| c.world.alive_count() == Some(1)).await?);

    let _ = stop.send(());
    let server = server.await??;
    assert_eq!(server.game().player_count(), 1);
    Ok(())
}

/// Joining with an empty name is rejected before any socket is opened.
#[tokio::test]
async fn empty_name_is_rejected_locally() {
    let err = GameClient::connect(&client_cfg("127.0.0.1:1", "  "))
        .await
        .err()
        .expect("connect should fail");
    assert!(format!("{err:#}").contains("invalid client config"));
}

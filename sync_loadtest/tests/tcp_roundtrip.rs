//! Full socket-based integration tests for client and server.

use std::time::Duration;

use sync_client::{
    client::{ClientEvent, GameClient},
    chunks::ChunkEvent,
    connection::{static_credential, ConnectionEvent},
};
use sync_loadtest::LoadTestHarness;
use sync_server::{bind_ephemeral, world::WorldConfig};
use sync_shared::{
    chunk::PartitionKey,
    config::{LoadTestConfig, SyncConfig},
    render::NullScene,
    transport::TcpTransport,
};

const WAIT: Duration = Duration::from_secs(10);

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_authenticates_and_loads_a_chunk_over_tcp() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();

    let (server, addr) = bind_ephemeral(WorldConfig::default()).await?;
    let world = server.world();
    let server_task = tokio::spawn(server.run());

    let client = GameClient::spawn(
        &SyncConfig::default(),
        TcpTransport::new(addr.to_string()),
        static_credential("tcp-player"),
        NullScene::default(),
    );
    let mut events = client.subscribe();
    client.connect().await?;

    let mut authenticated = false;
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await? {
                ClientEvent::Connection(ConnectionEvent::Authenticated { .. }) => authenticated = true,
                ClientEvent::Chunk(ChunkEvent::PartitionLoaded { key, .. }) => {
                    assert_eq!(key, PartitionKey::new(0, 0));
                    break;
                }
                _ => {}
            }
        }
        anyhow::Ok(())
    })
    .await??;
    assert!(authenticated);
    assert_eq!(world.stats().online_players, 1);

    let stats = client.stats().await?;
    assert!(stats.connection.messages_received >= 2);
    assert_eq!(stats.chunks.current_partition, Some(PartitionKey::new(0, 0)));

    client.shutdown().await;
    tokio::time::timeout(WAIT, async {
        while world.stats().connections > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;

    server_task.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn small_load_test_over_tcp() -> anyhow::Result<()> {
    let (server, addr) = bind_ephemeral(WorldConfig::default()).await?;
    let world = server.world();
    let server_task = tokio::spawn(server.run());

    let url = addr.to_string();
    let config = LoadTestConfig {
        server_url: url.clone(),
        max_concurrent_players: 3,
        test_duration_secs: 1,
        ramp_up_secs: 0,
        ramp_down_secs: 0,
        movement_interval_ms: 100,
        ..Default::default()
    };
    let harness = LoadTestHarness::new(config, move |_: u32| TcpTransport::new(url.clone()));
    let summary = harness.start_load_test().await?;

    assert_eq!(summary.total_players_created, 3);
    assert_eq!(summary.successful_connections, 3);
    assert_eq!(summary.sessions_left_running, 0);
    assert!(summary.total_movements > 0);

    tokio::time::timeout(WAIT, async {
        while world.stats().connections > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;
    server_task.abort();
    Ok(())
}

//! Pool Failover Integration Tests
//!
//! Registration, round-robin selection, echo liveness and reconnection

use async_trait::async_trait;
use brivas_appconn::message::ECHO_CALL;
use brivas_appconn::{
    AppClient, AppServer, ClientConfig, ConnState, Connection, DispatchError, EchoConfig,
    Message, ServerConfig, Task, TaskRegistry,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

const SERVER_ID: i32 = 7;
const CLIENT_ID: i32 = 3;

async fn spawn_server(port: u16, local_id: i32, tasks: Arc<TaskRegistry>) -> (AppServer, u16) {
    let config = ServerConfig {
        bind_address: "127.0.0.1".to_string(),
        port,
        local_id,
        ..ServerConfig::default()
    };
    let server = AppServer::bind(config, tasks).await.unwrap();
    let port = server.local_addr().unwrap().port();
    let runner = server.clone();
    tokio::spawn(async move { runner.run().await });
    (server, port)
}

fn client_config(port: u16, size: u16) -> ClientConfig {
    ClientConfig {
        address: "127.0.0.1".to_string(),
        port,
        size,
        registrable: true,
        persistent: false,
        connect_timeout_ms: 1_000,
        ..ClientConfig::default()
    }
}

async fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    timeout(Duration::from_secs(8), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

/// Echo responder that never answers in time
struct Silent;

#[async_trait]
impl Task for Silent {
    async fn execute(&self, _conn: &Connection, _msg: &Message) -> anyhow::Result<Option<Message>> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(Some(Message::echo_ret()))
    }
}

#[tokio::test]
async fn test_registration_refused() {
    let (_server, port) = spawn_server(0, SERVER_ID, Arc::new(TaskRegistry::new())).await;
    // addressed to the wrong peer
    let client = AppClient::new(
        CLIENT_ID,
        SERVER_ID + 1,
        Arc::new(TaskRegistry::new()),
        client_config(port, 1),
    )
    .unwrap();

    let conn = Connection::new(
        CLIENT_ID,
        SERVER_ID + 1,
        0,
        Arc::clone(client.tasks()),
        client.config(),
    );
    let err = conn.start().await.unwrap_err();
    assert!(matches!(
        err,
        DispatchError::RegistrationRefused { remote_id, index: 0 } if remote_id == SERVER_ID + 1
    ));
    assert_eq!(conn.state(), ConnState::Offline);

    client.start().await;
    assert_eq!(client.size(), 1);
    assert_eq!(client.state(), ConnState::Offline);
    assert!(matches!(
        client.dispatch(Message::echo_call()).await,
        Err(DispatchError::NoHealthyConnection { .. })
    ));
}

#[tokio::test]
async fn test_round_robin_skips_offline_member() {
    let (_server, port) = spawn_server(0, SERVER_ID, Arc::new(TaskRegistry::new())).await;
    let tasks = Arc::new(TaskRegistry::new());
    let client = AppClient::new(CLIENT_ID, SERVER_ID, tasks, client_config(port, 3)).unwrap();
    client.start().await;
    assert_eq!(client.stats().online, 3);

    let all: Vec<i16> = (0..6).filter_map(|_| client.next()).map(|c| c.index()).collect();
    assert_eq!(all, vec![0, 1, 2, 0, 1, 2]);

    client.get(1).unwrap().interrupt().await;
    let picks: Vec<i16> = (0..6).filter_map(|_| client.next()).map(|c| c.index()).collect();
    assert_eq!(picks.len(), 6);
    assert!(!picks.contains(&1));
    assert_eq!(picks.iter().filter(|&&i| i == 0).count(), 3);
    assert_eq!(picks.iter().filter(|&&i| i == 2).count(), 3);

    // a check cycle restarts the offline member
    client.check().await;
    assert!(client.get(1).unwrap().is_connected());
    assert_eq!(client.state(), ConnState::Online);
    let picks: Vec<i16> = (0..3).filter_map(|_| client.next()).map(|c| c.index()).collect();
    assert!(picks.contains(&1));

    client.interrupt().await;
    assert_eq!(client.size(), 0);
}

#[tokio::test]
async fn test_pool_online_with_partial_members() {
    let (_server, port) = spawn_server(0, SERVER_ID, Arc::new(TaskRegistry::new())).await;
    let config = ClientConfig {
        index: 4,
        ..client_config(port, 2)
    };
    let tasks = Arc::new(TaskRegistry::new());
    let client = AppClient::new(CLIENT_ID, SERVER_ID, tasks, config).unwrap();
    client.start().await;

    let indexes: Vec<i16> = client.members().iter().map(Connection::index).collect();
    assert_eq!(indexes, vec![4, 5]);

    client.get(4).unwrap().interrupt().await;
    assert!(client.dispatch(Message::echo_call()).await.unwrap().is_some());
    assert_eq!(client.next().map(|c| c.index()), Some(5));
    client.interrupt().await;
}

#[tokio::test]
async fn test_echo_failures_tear_down_connection() {
    let tasks = Arc::new(TaskRegistry::new());
    tasks.register(ECHO_CALL, Silent);
    let (server, port) = spawn_server(0, SERVER_ID, tasks).await;

    let config = ClientConfig {
        echo: EchoConfig {
            period_ms: 100,
            max_failed: 2,
            time_to_live: 1,
        },
        ..client_config(port, 1)
    };
    let tasks = Arc::new(TaskRegistry::new());
    let client = AppClient::new(CLIENT_ID, SERVER_ID, tasks, config).unwrap();
    client.start().await;
    let conn = client.get(0).unwrap();
    assert!(conn.is_connected());

    wait_for("echo teardown", || !conn.is_connected()).await;
    assert_eq!(conn.state(), ConnState::Offline);
    assert_eq!(conn.pending_calls(), 0);

    // the peer sees the socket close
    wait_for("peer session closed", || server.session_count() == 0).await;
    client.interrupt().await;
}

#[tokio::test]
async fn test_answered_echo_keeps_connection() {
    let (_server, port) = spawn_server(0, SERVER_ID, Arc::new(TaskRegistry::new())).await;
    let config = ClientConfig {
        echo: EchoConfig {
            period_ms: 50,
            max_failed: 1,
            time_to_live: 1,
        },
        ..client_config(port, 1)
    };
    let tasks = Arc::new(TaskRegistry::new());
    let client = AppClient::new(CLIENT_ID, SERVER_ID, tasks, config).unwrap();
    client.start().await;

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(client.get(0).unwrap().is_connected());
    client.interrupt().await;
}

#[tokio::test]
async fn test_persistent_pool_reconnects() {
    let port = {
        let reserved = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        reserved.local_addr().unwrap().port()
    };
    let config = ClientConfig {
        persistent: true,
        check_period_ms: 100,
        connect_timeout_ms: 200,
        ..client_config(port, 2)
    };
    let tasks = Arc::new(TaskRegistry::new());
    let client = AppClient::new(CLIENT_ID, SERVER_ID, tasks, config).unwrap();
    client.start().await;
    assert_eq!(client.state(), ConnState::Offline);
    assert_eq!(client.size(), 2);

    let (_server, _) = spawn_server(port, SERVER_ID, Arc::new(TaskRegistry::new())).await;
    wait_for("pool online", || {
        client.state() == ConnState::Online && client.stats().online == 2
    })
    .await;

    client.interrupt().await;
    assert_eq!(client.state(), ConnState::Offline);
    assert_eq!(client.size(), 0);
}

#[tokio::test]
async fn test_interrupt_goes_offline_before_teardown() {
    let (_server, port) = spawn_server(0, SERVER_ID, Arc::new(TaskRegistry::new())).await;
    let config = ClientConfig {
        persistent: true,
        check_period_ms: 60_000,
        ..client_config(port, 2)
    };
    let tasks = Arc::new(TaskRegistry::new());
    let client = AppClient::new(CLIENT_ID, SERVER_ID, tasks, config).unwrap();
    client.start().await;
    assert_eq!(client.state(), ConnState::Online);

    let stopping = {
        let client = client.clone();
        tokio::spawn(async move { client.interrupt().await })
    };
    for _ in 0..100 {
        if client.state() == ConnState::Offline {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(client.state(), ConnState::Offline);
    // members are still being torn down
    assert_eq!(client.size(), 2);

    stopping.await.unwrap();
    assert_eq!(client.size(), 0);
}

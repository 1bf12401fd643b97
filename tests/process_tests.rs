use async_trait::async_trait;
use atelier::config::AtelierConfig;
use atelier::interpreter::{InterpreterFactory, RemoteContext, ResultCode};
use atelier::lifecycle::{LifecycleManager, ShutdownTarget, TimeoutLifecycleManager};
use atelier::process::{InterpreterClient, ProcessManager};
use atelier::recovery::{ProcessRegistration, RecoveryStorage, SqliteRecoveryStorage};
use atelier::server::InterpreterServer;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn resources_round_trip_over_rpc() {
    let server = InterpreterServer::new("g1", InterpreterFactory::with_defaults());
    server
        .create_interpreter("g1", "note1", "sh", &HashMap::new(), "alice")
        .unwrap();
    server
        .group()
        .unwrap()
        .resource_pool()
        .put(Some("note1"), Some("p1"), "x", "hello");
    let handle = server.start("127.0.0.1", 0, None).await.unwrap();

    let client = InterpreterClient::connect("g1", "127.0.0.1", handle.addr.port(), Duration::from_secs(5))
        .await
        .unwrap();

    let bytes = client.resource_get(Some("note1"), Some("p1"), "x").await.unwrap();
    let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(value, "hello");
    assert!(client.resource_get(Some("note1"), Some("p1"), "missing").await.unwrap().is_empty());

    assert!(client.resource_remove(Some("note1"), Some("p1"), "x").await.unwrap());
    assert!(!client.resource_remove(Some("note1"), Some("p1"), "x").await.unwrap());

    server.shutdown().await.unwrap();
    handle.wait().await;
}

#[tokio::test]
async fn interpret_calls_on_one_session_are_serialized() {
    let server = InterpreterServer::new("g1", InterpreterFactory::with_defaults());
    let handle = server.start("127.0.0.1", 0, None).await.unwrap();
    let client = Arc::new(
        InterpreterClient::connect("g1", "127.0.0.1", handle.addr.port(), Duration::from_secs(5))
            .await
            .unwrap(),
    );
    client
        .create_interpreter("note1", "sh", HashMap::new(), "alice")
        .await
        .unwrap();

    let started = Instant::now();
    let calls: Vec<_> = ["p1", "p2"]
        .into_iter()
        .map(|paragraph| {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .interpret(
                        "note1",
                        "sh",
                        &format!("sleep 0.3; echo {}", paragraph),
                        RemoteContext::new("note1", paragraph),
                    )
                    .await
            })
        })
        .collect();

    for (call, paragraph) in calls.into_iter().zip(["p1", "p2"]) {
        let result = call.await.unwrap().unwrap();
        assert_eq!(result.code, ResultCode::Success);
        assert!(result.text().contains(paragraph));
    }
    assert!(started.elapsed() >= Duration::from_millis(600));

    server.shutdown().await.unwrap();
    handle.wait().await;
}

#[derive(Default)]
struct CountingTarget {
    shutdowns: AtomicUsize,
}

#[async_trait]
impl ShutdownTarget for CountingTarget {
    async fn shutdown(&self) -> atelier::Result<()> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn idle_process_is_shut_down_once() {
    let counting = Arc::new(CountingTarget::default());
    let target: Arc<dyn ShutdownTarget> = counting.clone();
    let manager = TimeoutLifecycleManager::start(
        Arc::downgrade(&target),
        Duration::from_millis(200),
        Duration::from_millis(1_000),
    );
    manager.on_process_started("g1");

    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert_eq!(counting.shutdowns.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(counting.shutdowns.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn stale_registration_is_purged_and_group_relaunches() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(SqliteRecoveryStorage::open(dir.path()).unwrap());
    let stale_port = free_port();
    storage
        .on_client_start(&ProcessRegistration::new("g1", "127.0.0.1", stale_port))
        .unwrap();

    let mut config = AtelierConfig::default();
    config.launch_command = vec![env!("CARGO_BIN_EXE_atelier").to_string(), "interpreter".to_string()];
    config.connect_timeout = Duration::from_secs(20);
    config.recovery_dir = dir.path().to_path_buf();

    let manager = ProcessManager::new(config, storage.clone(), None);
    manager.start(0).await.unwrap();

    assert!(manager.restore().await.is_empty());
    assert!(storage.load_all().unwrap().is_empty());

    let result = manager
        .interpret(
            "g1",
            "note1",
            "sh",
            HashMap::new(),
            "alice",
            "echo relaunched",
            RemoteContext::new("note1", "p1"),
        )
        .await
        .unwrap();
    assert_eq!(result.code, ResultCode::Success);
    assert!(result.text().contains("relaunched"));

    let stored = storage.load_all().unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].group_id, "g1");
    assert_ne!(stored[0].port, stale_port);

    manager.shutdown(true).await;
    assert!(storage.load_all().unwrap().is_empty());
}

#[tokio::test]
async fn restarted_controller_reattaches_to_running_process() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(SqliteRecoveryStorage::open(dir.path()).unwrap());

    let mut config = AtelierConfig::default();
    config.launch_command = vec![env!("CARGO_BIN_EXE_atelier").to_string(), "interpreter".to_string()];
    config.connect_timeout = Duration::from_secs(20);
    config.recovery_dir = dir.path().to_path_buf();

    let first = ProcessManager::new(config.clone(), storage.clone(), None);
    first.start(0).await.unwrap();
    let result = first
        .interpret(
            "g1",
            "note1",
            "sh",
            HashMap::new(),
            "alice",
            "echo first",
            RemoteContext::new("note1", "p1"),
        )
        .await
        .unwrap();
    assert_eq!(result.code, ResultCode::Success);
    let port = first.get("g1").unwrap().port();
    first.shutdown(false).await;

    let second = ProcessManager::new(config, storage.clone(), None);
    second.start(0).await.unwrap();
    assert_eq!(second.restore().await, vec!["g1".to_string()]);
    assert_eq!(second.get("g1").unwrap().port(), port);

    let result = second
        .interpret(
            "g1",
            "note1",
            "sh",
            HashMap::new(),
            "alice",
            "echo second",
            RemoteContext::new("note1", "p2"),
        )
        .await
        .unwrap();
    assert!(result.text().contains("second"));

    second.shutdown(true).await;
}

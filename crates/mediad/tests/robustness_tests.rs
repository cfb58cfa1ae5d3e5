//! Robustness tests for the daemon's client handling.
//!
//! These tests verify the daemon handles protocol violations and awkward
//! clients without affecting anyone else:
//! - Oversized commands
//! - Unknown commands and wrong argument shapes
//! - Commands split across many writes or batched into one
//! - Rapid connect/disconnect
//! - Disabled poweroff
//!
//! Tests CAN use `.unwrap()` and `.expect()` - this is allowed.

use std::path::PathBuf;
use std::time::Duration;

use mediad::config::DaemonConfig;
use mediad::monitor::scripted::ScriptedBackend;
use mediad::monitor::DeviceMonitor;
use mediad::mounts::{MountOrchestrator, MountRequest, MountTableError};
use mediad::server::DaemonServer;
use mediad_core::{DeviceRecord, DeviceSubtype, ErrorCode, MountEntry};
use mediad_protocol::MAX_COMMAND_LENGTH;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

// ============================================================================
// Constants
// ============================================================================

const SOCKET_WAIT_TIMEOUT: Duration = Duration::from_millis(500);
const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(10);
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_millis(100);
const RECV_TIMEOUT: Duration = Duration::from_secs(2);

// ============================================================================
// Test Helpers
// ============================================================================

struct NoMounts;

impl MountOrchestrator for NoMounts {
    fn mount(&mut self, _request: &MountRequest) -> Result<(), ErrorCode> {
        Err(ErrorCode::MountPointBusy)
    }

    fn unmount(&mut self, _device: &str, _mount_point: &str) -> Result<(), ErrorCode> {
        Err(ErrorCode::GenericError)
    }

    fn poweroff(&mut self, _device: &str) -> Result<(), ErrorCode> {
        Ok(())
    }

    fn current_mounts(&self) -> Result<Vec<MountEntry>, MountTableError> {
        Ok(Vec::new())
    }
}

struct TestServer {
    socket_path: PathBuf,
    cancel_token: CancellationToken,
    _temp_dir: TempDir,
}

impl TestServer {
    async fn spawn() -> Self {
        Self::spawn_with_poweroff(true).await
    }

    async fn spawn_with_poweroff(enable_poweroff: bool) -> Self {
        let temp_dir = tempfile::tempdir().expect("create temp dir");
        let config = DaemonConfig {
            socket_path: temp_dir.path().join("test.sock"),
            mount_dir: temp_dir.path().join("media"),
            enable_poweroff,
            ..DaemonConfig::default()
        };

        let initial = vec![
            DeviceRecord::stateless("/dev/sdb", DeviceSubtype::RemovableDisk).unwrap(),
            DeviceRecord::partition("/dev/sdb1", "/dev/sdb", Some("vfat".to_string()), None)
                .unwrap(),
        ];
        let (backend, handle) = ScriptedBackend::new(initial).expect("scripted backend");
        let cancel_token = CancellationToken::new();

        let server = DaemonServer::new(
            &config,
            DeviceMonitor::new(backend),
            NoMounts,
            cancel_token.clone(),
        )
        .with_mount_poll_interval(Duration::from_secs(60));

        tokio::spawn(async move {
            // The handle must outlive the server or the backend reads EOF.
            let _handle = handle;
            let _ = server.run().await;
        });

        let start = tokio::time::Instant::now();
        while start.elapsed() < SOCKET_WAIT_TIMEOUT {
            if config.socket_path.exists() {
                break;
            }
            sleep(SOCKET_POLL_INTERVAL).await;
        }

        assert!(config.socket_path.exists(), "Server socket did not appear");

        TestServer {
            socket_path: config.socket_path,
            cancel_token,
            _temp_dir: temp_dir,
        }
    }

    async fn connect(&self) -> TestClient {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .expect("connect to server");
        TestClient::new(stream)
    }

    async fn shutdown(self) {
        self.cancel_token.cancel();
        sleep(SHUTDOWN_GRACE_PERIOD).await;
    }
}

struct TestClient {
    reader: BufReader<tokio::net::unix::OwnedReadHalf>,
    writer: tokio::net::unix::OwnedWriteHalf,
}

impl TestClient {
    fn new(stream: UnixStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    async fn send_raw(&mut self, data: &[u8]) {
        self.writer.write_all(data).await.unwrap();
        self.writer.flush().await.unwrap();
    }

    async fn send(&mut self, line: &str) {
        self.send_raw(format!("{line}\n").as_bytes()).await;
    }

    async fn recv(&mut self) -> String {
        let mut line = String::new();
        let n = timeout(RECV_TIMEOUT, self.reader.read_line(&mut line))
            .await
            .expect("line within timeout")
            .unwrap();
        assert!(n > 0, "connection closed unexpectedly");
        line.trim_end_matches('\n').to_string()
    }

    /// Reads until the daemon closes; returns whatever arrived first.
    async fn read_until_closed(&mut self) -> Vec<u8> {
        let mut received = Vec::new();
        let _ = timeout(RECV_TIMEOUT, self.reader.read_to_end(&mut received))
            .await
            .expect("daemon closes the connection");
        received
    }

    async fn list_all_ok(&mut self) {
        self.send("list_all_removable_devices()").await;
        assert_eq!(self.recv().await, "started(\"list_all_removable_devices\")");
        assert!(self.recv().await.starts_with("removable_device("));
        assert!(self.recv().await.starts_with("removable_device("));
        assert_eq!(self.recv().await, "finished(\"list_all_removable_devices\")");
    }
}

// ============================================================================
// Framing Tests
// ============================================================================

#[tokio::test]
async fn test_overflow_closes_without_response() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;

    client.send_raw(&vec![b'a'; MAX_COMMAND_LENGTH]).await;
    assert!(client.read_until_closed().await.is_empty());

    server.shutdown().await;
}

#[tokio::test]
async fn test_longest_command_is_accepted() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;

    // A path long enough that the command fills all but one byte.
    let overhead = "unmount(\"\")".len();
    let path = format!("/dev/{}", "x".repeat(MAX_COMMAND_LENGTH - 1 - overhead - 5));
    let command = format!("unmount(\"{path}\")");
    assert_eq!(command.len(), MAX_COMMAND_LENGTH - 1);

    client.send(&command).await;
    assert_eq!(
        client.recv().await,
        format!("failed(\"unmount\", \"{path}\", \"no_such_removable_device\")")
    );

    server.shutdown().await;
}

#[tokio::test]
async fn test_byte_by_byte_command() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;

    for byte in b"list_all_removable_devices()\n" {
        client.send_raw(std::slice::from_ref(byte)).await;
    }
    assert_eq!(client.recv().await, "started(\"list_all_removable_devices\")");
    assert!(client.recv().await.contains("/dev/sdb"));
    assert!(client.recv().await.contains("/dev/sdb1"));
    assert_eq!(client.recv().await, "finished(\"list_all_removable_devices\")");

    server.shutdown().await;
}

#[tokio::test]
async fn test_pipelined_commands_answered_in_order() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;

    client
        .send_raw(b"mount(\"/dev/sdz\", nil)\nunmount(\"/dev/sdb1\")\nmount(\"/dev/sdb1\", nil)\n")
        .await;
    assert_eq!(
        client.recv().await,
        "failed(\"mount\", \"/dev/sdz\", nil, \"no_such_removable_device\")"
    );
    assert_eq!(
        client.recv().await,
        "failed(\"unmount\", \"/dev/sdb1\", \"device_not_mounted\")"
    );
    assert_eq!(
        client.recv().await,
        "failed(\"mount\", \"/dev/sdb1\", nil, \"mount_point_busy\")"
    );

    server.shutdown().await;
}

// ============================================================================
// Protocol Violation Tests
// ============================================================================

#[tokio::test]
async fn test_unknown_command_closes_connection() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;

    client.send("format(\"/dev/sdb1\")").await;
    assert!(client.read_until_closed().await.is_empty());

    server.shutdown().await;
}

#[tokio::test]
async fn test_malformed_commands_close_connection() {
    let server = TestServer::spawn().await;

    for bad in [
        "mount(\"/dev/sdb1\")",
        "unmount(nil)",
        "list_all_removable_devices() trailing",
        "unmount(\"/dev/sdb1)",
        "list_all_removable_devices",
        "",
    ] {
        let mut client = server.connect().await;
        client.send(bad).await;
        assert!(
            client.read_until_closed().await.is_empty(),
            "expected silent close for {bad:?}"
        );
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_violation_does_not_affect_other_clients() {
    let server = TestServer::spawn().await;
    let mut good = server.connect().await;
    let mut bad = server.connect().await;

    good.list_all_ok().await;
    bad.send("eject(\"/dev/sdb\")").await;
    assert!(bad.read_until_closed().await.is_empty());

    good.list_all_ok().await;

    server.shutdown().await;
}

#[tokio::test]
async fn test_poweroff_disabled_closes_connection() {
    let server = TestServer::spawn_with_poweroff(false).await;
    let mut client = server.connect().await;

    client.send("poweroff(\"/dev/sdb\")").await;
    assert!(client.read_until_closed().await.is_empty());

    server.shutdown().await;
}

#[tokio::test]
async fn test_poweroff_enabled() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;

    client.send("poweroff(\"/dev/sdb\")").await;
    assert_eq!(client.recv().await, "succeeded(\"poweroff\", \"/dev/sdb\")");

    client.send("poweroff(\"/dev/sdb1\")").await;
    assert_eq!(
        client.recv().await,
        "failed(\"poweroff\", \"/dev/sdb1\", \"no_such_removable_device\")"
    );

    server.shutdown().await;
}

// ============================================================================
// Connection Churn Tests
// ============================================================================

#[tokio::test]
async fn test_rapid_connect_disconnect() {
    let server = TestServer::spawn().await;

    for _ in 0..50 {
        let client = server.connect().await;
        drop(client);
    }

    let mut client = server.connect().await;
    client.list_all_ok().await;

    server.shutdown().await;
}

#[tokio::test]
async fn test_client_closing_mid_command() {
    let server = TestServer::spawn().await;

    {
        let mut client = server.connect().await;
        client.send_raw(b"list_all_remov").await;
    }

    let mut client = server.connect().await;
    client.list_all_ok().await;

    server.shutdown().await;
}

#[tokio::test]
async fn test_many_concurrent_clients() {
    let server = TestServer::spawn().await;

    let mut clients = Vec::new();
    for _ in 0..20 {
        clients.push(server.connect().await);
    }
    for client in &mut clients {
        client.send("list_supported_filesystems()").await;
    }
    for client in &mut clients {
        assert_eq!(client.recv().await, "started(\"list_supported_filesystems\")");
        assert!(client.recv().await.starts_with("supported_filesystems("));
        assert_eq!(client.recv().await, "finished(\"list_supported_filesystems\")");
    }

    server.shutdown().await;
}

//! End-to-end tests for connection, channel and subsystem dispatch.
//!
//! Each test starts a real server on an ephemeral localhost port and talks
//! to it with a russh client. Most tests swap the sftp handler for
//! [`EchoTag`], which reads one line from the dispatched stream, echoes it
//! back and reports which channel it served.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use russh::client::{self, Handle};
use russh::keys::PublicKey;
use russh::{Channel, ChannelMsg, ChannelOpenFailure, Disconnect};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::timeout;

use sftpd::{Credentials, ProtocolError, ProtocolHandler, SftpProtocol, SshServer, SshServerConfig};

const USER: &str = "testuser";
const PASS: &str = "testpass";
const WAIT: Duration = Duration::from_secs(10);

// ============================================================================
// Shared test setup
// ============================================================================

/// Fake protocol handler: reads a tag line, answers `served:<tag>`, reports
/// the tag and returns.
#[derive(Clone)]
struct EchoTag {
    served: mpsc::UnboundedSender<String>,
}

impl EchoTag {
    fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (served, rx) = mpsc::unbounded_channel();
        (Self { served }, rx)
    }
}

impl ProtocolHandler for EchoTag {
    async fn serve<S>(&self, mut stream: S) -> Result<(), ProtocolError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut line = Vec::new();
        loop {
            let byte = stream.read_u8().await?;
            if byte == b'\n' {
                break;
            }
            line.push(byte);
        }
        let tag = String::from_utf8(line).map_err(|e| ProtocolError::Other(e.to_string()))?;

        stream.write_all(format!("served:{tag}\n").as_bytes()).await?;
        stream.flush().await?;
        let _ = self.served.send(tag);
        Ok(())
    }
}

struct TestClient;

impl client::Handler for TestClient {
    type Error = russh::Error;

    async fn check_server_key(&mut self, _server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Reply {
    Success,
    Failure,
    Closed,
}

async fn start_server<P: ProtocolHandler>(protocol: P) -> SocketAddr {
    let config = SshServerConfig::ephemeral(0, Credentials::new(USER, PASS)).unwrap();
    let server = SshServer::new(config, protocol);
    let listener = server.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { server.serve(listener).await });
    addr
}

/// Connect and try a password; returns the session and whether auth passed.
async fn connect(addr: SocketAddr, user: &str, pass: &str) -> (Handle<TestClient>, bool) {
    let config = Arc::new(client::Config::default());
    let mut session = client::connect(config, addr, TestClient).await.unwrap();
    let auth = session.authenticate_password(user, pass).await.unwrap();
    (session, auth.success())
}

async fn login(addr: SocketAddr) -> Handle<TestClient> {
    let (session, ok) = connect(addr, USER, PASS).await;
    assert!(ok, "valid credentials were rejected");
    session
}

/// Wait for the server's answer to the last request on `channel`.
async fn reply(channel: &mut Channel<client::Msg>) -> Reply {
    loop {
        let msg = timeout(WAIT, channel.wait()).await.expect("no reply from server");
        match msg {
            Some(ChannelMsg::Success) => return Reply::Success,
            Some(ChannelMsg::Failure) => return Reply::Failure,
            Some(ChannelMsg::Close) | None => return Reply::Closed,
            Some(_) => continue,
        }
    }
}

async fn request_subsystem(channel: &mut Channel<client::Msg>, name: &str) -> Reply {
    channel.request_subsystem(true, name).await.unwrap();
    reply(channel).await
}

/// Talk to an `EchoTag` over a dispatched channel.
async fn exchange_tag(channel: Channel<client::Msg>, tag: &str) -> String {
    let mut stream = channel.into_stream();
    stream.write_all(format!("{tag}\n").as_bytes()).await.unwrap();
    stream.flush().await.unwrap();

    let mut out = Vec::new();
    timeout(WAIT, stream.read_to_end(&mut out))
        .await
        .expect("channel was not closed after handoff")
        .unwrap();
    String::from_utf8(out).unwrap()
}

// ============================================================================
// Dispatch
// ============================================================================

#[tokio::test]
async fn test_sftp_subsystem_is_handed_off() {
    let (handler, mut served) = EchoTag::new();
    let addr = start_server(handler).await;
    let session = login(addr).await;

    let mut channel = session.channel_open_session().await.unwrap();
    assert_eq!(request_subsystem(&mut channel, "sftp").await, Reply::Success);

    assert_eq!(exchange_tag(channel, "only").await, "served:only\n");
    assert_eq!(served.recv().await.as_deref(), Some("only"));
}

#[tokio::test]
async fn test_unknown_subsystem_rejected_channel_stays_open() {
    let (handler, mut served) = EchoTag::new();
    let addr = start_server(handler).await;
    let session = login(addr).await;

    let mut first = session.channel_open_session().await.unwrap();
    assert_eq!(request_subsystem(&mut first, "sftp").await, Reply::Success);

    let mut second = session.channel_open_session().await.unwrap();
    assert_eq!(request_subsystem(&mut second, "shell").await, Reply::Failure);
    assert_eq!(request_subsystem(&mut second, "SFTP").await, Reply::Failure);
    assert!(served.try_recv().is_err(), "rejected request reached the handler");

    // Still open and still listening: a later sftp request goes through.
    assert_eq!(request_subsystem(&mut second, "sftp").await, Reply::Success);

    assert_eq!(exchange_tag(first, "first").await, "served:first\n");
    assert_eq!(exchange_tag(second, "second").await, "served:second\n");

    let mut tags = BTreeSet::new();
    tags.insert(served.recv().await.unwrap());
    tags.insert(served.recv().await.unwrap());
    assert_eq!(tags, BTreeSet::from(["first".to_string(), "second".to_string()]));
}

#[tokio::test]
async fn test_non_subsystem_requests_rejected() {
    let (handler, _served) = EchoTag::new();
    let addr = start_server(handler).await;
    let session = login(addr).await;

    let mut channel = session.channel_open_session().await.unwrap();

    channel.request_shell(true).await.unwrap();
    assert_eq!(reply(&mut channel).await, Reply::Failure);

    channel.exec(true, "ls -la").await.unwrap();
    assert_eq!(reply(&mut channel).await, Reply::Failure);

    channel
        .request_pty(true, "xterm", 80, 24, 0, 0, &[])
        .await
        .unwrap();
    assert_eq!(reply(&mut channel).await, Reply::Failure);

    assert_eq!(request_subsystem(&mut channel, "sftp").await, Reply::Success);
    assert_eq!(exchange_tag(channel, "after-rejects").await, "served:after-rejects\n");
}

#[tokio::test]
async fn test_requests_after_handoff_are_rejected() {
    let (handler, mut served) = EchoTag::new();
    let addr = start_server(handler).await;
    let session = login(addr).await;

    let mut channel = session.channel_open_session().await.unwrap();
    assert_eq!(request_subsystem(&mut channel, "sftp").await, Reply::Success);

    // The channel now belongs to the handler; a second dispatch is refused
    // but still answered.
    assert_eq!(request_subsystem(&mut channel, "sftp").await, Reply::Failure);

    assert_eq!(exchange_tag(channel, "once").await, "served:once\n");
    assert_eq!(served.recv().await.as_deref(), Some("once"));
    assert!(served.try_recv().is_err());
}

#[tokio::test]
async fn test_request_flood_does_not_stall_sibling_channels() {
    // Well past russh's per-channel queue of 100 messages.
    const FLOOD: usize = 250;

    let (handler, mut served) = EchoTag::new();
    let addr = start_server(handler).await;
    let session = login(addr).await;

    let mut noisy = session.channel_open_session().await.unwrap();
    for i in 0..FLOOD {
        noisy.set_env(false, format!("VAR_{i}"), "x").await.unwrap();
    }

    let mut quiet = timeout(WAIT, session.channel_open_session())
        .await
        .expect("connection stalled behind a busy channel")
        .unwrap();
    assert_eq!(request_subsystem(&mut quiet, "sftp").await, Reply::Success);
    assert_eq!(exchange_tag(quiet, "quiet").await, "served:quiet\n");
    assert_eq!(served.recv().await.as_deref(), Some("quiet"));

    // The flooded channel still answers and can still be handed off.
    assert_eq!(request_subsystem(&mut noisy, "sftp").await, Reply::Success);
    assert_eq!(exchange_tag(noisy, "noisy").await, "served:noisy\n");
    assert_eq!(served.recv().await.as_deref(), Some("noisy"));
}

// ============================================================================
// Channel types
// ============================================================================

#[tokio::test]
async fn test_non_session_channels_are_refused() {
    let (handler, mut served) = EchoTag::new();
    let addr = start_server(handler).await;
    let session = login(addr).await;

    let forward = session
        .channel_open_direct_tcpip("127.0.0.1", 22, "127.0.0.1", 40000)
        .await;
    assert!(matches!(
        forward,
        Err(russh::Error::ChannelOpenFailure(
            ChannelOpenFailure::AdministrativelyProhibited
        ))
    ));

    let x11 = session.channel_open_x11("127.0.0.1", 6000).await;
    assert!(matches!(
        x11,
        Err(russh::Error::ChannelOpenFailure(
            ChannelOpenFailure::AdministrativelyProhibited
        ))
    ));

    // The connection survives both refusals.
    let mut channel = session.channel_open_session().await.unwrap();
    assert_eq!(request_subsystem(&mut channel, "sftp").await, Reply::Success);
    assert_eq!(exchange_tag(channel, "after-refusal").await, "served:after-refusal\n");
    assert_eq!(served.recv().await.as_deref(), Some("after-refusal"));
}

// ============================================================================
// Authentication
// ============================================================================

#[tokio::test]
async fn test_wrong_password_is_rejected() {
    let (handler, mut served) = EchoTag::new();
    let addr = start_server(handler).await;

    let (session, ok) = connect(addr, USER, "not-the-password").await;
    assert!(!ok);
    session
        .disconnect(Disconnect::ByApplication, "bye", "en")
        .await
        .unwrap();

    let (session, ok) = connect(addr, "TestUser", PASS).await;
    assert!(!ok);
    drop(session);

    assert!(served.try_recv().is_err());
}

#[tokio::test]
async fn test_failed_login_does_not_affect_other_clients() {
    let (handler, mut served) = EchoTag::new();
    let addr = start_server(handler).await;

    let good = login(addr).await;
    let (_bad, ok) = connect(addr, USER, "nope").await;
    assert!(!ok);

    let mut channel = good.channel_open_session().await.unwrap();
    assert_eq!(request_subsystem(&mut channel, "sftp").await, Reply::Success);
    assert_eq!(exchange_tag(channel, "good").await, "served:good\n");
    assert_eq!(served.recv().await.as_deref(), Some("good"));
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_connections_and_channels_are_independent() {
    const CONNECTIONS: usize = 4;
    const CHANNELS: usize = 3;

    let (handler, mut served) = EchoTag::new();
    let addr = start_server(handler).await;

    let clients = (0..CONNECTIONS).map(|conn| async move {
        let session = login(addr).await;

        let mut channels = Vec::new();
        for _ in 0..CHANNELS {
            channels.push(session.channel_open_session().await.unwrap());
        }

        let exchanges = channels.into_iter().enumerate().map(move |(ch, mut channel)| async move {
            let tag = format!("conn{conn}-ch{ch}");
            // Odd channels get turned away once before asking for sftp.
            if ch % 2 == 1 {
                assert_eq!(request_subsystem(&mut channel, "scp").await, Reply::Failure);
            }
            assert_eq!(request_subsystem(&mut channel, "sftp").await, Reply::Success);
            let echoed = exchange_tag(channel, &tag).await;
            assert_eq!(echoed, format!("served:{tag}\n"));
            tag
        });
        let tags = join_all(exchanges).await;

        // Keep the connection alive until every channel finished.
        drop(session);
        tags
    });

    let expected: BTreeSet<String> = join_all(clients).await.into_iter().flatten().collect();
    assert_eq!(expected.len(), CONNECTIONS * CHANNELS);

    let mut seen = BTreeSet::new();
    for _ in 0..CONNECTIONS * CHANNELS {
        let tag = timeout(WAIT, served.recv()).await.unwrap().unwrap();
        assert!(seen.insert(tag), "a channel was served twice");
    }
    assert_eq!(seen, expected);
}

// ============================================================================
// Real sftp
// ============================================================================

#[tokio::test]
async fn test_sftp_round_trip_over_local_filesystem() {
    let dir = tempfile::TempDir::new().unwrap();
    let root = dir.path().canonicalize().unwrap();
    let addr = start_server(SftpProtocol::new(&root)).await;
    let session = login(addr).await;

    let mut channel = session.channel_open_session().await.unwrap();
    assert_eq!(request_subsystem(&mut channel, "sftp").await, Reply::Success);

    let sftp = russh_sftp::client::SftpSession::new(channel.into_stream())
        .await
        .unwrap();

    let base = root.to_string_lossy().into_owned();
    let file_path = format!("{base}/hello.txt");

    let mut file = sftp.create(file_path.as_str()).await.unwrap();
    file.write_all(b"hello over sftp").await.unwrap();
    file.shutdown().await.unwrap();

    assert_eq!(std::fs::read(root.join("hello.txt")).unwrap(), b"hello over sftp");
    assert_eq!(sftp.read(file_path.as_str()).await.unwrap(), b"hello over sftp");

    sftp.create_dir(format!("{base}/inbox")).await.unwrap();
    assert!(root.join("inbox").is_dir());

    let names: BTreeSet<String> = sftp
        .read_dir(base.as_str())
        .await
        .unwrap()
        .map(|entry| entry.file_name())
        .collect();
    assert!(names.contains("hello.txt"));
    assert!(names.contains("inbox"));

    let canonical = sftp.canonicalize(format!("{base}/inbox/..")).await.unwrap();
    assert_eq!(canonical, base);
}

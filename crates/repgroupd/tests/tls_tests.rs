//! TLS channels with certificate-based trust policies

mod common;

use common::{build_factory, channel_config, TestCa};
use repgroupd::channel::{ChannelError, ChannelFactory, ConnectOptions, DataChannel};
use repgroupd::ConfigError;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

const NODE_PATTERN: &str = "^CN=node[0-9]+,OU=Replication,O=Example$";

fn options() -> ConnectOptions {
    ConnectOptions {
        connect_timeout: Duration::from_secs(2),
        handshake_timeout: Duration::from_secs(2),
        tcp_nodelay: true,
        server_name: Some("localhost".to_string()),
    }
}

/// Accept one connection on `server` while `client` connects to it.
async fn pair(
    server: Arc<dyn ChannelFactory>,
    client: Arc<dyn ChannelFactory>,
) -> (
    Result<Arc<dyn DataChannel>, ChannelError>,
    Result<Arc<dyn DataChannel>, ChannelError>,
) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let accept = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        server.accept_channel(stream).await
    });
    let connected = client.connect(&addr, &options()).await;
    (accept.await.unwrap(), connected)
}

#[tokio::test]
async fn test_dn_match_trusts_group_members() {
    let ca = TestCa::new();
    let node1 = ca.issue("node1", "Example", "Replication", "node1");
    let node2 = ca.issue("node2", "Example", "Replication", "node2");
    let auth = Some(("dn-match", Some(NODE_PATTERN)));

    let server = build_factory(channel_config("tls", Some(ca.tls_config(&node1, auth)))).unwrap();
    let client = build_factory(channel_config("tls", Some(ca.tls_config(&node2, auth)))).unwrap();

    let (accepted, connected) = pair(server, client).await;
    let accepted = accepted.unwrap();
    let connected = connected.unwrap();

    for channel in [&accepted, &connected] {
        assert!(channel.is_secure());
        assert!(channel.is_trusted());
        assert!(channel.is_trust_capable());
    }
    assert_eq!(
        accepted.peer_session().unwrap().subject_dn().unwrap(),
        "CN=node2,OU=Replication,O=Example"
    );
    assert_eq!(
        connected.peer_session().unwrap().subject_dn().unwrap(),
        "CN=node1,OU=Replication,O=Example"
    );

    connected.write_all(b"ping\n").await.unwrap();
    connected.flush().await.unwrap();
    let mut buf = [0u8; 5];
    let mut got = 0;
    while got < buf.len() {
        got += accepted.read(&mut buf[got..]).await.unwrap();
    }
    assert_eq!(&buf, b"ping\n");
}

#[tokio::test]
async fn test_dn_mismatch_is_rejected_and_closed() {
    let ca = TestCa::new();
    let node1 = ca.issue("node1", "Example", "Replication", "node1");
    let intruder = ca.issue("intruder", "Example", "Reporting", "dashboard");

    let server = build_factory(channel_config(
        "tls",
        Some(ca.tls_config(&node1, Some(("dn-match", Some(NODE_PATTERN))))),
    ))
    .unwrap();
    // the intruder has no policy of its own, so its side completes
    let client = build_factory(channel_config("tls", Some(ca.tls_config(&intruder, None)))).unwrap();

    let (accepted, connected) = pair(server, client).await;
    match accepted {
        Err(ChannelError::Untrusted { authenticator, .. }) => assert_eq!(authenticator, "dn-match"),
        Err(other) => panic!("expected Untrusted, got {other}"),
        Ok(_) => panic!("untrusted peer was admitted"),
    }

    let connected = connected.unwrap();
    assert!(!connected.is_trusted());
    let mut buf = [0u8; 8];
    let read = tokio::time::timeout(Duration::from_secs(2), connected.read(&mut buf))
        .await
        .expect("rejected peer left hanging");
    assert!(matches!(read, Ok(0) | Err(_)));
}

#[tokio::test]
async fn test_mirror_trusts_same_identity_only() {
    let ca = TestCa::new();
    let shared = ca.issue("shared", "Example", "Replication", "repgroup");
    let other = ca.issue("other", "Example", "Replication", "someone-else");
    let mirror = Some(("mirror", None));

    let server = build_factory(channel_config("tls", Some(ca.tls_config(&shared, mirror)))).unwrap();
    let client = build_factory(channel_config("tls", Some(ca.tls_config(&shared, mirror)))).unwrap();
    let (accepted, connected) = pair(server.clone(), client).await;
    assert!(accepted.unwrap().is_trusted());
    assert!(connected.unwrap().is_trusted());

    let stranger = build_factory(channel_config("tls", Some(ca.tls_config(&other, None)))).unwrap();
    let (accepted, _) = pair(server, stranger).await;
    assert!(matches!(accepted, Err(ChannelError::Untrusted { .. })));
}

#[tokio::test]
async fn test_no_policy_means_capable_but_untrusted() {
    let ca = TestCa::new();
    let node1 = ca.issue("node1", "Example", "Replication", "node1");
    let node2 = ca.issue("node2", "Example", "Replication", "node2");

    let server = build_factory(channel_config("tls", Some(ca.tls_config(&node1, None)))).unwrap();
    let client = build_factory(channel_config("tls", Some(ca.tls_config(&node2, None)))).unwrap();
    let (accepted, _) = pair(server, client).await;
    let accepted = accepted.unwrap();
    assert!(accepted.is_secure());
    assert!(accepted.is_trust_capable());
    assert!(!accepted.is_trusted());
}

#[tokio::test]
async fn test_silent_server_times_out_handshake() {
    let ca = TestCa::new();
    let node1 = ca.issue("node1", "Example", "Replication", "node1");
    let client = build_factory(channel_config("tls", Some(ca.tls_config(&node1, None)))).unwrap();

    // accepts TCP but never speaks TLS
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let _hold = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        drop(stream);
    });

    let opts = ConnectOptions {
        handshake_timeout: Duration::from_millis(200),
        ..options()
    };
    let err = client.connect(&addr, &opts).await.err().unwrap();
    assert!(matches!(err, ChannelError::Timeout { .. }));
    assert!(err.is_retryable());
}

#[test]
fn test_invalid_pattern_fails_factory_construction() {
    let ca = TestCa::new();
    let node1 = ca.issue("node1", "Example", "Replication", "node1");
    let err = build_factory(channel_config(
        "tls",
        Some(ca.tls_config(&node1, Some(("dn-match", Some("CN=(node"))))),
    ))
    .err()
    .unwrap();
    assert!(matches!(err, ConfigError::Regex { .. }));
}

#[cfg(unix)]
#[test]
fn test_readable_key_is_refused() {
    use std::os::unix::fs::PermissionsExt;

    let ca = TestCa::new();
    let node1 = ca.issue("node1", "Example", "Replication", "node1");
    std::fs::set_permissions(&node1.key, std::fs::Permissions::from_mode(0o644)).unwrap();
    let err = build_factory(channel_config("tls", Some(ca.tls_config(&node1, None))))
        .err()
        .unwrap();
    assert!(matches!(err, ConfigError::Tls(_)));
}

//! Plaintext channels over real sockets

mod common;

use common::{build_factory, channel_config};
use repgroupd::channel::{ChannelError, ConnectOptions};
use std::time::Duration;
use tokio::net::TcpListener;

#[tokio::test]
async fn test_plain_channel_trust_flags() {
    let factory = build_factory(channel_config("plain", None)).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = factory.clone();
    let accept = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        server.accept_channel(stream).await.unwrap()
    });
    let client = factory
        .connect(&addr.to_string(), &ConnectOptions::default())
        .await
        .unwrap();
    let server = accept.await.unwrap();

    assert!(!client.is_secure());
    assert!(!client.is_trusted());
    assert!(client.is_trust_capable());
    assert!(client.peer_session().is_none());
    assert_eq!(client.peer_addr(), Some(addr));

    client.write_all(b"abc").await.unwrap();
    let mut buf = [0u8; 3];
    let mut got = 0;
    while got < 3 {
        got += server.read(&mut buf[got..]).await.unwrap();
    }
    assert_eq!(&buf, b"abc");
}

#[tokio::test]
async fn test_close_under_read_returns_promptly() {
    let factory = build_factory(channel_config("plain", None)).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    // peer stays connected and silent
    let _peer = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        drop(stream);
    });

    let channel = factory.connect(&addr, &ConnectOptions::default()).await.unwrap();
    let reader = channel.clone();
    let blocked = tokio::spawn(async move {
        let mut buf = [0u8; 16];
        reader.read(&mut buf).await
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!blocked.is_finished());
    channel.close().await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(1), blocked)
        .await
        .expect("read still blocked after close")
        .unwrap();
    assert!(matches!(result, Err(ChannelError::Closed)));
    assert!(!channel.is_open());
}

#[tokio::test]
async fn test_close_is_seen_by_peer() {
    let factory = build_factory(channel_config("plain", None)).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let server = factory.clone();
    let accept = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        server.accept_channel(stream).await.unwrap()
    });
    let client = factory.connect(&addr, &ConnectOptions::default()).await.unwrap();
    let server = accept.await.unwrap();

    client.close().await.unwrap();
    let mut buf = [0u8; 4];
    assert_eq!(server.read(&mut buf).await.unwrap(), 0);
}

#[tokio::test]
async fn test_close_releases_socket() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let factory = build_factory(channel_config("plain", None)).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
    let client = factory.connect(&addr, &ConnectOptions::default()).await.unwrap();
    let mut peer = accept.await.unwrap();

    client.close().await.unwrap();
    let mut buf = [0u8; 4];
    assert_eq!(peer.read(&mut buf).await.unwrap(), 0);

    // a socket that was only half-closed would keep accepting these
    let refused = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if peer.write_all(b"ping").await.is_err() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    assert!(refused.is_ok(), "peer could still write after close");
}

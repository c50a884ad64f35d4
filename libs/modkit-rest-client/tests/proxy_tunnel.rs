//! Requests routed through a `CONNECT` proxy, configured explicitly or from the environment.

use std::sync::{Arc, Mutex};

use httpmock::prelude::*;
use modkit_rest_client::env::{HTTP_PROXY, NO_PROXY};
use modkit_rest_client::{HttpClient, HttpClientConfig, HttpError, ProxyConfig, StaticEnvironment};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

type Heads = Arc<Mutex<Vec<String>>>;

/// Minimal tunnelling proxy: records each CONNECT head, then splices bytes.
async fn start_proxy(accept: bool) -> (String, Heads) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let heads: Heads = Arc::default();

    let seen = Arc::clone(&heads);
    tokio::spawn(async move {
        while let Ok((client, _)) = listener.accept().await {
            tokio::spawn(tunnel(client, Arc::clone(&seen), accept));
        }
    });
    (url, heads)
}

async fn tunnel(mut client: TcpStream, heads: Heads, accept: bool) {
    let mut head = Vec::new();
    let mut chunk = [0_u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        match client.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => head.extend_from_slice(&chunk[..n]),
        }
    }
    let head = String::from_utf8_lossy(&head).into_owned();
    heads.lock().unwrap().push(head.clone());

    if !accept {
        let _ = client
            .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\nContent-Length: 0\r\n\r\n")
            .await;
        return;
    }

    let Some(target) = head.split_whitespace().nth(1) else {
        return;
    };
    let Ok(mut upstream) = TcpStream::connect(target).await else {
        return;
    };
    if client
        .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
        .await
        .is_ok()
    {
        let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
    }
}

fn target_server() -> MockServer {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/via-proxy");
        then.status(200).body("tunnelled");
    });
    server
}

#[tokio::test]
async fn explicit_proxy_tunnels_with_credentials() {
    let server = target_server();
    let (proxy_url, heads) = start_proxy(true).await;

    let client = HttpClient::builder()
        .config(HttpClientConfig::for_testing())
        .environment(StaticEnvironment::new())
        .proxy(ProxyConfig::new(proxy_url).with_credentials("user", "pass"))
        .build()
        .unwrap();

    let response = client.get(&server.url("/via-proxy")).send().await.unwrap();
    assert_eq!(response.text().await.unwrap(), "tunnelled");

    let heads = heads.lock().unwrap().clone();
    assert_eq!(heads.len(), 1);
    assert!(
        heads[0].starts_with(&format!("CONNECT 127.0.0.1:{} HTTP/1.1", server.port())),
        "{}",
        heads[0]
    );
    assert!(heads[0].contains("Proxy-Authorization: Basic dXNlcjpwYXNz"));
}

#[tokio::test]
async fn bypassed_hosts_connect_directly() {
    let server = target_server();
    let (proxy_url, heads) = start_proxy(true).await;

    let client = HttpClient::builder()
        .config(HttpClientConfig::for_testing())
        .environment(StaticEnvironment::new())
        .proxy(ProxyConfig::new(proxy_url).with_bypass_hosts([r"127\.0\.0\.1"]))
        .build()
        .unwrap();

    let response = client.get(&server.url("/via-proxy")).send().await.unwrap();
    assert_eq!(response.status(), 200);
    assert!(heads.lock().unwrap().is_empty());
}

#[tokio::test]
async fn environment_proxy_and_no_proxy() {
    let server = target_server();
    let (proxy_url, heads) = start_proxy(true).await;

    let proxied = HttpClient::builder()
        .config(HttpClientConfig::for_testing())
        .environment(StaticEnvironment::new().with(HTTP_PROXY, proxy_url.as_str()))
        .build()
        .unwrap();
    let response = proxied.get(&server.url("/via-proxy")).send().await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(heads.lock().unwrap().len(), 1);

    let bypassing = HttpClient::builder()
        .config(HttpClientConfig::for_testing())
        .environment(
            StaticEnvironment::new()
                .with(HTTP_PROXY, proxy_url.as_str())
                .with(NO_PROXY, "example.com, ,127.0.0.1"),
        )
        .build()
        .unwrap();
    let response = bypassing.get(&server.url("/via-proxy")).send().await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(heads.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn refused_connect_is_a_connection_error() {
    let server = target_server();
    let (proxy_url, _heads) = start_proxy(false).await;

    let client = HttpClient::builder()
        .config(HttpClientConfig::for_testing())
        .environment(StaticEnvironment::new())
        .proxy(ProxyConfig::new(proxy_url))
        .build()
        .unwrap();

    let err = client
        .get(&server.url("/via-proxy"))
        .send()
        .await
        .unwrap_err();
    assert!(matches!(err, HttpError::Transport(_)), "{err:?}");
}

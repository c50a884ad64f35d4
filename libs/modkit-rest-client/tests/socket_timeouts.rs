//! Socket timeout and hop draining against a raw HTTP/1.1 server.
//!
//! `httpmock` always answers promptly with complete bodies, so stalled heads,
//! stalled bodies and connection reuse are exercised with a hand-written
//! server that tags each request with the connection it arrived on.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use modkit_rest_client::{HttpClient, HttpClientConfig, HttpError, StaticEnvironment};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

/// How the server answers one request.
#[derive(Clone, Copy)]
enum Reply {
    /// Write the whole response.
    Full(&'static str),
    /// Write these bytes, then keep the connection open without writing more.
    Stall(&'static str),
    /// Never answer.
    Silent,
}

type Log = Arc<Mutex<Vec<(usize, String)>>>;

async fn start_server(route: fn(&str) -> Reply) -> (String, Log) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let log: Log = Arc::default();
    let next_id = Arc::new(AtomicUsize::new(0));

    let server_log = Arc::clone(&log);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let id = next_id.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(serve_connection(stream, id, route, Arc::clone(&server_log)));
        }
    });
    (base, log)
}

async fn serve_connection(
    stream: TcpStream,
    connection: usize,
    route: fn(&str) -> Reply,
    log: Log,
) {
    let mut reader = BufReader::new(stream);
    loop {
        let mut request_line = String::new();
        if reader.read_line(&mut request_line).await.unwrap_or(0) == 0 {
            return;
        }
        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                return;
            }
            if line == "\r\n" {
                break;
            }
        }

        let path = request_line
            .split_whitespace()
            .nth(1)
            .unwrap_or("/")
            .to_owned();
        let reply = route(&path);
        log.lock().unwrap().push((connection, path));

        match reply {
            Reply::Full(response) => {
                if reader.get_mut().write_all(response.as_bytes()).await.is_err() {
                    return;
                }
            }
            Reply::Stall(partial) => {
                let _ = reader.get_mut().write_all(partial.as_bytes()).await;
                tokio::time::sleep(Duration::from_secs(60)).await;
                return;
            }
            Reply::Silent => {
                tokio::time::sleep(Duration::from_secs(60)).await;
                return;
            }
        }
    }
}

fn client(socket_timeout: Duration, keep_alive: bool) -> HttpClient {
    HttpClient::builder()
        .config(HttpClientConfig::for_testing())
        .environment(StaticEnvironment::new())
        .socket_timeout(socket_timeout)
        .keep_alive(keep_alive)
        .build()
        .unwrap()
}

#[tokio::test]
async fn stalled_response_head_times_out() {
    let (base, _log) = start_server(|_| Reply::Silent).await;
    let client = client(Duration::from_millis(300), false);

    let started = Instant::now();
    let err = client
        .get(&format!("{base}/slow"))
        .send()
        .await
        .unwrap_err();

    assert!(matches!(err, HttpError::Timeout(_)), "{err:?}");
    assert!(err.is_connection_error());
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn stalled_redirect_body_does_not_hang_the_call() {
    let (base, log) = start_server(|path| match path {
        "/start" => Reply::Stall("HTTP/1.1 302 Found\r\nLocation: /end\r\nContent-Length: 100\r\n\r\nabc"),
        _ => Reply::Full("HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\ndone"),
    })
    .await;
    let client = client(Duration::from_millis(300), false);

    let response = tokio::time::timeout(
        Duration::from_secs(5),
        client.get(&format!("{base}/start")).send(),
    )
    .await
    .expect("call must finish once the discarded body stalls")
    .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "done");
    let paths: Vec<String> = log.lock().unwrap().iter().map(|(_, p)| p.clone()).collect();
    assert_eq!(paths, ["/start", "/end"]);
}

#[tokio::test]
async fn stalled_final_body_times_out_on_read() {
    let (base, _log) = start_server(|_| {
        Reply::Stall("HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\npartial")
    })
    .await;
    let client = client(Duration::from_millis(300), false);

    let mut response = client.get(&format!("{base}/body")).send().await.unwrap();
    assert_eq!(response.status(), 200);

    let err = tokio::time::timeout(Duration::from_secs(5), response.read_body())
        .await
        .expect("body read must not hang")
        .unwrap_err();
    assert!(matches!(err, HttpError::Timeout(_)), "{err:?}");
}

#[tokio::test]
async fn drained_redirect_hop_reuses_the_keep_alive_connection() {
    let (base, log) = start_server(|path| match path {
        "/start" => Reply::Full("HTTP/1.1 302 Found\r\nLocation: /end\r\nContent-Length: 5\r\n\r\nmoved"),
        _ => Reply::Full("HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\ndone"),
    })
    .await;
    let client = client(Duration::from_secs(5), true);

    let response = client.get(&format!("{base}/start")).send().await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "done");

    let seen = log.lock().unwrap().clone();
    assert_eq!(seen.len(), 2, "{seen:?}");
    assert_eq!(seen[0].1, "/start");
    assert_eq!(seen[1].1, "/end");
    assert_eq!(seen[0].0, seen[1].0, "redirect hop opened a new connection: {seen:?}");
}

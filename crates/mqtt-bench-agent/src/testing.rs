//! Centralized test fixtures and helpers for agent tests.

use mqtt_bench_common::BenchConfig;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Configuration pointing at a local broker with short timings
pub fn test_config(dir: &Path) -> BenchConfig {
    let mut config = BenchConfig::new("127.0.0.1");
    config.client_count = 10;
    config.duration_secs = 1;
    config.message_interval_ms = 100;
    config.install_dir = dir.join("emqtt-bench");
    config.log_dir = dir.join("logs");
    config
}

/// Write an executable shell script standing in for emqtt_bench.
///
/// `body` sees the sub-command in `$1`.
pub fn fake_bench_binary(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("emqtt_bench");
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// One canned HTTP response
pub struct Route {
    path: String,
    status: u16,
    body: Vec<u8>,
    required_header: Option<(String, String)>,
}

impl Route {
    pub fn ok(path: &str, body: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.to_string(),
            status: 200,
            body: body.into(),
            required_header: None,
        }
    }

    pub fn status(path: &str, status: u16) -> Self {
        Self {
            path: path.to_string(),
            status,
            body: b"<!DOCTYPE html><html><body>error</body></html>".to_vec(),
            required_header: None,
        }
    }

    /// Answer 403 unless the request carries this header
    pub fn requiring_header(mut self, name: &str, value: &str) -> Self {
        self.required_header = Some((name.to_ascii_lowercase(), value.to_string()));
        self
    }
}

/// Serve `routes` on an ephemeral localhost port; returns the base URL.
///
/// Unknown paths get an HTML 404 page, like a real metadata server.
pub async fn serve_http(routes: Vec<Route>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let routes = std::sync::Arc::new(routes);

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let routes = routes.clone();
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    }
                }
                let request = String::from_utf8_lossy(&buf).to_string();
                let path = request
                    .lines()
                    .next()
                    .and_then(|line| line.split_whitespace().nth(1))
                    .unwrap_or("/")
                    .to_string();
                let headers: Vec<String> = request
                    .lines()
                    .skip(1)
                    .map(|l| l.to_ascii_lowercase())
                    .collect();

                let (status, body) = match routes.iter().find(|r| r.path == path) {
                    Some(route) => {
                        let authorized = route.required_header.as_ref().is_none_or(|(name, value)| {
                            let expected = format!("{}: {}", name, value.to_ascii_lowercase());
                            headers.iter().any(|h| h.trim() == expected)
                        });
                        if authorized {
                            (route.status, route.body.clone())
                        } else {
                            (403, b"forbidden".to_vec())
                        }
                    }
                    None => (
                        404,
                        b"<!DOCTYPE html>\n<html><body>404 Not Found</body></html>".to_vec(),
                    ),
                };

                let head = format!(
                    "HTTP/1.1 {} X\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    status,
                    body.len()
                );
                let _ = stream.write_all(head.as_bytes()).await;
                let _ = stream.write_all(&body).await;
                let _ = stream.shutdown().await;
            });
        }
    });

    format!("http://{}", addr)
}

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use phpswitch_core::{CatalogSource, EngineConfig, RefreshPolicy};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Minimal HTTP/1.1 responder serving fixed bodies for GET and HEAD.
pub struct TestServer {
    pub base: String,
}

impl TestServer {
    pub async fn start(routes: HashMap<String, Vec<u8>>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("test server should bind");
        let addr = listener.local_addr().expect("test server should have an address");
        let routes = Arc::new(routes);

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let routes = Arc::clone(&routes);
                tokio::spawn(async move {
                    let mut request = Vec::new();
                    let mut buf = [0u8; 1024];
                    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => request.extend_from_slice(&buf[..n]),
                        }
                    }
                    let head = String::from_utf8_lossy(&request);
                    let mut parts = head.split_whitespace();
                    let method = parts.next().unwrap_or_default().to_string();
                    let path = parts.next().unwrap_or_default().to_string();

                    let (status, body) = match routes.get(&path) {
                        Some(body) => ("200 OK", body.as_slice()),
                        None => ("404 Not Found", &b""[..]),
                    };
                    let header = format!(
                        "HTTP/1.1 {status}\r\nContent-Length: {}\r\nContent-Type: application/octet-stream\r\nConnection: close\r\n\r\n",
                        body.len()
                    );
                    let _ = socket.write_all(header.as_bytes()).await;
                    if method != "HEAD" {
                        let _ = socket.write_all(body).await;
                    }
                    let _ = socket.shutdown().await;
                });
            }
        });

        Self {
            base: format!("http://{addr}"),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }
}

/// An address nothing listens on.
pub async fn closed_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener should bind");
    let addr = listener.local_addr().expect("listener should have an address");
    drop(listener);
    format!("http://{addr}/")
}

pub fn listing_html(files: &[&str]) -> Vec<u8> {
    let mut html = String::from("<html><body><pre>\n");
    for file in files {
        html.push_str(&format!(
            "<a href=\"/downloads/releases/archives/{file}\">{file}</a>\n"
        ));
    }
    html.push_str("</pre></body></html>\n");
    html.into_bytes()
}

#[cfg(windows)]
pub const EXE: &str = "php.exe";
#[cfg(not(windows))]
pub const EXE: &str = "php";

/// A package larger than the truncation threshold holding a stand-in runtime
/// that prints `PHP <version> (cli)`.
pub fn package_zip(dir: &Path, version: &str) -> Vec<u8> {
    let path = dir.join(format!("pkg-{version}.zip"));
    let file = std::fs::File::create(&path).expect("zip should be created");
    let mut writer = zip::ZipWriter::new(file);
    let stored = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Stored)
        .unix_permissions(0o755);

    writer.start_file(EXE, stored).expect("exe entry should start");
    writer
        .write_all(format!("#!/bin/sh\necho 'PHP {version} (cli) (built: test)'\n").as_bytes())
        .expect("exe entry should be written");
    writer
        .start_file("ext/php_filler.dll", stored)
        .expect("filler entry should start");
    writer
        .write_all(&vec![0x5A; 1_200_000])
        .expect("filler entry should be written");
    writer.finish().expect("zip should finalize");

    std::fs::read(&path).expect("zip should be readable")
}

pub fn engine_config(server: &TestServer, root: &Path) -> EngineConfig {
    EngineConfig {
        link_path: root.join("php"),
        scratch_dir: root.join("scratch"),
        catalog: CatalogSource {
            listing_url: server.url("/archives/"),
            probe_urls: vec![server.url("/")],
            probe_timeout: Duration::from_secs(2),
            fetch_timeout: Duration::from_secs(5),
            dump_path: None,
        },
        http_timeout: Duration::from_secs(30),
        verify_timeout: Duration::from_secs(10),
        refresh_policy: RefreshPolicy::default(),
    }
}

pub fn install_root(root: &Path) -> PathBuf {
    root.join("versions")
}

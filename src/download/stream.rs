use std::fs;
use std::io::Write as _;
use std::path::Path;

use async_trait::async_trait;
use futures_util::StreamExt as _;
use reqwest::Client;

use super::{prepare_destination, settle_part, Downloader, TransferMeter, USER_AGENT};
use crate::error::{AppError, Result};
use crate::progress::ProgressFn;

/// Streams the response body to disk chunk by chunk.
pub struct HttpDownloader {
    client: Client,
}

impl HttpDownloader {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn fetch_into(&self, url: &str, part: &Path, on_progress: ProgressFn<'_>) -> Result<()> {
        let resp = self
            .client
            .get(url)
            .header("User-Agent", USER_AGENT)
            .send()
            .await
            .map_err(|e| AppError::download(url, e.to_string()))?;

        if !resp.status().is_success() {
            return Err(AppError::download(url, format!("HTTP {}", resp.status())));
        }

        let mut meter = TransferMeter::new(resp.content_length());
        let mut file = fs::File::create(part).map_err(|e| AppError::download(url, e.to_string()))?;
        let mut stream = resp.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| AppError::download(url, e.to_string()))?;
            file.write_all(&chunk)
                .map_err(|e| AppError::download(url, e.to_string()))?;
            on_progress(meter.record_chunk(chunk.len() as u64));
        }

        file.sync_all()
            .map_err(|e| AppError::download(url, e.to_string()))?;

        if let Some(total) = meter.total() {
            if meter.received() < total {
                return Err(AppError::download(
                    url,
                    format!(
                        "connection closed after {} of {} bytes",
                        meter.received(),
                        total
                    ),
                ));
            }
        }

        Ok(())
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    async fn download(&self, url: &str, dest: &Path, on_progress: ProgressFn<'_>) -> Result<()> {
        let part = prepare_destination(url, dest)?;
        log::info!("Downloading {} -> {:?}", url, dest);
        let outcome = self.fetch_into(url, &part, on_progress).await;
        settle_part(url, &part, dest, outcome)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
    use tokio::net::TcpListener;

    use super::*;
    use crate::download::part_path;
    use crate::progress::ProgressUpdate;
    use crate::ErrorKind;

    /// Answer one request, announcing `announced` bytes but sending `body`.
    async fn serve_once(body: Vec<u8>, announced: usize) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 2048];
            let _ = socket.read(&mut request).await;
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {announced}\r\nConnection: close\r\n\r\n"
            );
            socket.write_all(head.as_bytes()).await.unwrap();
            socket.write_all(&body).await.unwrap();
            let _ = socket.shutdown().await;
        });
        format!("http://{addr}/oman.zip")
    }

    fn downloader() -> HttpDownloader {
        HttpDownloader::new(Client::builder().no_proxy().build().unwrap())
    }

    #[tokio::test]
    async fn short_body_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("update.zip");
        let url = serve_once(vec![b'x'; 400], 1000).await;
        let seen = Mutex::new(Vec::new());

        let err = downloader()
            .download(&url, &dest, &|update: ProgressUpdate| {
                seen.lock().unwrap().push(update.whole_percent())
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Download);
        assert!(!dest.exists());
        assert!(!part_path(&dest).exists());
        let seen = seen.into_inner().unwrap();
        assert!(seen.iter().all(|p| p.is_some_and(|p| p <= 40)));
    }

    #[tokio::test]
    async fn complete_body_lands_at_dest() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("update.zip");
        let url = serve_once(vec![b'y'; 256], 256).await;
        let seen = Mutex::new(Vec::new());

        downloader()
            .download(&url, &dest, &|update: ProgressUpdate| {
                seen.lock().unwrap().push(update.whole_percent())
            })
            .await
            .unwrap();

        assert_eq!(fs::read(&dest).unwrap(), vec![b'y'; 256]);
        assert!(!part_path(&dest).exists());
        assert_eq!(seen.into_inner().unwrap().last(), Some(&Some(100)));
    }

    #[tokio::test]
    async fn http_error_status_fails() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("update.zip");
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 2048];
            let _ = socket.read(&mut request).await;
            let _ = socket
                .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .await;
        });

        let err = downloader()
            .download(&format!("http://{addr}/missing.zip"), &dest, &|_| {})
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Download);
        assert!(!dest.exists());
    }
}

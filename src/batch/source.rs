// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Locate the video an import refers to

use reqwest::{Client, Url};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::stages::StageOutcome;
use super::{wait_stopped, StopSignal};
use crate::{ClassqError, Result};

/// Turns video references into local files, downloading remote ones
pub struct SourceResolver {
    client: Client,
    scratch_dir: PathBuf,
}

impl SourceResolver {
    pub fn new(scratch_dir: &Path, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            scratch_dir: scratch_dir.to_path_buf(),
        })
    }

    /// Local path of `source`
    ///
    /// Plain paths and `file:` URLs are used in place and must exist. `http`
    /// and `https` URLs are downloaded once into the scratch directory; a stop
    /// during the download discards the partial file.
    pub async fn resolve(&self, source: &str, stop: &StopSignal) -> Result<StageOutcome<PathBuf>> {
        let source = source.trim();
        if source.is_empty() {
            return Err(ClassqError::InvalidSource("empty video source".to_string()));
        }

        let url = match Url::parse(source) {
            // single letters are drive prefixes, not schemes
            Ok(url) if url.scheme().len() > 1 => url,
            _ => return existing(PathBuf::from(source)).map(StageOutcome::Completed),
        };

        match url.scheme() {
            "file" => {
                let path = url
                    .to_file_path()
                    .map_err(|_| ClassqError::InvalidSource(format!("not a local file URL: {}", source)))?;
                existing(path).map(StageOutcome::Completed)
            }
            "http" | "https" => self.download(&url, stop).await,
            other => Err(ClassqError::InvalidSource(format!(
                "unsupported scheme {:?} in {}",
                other, source
            ))),
        }
    }

    /// Scratch file a remote URL is stored under
    pub fn download_target(&self, url: &Url) -> Result<PathBuf> {
        let name = url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|name| !name.is_empty())
            .ok_or_else(|| ClassqError::InvalidSource(format!("no file name in {}", url)))?;
        Ok(self.scratch_dir.join(name))
    }

    async fn download(&self, url: &Url, stop: &StopSignal) -> Result<StageOutcome<PathBuf>> {
        let target = self.download_target(url)?;
        if target.exists() {
            debug!("Using cached download {:?}", target);
            return Ok(StageOutcome::Completed(target));
        }

        tokio::fs::create_dir_all(&self.scratch_dir).await?;
        info!("Downloading {} to {:?}", url, target);

        // a partial file must never look like a finished download
        let partial = target.with_extension("part");
        let mut file = File::create(&partial).await?;
        let mut stop = stop.clone();
        let fetched = tokio::select! {
            result = self.fetch(url, &mut file) => Some(result),
            _ = wait_stopped(&mut stop) => None,
        };
        drop(file);

        match fetched {
            Some(Ok(())) => {
                tokio::fs::rename(&partial, &target).await?;
                Ok(StageOutcome::Completed(target))
            }
            None => {
                info!("Download of {} stopped", url);
                discard(&partial).await;
                Ok(StageOutcome::Cancelled)
            }
            Some(Err(e)) => {
                discard(&partial).await;
                Err(e)
            }
        }
    }

    /// Stream the body of `url` into `file`
    async fn fetch(&self, url: &Url, file: &mut File) -> Result<()> {
        let mut response = self.client.get(url.clone()).send().await?;
        if !response.status().is_success() {
            return Err(ClassqError::InvalidSource(format!(
                "download of {} returned {}",
                url,
                response.status()
            )));
        }

        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        debug!("Downloaded {} bytes from {}", written, url);
        Ok(())
    }
}

async fn discard(partial: &Path) {
    match tokio::fs::remove_file(partial).await {
        Ok(()) => debug!("Removed partial download {:?}", partial),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Could not remove partial download {:?}: {}", partial, e),
    }
}

fn existing(path: PathBuf) -> Result<PathBuf> {
    if path.is_file() {
        Ok(path)
    } else {
        Err(ClassqError::InvalidSource(format!("video {:?} does not exist", path)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio::sync::watch;

    fn resolver(dir: &Path) -> SourceResolver {
        SourceResolver::new(dir, Duration::from_secs(5)).unwrap()
    }

    fn completed(outcome: StageOutcome<PathBuf>) -> PathBuf {
        match outcome {
            StageOutcome::Completed(path) => path,
            StageOutcome::Cancelled => panic!("resolve was cancelled"),
        }
    }

    #[tokio::test]
    async fn test_plain_path_and_file_url() {
        let dir = tempfile::tempdir().unwrap();
        let r = resolver(dir.path());
        let (_tx, stop) = watch::channel(false);
        let video = dir.path().join("d1.mov");
        std::fs::write(&video, b"frames").unwrap();

        let plain = video.display().to_string();
        assert_eq!(completed(r.resolve(&plain, &stop).await.unwrap()), video);
        let url = Url::from_file_path(&video).unwrap().to_string();
        assert_eq!(completed(r.resolve(&url, &stop).await.unwrap()), video);
    }

    #[tokio::test]
    async fn test_missing_local_video_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let r = resolver(dir.path());
        let (_tx, stop) = watch::channel(false);
        let missing = dir.path().join("gone.mov");

        let plain = missing.display().to_string();
        assert!(matches!(r.resolve(&plain, &stop).await, Err(ClassqError::InvalidSource(_))));
        let url = Url::from_file_path(&missing).unwrap().to_string();
        assert!(matches!(r.resolve(&url, &stop).await, Err(ClassqError::InvalidSource(_))));
    }

    #[tokio::test]
    async fn test_unsupported_scheme_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let r = resolver(dir.path());
        let (_tx, stop) = watch::channel(false);

        assert!(matches!(r.resolve("ftp://host/d1.mov", &stop).await, Err(ClassqError::InvalidSource(_))));
        assert!(matches!(r.resolve("  ", &stop).await, Err(ClassqError::InvalidSource(_))));
    }

    #[tokio::test]
    async fn test_existing_download_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let r = resolver(dir.path());
        let (_tx, stop) = watch::channel(false);
        std::fs::write(dir.path().join("d1.mov"), b"frames").unwrap();

        // no request is made: the host does not resolve
        let path = completed(r.resolve("http://video.invalid/dives/d1.mov", &stop).await.unwrap());
        assert_eq!(path, dir.path().join("d1.mov"));
    }

    #[tokio::test]
    async fn test_download_streams_to_scratch() {
        let dir = tempfile::tempdir().unwrap();
        let r = resolver(dir.path());
        let (_tx, stop) = watch::channel(false);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 1024];
            let _ = socket.read(&mut request).await;
            let body = b"frames";
            let head = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n", body.len());
            socket.write_all(head.as_bytes()).await.unwrap();
            socket.write_all(body).await.unwrap();
        });

        let url = format!("http://{}/dives/d1.mov", addr);
        let path = completed(r.resolve(&url, &stop).await.unwrap());
        assert_eq!(path, dir.path().join("d1.mov"));
        assert_eq!(std::fs::read(&path).unwrap(), b"frames");
        assert!(!dir.path().join("d1.part").exists());
    }

    #[tokio::test]
    async fn test_stop_during_download_discards_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let r = resolver(dir.path());
        let (tx, stop) = watch::channel(false);

        // sends a little of a large body, then stalls
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (sent_tx, sent_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 1024];
            let _ = socket.read(&mut request).await;
            let head = "HTTP/1.1 200 OK\r\nContent-Length: 1000000000\r\n\r\n";
            socket.write_all(head.as_bytes()).await.unwrap();
            socket.write_all(&[7u8; 4096]).await.unwrap();
            let _ = sent_tx.send(());
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let url = format!("http://{}/dives/d1.mov", addr);
        let resolve = r.resolve(&url, &stop);
        let stopper = async {
            let _ = sent_rx.await;
            tokio::time::sleep(Duration::from_millis(100)).await;
            tx.send_replace(true);
        };
        let (outcome, ()) = tokio::time::timeout(Duration::from_secs(10), async {
            tokio::join!(resolve, stopper)
        })
        .await
        .expect("download ignored the stop");

        assert_eq!(outcome.unwrap(), StageOutcome::Cancelled);
        assert!(!dir.path().join("d1.part").exists());
        assert!(!dir.path().join("d1.mov").exists());
    }

    #[test]
    fn test_download_target_needs_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let r = resolver(dir.path());
        let url = Url::parse("https://video.invalid/").unwrap();
        assert!(r.download_target(&url).is_err());
    }
}

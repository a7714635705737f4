//! Transfer manager
//!
//! Moves binary attachment payloads between the app's storage and remote
//! endpoints: streaming downloads with no partial files left behind,
//! multipart uploads, idempotent existence checks, filename sanitization
//! and bounded progress reporting.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{Error, Result};

/// Which target directory a transfer lands in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirKind {
    /// User-visible downloads folder
    Downloads,
    /// App-sandboxed private storage
    Private,
}

/// Replace path-hostile characters with `_`.
///
/// Applied before any filesystem write so a remote-controlled filename can
/// neither escape the target directory nor collide with reserved names.
pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | '?' | '%' | '*' | ':' | '|' | '"' | '<' | '>' => '_',
            other => other,
        })
        .collect()
}

/// ENOSPC gets its own variant so the UI can tell the user to free space
fn classify_io(e: std::io::Error) -> Error {
    if e.raw_os_error() == Some(28) {
        Error::DiskFull
    } else {
        Error::Io(e)
    }
}

/// Emits integer percentages at a bounded step, never per byte
struct ProgressGate {
    step: u8,
    last: Option<u8>,
}

impl ProgressGate {
    fn new(step: u8) -> Self {
        Self {
            step: step.max(1),
            last: None,
        }
    }

    fn update(&mut self, transferred: u64, total: Option<u64>) -> Option<u8> {
        let total = total.filter(|t| *t > 0)?;
        let percent = ((transferred.saturating_mul(100)) / total).min(100) as u8;
        let due = match self.last {
            None => true,
            Some(last) => percent == 100 && last != 100 || percent >= last.saturating_add(self.step),
        };
        if due {
            self.last = Some(percent);
            Some(percent)
        } else {
            None
        }
    }
}

/// Removes a partial file unless the transfer completed. Covers both error
/// returns and cancellation (the caller dropping the future).
struct TempGuard {
    path: PathBuf,
    armed: bool,
}

impl TempGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempGuard {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = std::fs::remove_file(&self.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    // Cleanup failures never block the primary operation
                    warn!("Failed to remove partial file {:?}: {}", self.path, e);
                }
            }
        }
    }
}

/// Download/upload manager for binary payloads
pub struct TransferManager {
    client: Client,
    downloads_dir: PathBuf,
    private_dir: PathBuf,
    progress_step: u8,
}

impl TransferManager {
    /// Create a manager from configuration
    pub fn new(config: &Config) -> Self {
        Self::with_dirs(
            config.downloads_dir(),
            config.private_dir(),
            config.transfer.progress_step_percent,
        )
    }

    /// Create with explicit directories
    pub fn with_dirs(downloads_dir: PathBuf, private_dir: PathBuf, progress_step: u8) -> Self {
        Self {
            client: Client::new(),
            downloads_dir,
            private_dir,
            progress_step,
        }
    }

    fn dir(&self, kind: DirKind) -> &Path {
        match kind {
            DirKind::Downloads => &self.downloads_dir,
            DirKind::Private => &self.private_dir,
        }
    }

    /// Create the target directory if needed and return its absolute path.
    /// Idempotent.
    pub fn ensure_directory(&self, kind: DirKind) -> Result<PathBuf> {
        let dir = self.dir(kind);
        std::fs::create_dir_all(dir).map_err(classify_io)?;
        Ok(dir.to_path_buf())
    }

    /// Resolve the sanitized target path under the downloads directory and
    /// report whether it already exists, without downloading anything.
    pub fn check_exists(&self, filename: &str) -> (PathBuf, bool) {
        let path = self.downloads_dir.join(sanitize_filename(filename));
        let exists = path.exists();
        (path, exists)
    }

    /// Stream a remote body to the downloads directory.
    ///
    /// If the target file already exists the call returns immediately with
    /// that path and performs no network fetch; the remote content is never
    /// re-validated. Otherwise the body streams to a `.part` temp name and
    /// is renamed into place on success, so a failure or cancellation
    /// mid-stream leaves nothing at the final path.
    pub async fn download<F>(
        &self,
        url: &str,
        filename: &str,
        mime_type: &str,
        headers: &[(String, String)],
        mut on_progress: F,
    ) -> Result<PathBuf>
    where
        F: FnMut(u8) + Send,
    {
        let (path, exists) = self.check_exists(filename);
        if exists {
            debug!("{:?} already present, skipping download", path);
            on_progress(100);
            return Ok(path);
        }

        self.ensure_directory(DirKind::Downloads)?;

        let mut request = self.client.get(url);
        if !mime_type.is_empty() {
            request = request.header("Accept", mime_type);
        }
        for (name, value) in headers {
            request = request.header(name, value);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::NetworkTimeout(url.to_string())
            } else {
                Error::Http(e)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }

        let total = response.content_length();
        let temp = PathBuf::from(format!("{}.part", path.display()));
        let mut guard = TempGuard::new(temp.clone());

        let mut file = tokio::fs::File::create(&temp).await.map_err(classify_io)?;
        let mut stream = response.bytes_stream();
        let mut gate = ProgressGate::new(self.progress_step);
        let mut received: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await.map_err(classify_io)?;
            received += chunk.len() as u64;
            if let Some(percent) = gate.update(received, total) {
                on_progress(percent);
            }
        }

        file.flush().await.map_err(classify_io)?;
        drop(file);

        tokio::fs::rename(&temp, &path).await.map_err(classify_io)?;
        guard.disarm();

        if gate.last != Some(100) {
            on_progress(100);
        }
        debug!("Downloaded {} -> {:?} ({} bytes)", url, path, received);
        Ok(path)
    }

    /// Stream a local file to a remote endpoint as one multipart part,
    /// alongside any extra string fields. The source must exist before any
    /// connection is opened.
    pub async fn upload<F>(
        &self,
        local_path: &Path,
        url: &str,
        form_field: &str,
        extra_fields: &[(String, String)],
        headers: &[(String, String)],
        on_progress: F,
    ) -> Result<Vec<u8>>
    where
        F: Fn(u8) + Send + Sync + 'static,
    {
        let metadata = tokio::fs::metadata(local_path)
            .await
            .map_err(|_| Error::MissingSource(local_path.to_path_buf()))?;
        let size = metadata.len();

        let file_name = local_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());

        let file = tokio::fs::File::open(local_path)
            .await
            .map_err(|_| Error::MissingSource(local_path.to_path_buf()))?;

        let sent = Arc::new(AtomicU64::new(0));
        let gate = Arc::new(Mutex::new(ProgressGate::new(self.progress_step)));
        let callback = Arc::new(on_progress);

        let stream = ReaderStream::new(file).inspect({
            let sent = sent.clone();
            let gate = gate.clone();
            let callback = callback.clone();
            move |chunk| {
                if let Ok(bytes) = chunk {
                    let so_far =
                        sent.fetch_add(bytes.len() as u64, Ordering::SeqCst) + bytes.len() as u64;
                    if let Some(percent) = gate.lock().update(so_far, Some(size)) {
                        callback(percent);
                    }
                }
            }
        });

        let part = Part::stream_with_length(Body::wrap_stream(stream), size)
            .file_name(file_name);
        let mut form = Form::new().part(form_field.to_string(), part);
        for (name, value) in extra_fields {
            form = form.text(name.clone(), value.clone());
        }

        let mut request = self.client.post(url).multipart(form);
        for (name, value) in headers {
            request = request.header(name, value);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::NetworkTimeout(url.to_string())
            } else {
                Error::Http(e)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }

        if gate.lock().last != Some(100) {
            callback(100);
        }
        Ok(response.bytes().await?.to_vec())
    }

    /// Hand a local file to the platform's default viewer.
    ///
    /// Existence is re-checked at call time; the file may have been evicted
    /// externally since it was downloaded.
    pub async fn open(&self, path: &Path, mime_type: &str) -> Result<()> {
        if tokio::fs::metadata(path).await.is_err() {
            return Err(Error::MissingSource(path.to_path_buf()));
        }
        debug!("Opening {:?} ({}) in platform viewer", path, mime_type);
        open::that(path)?;
        Ok(())
    }

    /// Delete a previously downloaded file. Returns `false` (not an error)
    /// when the file was already absent.
    pub async fn delete(&self, filename: &str) -> bool {
        let path = self.downloads_dir.join(sanitize_filename(filename));
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!("Deleted {:?}", path);
                true
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => {
                warn!("Failed to delete {:?}: {}", path, e);
                false
            }
        }
    }

    /// Write already-fetched payload bytes into private storage, returning
    /// the file's path
    pub async fn save_attachment_data(&self, data: &[u8], filename: &str) -> Result<PathBuf> {
        self.ensure_directory(DirKind::Private)?;
        let path = self.private_dir.join(sanitize_filename(filename));
        tokio::fs::write(&path, data).await.map_err(classify_io)?;
        debug!("Saved {} bytes to {:?}", data.len(), path);
        Ok(path)
    }
}

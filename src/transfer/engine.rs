//! Transfer Engine
//!
//! Orchestrates uploads and downloads of single files and whole directory
//! trees against a [`CloudBackend`], reporting through the [`TransferRegistry`].
//!
//! # Destination lifecycle
//!
//! 1. A stale file at the destination is deleted before anything is written
//! 2. Missing parent directories are created on demand
//! 3. Bytes stream chunk by chunk into a per-call `.<name>.<uuid>.part` sibling
//! 4. The written length is checked against the descriptor's size
//! 5. The staging file is renamed onto the destination
//!
//! On failure or cancellation the staging file is removed, so a destination
//! path only ever holds a complete file. This holds for background downloads too.
//!
//! # Concurrency
//!
//! Every file stream (single or part of a directory) holds a permit from one
//! engine-wide [`ConcurrencyLimiter`] for its whole duration. Directory
//! transfers spawn one task per file; tasks queue FIFO on the limiter and leave
//! the queue without a permit once the transfer is cancelled.

use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures_util::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinSet;
use tokio_util::io::StreamReader;
use tracing::{debug, info, warn};

use super::backend::CloudBackend;
use super::control::{ControlGuard, TransferControl, TransferControls};
use super::error::TransferError;
use super::limiter::ConcurrencyLimiter;
use super::paths::{safe_component, staging_path, TransferPaths};
use super::registry::{ListUpdate, TransferRegistry};
use super::tree::{self, LocalTree};
use super::types::{CloudFileDescriptor, ItemType, TransferKind, TransferRecord, TransferState};
use crate::config::TransferConfig;

/// Plaintext bytes of one remote file, chunk by chunk.
pub type ChunkStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Stream a file's chunks in order. Stops after the first error.
/// Zero-chunk files yield an empty stream without touching the backend.
pub fn chunk_stream(backend: Arc<dyn CloudBackend>, file: CloudFileDescriptor) -> ChunkStream {
    let file = Arc::new(file);
    Box::pin(stream::unfold(Some(0u64), move |state| {
        let backend = backend.clone();
        let file = file.clone();
        async move {
            let index = state?;
            if index >= file.chunks {
                return None;
            }
            match backend.read_chunk(&file, index).await {
                Ok(chunk) => Some((Ok(chunk), Some(index + 1))),
                Err(e) => Some((Err(io::Error::new(io::ErrorKind::Other, e)), None)),
            }
        }
    }))
}

/// Remote folder to download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryDownload {
    pub uuid: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadOutcome {
    pub transfer_id: String,
    pub path: PathBuf,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadOutcome {
    pub transfer_id: String,
    /// uuid of the new remote file
    pub uuid: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryOutcome {
    pub transfer_id: String,
    /// Local root (download destination or upload source)
    pub local_path: PathBuf,
    /// Remote root (downloaded folder or newly created folder)
    pub remote_uuid: String,
    pub files: usize,
    pub bytes: u64,
}

// ═══════════════════════════════════════════════════════════════════════════
// Destination handles
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
struct HandleCounter {
    open: AtomicUsize,
    peak: AtomicUsize,
}

impl HandleCounter {
    async fn create(self: &Arc<Self>, path: &Path) -> io::Result<DestinationHandle> {
        let file = fs::File::create(path).await?;
        let now = self.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        Ok(DestinationHandle {
            file,
            counter: self.clone(),
        })
    }
}

/// Open destination file, counted until dropped.
struct DestinationHandle {
    file: fs::File,
    counter: Arc<HandleCounter>,
}

impl Drop for DestinationHandle {
    fn drop(&mut self) {
        let result = self
            .counter
            .open
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if result.is_err() {
            warn!("DestinationHandle dropped with open count already 0");
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Progress
// ═══════════════════════════════════════════════════════════════════════════

/// Accumulates bytes for one transfer id (shared by a directory's file tasks).
#[derive(Clone)]
struct Progress {
    registry: TransferRegistry,
    transfer_id: Arc<str>,
    bytes: Arc<AtomicU64>,
}

impl Progress {
    fn new(registry: TransferRegistry, transfer_id: &str) -> Self {
        Self {
            registry,
            transfer_id: Arc::from(transfer_id),
            bytes: Arc::new(AtomicU64::new(0)),
        }
    }

    async fn advance(&self, n: u64) {
        let total = self.bytes.fetch_add(n, Ordering::SeqCst) + n;
        // Racing reports may arrive out of order; the registry keeps the max
        self.registry.report_progress(&self.transfer_id, total).await;
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Pipe: one file between backend and disk
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Clone)]
struct Pipe {
    backend: Arc<dyn CloudBackend>,
    handles: Arc<HandleCounter>,
    chunk_size: usize,
}

impl Pipe {
    async fn download(
        &self,
        file: &CloudFileDescriptor,
        destination: &Path,
        control: Option<&TransferControl>,
        progress: Option<&Progress>,
    ) -> Result<u64, TransferError> {
        prepare_destination(destination).await?;

        if file.is_empty() {
            drop(self.handles.create(destination).await?);
            debug!("Empty file {} written without opening a stream", file.uuid);
            return Ok(0);
        }

        let staging = staging_path(destination);
        let written = match self.stream_into(file, &staging, control, progress).await {
            Ok(written) => written,
            Err(e) => {
                remove_quietly(&staging).await;
                return Err(e);
            }
        };
        if let Err(e) = fs::rename(&staging, destination).await {
            remove_quietly(&staging).await;
            return Err(e.into());
        }
        debug!("Downloaded {} ({} bytes) to {:?}", file.uuid, written, destination);
        Ok(written)
    }

    async fn stream_into(
        &self,
        file: &CloudFileDescriptor,
        staging: &Path,
        control: Option<&TransferControl>,
        progress: Option<&Progress>,
    ) -> Result<u64, TransferError> {
        let mut handle = self.handles.create(staging).await?;
        let mut written = 0u64;

        for index in 0..file.chunks {
            let chunk = match control {
                Some(control) => {
                    if !control.wait_while_paused().await {
                        return Err(TransferError::Cancelled);
                    }
                    tokio::select! {
                        biased;
                        _ = control.cancelled() => return Err(TransferError::Cancelled),
                        chunk = self.backend.read_chunk(file, index) => chunk?,
                    }
                }
                None => self.backend.read_chunk(file, index).await?,
            };

            // One chunk in flight: the next read waits for this write
            handle.file.write_all(&chunk).await?;
            written += chunk.len() as u64;
            if let Some(progress) = progress {
                progress.advance(chunk.len() as u64).await;
            }
        }

        handle.file.flush().await?;
        drop(handle);

        if written != file.size {
            return Err(TransferError::SizeMismatch {
                expected: file.size,
                actual: written,
            });
        }
        Ok(written)
    }

    /// Upload one local file; returns the new remote uuid.
    async fn upload(
        &self,
        source: &Path,
        parent: &str,
        name: &str,
        size: u64,
        control: Option<&TransferControl>,
        progress: Option<&Progress>,
    ) -> Result<String, TransferError> {
        let upload_id = self.backend.begin_upload(parent, name, size).await?;

        let result = async {
            self.send_chunks(&upload_id, source, size, control, progress)
                .await?;
            self.backend.finish_upload(&upload_id).await
        }
        .await;

        if result.is_err() {
            if let Err(e) = self.backend.abort_upload(&upload_id).await {
                warn!("Failed to abort upload {}: {}", upload_id, e);
            }
        }
        result
    }

    async fn send_chunks(
        &self,
        upload_id: &str,
        source: &Path,
        size: u64,
        control: Option<&TransferControl>,
        progress: Option<&Progress>,
    ) -> Result<(), TransferError> {
        let mut reader = fs::File::open(source).await?;
        let mut buffer = vec![0u8; self.chunk_size.max(1)];
        let mut sent = 0u64;
        let mut index = 0u64;

        loop {
            if let Some(control) = control {
                if !control.wait_while_paused().await {
                    return Err(TransferError::Cancelled);
                }
            }

            let n = read_full(&mut reader, &mut buffer).await?;
            if n == 0 {
                break;
            }
            let data = Bytes::copy_from_slice(&buffer[..n]);

            match control {
                Some(control) => tokio::select! {
                    biased;
                    _ = control.cancelled() => return Err(TransferError::Cancelled),
                    result = self.backend.write_chunk(upload_id, index, data) => result?,
                },
                None => self.backend.write_chunk(upload_id, index, data).await?,
            }

            sent += n as u64;
            index += 1;
            if let Some(progress) = progress {
                progress.advance(n as u64).await;
            }
        }

        if sent != size {
            return Err(TransferError::SizeMismatch {
                expected: size,
                actual: sent,
            });
        }
        Ok(())
    }
}

/// Fill `buf` unless EOF comes first.
async fn read_full<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Delete a stale file at `destination` and create its parents.
async fn prepare_destination(destination: &Path) -> Result<(), TransferError> {
    match fs::symlink_metadata(destination).await {
        Ok(meta) if meta.is_dir() => {
            return Err(TransferError::Io(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("destination {:?} is a directory", destination),
            )));
        }
        Ok(_) => match fs::remove_file(destination).await {
            Ok(()) => debug!("Removed stale destination {:?}", destination),
            // Another download to the same path got there first
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        },
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    if let Some(parent) = destination.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    Ok(())
}

/// Make `root` a directory, replacing a stale file of the same name.
async fn prepare_directory(root: &Path) -> Result<(), TransferError> {
    if let Ok(meta) = fs::symlink_metadata(root).await {
        if !meta.is_dir() {
            fs::remove_file(root).await?;
            debug!("Removed stale file at directory destination {:?}", root);
        }
    }
    fs::create_dir_all(root).await?;
    Ok(())
}

async fn remove_quietly(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => debug!("Removed staging file {:?}", path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove staging file {:?}: {}", path, e),
    }
}

fn file_name_of(path: &Path) -> Result<String, TransferError> {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| TransferError::InvalidSource(format!("{:?} has no file name", path)))
}

/// Wait for every file task. The first real failure cancels the rest.
async fn drain(
    mut tasks: JoinSet<Result<u64, TransferError>>,
    control: &TransferControl,
) -> Result<u64, TransferError> {
    let mut bytes = 0u64;
    let mut cancelled = false;
    let mut first_error: Option<TransferError> = None;

    while let Some(joined) = tasks.join_next().await {
        let outcome = joined.unwrap_or_else(|e| {
            Err(TransferError::Backend(format!("file task failed: {}", e)))
        });
        match outcome {
            Ok(n) => bytes += n,
            Err(e) if e.is_cancelled() => cancelled = true,
            Err(e) => {
                if first_error.is_none() {
                    warn!("File transfer failed, cancelling the rest: {}", e);
                    control.cancel();
                    first_error = Some(e);
                }
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None if cancelled => Err(TransferError::Cancelled),
        None => Ok(bytes),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Engine
// ═══════════════════════════════════════════════════════════════════════════

/// Cheap to clone; clones share the limiter, controls and counters.
#[derive(Clone)]
pub struct TransferEngine {
    backend: Arc<dyn CloudBackend>,
    registry: TransferRegistry,
    paths: TransferPaths,
    limiter: ConcurrencyLimiter,
    controls: Arc<TransferControls>,
    pipe: Pipe,
}

impl TransferEngine {
    pub fn new(
        backend: Arc<dyn CloudBackend>,
        registry: TransferRegistry,
        paths: TransferPaths,
        config: TransferConfig,
    ) -> Self {
        let pipe = Pipe {
            backend: backend.clone(),
            handles: Arc::new(HandleCounter::default()),
            chunk_size: config.chunk_size,
        };
        Self {
            backend,
            registry,
            paths,
            limiter: ConcurrencyLimiter::new(config.max_concurrent_files),
            controls: Arc::new(TransferControls::new()),
            pipe,
        }
    }

    pub fn registry(&self) -> &TransferRegistry {
        &self.registry
    }

    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }

    pub fn paths(&self) -> &TransferPaths {
        &self.paths
    }

    pub fn open_destination_handles(&self) -> usize {
        self.pipe.handles.open.load(Ordering::SeqCst)
    }

    pub fn peak_open_destination_handles(&self) -> usize {
        self.pipe.handles.peak.load(Ordering::SeqCst)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Controls
    // ─────────────────────────────────────────────────────────────────────

    /// The record turns `stopped` once the transfer task has unwound.
    pub fn cancel(&self, transfer_id: &str) -> bool {
        self.controls.cancel(transfer_id)
    }

    pub async fn pause(&self, transfer_id: &str) -> bool {
        if !self.controls.pause(transfer_id) {
            return false;
        }
        self.registry.mark_paused(transfer_id).await;
        true
    }

    pub async fn resume(&self, transfer_id: &str) -> bool {
        if !self.controls.resume(transfer_id) {
            return false;
        }
        self.registry.mark_resumed(transfer_id).await;
        true
    }

    pub fn cancel_all(&self) {
        self.controls.cancel_all();
    }

    // ─────────────────────────────────────────────────────────────────────
    // Bookkeeping
    // ─────────────────────────────────────────────────────────────────────

    async fn track(
        &self,
        kind: TransferKind,
        item_type: ItemType,
        uuid: &str,
        name: &str,
        total_size: u64,
    ) -> (String, Arc<TransferControl>, ControlGuard, Progress) {
        let transfer_id = uuid::Uuid::new_v4().to_string();
        // Controllable as soon as the record is visible
        let control = self.controls.register(&transfer_id);
        let guard = ControlGuard::new(self.controls.clone(), transfer_id.clone());
        self.registry
            .enqueue(TransferRecord::new(
                transfer_id.clone(),
                kind,
                item_type,
                uuid.to_string(),
                name.to_string(),
                total_size,
            ))
            .await;
        let progress = Progress::new(self.registry.clone(), &transfer_id);
        (transfer_id, control, guard, progress)
    }

    async fn settle<T>(&self, transfer_id: &str, result: &Result<T, TransferError>) {
        match result {
            Ok(_) => {
                info!("Transfer {} finished", transfer_id);
                self.registry
                    .finish(transfer_id, TransferState::Finished, None)
                    .await;
            }
            Err(e) if e.is_cancelled() => {
                info!("Transfer {} stopped", transfer_id);
                self.registry
                    .finish(transfer_id, TransferState::Stopped, None)
                    .await;
            }
            Err(e) => {
                warn!("Transfer {} failed: {}", transfer_id, e);
                self.registry
                    .finish(transfer_id, TransferState::Error, Some(e.to_string()))
                    .await;
            }
        }
    }

    async fn set_total(&self, transfer_id: &str, total: u64) {
        let id = transfer_id.to_string();
        self.registry
            .set_transfers(ListUpdate::with(move |mut list| {
                for record in list.iter_mut().filter(|r| r.id == id) {
                    record.total_size = total;
                }
                list
            }))
            .await
    }

    // ─────────────────────────────────────────────────────────────────────
    // Downloads
    // ─────────────────────────────────────────────────────────────────────

    /// Foreground download: registry record, progress and controls.
    /// Without a destination the file lands in the temporary downloads area.
    pub async fn download_file(
        &self,
        file: CloudFileDescriptor,
        destination: Option<PathBuf>,
    ) -> Result<DownloadOutcome, TransferError> {
        let destination = destination.unwrap_or_else(|| self.paths.default_download_path(&file));
        let (transfer_id, control, _guard, progress) = self
            .track(
                TransferKind::Download,
                ItemType::File,
                &file.uuid,
                &file.name,
                file.size,
            )
            .await;
        info!(
            "Download {} ({} bytes) -> {:?} [{}]",
            file.name, file.size, destination, transfer_id
        );

        let result = async {
            let _permit = self.limiter.acquire_or_cancel(&control).await?;
            self.registry.mark_started(&transfer_id).await;
            self.pipe
                .download(&file, &destination, Some(control.as_ref()), Some(&progress))
                .await
        }
        .await;

        self.settle(&transfer_id, &result).await;
        Ok(DownloadOutcome {
            bytes: result?,
            transfer_id,
            path: destination,
        })
    }

    /// Silent download for internal reads (thumbnails, previews). No registry record.
    pub async fn download_file_background(
        &self,
        file: CloudFileDescriptor,
        destination: Option<PathBuf>,
    ) -> Result<PathBuf, TransferError> {
        let destination = destination.unwrap_or_else(|| self.paths.default_download_path(&file));
        let _permit = self.limiter.acquire().await?;
        self.pipe.download(&file, &destination, None, None).await?;
        Ok(destination)
    }

    pub async fn download_directory(
        &self,
        directory: DirectoryDownload,
        destination: Option<PathBuf>,
    ) -> Result<DirectoryOutcome, TransferError> {
        let destination = destination.unwrap_or_else(|| {
            self.paths
                .downloads_dir()
                .join(safe_component(&directory.uuid))
                .join(safe_component(&directory.name))
        });
        let (transfer_id, control, _guard, progress) = self
            .track(
                TransferKind::Download,
                ItemType::Directory,
                &directory.uuid,
                &directory.name,
                0,
            )
            .await;
        info!(
            "Download directory {} -> {:?} [{}]",
            directory.name, destination, transfer_id
        );

        let result = self
            .download_tree(&directory, &destination, &transfer_id, &control, &progress)
            .await;

        self.settle(&transfer_id, &result).await;
        let (files, bytes) = result?;
        Ok(DirectoryOutcome {
            transfer_id,
            local_path: destination,
            remote_uuid: directory.uuid,
            files,
            bytes,
        })
    }

    async fn download_tree(
        &self,
        directory: &DirectoryDownload,
        destination: &Path,
        transfer_id: &str,
        control: &Arc<TransferControl>,
        progress: &Progress,
    ) -> Result<(usize, u64), TransferError> {
        let listing = tokio::select! {
            biased;
            _ = control.cancelled() => return Err(TransferError::Cancelled),
            listing = self.backend.list_directory_tree(&directory.uuid) => listing?,
        };
        let flat = tree::flatten(&directory.uuid, &listing)?;
        self.set_total(transfer_id, flat.total_size()).await;
        self.registry.mark_started(transfer_id).await;

        // Parents before children
        prepare_directory(destination).await?;
        for dir in &flat.directories {
            fs::create_dir_all(destination.join(&dir.relative_path)).await?;
        }

        if flat.is_empty() {
            debug!("Directory {} has no files", directory.uuid);
            return Ok((0, 0));
        }

        let file_count = flat.files.len();
        debug!(
            "Directory {}: {} files, {} bytes",
            directory.uuid,
            file_count,
            flat.total_size()
        );

        let mut tasks = JoinSet::new();
        for entry in flat.files {
            let pipe = self.pipe.clone();
            let limiter = self.limiter.clone();
            let control = control.clone();
            let progress = progress.clone();
            let target = destination.join(&entry.relative_path);
            tasks.spawn(async move {
                let _permit = limiter.acquire_or_cancel(&control).await?;
                pipe.download(&entry.file, &target, Some(control.as_ref()), Some(&progress))
                    .await
            });
        }

        let bytes = drain(tasks, control).await?;
        Ok((file_count, bytes))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Uploads
    // ─────────────────────────────────────────────────────────────────────

    pub async fn upload_file(
        &self,
        local_path: &Path,
        parent_uuid: &str,
    ) -> Result<UploadOutcome, TransferError> {
        let meta = fs::metadata(local_path)
            .await
            .map_err(|e| TransferError::InvalidSource(format!("{:?}: {}", local_path, e)))?;
        if !meta.is_file() {
            return Err(TransferError::InvalidSource(format!(
                "{:?} is not a file",
                local_path
            )));
        }
        let name = file_name_of(local_path)?;
        let size = meta.len();

        let (transfer_id, control, _guard, progress) = self
            .track(TransferKind::Upload, ItemType::File, parent_uuid, &name, size)
            .await;
        info!("Upload {:?} ({} bytes) [{}]", local_path, size, transfer_id);

        let result = async {
            let _permit = self.limiter.acquire_or_cancel(&control).await?;
            self.registry.mark_started(&transfer_id).await;
            self.pipe
                .upload(
                    local_path,
                    parent_uuid,
                    &name,
                    size,
                    Some(control.as_ref()),
                    Some(&progress),
                )
                .await
        }
        .await;

        self.settle(&transfer_id, &result).await;
        Ok(UploadOutcome {
            uuid: result?,
            transfer_id,
            bytes: size,
        })
    }

    /// Upload in-memory content by staging it in the temporary uploads area.
    /// The staged copy is removed whatever the outcome.
    pub async fn upload_bytes(
        &self,
        name: &str,
        data: Bytes,
        parent_uuid: &str,
    ) -> Result<UploadOutcome, TransferError> {
        let staged = self.paths.upload_staging_path(name);
        let staging_dir = staged.parent().map(Path::to_path_buf);
        if let Some(dir) = &staging_dir {
            fs::create_dir_all(dir).await?;
        }

        let result = async {
            fs::write(&staged, &data).await?;
            self.upload_file(&staged, parent_uuid).await
        }
        .await;

        if let Some(dir) = &staging_dir {
            if let Err(e) = fs::remove_dir_all(dir).await {
                warn!("Failed to remove staged upload {:?}: {}", dir, e);
            }
        }
        result
    }

    pub async fn upload_directory(
        &self,
        local_dir: &Path,
        parent_uuid: &str,
    ) -> Result<DirectoryOutcome, TransferError> {
        let meta = fs::metadata(local_dir)
            .await
            .map_err(|e| TransferError::InvalidSource(format!("{:?}: {}", local_dir, e)))?;
        if !meta.is_dir() {
            return Err(TransferError::InvalidSource(format!(
                "{:?} is not a directory",
                local_dir
            )));
        }
        let name = file_name_of(local_dir)?;

        let root = local_dir.to_path_buf();
        let local = tokio::task::spawn_blocking(move || tree::walk_local(&root))
            .await
            .map_err(|e| TransferError::Backend(format!("directory scan failed: {}", e)))??;

        let (transfer_id, control, _guard, progress) = self
            .track(
                TransferKind::Upload,
                ItemType::Directory,
                parent_uuid,
                &name,
                local.total_size(),
            )
            .await;
        info!(
            "Upload directory {:?} ({} files) [{}]",
            local_dir,
            local.files.len(),
            transfer_id
        );

        let result = self
            .upload_tree(local, parent_uuid, &name, &transfer_id, &control, &progress)
            .await;

        self.settle(&transfer_id, &result).await;
        let (remote_uuid, files, bytes) = result?;
        Ok(DirectoryOutcome {
            transfer_id,
            local_path: local_dir.to_path_buf(),
            remote_uuid,
            files,
            bytes,
        })
    }

    async fn upload_tree(
        &self,
        local: LocalTree,
        parent_uuid: &str,
        name: &str,
        transfer_id: &str,
        control: &Arc<TransferControl>,
        progress: &Progress,
    ) -> Result<(String, usize, u64), TransferError> {
        self.registry.mark_started(transfer_id).await;

        let root_uuid = self.backend.create_folder(parent_uuid, name).await?;
        let mut folder_ids = std::collections::HashMap::new();
        folder_ids.insert(PathBuf::new(), root_uuid.clone());

        // Depth order guarantees each parent already has a remote uuid
        for dir in &local.directories {
            if control.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            let parent_id = remote_parent(&folder_ids, &dir.relative_path)?;
            let dir_name = file_name_of(&dir.relative_path)?;
            let id = self.backend.create_folder(&parent_id, &dir_name).await?;
            folder_ids.insert(dir.relative_path.clone(), id);
        }

        if local.files.is_empty() {
            return Ok((root_uuid, 0, 0));
        }

        let file_count = local.files.len();
        let mut tasks = JoinSet::new();
        for entry in local.files {
            let parent_id = remote_parent(&folder_ids, &entry.relative_path)?;
            let file_name = file_name_of(&entry.relative_path)?;
            let pipe = self.pipe.clone();
            let limiter = self.limiter.clone();
            let control = control.clone();
            let progress = progress.clone();
            tasks.spawn(async move {
                let _permit = limiter.acquire_or_cancel(&control).await?;
                pipe.upload(
                    &entry.path,
                    &parent_id,
                    &file_name,
                    entry.size,
                    Some(control.as_ref()),
                    Some(&progress),
                )
                .await?;
                Ok(entry.size)
            });
        }

        let bytes = drain(tasks, control).await?;
        Ok((root_uuid, file_count, bytes))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Stream passthrough
    // ─────────────────────────────────────────────────────────────────────

    /// Raw chunk stream; no filesystem access, no registry record.
    pub fn read_stream(&self, file: CloudFileDescriptor) -> ChunkStream {
        chunk_stream(self.backend.clone(), file)
    }

    pub fn read_stream_reader(&self, file: CloudFileDescriptor) -> StreamReader<ChunkStream, Bytes> {
        StreamReader::new(self.read_stream(file))
    }
}

fn remote_parent(
    folder_ids: &std::collections::HashMap<PathBuf, String>,
    relative_path: &Path,
) -> Result<String, TransferError> {
    let parent = relative_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();
    folder_ids.get(&parent).cloned().ok_or_else(|| {
        TransferError::InvalidTree(format!("no remote folder for {:?}", parent))
    })
}

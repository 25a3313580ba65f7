//! Staging area for uploaded attachments and inline images.
//!
//! Every upload lives in its own directory under the staging root:
//! `<root>/<upload id>/<file name>`. Chunked uploads get their id from the
//! server on the first chunk and must send it back with every later chunk, so
//! two clients uploading `report.pdf` at the same time never share a file.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fmt::Debug;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::SystemTime;

use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use uuid::Uuid;

use crate::configuration::Settings;
use crate::domain::ChunkMeta;
use crate::utils::error_chain_fmt;

#[derive(thiserror::Error)]
pub enum UploadError {
    #[error("{0}")]
    Validation(String),
    #[error("Could not write staged upload")]
    Io(#[from] std::io::Error),
}

impl Debug for UploadError {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}

/// Reduce a client supplied file name to its last path component, so that
/// `../../etc/passwd` can only ever become `passwd`.
pub fn sanitize_filename(name: &str) -> Result<String, UploadError> {
    Path::new(name.trim())
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .ok_or_else(|| UploadError::Validation(format!("filename: invalid file name {name:?}")))
}

/// One chunked upload in progress. Only lives in memory.
struct UploadSession {
    path: PathBuf,
    chunks_written: u32,
    total_chunks: u32,
    /// Refreshed by every accepted chunk; the sweeper measures idleness from it
    last_chunk_at: Instant,
}

/// A directory in the staging area holding files for exactly one dispatch.
/// Call `cleanup` once the files have been sent (or sending failed).
#[derive(Debug)]
pub struct StagedUpload {
    dir: PathBuf,
    /// Attachment paths, one per distinct file name
    pub attachments: Vec<PathBuf>,
    /// Content id -> image path
    pub inline_images: BTreeMap<String, PathBuf>,
}

impl StagedUpload {
    pub fn dir(&self) -> &Path { &self.dir }

    /// Remove the staged files. Failure is logged, not returned; the sweeper
    /// gets another go at it later.
    #[tracing::instrument(name = "Removing staged upload", skip(self), fields(dir = %self.dir.display()))]
    pub async fn cleanup(self) {
        if let Err(e) = tokio::fs::remove_dir_all(&self.dir).await {
            tracing::warn!(error.cause_chain = ?e, "could not remove staged upload");
        }
    }
}

/// Result of accepting one chunk
#[derive(Debug)]
pub enum ChunkProgress {
    /// More chunks are expected for this upload
    Partial { upload_id: Uuid, chunks_written: u32 },
    /// The last chunk was written; the file is ready to be sent
    Complete { upload_id: Uuid, staged: StagedUpload },
}

/// A file received in a non-chunked request, already on local disk (e.g. in a
/// temp file created by the multipart extractor).
pub struct IncomingFile<'a> {
    pub file_name: &'a str,
    pub path: &'a Path,
}

/// Reassembles chunked uploads and stages plain uploads. Cheap to share
/// behind `Arc`/`web::Data`.
pub struct UploadAssembler {
    root: PathBuf,
    // std mutex: never held across an await
    sessions: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<UploadSession>>>>,
}

impl UploadAssembler {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path { &self.root }

    fn session(
        &self,
        upload_id: &Uuid,
    ) -> Option<Arc<tokio::sync::Mutex<UploadSession>>> {
        self.sessions
            .lock()
            .expect("upload session table poisoned")
            .get(upload_id)
            .cloned()
    }

    fn forget(
        &self,
        upload_id: &Uuid,
    ) {
        self.sessions
            .lock()
            .expect("upload session table poisoned")
            .remove(upload_id);
    }

    /// Accept one chunk of `file_name`.
    ///
    /// The first chunk (index 0) opens a session under a freshly issued id and
    /// creates the destination file; an `upload_id` sent along with it is
    /// ignored, so no client can restart somebody else's upload. Every other
    /// chunk must name an open session and arrive in order: chunks are
    /// appended as they come, never buffered or reordered.
    ///
    /// On an I/O error the partial file is left where it is, for inspection;
    /// the sweeper removes it eventually.
    #[tracing::instrument(
        name = "Accepting upload chunk",
        skip(self, bytes),
        fields(upload_id = tracing::field::Empty, n_bytes = bytes.len())
    )]
    pub async fn begin_or_continue(
        &self,
        upload_id: Option<Uuid>,
        file_name: &str,
        chunk: ChunkMeta,
        bytes: &[u8],
    ) -> Result<ChunkProgress, UploadError> {
        let file_name = sanitize_filename(file_name)?;

        let (upload_id, session) = match (chunk.is_first(), upload_id) {
            (true, _) => {
                let id = Uuid::new_v4();
                let dir = self.root.join(id.to_string());
                tokio::fs::create_dir_all(&dir).await?;
                let path = dir.join(&file_name);
                tokio::fs::File::create(&path).await?;
                let session = Arc::new(tokio::sync::Mutex::new(UploadSession {
                    path,
                    chunks_written: 0,
                    total_chunks: chunk.total,
                    last_chunk_at: Instant::now(),
                }));
                self.sessions
                    .lock()
                    .expect("upload session table poisoned")
                    .insert(id, session.clone());
                (id, session)
            }
            (false, Some(id)) => {
                let session = self.session(&id).ok_or_else(|| {
                    UploadError::Validation(format!("upload_id: no upload in progress for {id}"))
                })?;
                (id, session)
            }
            (false, None) => {
                return Err(UploadError::Validation(
                    "upload_id: required for every chunk after the first".to_string(),
                ))
            }
        };
        tracing::Span::current().record("upload_id", tracing::field::display(upload_id));

        // serialises writers of the same upload; other uploads are unaffected
        let mut session = session.lock().await;

        if session.path.file_name().and_then(|n| n.to_str()) != Some(file_name.as_str()) {
            return Err(UploadError::Validation(format!(
                "filename: upload {upload_id} is for a different file"
            )));
        }
        if session.total_chunks != chunk.total {
            return Err(UploadError::Validation(format!(
                "total_chunks: upload {upload_id} was started with {} chunks",
                session.total_chunks
            )));
        }
        if session.chunks_written != chunk.index {
            return Err(UploadError::Validation(format!(
                "chunk_index: expected chunk {}, got {}",
                session.chunks_written, chunk.index
            )));
        }

        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&session.path)
            .await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        session.chunks_written += 1;
        session.last_chunk_at = Instant::now();

        if !chunk.is_last() {
            return Ok(ChunkProgress::Partial {
                upload_id,
                chunks_written: session.chunks_written,
            });
        }

        self.forget(&upload_id);
        let path = session.path.clone();
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.join(upload_id.to_string()));
        tracing::info!(path = %path.display(), "upload complete");
        Ok(ChunkProgress::Complete {
            upload_id,
            staged: StagedUpload {
                dir,
                attachments: vec![path],
                inline_images: BTreeMap::new(),
            },
        })
    }

    /// Copy the files of a non-chunked request into a fresh staging directory.
    /// Files sharing a name are only staged once (the first one wins); inline
    /// images are keyed by file name, which doubles as their content id.
    #[tracing::instrument(
        name = "Staging uploaded files",
        skip_all,
        fields(n_attachments = attachments.len(), n_images = images.len())
    )]
    pub async fn stage_files(
        &self,
        attachments: &[IncomingFile<'_>],
        images: &[IncomingFile<'_>],
    ) -> Result<StagedUpload, UploadError> {
        let dir = self.root.join(Uuid::new_v4().to_string());
        tokio::fs::create_dir_all(&dir).await?;

        let mut staged = StagedUpload {
            dir,
            attachments: vec![],
            inline_images: BTreeMap::new(),
        };

        // attachments and images share the directory, so they share the name
        // space as well
        let mut taken: HashMap<String, PathBuf> = HashMap::new();
        for file in attachments {
            let name = sanitize_filename(file.file_name)?;
            if taken.contains_key(&name) {
                continue;
            }
            let dest = staged.dir.join(&name);
            tokio::fs::copy(file.path, &dest).await?;
            staged.attachments.push(dest.clone());
            taken.insert(name, dest);
        }
        for file in images {
            let name = sanitize_filename(file.file_name)?;
            if staged.inline_images.contains_key(&name) {
                continue;
            }
            let dest = match taken.get(&name) {
                Some(path) => path.clone(),
                None => {
                    let dest = staged.dir.join(&name);
                    tokio::fs::copy(file.path, &dest).await?;
                    taken.insert(name.clone(), dest.clone());
                    dest
                }
            };
            staged.inline_images.insert(name, dest);
        }

        Ok(staged)
    }

    /// Forget chunked sessions idle for more than `max_age` and delete staging
    /// directories last modified more than `max_age` ago. Returns the number of
    /// directories removed.
    #[tracing::instrument(name = "Sweeping staging area", skip(self))]
    pub async fn sweep(
        &self,
        max_age: Duration,
    ) -> Result<usize, std::io::Error> {
        let stale: Vec<Uuid> = {
            let sessions = self.sessions.lock().expect("upload session table poisoned");
            sessions
                .iter()
                .filter(|(_, s)| match s.try_lock() {
                    Ok(s) => s.last_chunk_at.elapsed() > max_age,
                    // busy writing, so not abandoned
                    Err(_) => false,
                })
                .map(|(id, _)| *id)
                .collect()
        };
        for id in &stale {
            tracing::info!(upload_id = %id, "forgetting abandoned upload");
            self.forget(id);
        }

        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };

        let now = SystemTime::now();
        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if !meta.is_dir() {
                continue;
            }
            let age = meta
                .modified()
                .ok()
                .and_then(|m| now.duration_since(m).ok())
                .unwrap_or_default();
            if age <= max_age {
                continue;
            }
            // a live session keeps its directory, however old
            let live = entry
                .file_name()
                .to_str()
                .and_then(|n| n.parse::<Uuid>().ok())
                .is_some_and(|id| self.session(&id).is_some());
            if live {
                continue;
            }
            match tokio::fs::remove_dir_all(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) => tracing::warn!(
                    error.cause_chain = ?e,
                    dir = %entry.path().display(),
                    "could not remove stale staging directory"
                ),
            }
        }
        Ok(removed)
    }
}

async fn sweep_loop(
    assembler: &UploadAssembler,
    interval: Duration,
    max_age: Duration,
) -> Result<(), anyhow::Error> {
    loop {
        match assembler.sweep(max_age).await {
            Err(e) => tracing::error!(error.cause_chain = ?e, "staging sweep failed"),
            Ok(0) => {}
            Ok(n) => tracing::info!("removed {n} stale staging directories"),
        }
        tokio::time::sleep(interval).await;
    }
}

/// To be run as a separate worker, next to the API. Shares the assembler with
/// the API so that in-flight uploads are never swept.
pub async fn init_sweeper_worker(
    cfg: Settings,
    assembler: Arc<UploadAssembler>,
) -> Result<(), anyhow::Error> {
    sweep_loop(
        &assembler,
        cfg.staging.sweep_interval(),
        cfg.staging.max_age(),
    )
    .await
}

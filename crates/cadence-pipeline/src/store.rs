use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use cadence_core::envelope::HandoffEnvelope;
use cadence_core::error::{CadenceError, Result};
use cadence_core::metadata::{CampaignMetadata, METADATA_FILE};
use cadence_core::types::{handoff_file_name, transition_name, Stage};

use crate::io::bounded;
use crate::path::{CampaignPathResolver, HANDOFFS_DIR};

/// Name of the advisory lock file inside `handoffs/`.
pub const LOCK_FILE: &str = ".lock";
const TEMP_SUFFIX: &str = "tmp";
const SUPERSEDED_MARKER: &str = ".superseded-";
const REJECTED_MARKER: &str = ".rejected-";
const STALE_LOCK_MARKER: &str = ".stale-";
const STAGED_SUFFIX: &str = "staged.json";
const DEFAULT_LOCK_STALE_AFTER: Duration = Duration::from_secs(300);

/// Contents of the advisory lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub transition: String,
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

/// Held while one transition is being written. Dropping it releases the
/// lock file.
#[derive(Debug)]
pub struct HandoffLock {
    path: PathBuf,
}

impl HandoffLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for HandoffLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Failed to release handoff lock");
        }
    }
}

/// Durable storage for one campaign directory: envelopes, metadata and the
/// single-writer lock.
#[derive(Debug, Clone)]
pub struct CampaignStore {
    dir: PathBuf,
    canonical: String,
    io_timeout: Duration,
    lock_stale_after: Duration,
}

impl CampaignStore {
    pub fn new(dir: impl Into<PathBuf>, canonical: impl Into<String>, io_timeout: Duration) -> Self {
        Self {
            dir: dir.into(),
            canonical: canonical.into(),
            io_timeout,
            lock_stale_after: DEFAULT_LOCK_STALE_AFTER,
        }
    }

    pub fn with_lock_stale_after(mut self, after: Duration) -> Self {
        self.lock_stale_after = after;
        self
    }

    /// Store for a canonical campaign path, located via `resolver`.
    pub fn open(resolver: &CampaignPathResolver, canonical: &str, io_timeout: Duration) -> Self {
        Self::new(resolver.absolute(canonical), canonical, io_timeout)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Canonical (unresolved) campaign path, as written into envelopes.
    pub fn canonical(&self) -> &str {
        &self.canonical
    }

    pub fn io_timeout(&self) -> Duration {
        self.io_timeout
    }

    pub fn handoffs_dir(&self) -> PathBuf {
        self.dir.join(HANDOFFS_DIR)
    }

    pub fn envelope_path(&self, from: Stage, to: Option<Stage>) -> PathBuf {
        self.handoffs_dir().join(handoff_file_name(from, to))
    }

    /// Where a candidate envelope waits for validation. Never part of the
    /// chain.
    pub fn staged_path(&self, from: Stage, to: Option<Stage>) -> PathBuf {
        self.handoffs_dir()
            .join(format!("{}.{}", transition_name(from, to), STAGED_SUFFIX))
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.dir.join(METADATA_FILE)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.handoffs_dir().join(LOCK_FILE)
    }

    // ── Atomic writes ───────────────────────────────────────────

    /// Serialize `value` and commit it to `target` via temp file + rename.
    /// Returns the number of bytes written.
    pub async fn write_json_atomic<T: Serialize>(&self, target: &Path, value: &T) -> Result<u64> {
        let bytes = serde_json::to_vec_pretty(value)?;
        let temp = temp_path(target);

        if let Some(parent) = target.parent() {
            bounded(
                &format!("create {}", parent.display()),
                self.io_timeout,
                tokio::fs::create_dir_all(parent),
            )
            .await?;
        }

        if tokio::fs::try_exists(&temp).await.unwrap_or(false) {
            warn!(path = %temp.display(), "Removing stale temp file from an abandoned write");
            bounded(
                &format!("remove {}", temp.display()),
                self.io_timeout,
                tokio::fs::remove_file(&temp),
            )
            .await?;
        }

        let len = bytes.len() as u64;
        bounded(&format!("write {}", temp.display()), self.io_timeout, async {
            let mut file = tokio::fs::File::create(&temp).await?;
            file.write_all(&bytes).await?;
            file.sync_all().await?;
            Ok(())
        })
        .await?;

        bounded(
            &format!("commit {}", target.display()),
            self.io_timeout,
            tokio::fs::rename(&temp, target),
        )
        .await?;

        debug!(path = %target.display(), bytes = len, "Committed file");
        Ok(len)
    }

    async fn read_json<T: DeserializeOwned>(&self, path: &Path) -> Result<T> {
        let bytes = bounded(
            &format!("read {}", path.display()),
            self.io_timeout,
            tokio::fs::read(path),
        )
        .await?;
        serde_json::from_slice(&bytes).map_err(|e| {
            CadenceError::Persistence(format!("{} is not valid: {}", path.display(), e))
        })
    }

    // ── Envelopes ───────────────────────────────────────────────

    /// Commit an envelope under its canonical file name.
    pub async fn write_envelope(&self, envelope: &HandoffEnvelope) -> Result<(PathBuf, u64)> {
        let target = self.envelope_path(envelope.source_stage(), envelope.target_stage());
        let bytes = self.write_json_atomic(&target, envelope).await?;
        Ok((target, bytes))
    }

    /// Write a candidate envelope to its staging file. Loaders never see it
    /// until [`promote_staged`](Self::promote_staged) moves it into place.
    pub async fn write_staged(&self, envelope: &HandoffEnvelope) -> Result<(PathBuf, u64)> {
        let target = self.staged_path(envelope.source_stage(), envelope.target_stage());
        let bytes = self.write_json_atomic(&target, envelope).await?;
        Ok((target, bytes))
    }

    /// Move the staged envelope for `from -> to` to its canonical name. Any
    /// committed file must already have been superseded.
    pub async fn promote_staged(&self, from: Stage, to: Option<Stage>) -> Result<PathBuf> {
        let staged = self.staged_path(from, to);
        let target = self.envelope_path(from, to);
        bounded(
            &format!("commit {}", target.display()),
            self.io_timeout,
            tokio::fs::rename(&staged, &target),
        )
        .await?;
        Ok(target)
    }

    /// Archive a staged envelope the validator refused. The committed
    /// envelope for the transition, if any, is left alone.
    pub async fn reject_staged(&self, from: Stage, to: Option<Stage>) -> Result<Option<PathBuf>> {
        let staged = self.staged_path(from, to);
        self.archive(&staged, &transition_name(from, to), REJECTED_MARKER)
            .await
    }

    /// Move an existing envelope for `from -> to` aside so it is kept for
    /// audit. Returns the archived path, or `None` when nothing existed.
    pub async fn supersede(&self, from: Stage, to: Option<Stage>) -> Result<Option<PathBuf>> {
        let current = self.envelope_path(from, to);
        self.archive(&current, &transition_name(from, to), SUPERSEDED_MARKER)
            .await
    }

    /// Move a committed envelope the validator refused out of the chain, so
    /// no later stage can load it.
    pub async fn reject(&self, from: Stage, to: Option<Stage>) -> Result<Option<PathBuf>> {
        let current = self.envelope_path(from, to);
        self.archive(&current, &transition_name(from, to), REJECTED_MARKER)
            .await
    }

    async fn archive(&self, source: &Path, name: &str, marker: &str) -> Result<Option<PathBuf>> {
        if !tokio::fs::try_exists(source).await.unwrap_or(false) {
            return Ok(None);
        }

        let stamp = Utc::now().format("%Y%m%dT%H%M%S%3fZ");
        let mut archived = self
            .handoffs_dir()
            .join(format!("{}{}{}.json", name, marker, stamp));
        let mut n = 1;
        while tokio::fs::try_exists(&archived).await.unwrap_or(false) {
            archived = self
                .handoffs_dir()
                .join(format!("{}{}{}-{}.json", name, marker, stamp, n));
            n += 1;
        }

        bounded(
            &format!("archive {}", source.display()),
            self.io_timeout,
            tokio::fs::rename(source, &archived),
        )
        .await?;
        debug!(transition = %name, archived = %archived.display(), "Archived envelope");
        Ok(Some(archived))
    }

    pub async fn try_read_envelope(
        &self,
        from: Stage,
        to: Option<Stage>,
    ) -> Result<Option<HandoffEnvelope>> {
        let path = self.envelope_path(from, to);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(None);
        }
        self.read_json(&path).await.map(Some)
    }

    pub async fn read_envelope(&self, from: Stage, to: Option<Stage>) -> Result<HandoffEnvelope> {
        self.try_read_envelope(from, to).await?.ok_or_else(|| {
            CadenceError::Persistence(format!(
                "no committed envelope {} in {}",
                handoff_file_name(from, to),
                self.handoffs_dir().display()
            ))
        })
    }

    /// The envelope that handed off into `stage`. Missing is an error.
    pub async fn envelope_into(&self, stage: Stage) -> Result<HandoffEnvelope> {
        let previous = stage.previous().ok_or_else(|| {
            CadenceError::Configuration(format!("stage '{}' has no predecessor", stage))
        })?;
        self.read_envelope(previous, Some(stage)).await
    }

    /// Committed envelopes in pipeline order, stopping at the first gap.
    /// Staged, superseded and temp files are never returned.
    pub async fn load_chain(&self) -> Result<Vec<HandoffEnvelope>> {
        let mut chain = Vec::new();
        for stage in Stage::ALL {
            match self.try_read_envelope(stage, stage.next()).await? {
                Some(envelope) => chain.push(envelope),
                None => break,
            }
        }
        Ok(chain)
    }

    pub async fn latest_envelope(&self) -> Result<Option<HandoffEnvelope>> {
        Ok(self.load_chain().await?.pop())
    }

    /// Superseded envelope files, oldest name first.
    pub async fn superseded_files(&self) -> Result<Vec<PathBuf>> {
        self.archived_files(SUPERSEDED_MARKER).await
    }

    /// Envelope files the validator refused, oldest name first.
    pub async fn rejected_files(&self) -> Result<Vec<PathBuf>> {
        self.archived_files(REJECTED_MARKER).await
    }

    async fn archived_files(&self, marker: &str) -> Result<Vec<PathBuf>> {
        let dir = self.handoffs_dir();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e.into()),
        };
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.contains(marker) {
                files.push(entry.path());
            }
        }
        files.sort();
        Ok(files)
    }

    // ── Metadata ────────────────────────────────────────────────

    pub async fn write_metadata(&self, metadata: &CampaignMetadata) -> Result<u64> {
        self.write_json_atomic(&self.metadata_path(), metadata).await
    }

    pub async fn try_read_metadata(&self) -> Result<Option<CampaignMetadata>> {
        let path = self.metadata_path();
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(None);
        }
        self.read_json(&path).await.map(Some)
    }

    pub async fn read_metadata(&self) -> Result<CampaignMetadata> {
        self.try_read_metadata().await?.ok_or_else(|| {
            CadenceError::Persistence(format!("no {} in {}", METADATA_FILE, self.dir.display()))
        })
    }

    // ── Single-writer lock ──────────────────────────────────────

    /// Take the campaign's advisory write lock for `transition`.
    ///
    /// The lock file is created with `create_new`, so exactly one caller
    /// wins; everyone else gets `HandoffInProgress`. A lock left behind by
    /// a process that is gone, or older than the stale bound, is archived
    /// as `.lock.stale-<ts>` and retaken once.
    pub async fn acquire_lock(&self, campaign_id: &str, transition: &str) -> Result<HandoffLock> {
        let dir = self.handoffs_dir();
        bounded(
            &format!("create {}", dir.display()),
            self.io_timeout,
            tokio::fs::create_dir_all(&dir),
        )
        .await?;

        if let Some(lock) = self.try_create_lock(transition).await? {
            debug!(campaign_id, transition, "Acquired handoff lock");
            return Ok(lock);
        }

        let held = self.lock_holder().await;
        if let Some(reason) = self.stale_reason(held.as_ref()).await {
            if self.lock_holder().await.map(|i| i.acquired_at) == held.as_ref().map(|i| i.acquired_at) {
                match self.archive(&self.lock_path(), LOCK_FILE, STALE_LOCK_MARKER).await {
                    Ok(Some(archived)) => warn!(
                        campaign_id,
                        reason = %reason,
                        archived = %archived.display(),
                        "Recovered stale handoff lock"
                    ),
                    Ok(None) => {}
                    Err(e) => warn!(campaign_id, error = %e, "Failed to archive stale handoff lock"),
                }
                if let Some(lock) = self.try_create_lock(transition).await? {
                    debug!(campaign_id, transition, "Acquired handoff lock");
                    return Ok(lock);
                }
            }
        }

        let held_by = self
            .lock_holder()
            .await
            .or(held)
            .map(|info| info.transition)
            .unwrap_or_else(|| transition.to_string());
        Err(CadenceError::HandoffInProgress {
            campaign_id: campaign_id.to_string(),
            transition: held_by,
        })
    }

    /// Create the lock file. `None` when someone else already holds it.
    async fn try_create_lock(&self, transition: &str) -> Result<Option<HandoffLock>> {
        let path = self.lock_path();
        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create_new(true);
        let mut file = match tokio::time::timeout(self.io_timeout, options.open(&path)).await {
            Ok(Ok(file)) => file,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(None),
            Ok(Err(e)) => {
                return Err(CadenceError::Persistence(format!(
                    "lock {}: {}",
                    path.display(),
                    e
                )))
            }
            Err(_) => {
                return Err(CadenceError::Timeout {
                    operation: format!("lock {}", path.display()),
                    timeout_secs: self.io_timeout.as_secs(),
                })
            }
        };

        let lock = HandoffLock { path };
        let info = LockInfo {
            transition: transition.to_string(),
            pid: std::process::id(),
            acquired_at: Utc::now(),
        };
        let body = serde_json::to_vec(&info)?;
        bounded("write lock info", self.io_timeout, async {
            file.write_all(&body).await?;
            file.flush().await
        })
        .await?;
        Ok(Some(lock))
    }

    /// Why the current lock file may be taken over, if it may.
    async fn stale_reason(&self, held: Option<&LockInfo>) -> Option<String> {
        match held {
            Some(info) => {
                if !process_alive(info.pid) {
                    return Some(format!("holder pid {} is gone", info.pid));
                }
                let age = (Utc::now() - info.acquired_at).to_std().ok()?;
                (age > self.lock_stale_after).then(|| {
                    format!("held for {}s by pid {}", age.as_secs(), info.pid)
                })
            }
            // Unreadable lock: a writer may be between create and write,
            // so only the file's age counts.
            None => {
                let modified = tokio::fs::metadata(self.lock_path())
                    .await
                    .ok()?
                    .modified()
                    .ok()?;
                let age = modified.elapsed().ok()?;
                (age > self.lock_stale_after)
                    .then(|| format!("unreadable lock untouched for {}s", age.as_secs()))
            }
        }
    }

    /// Who holds the lock, if anyone (and if the lock file is readable).
    pub async fn lock_holder(&self) -> Option<LockInfo> {
        let bytes = tokio::fs::read(self.lock_path()).await.ok()?;
        serde_json::from_slice(&bytes).ok()
    }
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    pid == std::process::id() || Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    true
}

fn temp_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".");
    name.push(TEMP_SUFFIX);
    target.with_file_name(name)
}

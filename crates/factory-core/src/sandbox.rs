use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::RwLock;

use tokio::fs;
use tokio::sync::{Mutex, OnceCell};
use tokio_util::sync::CancellationToken;

use crate::error::{FactoryError, Result};

/// Normalize a project-relative path lexically.
///
/// Rejects empty and absolute paths, anything that climbs above the root
/// and anything inside `.git`. Returns a `/`-separated relative path.
pub fn normalize_relative(path: &str) -> Result<String> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err(FactoryError::InvalidInput("empty path".to_string()));
    }
    let candidate = Path::new(trimmed);
    let mut parts: Vec<String> = Vec::new();
    for component in candidate.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().to_string()),
            Component::CurDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(FactoryError::PathOutsideRoot(trimmed.to_string()));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(FactoryError::PathOutsideRoot(trimmed.to_string()));
            }
        }
    }
    if parts.is_empty() {
        return Err(FactoryError::InvalidInput(format!("path `{trimmed}` names the root")));
    }
    if parts[0] == ".git" {
        return Err(FactoryError::PathOutsideRoot(trimmed.to_string()));
    }
    Ok(parts.join("/"))
}

/// Resolve a project-relative path to its location under `root`.
///
/// The deepest part of the path that already exists is canonicalized and
/// must stay inside the canonical root, so symlinked directories or files
/// cannot redirect a read or write elsewhere. Dangling links are refused.
pub async fn resolve_in_root(root: &Path, path: &str) -> Result<PathBuf> {
    let rel = normalize_relative(path)?;
    let real_root = fs::canonicalize(root).await?;
    let target = root.join(&rel);

    let mut existing = target.clone();
    loop {
        match fs::symlink_metadata(&existing).await {
            Ok(_) => break,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                if !existing.pop() {
                    break;
                }
            }
            Err(err) => return Err(err.into()),
        }
    }
    let real = fs::canonicalize(&existing)
        .await
        .map_err(|_| FactoryError::PathOutsideRoot(rel.clone()))?;
    if !real.starts_with(&real_root) {
        return Err(FactoryError::PathOutsideRoot(rel));
    }
    Ok(target)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StagedKind {
    Write,
    Delete,
}

#[derive(Debug, Clone)]
struct StagedEntry {
    kind: StagedKind,
    accepted: bool,
}

/// Staged content of one file handed to the git layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    pub path: String,
    /// `None` marks a deletion
    pub content: Option<String>,
}

/// Run-scoped staging area. Proposed writes land under
/// `<overlays>/<run_id>/staged/` and never touch the project until a
/// finalized proposal is applied to a branch.
pub struct SandboxOverlay {
    run_id: String,
    project_root: PathBuf,
    root: PathBuf,
    ready: OnceCell<bool>,
    entries: Mutex<BTreeMap<String, StagedEntry>>,
    abort: RwLock<Option<CancellationToken>>,
}

impl SandboxOverlay {
    pub fn new(run_id: impl Into<String>, project_root: impl Into<PathBuf>, overlays_dir: &Path) -> Self {
        let run_id = run_id.into();
        Self {
            root: overlays_dir.join(&run_id),
            run_id,
            project_root: project_root.into(),
            ready: OnceCell::new(),
            entries: Mutex::new(BTreeMap::new()),
            abort: RwLock::new(None),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn staged_dir(&self) -> PathBuf {
        self.root.join("staged")
    }

    /// Prepare overlay storage. Runs at most once; later calls report the
    /// first outcome.
    pub async fn init(&self) -> Result<()> {
        let mut first_error = None;
        let error_slot = &mut first_error;
        let staged_dir = self.staged_dir();
        let ready = *self
            .ready
            .get_or_init(|| async move {
                match fs::create_dir_all(staged_dir).await {
                    Ok(()) => true,
                    Err(err) => {
                        *error_slot = Some(err);
                        false
                    }
                }
            })
            .await;
        match (ready, first_error) {
            (true, _) => Ok(()),
            (false, Some(err)) => Err(err.into()),
            (false, None) => Err(FactoryError::Io(std::io::Error::other(format!(
                "overlay for run {} failed to initialize",
                self.run_id
            )))),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.get().copied().unwrap_or(false)
    }

    pub fn attach_abort_signal(&self, signal: CancellationToken) {
        if let Ok(mut slot) = self.abort.write() {
            *slot = Some(signal);
        }
    }

    fn ensure_not_aborted(&self) -> Result<()> {
        let aborted = self
            .abort
            .read()
            .map(|slot| slot.as_ref().is_some_and(|t| t.is_cancelled()))
            .unwrap_or(false);
        if aborted {
            return Err(FactoryError::Cancelled(format!("run {} was cancelled", self.run_id)));
        }
        Ok(())
    }

    /// Stage new content. Returns `false` when storage is degraded and the
    /// write was skipped.
    pub async fn write(&self, path: &str, content: &str) -> Result<bool> {
        let rel = normalize_relative(path)?;
        self.ensure_not_aborted()?;
        if self.init().await.is_err() {
            tracing::warn!(run_id = %self.run_id, path = %rel, "overlay unavailable; write skipped");
            return Ok(false);
        }
        let target = self.staged_dir().join(&rel);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&target, content).await?;
        self.entries.lock().await.insert(
            rel,
            StagedEntry {
                kind: StagedKind::Write,
                accepted: false,
            },
        );
        Ok(true)
    }

    /// Stage a removal.
    pub async fn delete(&self, path: &str) -> Result<bool> {
        let rel = normalize_relative(path)?;
        self.ensure_not_aborted()?;
        if self.init().await.is_err() {
            tracing::warn!(run_id = %self.run_id, path = %rel, "overlay unavailable; delete skipped");
            return Ok(false);
        }
        remove_if_exists(&self.staged_dir().join(&rel)).await?;
        self.entries.lock().await.insert(
            rel,
            StagedEntry {
                kind: StagedKind::Delete,
                accepted: false,
            },
        );
        Ok(true)
    }

    /// Promote staged files to the committable set. Paths that were never
    /// staged are skipped and left out of the result.
    pub async fn accept_files(&self, paths: &[String]) -> Result<Vec<String>> {
        let mut entries = self.entries.lock().await;
        let mut promoted = Vec::new();
        for path in paths {
            let rel = normalize_relative(path)?;
            if let Some(entry) = entries.get_mut(&rel) {
                entry.accepted = true;
                promoted.push(rel);
            }
        }
        Ok(promoted)
    }

    /// Drop every staged entry that has not been accepted.
    pub async fn reject_all(&self) -> Result<usize> {
        let pending: Vec<String> = {
            let entries = self.entries.lock().await;
            entries
                .iter()
                .filter(|(_, e)| !e.accepted)
                .map(|(p, _)| p.clone())
                .collect()
        };
        self.discard(&pending).await
    }

    /// Drop the named entries regardless of acceptance.
    pub async fn discard(&self, paths: &[String]) -> Result<usize> {
        let mut entries = self.entries.lock().await;
        let mut removed = 0;
        for path in paths {
            let rel = normalize_relative(path)?;
            if entries.remove(&rel).is_some() {
                removed += 1;
                if let Err(err) = remove_if_exists(&self.staged_dir().join(&rel)).await {
                    tracing::warn!(run_id = %self.run_id, path = %rel, "failed to discard staged file: {}", err);
                }
            }
        }
        Ok(removed)
    }

    /// Read back the staged state of the given accepted paths. Paths that
    /// are not staged or not accepted are omitted.
    pub async fn accepted_files(&self, paths: &[String]) -> Result<Vec<StagedFile>> {
        let entries = self.entries.lock().await.clone();
        let mut out = Vec::new();
        for path in paths {
            let rel = normalize_relative(path)?;
            let Some(entry) = entries.get(&rel).filter(|e| e.accepted) else {
                continue;
            };
            let content = match entry.kind {
                StagedKind::Write => Some(fs::read_to_string(self.staged_dir().join(&rel)).await?),
                StagedKind::Delete => None,
            };
            out.push(StagedFile { path: rel, content });
        }
        Ok(out)
    }

    /// Release overlay storage.
    pub async fn cleanup(&self) -> Result<()> {
        // waits out an in-flight init and keeps a later one from recreating storage
        let _ = self.ready.get_or_init(|| async { false }).await;
        self.entries.lock().await.clear();
        match fs::remove_dir_all(&self.root).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overlay(dir: &Path) -> SandboxOverlay {
        SandboxOverlay::new("run_test", dir.join("project"), &dir.join("overlays"))
    }

    #[test]
    fn normalize_rejects_escapes() {
        assert_eq!(normalize_relative("./src/../a.txt").expect("ok"), "a.txt");
        assert_eq!(normalize_relative("src//lib.rs").expect("ok"), "src/lib.rs");
        assert!(matches!(
            normalize_relative("../secret"),
            Err(FactoryError::PathOutsideRoot(_))
        ));
        assert!(matches!(
            normalize_relative("/etc/passwd"),
            Err(FactoryError::PathOutsideRoot(_))
        ));
        assert!(matches!(
            normalize_relative(".git/config"),
            Err(FactoryError::PathOutsideRoot(_))
        ));
        assert!(normalize_relative("  ").is_err());
        assert!(normalize_relative("a/..").is_err());
    }

    #[tokio::test]
    async fn writes_stay_out_of_project() {
        let dir = tempfile::tempdir().expect("tempdir");
        let overlay = overlay(dir.path());
        overlay.init().await.expect("init");
        assert!(overlay.write("src/a.txt", "hi").await.expect("write"));
        assert!(!dir.path().join("project/src/a.txt").exists());
        assert!(overlay.root().join("staged/src/a.txt").exists());
        assert!(overlay.write("../escape.txt", "x").await.is_err());
    }

    #[tokio::test]
    async fn accept_then_reject_all_keeps_accepted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let overlay = overlay(dir.path());
        overlay.write("a.txt", "a").await.expect("write");
        overlay.write("b.txt", "b").await.expect("write");
        overlay.write("d.txt", "d").await.expect("write");
        overlay.delete("c.txt").await.expect("delete");
        let promoted = overlay
            .accept_files(&["a.txt".to_string(), "c.txt".to_string(), "zzz".to_string()])
            .await
            .expect("accept");
        assert_eq!(promoted, vec!["a.txt".to_string(), "c.txt".to_string()]);
        assert_eq!(overlay.discard(&["d.txt".to_string()]).await.expect("discard"), 1);
        assert_eq!(overlay.reject_all().await.expect("reject"), 1);
        assert!(!overlay.root().join("staged/b.txt").exists());
        assert!(!overlay.root().join("staged/d.txt").exists());

        let files = overlay
            .accepted_files(&["a.txt".to_string(), "b.txt".to_string(), "c.txt".to_string()])
            .await
            .expect("files");
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].content.as_deref(), Some("a"));
        assert_eq!(files[1].content, None);
        // accepted entries survive a second sweep
        assert_eq!(overlay.reject_all().await.expect("reject again"), 0);
    }

    #[tokio::test]
    async fn aborted_overlay_refuses_new_io() {
        let dir = tempfile::tempdir().expect("tempdir");
        let overlay = overlay(dir.path());
        let token = CancellationToken::new();
        overlay.attach_abort_signal(token.clone());
        token.cancel();
        assert!(matches!(
            overlay.write("a.txt", "a").await,
            Err(FactoryError::Cancelled(_))
        ));
    }

    #[tokio::test]
    async fn failed_init_degrades_to_noop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let blocker = dir.path().join("overlays");
        std::fs::write(&blocker, "not a dir").expect("write blocker");
        let overlay = overlay(dir.path());
        assert!(overlay.init().await.is_err());
        assert!(!overlay.is_ready());
        assert!(!overlay.write("a.txt", "a").await.expect("degraded write"));
        let promoted = overlay.accept_files(&["a.txt".to_string()]).await.expect("accept");
        assert!(promoted.is_empty());
    }

    #[tokio::test]
    async fn cleanup_removes_storage_and_is_repeatable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let overlay = overlay(dir.path());
        overlay.write("a.txt", "a").await.expect("write");
        overlay.cleanup().await.expect("cleanup");
        assert!(!overlay.root().exists());
        overlay.cleanup().await.expect("second cleanup");
    }

    #[tokio::test]
    async fn cleanup_before_init_keeps_storage_away() {
        let dir = tempfile::tempdir().expect("tempdir");
        let overlay = overlay(dir.path());
        overlay.cleanup().await.expect("cleanup");
        assert!(overlay.init().await.is_err());
        assert!(!overlay.root().exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn resolve_refuses_symlinked_escapes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join("project");
        std::fs::create_dir_all(root.join("src")).expect("mkdir");
        std::fs::create_dir_all(dir.path().join("outside")).expect("mkdir");
        std::os::unix::fs::symlink(dir.path().join("outside"), root.join("out")).expect("symlink");
        std::os::unix::fs::symlink(root.join("src"), root.join("alias")).expect("symlink");
        std::os::unix::fs::symlink(root.join("missing"), root.join("dangling")).expect("symlink");

        assert_eq!(
            resolve_in_root(&root, "src/new/a.txt").await.expect("inside"),
            root.join("src/new/a.txt")
        );
        assert!(resolve_in_root(&root, "alias/a.txt").await.is_ok());
        for escape in ["out/pwned.txt", "out", "dangling", "../x"] {
            assert!(
                matches!(resolve_in_root(&root, escape).await, Err(FactoryError::PathOutsideRoot(_))),
                "{escape} must be refused"
            );
        }
    }
}

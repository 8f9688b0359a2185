use std::{
    collections::HashSet,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, SystemTime},
};

use tracing::{debug, info, warn};
use uuid::Uuid;

/// Suffix of a workspace that has been detached and is being deleted.
const REMOVING_SUFFIX: &str = ".removing";

type LiveSet = Arc<Mutex<HashSet<PathBuf>>>;

/// Hands out per-job scratch directories under one root.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
    stale_after: Duration,
    live: LiveSet,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>, stale_after: Duration) -> Self {
        Self {
            root: root.into(),
            stale_after,
            live: Arc::default(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn ensure_root(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.root).await
    }

    pub async fn create(&self) -> std::io::Result<JobWorkspace> {
        let dir = self.root.join(Uuid::new_v4().to_string());
        tokio::fs::create_dir_all(&dir).await?;
        debug!("created job workspace {:?}", dir);
        lock_live(&self.live).insert(dir.clone());
        Ok(JobWorkspace {
            dir,
            live: Arc::clone(&self.live),
        })
    }

    /// Number of workspaces whose job has not ended yet.
    pub fn live_count(&self) -> usize {
        lock_live(&self.live).len()
    }

    /// Removes workspaces left behind by jobs that died with the process.
    /// Only directories this manager could have created are considered, and
    /// never one that belongs to a running job.
    pub async fn sweep_stale(&self) -> usize {
        cleanup_stale_entries(&self.root, self.stale_after, &self.live).await
    }
}

fn lock_live(live: &LiveSet) -> std::sync::MutexGuard<'_, HashSet<PathBuf>> {
    live.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A job's exclusive directory. Dropping it deletes the directory and
/// everything inside, whichever way the job ended.
#[derive(Debug)]
pub struct JobWorkspace {
    dir: PathBuf,
    live: LiveSet,
}

impl JobWorkspace {
    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Whether `candidate` resolves to a file inside this workspace.
    pub async fn contains(&self, candidate: &Path) -> bool {
        let (Ok(root), Ok(candidate)) = (
            tokio::fs::canonicalize(&self.dir).await,
            tokio::fs::canonicalize(candidate).await,
        ) else {
            return false;
        };
        candidate.starts_with(root)
    }
}

impl Drop for JobWorkspace {
    /// Inside a runtime the directory is renamed out of the way and deleted on
    /// the blocking pool; otherwise it is deleted in place.
    fn drop(&mut self) {
        lock_live(&self.live).remove(&self.dir);

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let mut detached = self.dir.clone().into_os_string();
            detached.push(REMOVING_SUFFIX);
            let detached = PathBuf::from(detached);

            match std::fs::rename(&self.dir, &detached) {
                Ok(()) => {
                    handle.spawn_blocking(move || remove_workspace_dir(&detached));
                    return;
                }
                Err(error) if error.kind() == ErrorKind::NotFound => return,
                Err(error) => debug!("could not detach {:?}: {error}", self.dir),
            }
        }

        remove_workspace_dir(&self.dir);
    }
}

fn remove_workspace_dir(dir: &Path) {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => debug!("removed job workspace {:?}", dir),
        Err(error) if error.kind() == ErrorKind::NotFound => {}
        Err(error) => warn!("could not remove job workspace {:?}: {error}", dir),
    }
}

/// `<uuid>` or `<uuid>.removing`, the only names a workspace ever has.
fn is_workspace_name(name: &str) -> bool {
    let id = name.strip_suffix(REMOVING_SUFFIX).unwrap_or(name);
    Uuid::parse_str(id).is_ok()
}

async fn cleanup_stale_entries(root: &Path, max_age: Duration, live: &LiveSet) -> usize {
    if max_age.is_zero() {
        return 0;
    }

    let mut entries = match tokio::fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(error) => {
            if error.kind() != ErrorKind::NotFound {
                warn!("could not open download dir for cleanup: {error}");
            }
            return 0;
        }
    };

    let now = SystemTime::now();
    let mut removed = 0;

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(error) => {
                warn!("could not iterate download dir for cleanup: {error}");
                break;
            }
        };

        let path = entry.path();
        let is_candidate = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(is_workspace_name);
        if !is_candidate || lock_live(live).contains(&path) {
            continue;
        }

        let metadata = match entry.metadata().await {
            Ok(metadata) => metadata,
            Err(error) => {
                warn!("could not read metadata of {:?}: {error}", path);
                continue;
            }
        };
        if !metadata.is_dir() {
            continue;
        }

        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or_default();
        if age < max_age {
            continue;
        }

        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => removed += 1,
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => warn!("could not remove stale workspace {:?}: {error}", path),
        }
    }

    if removed > 0 {
        info!("removed {removed} stale workspaces from {:?}", root);
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn wait_until_gone(path: &Path) {
        for _ in 0..200 {
            if !path.exists() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{path:?} was never removed");
    }

    #[tokio::test]
    async fn workspace_is_removed_on_drop() {
        let root = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path(), Duration::from_secs(60));

        let workspace = manager.create().await.unwrap();
        let dir = workspace.path().to_path_buf();
        tokio::fs::write(dir.join("nested.bin"), b"data").await.unwrap();
        tokio::fs::create_dir(dir.join("sub")).await.unwrap();
        tokio::fs::write(dir.join("sub").join("more.bin"), b"data")
            .await
            .unwrap();
        assert!(dir.exists());
        assert_eq!(manager.live_count(), 1);

        drop(workspace);
        assert!(!dir.exists());
        assert_eq!(manager.live_count(), 0);

        let mut detached = dir.into_os_string();
        detached.push(REMOVING_SUFFIX);
        wait_until_gone(Path::new(&detached)).await;
    }

    #[test]
    fn workspace_dropped_outside_a_runtime_is_removed_in_place() {
        let root = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path(), Duration::from_secs(60));
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let workspace = runtime.block_on(manager.create()).unwrap();
        drop(runtime);

        let dir = workspace.path().to_path_buf();
        drop(workspace);
        assert!(!dir.exists());
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn workspace_is_removed_when_a_task_panics() {
        let root = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path(), Duration::from_secs(60));
        let workspace = manager.create().await.unwrap();
        let dir = workspace.path().to_path_buf();

        let result = tokio::spawn(async move {
            let _workspace = workspace;
            panic!("streaming blew up");
        })
        .await;

        assert!(result.is_err());
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn drop_tolerates_an_already_missing_directory() {
        let root = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path(), Duration::from_secs(60));
        let workspace = manager.create().await.unwrap();

        std::fs::remove_dir_all(workspace.path()).unwrap();
        drop(workspace);
    }

    #[tokio::test]
    async fn workspaces_are_distinct() {
        let root = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path(), Duration::from_secs(60));

        let first = manager.create().await.unwrap();
        let second = manager.create().await.unwrap();
        assert_ne!(first.path(), second.path());
    }

    #[tokio::test]
    async fn contains_rejects_paths_outside() {
        let root = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path().join("jobs"), Duration::from_secs(60));
        let workspace = manager.create().await.unwrap();

        let inside = workspace.path().join("clip.mp4");
        tokio::fs::write(&inside, b"x").await.unwrap();
        let outside = root.path().join("other.mp4");
        tokio::fs::write(&outside, b"x").await.unwrap();

        assert!(workspace.contains(&inside).await);
        assert!(!workspace.contains(&outside).await);
        assert!(!workspace.contains(&workspace.path().join("missing")).await);
    }

    #[tokio::test]
    async fn sweep_only_removes_old_entries() {
        let root = tempfile::tempdir().unwrap();
        let fresh = root.path().join(Uuid::new_v4().to_string());
        tokio::fs::create_dir(&fresh).await.unwrap();

        let lenient = WorkspaceManager::new(root.path(), Duration::from_secs(3600));
        assert_eq!(lenient.sweep_stale().await, 0);
        assert!(fresh.exists());

        let disabled = WorkspaceManager::new(root.path(), Duration::ZERO);
        assert_eq!(disabled.sweep_stale().await, 0);
        assert!(fresh.exists());

        tokio::time::sleep(Duration::from_millis(20)).await;
        let strict = WorkspaceManager::new(root.path(), Duration::from_millis(1));
        assert_eq!(strict.sweep_stale().await, 1);
        assert!(!fresh.exists());
    }

    #[tokio::test]
    async fn sweep_leaves_foreign_entries_and_live_jobs_alone() {
        let root = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path(), Duration::from_millis(1));

        let notes = root.path().join("operator-notes.txt");
        tokio::fs::write(&notes, b"keep me").await.unwrap();
        let data = root.path().join("data");
        tokio::fs::create_dir(&data).await.unwrap();
        let not_a_dir = root.path().join(Uuid::new_v4().to_string());
        tokio::fs::write(&not_a_dir, b"file").await.unwrap();
        let orphan = root.path().join(format!("{}{REMOVING_SUFFIX}", Uuid::new_v4()));
        tokio::fs::create_dir(&orphan).await.unwrap();
        let running = manager.create().await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(manager.sweep_stale().await, 1);

        assert!(notes.exists());
        assert!(data.exists());
        assert!(not_a_dir.exists());
        assert!(running.path().exists());
        assert!(!orphan.exists());
    }

    #[test]
    fn workspace_names_are_uuids() {
        let id = Uuid::new_v4().to_string();
        assert!(is_workspace_name(&id));
        assert!(is_workspace_name(&format!("{id}{REMOVING_SUFFIX}")));
        assert!(!is_workspace_name("operator-notes.txt"));
        assert!(!is_workspace_name("data"));
        assert!(!is_workspace_name(&format!("{id}.tmp")));
    }
}

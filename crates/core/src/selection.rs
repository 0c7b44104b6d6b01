use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::extract::{ARCHIVE_SUFFIX, output_path_for_archive};
use crate::storage::{ObjectStore, ObjectSummary};
use crate::Result;

pub const MIN_OBJECT_BYTES: u64 = 1024 * 1024;

/// One remote archive to fetch and extract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub remote_key: String,
    pub local_archive_path: PathBuf,
}

impl Task {
    pub fn display_name(&self) -> String {
        self.local_archive_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.remote_key.clone())
    }

    pub fn output_path(&self) -> PathBuf {
        output_path_for_archive(&self.local_archive_path)
    }
}

#[derive(Debug, Clone)]
pub struct SelectionConfig {
    pub bucket: String,
    pub prefix: String,
    pub storage_root: PathBuf,
    pub max_tasks: usize,
    pub min_object_bytes: u64,
    /// Create each selected task's parent directory. Off for dry runs.
    pub create_dirs: bool,
}

#[derive(Debug, Default)]
pub struct Selection {
    pub tasks: Vec<Task>,
    pub skipped_existing: u64,
    pub pages_fetched: u32,
}

/// Walks the listing page by page until `max_tasks` archives are selected.
/// Pages past the cap are never requested.
pub async fn select_tasks<S: ObjectStore + ?Sized>(
    store: &S,
    config: &SelectionConfig,
) -> Result<Selection> {
    let mut selection = Selection::default();
    if config.max_tasks == 0 {
        return Ok(selection);
    }

    let mut continuation: Option<String> = None;
    'pages: loop {
        let page = store
            .list_page(&config.bucket, &config.prefix, continuation.as_deref())
            .await?;
        selection.pages_fetched += 1;

        for obj in page.objects {
            if !is_candidate(&obj, config.min_object_bytes) {
                continue;
            }

            let Some(archive_path) =
                local_archive_path(&config.storage_root, &config.prefix, &obj.key)
            else {
                warn!(
                    event = "selection.unsafe_key",
                    key = %obj.key,
                    "skipping key that does not map below the storage root"
                );
                continue;
            };

            if tokio::fs::try_exists(output_path_for_archive(&archive_path)).await? {
                debug!(event = "selection.skip_existing", key = %obj.key, "selection.skip_existing");
                selection.skipped_existing += 1;
                continue;
            }

            if let Some(parent) = archive_path.parent().filter(|_| config.create_dirs) {
                tokio::fs::create_dir_all(parent).await?;
            }

            selection.tasks.push(Task {
                remote_key: obj.key,
                local_archive_path: archive_path,
            });
            if selection.tasks.len() >= config.max_tasks {
                break 'pages;
            }
        }

        match page.next_continuation {
            Some(token) => continuation = Some(token),
            None => break,
        }
    }

    debug!(
        event = "selection.finish",
        tasks = selection.tasks.len(),
        skipped_existing = selection.skipped_existing,
        pages_fetched = selection.pages_fetched,
        "selection.finish"
    );
    Ok(selection)
}

pub fn is_candidate(obj: &ObjectSummary, min_object_bytes: u64) -> bool {
    obj.key.ends_with(ARCHIVE_SUFFIX) && obj.size >= min_object_bytes
}

/// Maps `prefix/a/b/x.csv.tar` to `root/a/b/x.csv.tar`. Returns `None` for
/// keys outside `prefix` or with `.`/`..` components.
pub fn local_archive_path(storage_root: &Path, prefix: &str, key: &str) -> Option<PathBuf> {
    let rel = key.strip_prefix(prefix)?;
    let mut path = storage_root.to_path_buf();
    let mut depth = 0usize;
    for part in rel.split('/') {
        match part {
            "" => {}
            "." | ".." => return None,
            p if p.contains('\\') => return None,
            p => {
                path.push(p);
                depth += 1;
            }
        }
    }
    (depth > 0).then_some(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStore;

    const MB: u64 = 1024 * 1024;

    fn config(root: &Path, max_tasks: usize) -> SelectionConfig {
        SelectionConfig {
            bucket: "data-samples".to_string(),
            prefix: "states/".to_string(),
            storage_root: root.to_path_buf(),
            max_tasks,
            min_object_bytes: MB,
            create_dirs: true,
        }
    }

    #[tokio::test]
    async fn keeps_only_large_enough_archives_up_to_the_cap() {
        let temp = tempfile::tempdir().unwrap();
        let store = InMemoryStore::new("data-samples");
        store
            .insert_with_listed_size("states/a.csv.tar", vec![], 2 * MB)
            .await;
        store
            .insert_with_listed_size("states/b.csv.tar", vec![], 500 * 1024)
            .await;
        store
            .insert_with_listed_size("states/c.txt", vec![], 5 * MB)
            .await;

        let selection = select_tasks(&store, &config(temp.path(), 1)).await.unwrap();

        let keys: Vec<&str> = selection
            .tasks
            .iter()
            .map(|t| t.remote_key.as_str())
            .collect();
        assert_eq!(keys, vec!["states/a.csv.tar"]);
        assert_eq!(
            selection.tasks[0].local_archive_path,
            temp.path().join("a.csv.tar")
        );
    }

    #[tokio::test]
    async fn stops_listing_once_the_cap_is_reached() {
        let temp = tempfile::tempdir().unwrap();
        let store = InMemoryStore::with_page_size("data-samples", 1);
        for i in 0..5 {
            store
                .insert_with_listed_size(&format!("states/d{i}/x{i}.csv.tar"), vec![], 2 * MB)
                .await;
        }

        let selection = select_tasks(&store, &config(temp.path(), 2)).await.unwrap();

        assert_eq!(selection.tasks.len(), 2);
        assert_eq!(selection.pages_fetched, 2);
        assert_eq!(store.list_call_count(), 2);
    }

    #[tokio::test]
    async fn skips_archives_whose_output_already_exists() {
        let temp = tempfile::tempdir().unwrap();
        let store = InMemoryStore::new("data-samples");
        store
            .insert_with_listed_size("states/2023/01/01/x.csv.tar", vec![], 2 * MB)
            .await;
        store
            .insert_with_listed_size("states/2023/01/02/y.csv.tar", vec![], 2 * MB)
            .await;

        let done = temp.path().join("2023/01/01/x.csv");
        std::fs::create_dir_all(done.parent().unwrap()).unwrap();
        std::fs::write(&done, b"done").unwrap();

        let selection = select_tasks(&store, &config(temp.path(), 1)).await.unwrap();

        assert_eq!(selection.skipped_existing, 1);
        assert_eq!(selection.tasks.len(), 1);
        assert_eq!(selection.tasks[0].remote_key, "states/2023/01/02/y.csv.tar");
        assert!(temp.path().join("2023/01/02").is_dir());
    }

    #[tokio::test]
    async fn dry_run_selection_leaves_no_directories() {
        let temp = tempfile::tempdir().unwrap();
        let store = InMemoryStore::new("data-samples");
        store
            .insert_with_listed_size("states/2023/01/03/z.csv.tar", vec![], 2 * MB)
            .await;

        let dry = SelectionConfig {
            create_dirs: false,
            ..config(temp.path(), 5)
        };
        let selection = select_tasks(&store, &dry).await.unwrap();

        assert_eq!(selection.tasks.len(), 1);
        assert!(std::fs::read_dir(temp.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn unreadable_output_check_is_a_storage_error() {
        let temp = tempfile::tempdir().unwrap();
        let store = InMemoryStore::new("data-samples");
        store
            .insert_with_listed_size("states/blocked/x.csv.tar", vec![], 2 * MB)
            .await;
        std::fs::write(temp.path().join("blocked"), b"not a directory").unwrap();

        let err = select_tasks(&store, &config(temp.path(), 1))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "storage.io");
    }

    #[tokio::test]
    async fn zero_cap_does_not_touch_the_listing() {
        let temp = tempfile::tempdir().unwrap();
        let store = InMemoryStore::new("data-samples");
        let selection = select_tasks(&store, &config(temp.path(), 0)).await.unwrap();
        assert!(selection.tasks.is_empty());
        assert_eq!(store.list_call_count(), 0);
    }

    #[tokio::test]
    async fn listing_failure_is_fatal() {
        let temp = tempfile::tempdir().unwrap();
        let store = InMemoryStore::new("other-bucket");
        let err = select_tasks(&store, &config(temp.path(), 1))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "listing.failed");
    }

    #[test]
    fn key_mapping_rejects_escapes() {
        let root = Path::new("/data/raw");
        assert_eq!(
            local_archive_path(root, "states/", "states/2023/01/01/x.csv.tar"),
            Some(PathBuf::from("/data/raw/2023/01/01/x.csv.tar"))
        );
        assert_eq!(local_archive_path(root, "states/", "states/../x.csv.tar"), None);
        assert_eq!(local_archive_path(root, "states/", "other/x.csv.tar"), None);
        assert_eq!(local_archive_path(root, "states/", "states/"), None);
    }

    #[test]
    fn candidate_filter_checks_suffix_and_size() {
        let obj = |key: &str, size| ObjectSummary {
            key: key.to_string(),
            size,
        };
        assert!(is_candidate(&obj("states/a.csv.tar", MB), MB));
        assert!(!is_candidate(&obj("states/a.csv.tar", MB - 1), MB));
        assert!(!is_candidate(&obj("states/a.csv.gz", 5 * MB), MB));
    }
}

//! Backup planner: turns a job into an executable plan.
//!
//! Walks the source, applies include/exclude patterns, decides full vs.
//! incremental against the parent set snapshot, and picks the target
//! tape from the pool.

use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Error};
use chrono::{DateTime, TimeZone, Utc};
use log::warn;
use pathpatterns::{MatchEntry, MatchList, MatchType, PatternFlag};
use walkdir::WalkDir;

use tba_api_types::{BackupType, Id, Job, SnapshotEntry, Source, Tape};

use crate::catalog::CatalogStore;
use crate::registry::TapeRegistry;
use crate::store::StoreError;

/// Minimum free capacity a space-greedy pool pick must still offer.
pub const DEFAULT_MIN_FREE_BYTES: u64 = 1024 * 1024 * 1024;

/// Metadata of one file, fetched lazily at write time.
#[derive(Clone, Debug)]
pub struct FileMeta {
    pub rel_path: String,
    pub abs_path: PathBuf,
    pub size: u64,
    pub mode: u32,
    pub mtime: DateTime<Utc>,
}

/// Sorted source order: the only materialized state of the enumeration.
///
/// Holds relative paths in write order; everything else is re-fetched
/// per file via [`FileOrder::meta`].
pub struct FileOrder {
    root: PathBuf,
    rel_paths: Vec<String>,
}

impl FileOrder {
    pub fn len(&self) -> usize {
        self.rel_paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rel_paths.is_empty()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn rel_path(&self, index: usize) -> Option<&str> {
        self.rel_paths.get(index).map(|s| s.as_str())
    }

    /// Stat the file at `index`.
    pub fn meta(&self, index: usize) -> Result<FileMeta, Error> {
        let rel_path = self
            .rel_paths
            .get(index)
            .ok_or_else(|| format_err!("file index {} out of range", index))?;
        let abs_path = self.root.join(rel_path);
        let metadata = std::fs::metadata(&abs_path)?;
        Ok(FileMeta {
            rel_path: rel_path.clone(),
            abs_path,
            size: metadata.len(),
            mode: file_mode(&metadata),
            mtime: mtime_of(&metadata),
        })
    }
}

/// Everything the backup engine needs to run.
pub struct BackupPlan {
    pub job: Job,
    pub source: Source,
    pub tape: Tape,
    pub backup_type: BackupType,
    /// Parent set, present exactly for incremental plans.
    pub parent_set_id: Option<Id>,
    pub files: FileOrder,
    pub total_files: u64,
    /// Scan-time size sum, seeds the progress ETA.
    pub estimated_total_bytes: u64,
    /// Fingerprint of every file present at scan time, persisted at
    /// finalize to serve future incremental runs.
    pub snapshot: Vec<SnapshotEntry>,
}

fn file_mode(metadata: &std::fs::Metadata) -> u32 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        metadata.mode()
    }
    #[cfg(not(unix))]
    {
        0o644
    }
}

fn mtime_of(metadata: &std::fs::Metadata) -> DateTime<Utc> {
    metadata
        .modified()
        .ok()
        .and_then(|time| {
            let since = time.duration_since(std::time::UNIX_EPOCH).ok()?;
            Utc.timestamp_opt(since.as_secs() as i64, 0).single()
        })
        .unwrap_or_else(Utc::now)
}

fn parse_patterns(patterns: &[String], match_type: MatchType) -> Result<Vec<MatchEntry>, Error> {
    patterns
        .iter()
        .map(|pattern| {
            MatchEntry::parse_pattern(pattern.as_str(), PatternFlag::PATH_NAME, match_type)
                .map_err(|err| format_err!("invalid pattern '{}' - {}", pattern, err))
        })
        .collect()
}

/// Write order: shortest path first, lexicographic within a depth.
fn order_key(path: &str) -> (usize, String) {
    (path.matches('/').count(), path.to_string())
}

pub struct BackupPlanner<'a> {
    registry: &'a TapeRegistry,
    catalog: &'a CatalogStore,
}

impl<'a> BackupPlanner<'a> {
    pub fn new(registry: &'a TapeRegistry, catalog: &'a CatalogStore) -> Self {
        Self { registry, catalog }
    }

    /// Build a plan for one job run.
    ///
    /// `tape_override` skips pool selection (operator picked a tape).
    pub fn plan(
        &self,
        job: &Job,
        source: &Source,
        tape_override: Option<Id>,
    ) -> Result<BackupPlan, Error> {
        if source.path.is_empty() {
            bail!("source path is empty");
        }

        let tape = self.select_tape(job, tape_override)?;

        // incremental needs a completed parent of the same job
        let (backup_type, parent_set_id) = match job.backup_type {
            BackupType::Full => (BackupType::Full, None),
            BackupType::Incremental => match self.catalog.latest_completed_set(job.id)? {
                Some(parent) => (BackupType::Incremental, Some(parent.id)),
                None => {
                    warn!(
                        "job '{}': no completed parent set, falling back to full",
                        job.name
                    );
                    (BackupType::Full, None)
                }
            },
        };

        let parent_snapshot = match parent_set_id {
            Some(parent_id) => Some(self.catalog.snapshot_of(parent_id)?),
            None => None,
        };

        let scan = scan_source(source, parent_snapshot.as_deref())?;

        Ok(BackupPlan {
            job: job.clone(),
            source: source.clone(),
            tape,
            backup_type,
            parent_set_id,
            files: scan.order,
            total_files: scan.total_files,
            estimated_total_bytes: scan.total_bytes,
            snapshot: scan.snapshot,
        })
    }

    fn select_tape(&self, job: &Job, tape_override: Option<Id>) -> Result<Tape, Error> {
        match tape_override {
            Some(tape_id) => Ok(self.registry.lookup_tape(tape_id)?),
            None => self
                .registry
                .select_best_from_pool(job.pool_id, DEFAULT_MIN_FREE_BYTES)
                .map_err(|err| match err {
                    StoreError::NoTapeAvailable => {
                        format_err!("no writable tape available in pool of job '{}'", job.name)
                    }
                    other => other.into(),
                }),
        }
    }
}

struct ScanResult {
    order: FileOrder,
    total_files: u64,
    total_bytes: u64,
    snapshot: Vec<SnapshotEntry>,
}

/// Walk the source tree once: filter, fingerprint, diff, sort.
fn scan_source(
    source: &Source,
    parent_snapshot: Option<&[SnapshotEntry]>,
) -> Result<ScanResult, Error> {
    let root = PathBuf::from(&source.path);
    if !root.is_dir() {
        bail!("source path '{}' is not a directory", source.path);
    }

    let includes = parse_patterns(&source.include_patterns, MatchType::Include)?;
    let excludes = parse_patterns(&source.exclude_patterns, MatchType::Exclude)?;

    let parent: std::collections::HashMap<&str, (u64, i64)> = parent_snapshot
        .unwrap_or(&[])
        .iter()
        .map(|entry| {
            (
                entry.file_path.as_str(),
                (entry.file_size, entry.mod_time.timestamp()),
            )
        })
        .collect();

    let mut selected: Vec<(String, u64)> = Vec::new();
    let mut snapshot = Vec::new();

    for entry in WalkDir::new(&root).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!("scan: skipping unreadable entry - {}", err);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let rel_path = match entry.path().strip_prefix(&root) {
            Ok(rel) => rel.to_string_lossy().into_owned(),
            Err(_) => continue,
        };

        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(err) => {
                warn!("scan: cannot stat '{}' - {}", rel_path, err);
                continue;
            }
        };
        let mode = file_mode(&metadata);

        if excludes.matches(rel_path.as_bytes(), Some(mode)) == Some(MatchType::Exclude) {
            continue;
        }
        if !source.include_patterns.is_empty()
            && includes.matches(rel_path.as_bytes(), Some(mode)) != Some(MatchType::Include)
        {
            continue;
        }

        let size = metadata.len();
        let mtime = mtime_of(&metadata);

        snapshot.push(SnapshotEntry {
            backup_set_id: 0,
            file_path: rel_path.clone(),
            file_size: size,
            mod_time: mtime,
        });

        // incremental: only changed or new files make the backup list
        if let Some(&(parent_size, parent_mtime)) = parent.get(rel_path.as_str()) {
            if parent_size == size && parent_mtime == mtime.timestamp() {
                continue;
            }
        }

        selected.push((rel_path, size));
    }

    selected.sort_by(|a, b| order_key(&a.0).cmp(&order_key(&b.0)));

    let total_files = selected.len() as u64;
    let total_bytes = selected.iter().map(|(_, size)| size).sum();
    let rel_paths = selected.into_iter().map(|(path, _)| path).collect();

    Ok(ScanResult {
        order: FileOrder { root, rel_paths },
        total_files,
        total_bytes,
        snapshot,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use tba_api_types::SourceType;

    fn testdir(name: &str) -> PathBuf {
        let mut dir: PathBuf = String::from("./target/testout").into();
        dir.push(module_path!());
        dir.push(name);
        let _ = std::fs::remove_dir_all(&dir);
        let _ = std::fs::create_dir_all(&dir);
        dir
    }

    fn source_at(root: &Path, include: &[&str], exclude: &[&str]) -> Source {
        Source {
            id: 1,
            path: root.to_string_lossy().into_owned(),
            source_type: SourceType::Local,
            include_patterns: include.iter().map(|s| s.to_string()).collect(),
            exclude_patterns: exclude.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn write(root: &Path, rel: &str, content: &[u8]) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn scan_is_sorted_shortest_path_first() {
        let root = testdir("scan_is_sorted");
        write(&root, "deep/nested/file.txt", b"x");
        write(&root, "b.txt", b"xx");
        write(&root, "a.txt", b"xxx");
        write(&root, "deep/one.txt", b"x");

        let source = source_at(&root, &[], &[]);
        let scan = scan_source(&source, None).unwrap();

        let order: Vec<_> = (0..scan.order.len())
            .map(|i| scan.order.rel_path(i).unwrap().to_string())
            .collect();
        assert_eq!(order, vec!["a.txt", "b.txt", "deep/one.txt", "deep/nested/file.txt"]);
        assert_eq!(scan.total_files, 4);
        assert_eq!(scan.total_bytes, 7);
    }

    #[test]
    fn exclude_patterns_filter_files() {
        let root = testdir("exclude_patterns");
        write(&root, "keep.txt", b"k");
        write(&root, "skip.log", b"s");
        write(&root, "logs/more.log", b"s");

        let source = source_at(&root, &[], &["*.log"]);
        let scan = scan_source(&source, None).unwrap();
        assert_eq!(scan.total_files, 1);
        assert_eq!(scan.order.rel_path(0), Some("keep.txt"));
    }

    #[test]
    fn include_patterns_limit_selection() {
        let root = testdir("include_patterns");
        write(&root, "doc.txt", b"d");
        write(&root, "image.png", b"i");

        let source = source_at(&root, &["*.txt"], &[]);
        let scan = scan_source(&source, None).unwrap();
        assert_eq!(scan.total_files, 1);
        assert_eq!(scan.order.rel_path(0), Some("doc.txt"));

        // snapshot still covers everything present
        assert_eq!(scan.snapshot.len(), 1);
    }

    #[test]
    fn incremental_diff_emits_only_changes() {
        let root = testdir("incremental_diff");
        write(&root, "same.txt", b"unchanged");
        write(&root, "grown.txt", b"now larger");
        write(&root, "new.txt", b"fresh");

        let meta_same = std::fs::metadata(root.join("same.txt")).unwrap();
        let parent = vec![
            SnapshotEntry {
                backup_set_id: 1,
                file_path: "same.txt".to_string(),
                file_size: meta_same.len(),
                mod_time: mtime_of(&meta_same),
            },
            SnapshotEntry {
                backup_set_id: 1,
                file_path: "grown.txt".to_string(),
                file_size: 1,
                mod_time: mtime_of(&meta_same),
            },
            SnapshotEntry {
                backup_set_id: 1,
                file_path: "gone.txt".to_string(),
                file_size: 3,
                mod_time: mtime_of(&meta_same),
            },
        ];

        let source = source_at(&root, &[], &[]);
        let scan = scan_source(&source, Some(&parent)).unwrap();

        let order: Vec<_> = (0..scan.order.len())
            .map(|i| scan.order.rel_path(i).unwrap().to_string())
            .collect();
        assert_eq!(order, vec!["grown.txt", "new.txt"]);

        // the new snapshot reflects current state, including unchanged
        assert_eq!(scan.snapshot.len(), 3);
    }
}

//! Sorted registry of the file groups in a repository.
//!
//! Holds the partition ids present on disk, sorted ascending, so the
//! commit pipeline can probe `[sfid, efid]` with a bounds check and a
//! binary search. Creation is idempotent and rare, so insertion keeps
//! the vector sorted in place rather than re-sorting.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::{FileError, FileGroup};

/// The file-group registry for one data directory.
pub struct FileDir {
    data_dir: PathBuf,
    /// Sorted ascending by `fid`.
    groups: Vec<FileGroup>,
    max_groups: usize,
}

impl FileDir {
    /// Scans `data_dir` for existing groups and discards staging files
    /// left behind by an interrupted commit (the committed files are
    /// still intact, so dropping the staged ones restores the
    /// pre-commit state).
    pub fn load(data_dir: &Path, max_groups: usize) -> Result<Self, FileError> {
        let mut fids = Vec::new();

        for entry in fs::read_dir(data_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };

            if name.ends_with(".t") {
                warn!(file = name, "removing staging file from interrupted commit");
                fs::remove_file(entry.path())?;
                continue;
            }

            if let Some(fid) = name
                .strip_prefix('f')
                .and_then(|s| s.strip_suffix(".head"))
                .and_then(|s| s.parse::<i64>().ok())
            {
                fids.push(fid);
            }
        }

        fids.sort_unstable();
        let mut groups = Vec::with_capacity(fids.len());
        for fid in fids {
            groups.push(FileGroup::open(data_dir, fid)?);
        }

        info!(groups = groups.len(), "loaded file directory");
        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            groups,
            max_groups,
        })
    }

    /// Number of registered groups.
    pub fn num_groups(&self) -> usize {
        self.groups.len()
    }

    /// All groups, ascending by `fid`.
    pub fn iter(&self) -> impl Iterator<Item = &FileGroup> {
        self.groups.iter()
    }

    /// Finds the group for `fid`, bounds-checking against the smallest
    /// and largest registered ids before the binary search.
    pub fn find(&self, fid: i64) -> Option<&FileGroup> {
        let first = self.groups.first()?.fid;
        let last = self.groups.last()?.fid;
        if fid < first || fid > last {
            return None;
        }
        self.groups
            .binary_search_by_key(&fid, |g| g.fid)
            .ok()
            .map(|i| &self.groups[i])
    }

    /// Returns the group for `fid`, creating its files if absent.
    /// Idempotent: an existing group is returned unchanged.
    pub fn ensure(&mut self, fid: i64, max_tables: i32) -> Result<&FileGroup, FileError> {
        if let Ok(i) = self.groups.binary_search_by_key(&fid, |g| g.fid) {
            return Ok(&self.groups[i]);
        }

        if self.groups.len() >= self.max_groups {
            return Err(FileError::TooManyGroups(self.max_groups));
        }

        let group = FileGroup::create(&self.data_dir, fid, max_tables)?;
        let at = self.groups.partition_point(|g| g.fid < fid);
        self.groups.insert(at, group);
        debug!(fid, groups = self.groups.len(), "registered file group");
        Ok(&self.groups[at])
    }

    /// Removes the group for `fid` and unlinks its three files.
    /// Returns whether a group was present.
    pub fn remove(&mut self, fid: i64) -> Result<bool, FileError> {
        let Ok(i) = self.groups.binary_search_by_key(&fid, |g| g.fid) else {
            return Ok(false);
        };
        self.groups[i].remove()?;
        self.groups.remove(i);
        info!(fid, "removed file group");
        Ok(true)
    }

    /// Retention sweep: removes every group whose id is strictly below
    /// `min_fid` (its whole covered range has expired). Returns the
    /// removed ids.
    pub fn sweep_expired(&mut self, min_fid: i64) -> Result<Vec<i64>, FileError> {
        let mut removed = Vec::new();
        while let Some(first) = self.groups.first() {
            if first.fid >= min_fid {
                break;
            }
            let fid = first.fid;
            self.groups[0].remove()?;
            self.groups.remove(0);
            removed.push(fid);
        }
        if !removed.is_empty() {
            info!(?removed, "retention sweep removed expired file groups");
        }
        Ok(removed)
    }
}

//! On-disk layout for category indexes.
//!
//! Each category owns a pair of files inside the vector directory:
//!
//! | File | Content |
//! |------|---------|
//! | `index_<category>.idx` | [`FlatIndex`] binary |
//! | `meta_<category>.json` | JSON array of [`Chunk`], positionally aligned with the index |
//!
//! During an update the primaries are moved to `.bak` siblings and the new
//! pair is written to `.tmp` siblings, then renamed into place. A
//! [`Backup`] guard owns that sequence: [`Backup::commit`] removes the
//! backups once both primaries are in place, and dropping an uncommitted
//! guard puts the backups back.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::{RagError, Result};
use crate::flat_index::FlatIndex;
use crate::models::Chunk;

/// Paths of every file that may exist for one category.
#[derive(Debug, Clone)]
pub struct CategoryPaths {
    pub index: PathBuf,
    pub meta: PathBuf,
}

impl CategoryPaths {
    pub fn new(vector_dir: &Path, category: &str) -> Self {
        Self::for_stem(vector_dir, &encode_file_stem(category))
    }

    fn for_stem(vector_dir: &Path, stem: &str) -> Self {
        Self {
            index: vector_dir.join(format!("index_{}.idx", stem)),
            meta: vector_dir.join(format!("meta_{}.json", stem)),
        }
    }

    pub fn index_backup(&self) -> PathBuf {
        with_suffix(&self.index, "bak")
    }

    pub fn meta_backup(&self) -> PathBuf {
        with_suffix(&self.meta, "bak")
    }

    fn index_staging(&self) -> PathBuf {
        with_suffix(&self.index, "tmp")
    }

    fn meta_staging(&self) -> PathBuf {
        with_suffix(&self.meta, "tmp")
    }

    /// True when both primary files are present.
    pub fn exists(&self) -> bool {
        self.index.exists() && self.meta.exists()
    }

    pub fn has_backup(&self) -> bool {
        self.index_backup().exists() || self.meta_backup().exists()
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".");
    os.push(suffix);
    PathBuf::from(os)
}

/// Reversibly map an arbitrary name onto a filesystem-safe file stem.
///
/// Bytes outside `[A-Za-z0-9-.~]` are percent-encoded, `_` included, so `_`
/// can join two encoded names unambiguously. A leading `.` is escaped and
/// the empty name maps to `%`. Distinct names never share a stem.
pub fn encode_file_stem(name: &str) -> String {
    if name.is_empty() {
        return "%".to_string();
    }
    let encoded = urlencoding::encode(name).replace('_', "%5F");
    if let Some(rest) = encoded.strip_prefix('.') {
        return format!("%2E{}", rest);
    }
    encoded
}

/// Inverse of [`encode_file_stem`]; `None` when `stem` is not a valid encoding.
pub fn decode_file_stem(stem: &str) -> Option<String> {
    if stem == "%" {
        return Some(String::new());
    }
    urlencoding::decode(stem).ok().map(|name| name.into_owned())
}

pub fn read_metadata(path: &Path) -> Result<Vec<Chunk>> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Load the index and metadata of a category.
///
/// Fails with [`RagError::NotFound`] when either file is missing and with
/// [`RagError::Corrupt`] when the two disagree on length.
pub fn read_pair(paths: &CategoryPaths, category: &str) -> Result<(FlatIndex, Vec<Chunk>)> {
    if !paths.exists() {
        return Err(RagError::NotFound(format!(
            "no index for category '{}'",
            category
        )));
    }
    load_pair(&paths.index, &paths.meta)
}

fn load_pair(index_path: &Path, meta_path: &Path) -> Result<(FlatIndex, Vec<Chunk>)> {
    let index = FlatIndex::read_from(index_path)?;
    let metas = read_metadata(meta_path)?;
    if index.len() != metas.len() {
        return Err(RagError::Corrupt(format!(
            "{} holds {} vectors but {} has {} entries",
            index_path.display(),
            index.len(),
            meta_path.display(),
            metas.len()
        )));
    }
    Ok((index, metas))
}

/// Write a new index/metadata pair via staging files and atomic renames.
pub fn write_pair(paths: &CategoryPaths, index: &FlatIndex, metas: &[Chunk]) -> Result<()> {
    let index_tmp = paths.index_staging();
    let meta_tmp = paths.meta_staging();

    let staged = (|| -> Result<()> {
        index.write_to(&index_tmp)?;
        let json = serde_json::to_vec(metas)?;
        fs::write(&meta_tmp, json)?;
        fs::File::open(&meta_tmp)?.sync_all()?;
        Ok(())
    })();
    if let Err(e) = staged {
        let _ = fs::remove_file(&index_tmp);
        let _ = fs::remove_file(&meta_tmp);
        return Err(e);
    }

    fs::rename(&index_tmp, &paths.index)?;
    fs::rename(&meta_tmp, &paths.meta)?;
    Ok(())
}

/// In-flight update of one category.
///
/// Created by [`Backup::begin`], which moves the current primaries aside.
/// Exactly one of [`commit`](Backup::commit) or [`restore`](Backup::restore)
/// should follow; dropping the guard without either restores.
pub struct Backup<'a> {
    paths: &'a CategoryPaths,
    finished: bool,
}

impl<'a> Backup<'a> {
    /// Move the primary files to their `.bak` siblings. Missing primaries
    /// are skipped. Leftovers of an interrupted update are rolled back first.
    pub fn begin(paths: &'a CategoryPaths) -> Result<Self> {
        if paths.has_backup() {
            warn!(index = %paths.index.display(), "found backups of an interrupted update, restoring");
            restore_backups(paths)?;
        }
        if paths.index.exists() {
            fs::rename(&paths.index, paths.index_backup())?;
        }
        if paths.meta.exists() {
            if let Err(e) = fs::rename(&paths.meta, paths.meta_backup()) {
                if paths.index_backup().exists() {
                    fs::rename(paths.index_backup(), &paths.index)?;
                }
                return Err(e.into());
            }
        }
        Ok(Self {
            paths,
            finished: false,
        })
    }

    /// True when both backups exist, i.e. there is prior state to merge.
    pub fn has_previous(&self) -> bool {
        self.paths.index_backup().exists() && self.paths.meta_backup().exists()
    }

    /// Load the backed-up pair.
    pub fn load_previous(&self) -> Result<(FlatIndex, Vec<Chunk>)> {
        load_pair(&self.paths.index_backup(), &self.paths.meta_backup())
    }

    /// Drop the backups. Call only after [`write_pair`] succeeded.
    pub fn commit(mut self) -> Result<()> {
        self.finished = true;
        for path in [self.paths.index_backup(), self.paths.meta_backup()] {
            if path.exists() {
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    /// Put the backups back in place of whatever the primaries hold now.
    pub fn restore(mut self) -> Result<()> {
        self.finished = true;
        restore_backups(self.paths)
    }
}

impl Drop for Backup<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = restore_backups(self.paths) {
                warn!(index = %self.paths.index.display(), error = %e, "failed to restore backups");
            }
        }
    }
}

/// Roll a category back to the state recorded in its `.bak` siblings.
///
/// A primary without a matching backup did not exist before the update
/// began and is removed, so the pair never mixes old and new halves.
fn restore_backups(paths: &CategoryPaths) -> Result<()> {
    let _ = fs::remove_file(paths.index_staging());
    let _ = fs::remove_file(paths.meta_staging());
    for (primary, backup) in [
        (&paths.index, paths.index_backup()),
        (&paths.meta, paths.meta_backup()),
    ] {
        if backup.exists() {
            fs::rename(&backup, primary)?;
        } else if primary.exists() {
            fs::remove_file(primary)?;
        }
    }
    Ok(())
}

/// Roll back every category in `vector_dir` that was left mid-update by a
/// crash. Returns how many categories were restored.
pub fn recover_interrupted(vector_dir: &Path) -> Result<usize> {
    if !vector_dir.exists() {
        return Ok(0);
    }
    let mut stems = BTreeSet::new();
    for entry in fs::read_dir(vector_dir)? {
        let name = entry?.file_name().to_string_lossy().to_string();
        let stem = name
            .strip_prefix("index_")
            .and_then(|s| s.strip_suffix(".idx.bak"))
            .or_else(|| {
                name.strip_prefix("meta_")
                    .and_then(|s| s.strip_suffix(".json.bak"))
            });
        if let Some(stem) = stem {
            stems.insert(stem.to_string());
        }
    }
    for stem in &stems {
        let paths = CategoryPaths::for_stem(vector_dir, stem);
        restore_backups(&paths)?;
        let category = decode_file_stem(stem).unwrap_or_else(|| stem.clone());
        info!(category = %category, "restored category from interrupted update");
    }
    Ok(stems.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_pair() -> (FlatIndex, Vec<Chunk>) {
        let mut index = FlatIndex::new(2).unwrap();
        index.add(&[1.0, 0.0]).unwrap();
        index.add(&[0.0, 1.0]).unwrap();
        let metas = vec![
            Chunk::new("a", 0, "alpha", "cat", "north"),
            Chunk::new("b", 0, "beta", "cat", "south"),
        ];
        (index, metas)
    }

    #[test]
    fn test_encode_file_stem() {
        assert_eq!(encode_file_stem("science"), "science");
        assert_eq!(encode_file_stem("sci-fi.v2"), "sci-fi.v2");
        assert_eq!(encode_file_stem("a b"), "a%20b");
        assert_eq!(encode_file_stem("a_b"), "a%5Fb");
        assert_eq!(encode_file_stem("../etc/passwd"), "%2E.%2Fetc%2Fpasswd");
        assert_eq!(encode_file_stem(""), "%");
        assert!(!encode_file_stem("a/b\\c").contains(&['/', '\\'][..]));
    }

    #[test]
    fn test_file_stem_round_trips_and_never_collides() {
        let names = ["a b", "a_b", "a/b", "a%20b", "sci fi", "sci_fi", "", ".", "..", "é"];
        let stems: BTreeSet<String> = names.iter().map(|n| encode_file_stem(n)).collect();
        assert_eq!(stems.len(), names.len());
        for name in names {
            assert_eq!(decode_file_stem(&encode_file_stem(name)).as_deref(), Some(name));
        }
    }

    #[test]
    fn test_distinct_categories_get_distinct_paths() {
        let tmp = TempDir::new().unwrap();
        let spaced = CategoryPaths::new(tmp.path(), "a b");
        let underscored = CategoryPaths::new(tmp.path(), "a_b");
        assert_ne!(spaced.index, underscored.index);
        assert_ne!(spaced.meta, underscored.meta);
    }

    #[test]
    fn test_write_then_read_pair() {
        let tmp = TempDir::new().unwrap();
        let paths = CategoryPaths::new(tmp.path(), "cat");
        let (index, metas) = sample_pair();
        write_pair(&paths, &index, &metas).unwrap();

        let (read_index, read_metas) = read_pair(&paths, "cat").unwrap();
        assert_eq!(read_index.reconstruct(0).unwrap(), vec![1.0, 0.0]);
        assert_eq!(read_index.reconstruct(1).unwrap(), vec![0.0, 1.0]);
        assert_eq!(read_metas, metas);
        assert!(!with_suffix(&paths.index, "tmp").exists());
    }

    #[test]
    fn test_metadata_with_only_source_reads_back() {
        let tmp = TempDir::new().unwrap();
        let paths = CategoryPaths::new(tmp.path(), "cat");
        let mut index = FlatIndex::new(2).unwrap();
        index.add(&[1.0, 0.0]).unwrap();
        index.add(&[0.0, 1.0]).unwrap();
        index.write_to(&paths.index).unwrap();
        fs::write(&paths.meta, r#"[{"source":"a"},{"source":"b"}]"#).unwrap();

        let (_, metas) = read_pair(&paths, "cat").unwrap();
        let sources: Vec<&str> = metas.iter().map(|m| m.source.as_str()).collect();
        assert_eq!(sources, vec!["a", "b"]);
        assert!(metas[0].text.is_none());
    }

    #[test]
    fn test_read_missing_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let paths = CategoryPaths::new(tmp.path(), "nope");
        assert!(matches!(
            read_pair(&paths, "nope"),
            Err(RagError::NotFound(_))
        ));
    }

    #[test]
    fn test_backup_dropped_without_commit_restores() {
        let tmp = TempDir::new().unwrap();
        let paths = CategoryPaths::new(tmp.path(), "cat");
        let (index, metas) = sample_pair();
        write_pair(&paths, &index, &metas).unwrap();
        let before = fs::read(&paths.index).unwrap();

        {
            let backup = Backup::begin(&paths).unwrap();
            assert!(backup.has_previous());
            assert!(!paths.index.exists());
            fs::write(&paths.index, b"half written").unwrap();
        }

        assert_eq!(fs::read(&paths.index).unwrap(), before);
        assert!(!paths.has_backup());
    }

    #[test]
    fn test_commit_removes_backups() {
        let tmp = TempDir::new().unwrap();
        let paths = CategoryPaths::new(tmp.path(), "cat");
        let (index, metas) = sample_pair();
        write_pair(&paths, &index, &metas).unwrap();

        let backup = Backup::begin(&paths).unwrap();
        write_pair(&paths, &index, &metas).unwrap();
        backup.commit().unwrap();
        assert!(paths.exists());
        assert!(!paths.has_backup());
    }

    #[test]
    fn test_recover_interrupted_rolls_back() {
        let tmp = TempDir::new().unwrap();
        let paths = CategoryPaths::new(tmp.path(), "cat");
        let (index, metas) = sample_pair();
        write_pair(&paths, &index, &metas).unwrap();

        // Simulate a crash after the backups were taken and only the new
        // index made it into place.
        fs::rename(&paths.index, paths.index_backup()).unwrap();
        fs::rename(&paths.meta, paths.meta_backup()).unwrap();
        FlatIndex::new(2).unwrap().write_to(&paths.index).unwrap();

        assert_eq!(recover_interrupted(tmp.path()).unwrap(), 1);
        let (restored, restored_metas) = read_pair(&paths, "cat").unwrap();
        assert_eq!(restored.len(), 2);
        assert_eq!(restored_metas, metas);
    }
}

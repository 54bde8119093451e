//! On-disk job storage: one JSON file per job, `<TypeName>-<Number>.json`.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use lazy_static::lazy_static;
use regex::Regex;

use crate::job::{JobSnapshot, JobType};

lazy_static! {
    static ref JOB_FILE_RE: Regex = Regex::new(r"^(.*)-(\d+)\.json$").unwrap();
}

/// A persisted job file discovered in the storage directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredJobFile {
    /// Full path.
    pub path: PathBuf,
    /// Type name embedded in the file name.
    pub type_name: String,
    /// Job number embedded in the file name.
    pub number: u64,
}

/// Storage directory of one profile.
#[derive(Debug, Clone)]
pub struct JobStorage {
    dir: PathBuf,
}

impl JobStorage {
    /// Storage rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `<root>/<profile lowercased>`.
    pub fn for_profile(root: &Path, profile: &str) -> Self {
        Self::new(root.join(profile.to_lowercase()))
    }

    /// Storage directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File a job of `job_type` numbered `number` is stored in.
    pub fn job_path(&self, job_type: &JobType, number: u64) -> PathBuf {
        self.dir.join(format!("{job_type}-{number}.json"))
    }

    /// Create the storage directory if missing.
    pub fn ensure_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.dir).with_context(|| {
            format!("failed to create job storage directory {}", self.dir.display())
        })
    }

    /// Replace the job's file with `snapshot`, staged through a synced temp
    /// file so readers never see a partial write.
    pub fn save(&self, snapshot: &JobSnapshot) -> Result<PathBuf> {
        let path = self.job_path(&snapshot.job_type, snapshot.number);
        let content = serde_json::to_vec_pretty(snapshot)
            .with_context(|| format!("failed to serialize job {}", snapshot.number))?;
        self.ensure_dir()?;

        // Staged names never match the job file pattern.
        let mut staged = tempfile::NamedTempFile::new_in(&self.dir)
            .with_context(|| format!("failed to stage job file in {}", self.dir.display()))?;
        staged
            .write_all(&content)
            .and_then(|()| staged.as_file().sync_all())
            .with_context(|| format!("failed to write staged job file for {}", path.display()))?;
        staged
            .persist(&path)
            .map_err(|error| error.error)
            .with_context(|| format!("failed to replace job file {}", path.display()))?;
        Ok(path)
    }

    /// Remove a job's file. Returns `false` when there was none.
    pub fn remove(&self, job_type: &JobType, number: u64) -> Result<bool> {
        let path = self.job_path(job_type, number);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(error) => Err(error)
                .with_context(|| format!("failed to remove job file {}", path.display())),
        }
    }

    /// Job files in the directory, sorted by number. A missing directory is empty.
    pub fn list(&self) -> Result<Vec<StoredJobFile>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => {
                return Err(error).with_context(|| {
                    format!("failed to read job storage directory {}", self.dir.display())
                });
            }
        };

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.with_context(|| {
                format!("failed to read entry of {}", self.dir.display())
            })?;
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if !(file_type.is_file() || file_type.is_symlink()) {
                continue;
            }
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            let Some(captures) = JOB_FILE_RE.captures(name) else {
                tracing::debug!(file = %name, "ignoring non-job file in storage directory");
                continue;
            };
            let Ok(number) = captures[2].parse::<u64>() else {
                continue;
            };
            files.push(StoredJobFile {
                path: entry.path(),
                type_name: captures[1].to_string(),
                number,
            });
        }
        files.sort_by(|a, b| a.number.cmp(&b.number).then_with(|| a.path.cmp(&b.path)));
        Ok(files)
    }

    /// Read one job file, checking it against its file name.
    pub fn load(&self, file: &StoredJobFile) -> Result<JobSnapshot> {
        let raw = std::fs::read_to_string(&file.path)
            .with_context(|| format!("failed to read job file {}", file.path.display()))?;
        let snapshot: JobSnapshot = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse job file {}", file.path.display()))?;
        if snapshot.number != file.number || snapshot.job_type.as_str() != file.type_name {
            bail!(
                "job file {} holds {}-{}",
                file.path.display(),
                snapshot.job_type,
                snapshot.number
            );
        }
        Ok(snapshot)
    }

    /// Every readable job, in number order. Broken files are logged and skipped.
    pub fn load_all(&self) -> Result<Vec<JobSnapshot>> {
        let mut snapshots = Vec::new();
        for file in self.list()? {
            match self.load(&file) {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(error) => tracing::warn!(
                    path = %file.path.display(),
                    error = %format!("{error:#}"),
                    "skipping unreadable job file"
                ),
            }
        }
        Ok(snapshots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobState;

    fn snapshot(type_name: &str, number: u64) -> JobSnapshot {
        JobSnapshot::new(number, format!("LMI:LMI_{type_name}:{number}"), JobType::new(type_name))
    }

    #[test]
    fn test_list_sorts_numerically_and_skips_noise() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let storage = JobStorage::for_profile(tmp.path(), "Software");
        for number in [10, 2, 1] {
            storage.save(&snapshot("Install", number)).expect("save");
        }
        std::fs::write(storage.dir().join("notes.txt"), "x").expect("write");
        std::fs::create_dir(storage.dir().join("Install-99.json")).expect("mkdir");

        let numbers: Vec<_> = storage.list().expect("list").iter().map(|f| f.number).collect();
        assert_eq!(numbers, vec![1, 2, 10]);
        assert!(storage.dir().ends_with("software"));
    }

    #[test]
    fn test_type_names_with_dashes() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let storage = JobStorage::new(tmp.path());
        storage.save(&snapshot("Verify-Job", 3)).expect("save");
        let files = storage.list().expect("list");
        assert_eq!(files[0].type_name, "Verify-Job");
        assert_eq!(files[0].number, 3);
    }

    #[test]
    fn test_load_all_skips_corrupt_files() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let storage = JobStorage::new(tmp.path());
        let mut good = snapshot("Install", 1);
        good.state = JobState::Running;
        good.priority = 7;
        storage.save(&good).expect("save");
        std::fs::write(storage.dir().join("Install-2.json"), "{").expect("write");

        let loaded = storage.load_all().expect("load");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0], good);
    }

    #[test]
    fn test_remove_missing_is_not_an_error() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let storage = JobStorage::new(tmp.path());
        assert!(!storage.remove(&JobType::new("Install"), 4).expect("remove"));
        storage.save(&snapshot("Install", 4)).expect("save");
        assert!(storage.remove(&JobType::new("Install"), 4).expect("remove"));
    }

    #[test]
    fn test_missing_directory_lists_nothing() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let storage = JobStorage::new(tmp.path().join("absent"));
        assert!(storage.list().expect("list").is_empty());
    }
}

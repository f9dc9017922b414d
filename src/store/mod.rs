//! Versioned, append-only table store.
//!
//! Layout under the root directory:
//!
//! ```text
//! raw/part-<version>-<digest>-<token>.json      immutable column-oriented data files
//! actors/part-<version>-<digest>-<token>.json
//! _log/<version:020>.json               one commit entry per version
//! ```
//!
//! A version exists once its log entry exists. Data files are written first and
//! the log entry is published last with a create-if-absent link, so readers
//! either see every file of a commit or none of them. Files that no log entry
//! references (left by a failed commit) are never read. Every commit attempt
//! names its files with its own token, so a writer that loses a race only ever
//! deletes files nobody else points to.

pub mod batch;
pub mod records;

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use metrics::{counter, describe_counter};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::StorageError;
use crate::store::batch::{Column, RecordBatch, Schema};
use crate::store::records::{ActorTableRecord, RawNewsRecord, TableRecord, RAW_TABLE};

pub use crate::store::records::ACTORS_TABLE;

const LOG_DIR: &str = "_log";

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("store_commits_total", "Versions committed to the table store.");
        describe_counter!("store_rows_total", "Rows appended, by table.");
    });
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataFile {
    /// Relative to the store root.
    pub path: String,
    pub rows: usize,
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableAction {
    pub schema: Schema,
    pub files: Vec<DataFile>,
    /// Primary keys added by this commit, for tables that have one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keys: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitEntry {
    pub version: u64,
    pub timestamp: DateTime<Utc>,
    pub operation: String,
    pub tables: BTreeMap<String, TableAction>,
}

/// Both tables as of one version.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub version: Option<u64>,
    pub raw: Vec<RawNewsRecord>,
    pub actors: Vec<ActorTableRecord>,
}

pub struct VersionedStore {
    root: PathBuf,
}

impl VersionedStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        for dir in [RAW_TABLE, ACTORS_TABLE, LOG_DIR] {
            let p = root.join(dir);
            fs::create_dir_all(&p).map_err(|e| StorageError::io(&p, e))?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn log_path(&self, version: u64) -> PathBuf {
        self.root.join(LOG_DIR).join(format!("{version:020}.json"))
    }

    /// Committed versions, ascending.
    pub fn versions(&self) -> Result<Vec<u64>, StorageError> {
        let dir = self.root.join(LOG_DIR);
        let rd = fs::read_dir(&dir).map_err(|e| StorageError::io(&dir, e))?;
        let mut out = Vec::new();
        for e in rd {
            let e = e.map_err(|e| StorageError::io(&dir, e))?;
            let name = e.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            if let Ok(v) = stem.parse::<u64>() {
                out.push(v);
            }
        }
        out.sort_unstable();
        Ok(out)
    }

    pub fn latest_version(&self) -> Result<Option<u64>, StorageError> {
        Ok(self.versions()?.last().copied())
    }

    pub fn read_entry(&self, version: u64) -> Result<CommitEntry, StorageError> {
        let path = self.log_path(version);
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StorageError::UnknownVersion(version))
            }
            Err(e) => return Err(StorageError::io(&path, e)),
        };
        serde_json::from_slice(&bytes).map_err(|e| StorageError::Corrupt {
            path,
            detail: e.to_string(),
        })
    }

    /// Log entries up to and including `as_of` (latest if `None`).
    fn entries_as_of(&self, as_of: Option<u64>) -> Result<Vec<CommitEntry>, StorageError> {
        let versions = self.versions()?;
        let limit = match as_of {
            Some(v) if !versions.contains(&v) => return Err(StorageError::UnknownVersion(v)),
            Some(v) => v,
            None => u64::MAX,
        };
        versions
            .into_iter()
            .take_while(|v| *v <= limit)
            .map(|v| self.read_entry(v))
            .collect()
    }

    /// Schema recorded for `table` by the newest entry that touched it.
    pub fn table_schema(
        &self,
        table: &str,
        as_of: Option<u64>,
    ) -> Result<Option<Schema>, StorageError> {
        Ok(self
            .entries_as_of(as_of)?
            .into_iter()
            .rev()
            .find_map(|e| e.tables.get(table).map(|a| a.schema.clone())))
    }

    /// All rows of `T`'s table visible at `as_of`.
    pub fn read_table<T: TableRecord>(&self, as_of: Option<u64>) -> Result<Vec<T>, StorageError> {
        let mut rows = Vec::new();
        for entry in self.entries_as_of(as_of)? {
            let Some(action) = entry.tables.get(T::TABLE) else {
                continue;
            };
            for file in &action.files {
                let batch = self.read_data_file(file)?;
                batch.schema().check_matches(&T::schema(), T::TABLE)?;
                rows.extend(T::from_batch(&batch)?);
            }
        }
        Ok(rows)
    }

    pub fn snapshot(&self, as_of: Option<u64>) -> Result<Snapshot, StorageError> {
        let version = match as_of {
            Some(v) => Some(v),
            None => self.latest_version()?,
        };
        if version.is_none() {
            return Ok(Snapshot::default());
        }
        Ok(Snapshot {
            version,
            raw: self.read_table(version)?,
            actors: self.read_table(version)?,
        })
    }

    /// Ids present in `raw` at the latest version.
    ///
    /// Served from the key index in the log; only entries written without one
    /// fall back to reading their data files.
    pub fn committed_ids(&self) -> Result<HashSet<String>, StorageError> {
        let mut ids = HashSet::new();
        for entry in self.entries_as_of(None)? {
            let Some(action) = entry.tables.get(RAW_TABLE) else {
                continue;
            };
            match &action.keys {
                Some(keys) => ids.extend(keys.iter().cloned()),
                None => {
                    for file in &action.files {
                        let batch = self.read_data_file(file)?;
                        ids.extend(RawNewsRecord::from_batch(&batch)?.into_iter().map(|r| r.id));
                    }
                }
            }
        }
        Ok(ids)
    }

    fn read_data_file(&self, file: &DataFile) -> Result<RecordBatch, StorageError> {
        let path = self.root.join(&file.path);
        let bytes = fs::read(&path).map_err(|e| StorageError::io(&path, e))?;
        if hex_digest(&bytes) != file.sha256 {
            return Err(StorageError::Corrupt {
                path,
                detail: "checksum mismatch".to_string(),
            });
        }
        let batch: RecordBatch = serde_json::from_slice(&bytes).map_err(|e| StorageError::Corrupt {
            path: path.clone(),
            detail: e.to_string(),
        })?;
        if batch.num_rows() != file.rows {
            return Err(StorageError::Corrupt {
                path,
                detail: format!("{} rows, log says {}", batch.num_rows(), file.rows),
            });
        }
        let table = file.path.split('/').next().unwrap_or_default().to_string();
        batch.validated(&table)
    }

    /// Append both tables' rows as one new version, or nothing at all.
    ///
    /// Returns the new version, or `None` if there was nothing to write.
    pub fn commit_batch(
        &self,
        raw: &[RawNewsRecord],
        actors: &[ActorTableRecord],
    ) -> Result<Option<u64>, StorageError> {
        ensure_metrics_described();
        if raw.is_empty() && actors.is_empty() {
            return Ok(None);
        }

        let latest = self.latest_version()?;
        let version = latest.map_or(0, |v| v + 1);

        // Validate everything before the first byte hits the disk.
        let raw_batch = RawNewsRecord::to_batch(raw)?;
        let actor_batch = ActorTableRecord::to_batch(actors)?;
        for (table, batch) in [(RAW_TABLE, &raw_batch), (ACTORS_TABLE, &actor_batch)] {
            if let Some(recorded) = self.table_schema(table, latest)? {
                batch.schema().check_matches(&recorded, table)?;
            }
        }
        self.check_unique_ids(raw)?;

        self.write_version(version, &raw_batch, &actor_batch)?;

        counter!("store_commits_total").increment(1);
        counter!("store_rows_total", "table" => RAW_TABLE).increment(raw.len() as u64);
        counter!("store_rows_total", "table" => ACTORS_TABLE).increment(actors.len() as u64);
        tracing::info!(
            version,
            raw = raw.len(),
            actors = actors.len(),
            "committed store version"
        );
        Ok(Some(version))
    }

    fn check_unique_ids(&self, raw: &[RawNewsRecord]) -> Result<(), StorageError> {
        let existing = self.committed_ids()?;
        let mut in_batch = HashSet::with_capacity(raw.len());
        for r in raw {
            if existing.contains(&r.id) || !in_batch.insert(r.id.as_str()) {
                return Err(StorageError::DuplicateKey {
                    table: RAW_TABLE.to_string(),
                    key: r.id.clone(),
                });
            }
        }
        Ok(())
    }

    /// Write the data files of `version` and publish it. On any error the files
    /// this attempt created are removed again.
    fn write_version(
        &self,
        version: u64,
        raw: &RecordBatch,
        actors: &RecordBatch,
    ) -> Result<(), StorageError> {
        let token = Uuid::new_v4().simple().to_string();
        let mut written: Vec<PathBuf> = Vec::new();
        let result = self.write_version_files(version, &token, raw, actors, &mut written);
        if result.is_err() {
            for p in &written {
                let _ = fs::remove_file(p);
            }
        }
        result
    }

    fn write_version_files(
        &self,
        version: u64,
        token: &str,
        raw: &RecordBatch,
        actors: &RecordBatch,
        written: &mut Vec<PathBuf>,
    ) -> Result<(), StorageError> {
        let mut tables = BTreeMap::new();
        for (table, batch) in [(RAW_TABLE, raw), (ACTORS_TABLE, actors)] {
            if batch.num_rows() == 0 {
                continue;
            }
            let file = self.write_data_file(table, version, token, batch, written)?;
            tables.insert(
                table.to_string(),
                TableAction {
                    schema: batch.schema().clone(),
                    files: vec![file],
                    keys: primary_keys(table, batch),
                },
            );
        }

        let entry = CommitEntry {
            version,
            timestamp: Utc::now(),
            operation: "append".to_string(),
            tables,
        };
        self.publish_entry(&entry, token)
    }

    fn write_data_file(
        &self,
        table: &str,
        version: u64,
        token: &str,
        batch: &RecordBatch,
        written: &mut Vec<PathBuf>,
    ) -> Result<DataFile, StorageError> {
        let bytes = serde_json::to_vec(batch).map_err(|e| StorageError::Corrupt {
            path: self.root.join(table),
            detail: e.to_string(),
        })?;
        let sha256 = hex_digest(&bytes);
        let rel = format!("{table}/part-{version:05}-{}-{}.json", &sha256[..16], &token[..12]);
        let path = self.root.join(&rel);

        let tmp = path.with_extension("json.tmp");
        written.push(tmp.clone());
        write_synced(&tmp, &bytes).map_err(|e| StorageError::io(&tmp, e))?;
        written.push(path.clone());
        fs::rename(&tmp, &path).map_err(|e| StorageError::io(&path, e))?;

        Ok(DataFile {
            path: rel,
            rows: batch.num_rows(),
            sha256,
        })
    }

    /// Create the log entry only if no one else created it first.
    fn publish_entry(&self, entry: &CommitEntry, token: &str) -> Result<(), StorageError> {
        let path = self.log_path(entry.version);
        let tmp = self
            .root
            .join(LOG_DIR)
            .join(format!(".{:020}.{token}.tmp", entry.version));
        let bytes = serde_json::to_vec_pretty(entry).map_err(|e| StorageError::Corrupt {
            path: path.clone(),
            detail: e.to_string(),
        })?;
        write_synced(&tmp, &bytes).map_err(|e| StorageError::io(&tmp, e))?;

        let linked = fs::hard_link(&tmp, &path);
        let _ = fs::remove_file(&tmp);
        match linked {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(StorageError::Conflict {
                version: entry.version,
            }),
            Err(e) => Err(StorageError::io(&path, e)),
        }
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut f = fs::File::create(path)?;
    f.write_all(bytes)?;
    f.sync_all()
}

fn primary_keys(table: &str, batch: &RecordBatch) -> Option<Vec<String>> {
    if table != RAW_TABLE {
        return None;
    }
    match batch.column("id") {
        Some(Column::Utf8(ids)) => Some(ids.iter().flatten().cloned().collect()),
        _ => None,
    }
}

fn hex_digest(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

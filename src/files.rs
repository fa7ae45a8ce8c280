//! Versioned deliverables per `(order, file name)`
//!
//! Uploading is three steps: reserve the next version number, put the bytes in
//! the object store, then commit the row and move the latest marker in one
//! transaction. Reservation is atomic, so racing uploads of the same name get
//! distinct versions. A failed put or commit hands its reservation back when
//! no later upload has reserved past it, so the next version is still the
//! previous max + 1. The latest marker only ever moves to a higher version,
//! so exactly one row per name is latest and it has the highest version.
use std::collections::HashMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, RwLock};

use anyhow::{Context, anyhow};
use chrono::Utc;
use sled::Tree;
use sled::transaction::{ConflictableTransactionResult, Transactional};
use tracing::{debug, info, instrument, warn};

use crate::error::{MarketError, Result, ValidationError};
use crate::store::{compound_key, compound_prefix, decode, decode_u64, encode};
use crate::types::TimeStamp;
use crate::utils::new_uuid_to_bech32;

pub trait ObjectStore: Send + Sync {
    /// Store `bytes` under `path`, returning a URL for the object.
    fn put(&self, path: &str, bytes: &[u8]) -> anyhow::Result<String>;
    fn get(&self, path: &str) -> anyhow::Result<Vec<u8>>;
}

/// Objects as plain files below a root directory.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("creating object root {}", root.display()))?;
        Ok(Self { root })
    }

    fn resolve(&self, path: &str) -> anyhow::Result<PathBuf> {
        let relative = Path::new(path);
        if !relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(anyhow!("object path {path:?} escapes the store root"));
        }
        Ok(self.root.join(relative))
    }
}

impl ObjectStore for FsObjectStore {
    fn put(&self, path: &str, bytes: &[u8]) -> anyhow::Result<String> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&target, bytes).with_context(|| format!("writing {}", target.display()))?;
        Ok(format!("file://{}", target.display()))
    }

    fn get(&self, path: &str) -> anyhow::Result<Vec<u8>> {
        let target = self.resolve(path)?;
        fs::read(&target).with_context(|| format!("reading {}", target.display()))
    }
}

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ObjectStore for MemoryObjectStore {
    fn put(&self, path: &str, bytes: &[u8]) -> anyhow::Result<String> {
        self.objects
            .write()
            .map_err(|_| anyhow!("object map lock poisoned"))?
            .insert(path.to_string(), bytes.to_vec());
        Ok(format!("memory://{path}"))
    }

    fn get(&self, path: &str) -> anyhow::Result<Vec<u8>> {
        self.objects
            .read()
            .map_err(|_| anyhow!("object map lock poisoned"))?
            .get(path)
            .cloned()
            .ok_or_else(|| anyhow!("no object at {path}"))
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct OrderFile {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub order_id: String,
    #[n(2)]
    pub uploader_id: String,
    #[n(3)]
    pub file_name: String,
    #[n(4)]
    pub file_url: String,
    #[n(5)]
    pub file_size: Option<u64>,
    #[n(6)]
    pub version: u64,
    #[n(7)]
    pub is_latest: bool,
    #[n(8)]
    pub created_at: TimeStamp<Utc>,
    #[n(9)]
    pub checksum: String, // sha256 of the uploaded bytes
}

impl OrderFile {
    /// Where the bytes of this version live in the object store.
    pub fn object_path(&self) -> String {
        object_path(&self.order_id, self.version, &self.file_name)
    }
}

#[derive(Debug, Clone)]
pub struct FileUpload {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

impl FileUpload {
    pub fn new(file_name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            file_name: file_name.into(),
            bytes: bytes.into(),
        }
    }

    fn validate(&self) -> std::result::Result<(), ValidationError> {
        let name = self.file_name.as_str();
        if name.trim().is_empty()
            || name == "."
            || name == ".."
            || name.contains(['/', '\\', '\0'])
        {
            return Err(ValidationError::InvalidFileName(self.file_name.clone()));
        }
        if self.bytes.is_empty() {
            return Err(ValidationError::EmptyFile);
        }
        Ok(())
    }
}

fn object_path(order_id: &str, version: u64, file_name: &str) -> String {
    format!("orders/{order_id}/v{version}/{file_name}")
}

fn row_key(order_id: &str, file_name: &str, version: u64) -> Vec<u8> {
    let mut key = compound_prefix(&[order_id, file_name]);
    key.extend_from_slice(&version.to_be_bytes());
    key
}

#[derive(Clone)]
pub struct FileVersionStore {
    files: Tree,
    latest: Tree,
    sequence: Tree,
    objects: Arc<dyn ObjectStore>,
}

impl FileVersionStore {
    pub fn new(files: Tree, latest: Tree, sequence: Tree, objects: Arc<dyn ObjectStore>) -> Self {
        Self {
            files,
            latest,
            sequence,
            objects,
        }
    }

    /// Store a new version of `upload.file_name` for `order_id`.
    ///
    /// Callers are expected to have checked that the order exists and that
    /// `uploader_id` takes part in it.
    #[instrument(skip(self, upload), fields(file_name = %upload.file_name))]
    pub fn upload(&self, order_id: &str, upload: FileUpload, uploader_id: &str) -> Result<OrderFile> {
        upload.validate()?;
        let id = new_uuid_to_bech32("file_").map_err(MarketError::Io)?;

        let name_key = compound_key(&[order_id, &upload.file_name]);
        let version = self.reserve_version(&name_key)?;
        let path = object_path(order_id, version, &upload.file_name);

        let file_url = match self.objects.put(&path, &upload.bytes) {
            Ok(url) => url,
            Err(err) => {
                self.release_version(&name_key, version);
                return Err(MarketError::Io(err));
            }
        };
        let file = OrderFile {
            id,
            order_id: order_id.to_string(),
            uploader_id: uploader_id.to_string(),
            file_name: upload.file_name.clone(),
            file_url,
            file_size: Some(upload.bytes.len() as u64),
            version,
            is_latest: false,
            created_at: TimeStamp::new(),
            checksum: sha256::digest(&upload.bytes),
        };

        match self.commit(&name_key, file) {
            Ok(file) => {
                info!(order_id, version, is_latest = file.is_latest, "file version stored");
                Ok(file)
            }
            Err(err) => {
                warn!(order_id, version, %path, error = %err, "object stored but record commit failed");
                self.release_version(&name_key, version);
                Err(MarketError::PartialFailure(format!(
                    "object {path} was stored but its record was not written: {err}"
                )))
            }
        }
    }

    /// The latest version of every file in the order, newest first.
    pub fn get_order_files(&self, order_id: &str) -> Result<Vec<OrderFile>> {
        let mut files = Vec::new();

        for item in self.latest.scan_prefix(compound_prefix(&[order_id])) {
            let (name_key, version) = item?;
            let mut key = name_key.to_vec();
            key.push(0);
            key.extend_from_slice(&decode_u64(&version)?.to_be_bytes());

            match self.files.get(&key)? {
                Some(bytes) => files.push(decode::<OrderFile>(&bytes)?),
                None => {
                    return Err(MarketError::NotFound(format!(
                        "file row for latest marker of order {order_id}"
                    )));
                }
            }
        }

        sort_newest_first(&mut files);
        Ok(files)
    }

    /// Every version of one file, newest first.
    pub fn get_file_history(&self, order_id: &str, file_name: &str) -> Result<Vec<OrderFile>> {
        self.files
            .scan_prefix(compound_prefix(&[order_id, file_name]))
            .values()
            .rev()
            .map(|bytes| decode(&bytes?))
            .collect()
    }

    pub fn download(&self, file: &OrderFile) -> Result<Vec<u8>> {
        self.objects
            .get(&file.object_path())
            .map_err(MarketError::Io)
    }

    fn reserve_version(&self, name_key: &[u8]) -> Result<u64> {
        Ok(self.sequence.transaction(
            |tx| -> ConflictableTransactionResult<u64, MarketError> {
                let current = match tx.get(name_key)? {
                    Some(bytes) => decode_u64(&bytes)?,
                    None => 0,
                };
                let next = current + 1;
                tx.insert(name_key, next.to_be_bytes().to_vec())?;
                Ok(next)
            },
        )?)
    }

    // Best effort: a later reservation or a storage error leaves the gap in place.
    fn release_version(&self, name_key: &[u8], version: u64) {
        let previous = version.checked_sub(1).filter(|v| *v > 0).map(|v| v.to_be_bytes().to_vec());
        let released = self.sequence.compare_and_swap(
            name_key,
            Some(version.to_be_bytes().to_vec()),
            previous,
        );

        match released {
            Ok(Ok(())) => debug!(version, "version reservation released"),
            Ok(Err(_)) => warn!(version, "version already superseded, leaving a gap"),
            Err(err) => warn!(version, error = %err, "could not release version reservation"),
        }
    }

    fn commit(&self, name_key: &[u8], file: OrderFile) -> Result<OrderFile> {
        let key = row_key(&file.order_id, &file.file_name, file.version);

        Ok((&self.files, &self.latest).transaction(
            |(files, latest)| -> ConflictableTransactionResult<OrderFile, MarketError> {
                if files.get(&key)?.is_some() {
                    return Err(MarketError::Conflict(format!(
                        "version {} of {} already exists",
                        file.version, file.file_name
                    ))
                    .into());
                }

                let mut row = file.clone();
                let current = match latest.get(name_key)? {
                    Some(bytes) => Some(decode_u64(&bytes)?),
                    None => None,
                };

                // a slower upload of an older reservation never takes over
                row.is_latest = current.is_none_or(|v| v < row.version);

                if row.is_latest {
                    if let Some(previous) = current {
                        let previous_key = row_key(&row.order_id, &row.file_name, previous);
                        if let Some(bytes) = files.get(&previous_key)? {
                            let mut old: OrderFile = decode(&bytes)?;
                            old.is_latest = false;
                            files.insert(previous_key, encode(&old)?)?;
                        }
                    }
                    latest.insert(name_key, row.version.to_be_bytes().to_vec())?;
                }

                files.insert(key.clone(), encode(&row)?)?;
                Ok(row)
            },
        )?)
    }
}

fn sort_newest_first(files: &mut [OrderFile]) {
    files.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.version.cmp(&a.version))
    });
}

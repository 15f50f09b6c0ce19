//! File-backed embedding store.
//!
//! One directory per employee under the store root:
//!
//! ```text
//! <root>/<employee_id>/record.json          employee metadata
//! <root>/<employee_id>/embedding_0001.json  unit-normalized vector
//! <root>/<employee_id>/source_0001.jpg      copy of the image it came from
//! ```
//!
//! Enrollment is written into a `.staging-<uuid>` directory and renamed into
//! place only once `min_faces` embeddings are on disk. Employee deletion
//! renames the directory to `.trash-<uuid>` before removing it. Leftover
//! staging/trash directories are swept when the store is opened.
//!
//! All mutations serialize on one writer lock. Readers get an `Arc<Gallery>`
//! snapshot that mutations replace wholesale after the files are written.

use crate::detector::{DetectorError, FaceDetector};
use crate::types::{Embedding, Gallery, GalleryEntry};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use thiserror::Error;
use uuid::Uuid;

/// Minimum number of valid faces required to create an employee.
pub const DEFAULT_MIN_FACES: usize = 3;

const SCHEMA_VERSION: u32 = 1;
const RECORD_FILE: &str = "record.json";
const EMBEDDING_PREFIX: &str = "embedding_";
const SOURCE_PREFIX: &str = "source_";
const STAGING_PREFIX: &str = ".staging-";
const TRASH_PREFIX: &str = ".trash-";
const MAX_EMPLOYEE_ID_LEN: usize = 128;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("employee already enrolled: {0}")]
    Duplicate(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("only {found} valid faces found (minimum {required} required)")]
    InsufficientFaces { found: usize, required: usize },
    #[error("I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed record {}: {source}", .path.display())]
    Serialization {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn schema_version() -> u32 {
    SCHEMA_VERSION
}

/// Persisted per-employee metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmployeeRecord {
    #[serde(default = "schema_version")]
    pub schema_version: u32,
    pub employee_id: String,
    pub name: String,
    pub enrollment_timestamp: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    pub embedding_count: usize,
    /// Original image identifiers, in the same order as `embedding_indices`.
    #[serde(default)]
    pub source_image_refs: Vec<String>,
    #[serde(default)]
    pub embedding_indices: Vec<u32>,
    /// Highest index ever assigned. New embeddings continue after it, so an
    /// index is never handed out twice even after deletions.
    #[serde(default)]
    pub last_index: u32,
}

/// Per-embedding file contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EmbeddingFile {
    #[serde(default = "schema_version")]
    schema_version: u32,
    employee_id: String,
    index: u32,
    vector: Vec<f32>,
    #[serde(default)]
    model_version: Option<String>,
    #[serde(default)]
    source_image: Option<String>,
    created_at: DateTime<Utc>,
}

/// Metadata view of one stored embedding. Never carries the vector.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmbeddingInfo {
    pub index: u32,
    pub dimension: usize,
    pub source_image: Option<String>,
    pub model_version: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A face accepted for storage.
struct ValidFace {
    source: PathBuf,
    embedding: Embedding,
}

pub struct EmbeddingStore {
    root: PathBuf,
    write_lock: Mutex<()>,
    gallery: RwLock<Arc<Gallery>>,
}

impl EmbeddingStore {
    /// Open (creating if needed) the store rooted at `root` and load every
    /// embedding into the initial snapshot.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(io_err(&root))?;

        let store = Self {
            root,
            write_lock: Mutex::new(()),
            gallery: RwLock::new(Arc::new(Gallery::default())),
        };
        store.sweep_scratch_dirs();
        let gallery = store.load_gallery()?;
        tracing::info!(
            root = %store.root.display(),
            employees = gallery.employee_count(),
            embeddings = gallery.len(),
            "embedding store opened"
        );
        *store.gallery.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(gallery);
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Current read snapshot for matching.
    pub fn snapshot(&self) -> Arc<Gallery> {
        self.gallery
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Register a new employee from a batch of images.
    ///
    /// Images that cannot be read, or that contain zero or several faces,
    /// are skipped with a warning. Fails with `InsufficientFaces` when fewer
    /// than `min_faces` usable faces remain; nothing is left on disk then.
    pub fn enroll(
        &self,
        detector: &mut dyn FaceDetector,
        employee_id: &str,
        name: &str,
        images: &[PathBuf],
        min_faces: usize,
    ) -> Result<EmployeeRecord, StoreError> {
        validate_employee_id(employee_id)?;
        validate_name(name)?;
        if images.is_empty() {
            return Err(StoreError::Validation("no images supplied".into()));
        }
        if min_faces == 0 {
            return Err(StoreError::Validation("min_faces must be at least 1".into()));
        }

        let _guard = self.lock_writer();
        let dir = self.employee_dir(employee_id);
        if dir.exists() {
            return Err(StoreError::Duplicate(employee_id.to_string()));
        }

        let faces = self.extract_faces(detector, images, self.snapshot().dimension())?;
        if faces.len() < min_faces {
            tracing::warn!(
                employee_id,
                found = faces.len(),
                required = min_faces,
                "enrollment rejected: not enough valid faces"
            );
            return Err(StoreError::InsufficientFaces {
                found: faces.len(),
                required: min_faces,
            });
        }

        let staging = self.root.join(format!("{STAGING_PREFIX}{}", Uuid::new_v4()));
        let staged = fs::create_dir(&staging)
            .map_err(io_err(&staging))
            .and_then(|_| self.write_enrollment(&staging, employee_id, name, &faces))
            .and_then(|record| {
                fs::rename(&staging, &dir).map_err(io_err(&dir))?;
                Ok(record)
            });

        let record = match staged {
            Ok(record) => record,
            Err(e) => {
                if let Err(cleanup) = fs::remove_dir_all(&staging) {
                    if cleanup.kind() != std::io::ErrorKind::NotFound {
                        tracing::warn!(path = %staging.display(), error = %cleanup, "failed to remove staging directory");
                    }
                }
                return Err(e);
            }
        };

        self.publish(|entries| {
            entries.extend(record.embedding_indices.iter().zip(&faces).map(|(&index, face)| {
                GalleryEntry {
                    employee_id: employee_id.to_string(),
                    index,
                    embedding: face.embedding.clone(),
                }
            }));
        });

        tracing::info!(
            employee_id,
            embeddings = record.embedding_count,
            submitted = images.len(),
            "employee enrolled"
        );
        Ok(record)
    }

    /// Append embeddings from new images to an existing employee.
    ///
    /// No minimum applies; an update where every image is rejected still
    /// refreshes the name.
    pub fn update(
        &self,
        detector: &mut dyn FaceDetector,
        employee_id: &str,
        name: &str,
        images: &[PathBuf],
    ) -> Result<EmployeeRecord, StoreError> {
        validate_employee_id(employee_id)?;
        validate_name(name)?;
        if images.is_empty() {
            return Err(StoreError::Validation("no images supplied".into()));
        }

        let _guard = self.lock_writer();
        let dir = self.employee_dir(employee_id);
        let mut record = self
            .read_record(employee_id)?
            .ok_or_else(|| StoreError::NotFound(employee_id.to_string()))?;

        let faces = self.extract_faces(detector, images, self.snapshot().dimension())?;
        if faces.is_empty() {
            tracing::warn!(employee_id, "update produced no valid faces");
        }

        let mut written: Vec<PathBuf> = Vec::new();
        let mut new_indices = Vec::with_capacity(faces.len());
        let result = (|| {
            for face in &faces {
                let index = record.last_index + 1;
                written.extend(write_embedding(&dir, employee_id, index, face)?);
                record.last_index = index;
                record.embedding_indices.push(index);
                record
                    .source_image_refs
                    .push(face.source.to_string_lossy().into_owned());
                new_indices.push(index);
            }
            record.name = name.to_string();
            record.updated_at = Some(Utc::now());
            record.embedding_count = count_embedding_files(&dir)?;
            write_json_atomic(&dir.join(RECORD_FILE), &record)
        })();

        if let Err(e) = result {
            for path in &written {
                let _ = fs::remove_file(path);
            }
            return Err(e);
        }

        self.publish(|entries| {
            entries.extend(new_indices.iter().zip(&faces).map(|(&index, face)| GalleryEntry {
                employee_id: employee_id.to_string(),
                index,
                embedding: face.embedding.clone(),
            }));
        });

        tracing::info!(
            employee_id,
            added = new_indices.len(),
            embeddings = record.embedding_count,
            "employee updated"
        );
        Ok(record)
    }

    /// Remove an employee and all of their embeddings. Returns `false` when
    /// the employee does not exist.
    pub fn delete_employee(&self, employee_id: &str) -> Result<bool, StoreError> {
        validate_employee_id(employee_id)?;

        let _guard = self.lock_writer();
        let dir = self.employee_dir(employee_id);
        if !dir.is_dir() {
            return Ok(false);
        }

        let trash = self.root.join(format!("{TRASH_PREFIX}{}", Uuid::new_v4()));
        fs::rename(&dir, &trash).map_err(io_err(&dir))?;
        self.publish(|entries| entries.retain(|e| e.employee_id != employee_id));

        if let Err(e) = fs::remove_dir_all(&trash) {
            tracing::warn!(path = %trash.display(), error = %e, "failed to purge deleted employee; will retry on next open");
        }
        tracing::info!(employee_id, "employee deleted");
        Ok(true)
    }

    /// Remove one embedding (and its paired source image). Returns `false`
    /// when neither file exists.
    pub fn delete_embedding(&self, employee_id: &str, index: u32) -> Result<bool, StoreError> {
        validate_employee_id(employee_id)?;

        let _guard = self.lock_writer();
        let Some(mut record) = self.read_record(employee_id)? else {
            return Ok(false);
        };
        let removed = self.remove_embedding_locked(&mut record, index)?;
        if removed {
            tracing::info!(
                employee_id,
                index,
                remaining = record.embedding_count,
                "embedding deleted"
            );
        }
        Ok(removed)
    }

    /// Keep only the `keep` newest embeddings of an employee, removing the
    /// oldest ones. Returns how many were removed.
    pub fn prune_embeddings(&self, employee_id: &str, keep: usize) -> Result<usize, StoreError> {
        validate_employee_id(employee_id)?;

        let _guard = self.lock_writer();
        let mut record = self
            .read_record(employee_id)?
            .ok_or_else(|| StoreError::NotFound(employee_id.to_string()))?;

        let mut indices: Vec<u32> = list_embedding_files(&self.employee_dir(employee_id))?
            .into_iter()
            .map(|(index, _)| index)
            .collect();
        if indices.len() <= keep {
            return Ok(0);
        }
        indices.sort_unstable();
        let excess = indices.len() - keep;

        let mut removed = 0;
        for index in indices.into_iter().take(excess) {
            if self.remove_embedding_locked(&mut record, index)? {
                removed += 1;
            }
        }
        tracing::info!(employee_id, removed, kept = keep, "pruned old embeddings");
        Ok(removed)
    }

    pub fn get_employee(&self, employee_id: &str) -> Result<Option<EmployeeRecord>, StoreError> {
        validate_employee_id(employee_id)?;
        self.read_record(employee_id)
    }

    /// Ids of every enrolled employee, sorted.
    pub fn employee_ids(&self) -> Result<Vec<String>, StoreError> {
        Ok(self
            .list_employees()?
            .into_iter()
            .map(|r| r.employee_id)
            .collect())
    }

    /// All employees, sorted by id. Unreadable records are logged and skipped.
    pub fn list_employees(&self) -> Result<Vec<EmployeeRecord>, StoreError> {
        let mut records = Vec::new();
        for id in self.employee_dir_names()? {
            match self.read_record(&id) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => tracing::warn!(employee_id = %id, error = %e, "skipping unreadable employee record"),
            }
        }
        records.sort_by(|a, b| a.employee_id.cmp(&b.employee_id));
        Ok(records)
    }

    /// Embedding metadata for one employee, ordered by index.
    pub fn list_embeddings(&self, employee_id: &str) -> Result<Vec<EmbeddingInfo>, StoreError> {
        validate_employee_id(employee_id)?;
        let dir = self.employee_dir(employee_id);
        if !dir.join(RECORD_FILE).is_file() {
            return Err(StoreError::NotFound(employee_id.to_string()));
        }

        let mut infos = Vec::new();
        for (_, path) in list_embedding_files(&dir)? {
            let file: EmbeddingFile = read_json(&path)?;
            infos.push(EmbeddingInfo {
                index: file.index,
                dimension: file.vector.len(),
                source_image: file.source_image,
                model_version: file.model_version,
                created_at: file.created_at,
            });
        }
        infos.sort_by_key(|i| i.index);
        Ok(infos)
    }

    fn lock_writer(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn employee_dir(&self, employee_id: &str) -> PathBuf {
        self.root.join(employee_id)
    }

    /// Replace the snapshot with an edited copy of the current entries.
    fn publish(&self, edit: impl FnOnce(&mut Vec<GalleryEntry>)) {
        let mut slot = self.gallery.write().unwrap_or_else(PoisonError::into_inner);
        let mut entries = slot.entries().to_vec();
        edit(&mut entries);
        *slot = Arc::new(Gallery::new(entries));
    }

    /// Run the detector over every image and keep the usable faces.
    ///
    /// A per-image inference failure skips that image; an unavailable
    /// detector aborts the whole batch.
    fn extract_faces(
        &self,
        detector: &mut dyn FaceDetector,
        images: &[PathBuf],
        mut dimension: Option<usize>,
    ) -> Result<Vec<ValidFace>, StoreError> {
        let mut faces = Vec::new();
        for path in images {
            let gray = match image::open(path) {
                Ok(img) => img.to_luma8(),
                Err(e) => {
                    tracing::warn!(image = %path.display(), error = %e, "skipping unreadable image");
                    continue;
                }
            };
            let (width, height) = gray.dimensions();

            let detected = match detector.detect(gray.as_raw(), width, height) {
                Ok(d) => d,
                Err(e @ DetectorError::Unavailable(_)) => return Err(e.into()),
                Err(e) => {
                    tracing::warn!(image = %path.display(), error = %e, "face detection failed; skipping image");
                    continue;
                }
            };
            if detected.len() != 1 {
                tracing::warn!(
                    image = %path.display(),
                    faces = detected.len(),
                    "expected exactly one face; skipping image"
                );
                continue;
            }

            let Some(embedding) = detected[0].embedding.normalized() else {
                tracing::warn!(image = %path.display(), "invalid embedding; skipping image");
                continue;
            };
            if let Some(expected) = dimension {
                if embedding.dimension() != expected {
                    tracing::warn!(
                        image = %path.display(),
                        expected,
                        actual = embedding.dimension(),
                        "embedding dimension mismatch; skipping image"
                    );
                    continue;
                }
            }
            dimension = Some(embedding.dimension());
            tracing::debug!(image = %path.display(), confidence = detected[0].bbox.confidence, "accepted face");
            faces.push(ValidFace {
                source: path.clone(),
                embedding,
            });
        }
        Ok(faces)
    }

    fn write_enrollment(
        &self,
        dir: &Path,
        employee_id: &str,
        name: &str,
        faces: &[ValidFace],
    ) -> Result<EmployeeRecord, StoreError> {
        let mut indices = Vec::with_capacity(faces.len());
        for (i, face) in faces.iter().enumerate() {
            let index = i as u32 + 1;
            write_embedding(dir, employee_id, index, face)?;
            indices.push(index);
        }

        let record = EmployeeRecord {
            schema_version: SCHEMA_VERSION,
            employee_id: employee_id.to_string(),
            name: name.to_string(),
            enrollment_timestamp: Utc::now(),
            updated_at: None,
            embedding_count: faces.len(),
            source_image_refs: faces
                .iter()
                .map(|f| f.source.to_string_lossy().into_owned())
                .collect(),
            last_index: indices.last().copied().unwrap_or(0),
            embedding_indices: indices,
        };
        write_json_atomic(&dir.join(RECORD_FILE), &record)?;
        Ok(record)
    }

    /// Caller must hold the writer lock.
    fn remove_embedding_locked(
        &self,
        record: &mut EmployeeRecord,
        index: u32,
    ) -> Result<bool, StoreError> {
        let dir = self.employee_dir(&record.employee_id);
        let mut removed = remove_if_exists(&embedding_path(&dir, index))?;
        if let Some(source) = find_source_file(&dir, index)? {
            removed |= remove_if_exists(&source)?;
        }
        if !removed {
            return Ok(false);
        }

        if let Some(pos) = record.embedding_indices.iter().position(|&i| i == index) {
            record.embedding_indices.remove(pos);
            if pos < record.source_image_refs.len() {
                record.source_image_refs.remove(pos);
            }
        }
        record.embedding_count = count_embedding_files(&dir)?;
        record.updated_at = Some(Utc::now());
        write_json_atomic(&dir.join(RECORD_FILE), record)?;

        let employee_id = record.employee_id.clone();
        self.publish(|entries| {
            entries.retain(|e| !(e.employee_id == employee_id && e.index == index))
        });
        Ok(true)
    }

    fn read_record(&self, employee_id: &str) -> Result<Option<EmployeeRecord>, StoreError> {
        let path = self.employee_dir(employee_id).join(RECORD_FILE);
        if !path.is_file() {
            return Ok(None);
        }
        read_json(&path).map(Some)
    }

    /// Names of live employee directories (scratch directories excluded).
    fn employee_dir_names(&self) -> Result<Vec<String>, StoreError> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root).map_err(io_err(&self.root))? {
            let entry = entry.map_err(io_err(&self.root))?;
            if !entry.path().is_dir() {
                continue;
            }
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            names.push(name);
        }
        names.sort();
        Ok(names)
    }

    /// Remove staging/trash directories left behind by a crash.
    fn sweep_scratch_dirs(&self) {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(STAGING_PREFIX) || name.starts_with(TRASH_PREFIX) {
                match fs::remove_dir_all(entry.path()) {
                    Ok(()) => tracing::info!(dir = %name, "removed leftover scratch directory"),
                    Err(e) => tracing::warn!(dir = %name, error = %e, "failed to remove scratch directory"),
                }
            }
        }
    }

    /// Load every embedding from disk, repairing stale `embedding_count`s.
    fn load_gallery(&self) -> Result<Gallery, StoreError> {
        let mut entries = Vec::new();
        for id in self.employee_dir_names()? {
            let mut record = match self.read_record(&id) {
                Ok(Some(r)) => r,
                Ok(None) => {
                    tracing::warn!(employee_id = %id, "directory without record; ignoring");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(employee_id = %id, error = %e, "unreadable record; ignoring employee");
                    continue;
                }
            };

            let dir = self.employee_dir(&id);
            let files = list_embedding_files(&dir)?;
            for (index, path) in &files {
                let file: EmbeddingFile = match read_json(path) {
                    Ok(f) => f,
                    Err(e) => {
                        tracing::warn!(error = %e, "skipping unreadable embedding");
                        continue;
                    }
                };
                let embedding = Embedding {
                    values: file.vector,
                    model_version: file.model_version,
                };
                match embedding.normalized() {
                    Some(embedding) => entries.push(GalleryEntry {
                        employee_id: id.clone(),
                        index: *index,
                        embedding,
                    }),
                    None => tracing::warn!(employee_id = %id, index, "skipping degenerate embedding"),
                }
            }

            if record.embedding_count != files.len() {
                tracing::warn!(
                    employee_id = %id,
                    recorded = record.embedding_count,
                    actual = files.len(),
                    "repairing embedding count"
                );
                record.embedding_count = files.len();
                write_json_atomic(&dir.join(RECORD_FILE), &record)?;
            }
        }
        Ok(Gallery::new(entries))
    }
}

fn validate_employee_id(employee_id: &str) -> Result<(), StoreError> {
    if employee_id.trim().is_empty() {
        return Err(StoreError::Validation("employee_id must not be empty".into()));
    }
    if employee_id.len() > MAX_EMPLOYEE_ID_LEN
        || employee_id.starts_with('.')
        || !employee_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(StoreError::Validation(format!(
            "employee_id {employee_id:?} must be 1-{MAX_EMPLOYEE_ID_LEN} characters of [A-Za-z0-9._-] and not start with '.'"
        )));
    }
    Ok(())
}

fn validate_name(name: &str) -> Result<(), StoreError> {
    if name.trim().is_empty() {
        return Err(StoreError::Validation("name must not be empty".into()));
    }
    Ok(())
}

fn embedding_path(dir: &Path, index: u32) -> PathBuf {
    dir.join(format!("{EMBEDDING_PREFIX}{index:04}.json"))
}

/// Write the embedding file and the paired source image copy.
/// Returns the paths written.
fn write_embedding(
    dir: &Path,
    employee_id: &str,
    index: u32,
    face: &ValidFace,
) -> Result<Vec<PathBuf>, StoreError> {
    let ext = face
        .source
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("img");
    let source_copy = dir.join(format!("{SOURCE_PREFIX}{index:04}.{ext}"));
    fs::copy(&face.source, &source_copy).map_err(io_err(&source_copy))?;

    let file = EmbeddingFile {
        schema_version: SCHEMA_VERSION,
        employee_id: employee_id.to_string(),
        index,
        vector: face.embedding.values.clone(),
        model_version: face.embedding.model_version.clone(),
        source_image: Some(face.source.to_string_lossy().into_owned()),
        created_at: Utc::now(),
    };
    let path = embedding_path(dir, index);
    if let Err(e) = write_json_atomic(&path, &file) {
        let _ = fs::remove_file(&source_copy);
        return Err(e);
    }
    Ok(vec![path, source_copy])
}

/// `(index, path)` of every embedding file in `dir`.
fn list_embedding_files(dir: &Path) -> Result<Vec<(u32, PathBuf)>, StoreError> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_err(dir))? {
        let entry = entry.map_err(io_err(dir))?;
        let name = entry.file_name();
        let Some(index) = name
            .to_str()
            .and_then(|n| n.strip_prefix(EMBEDDING_PREFIX))
            .and_then(|n| n.strip_suffix(".json"))
            .and_then(|n| n.parse::<u32>().ok())
        else {
            continue;
        };
        files.push((index, entry.path()));
    }
    files.sort_by_key(|(index, _)| *index);
    Ok(files)
}

fn count_embedding_files(dir: &Path) -> Result<usize, StoreError> {
    list_embedding_files(dir).map(|f| f.len())
}

fn find_source_file(dir: &Path, index: u32) -> Result<Option<PathBuf>, StoreError> {
    let stem = format!("{SOURCE_PREFIX}{index:04}");
    for entry in fs::read_dir(dir).map_err(io_err(dir))? {
        let entry = entry.map_err(io_err(dir))?;
        let path = entry.path();
        if path.file_stem().and_then(|s| s.to_str()) == Some(stem.as_str()) {
            return Ok(Some(path));
        }
    }
    Ok(None)
}

fn remove_if_exists(path: &Path) -> Result<bool, StoreError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(io_err(path)(e)),
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, StoreError> {
    let bytes = fs::read(path).map_err(io_err(path))?;
    serde_json::from_slice(&bytes).map_err(|source| StoreError::Serialization {
        path: path.to_path_buf(),
        source,
    })
}

/// Write via a temp file + rename so readers never see a torn file.
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Serialization {
        path: path.to_path_buf(),
        source,
    })?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes).map_err(io_err(&tmp))?;
    fs::rename(&tmp, path).map_err(io_err(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::{DetectedFace, DetectorError};
    use crate::types::BoundingBox;
    use image::{GrayImage, Luma};
    use tempfile::TempDir;

    /// Pixel value of the top-left corner decides what the fake detector sees:
    /// 0 = no face, 255 = two faces, anything else = one face whose embedding
    /// is derived from the value.
    struct FakeDetector {
        calls: usize,
    }

    impl FakeDetector {
        fn new() -> Self {
            Self { calls: 0 }
        }
    }

    fn face(values: Vec<f32>) -> DetectedFace {
        DetectedFace {
            bbox: BoundingBox {
                x: 0.0,
                y: 0.0,
                width: 4.0,
                height: 4.0,
                confidence: 0.9,
                landmarks: None,
            },
            embedding: Embedding::new(values),
        }
    }

    impl FaceDetector for FakeDetector {
        fn detect(
            &mut self,
            pixels: &[u8],
            _width: u32,
            _height: u32,
        ) -> Result<Vec<DetectedFace>, DetectorError> {
            self.calls += 1;
            match pixels.first().copied().unwrap_or(0) {
                0 => Ok(vec![]),
                255 => Ok(vec![face(vec![1.0, 0.0, 0.0]), face(vec![0.0, 1.0, 0.0])]),
                v => Ok(vec![face(vec![1.0, v as f32 / 10.0, 0.5])]),
            }
        }
    }

    struct Fixture {
        _tmp: TempDir,
        images: PathBuf,
        store: EmbeddingStore,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let images = tmp.path().join("images");
        fs::create_dir(&images).unwrap();
        let store = EmbeddingStore::open(tmp.path().join("store")).unwrap();
        Fixture {
            _tmp: tmp,
            images,
            store,
        }
    }

    impl Fixture {
        fn image(&self, name: &str, value: u8) -> PathBuf {
            let path = self.images.join(format!("{name}.png"));
            GrayImage::from_pixel(8, 8, Luma([value])).save(&path).unwrap();
            path
        }

        fn single_faces(&self, prefix: &str, values: &[u8]) -> Vec<PathBuf> {
            values
                .iter()
                .enumerate()
                .map(|(i, v)| self.image(&format!("{prefix}{i}"), *v))
                .collect()
        }

        fn enroll_default(&self, id: &str) -> EmployeeRecord {
            let images = self.single_faces(id, &[10, 20, 30]);
            self.store
                .enroll(&mut FakeDetector::new(), id, "Test Person", &images, DEFAULT_MIN_FACES)
                .unwrap()
        }
    }

    #[test]
    fn test_enroll_three_faces() {
        let fx = fixture();
        let record = fx.enroll_default("emp-001");

        assert_eq!(record.embedding_count, 3);
        assert_eq!(record.embedding_indices, vec![1, 2, 3]);
        assert_eq!(record.source_image_refs.len(), 3);
        assert_eq!(record.last_index, 3);

        let dir = fx.store.root().join("emp-001");
        assert!(dir.join("record.json").is_file());
        assert!(dir.join("embedding_0001.json").is_file());
        assert!(dir.join("source_0003.png").is_file());

        let gallery = fx.store.snapshot();
        assert_eq!(gallery.len(), 3);
        assert_eq!(gallery.employee_count(), 1);
        for entry in gallery.entries() {
            assert!((entry.embedding.norm() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_enroll_insufficient_faces_rolls_back() {
        let fx = fixture();
        let images = vec![fx.image("a", 10), fx.image("b", 20), fx.image("empty", 0)];

        let err = fx
            .store
            .enroll(&mut FakeDetector::new(), "emp-002", "Jane", &images, 3)
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::InsufficientFaces {
                found: 2,
                required: 3
            }
        ));

        assert!(!fx.store.root().join("emp-002").exists());
        let leftovers: Vec<_> = fs::read_dir(fx.store.root()).unwrap().collect();
        assert!(leftovers.is_empty(), "no staging directories may remain");
        assert!(fx.store.snapshot().is_empty());
    }

    #[test]
    fn test_enroll_skips_multi_face_and_unreadable_images() {
        let fx = fixture();
        let mut images = fx.single_faces("ok", &[10, 20]);
        images.push(fx.image("crowd", 255));
        images.push(fx.images.join("missing.png"));
        let garbage = fx.images.join("garbage.png");
        fs::write(&garbage, b"not an image").unwrap();
        images.push(garbage);

        let record = fx
            .store
            .enroll(&mut FakeDetector::new(), "emp-003", "Sam", &images, 2)
            .unwrap();
        assert_eq!(record.embedding_count, 2);
    }

    #[test]
    fn test_enroll_duplicate_leaves_original() {
        let fx = fixture();
        let original = fx.enroll_default("emp-004");

        let images = fx.single_faces("again", &[40, 50, 60]);
        let err = fx
            .store
            .enroll(&mut FakeDetector::new(), "emp-004", "Other", &images, 3)
            .unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(_)));

        let stored = fx.store.get_employee("emp-004").unwrap().unwrap();
        assert_eq!(stored, original);
        assert_eq!(fx.store.snapshot().len(), 3);
    }

    #[test]
    fn test_enroll_validation_has_no_side_effects() {
        let fx = fixture();
        let images = fx.single_faces("v", &[10, 20, 30]);
        let mut detector = FakeDetector::new();

        for (id, name, imgs) in [
            ("", "Name", images.as_slice()),
            ("emp-5", "", images.as_slice()),
            ("emp-5", "Name", &[][..]),
            ("../escape", "Name", images.as_slice()),
        ] {
            let err = fx.store.enroll(&mut detector, id, name, imgs, 3).unwrap_err();
            assert!(matches!(err, StoreError::Validation(_)), "{id:?}/{name:?}");
        }
        assert_eq!(detector.calls, 0);
        assert!(fx.store.list_employees().unwrap().is_empty());
    }

    #[test]
    fn test_update_appends_after_high_water_mark() {
        let fx = fixture();
        fx.enroll_default("emp-006");

        assert!(fx.store.delete_embedding("emp-006", 3).unwrap());

        let images = fx.single_faces("upd", &[70, 80]);
        let record = fx
            .store
            .update(&mut FakeDetector::new(), "emp-006", "Renamed", &images)
            .unwrap();

        assert_eq!(record.name, "Renamed");
        assert_eq!(record.embedding_indices, vec![1, 2, 4, 5]);
        assert_eq!(record.embedding_count, 4);
        assert_eq!(record.source_image_refs.len(), 4);
        assert_eq!(record.last_index, 5);
        assert_eq!(fx.store.snapshot().len(), 4);
    }

    #[test]
    fn test_update_unknown_employee() {
        let fx = fixture();
        let images = fx.single_faces("x", &[10]);
        let err = fx
            .store
            .update(&mut FakeDetector::new(), "ghost", "Ghost", &images)
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn test_delete_last_embedding_keeps_record() {
        let fx = fixture();
        fx.enroll_default("emp-007");

        for index in 1..=3 {
            assert!(fx.store.delete_embedding("emp-007", index).unwrap());
        }
        assert!(!fx.store.delete_embedding("emp-007", 3).unwrap());

        let record = fx.store.get_employee("emp-007").unwrap().unwrap();
        assert_eq!(record.embedding_count, 0);
        assert!(record.source_image_refs.is_empty());
        assert!(fx.store.list_embeddings("emp-007").unwrap().is_empty());
        assert!(fx.store.snapshot().is_empty());
    }

    #[test]
    fn test_delete_embedding_missing_employee() {
        let fx = fixture();
        assert!(!fx.store.delete_embedding("nobody", 1).unwrap());
    }

    #[test]
    fn test_delete_employee() {
        let fx = fixture();
        fx.enroll_default("emp-008");
        fx.enroll_default("emp-009");

        assert!(fx.store.delete_employee("emp-008").unwrap());
        assert!(!fx.store.delete_employee("emp-008").unwrap());
        assert!(!fx.store.root().join("emp-008").exists());

        let ids: Vec<_> = fx
            .store
            .list_employees()
            .unwrap()
            .into_iter()
            .map(|r| r.employee_id)
            .collect();
        assert_eq!(ids, vec!["emp-009"]);
        assert!(fx
            .store
            .snapshot()
            .entries()
            .iter()
            .all(|e| e.employee_id == "emp-009"));
    }

    #[test]
    fn test_list_embeddings_hides_vectors() {
        let fx = fixture();
        fx.enroll_default("emp-010");

        let infos = fx.store.list_embeddings("emp-010").unwrap();
        assert_eq!(infos.iter().map(|i| i.index).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert!(infos.iter().all(|i| i.dimension == 3));
        assert!(infos[0].source_image.as_deref().unwrap().ends_with("emp-0100.png"));

        assert!(matches!(
            fx.store.list_embeddings("missing"),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_prune_keeps_newest() {
        let fx = fixture();
        fx.enroll_default("emp-011");
        let images = fx.single_faces("more", &[40, 50]);
        fx.store
            .update(&mut FakeDetector::new(), "emp-011", "Test Person", &images)
            .unwrap();

        assert_eq!(fx.store.prune_embeddings("emp-011", 2).unwrap(), 3);
        assert_eq!(fx.store.prune_embeddings("emp-011", 2).unwrap(), 0);

        let record = fx.store.get_employee("emp-011").unwrap().unwrap();
        assert_eq!(record.embedding_indices, vec![4, 5]);
        assert_eq!(record.embedding_count, 2);
    }

    #[test]
    fn test_reopen_restores_snapshot_and_sweeps_scratch() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("store");
        let img = tmp.path().join("face.png");
        GrayImage::from_pixel(8, 8, Luma([42u8])).save(&img).unwrap();

        {
            let store = EmbeddingStore::open(&root).unwrap();
            let images = vec![img.clone(), img.clone(), img.clone()];
            store
                .enroll(&mut FakeDetector::new(), "emp-012", "Kim", &images, 3)
                .unwrap();
        }
        fs::create_dir(root.join(".staging-crashed")).unwrap();

        let store = EmbeddingStore::open(&root).unwrap();
        assert_eq!(store.snapshot().len(), 3);
        assert!(!root.join(".staging-crashed").exists());
    }

    #[test]
    fn test_reopen_repairs_embedding_count() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("store");
        let img = tmp.path().join("face.png");
        GrayImage::from_pixel(8, 8, Luma([42u8])).save(&img).unwrap();
        {
            let store = EmbeddingStore::open(&root).unwrap();
            let images = vec![img.clone(), img.clone(), img.clone()];
            store
                .enroll(&mut FakeDetector::new(), "emp-013", "Lee", &images, 3)
                .unwrap();
        }
        fs::remove_file(root.join("emp-013").join("embedding_0002.json")).unwrap();

        let store = EmbeddingStore::open(&root).unwrap();
        let record = store.get_employee("emp-013").unwrap().unwrap();
        assert_eq!(record.embedding_count, 2);
        assert_eq!(store.snapshot().len(), 2);
    }

    struct OfflineDetector;

    impl FaceDetector for OfflineDetector {
        fn detect(
            &mut self,
            _pixels: &[u8],
            _width: u32,
            _height: u32,
        ) -> Result<Vec<DetectedFace>, DetectorError> {
            Err(DetectorError::Unavailable("helper exited".into()))
        }
    }

    #[test]
    fn test_enroll_aborts_when_detector_unavailable() {
        let fx = fixture();
        let images = fx.single_faces("off", &[10, 20, 30]);
        let err = fx
            .store
            .enroll(&mut OfflineDetector, "emp-014", "Off", &images, 3)
            .unwrap_err();
        assert!(matches!(err, StoreError::Detector(DetectorError::Unavailable(_))));
        assert!(fx.store.employee_ids().unwrap().is_empty());
    }

    #[test]
    fn test_employee_ids_sorted() {
        let fx = fixture();
        fx.enroll_default("emp-b");
        fx.enroll_default("emp-a");
        assert_eq!(fx.store.employee_ids().unwrap(), vec!["emp-a", "emp-b"]);
    }

    #[test]
    fn test_record_tolerates_unknown_and_missing_fields() {
        let json = r#"{
            "employee_id": "emp-1",
            "name": "A",
            "enrollment_timestamp": "2024-01-01T00:00:00Z",
            "embedding_count": 0,
            "future_field": true
        }"#;
        let record: EmployeeRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.schema_version, SCHEMA_VERSION);
        assert!(record.source_image_refs.is_empty());
        assert_eq!(record.last_index, 0);
    }
}

use common::{DbError, DbResult};
use serde::{de::DeserializeOwned, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionResult};
use sled::Transactional;
use tracing::debug;

/// Separator between the parts of a compound index key.
const KEY_SEPARATOR: u8 = 0;

/// Manages all direct interactions with the sled database.
///
/// Record trees hold bincode-encoded models keyed by id. Index trees map a
/// uniqueness key to a record id, and relation trees hold compound keys with
/// empty values (for example `pipeline_id \0 algorithm_id`).
pub struct StorageManager {
    db: sled::Db,

    pub(crate) pipelines: sled::Tree,
    pub(crate) pipeline_slugs: sled::Tree,
    pub(crate) pipeline_versions: sled::Tree,
    pub(crate) pipeline_algorithms: sled::Tree,

    pub(crate) algorithms: sled::Tree,
    pub(crate) algorithm_names: sled::Tree,

    pub(crate) taxa: sled::Tree,
    pub(crate) taxon_names: sled::Tree,
    pub(crate) taxa_lists: sled::Tree,
    pub(crate) taxa_list_names: sled::Tree,
    pub(crate) taxa_list_members: sled::Tree,

    pub(crate) source_images: sled::Tree,
    pub(crate) deployment_images: sled::Tree,
    pub(crate) collections: sled::Tree,

    pub(crate) detections: sled::Tree,
    pub(crate) detection_keys: sled::Tree,
    pub(crate) image_detections: sled::Tree,
    pub(crate) image_detection_counts: sled::Tree,

    pub(crate) classifications: sled::Tree,
    pub(crate) detection_classifications: sled::Tree,

    pub(crate) occurrences: sled::Tree,
}

impl StorageManager {
    /// Opens or creates a database at the specified path.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Sled` if the path is inaccessible or the database is
    /// corrupted.
    pub fn new(path: impl AsRef<std::path::Path>) -> DbResult<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// Opens or creates a database at the platform-specific default location.
    ///
    /// The parent directory is created if it doesn't exist.
    pub fn with_default_path(name: &str) -> DbResult<Self> {
        let db_path = common::platform::get_named_db_path(name);
        if let Some(parent) = db_path.parent() {
            common::platform::ensure_db_directory(parent)?;
        }
        Self::new(db_path)
    }

    /// Opens a throwaway in-memory database.
    pub fn temporary() -> DbResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> DbResult<Self> {
        Ok(Self {
            pipelines: db.open_tree("pipelines")?,
            pipeline_slugs: db.open_tree("pipeline_slugs")?,
            pipeline_versions: db.open_tree("pipeline_versions")?,
            pipeline_algorithms: db.open_tree("pipeline_algorithms")?,
            algorithms: db.open_tree("algorithms")?,
            algorithm_names: db.open_tree("algorithm_names")?,
            taxa: db.open_tree("taxa")?,
            taxon_names: db.open_tree("taxon_names")?,
            taxa_lists: db.open_tree("taxa_lists")?,
            taxa_list_names: db.open_tree("taxa_list_names")?,
            taxa_list_members: db.open_tree("taxa_list_members")?,
            source_images: db.open_tree("source_images")?,
            deployment_images: db.open_tree("deployment_images")?,
            collections: db.open_tree("collections")?,
            detections: db.open_tree("detections")?,
            detection_keys: db.open_tree("detection_keys")?,
            image_detections: db.open_tree("image_detections")?,
            image_detection_counts: db.open_tree("image_detection_counts")?,
            classifications: db.open_tree("classifications")?,
            detection_classifications: db.open_tree("detection_classifications")?,
            occurrences: db.open_tree("occurrences")?,
            db,
        })
    }

    /// Flushes dirty buffers to disk.
    pub fn flush(&self) -> DbResult<()> {
        self.db.flush()?;
        Ok(())
    }

    /// Provides direct access to the underlying sled database.
    #[inline]
    pub fn db(&self) -> &sled::Db {
        &self.db
    }

    // --- Internal helpers shared by the record modules ---

    /// Runs the get-or-insert of `record` under a unique `key` as one
    /// transaction over the record tree and its index.
    ///
    /// Returns the stored record and whether this call created it. The `make`
    /// closure may run more than once if the transaction is retried.
    pub(crate) fn find_or_create<T, F, I>(
        records: &sled::Tree,
        index: &sled::Tree,
        key: &[u8],
        make: F,
        id_of: I,
    ) -> DbResult<(T, bool)>
    where
        T: Serialize + DeserializeOwned,
        F: Fn() -> T,
        I: Fn(&T) -> Vec<u8>,
    {
        let outcome: TransactionResult<(T, bool), DbError> =
            (records, index).transaction(|(records, index)| {
                if let Some(existing_id) = index.get(key)? {
                    let bytes = records
                        .get(&existing_id)?
                        .ok_or_else(|| abort(dangling(&existing_id)))?;
                    let record: T = bincode::deserialize(&bytes).map_err(abort)?;
                    return Ok((record, false));
                }

                let record = make();
                let id = id_of(&record);
                let bytes = bincode::serialize(&record).map_err(abort)?;
                index.insert(key, id.as_slice())?;
                records.insert(id, bytes)?;
                Ok((record, true))
            });

        let (record, created) = outcome?;
        if created {
            debug!(
                tree = %String::from_utf8_lossy(&records.name()),
                id = %String::from_utf8_lossy(&id_of(&record)),
                "Created record"
            );
        }
        Ok((record, created))
    }

    pub(crate) fn get_record<T: DeserializeOwned>(
        tree: &sled::Tree,
        id: &[u8],
    ) -> DbResult<Option<T>> {
        match tree.get(id)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub(crate) fn put_record<T: Serialize>(tree: &sled::Tree, id: &[u8], record: &T) -> DbResult<()> {
        let bytes = bincode::serialize(record)?;
        tree.insert(id, bytes)?;
        Ok(())
    }

    /// Loads every record of a tree, in key order.
    pub(crate) fn all_records<T: DeserializeOwned>(tree: &sled::Tree) -> DbResult<Vec<T>> {
        tree.iter()
            .values()
            .map(|bytes| -> DbResult<T> { Ok(bincode::deserialize(&bytes?)?) })
            .collect()
    }

    /// Resolves the ids stored under `prefix` in a relation tree into records.
    pub(crate) fn related_records<T: DeserializeOwned>(
        relation: &sled::Tree,
        records: &sled::Tree,
        owner: &[u8],
    ) -> DbResult<Vec<T>> {
        let prefix = relation_prefix(owner);
        let mut out = Vec::new();
        for key in relation.scan_prefix(&prefix).keys() {
            let key = key?;
            let related_id = &key[prefix.len()..];
            let record = Self::get_record(records, related_id)?
                .ok_or_else(|| dangling(related_id))?;
            out.push(record);
        }
        Ok(out)
    }
}

/// Builds `a \0 b \0 ...` from the given parts.
pub(crate) fn compound_key(parts: &[&[u8]]) -> Vec<u8> {
    let mut key = Vec::with_capacity(parts.iter().map(|p| p.len() + 1).sum());
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            key.push(KEY_SEPARATOR);
        }
        key.extend_from_slice(part);
    }
    key
}

/// Prefix selecting every relation entry owned by `owner`.
pub(crate) fn relation_prefix(owner: &[u8]) -> Vec<u8> {
    let mut prefix = owner.to_vec();
    prefix.push(KEY_SEPARATOR);
    prefix
}

/// Reads a big-endian `u32` counter; a missing entry counts as zero.
pub(crate) fn decode_count(bytes: Option<&[u8]>) -> u32 {
    bytes
        .and_then(|b| <[u8; 4]>::try_from(b).ok())
        .map(u32::from_be_bytes)
        .unwrap_or(0)
}

pub(crate) fn abort<E: Into<DbError>>(err: E) -> ConflictableTransactionError<DbError> {
    ConflictableTransactionError::Abort(err.into())
}

/// An index entry pointing at a record that is not there.
pub(crate) fn dangling(id: &[u8]) -> DbError {
    DbError::NotFound(String::from_utf8_lossy(id).into_owned())
}

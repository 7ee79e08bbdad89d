//! Database schema versioning
//!
//! Stamps fresh databases with the current schema version and refuses
//! layouts this build cannot read: databases written by a newer version, and
//! non-empty databases that carry no version at all.

use rocksdb::{IteratorMode, DB};

use crate::error::{GraphError, Result};

/// Database version stored in metadata
pub const DB_VERSION_KEY: &[u8] = b"_db_version";
pub const CURRENT_VERSION: u32 = 1;

fn read_version(db: &DB) -> Result<Option<u32>> {
    match db.get(DB_VERSION_KEY)? {
        Some(bytes) => {
            let bytes_slice: &[u8] = bytes.as_ref();
            let version_bytes: [u8; 4] = bytes_slice
                .try_into()
                .map_err(|_| GraphError::migration("Invalid version format"))?;
            Ok(Some(u32::from_le_bytes(version_bytes)))
        }
        None => Ok(None),
    }
}

fn is_empty(db: &DB) -> bool {
    db.iterator(IteratorMode::Start).next().is_none()
}

/// Check the schema version of an open database, stamping it if fresh.
/// Returns the version the database is at.
pub fn ensure_schema(db: &DB) -> Result<u32> {
    let version = match read_version(db)? {
        Some(v) => v,
        None if is_empty(db) => {
            log::debug!("Fresh database, stamping schema v{}", CURRENT_VERSION);
            db.put(DB_VERSION_KEY, CURRENT_VERSION.to_le_bytes())?;
            return Ok(CURRENT_VERSION);
        }
        None => {
            return Err(GraphError::migration(
                "database has records but no schema version",
            ));
        }
    };

    log::info!(
        "Database version: {} (current: {})",
        version,
        CURRENT_VERSION
    );

    if version != CURRENT_VERSION {
        return Err(GraphError::migration(format!(
            "database schema v{} is not supported (current v{})",
            version, CURRENT_VERSION
        )));
    }

    Ok(CURRENT_VERSION)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rocksdb::Options;
    use tempfile::TempDir;

    fn open(path: &std::path::Path) -> DB {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        DB::open(&opts, path).unwrap()
    }

    #[test]
    fn test_fresh_database_is_stamped() {
        let temp_dir = TempDir::new().unwrap();
        let db = open(temp_dir.path());
        assert_eq!(ensure_schema(&db).unwrap(), CURRENT_VERSION);
        assert_eq!(read_version(&db).unwrap(), Some(CURRENT_VERSION));

        // A stamped database opens again without changes
        assert_eq!(ensure_schema(&db).unwrap(), CURRENT_VERSION);
    }

    #[test]
    fn test_unversioned_records_refused() {
        let temp_dir = TempDir::new().unwrap();
        let db = open(temp_dir.path());
        db.put(b"node:n_stray", b"not a node").unwrap();
        assert!(matches!(ensure_schema(&db), Err(GraphError::Migration(_))));
    }

    #[test]
    fn test_newer_schema_refused() {
        let temp_dir = TempDir::new().unwrap();
        let db = open(temp_dir.path());
        db.put(DB_VERSION_KEY, (CURRENT_VERSION + 1).to_le_bytes())
            .unwrap();
        assert!(matches!(ensure_schema(&db), Err(GraphError::Migration(_))));
    }

    #[test]
    fn test_malformed_version_refused() {
        let temp_dir = TempDir::new().unwrap();
        let db = open(temp_dir.path());
        db.put(DB_VERSION_KEY, b"v2").unwrap();
        assert!(matches!(ensure_schema(&db), Err(GraphError::Migration(_))));
    }
}

//! Persistent object store using redb.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};
use tracing::debug;

use super::{Store, StoredObject};
use crate::error::{HomeError, HomeResult};
use crate::types::ObjectHash;

// Table definitions
const OBJECTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("objects");

/// Object store backed by a redb database file
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<RwLock<Database>>,
}

impl RedbStore {
    /// Open or create a store at the given path.
    ///
    /// Parent directories are created as needed.
    pub fn new(path: impl AsRef<Path>) -> HomeResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(OBJECTS_TABLE)?;
        }
        write_txn.commit()?;

        debug!(path = %path.display(), "opened object store");
        Ok(Self {
            db: Arc::new(RwLock::new(db)),
        })
    }

    /// Every stored object, in hash order.
    pub fn list_objects(&self) -> HomeResult<Vec<StoredObject>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(OBJECTS_TABLE)?;

        let mut objects = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            let object: StoredObject = serde_json::from_slice(value.value())
                .map_err(|e| HomeError::Serialization(e.to_string()))?;
            objects.push(object);
        }
        Ok(objects)
    }

    fn load_sync(&self, hash: &ObjectHash) -> HomeResult<Option<StoredObject>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(OBJECTS_TABLE)?;

        match table.get(hash.as_str())? {
            Some(v) => {
                let object: StoredObject = serde_json::from_slice(v.value())
                    .map_err(|e| HomeError::Serialization(e.to_string()))?;
                Ok(Some(object))
            }
            None => Ok(None),
        }
    }

    fn save_sync(&self, object: &StoredObject) -> HomeResult<ObjectHash> {
        let hash = object.hash();
        let data =
            serde_json::to_vec(object).map_err(|e| HomeError::Serialization(e.to_string()))?;

        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(OBJECTS_TABLE)?;
            table.insert(hash.as_str(), data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(hash)
    }
}

#[async_trait]
impl Store for RedbStore {
    async fn load(&self, hash: &ObjectHash) -> HomeResult<Option<StoredObject>> {
        self.load_sync(hash)
    }

    async fn save(&self, object: &StoredObject) -> HomeResult<ObjectHash> {
        self.save_sync(object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::load_identity;
    use crate::types::{Device, Identity, LinkupServer};
    use tempfile::TempDir;

    fn create_test_store() -> (RedbStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.redb");
        let store = RedbStore::new(&db_path).unwrap();
        (store, temp_dir)
    }

    #[test]
    fn test_store_creates_parent_directories() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("nested/path/to/test.redb");
        let store = RedbStore::new(&db_path);
        assert!(store.is_ok());
        assert!(db_path.exists());
    }

    #[tokio::test]
    async fn test_save_and_load_objects() {
        let (store, _dir) = create_test_store();
        let identity = Identity::generate(Some("Love"));
        let device = Device::new(identity.hash());
        let linkup = LinkupServer::new("https://linkup.example.com").unwrap();

        let hash = store.save(&identity.clone().into()).await.unwrap();
        store.save(&device.clone().into()).await.unwrap();
        store.save(&linkup.clone().into()).await.unwrap();

        assert_eq!(load_identity(&store, &hash).await.unwrap(), Some(identity));
        assert_eq!(
            store.load(&device.hash()).await.unwrap(),
            Some(StoredObject::Device(device))
        );
        assert_eq!(store.list_objects().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_load_missing_returns_none() {
        let (store, _dir) = create_test_store();
        let loaded = store.load(&ObjectHash::from("nope")).await.unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn test_data_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.redb");
        let identity = Identity::generate(None);

        {
            let store = RedbStore::new(&db_path).unwrap();
            store.save(&identity.clone().into()).await.unwrap();
        }

        let store = RedbStore::new(&db_path).unwrap();
        assert_eq!(
            load_identity(&store, &identity.hash()).await.unwrap(),
            Some(identity)
        );
    }
}

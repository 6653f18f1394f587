// File-backed per-domain stores.
//
// Each domain (goals, profile, devices) is one JSON document under the data
// directory, keyed by user id. The document on disk is the sole source of
// truth; nothing is cached across requests. Mutations go through `upsert`,
// which holds the domain's write lock across the whole read-modify-write so
// concurrent upserts are linearizable and no accepted change is lost.

mod domains;

pub use domains::{
    next_goal_id, DeviceRegistration, DevicesDomain, Goal, GoalsDomain, Profile, ProfileDomain,
};

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::errors::{EngineError, EngineResult};

/// Binds a domain name to its per-user value type.
pub trait Domain {
    const NAME: &'static str;
    type Value: Serialize + DeserializeOwned + Default + Clone + Send;
}

pub struct FileStore {
    data_dir: PathBuf,
    /// One write lock per domain, created on first use.
    locks: DashMap<&'static str, Arc<Mutex<()>>>,
}

impl FileStore {
    pub fn new(data_dir: PathBuf) -> EngineResult<Self> {
        std::fs::create_dir_all(&data_dir).map_err(|e| {
            EngineError::StorageUnavailable(format!(
                "failed to create data directory {}: {e}",
                data_dir.display()
            ))
        })?;
        Ok(Self {
            data_dir,
            locks: DashMap::new(),
        })
    }

    fn domain_path(&self, name: &str) -> PathBuf {
        self.data_dir.join(format!("{name}.json"))
    }

    fn write_lock(&self, name: &'static str) -> Arc<Mutex<()>> {
        self.locks
            .entry(name)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Read the full user→value mapping for a domain.
    ///
    /// A missing file is an empty domain; an unreadable or corrupt file is
    /// `StorageUnavailable` and is never silently treated as empty.
    pub async fn load<D: Domain>(&self) -> EngineResult<BTreeMap<String, D::Value>> {
        let path = self.domain_path(D::NAME);
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => serde_json::from_str(&contents).map_err(|e| {
                EngineError::StorageUnavailable(format!(
                    "corrupt {} store at {}: {e}",
                    D::NAME,
                    path.display()
                ))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(EngineError::StorageUnavailable(format!(
                "cannot read {} store at {}: {e}",
                D::NAME,
                path.display()
            ))),
        }
    }

    /// Write the full mapping back. The temp-file-then-rename keeps a crash
    /// mid-write from corrupting the previous document.
    pub async fn save<D: Domain>(&self, mapping: &BTreeMap<String, D::Value>) -> EngineResult<()> {
        let path = self.domain_path(D::NAME);
        let tmp = self.data_dir.join(format!("{}.json.tmp", D::NAME));
        let contents = serde_json::to_string_pretty(mapping).map_err(|e| {
            EngineError::StorageUnavailable(format!("cannot serialize {} store: {e}", D::NAME))
        })?;
        tokio::fs::write(&tmp, contents).await.map_err(|e| {
            EngineError::StorageUnavailable(format!(
                "cannot write {} store at {}: {e}",
                D::NAME,
                tmp.display()
            ))
        })?;
        tokio::fs::rename(&tmp, &path).await.map_err(|e| {
            EngineError::StorageUnavailable(format!(
                "cannot replace {} store at {}: {e}",
                D::NAME,
                path.display()
            ))
        })
    }

    /// The user's entry, or the domain default when the user is unseen.
    pub async fn get<D: Domain>(&self, user: &str) -> EngineResult<D::Value> {
        Ok(self
            .load::<D>()
            .await?
            .get(user)
            .cloned()
            .unwrap_or_default())
    }

    /// Read-modify-write the user's entry under the domain's write lock.
    ///
    /// The mutator sees the stored entry (or the domain default for a new
    /// user) and may fail, in which case nothing is written. Returns the
    /// entry as persisted.
    pub async fn upsert<D, F>(&self, user: &str, mutate: F) -> EngineResult<D::Value>
    where
        D: Domain,
        F: FnOnce(&mut D::Value) -> EngineResult<()>,
    {
        let lock = self.write_lock(D::NAME);
        let _guard = lock.lock().await;

        let mut mapping = self.load::<D>().await?;
        let entry = mapping.entry(user.to_string()).or_default();
        mutate(entry)?;
        let updated = entry.clone();
        self.save::<D>(&mapping).await?;
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, FileStore) {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path().to_path_buf()).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_unseen_user_gets_default() {
        let (_dir, store) = store();
        let goals = store.get::<GoalsDomain>("nobody").await.unwrap();
        assert!(goals.is_empty());
    }

    #[tokio::test]
    async fn test_upsert_persists_and_reloads() {
        let (_dir, store) = store();
        store
            .upsert::<GoalsDomain, _>("u1", |goals| {
                goals.push(Goal::new("1".into(), serde_json::Map::new()));
                Ok(())
            })
            .await
            .unwrap();

        let goals = store.get::<GoalsDomain>("u1").await.unwrap();
        assert_eq!(goals.len(), 1);
        assert_eq!(goals[0].id, "1");
    }

    #[tokio::test]
    async fn test_failed_mutator_writes_nothing() {
        let (_dir, store) = store();
        let result = store
            .upsert::<GoalsDomain, _>("u1", |goals| {
                goals.push(Goal::new("junk".into(), serde_json::Map::new()));
                Err(EngineError::NotFound("goal".into()))
            })
            .await;
        assert!(result.is_err());

        let goals = store.get::<GoalsDomain>("u1").await.unwrap();
        assert!(goals.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_storage_unavailable() {
        let (dir, store) = store();
        std::fs::write(dir.path().join("goals.json"), "{ not json").unwrap();

        let result = store.get::<GoalsDomain>("u1").await;
        assert!(matches!(result, Err(EngineError::StorageUnavailable(_))));
    }

    #[tokio::test]
    async fn test_concurrent_upserts_lose_nothing() {
        let (_dir, store) = store();
        let store = Arc::new(store);

        let mut handles = Vec::new();
        for i in 0..32 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .upsert::<GoalsDomain, _>("u1", move |goals| {
                        let mut fields = serde_json::Map::new();
                        fields.insert("name".into(), format!("goal {i}").into());
                        goals.push(Goal::new(format!("id-{i}"), fields));
                        Ok(())
                    })
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let goals = store.get::<GoalsDomain>("u1").await.unwrap();
        assert_eq!(goals.len(), 32, "every concurrent upsert must be retained");
    }

    #[tokio::test]
    async fn test_domains_are_independent() {
        let (_dir, store) = store();
        store
            .upsert::<DevicesDomain, _>("u1", |devices| {
                devices.push(DeviceRegistration::new("tok-1".into(), "ios".into()));
                Ok(())
            })
            .await
            .unwrap();

        assert!(store.get::<GoalsDomain>("u1").await.unwrap().is_empty());
        assert_eq!(store.get::<DevicesDomain>("u1").await.unwrap().len(), 1);
    }
}

//! Versioned JSON documents stored by name in the `bridge_state` table.

use super::database::Database;
use crate::error::SetupError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

/// A named document with a schema version.
pub trait VersionedDocument: Serialize + DeserializeOwned + Sized {
    const NAME: &'static str;
    const VERSION: u32;

    fn version(&self) -> u32;

    /// Convert an unversioned document written by older bridges.
    fn upgrade_legacy(_value: &Value) -> Option<Self> {
        None
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("failed to encode `{name}`: {source}")]
    Encode {
        name: &'static str,
        source: serde_json::Error,
    },
}

/// Result of reading a document.
#[derive(Debug, PartialEq, Eq)]
pub enum LoadOutcome<T> {
    /// Nothing stored yet (first run).
    Missing,
    Current(T),
    /// Legacy document converted to the current version (not yet re-saved).
    Upgraded(T),
    Incompatible { reason: String },
}

#[derive(Clone)]
pub struct StateStore {
    db: Database,
}

impl StateStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn load<T: VersionedDocument>(&self) -> Result<LoadOutcome<T>, StoreError> {
        let raw: Option<String> =
            sqlx::query_scalar("SELECT data FROM bridge_state WHERE name = ?")
                .bind(T::NAME)
                .fetch_optional(self.db.pool())
                .await?;
        Ok(match raw {
            None => LoadOutcome::Missing,
            Some(raw) => decode::<T>(&raw),
        })
    }

    pub async fn save<T: VersionedDocument>(&self, doc: &T) -> Result<(), StoreError> {
        let data = serde_json::to_string(doc).map_err(|source| StoreError::Encode {
            name: T::NAME,
            source,
        })?;
        sqlx::query(
            "INSERT INTO bridge_state (name, data, updated_at) VALUES (?, ?, datetime('now')) \
             ON CONFLICT(name) DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at",
        )
        .bind(T::NAME)
        .bind(data)
        .execute(self.db.pool())
        .await?;
        tracing::debug!("StateStore: saved {}", T::NAME);
        Ok(())
    }

    /// Remove a stored document. Returns whether one existed.
    pub async fn delete(&self, name: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM bridge_state WHERE name = ?")
            .bind(name)
            .execute(self.db.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Load for startup: legacy documents are upgraded and written back,
    /// incompatible ones become a [`SetupError`].
    pub async fn load_for_startup<T: VersionedDocument>(&self) -> Result<Option<T>, SetupError> {
        match self.load::<T>().await? {
            LoadOutcome::Missing => {
                tracing::info!("StateStore: no stored {}, starting fresh", T::NAME);
                Ok(None)
            }
            LoadOutcome::Current(doc) => Ok(Some(doc)),
            LoadOutcome::Upgraded(doc) => {
                tracing::info!("StateStore: upgraded legacy {} to version {}", T::NAME, T::VERSION);
                self.save(&doc).await?;
                Ok(Some(doc))
            }
            LoadOutcome::Incompatible { reason } => Err(SetupError::IncompatibleDocument {
                document: T::NAME,
                reason,
            }),
        }
    }
}

fn decode<T: VersionedDocument>(raw: &str) -> LoadOutcome<T> {
    let value: Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(e) => {
            return LoadOutcome::Incompatible {
                reason: format!("not valid JSON ({e})"),
            };
        }
    };

    match value.get("version").map(Value::as_u64) {
        Some(Some(v)) if v == u64::from(T::VERSION) => match serde_json::from_value::<T>(value) {
            Ok(doc) => LoadOutcome::Current(doc),
            Err(e) => LoadOutcome::Incompatible {
                reason: format!("schema mismatch ({e})"),
            },
        },
        Some(Some(v)) => LoadOutcome::Incompatible {
            reason: format!("version {v} is not supported by this build (expected {})", T::VERSION),
        },
        Some(None) => LoadOutcome::Incompatible {
            reason: "version field is not a number".to_string(),
        },
        None => match T::upgrade_legacy(&value) {
            Some(doc) => LoadOutcome::Upgraded(doc),
            None => LoadOutcome::Incompatible {
                reason: "unversioned document that could not be upgraded".to_string(),
            },
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::settings::{BridgeSettings, ContactDirectory};
    use crate::bridge::registry::RegistryDocument;

    async fn store() -> StateStore {
        let db = Database::connect_in_memory().await.unwrap();
        db.run_migrations().await.unwrap();
        StateStore::new(db)
    }

    async fn put_raw(store: &StateStore, name: &str, data: &str) {
        sqlx::query("INSERT INTO bridge_state (name, data) VALUES (?, ?)")
            .bind(name)
            .bind(data)
            .execute(store.db.pool())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_missing_then_current() {
        let store = store().await;
        assert_eq!(store.load::<BridgeSettings>().await.unwrap(), LoadOutcome::Missing);

        let mut settings = BridgeSettings::default();
        settings.discord_prefix = true;
        store.save(&settings).await.unwrap();
        store.save(&settings).await.unwrap();

        assert_eq!(
            store.load::<BridgeSettings>().await.unwrap(),
            LoadOutcome::Current(settings)
        );
    }

    #[tokio::test]
    async fn test_legacy_upgrade_is_written_back() {
        let store = store().await;
        put_raw(&store, "contacts", r#"{"1@s.whatsapp.net":"Alice"}"#).await;

        let loaded = store.load_for_startup::<ContactDirectory>().await.unwrap().unwrap();
        assert_eq!(loaded.name_of("1@s.whatsapp.net"), Some("Alice"));
        assert!(matches!(
            store.load::<ContactDirectory>().await.unwrap(),
            LoadOutcome::Current(_)
        ));
    }

    #[tokio::test]
    async fn test_incompatible_documents() {
        let store = store().await;
        put_raw(&store, "chats", r#"{"version": 9, "entries": []}"#).await;
        put_raw(&store, "settings", "not json").await;

        assert!(matches!(
            store.load::<RegistryDocument>().await.unwrap(),
            LoadOutcome::Incompatible { .. }
        ));
        let err = store.load_for_startup::<BridgeSettings>().await.unwrap_err();
        assert!(err.to_string().contains("wabridge reset settings"));
    }

    #[tokio::test]
    async fn test_delete() {
        let store = store().await;
        store.save(&ContactDirectory::new()).await.unwrap();
        assert!(store.delete("contacts").await.unwrap());
        assert!(!store.delete("contacts").await.unwrap());
    }
}

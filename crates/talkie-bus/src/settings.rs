//! Stored settings with change notification.
//!
//! Writing a setting always stores it; `settingChanged` is only broadcast when
//! the new value differs from the stored one. Scalars compare by value. Objects
//! and arrays are decoded fresh from storage on every read, so they never count
//! as the same value and always notify.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, trace};

use talkie_types::settings::SettingChange;
use talkie_types::KnownEvent;

use crate::broadcaster::Broadcaster;
use crate::error::BusError;
use crate::storage::Storage;

#[derive(Clone)]
pub struct SettingsManager {
    storage: Arc<dyn Storage>,
    broadcaster: Broadcaster,
}

impl SettingsManager {
    pub fn new(storage: Arc<dyn Storage>, broadcaster: Broadcaster) -> Self {
        Self {
            storage,
            broadcaster,
        }
    }

    pub async fn get_stored_value(&self, key: &str) -> Result<Option<Value>, BusError> {
        self.storage.get(key).await
    }

    /// Decode the stored value, or `default` when the key was never stored.
    pub async fn get_stored_value_or<T: DeserializeOwned>(
        &self,
        key: &str,
        default: T,
    ) -> Result<T, BusError> {
        match self.storage.get(key).await? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(default),
        }
    }

    /// Store `value` under `key`. Returns whether `settingChanged` was broadcast.
    pub async fn set_stored_value<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
    ) -> Result<bool, BusError> {
        let value = serde_json::to_value(value)?;
        let previous_value = self.storage.get(key).await?;
        self.storage.set(key, value.clone()).await?;

        if is_same_value(previous_value.as_ref(), &value) {
            trace!("Setting {} unchanged", key);
            return Ok(false);
        }

        debug!("Setting {} changed", key);
        let change = SettingChange {
            key: key.to_string(),
            previous_value,
            value,
        };
        self.broadcaster
            .broadcast(KnownEvent::SettingChanged, &change)
            .await?;
        Ok(true)
    }
}

/// Identity comparison between a previously stored value and a new one.
pub fn is_same_value(previous: Option<&Value>, value: &Value) -> bool {
    match (previous, value) {
        (None, _) => false,
        (Some(Value::Object(_) | Value::Array(_)), _) => false,
        (_, Value::Object(_) | Value::Array(_)) => false,
        (Some(Value::Number(a)), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (Some(a), b) => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcaster::listener_fn;
    use crate::context::{ContextKind, SharedContext};
    use crate::storage::{MemoryStorage, SqliteStorage};
    use serde_json::json;
    use std::sync::Mutex;

    fn manager() -> (SettingsManager, Arc<Mutex<Vec<Value>>>, SharedContext) {
        manager_on(Arc::new(MemoryStorage::new()))
    }

    fn manager_on(
        storage: Arc<dyn Storage>,
    ) -> (SettingsManager, Arc<Mutex<Vec<Value>>>, SharedContext) {
        let broadcaster = Broadcaster::default();
        let context = SharedContext::new(ContextKind::Options);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        broadcaster.register(
            context.handle(),
            KnownEvent::SettingChanged,
            listener_fn(move |_, payload| {
                let sink = sink.clone();
                async move {
                    sink.lock().unwrap().push(payload);
                    Ok(None)
                }
            }),
        );
        let manager = SettingsManager::new(storage, broadcaster);
        (manager, seen, context)
    }

    #[test]
    fn scalar_identity() {
        assert!(is_same_value(Some(&json!(1)), &json!(1.0)));
        assert!(is_same_value(Some(&json!("a")), &json!("a")));
        assert!(is_same_value(Some(&Value::Null), &Value::Null));
        assert!(!is_same_value(None, &Value::Null));
        assert!(!is_same_value(Some(&json!("1")), &json!(1)));
        assert!(!is_same_value(Some(&json!([1])), &json!([1])));
        assert!(!is_same_value(Some(&json!({})), &json!({})));
    }

    #[tokio::test]
    async fn same_scalar_is_stored_but_not_announced() {
        let (manager, seen, _context) = manager();
        assert!(manager.set_stored_value("rate", &1.5).await.unwrap());
        assert!(!manager.set_stored_value("rate", &1.5).await.unwrap());
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(manager.get_stored_value("rate").await.unwrap(), Some(json!(1.5)));
    }

    #[tokio::test]
    async fn change_carries_previous_and_new_value() {
        let (manager, seen, _context) = manager();
        manager.set_stored_value("voice", "alice").await.unwrap();
        manager.set_stored_value("voice", "bob").await.unwrap();

        let seen = seen.lock().unwrap();
        let first: SettingChange = serde_json::from_value(seen[0].clone()).unwrap();
        assert_eq!(first.previous_value, None);
        assert_eq!(first.value, json!("alice"));
        let second: SettingChange = serde_json::from_value(seen[1].clone()).unwrap();
        assert_eq!(second.previous_value, Some(json!("alice")));
        assert_eq!(second.value, json!("bob"));
    }

    #[tokio::test]
    async fn objects_always_announce() {
        let (manager, seen, _context) = manager();
        let voice = json!({ "name": "alice", "rate": 1 });
        manager.set_stored_value("voice", &voice).await.unwrap();
        manager.set_stored_value("voice", &voice).await.unwrap();
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn default_used_for_missing_key() {
        let (manager, _seen, _context) = manager();
        assert_eq!(manager.get_stored_value_or("rate", 1.0).await.unwrap(), 1.0);
        manager.set_stored_value("rate", &2.0).await.unwrap();
        assert_eq!(manager.get_stored_value_or("rate", 1.0).await.unwrap(), 2.0);
    }

    #[tokio::test]
    async fn sqlite_backed_settings_announce_changes() {
        let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
        let (manager, seen, _context) = manager_on(storage.clone());

        assert_eq!(
            manager.get_stored_value_or("voice", json!("default")).await.unwrap(),
            json!("default")
        );
        assert!(manager.set_stored_value("voice", "alice").await.unwrap());
        assert!(!manager.set_stored_value("voice", "alice").await.unwrap());
        assert!(manager.set_stored_value("voice", "bob").await.unwrap());

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1]["previousValue"], json!("alice"));
        assert_eq!(storage.list().unwrap()[0].value, json!("bob"));
    }
}

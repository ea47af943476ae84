// Persisted state consumed by the background session
// The schema is owned by the wallet UI; this module only reads and writes the keys it needs.

use std::rc::Rc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::host::{ExtensionHost, HostResult};

pub const LOCK_STATE_KEY: &str = "yakklLockState";
pub const IDLE_AUTO_LOCK_KEY: &str = "yakklIdleAutoLock";
pub const IDLE_CYCLE_COUNT_KEY: &str = "yakklIdleCycleCount";
pub const SELECTION_KEY: &str = "yakklSelection";
pub const PREFERENCES_KEY: &str = "yakklPreferences";
pub const BLACKLIST_KEY: &str = "yakklBlacklist";
pub const PENDING_LOCK_KEY: &str = "yakklPendingLock";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockState {
    pub locked: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

/// A lockdown scheduled by an idle entry that has not run yet.
/// Lives in storage so a restarted worker can honor it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingLock {
    pub fire_at_ms: u64,
}

/// Currently selected account and network
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Selection {
    pub account: Option<String>,
    pub chain_id: Option<u64>,
}

impl Selection {
    /// Setup is complete once both an account and a network are chosen
    pub fn is_complete(&self) -> bool {
        self.account.as_deref().is_some_and(|a| !a.is_empty()) && self.chain_id.is_some()
    }
}

/// Where a pinned popup should appear
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PinnedLocation {
    TopLeft,
    TopRight,
    BottomLeft,
    BottomRight,
    Middle,
    At { x: i32, y: i32 },
}

impl TryFrom<String> for PinnedLocation {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "TL" => Ok(PinnedLocation::TopLeft),
            "TR" => Ok(PinnedLocation::TopRight),
            "BL" => Ok(PinnedLocation::BottomLeft),
            "BR" => Ok(PinnedLocation::BottomRight),
            "M" => Ok(PinnedLocation::Middle),
            other => {
                let (x, y) = other
                    .split_once(',')
                    .ok_or_else(|| format!("invalid pinned location: {other}"))?;
                let x = x.trim().parse().map_err(|_| format!("invalid x: {x}"))?;
                let y = y.trim().parse().map_err(|_| format!("invalid y: {y}"))?;
                Ok(PinnedLocation::At { x, y })
            }
        }
    }
}

impl From<PinnedLocation> for String {
    fn from(location: PinnedLocation) -> Self {
        match location {
            PinnedLocation::TopLeft => "TL".to_string(),
            PinnedLocation::TopRight => "TR".to_string(),
            PinnedLocation::BottomLeft => "BL".to_string(),
            PinnedLocation::BottomRight => "BR".to_string(),
            PinnedLocation::Middle => "M".to_string(),
            PinnedLocation::At { x, y } => format!("{x},{y}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preferences {
    #[serde(default)]
    pub pinned: bool,
    #[serde(default = "default_pinned_location")]
    pub pinned_location: PinnedLocation,
}

fn default_pinned_location() -> PinnedLocation {
    PinnedLocation::TopRight
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            pinned: false,
            pinned_location: default_pinned_location(),
        }
    }
}

/// Typed accessors over the host key-value store
#[derive(Clone)]
pub struct StateStore {
    host: Rc<dyn ExtensionHost>,
}

impl StateStore {
    pub fn new(host: Rc<dyn ExtensionHost>) -> Self {
        Self { host }
    }

    async fn get<T: DeserializeOwned>(&self, key: &str) -> HostResult<Option<T>> {
        let Some(value) = self.host.storage_get(key).await? else {
            return Ok(None);
        };
        match serde_json::from_value(value) {
            Ok(decoded) => Ok(Some(decoded)),
            Err(e) => {
                tracing::warn!("Ignoring unreadable value under {}: {}", key, e);
                Ok(None)
            }
        }
    }

    async fn set<T: Serialize>(&self, key: &str, value: &T) -> HostResult<()> {
        let value = serde_json::to_value(value).map_err(|e| {
            crate::error::HostError::new("storage_set", format!("encode {key}: {e}"))
        })?;
        self.host.storage_set(key, value).await
    }

    pub async fn lock_state(&self) -> HostResult<LockState> {
        Ok(self.get(LOCK_STATE_KEY).await?.unwrap_or_default())
    }

    pub async fn set_lock_state(&self, state: &LockState) -> HostResult<()> {
        self.set(LOCK_STATE_KEY, state).await
    }

    /// Idle auto-lock is on unless the user turned it off
    pub async fn idle_auto_lock(&self) -> HostResult<bool> {
        Ok(self.get(IDLE_AUTO_LOCK_KEY).await?.unwrap_or(true))
    }

    pub async fn idle_cycle_count(&self) -> HostResult<u64> {
        Ok(self.get(IDLE_CYCLE_COUNT_KEY).await?.unwrap_or(0))
    }

    pub async fn increment_idle_cycle_count(&self) -> HostResult<u64> {
        let next = self.idle_cycle_count().await?.saturating_add(1);
        self.set(IDLE_CYCLE_COUNT_KEY, &next).await?;
        Ok(next)
    }

    pub async fn pending_lock(&self) -> HostResult<Option<PendingLock>> {
        Ok(self.get::<Option<PendingLock>>(PENDING_LOCK_KEY).await?.flatten())
    }

    pub async fn set_pending_lock(&self, pending: Option<PendingLock>) -> HostResult<()> {
        self.set(PENDING_LOCK_KEY, &pending).await
    }

    pub async fn selection(&self) -> HostResult<Selection> {
        Ok(self.get(SELECTION_KEY).await?.unwrap_or_default())
    }

    pub async fn set_selection(&self, selection: &Selection) -> HostResult<()> {
        self.set(SELECTION_KEY, selection).await
    }

    pub async fn preferences(&self) -> HostResult<Preferences> {
        Ok(self.get(PREFERENCES_KEY).await?.unwrap_or_default())
    }

    pub async fn blacklist(&self) -> HostResult<Option<Vec<String>>> {
        self.get(BLACKLIST_KEY).await
    }

    pub async fn set_blacklist(&self, domains: &[String]) -> HostResult<()> {
        self.set(BLACKLIST_KEY, &domains).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_host::MemoryHost;
    use serde_json::json;

    #[test]
    fn test_pinned_location_parsing() {
        assert_eq!(
            PinnedLocation::try_from("BL".to_string()).unwrap(),
            PinnedLocation::BottomLeft
        );
        assert_eq!(
            PinnedLocation::try_from("120, 40".to_string()).unwrap(),
            PinnedLocation::At { x: 120, y: 40 }
        );
        assert!(PinnedLocation::try_from("nowhere".to_string()).is_err());
    }

    #[test]
    fn test_selection_completeness() {
        assert!(!Selection::default().is_complete());
        let partial = Selection {
            account: Some("0xabc".into()),
            chain_id: None,
        };
        assert!(!partial.is_complete());
        let full = Selection {
            account: Some("0xabc".into()),
            chain_id: Some(1),
        };
        assert!(full.is_complete());
    }

    #[tokio::test]
    async fn test_defaults_and_corrupt_values() {
        let host = Rc::new(MemoryHost::new());
        let store = StateStore::new(host.clone());

        assert!(store.idle_auto_lock().await.unwrap());
        assert_eq!(store.lock_state().await.unwrap(), LockState::default());

        host.seed_storage(PREFERENCES_KEY, json!({"pinned": "yes"}));
        assert_eq!(store.preferences().await.unwrap(), Preferences::default());

        host.seed_storage(
            PREFERENCES_KEY,
            json!({"pinned": true, "pinnedLocation": "M"}),
        );
        let prefs = store.preferences().await.unwrap();
        assert!(prefs.pinned);
        assert_eq!(prefs.pinned_location, PinnedLocation::Middle);
    }

    #[tokio::test]
    async fn test_cycle_count_increments() {
        let host = Rc::new(MemoryHost::new());
        let store = StateStore::new(host.clone());
        assert_eq!(store.increment_idle_cycle_count().await.unwrap(), 1);
        assert_eq!(store.increment_idle_cycle_count().await.unwrap(), 2);
        assert_eq!(host.stored(IDLE_CYCLE_COUNT_KEY), Some(json!(2)));
    }

    #[tokio::test]
    async fn test_pending_lock_set_and_cleared() {
        let host = Rc::new(MemoryHost::new());
        let store = StateStore::new(host.clone());
        assert_eq!(store.pending_lock().await.unwrap(), None);

        let pending = PendingLock { fire_at_ms: 60_000 };
        store.set_pending_lock(Some(pending)).await.unwrap();
        assert_eq!(host.stored(PENDING_LOCK_KEY), Some(json!({"fireAtMs": 60_000})));
        assert_eq!(store.pending_lock().await.unwrap(), Some(pending));

        store.set_pending_lock(None).await.unwrap();
        assert_eq!(host.stored(PENDING_LOCK_KEY), Some(json!(null)));
        assert_eq!(store.pending_lock().await.unwrap(), None);
    }
}

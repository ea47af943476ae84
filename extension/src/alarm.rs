// Thin wrapper over host alarms (chrome.alarms)
// Host alarms survive service worker suspension; the local map mirrors what we scheduled.

use std::collections::HashMap;
use std::rc::Rc;

use crate::host::{ExtensionHost, HostResult};

pub const LOCK_ALARM: &str = "yakkl-lock-alarm";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alarm {
    pub name: String,
    pub fire_at_ms: u64,
}

pub struct AlarmScheduler {
    host: Rc<dyn ExtensionHost>,
    scheduled: HashMap<String, u64>,
}

impl AlarmScheduler {
    pub fn new(host: Rc<dyn ExtensionHost>) -> Self {
        Self {
            host,
            scheduled: HashMap::new(),
        }
    }

    /// Schedule (or reschedule) the named alarm
    pub async fn create(&mut self, name: &str, fire_at_ms: u64) -> HostResult<Alarm> {
        self.host.create_alarm(name, fire_at_ms).await?;
        self.scheduled.insert(name.to_string(), fire_at_ms);
        tracing::debug!("⏰ Alarm {} set for {}", name, fire_at_ms);
        Ok(Alarm {
            name: name.to_string(),
            fire_at_ms,
        })
    }

    /// Clear the named alarm. Clearing an alarm that does not exist is a no-op.
    ///
    /// The host is always asked, so an alarm left behind by a previous
    /// worker instance is cleared as well.
    pub async fn clear(&mut self, name: &str) -> HostResult<bool> {
        let known = self.scheduled.remove(name).is_some();
        let removed = self.host.clear_alarm(name).await?;
        if known || removed {
            tracing::debug!("⏰ Alarm {} cleared", name);
        }
        Ok(known || removed)
    }

    pub fn pending(&self, name: &str) -> Option<Alarm> {
        self.scheduled.get(name).map(|&fire_at_ms| Alarm {
            name: name.to_string(),
            fire_at_ms,
        })
    }

    /// Record that the host fired `name`; returns what we had scheduled
    pub fn fired(&mut self, name: &str) -> Option<Alarm> {
        self.scheduled.remove(name).map(|fire_at_ms| Alarm {
            name: name.to_string(),
            fire_at_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_host::{HostCall, MemoryHost};

    #[tokio::test]
    async fn test_create_and_clear() {
        let host = Rc::new(MemoryHost::new());
        let mut alarms = AlarmScheduler::new(host.clone());

        let alarm = alarms.create(LOCK_ALARM, 30_000).await.unwrap();
        assert_eq!(alarm.fire_at_ms, 30_000);
        assert_eq!(host.alarm(LOCK_ALARM), Some(30_000));
        assert_eq!(alarms.pending(LOCK_ALARM), Some(alarm));

        assert!(alarms.clear(LOCK_ALARM).await.unwrap());
        assert_eq!(host.alarm(LOCK_ALARM), None);
        assert_eq!(alarms.pending(LOCK_ALARM), None);
    }

    #[tokio::test]
    async fn test_clear_missing_is_noop() {
        let host = Rc::new(MemoryHost::new());
        let mut alarms = AlarmScheduler::new(host.clone());

        assert!(!alarms.clear(LOCK_ALARM).await.unwrap());
        assert!(!alarms.clear(LOCK_ALARM).await.unwrap());
        assert_eq!(
            host.count(|c| matches!(c, HostCall::ClearAlarm { existed: true, .. })),
            0
        );
    }

    #[tokio::test]
    async fn test_fired_consumes_entry() {
        let host = Rc::new(MemoryHost::new());
        let mut alarms = AlarmScheduler::new(host.clone());
        alarms.create(LOCK_ALARM, 10).await.unwrap();

        assert!(alarms.fired(LOCK_ALARM).is_some());
        assert!(alarms.fired(LOCK_ALARM).is_none());
    }
}

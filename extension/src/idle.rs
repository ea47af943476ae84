// Idle detection and automatic lockdown
//
// active -> idle     threshold exceeded (app strategy) or host idle signal (system strategy)
// idle   -> active   qualifying input or host active signal; cancels the lock alarm
// idle   -> locked   after lock_delay_ms, or synchronously when the delay is zero
//
// Side effects run once per idle entry, guarded by `lockdown_initiated`.
// A scheduled lockdown is persisted with its alarm and resumed by the next worker instance.

use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::alarm::{AlarmScheduler, LOCK_ALARM};
use crate::config::{FailurePolicy, IdleConfig, IdleStrategy};
use crate::error::{HostError, TransitionError};
use crate::host::ExtensionHost;
use crate::store::{LockState, PendingLock, StateStore};

pub const LOCKDOWN_IMMINENT_NOTIFICATION: &str = "yakkl-lockdown-imminent";
pub const LOCKED_NOTIFICATION: &str = "yakkl-locked";

/// chrome.idle refuses detection intervals below 15 seconds
const MIN_DETECTION_INTERVAL_SECS: u64 = 15;

const IDLE_LOCK_REASON: &str = "idle";
const FAILURE_LOCK_REASON: &str = "idle-transition-failure";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdleState {
    Active,
    Idle,
    Locked,
}

/// What a single observation did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdleStep {
    Unchanged,
    Entered(IdleState),
    LockScheduled { fire_at_ms: u64 },
    /// Lockdown executed; the session broadcasts it to the UI
    LockedDown { reason: String },
    /// A transition handler failed and the machine settled to this state
    Recovered(IdleState),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdleStatus {
    pub state: IdleState,
    pub previous: IdleState,
    pub lockdown_initiated: bool,
    pub lock_alarm_at: Option<u64>,
}

/// App-wide strategy input tracking
#[derive(Debug, Clone)]
pub struct ActivityTracker {
    threshold_ms: u64,
    last_activity_ms: u64,
    hidden: bool,
}

impl ActivityTracker {
    pub fn new(threshold_ms: u64, now_ms: u64) -> Self {
        Self {
            threshold_ms,
            last_activity_ms: now_ms,
            hidden: false,
        }
    }

    pub fn record_input(&mut self, now_ms: u64) {
        self.last_activity_ms = self.last_activity_ms.max(now_ms);
        self.hidden = false;
    }

    /// A hidden document is probably idle: backdate the last activity by half a threshold
    pub fn set_hidden(&mut self, hidden: bool, now_ms: u64) {
        if hidden && !self.hidden {
            let backdated = now_ms.saturating_sub(self.threshold_ms / 2);
            self.last_activity_ms = self.last_activity_ms.min(backdated);
        }
        self.hidden = hidden;
    }

    pub fn is_hidden(&self) -> bool {
        self.hidden
    }

    pub fn last_activity_ms(&self) -> u64 {
        self.last_activity_ms
    }

    pub fn observe(&self, now_ms: u64) -> IdleState {
        if now_ms.saturating_sub(self.last_activity_ms) > self.threshold_ms {
            IdleState::Idle
        } else {
            IdleState::Active
        }
    }
}

pub struct IdleMachine {
    host: Rc<dyn ExtensionHost>,
    store: StateStore,
    alarms: AlarmScheduler,
    config: IdleConfig,
    state: IdleState,
    previous: IdleState,
    lockdown_initiated: bool,
    tracker: ActivityTracker,
}

impl IdleMachine {
    pub fn new(host: Rc<dyn ExtensionHost>, store: StateStore, config: IdleConfig) -> Self {
        let tracker = ActivityTracker::new(config.threshold_ms, host.now_ms());
        Self {
            alarms: AlarmScheduler::new(host.clone()),
            host,
            store,
            config,
            state: IdleState::Active,
            previous: IdleState::Active,
            lockdown_initiated: false,
            tracker,
        }
    }

    pub async fn init(&mut self) -> Result<(), HostError> {
        match self.store.pending_lock().await? {
            Some(pending) => self.resume_lock(pending).await?,
            // Nothing persisted, so any lock alarm still registered is stale
            None => {
                self.alarms.clear(LOCK_ALARM).await?;
            }
        }

        match self.config.strategy {
            IdleStrategy::System => {
                let secs = (self.config.threshold_ms / 1000).max(MIN_DETECTION_INTERVAL_SECS);
                let secs = u32::try_from(secs).unwrap_or(u32::MAX);
                self.host.set_idle_detection_interval(secs).await?;
                tracing::info!("Idle detection: system-wide, interval {}s", secs);
            }
            IdleStrategy::App => {
                self.tracker = ActivityTracker::new(self.config.threshold_ms, self.host.now_ms());
                tracing::info!(
                    "Idle detection: app-wide, polling every {}ms",
                    self.config.poll_interval_ms
                );
            }
        }
        Ok(())
    }

    /// Pick up a lockdown scheduled before the worker was suspended
    async fn resume_lock(&mut self, pending: PendingLock) -> Result<(), HostError> {
        tracing::info!("Resuming lockdown scheduled for {}", pending.fire_at_ms);
        self.previous = IdleState::Active;
        self.state = IdleState::Idle;
        self.lockdown_initiated = true;
        // Same name: replaces the host alarm if it survived, fires promptly if overdue
        let fire_at_ms = pending.fire_at_ms.max(self.host.now_ms());
        self.alarms.create(LOCK_ALARM, fire_at_ms).await?;
        Ok(())
    }

    pub fn status(&self) -> IdleStatus {
        IdleStatus {
            state: self.state,
            previous: self.previous,
            lockdown_initiated: self.lockdown_initiated,
            lock_alarm_at: self.alarms.pending(LOCK_ALARM).map(|a| a.fire_at_ms),
        }
    }

    pub fn strategy(&self) -> IdleStrategy {
        self.config.strategy
    }

    pub fn tracker(&self) -> &ActivityTracker {
        &self.tracker
    }

    /// Host idle API signal (system strategy)
    pub async fn host_signal(&mut self, signal: IdleState) -> IdleStep {
        if self.config.strategy != IdleStrategy::System {
            tracing::debug!("Ignoring host idle signal {:?} (app strategy)", signal);
            return IdleStep::Unchanged;
        }
        self.observe(signal).await
    }

    /// Qualifying user input; always means active
    pub async fn activity(&mut self) -> IdleStep {
        self.tracker.record_input(self.host.now_ms());
        self.observe(IdleState::Active).await
    }

    pub async fn visibility(&mut self, hidden: bool) -> IdleStep {
        if self.config.strategy != IdleStrategy::App {
            return IdleStep::Unchanged;
        }
        self.tracker.set_hidden(hidden, self.host.now_ms());
        self.poll().await
    }

    /// Interval tick (app strategy)
    pub async fn poll(&mut self) -> IdleStep {
        if self.config.strategy != IdleStrategy::App {
            return IdleStep::Unchanged;
        }
        let observed = self.tracker.observe(self.host.now_ms());
        if observed == IdleState::Active && self.state != IdleState::Active {
            // Only real input brings us back; a poll never does
            return IdleStep::Unchanged;
        }
        self.observe(observed).await
    }

    /// Feed an observed state through the transition table
    pub async fn observe(&mut self, signal: IdleState) -> IdleStep {
        match self.transition(signal).await {
            Ok(step) => step,
            Err(err) => self.recover(err).await,
        }
    }

    pub async fn on_alarm(&mut self, name: &str) -> IdleStep {
        if name != LOCK_ALARM {
            return IdleStep::Unchanged;
        }
        let scheduled = self.alarms.fired(name);
        if !self.lockdown_initiated {
            // Cancelled by an active transition before it fired
            tracing::debug!("Stale lock alarm ignored ({:?})", scheduled);
            return IdleStep::Unchanged;
        }
        match self.lockdown(IDLE_LOCK_REASON).await {
            Ok(step) => step,
            Err(err) => self.recover(err).await,
        }
    }

    async fn transition(&mut self, signal: IdleState) -> Result<IdleStep, TransitionError> {
        match (self.state, signal) {
            (IdleState::Active, IdleState::Active) if !self.lockdown_initiated => {
                Ok(IdleStep::Unchanged)
            }
            (_, IdleState::Active) => self.enter_active().await,
            // A locked screen is idle too; the wallet only locks through lockdown
            (IdleState::Active, IdleState::Idle | IdleState::Locked) => self.enter_idle().await,
            // Leaving idle or locked requires an observed active signal first
            (IdleState::Idle | IdleState::Locked, _) => Ok(IdleStep::Unchanged),
        }
    }

    async fn enter_active(&mut self) -> Result<IdleStep, TransitionError> {
        tracing::info!("🟢 Session active (was {:?})", self.state);
        self.previous = self.state;
        self.state = IdleState::Active;
        let was_initiated = std::mem::replace(&mut self.lockdown_initiated, false);

        self.alarms.clear(LOCK_ALARM).await?;
        if was_initiated {
            self.store.set_pending_lock(None).await?;
            self.host
                .clear_notification(LOCKDOWN_IMMINENT_NOTIFICATION)
                .await?;
        }
        self.host.set_price_polling(true).await?;
        Ok(IdleStep::Entered(IdleState::Active))
    }

    async fn enter_idle(&mut self) -> Result<IdleStep, TransitionError> {
        self.previous = self.state;
        self.state = IdleState::Idle;
        if self.lockdown_initiated {
            return Ok(IdleStep::Entered(IdleState::Idle));
        }
        self.lockdown_initiated = true;
        tracing::info!("🟡 Session idle, starting lockdown sequence");

        self.host.set_price_polling(false).await?;

        if !self.store.idle_auto_lock().await? {
            tracing::info!("Idle auto-lock disabled, not scheduling lockdown");
            return Ok(IdleStep::Entered(IdleState::Idle));
        }
        if self.store.lock_state().await?.locked {
            tracing::debug!("Wallet already locked, nothing to schedule");
            return Ok(IdleStep::Entered(IdleState::Idle));
        }

        let delay = self.config.lock_delay_ms;
        if delay == 0 {
            return self.lockdown(IDLE_LOCK_REASON).await;
        }

        let seconds = delay.div_ceil(1000);
        self.host
            .notify(
                LOCKDOWN_IMMINENT_NOTIFICATION,
                "YAKKL Security Alert",
                &format!("Wallet will lock in {seconds} seconds due to inactivity."),
            )
            .await?;
        let fire_at_ms = self.host.now_ms().saturating_add(delay);
        self.store
            .set_pending_lock(Some(PendingLock { fire_at_ms }))
            .await
            .map_err(TransitionError::Alarm)?;
        self.alarms
            .create(LOCK_ALARM, fire_at_ms)
            .await
            .map_err(TransitionError::Alarm)?;
        Ok(IdleStep::LockScheduled { fire_at_ms })
    }

    /// The persisted lock state is the commit point. Once it is written the
    /// lockdown stands and the remaining cleanup is best effort.
    async fn lockdown(&mut self, reason: &str) -> Result<IdleStep, TransitionError> {
        tracing::warn!("🔒 Lockdown: {}", reason);
        self.store
            .set_lock_state(&LockState {
                locked: true,
                reason: Some(reason.to_string()),
            })
            .await
            .map_err(TransitionError::Lockdown)?;
        if self.state != IdleState::Locked {
            self.previous = self.state;
            self.state = IdleState::Locked;
        }

        if let Err(e) = self.alarms.clear(LOCK_ALARM).await {
            tracing::warn!("Locked, but the lock alarm was not cleared: {}", e);
        }
        if let Err(e) = self.store.set_pending_lock(None).await {
            tracing::warn!("Locked, but the pending lock was not cleared: {}", e);
        }
        match self.store.increment_idle_cycle_count().await {
            Ok(cycles) => tracing::debug!("Idle lock cycle {}", cycles),
            Err(e) => tracing::warn!("Idle cycle count not updated: {}", e),
        }
        if let Err(e) = self
            .host
            .clear_notification(LOCKDOWN_IMMINENT_NOTIFICATION)
            .await
        {
            tracing::warn!("Lockdown warning not cleared: {}", e);
        }
        if let Err(e) = self
            .host
            .notify(
                LOCKED_NOTIFICATION,
                "YAKKL Locked",
                "Your wallet was locked after a period of inactivity.",
            )
            .await
        {
            tracing::warn!("Lock notification not shown: {}", e);
        }

        Ok(IdleStep::LockedDown {
            reason: reason.to_string(),
        })
    }

    async fn recover(&mut self, err: TransitionError) -> IdleStep {
        tracing::warn!(
            "Idle transition failed in {:?}: {} ({:?} policy)",
            self.state,
            err,
            self.config.failure_policy
        );
        match self.config.failure_policy {
            FailurePolicy::FailOpen => {
                self.previous = self.state;
                self.state = IdleState::Active;
                self.lockdown_initiated = false;
                if let Err(e) = self.alarms.clear(LOCK_ALARM).await {
                    tracing::warn!("Could not clear lock alarm while recovering: {}", e);
                }
                if let Err(e) = self.store.set_pending_lock(None).await {
                    tracing::warn!("Could not clear pending lock while recovering: {}", e);
                }
                IdleStep::Recovered(IdleState::Active)
            }
            FailurePolicy::FailClosed => {
                if let Err(e) = self.lockdown(FAILURE_LOCK_REASON).await {
                    tracing::error!("Fail-closed lockdown also failed: {}", e);
                }
                self.previous = self.state;
                self.state = IdleState::Locked;
                self.lockdown_initiated = false;
                IdleStep::LockedDown {
                    reason: FAILURE_LOCK_REASON.to_string(),
                }
            }
        }
    }
}

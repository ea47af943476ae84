// In-memory ExtensionHost
//
// Records every platform call in order. Drives the replay binary and the test suites.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::error::{ChannelError, HostError};
use crate::host::{
    Bounds, ExtensionHost, HostResult, PortId, TabId, WindowId, WindowInfo, WindowSpec,
};

/// A recorded host call
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "call", rename_all = "snake_case")]
pub enum HostCall {
    Post { port: PortId, message: Value },
    FocusWindow { window: WindowId, url: Option<String> },
    CreateWindow { window: WindowId, spec: WindowSpec },
    RedirectTab { tab: TabId, url: String },
    CreateAlarm { name: String, fire_at_ms: u64 },
    ClearAlarm { name: String, existed: bool },
    Notify { id: String, title: String, message: String },
    ClearNotification { id: String },
    StorageSet { key: String, value: Value },
    LockIndicator { locked: bool },
    PricePolling { enabled: bool },
    IdleInterval { seconds: u32 },
}

#[derive(Default)]
struct State {
    calls: Vec<HostCall>,
    closed_ports: HashSet<PortId>,
    windows: BTreeMap<WindowId, WindowInfo>,
    next_window: i64,
    alarms: HashMap<String, u64>,
    notifications: HashMap<String, String>,
    storage: HashMap<String, Value>,
    blacklist: Vec<String>,
    screen: Option<Bounds>,
    failing: HashSet<&'static str>,
}

pub struct MemoryHost {
    state: RefCell<State>,
    clock: Cell<u64>,
}

impl MemoryHost {
    pub fn new() -> Self {
        Self {
            state: RefCell::new(State {
                next_window: 1,
                screen: Some(Bounds {
                    left: 0,
                    top: 0,
                    width: 1920,
                    height: 1080,
                }),
                ..State::default()
            }),
            clock: Cell::new(0),
        }
    }

    pub fn with_blacklist<I, S>(self, domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state.borrow_mut().blacklist = domains.into_iter().map(Into::into).collect();
        self
    }

    pub fn set_screen(&self, screen: Option<Bounds>) {
        self.state.borrow_mut().screen = screen;
    }

    pub fn set_now(&self, ms: u64) {
        self.clock.set(ms);
    }

    pub fn advance(&self, ms: u64) {
        self.clock.set(self.clock.get() + ms);
    }

    /// Make every subsequent call named `call` fail (names match the trait methods)
    pub fn fail_on(&self, call: &'static str) {
        self.state.borrow_mut().failing.insert(call);
    }

    pub fn recover(&self, call: &'static str) {
        self.state.borrow_mut().failing.remove(call);
    }

    pub fn close_port(&self, port: PortId) {
        self.state.borrow_mut().closed_ports.insert(port);
    }

    /// Simulate the user closing a window
    pub fn close_window(&self, id: WindowId) {
        self.state.borrow_mut().windows.remove(&id);
    }

    pub fn open_windows(&self) -> Vec<WindowId> {
        self.state.borrow().windows.keys().copied().collect()
    }

    pub fn calls(&self) -> Vec<HostCall> {
        self.state.borrow().calls.clone()
    }

    pub fn take_calls(&self) -> Vec<HostCall> {
        std::mem::take(&mut self.state.borrow_mut().calls)
    }

    pub fn count(&self, pred: impl Fn(&HostCall) -> bool) -> usize {
        self.state.borrow().calls.iter().filter(|c| pred(c)).count()
    }

    pub fn messages_to(&self, port: PortId) -> Vec<Value> {
        self.state
            .borrow()
            .calls
            .iter()
            .filter_map(|c| match c {
                HostCall::Post { port: p, message } if *p == port => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn alarm(&self, name: &str) -> Option<u64> {
        self.state.borrow().alarms.get(name).copied()
    }

    pub fn notification(&self, id: &str) -> Option<String> {
        self.state.borrow().notifications.get(id).cloned()
    }

    pub fn stored(&self, key: &str) -> Option<Value> {
        self.state.borrow().storage.get(key).cloned()
    }

    /// Write storage without recording a call
    pub fn seed_storage(&self, key: &str, value: Value) {
        self.state.borrow_mut().storage.insert(key.to_string(), value);
    }

    fn check(&self, call: &'static str) -> HostResult<()> {
        if self.state.borrow().failing.contains(call) {
            return Err(HostError::new(call, "injected failure"));
        }
        Ok(())
    }

    fn record(&self, call: HostCall) {
        self.state.borrow_mut().calls.push(call);
    }
}

impl Default for MemoryHost {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait(?Send)]
impl ExtensionHost for MemoryHost {
    async fn post_message(&self, port: PortId, message: Value) -> Result<(), ChannelError> {
        if self.state.borrow().closed_ports.contains(&port) {
            return Err(ChannelError { port });
        }
        self.record(HostCall::Post { port, message });
        Ok(())
    }

    async fn get_window(&self, id: WindowId) -> HostResult<Option<WindowInfo>> {
        self.check("get_window")?;
        Ok(self.state.borrow().windows.get(&id).cloned())
    }

    async fn focus_window(&self, id: WindowId, url: Option<&str>) -> HostResult<()> {
        self.check("focus_window")?;
        let mut state = self.state.borrow_mut();
        let Some(window) = state.windows.get_mut(&id) else {
            return Err(HostError::new("focus_window", format!("no window with id {id}")));
        };
        window.focused = true;
        state.calls.push(HostCall::FocusWindow {
            window: id,
            url: url.map(str::to_string),
        });
        Ok(())
    }

    async fn create_window(&self, spec: WindowSpec) -> HostResult<WindowId> {
        self.check("create_window")?;
        let mut state = self.state.borrow_mut();
        let id = WindowId(state.next_window);
        state.next_window += 1;
        state.windows.insert(id, WindowInfo { id, focused: true });
        state.calls.push(HostCall::CreateWindow { window: id, spec });
        Ok(id)
    }

    async fn screen_bounds(&self) -> HostResult<Option<Bounds>> {
        self.check("screen_bounds")?;
        Ok(self.state.borrow().screen)
    }

    async fn redirect_tab(&self, tab: TabId, url: &str) -> HostResult<()> {
        self.check("redirect_tab")?;
        self.record(HostCall::RedirectTab {
            tab,
            url: url.to_string(),
        });
        Ok(())
    }

    async fn create_alarm(&self, name: &str, fire_at_ms: u64) -> HostResult<()> {
        self.check("create_alarm")?;
        let mut state = self.state.borrow_mut();
        state.alarms.insert(name.to_string(), fire_at_ms);
        state.calls.push(HostCall::CreateAlarm {
            name: name.to_string(),
            fire_at_ms,
        });
        Ok(())
    }

    async fn clear_alarm(&self, name: &str) -> HostResult<bool> {
        self.check("clear_alarm")?;
        let mut state = self.state.borrow_mut();
        let existed = state.alarms.remove(name).is_some();
        state.calls.push(HostCall::ClearAlarm {
            name: name.to_string(),
            existed,
        });
        Ok(existed)
    }

    async fn notify(&self, id: &str, title: &str, message: &str) -> HostResult<()> {
        self.check("notify")?;
        let mut state = self.state.borrow_mut();
        state.notifications.insert(id.to_string(), message.to_string());
        state.calls.push(HostCall::Notify {
            id: id.to_string(),
            title: title.to_string(),
            message: message.to_string(),
        });
        Ok(())
    }

    async fn clear_notification(&self, id: &str) -> HostResult<()> {
        self.check("clear_notification")?;
        let mut state = self.state.borrow_mut();
        state.notifications.remove(id);
        state.calls.push(HostCall::ClearNotification { id: id.to_string() });
        Ok(())
    }

    async fn storage_get(&self, key: &str) -> HostResult<Option<Value>> {
        self.check("storage_get")?;
        Ok(self.state.borrow().storage.get(key).cloned())
    }

    async fn storage_set(&self, key: &str, value: Value) -> HostResult<()> {
        self.check("storage_set")?;
        let mut state = self.state.borrow_mut();
        state.storage.insert(key.to_string(), value.clone());
        state.calls.push(HostCall::StorageSet {
            key: key.to_string(),
            value,
        });
        Ok(())
    }

    async fn set_lock_indicator(&self, locked: bool) -> HostResult<()> {
        self.check("set_lock_indicator")?;
        self.record(HostCall::LockIndicator { locked });
        Ok(())
    }

    async fn set_price_polling(&self, enabled: bool) -> HostResult<()> {
        self.check("set_price_polling")?;
        self.record(HostCall::PricePolling { enabled });
        Ok(())
    }

    async fn set_idle_detection_interval(&self, seconds: u32) -> HostResult<()> {
        self.check("set_idle_detection_interval")?;
        self.record(HostCall::IdleInterval { seconds });
        Ok(())
    }

    async fn bundled_blacklist(&self) -> HostResult<Vec<String>> {
        self.check("bundled_blacklist")?;
        Ok(self.state.borrow().blacklist.clone())
    }

    fn now_ms(&self) -> u64 {
        self.clock.get()
    }
}

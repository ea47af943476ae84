// Host platform seam
//
// Everything the background session needs from the browser goes through ExtensionHost.
// ChromeHost binds it to chrome.* on wasm32, MemoryHost records calls for tests and replay.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ChannelError, HostError};

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident($inner:ty)) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub $inner);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(
    /// Host-assigned identity of a connected port
    PortId(u64)
);
id_type!(TabId(i64));
id_type!(WindowId(i64));

/// Screen work area in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bounds {
    pub left: i32,
    pub top: i32,
    pub width: i32,
    pub height: i32,
}

/// Live window as reported by the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowInfo {
    pub id: WindowId,
    pub focused: bool,
}

/// Popup window creation request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSpec {
    pub url: String,
    pub left: i32,
    pub top: i32,
    pub width: i32,
    pub height: i32,
}

pub type HostResult<T> = Result<T, HostError>;

/// Platform services consumed by the session
///
/// The background context is single threaded, so futures are not required to be Send.
#[async_trait(?Send)]
pub trait ExtensionHost {
    /// Post a JSON message to a connected port
    async fn post_message(&self, port: PortId, message: Value) -> Result<(), ChannelError>;

    async fn get_window(&self, id: WindowId) -> HostResult<Option<WindowInfo>>;

    /// Focus a window, optionally navigating it to `url`
    async fn focus_window(&self, id: WindowId, url: Option<&str>) -> HostResult<()>;

    async fn create_window(&self, spec: WindowSpec) -> HostResult<WindowId>;

    async fn screen_bounds(&self) -> HostResult<Option<Bounds>>;

    async fn redirect_tab(&self, tab: TabId, url: &str) -> HostResult<()>;

    async fn create_alarm(&self, name: &str, fire_at_ms: u64) -> HostResult<()>;

    /// Returns whether an alarm was actually removed
    async fn clear_alarm(&self, name: &str) -> HostResult<bool>;

    /// Create or replace the notification with this id
    async fn notify(&self, id: &str, title: &str, message: &str) -> HostResult<()>;

    async fn clear_notification(&self, id: &str) -> HostResult<()>;

    async fn storage_get(&self, key: &str) -> HostResult<Option<Value>>;

    async fn storage_set(&self, key: &str, value: Value) -> HostResult<()>;

    async fn set_lock_indicator(&self, locked: bool) -> HostResult<()>;

    async fn set_price_polling(&self, enabled: bool) -> HostResult<()>;

    async fn set_idle_detection_interval(&self, seconds: u32) -> HostResult<()>;

    /// Phishing domains shipped with the extension package
    async fn bundled_blacklist(&self) -> HostResult<Vec<String>>;

    /// Milliseconds since the unix epoch
    fn now_ms(&self) -> u64;
}

//! YAKKL wallet background session.
//!
//! Everything the extension's service worker does lives behind [`Session`]: port
//! bookkeeping, dApp request correlation, popup windows, idle lockdown and the
//! phishing gate. Chrome APIs are reached only through [`ExtensionHost`], so the
//! same session runs against [`MemoryHost`] natively.

pub mod alarm;
pub mod blacklist;
pub mod config;
pub mod correlator;
pub mod error;
pub mod host;
pub mod idle;
pub mod memory_host;
pub mod popup;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod store;

#[cfg(target_arch = "wasm32")]
mod background;
#[cfg(target_arch = "wasm32")]
pub mod chrome;

pub use config::SessionConfig;
pub use error::{ProviderError, SessionError};
pub use host::{ExtensionHost, PortId, TabId, WindowId};
pub use memory_host::{HostCall, MemoryHost};
pub use session::{Session, SessionEvent, SessionHandle};

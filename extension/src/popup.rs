// Popup window orchestration
//
// At most one live window per PopupKind. A show call focuses the live window when there
// is one and creates a new window otherwise. Calls are processed one at a time by the
// session loop, so a second call always sees the handle recorded by the first.

use std::collections::HashMap;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::config::PopupConfig;
use crate::host::{Bounds, ExtensionHost, HostResult, WindowId, WindowSpec};
use crate::protocol::RequestKey;
use crate::store::{PinnedLocation, StateStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PopupKind {
    Main,
    Dapp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PopupRoute {
    /// Wallet home, shown in the main popup
    Home,
    Approve,
    Transactions,
    Sign,
    Warning,
}

impl PopupRoute {
    pub fn path(&self) -> &'static str {
        match self {
            PopupRoute::Home => "/home",
            PopupRoute::Approve => "/dapp/popups/approve",
            PopupRoute::Transactions => "/dapp/popups/transactions",
            PopupRoute::Sign => "/dapp/popups/sign",
            PopupRoute::Warning => "/dapp/popups/warning",
        }
    }

    pub fn kind(&self) -> PopupKind {
        match self {
            PopupRoute::Home => PopupKind::Main,
            _ => PopupKind::Dapp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PopupHandle {
    pub window: WindowId,
    pub kind: PopupKind,
    pub route: PopupRoute,
    pub request: Option<RequestKey>,
    pub last_focused_at_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shown {
    Created(WindowId),
    Focused(WindowId),
    /// Same route and request focused moments ago; nothing sent to the host
    Coalesced(WindowId),
}

impl Shown {
    pub fn window(&self) -> WindowId {
        match self {
            Shown::Created(w) | Shown::Focused(w) | Shown::Coalesced(w) => *w,
        }
    }
}

pub struct PopupOrchestrator {
    host: Rc<dyn ExtensionHost>,
    store: StateStore,
    config: PopupConfig,
    handles: HashMap<PopupKind, PopupHandle>,
}

impl PopupOrchestrator {
    pub fn new(host: Rc<dyn ExtensionHost>, store: StateStore, config: PopupConfig) -> Self {
        Self {
            host,
            store,
            config,
            handles: HashMap::new(),
        }
    }

    pub fn handle(&self, kind: PopupKind) -> Option<&PopupHandle> {
        self.handles.get(&kind)
    }

    pub fn url_for(&self, route: PopupRoute, request: Option<&RequestKey>) -> String {
        match request {
            Some(key) => {
                let encoded: String =
                    url::form_urlencoded::byte_serialize(key.as_str().as_bytes()).collect();
                format!("{}#{}?requestId={}", self.config.base_url, route.path(), encoded)
            }
            None => format!("{}#{}", self.config.base_url, route.path()),
        }
    }

    pub async fn show_route(
        &mut self,
        kind: PopupKind,
        route: PopupRoute,
        request: Option<&RequestKey>,
    ) -> HostResult<Shown> {
        let url = self.url_for(route, request);
        let now = self.host.now_ms();

        if let Some(handle) = self.handles.get(&kind).cloned() {
            if let Some(shown) = self.reuse(&handle, route, request, &url, now).await {
                return Ok(shown);
            }
            tracing::debug!("Popup window {} for {:?} is gone", handle.window, kind);
            self.handles.remove(&kind);
        }

        let spec = self.window_spec(url).await?;
        let window = self.host.create_window(spec).await?;
        tracing::info!("🪟 Opened {:?} popup {} on {:?}", kind, window, route);
        self.handles.insert(
            kind,
            PopupHandle {
                window,
                kind,
                route,
                request: request.cloned(),
                last_focused_at_ms: now,
            },
        );
        Ok(Shown::Created(window))
    }

    async fn reuse(
        &mut self,
        handle: &PopupHandle,
        route: PopupRoute,
        request: Option<&RequestKey>,
        url: &str,
        now: u64,
    ) -> Option<Shown> {
        match self.host.get_window(handle.window).await {
            Ok(Some(_)) => {}
            Ok(None) => return None,
            Err(e) => {
                tracing::debug!("Window lookup failed: {}", e);
                return None;
            }
        }

        let same_target = handle.route == route && handle.request.as_ref() == request;
        if same_target
            && now.saturating_sub(handle.last_focused_at_ms) < self.config.focus_debounce_ms
        {
            return Some(Shown::Coalesced(handle.window));
        }

        let navigate = (!same_target).then_some(url);
        if let Err(e) = self.host.focus_window(handle.window, navigate).await {
            tracing::debug!("Focus failed for window {}: {}", handle.window, e);
            return None;
        }
        self.handles.insert(
            handle.kind,
            PopupHandle {
                route,
                request: request.cloned(),
                last_focused_at_ms: now,
                ..handle.clone()
            },
        );
        Some(Shown::Focused(handle.window))
    }

    /// Forget the handle owning `window`; returns its kind
    pub fn window_removed(&mut self, window: WindowId) -> Option<PopupKind> {
        let kind = self
            .handles
            .values()
            .find(|h| h.window == window)
            .map(|h| h.kind)?;
        self.handles.remove(&kind);
        Some(kind)
    }

    pub fn clear(&mut self) {
        self.handles.clear();
    }

    async fn window_spec(&self, url: String) -> HostResult<WindowSpec> {
        let preferences = match self.store.preferences().await {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("Could not read popup preferences: {}", e);
                Default::default()
            }
        };
        let screen = self.host.screen_bounds().await?.unwrap_or(Bounds {
            left: 0,
            top: 0,
            width: self.config.fallback_screen_width,
            height: self.config.fallback_screen_height,
        });
        let location = if preferences.pinned {
            preferences.pinned_location
        } else {
            PinnedLocation::TopRight
        };
        Ok(place(
            url,
            self.config.width,
            self.config.height,
            location,
            screen,
        ))
    }
}

/// Position a popup at `location`, kept fully inside `screen`
pub fn place(
    url: String,
    width: i32,
    height: i32,
    location: PinnedLocation,
    screen: Bounds,
) -> WindowSpec {
    let width = width.min(screen.width).max(1);
    let height = height.min(screen.height).max(1);
    let right = screen.left + screen.width - width;
    let bottom = screen.top + screen.height - height;

    let (left, top) = match location {
        PinnedLocation::TopLeft => (screen.left, screen.top),
        PinnedLocation::TopRight => (right, screen.top),
        PinnedLocation::BottomLeft => (screen.left, bottom),
        PinnedLocation::BottomRight => (right, bottom),
        PinnedLocation::Middle => (
            screen.left + (screen.width - width) / 2,
            screen.top + (screen.height - height) / 2,
        ),
        PinnedLocation::At { x, y } => (x, y),
    };

    WindowSpec {
        url,
        left: left.clamp(screen.left, right.max(screen.left)),
        top: top.clamp(screen.top, bottom.max(screen.top)),
        width,
        height,
    }
}

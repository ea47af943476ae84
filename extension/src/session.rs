// Background session
//
// Owns every piece of background state and processes host events one at a time.
// Host callbacks only enqueue SessionEvents; Session::run is the single consumer.

use std::rc::Rc;

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::blacklist::{DomainBlacklist, NavigationVerdict};
use crate::config::SessionConfig;
use crate::correlator::{Delivery, PendingRequest, RequestCorrelator, Submission};
use crate::error::{ChannelError, ProviderError, Result, SessionError};
use crate::host::{ExtensionHost, PortId, TabId, WindowId};
use crate::idle::{IdleMachine, IdleState, IdleStatus, IdleStep};
use crate::popup::{PopupKind, PopupOrchestrator, PopupRoute};
use crate::protocol::{
    ChannelKind, DappInbound, DappRequest, Inbound, Notice, Outcome, ProviderInfo, RelayMessage,
    RequestId, RequestKey, ResponseEnvelope, UiMessage,
};
use crate::registry::{ConnectionRegistry, Registration, Unregister};
use crate::store::{LockState, Selection, StateStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallReason {
    Install,
    Update,
    ChromeUpdate,
    SharedModuleUpdate,
}

/// Everything the host can tell the background session
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    Connect {
        port: PortId,
        name: String,
        #[serde(default)]
        tab: Option<TabId>,
    },
    Disconnect {
        port: PortId,
    },
    Message {
        port: PortId,
        payload: Value,
    },
    TabRemoved {
        tab: TabId,
    },
    WindowRemoved {
        window: WindowId,
    },
    Alarm {
        name: String,
    },
    /// chrome.idle.onStateChanged
    IdleSignal {
        state: IdleState,
    },
    Activity,
    Visibility {
        hidden: bool,
    },
    PollTick,
    Navigation {
        tab: TabId,
        url: String,
    },
    Installed {
        reason: InstallReason,
    },
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("background session has stopped")]
pub struct SessionClosed;

/// Producer side of the session event queue
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionHandle {
    pub fn send(&self, event: SessionEvent) -> Result<(), SessionClosed> {
        self.tx.send(event).map_err(|_| SessionClosed)
    }
}

pub type SessionInbox = mpsc::UnboundedReceiver<SessionEvent>;

pub fn channel() -> (SessionHandle, SessionInbox) {
    let (tx, rx) = mpsc::unbounded_channel();
    (SessionHandle { tx }, rx)
}

pub struct Session {
    host: Rc<dyn ExtensionHost>,
    store: StateStore,
    registry: ConnectionRegistry,
    correlator: RequestCorrelator,
    popups: PopupOrchestrator,
    idle: IdleMachine,
    blacklist: DomainBlacklist,
    provider: ProviderInfo,
    running: bool,
}

impl Session {
    pub fn new(host: Rc<dyn ExtensionHost>, config: SessionConfig) -> Self {
        let store = StateStore::new(host.clone());
        Self {
            registry: ConnectionRegistry::new(),
            correlator: RequestCorrelator::new(config.network.default_chain_id),
            popups: PopupOrchestrator::new(host.clone(), store.clone(), config.popup),
            idle: IdleMachine::new(host.clone(), store.clone(), config.idle),
            blacklist: DomainBlacklist::new(config.blacklist),
            provider: config.provider.info(),
            store,
            host,
            running: false,
        }
    }

    /// Bring every component up. Each step runs even if an earlier one failed;
    /// the first failure is returned after all of them have been attempted.
    pub async fn init(&mut self) -> Result<()> {
        let mut first_error = None;

        match self.store.selection().await {
            Ok(selection) => {
                self.correlator.set_selection(selection);
            }
            Err(e) => init_failed(&mut first_error, "selection", e.into()),
        }
        if let Err(e) = self.init_blacklist().await {
            init_failed(&mut first_error, "blacklist", e);
        }
        if let Err(e) = self.idle.init().await {
            init_failed(&mut first_error, "idle detection", e.into());
        }
        if let Err(e) = self.host.set_lock_indicator(true).await {
            init_failed(&mut first_error, "lock indicator", e.into());
        }

        self.running = true;
        match first_error {
            None => {
                tracing::info!("🚀 YAKKL background session initialized");
                Ok(())
            }
            Some(e) => Err(e),
        }
    }

    async fn init_blacklist(&mut self) -> Result<()> {
        match self.store.blacklist().await? {
            Some(domains) => self.blacklist.load(domains),
            None => self.refresh_blacklist().await?,
        }
        Ok(())
    }

    /// Drop all per-process state. Pending requests are abandoned without delivery.
    /// A scheduled lockdown stays armed for the next worker instance.
    pub async fn teardown(&mut self) {
        for connection in self.registry.clear() {
            let orphans = self.correlator.drop_sender(connection.port);
            if !orphans.is_empty() {
                tracing::debug!(
                    "Abandoned {} request(s) from port {}",
                    orphans.len(),
                    connection.port
                );
            }
        }
        self.popups.clear();
        self.running = false;
        tracing::info!("Background session torn down");
    }

    /// Process events until the queue closes or a Shutdown arrives
    pub async fn run(mut self, mut inbox: SessionInbox) {
        if let Err(e) = self.init().await {
            tracing::warn!("Session running with degraded init: {}", e);
        }
        while let Some(event) = inbox.recv().await {
            match self.handle(event).await {
                Ok(Flow::Stop) => break,
                Ok(Flow::Continue) => {}
                Err(e) => tracing::error!("Event handling failed: {}", e),
            }
        }
        if self.running {
            self.teardown().await;
        }
    }

    pub async fn handle(&mut self, event: SessionEvent) -> Result<Flow> {
        match event {
            SessionEvent::Connect { port, name, tab } => {
                self.register(port, &name, tab).await?;
            }
            SessionEvent::Disconnect { port } => {
                self.unregister(Unregister::Port(port)).await?;
            }
            SessionEvent::Message { port, payload } => self.on_message(port, payload).await?,
            SessionEvent::TabRemoved { tab } => {
                self.blacklist.tab_closed(tab);
                self.unregister(Unregister::Tab(tab)).await?;
            }
            SessionEvent::WindowRemoved { window } => self.on_window_removed(window).await,
            SessionEvent::Alarm { name } => {
                let step = self.idle.on_alarm(&name).await;
                self.apply_idle_step(step).await;
            }
            SessionEvent::IdleSignal { state } => {
                let step = self.idle.host_signal(state).await;
                self.apply_idle_step(step).await;
            }
            SessionEvent::Activity => {
                let step = self.idle.activity().await;
                self.apply_idle_step(step).await;
            }
            SessionEvent::Visibility { hidden } => {
                let step = self.idle.visibility(hidden).await;
                self.apply_idle_step(step).await;
            }
            SessionEvent::PollTick => {
                let step = self.idle.poll().await;
                self.apply_idle_step(step).await;
            }
            SessionEvent::Navigation { tab, url } => self.on_navigation(tab, &url).await?,
            SessionEvent::Installed { reason } => {
                tracing::info!("Extension {:?}, refreshing blacklist", reason);
                self.refresh_blacklist().await?;
            }
            SessionEvent::Shutdown => {
                self.teardown().await;
                return Ok(Flow::Stop);
            }
        }
        Ok(Flow::Continue)
    }

    pub async fn register(
        &mut self,
        port: PortId,
        name: &str,
        tab: Option<TabId>,
    ) -> Result<Registration> {
        let registration = self
            .registry
            .register(port, name, tab, self.host.now_ms())?;
        if registration.is_new() && registration.connection().kind == ChannelKind::Main {
            self.host.set_lock_indicator(false).await?;
        }
        Ok(registration)
    }

    /// Remove ports; returns the pending requests they orphaned
    pub async fn unregister(&mut self, target: Unregister) -> Result<Vec<PendingRequest>> {
        let removed = self.registry.unregister(target);
        let mut orphans = Vec::new();
        let mut main_left = false;
        for connection in &removed {
            main_left |= connection.kind == ChannelKind::Main;
            orphans.extend(self.correlator.drop_sender(connection.port));
        }
        if !orphans.is_empty() {
            tracing::info!("Cancelled {} orphaned request(s)", orphans.len());
        }
        if main_left && self.registry.count_kind(ChannelKind::Main) == 0 {
            self.host.set_lock_indicator(true).await?;
        }
        Ok(orphans)
    }

    async fn on_message(&mut self, port: PortId, payload: Value) -> Result<()> {
        let kind = self
            .registry
            .get(port)
            .map(|c| c.kind)
            .ok_or(SessionError::UnknownPort(port))?;

        let inbound = match Inbound::parse(kind, payload.clone()) {
            Ok(inbound) => inbound,
            Err(err) => {
                if kind.is_dapp_facing() {
                    self.reply_malformed(port, &payload, &err).await;
                }
                return Err(err);
            }
        };
        tracing::debug!("📨 {} message on port {}", kind, port);

        match inbound {
            Inbound::Dapp(DappInbound::Request(request)) => self.submit(request, port).await,
            Inbound::Dapp(DappInbound::RequestProvider) => {
                let notice = Notice::AnnounceProvider {
                    info: self.provider.clone(),
                };
                self.post(port, notice.to_value()).await;
            }
            Inbound::Relay(message) => self.on_relay(port, message).await,
            Inbound::Ui(message) => self.on_ui(message).await?,
        }
        Ok(())
    }

    /// Best effort: a malformed request that still carries an id gets a -1 response
    async fn reply_malformed(&mut self, port: PortId, payload: &Value, err: &SessionError) {
        let Some(id) = payload
            .get("id")
            .and_then(|id| serde_json::from_value::<RequestId>(id.clone()).ok())
        else {
            return;
        };
        let method = payload
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let envelope =
            ResponseEnvelope::new(id, method, Outcome::Error(ProviderError::internal(err)));
        self.deliver(Delivery { port, envelope }).await;
    }

    pub async fn submit(&mut self, request: DappRequest, port: PortId) {
        let now = self.host.now_ms();
        match self.correlator.submit(request, port, now) {
            Submission::Reply(delivery) => self.deliver(delivery).await,
            Submission::Approval { key, route } => self.show_for(key, route).await,
            Submission::Setup { key, warn } => {
                if warn {
                    tracing::info!("No account/network selected; warning for request {}", key);
                    self.show_for(key, PopupRoute::Warning).await;
                } else {
                    tracing::debug!("Request {} still waiting for setup", key);
                }
            }
        }
    }

    async fn show_for(&mut self, key: RequestKey, route: PopupRoute) {
        let shown = self
            .popups
            .show_route(route.kind(), route, Some(&key))
            .await;
        if let Err(e) = shown {
            tracing::error!("Could not open {:?} popup for {}: {}", route, key, e);
            if let Some(delivery) = self.correlator.reject(&key, ProviderError::internal(&e)) {
                self.deliver(delivery).await;
            }
        }
    }

    async fn on_relay(&mut self, port: PortId, message: RelayMessage) {
        match message {
            RelayMessage::GetParams { request } => {
                let notice = match self.correlator.fetch(&request) {
                    Some(pending) => Notice::Params {
                        request_id: request,
                        data: pending.request.clone(),
                    },
                    None => Notice::ParamsMissing {
                        request_id: request,
                    },
                };
                self.post(port, notice.to_value()).await;
            }
            RelayMessage::Error { request, error } => {
                if let Some(delivery) = self.correlator.reject(&request, error) {
                    self.deliver(delivery).await;
                }
            }
            RelayMessage::Response { request, result } => {
                if let Some(delivery) = self.correlator.resolve(&request, result) {
                    self.deliver(delivery).await;
                }
            }
        }
    }

    async fn on_ui(&mut self, message: UiMessage) -> Result<()> {
        match message {
            UiMessage::Activity => {
                let step = self.idle.activity().await;
                self.apply_idle_step(step).await;
            }
            UiMessage::Visibility { hidden } => {
                let step = self.idle.visibility(hidden).await;
                self.apply_idle_step(step).await;
            }
            UiMessage::SelectionChanged { account, chain_id } => {
                let selection = Selection { account, chain_id };
                self.store.set_selection(&selection).await?;
                for (key, route) in self.correlator.set_selection(selection) {
                    self.show_for(key, route).await;
                }
            }
            UiMessage::Unlocked => {
                self.store.set_lock_state(&LockState::default()).await?;
                let step = self.idle.activity().await;
                self.apply_idle_step(step).await;
            }
            UiMessage::ContinueToSite { token } => {
                match self.blacklist.redeem(&token, self.host.now_ms()) {
                    Some((tab, url)) => self.host.redirect_tab(tab, &url).await?,
                    None => tracing::warn!("Ignoring unknown or expired override token"),
                }
            }
            UiMessage::ShowWallet => {
                self.popups
                    .show_route(PopupKind::Main, PopupRoute::Home, None)
                    .await?;
            }
        }
        Ok(())
    }

    async fn on_window_removed(&mut self, window: WindowId) {
        if self.popups.window_removed(window) != Some(PopupKind::Dapp) {
            return;
        }
        let deliveries = self.correlator.reject_waiting(ProviderError::user_rejected());
        if !deliveries.is_empty() {
            tracing::info!(
                "dApp popup closed, rejecting {} open request(s)",
                deliveries.len()
            );
        }
        for delivery in deliveries {
            self.deliver(delivery).await;
        }
    }

    async fn on_navigation(&mut self, tab: TabId, url: &str) -> Result<()> {
        let now = self.host.now_ms();
        if let NavigationVerdict::Flagged { redirect, .. } =
            self.blacklist.check_navigation(tab, url, now)
        {
            self.host.redirect_tab(tab, &redirect).await?;
        }
        Ok(())
    }

    async fn refresh_blacklist(&mut self) -> Result<()> {
        let domains = self.host.bundled_blacklist().await?;
        self.store.set_blacklist(&domains).await?;
        self.blacklist.load(domains);
        Ok(())
    }

    async fn apply_idle_step(&mut self, step: IdleStep) {
        if let IdleStep::LockedDown { reason } = step {
            let notice = Notice::Lockdown { reason }.to_value();
            for port in self.registry.ui_ports() {
                self.post(port, notice.clone()).await;
            }
        }
    }

    async fn deliver(&mut self, delivery: Delivery) {
        self.post(delivery.port, delivery.envelope.to_value()).await;
    }

    /// Post to a port if it is still registered; failures are logged only
    async fn post(&mut self, port: PortId, message: Value) {
        if !self.registry.is_live(port) {
            tracing::warn!("Dropping response: {}", ChannelError { port });
            return;
        }
        // A closed port is followed by its own Disconnect event
        if let Err(e) = self.host.post_message(port, message).await {
            tracing::warn!("Dropping response: {}", e);
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn correlator(&self) -> &RequestCorrelator {
        &self.correlator
    }

    pub fn popups(&self) -> &PopupOrchestrator {
        &self.popups
    }

    pub fn blacklist(&self) -> &DomainBlacklist {
        &self.blacklist
    }

    pub fn idle_status(&self) -> IdleStatus {
        self.idle.status()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }
}

fn init_failed(first_error: &mut Option<SessionError>, step: &str, err: SessionError) {
    tracing::error!("Session init: {} failed: {}", step, err);
    first_error.get_or_insert(err);
}

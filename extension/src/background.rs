// Background service worker entry points
// The JavaScript glue registers chrome.* listeners and forwards each event here.

use std::cell::RefCell;
use std::rc::Rc;

use serde_json::Value;
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;

use crate::chrome::{sender_tab, ChromeHost, Port};
use crate::config::SessionConfig;
use crate::host::{PortId, TabId, WindowId};
use crate::session::{self, Session, SessionEvent, SessionHandle};

struct Background {
    host: Rc<ChromeHost>,
    events: SessionHandle,
}

thread_local! {
    static BACKGROUND: RefCell<Option<Background>> = const { RefCell::new(None) };
}

fn dispatch(event: SessionEvent) -> Result<(), JsValue> {
    BACKGROUND.with(|bg| match bg.borrow().as_ref() {
        Some(bg) => bg
            .events
            .send(event)
            .map_err(|e| JsValue::from_str(&e.to_string())),
        None => Err(JsValue::from_str("background session not initialized")),
    })
}

/// Start the session. `config_toml` overrides the built-in defaults.
#[wasm_bindgen]
pub fn init_background(config_toml: Option<String>) -> Result<(), JsValue> {
    wasm_logger::init(wasm_logger::Config::default());

    let config = match config_toml {
        Some(content) => SessionConfig::from_toml_str(&content)
            .map_err(|e| JsValue::from_str(&format!("{e:#}")))?,
        None => SessionConfig::default(),
    };

    let host = Rc::new(ChromeHost::new());
    let (events, inbox) = session::channel();
    let session = Session::new(host.clone(), config);
    wasm_bindgen_futures::spawn_local(session.run(inbox));

    BACKGROUND.with(|bg| *bg.borrow_mut() = Some(Background { host, events }));
    log::info!("🚀 YAKKL background service initialized (Rust core)");
    Ok(())
}

/// chrome.runtime.onConnect
#[wasm_bindgen]
pub fn on_connect(port: Port) -> Result<(), JsValue> {
    let adopted = BACKGROUND.with(|bg| bg.borrow().as_ref().map(|bg| bg.host.adopt(&port)));
    let Some((id, is_new)) = adopted else {
        return Err(JsValue::from_str("background session not initialized"));
    };

    dispatch(SessionEvent::Connect {
        port: id,
        name: port.name(),
        tab: sender_tab(&port),
    })?;

    if is_new {
        attach_listeners(&port, id);
    }
    Ok(())
}

fn attach_listeners(port: &Port, id: PortId) {
    let on_message = Closure::<dyn FnMut(JsValue)>::new(move |message: JsValue| {
        let payload = serde_wasm_bindgen::from_value::<Value>(message).unwrap_or(Value::Null);
        if let Err(e) = dispatch(SessionEvent::Message { port: id, payload }) {
            log::warn!("Dropped message from port {}: {:?}", id, e);
        }
    });
    port.on_message()
        .add_listener(on_message.as_ref().unchecked_ref());
    on_message.forget();

    let on_disconnect = Closure::<dyn FnMut()>::new(move || {
        BACKGROUND.with(|bg| {
            if let Some(bg) = bg.borrow().as_ref() {
                bg.host.forget(id);
            }
        });
        if let Err(e) = dispatch(SessionEvent::Disconnect { port: id }) {
            log::warn!("Dropped disconnect for port {}: {:?}", id, e);
        }
    });
    port.on_disconnect()
        .add_listener(on_disconnect.as_ref().unchecked_ref());
    on_disconnect.forget();
}

/// chrome.alarms.onAlarm
#[wasm_bindgen]
pub fn on_alarm(name: String) -> Result<(), JsValue> {
    dispatch(SessionEvent::Alarm { name })
}

/// chrome.idle.onStateChanged ("active" | "idle" | "locked")
#[wasm_bindgen]
pub fn on_idle_state(state: String) -> Result<(), JsValue> {
    let state = serde_json::from_value(Value::String(state))
        .map_err(|e| JsValue::from_str(&e.to_string()))?;
    dispatch(SessionEvent::IdleSignal { state })
}

/// Forwarded user input, for the app-wide idle strategy
#[wasm_bindgen]
pub fn on_activity() -> Result<(), JsValue> {
    dispatch(SessionEvent::Activity)
}

#[wasm_bindgen]
pub fn on_visibility(hidden: bool) -> Result<(), JsValue> {
    dispatch(SessionEvent::Visibility { hidden })
}

/// Periodic timer tick for the app-wide idle strategy
#[wasm_bindgen]
pub fn poll_tick() -> Result<(), JsValue> {
    dispatch(SessionEvent::PollTick)
}

/// chrome.tabs.onRemoved
#[wasm_bindgen]
pub fn on_tab_removed(tab: f64) -> Result<(), JsValue> {
    dispatch(SessionEvent::TabRemoved {
        tab: TabId(tab as i64),
    })
}

/// chrome.windows.onRemoved
#[wasm_bindgen]
pub fn on_window_removed(window: f64) -> Result<(), JsValue> {
    dispatch(SessionEvent::WindowRemoved {
        window: WindowId(window as i64),
    })
}

/// chrome.webNavigation.onBeforeNavigate (top frame only)
#[wasm_bindgen]
pub fn on_navigation(tab: f64, url: String) -> Result<(), JsValue> {
    dispatch(SessionEvent::Navigation {
        tab: TabId(tab as i64),
        url,
    })
}

/// chrome.runtime.onInstalled
#[wasm_bindgen]
pub fn on_installed(reason: String) -> Result<(), JsValue> {
    let reason = serde_json::from_value(Value::String(reason))
        .map_err(|e| JsValue::from_str(&e.to_string()))?;
    dispatch(SessionEvent::Installed { reason })
}

/// chrome.runtime.onSuspend
#[wasm_bindgen]
pub fn on_suspend() -> Result<(), JsValue> {
    dispatch(SessionEvent::Shutdown)
}

// chrome.* bindings for the background service worker
// JavaScript only forwards events; every API call below goes through ChromeHost.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;
use wasm_bindgen_futures::JsFuture;

use crate::error::{ChannelError, HostError};
use crate::host::{
    Bounds, ExtensionHost, HostResult, PortId, TabId, WindowId, WindowInfo, WindowSpec,
};

#[wasm_bindgen]
extern "C" {
    /// chrome.runtime.Port
    #[derive(Clone)]
    pub type Port;

    #[wasm_bindgen(method, getter)]
    pub fn name(this: &Port) -> String;

    #[wasm_bindgen(method, getter)]
    pub fn sender(this: &Port) -> JsValue;

    #[wasm_bindgen(method, getter, js_name = onMessage)]
    pub fn on_message(this: &Port) -> ChromeEvent;

    #[wasm_bindgen(method, getter, js_name = onDisconnect)]
    pub fn on_disconnect(this: &Port) -> ChromeEvent;

    #[wasm_bindgen(method, catch, js_name = postMessage)]
    fn post(this: &Port, message: &JsValue) -> Result<(), JsValue>;

    pub type ChromeEvent;

    #[wasm_bindgen(method, js_name = addListener)]
    pub fn add_listener(this: &ChromeEvent, callback: &js_sys::Function);

    type FetchResponse;

    #[wasm_bindgen(method, catch)]
    fn json(this: &FetchResponse) -> Result<js_sys::Promise, JsValue>;
}

#[wasm_bindgen]
extern "C" {
    #[wasm_bindgen(catch, js_namespace = ["chrome", "storage", "local"], js_name = get)]
    fn storage_local_get(keys: JsValue) -> Result<js_sys::Promise, JsValue>;

    #[wasm_bindgen(catch, js_namespace = ["chrome", "storage", "local"], js_name = set)]
    fn storage_local_set(items: JsValue) -> Result<js_sys::Promise, JsValue>;

    #[wasm_bindgen(catch, js_namespace = ["chrome", "windows"], js_name = get)]
    fn windows_get(id: f64) -> Result<js_sys::Promise, JsValue>;

    #[wasm_bindgen(catch, js_namespace = ["chrome", "windows"], js_name = update)]
    fn windows_update(id: f64, info: JsValue) -> Result<js_sys::Promise, JsValue>;

    #[wasm_bindgen(catch, js_namespace = ["chrome", "windows"], js_name = create)]
    fn windows_create(info: JsValue) -> Result<js_sys::Promise, JsValue>;

    #[wasm_bindgen(catch, js_namespace = ["chrome", "system", "display"], js_name = getInfo)]
    fn display_get_info() -> Result<js_sys::Promise, JsValue>;

    #[wasm_bindgen(catch, js_namespace = ["chrome", "tabs"], js_name = update)]
    fn tabs_update(id: f64, props: JsValue) -> Result<js_sys::Promise, JsValue>;

    #[wasm_bindgen(catch, js_namespace = ["chrome", "alarms"], js_name = create)]
    fn alarms_create(name: &str, info: JsValue) -> Result<js_sys::Promise, JsValue>;

    #[wasm_bindgen(catch, js_namespace = ["chrome", "alarms"], js_name = clear)]
    fn alarms_clear(name: &str) -> Result<js_sys::Promise, JsValue>;

    #[wasm_bindgen(catch, js_namespace = ["chrome", "notifications"], js_name = create)]
    fn notifications_create(id: &str, options: JsValue) -> Result<js_sys::Promise, JsValue>;

    #[wasm_bindgen(catch, js_namespace = ["chrome", "notifications"], js_name = clear)]
    fn notifications_clear(id: &str) -> Result<js_sys::Promise, JsValue>;

    #[wasm_bindgen(catch, js_namespace = ["chrome", "action"], js_name = setIcon)]
    fn action_set_icon(details: JsValue) -> Result<js_sys::Promise, JsValue>;

    #[wasm_bindgen(catch, js_namespace = ["chrome", "idle"], js_name = setDetectionInterval)]
    fn idle_set_detection_interval(seconds: u32) -> Result<(), JsValue>;

    #[wasm_bindgen(js_namespace = ["chrome", "runtime"], js_name = getURL)]
    fn runtime_get_url(path: &str) -> String;

    #[wasm_bindgen(catch, js_namespace = ["chrome", "runtime"], js_name = sendMessage)]
    fn runtime_send_message(message: JsValue) -> Result<js_sys::Promise, JsValue>;

    #[wasm_bindgen(catch, js_name = fetch)]
    fn fetch_url(url: &str) -> Result<js_sys::Promise, JsValue>;
}

const BUNDLED_BLACKLIST_PATH: &str = "data/blacklist.json";
const LOCKED_ICON: &str = "images/logo-locked-32.png";
const UNLOCKED_ICON: &str = "images/logo32.png";

fn to_js<T: Serialize + ?Sized>(value: &T) -> Result<JsValue, serde_wasm_bindgen::Error> {
    value.serialize(&serde_wasm_bindgen::Serializer::json_compatible())
}

fn js_error(call: &'static str, err: JsValue) -> HostError {
    let message = err
        .as_string()
        .or_else(|| {
            js_sys::Reflect::get(&err, &"message".into())
                .ok()
                .and_then(|m| m.as_string())
        })
        .unwrap_or_else(|| format!("{err:?}"));
    HostError::new(call, message)
}

/// Await a chrome.* promise, mapping both sync throws and rejections to HostError
async fn settle(
    call: &'static str,
    promise: Result<js_sys::Promise, JsValue>,
) -> HostResult<JsValue> {
    let promise = promise.map_err(|e| js_error(call, e))?;
    JsFuture::from(promise).await.map_err(|e| js_error(call, e))
}

fn encode(call: &'static str, value: &impl Serialize) -> HostResult<JsValue> {
    to_js(value).map_err(|e| HostError::new(call, e.to_string()))
}

/// ExtensionHost over the real browser APIs
#[derive(Default)]
pub struct ChromeHost {
    ports: RefCell<HashMap<PortId, Port>>,
    next_port: Cell<u64>,
}

impl ChromeHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign an id to a port object; returns false if the same object was adopted before
    pub fn adopt(&self, port: &Port) -> (PortId, bool) {
        let ports = self.ports.borrow();
        if let Some((id, _)) = ports
            .iter()
            .find(|(_, known)| js_sys::Object::is(known.as_ref(), port.as_ref()))
        {
            return (*id, false);
        }
        drop(ports);

        let id = PortId(self.next_port.get() + 1);
        self.next_port.set(id.0);
        self.ports.borrow_mut().insert(id, port.clone());
        (id, true)
    }

    pub fn forget(&self, port: PortId) {
        self.ports.borrow_mut().remove(&port);
    }
}

/// Tab that opened a port, if it came from a content script
pub fn sender_tab(port: &Port) -> Option<TabId> {
    let tab = js_sys::Reflect::get(&port.sender(), &"tab".into()).ok()?;
    let id = js_sys::Reflect::get(&tab, &"id".into()).ok()?.as_f64()?;
    Some(TabId(id as i64))
}

#[async_trait(?Send)]
impl ExtensionHost for ChromeHost {
    async fn post_message(&self, port: PortId, message: Value) -> Result<(), ChannelError> {
        let target = self.ports.borrow().get(&port).cloned();
        let Some(target) = target else {
            return Err(ChannelError { port });
        };
        let message = to_js(&message).map_err(|_| ChannelError { port })?;
        target.post(&message).map_err(|e| {
            log::debug!("postMessage on port {} failed: {:?}", port, e);
            self.forget(port);
            ChannelError { port }
        })
    }

    async fn get_window(&self, id: WindowId) -> HostResult<Option<WindowInfo>> {
        // chrome.windows.get rejects for windows that no longer exist
        let Ok(window) = settle("get_window", windows_get(id.0 as f64)).await else {
            return Ok(None);
        };
        let focused = js_sys::Reflect::get(&window, &"focused".into())
            .ok()
            .and_then(|f| f.as_bool())
            .unwrap_or(false);
        Ok(Some(WindowInfo { id, focused }))
    }

    async fn focus_window(&self, id: WindowId, url: Option<&str>) -> HostResult<()> {
        settle(
            "focus_window",
            windows_update(id.0 as f64, encode("focus_window", &json!({ "focused": true }))?),
        )
        .await?;
        if let Some(url) = url {
            // Navigate the popup's active tab
            let tabs = settle(
                "focus_window",
                windows_get_populated(id.0 as f64),
            )
            .await?;
            let tab_id = js_sys::Reflect::get(&tabs, &"tabs".into())
                .ok()
                .and_then(|tabs| tabs.dyn_into::<js_sys::Array>().ok())
                .and_then(|tabs| js_sys::Reflect::get(&tabs.get(0), &"id".into()).ok())
                .and_then(|id| id.as_f64());
            if let Some(tab_id) = tab_id {
                settle(
                    "focus_window",
                    tabs_update(tab_id, encode("focus_window", &json!({ "url": url }))?),
                )
                .await?;
            }
        }
        Ok(())
    }

    async fn create_window(&self, spec: WindowSpec) -> HostResult<WindowId> {
        let info = json!({
            "url": spec.url,
            "type": "popup",
            "left": spec.left,
            "top": spec.top,
            "width": spec.width,
            "height": spec.height,
            "focused": true,
        });
        let window = settle("create_window", windows_create(encode("create_window", &info)?)).await?;
        js_sys::Reflect::get(&window, &"id".into())
            .ok()
            .and_then(|id| id.as_f64())
            .map(|id| WindowId(id as i64))
            .ok_or_else(|| HostError::new("create_window", "created window has no id"))
    }

    async fn screen_bounds(&self) -> HostResult<Option<Bounds>> {
        let Ok(displays) = settle("screen_bounds", display_get_info()).await else {
            return Ok(None);
        };
        let primary = js_sys::Array::from(&displays).get(0);
        let area = js_sys::Reflect::get(&primary, &"workArea".into())
            .map_err(|e| js_error("screen_bounds", e))?;
        Ok(serde_wasm_bindgen::from_value::<Bounds>(area).ok())
    }

    async fn redirect_tab(&self, tab: TabId, url: &str) -> HostResult<()> {
        settle(
            "redirect_tab",
            tabs_update(tab.0 as f64, encode("redirect_tab", &json!({ "url": url }))?),
        )
        .await?;
        Ok(())
    }

    async fn create_alarm(&self, name: &str, fire_at_ms: u64) -> HostResult<()> {
        let info = encode("create_alarm", &json!({ "when": fire_at_ms as f64 }))?;
        settle("create_alarm", alarms_create(name, info)).await?;
        Ok(())
    }

    async fn clear_alarm(&self, name: &str) -> HostResult<bool> {
        let cleared = settle("clear_alarm", alarms_clear(name)).await?;
        Ok(cleared.as_bool().unwrap_or(false))
    }

    async fn notify(&self, id: &str, title: &str, message: &str) -> HostResult<()> {
        let options = json!({
            "type": "basic",
            "iconUrl": runtime_get_url("images/logo48.png"),
            "title": title,
            "message": message,
            "priority": 2,
            "requireInteraction": true,
        });
        settle("notify", notifications_create(id, encode("notify", &options)?)).await?;
        Ok(())
    }

    async fn clear_notification(&self, id: &str) -> HostResult<()> {
        settle("clear_notification", notifications_clear(id)).await?;
        Ok(())
    }

    async fn storage_get(&self, key: &str) -> HostResult<Option<Value>> {
        let keys = js_sys::Array::new();
        keys.push(&key.into());
        let result = settle("storage_get", storage_local_get(keys.into())).await?;
        let value =
            js_sys::Reflect::get(&result, &key.into()).map_err(|e| js_error("storage_get", e))?;
        if value.is_undefined() || value.is_null() {
            return Ok(None);
        }
        serde_wasm_bindgen::from_value(value)
            .map(Some)
            .map_err(|e| HostError::new("storage_get", e.to_string()))
    }

    async fn storage_set(&self, key: &str, value: Value) -> HostResult<()> {
        let items = encode("storage_set", &json!({ key: value }))?;
        settle("storage_set", storage_local_set(items)).await?;
        Ok(())
    }

    async fn set_lock_indicator(&self, locked: bool) -> HostResult<()> {
        let path = if locked { LOCKED_ICON } else { UNLOCKED_ICON };
        let details = encode("set_lock_indicator", &json!({ "path": path }))?;
        settle("set_lock_indicator", action_set_icon(details)).await?;
        Ok(())
    }

    async fn set_price_polling(&self, enabled: bool) -> HostResult<()> {
        let message = encode(
            "set_price_polling",
            &json!({ "type": "price_polling", "enabled": enabled }),
        )?;
        // No receiver while every wallet page is closed; that is not a failure
        if let Err(e) = settle("set_price_polling", runtime_send_message(message)).await {
            log::debug!("{}", e);
        }
        Ok(())
    }

    async fn set_idle_detection_interval(&self, seconds: u32) -> HostResult<()> {
        idle_set_detection_interval(seconds).map_err(|e| js_error("set_idle_detection_interval", e))
    }

    async fn bundled_blacklist(&self) -> HostResult<Vec<String>> {
        let url = runtime_get_url(BUNDLED_BLACKLIST_PATH);
        let response: FetchResponse = settle("bundled_blacklist", fetch_url(&url))
            .await?
            .unchecked_into();
        let body = settle("bundled_blacklist", response.json()).await?;
        serde_wasm_bindgen::from_value(body)
            .map_err(|e| HostError::new("bundled_blacklist", e.to_string()))
    }

    fn now_ms(&self) -> u64 {
        js_sys::Date::now() as u64
    }
}

#[wasm_bindgen]
extern "C" {
    #[wasm_bindgen(catch, js_namespace = ["chrome", "windows"], js_name = get)]
    fn windows_get_with(id: f64, query: JsValue) -> Result<js_sys::Promise, JsValue>;
}

fn windows_get_populated(id: f64) -> Result<js_sys::Promise, JsValue> {
    let query = to_js(&json!({ "populate": true })).map_err(JsValue::from)?;
    windows_get_with(id, query)
}

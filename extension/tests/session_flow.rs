// End-to-end flows through the background session over the in-memory host

use std::rc::Rc;

use serde_json::{json, Value};
use yakkl_extension::config::{FailurePolicy, IdleConfig, IdleStrategy};
use yakkl_extension::idle::{IdleState, LOCKED_NOTIFICATION};
use yakkl_extension::popup::PopupKind;
use yakkl_extension::session::{self, Flow};
use yakkl_extension::store::{LOCK_STATE_KEY, PENDING_LOCK_KEY, SELECTION_KEY};
use yakkl_extension::{
    HostCall, MemoryHost, PortId, Session, SessionConfig, SessionError, SessionEvent, TabId,
    WindowId,
};

const LOCK_ALARM: &str = "yakkl-lock-alarm";

async fn start(host: &Rc<MemoryHost>, config: SessionConfig) -> Session {
    let mut session = Session::new(host.clone(), config);
    session.init().await.unwrap();
    host.take_calls();
    session
}

async fn connect(session: &mut Session, port: u64, name: &str, tab: Option<i64>) {
    session
        .handle(SessionEvent::Connect {
            port: PortId(port),
            name: name.to_string(),
            tab: tab.map(TabId),
        })
        .await
        .unwrap();
}

async fn send(session: &mut Session, port: u64, payload: Value) -> Result<Flow, SessionError> {
    session
        .handle(SessionEvent::Message {
            port: PortId(port),
            payload,
        })
        .await
}

/// Main UI on port 1 with an account and mainnet selected
async fn ready_session(host: &Rc<MemoryHost>) -> Session {
    let mut session = start(host, SessionConfig::default()).await;
    connect(&mut session, 1, "main", None).await;
    send(
        &mut session,
        1,
        json!({"type": "selection_changed", "account": "0xabc", "chainId": 1}),
    )
    .await
    .unwrap();
    host.take_calls();
    session
}

fn created_windows(host: &MemoryHost) -> Vec<String> {
    host.calls()
        .into_iter()
        .filter_map(|call| match call {
            HostCall::CreateWindow { spec, .. } => Some(spec.url),
            _ => None,
        })
        .collect()
}

fn idle_config(lock_delay_ms: u64) -> SessionConfig {
    SessionConfig {
        idle: IdleConfig {
            strategy: IdleStrategy::System,
            threshold_ms: 180_000,
            lock_delay_ms,
            ..IdleConfig::default()
        },
        ..SessionConfig::default()
    }
}

#[tokio::test]
async fn test_chain_id_answers_without_account() {
    let host = Rc::new(MemoryHost::new());
    let mut session = start(&host, SessionConfig::default()).await;
    connect(&mut session, 2, "external", Some(7)).await;

    send(&mut session, 2, json!({"id": "7", "method": "chainId"}))
        .await
        .unwrap();

    assert_eq!(
        host.messages_to(PortId(2)),
        vec![json!({"id": "7", "method": "chainId", "type": "RESPONSE", "result": "1"})]
    );
    assert!(created_windows(&host).is_empty());
    assert_eq!(session.correlator().open_count(), 0);
}

#[tokio::test]
async fn test_immediate_network_methods() {
    let host = Rc::new(MemoryHost::new());
    let mut session = ready_session(&host).await;
    connect(&mut session, 2, "external", Some(7)).await;

    send(&mut session, 2, json!({"id": 1, "method": "eth_chainId"}))
        .await
        .unwrap();
    send(&mut session, 2, json!({"id": 2, "method": "net_version"}))
        .await
        .unwrap();
    send(&mut session, 2, json!({"id": 3, "method": "wallet_getCurrentNetwork"}))
        .await
        .unwrap();

    let results: Vec<Value> = host
        .messages_to(PortId(2))
        .into_iter()
        .map(|m| m["result"].clone())
        .collect();
    assert_eq!(
        results,
        vec![
            json!("0x1"),
            json!("1"),
            json!({"chainId": "0x1", "name": "mainnet"})
        ]
    );
}

#[tokio::test]
async fn test_transaction_approval_round_trip() {
    let host = Rc::new(MemoryHost::new());
    let mut session = ready_session(&host).await;
    connect(&mut session, 2, "external", Some(3)).await;

    let params = json!([{"from": "0xabc", "to": "0xdef", "value": "0x1"}]);
    send(
        &mut session,
        2,
        json!({"id": "3", "method": "sendTransaction", "params": params}),
    )
    .await
    .unwrap();

    assert_eq!(
        created_windows(&host),
        vec!["index.html#/dapp/popups/transactions?requestId=3".to_string()]
    );
    assert!(host.messages_to(PortId(2)).is_empty());

    connect(&mut session, 9, "dappRelay", None).await;
    send(&mut session, 9, json!({"type": "get_params", "requestId": "3"}))
        .await
        .unwrap();
    assert_eq!(
        host.messages_to(PortId(9)),
        vec![json!({
            "type": "params",
            "requestId": "3",
            "data": {"id": "3", "method": "sendTransaction", "params": params},
        })]
    );

    let error = json!({"code": 4001, "message": "User denied transaction signature."});
    send(
        &mut session,
        9,
        json!({"type": "error", "requestId": "3", "error": error}),
    )
    .await
    .unwrap();

    assert_eq!(
        host.messages_to(PortId(2)),
        vec![json!({"id": "3", "method": "sendTransaction", "type": "RESPONSE", "error": error})]
    );
    assert_eq!(session.correlator().open_count(), 0);
}

#[tokio::test]
async fn test_activity_cancels_scheduled_lock() {
    let host = Rc::new(MemoryHost::new());
    let mut session = start(&host, idle_config(30_000)).await;
    connect(&mut session, 1, "main", None).await;

    session
        .handle(SessionEvent::IdleSignal {
            state: IdleState::Idle,
        })
        .await
        .unwrap();
    assert_eq!(host.alarm(LOCK_ALARM), Some(30_000));

    host.set_now(15_000);
    session.handle(SessionEvent::Activity).await.unwrap();
    assert_eq!(host.alarm(LOCK_ALARM), None);
    assert_eq!(session.idle_status().state, IdleState::Active);

    host.set_now(30_000);
    session
        .handle(SessionEvent::Alarm {
            name: LOCK_ALARM.to_string(),
        })
        .await
        .unwrap();
    assert_eq!(session.idle_status().state, IdleState::Active);
    assert_eq!(host.stored(LOCK_STATE_KEY), None);
    assert_eq!(host.notification(LOCKED_NOTIFICATION), None);
    assert!(host.messages_to(PortId(1)).is_empty());
}

#[tokio::test]
async fn test_lock_alarm_locks_and_broadcasts() {
    let host = Rc::new(MemoryHost::new());
    let mut session = start(&host, idle_config(30_000)).await;
    connect(&mut session, 1, "main", None).await;
    connect(&mut session, 2, "internal", None).await;
    connect(&mut session, 3, "external", Some(5)).await;

    session
        .handle(SessionEvent::IdleSignal {
            state: IdleState::Idle,
        })
        .await
        .unwrap();
    host.set_now(30_000);
    session
        .handle(SessionEvent::Alarm {
            name: LOCK_ALARM.to_string(),
        })
        .await
        .unwrap();

    let lockdown = json!({"type": "lockdown", "reason": "idle"});
    assert_eq!(host.messages_to(PortId(1)), vec![lockdown.clone()]);
    assert_eq!(host.messages_to(PortId(2)), vec![lockdown]);
    assert!(host.messages_to(PortId(3)).is_empty());
    assert_eq!(
        host.stored(LOCK_STATE_KEY),
        Some(json!({"locked": true, "reason": "idle"}))
    );
    assert_eq!(session.idle_status().state, IdleState::Locked);
}

#[tokio::test]
async fn test_zero_delay_locks_without_alarm() {
    let host = Rc::new(MemoryHost::new());
    let mut session = start(&host, idle_config(0)).await;
    connect(&mut session, 1, "main", None).await;

    session
        .handle(SessionEvent::IdleSignal {
            state: IdleState::Idle,
        })
        .await
        .unwrap();

    assert_eq!(
        host.count(|c| matches!(c, HostCall::CreateAlarm { .. })),
        0
    );
    assert_eq!(session.idle_status().state, IdleState::Locked);
    assert_eq!(
        host.messages_to(PortId(1)),
        vec![json!({"type": "lockdown", "reason": "idle"})]
    );
}

#[tokio::test]
async fn test_one_alarm_per_idle_entry() {
    let host = Rc::new(MemoryHost::new());
    let mut session = start(&host, idle_config(30_000)).await;

    for round in 0..3u64 {
        host.set_now(round * 100_000);
        session
            .handle(SessionEvent::IdleSignal {
                state: IdleState::Idle,
            })
            .await
            .unwrap();
        // repeated idle signals within one entry schedule nothing new
        session
            .handle(SessionEvent::IdleSignal {
                state: IdleState::Idle,
            })
            .await
            .unwrap();
        session
            .handle(SessionEvent::IdleSignal {
                state: IdleState::Active,
            })
            .await
            .unwrap();
    }

    let created = host.count(|c| matches!(c, HostCall::CreateAlarm { .. }));
    let cleared = host.count(|c| {
        matches!(c, HostCall::ClearAlarm { name, existed: true } if name == LOCK_ALARM)
    });
    assert_eq!(created, 3);
    assert_eq!(cleared, 3);
    assert_eq!(host.alarm(LOCK_ALARM), None);
}

#[tokio::test]
async fn test_fail_closed_locks_on_transition_failure() {
    let host = Rc::new(MemoryHost::new());
    let mut config = idle_config(30_000);
    config.idle.failure_policy = FailurePolicy::FailClosed;
    let mut session = start(&host, config).await;
    connect(&mut session, 1, "main", None).await;

    host.fail_on("create_alarm");
    session
        .handle(SessionEvent::IdleSignal {
            state: IdleState::Idle,
        })
        .await
        .unwrap();

    assert_eq!(session.idle_status().state, IdleState::Locked);
    assert_eq!(
        host.messages_to(PortId(1)),
        vec![json!({"type": "lockdown", "reason": "idle-transition-failure"})]
    );
}

#[tokio::test]
async fn test_live_count_tracks_connects_and_disconnects() {
    let host = Rc::new(MemoryHost::new());
    let mut session = start(&host, SessionConfig::default()).await;

    connect(&mut session, 1, "external", Some(1)).await;
    connect(&mut session, 1, "external", Some(1)).await;
    connect(&mut session, 2, "eip6963", Some(1)).await;
    assert_eq!(session.registry().live_count(), 2);

    session
        .handle(SessionEvent::Disconnect { port: PortId(1) })
        .await
        .unwrap();
    session
        .handle(SessionEvent::Disconnect { port: PortId(1) })
        .await
        .unwrap();
    assert_eq!(session.registry().live_count(), 1);

    session
        .handle(SessionEvent::TabRemoved { tab: TabId(1) })
        .await
        .unwrap();
    assert_eq!(session.registry().live_count(), 0);
}

#[tokio::test]
async fn test_unknown_channel_rejects_only_that_port() {
    let host = Rc::new(MemoryHost::new());
    let mut session = start(&host, SessionConfig::default()).await;
    connect(&mut session, 1, "main", None).await;

    let err = session
        .handle(SessionEvent::Connect {
            port: PortId(2),
            name: "yakkl-mystery".to_string(),
            tab: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Classification(_)));
    assert!(session.registry().is_live(PortId(1)));
    assert!(!session.registry().is_live(PortId(2)));
}

#[tokio::test]
async fn test_lock_indicator_follows_main_ui() {
    let host = Rc::new(MemoryHost::new());
    let mut session = start(&host, SessionConfig::default()).await;

    connect(&mut session, 1, "main", None).await;
    connect(&mut session, 1, "main", None).await;
    session
        .handle(SessionEvent::Disconnect { port: PortId(1) })
        .await
        .unwrap();

    let indicator: Vec<bool> = host
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            HostCall::LockIndicator { locked } => Some(locked),
            _ => None,
        })
        .collect();
    assert_eq!(indicator, vec![false, true]);
}

#[tokio::test]
async fn test_second_settle_is_not_delivered() {
    let host = Rc::new(MemoryHost::new());
    let mut session = ready_session(&host).await;
    connect(&mut session, 2, "external", Some(3)).await;
    connect(&mut session, 9, "dappRelay", None).await;

    send(&mut session, 2, json!({"id": 11, "method": "eth_requestAccounts"}))
        .await
        .unwrap();
    let reply = json!({"type": "response", "requestId": 11, "result": ["0xabc"]});
    send(&mut session, 9, reply.clone()).await.unwrap();
    send(&mut session, 9, reply).await.unwrap();
    send(
        &mut session,
        9,
        json!({"type": "error", "requestId": 11, "error": {"code": 4001, "message": "late"}}),
    )
    .await
    .unwrap();

    assert_eq!(
        host.messages_to(PortId(2)),
        vec![json!({
            "id": 11,
            "method": "eth_requestAccounts",
            "type": "RESPONSE",
            "result": ["0xabc"],
        })]
    );
}

#[tokio::test]
async fn test_concurrent_requests_resolve_independently() {
    let host = Rc::new(MemoryHost::new());
    let mut session = ready_session(&host).await;
    connect(&mut session, 2, "external", Some(3)).await;
    connect(&mut session, 3, "external", Some(4)).await;
    connect(&mut session, 9, "dappRelay", None).await;

    send(&mut session, 2, json!({"id": "a", "method": "personal_sign", "params": ["0x01", "0xabc"]}))
        .await
        .unwrap();
    send(&mut session, 3, json!({"id": "b", "method": "personal_sign", "params": ["0x02", "0xabc"]}))
        .await
        .unwrap();

    send(&mut session, 9, json!({"type": "response", "requestId": "b", "result": "0xsig-b"}))
        .await
        .unwrap();
    send(&mut session, 9, json!({"type": "response", "requestId": "a", "result": "0xsig-a"}))
        .await
        .unwrap();

    let to_a = host.messages_to(PortId(2));
    let to_b = host.messages_to(PortId(3));
    assert_eq!(to_a.len(), 1);
    assert_eq!(to_b.len(), 1);
    assert_eq!(to_a[0]["result"], json!("0xsig-a"));
    assert_eq!(to_b[0]["result"], json!("0xsig-b"));
}

#[tokio::test]
async fn test_identical_show_calls_coalesce() {
    let host = Rc::new(MemoryHost::new());
    let mut session = start(&host, SessionConfig::default()).await;
    connect(&mut session, 1, "internal", None).await;

    send(&mut session, 1, json!({"type": "show_wallet"})).await.unwrap();
    send(&mut session, 1, json!({"type": "show_wallet"})).await.unwrap();
    host.advance(100);
    send(&mut session, 1, json!({"type": "show_wallet"})).await.unwrap();

    assert_eq!(created_windows(&host), vec!["index.html#/home".to_string()]);
    assert_eq!(
        host.count(|c| matches!(c, HostCall::FocusWindow { .. })),
        0
    );

    host.advance(1_000);
    send(&mut session, 1, json!({"type": "show_wallet"})).await.unwrap();
    assert_eq!(
        host.count(|c| matches!(c, HostCall::FocusWindow { url: None, .. })),
        1
    );
    assert_eq!(created_windows(&host).len(), 1);
}

#[tokio::test]
async fn test_closed_popup_window_is_recreated() {
    let host = Rc::new(MemoryHost::new());
    let mut session = start(&host, SessionConfig::default()).await;
    connect(&mut session, 1, "internal", None).await;

    send(&mut session, 1, json!({"type": "show_wallet"})).await.unwrap();
    let window = session.popups().handle(PopupKind::Main).unwrap().window;
    host.close_window(window);

    host.advance(5_000);
    send(&mut session, 1, json!({"type": "show_wallet"})).await.unwrap();
    assert_eq!(created_windows(&host).len(), 2);
}

#[tokio::test]
async fn test_closing_dapp_popup_rejects_open_requests() {
    let host = Rc::new(MemoryHost::new());
    let mut session = ready_session(&host).await;
    connect(&mut session, 2, "external", Some(3)).await;

    send(&mut session, 2, json!({"id": 5, "method": "eth_requestAccounts"}))
        .await
        .unwrap();
    let window = session
        .popups()
        .handle(PopupKind::Dapp)
        .unwrap()
        .window;

    host.close_window(window);
    session
        .handle(SessionEvent::WindowRemoved { window })
        .await
        .unwrap();

    assert_eq!(
        host.messages_to(PortId(2)),
        vec![json!({
            "id": 5,
            "method": "eth_requestAccounts",
            "type": "RESPONSE",
            "error": {"code": 4001, "message": "User rejected the request."},
        })]
    );
    assert_eq!(session.correlator().open_count(), 0);
}

#[tokio::test]
async fn test_disconnected_sender_gets_nothing() {
    let host = Rc::new(MemoryHost::new());
    let mut session = ready_session(&host).await;
    connect(&mut session, 2, "external", Some(3)).await;
    connect(&mut session, 9, "dappRelay", None).await;

    send(&mut session, 2, json!({"id": 8, "method": "eth_signTypedData_v4"}))
        .await
        .unwrap();
    session
        .handle(SessionEvent::Disconnect { port: PortId(2) })
        .await
        .unwrap();
    assert_eq!(session.correlator().open_count(), 0);

    send(&mut session, 9, json!({"type": "response", "requestId": 8, "result": "0xsig"}))
        .await
        .unwrap();
    assert!(host.messages_to(PortId(2)).is_empty());
}

#[tokio::test]
async fn test_unsupported_and_duplicate_requests() {
    let host = Rc::new(MemoryHost::new());
    let mut session = ready_session(&host).await;
    connect(&mut session, 2, "legacyEth", Some(3)).await;

    send(&mut session, 2, json!({"id": 1, "method": "eth_getBalance"}))
        .await
        .unwrap();
    send(&mut session, 2, json!({"id": 2, "method": "eth_sendTransaction"}))
        .await
        .unwrap();
    send(&mut session, 2, json!({"id": 2, "method": "eth_sendTransaction"}))
        .await
        .unwrap();

    let messages = host.messages_to(PortId(2));
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["error"]["code"], json!(4200));
    assert_eq!(messages[1]["id"], json!(2));
    assert_eq!(messages[1]["error"]["code"], json!(-1));
    assert_eq!(session.correlator().open_count(), 1);
}

#[tokio::test]
async fn test_malformed_request_with_id_gets_error() {
    let host = Rc::new(MemoryHost::new());
    let mut session = start(&host, SessionConfig::default()).await;
    connect(&mut session, 2, "external", Some(3)).await;

    let err = send(&mut session, 2, json!({"id": "9", "params": []}))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Malformed { channel: "external", .. }));
    let messages = host.messages_to(PortId(2));
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["id"], json!("9"));
    assert_eq!(messages[0]["error"]["code"], json!(-1));

    // no id: nothing to answer
    assert!(send(&mut session, 2, json!("hello")).await.is_err());
    assert_eq!(host.messages_to(PortId(2)).len(), 1);
}

#[tokio::test]
async fn test_message_from_unknown_port() {
    let host = Rc::new(MemoryHost::new());
    let mut session = start(&host, SessionConfig::default()).await;
    let err = send(&mut session, 42, json!({"id": 1, "method": "chainId"}))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::UnknownPort(PortId(42))));
}

#[tokio::test]
async fn test_setup_warning_then_promotion() {
    let host = Rc::new(MemoryHost::new());
    let mut session = start(&host, SessionConfig::default()).await;
    connect(&mut session, 1, "main", None).await;
    connect(&mut session, 2, "external", Some(3)).await;

    send(&mut session, 2, json!({"id": "t1", "method": "eth_sendTransaction"}))
        .await
        .unwrap();
    assert_eq!(
        created_windows(&host),
        vec!["index.html#/dapp/popups/warning?requestId=t1".to_string()]
    );

    host.advance(2_000);
    send(
        &mut session,
        1,
        json!({"type": "selection_changed", "account": "0xabc", "chainId": 11155111}),
    )
    .await
    .unwrap();

    assert_eq!(
        host.stored(SELECTION_KEY),
        Some(json!({"account": "0xabc", "chainId": 11155111}))
    );
    // the warning window is reused for the approval route
    assert_eq!(created_windows(&host).len(), 1);
    assert!(host.calls().contains(&HostCall::FocusWindow {
        window: WindowId(1),
        url: Some("index.html#/dapp/popups/transactions?requestId=t1".to_string()),
    }));

    send(&mut session, 2, json!({"id": "c", "method": "eth_chainId"}))
        .await
        .unwrap();
    assert_eq!(
        host.messages_to(PortId(2)).last().map(|m| m["result"].clone()),
        Some(json!("0xaa36a7"))
    );
}

#[tokio::test]
async fn test_provider_announcement() {
    let host = Rc::new(MemoryHost::new());
    let mut session = start(&host, SessionConfig::default()).await;
    connect(&mut session, 4, "eip6963", Some(2)).await;

    send(&mut session, 4, json!({"type": "request_provider"}))
        .await
        .unwrap();
    let messages = host.messages_to(PortId(4));
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["type"], json!("announce_provider"));
    assert_eq!(messages[0]["info"]["rdns"], json!("com.yakkl"));
}

#[tokio::test]
async fn test_flagged_navigation_and_override() {
    let host = Rc::new(MemoryHost::new().with_blacklist(["evil-wallet.io"]));
    let mut session = start(&host, SessionConfig::default()).await;
    assert_eq!(session.blacklist().len(), 1);
    connect(&mut session, 1, "internal", None).await;

    let url = "https://www.evil-wallet.io/airdrop";
    session
        .handle(SessionEvent::Navigation {
            tab: TabId(6),
            url: url.to_string(),
        })
        .await
        .unwrap();
    let redirect = host
        .calls()
        .into_iter()
        .find_map(|c| match c {
            HostCall::RedirectTab { tab: TabId(6), url } => Some(url),
            _ => None,
        })
        .unwrap();
    assert!(redirect.starts_with("phishing.html?flaggedSite="));
    let token = redirect.rsplit("token=").next().unwrap().to_string();
    host.take_calls();

    send(&mut session, 1, json!({"type": "continue_to_site", "token": token}))
        .await
        .unwrap();
    assert_eq!(
        host.calls(),
        vec![HostCall::RedirectTab {
            tab: TabId(6),
            url: url.to_string()
        }]
    );

    host.take_calls();
    session
        .handle(SessionEvent::Navigation {
            tab: TabId(6),
            url: url.to_string(),
        })
        .await
        .unwrap();
    assert!(host.calls().is_empty());
}

#[tokio::test]
async fn test_init_persists_bundled_blacklist_once() {
    let host = Rc::new(MemoryHost::new().with_blacklist(["phish.example", "evil-wallet.io"]));
    let session = start(&host, SessionConfig::default()).await;
    assert_eq!(session.blacklist().len(), 2);
    assert!(host.stored("yakklBlacklist").is_some());

    // a second worker instance loads from storage
    let mut second = Session::new(host.clone(), SessionConfig::default());
    second.init().await.unwrap();
    assert_eq!(
        host.count(|c| matches!(c, HostCall::StorageSet { key, .. } if key == "yakklBlacklist")),
        0
    );
    assert_eq!(second.blacklist().len(), 2);
}

#[tokio::test]
async fn test_run_loop_processes_in_order_until_shutdown() {
    let host = Rc::new(MemoryHost::new());
    let session = Session::new(host.clone(), SessionConfig::default());
    let (events, inbox) = session::channel();

    events
        .send(SessionEvent::Connect {
            port: PortId(2),
            name: "external".into(),
            tab: Some(TabId(1)),
        })
        .unwrap();
    events
        .send(SessionEvent::Message {
            port: PortId(2),
            payload: json!({"id": 1, "method": "chainId"}),
        })
        .unwrap();
    events
        .send(SessionEvent::Message {
            port: PortId(2),
            payload: json!({"id": 2, "method": "net_version"}),
        })
        .unwrap();
    events.send(SessionEvent::Shutdown).unwrap();

    session.run(inbox).await;

    let ids: Vec<Value> = host
        .messages_to(PortId(2))
        .into_iter()
        .map(|m| m["id"].clone())
        .collect();
    assert_eq!(ids, vec![json!(1), json!(2)]);
    assert!(events.send(SessionEvent::PollTick).is_err());
}

#[tokio::test]
async fn test_app_strategy_polls_to_idle() {
    let host = Rc::new(MemoryHost::new());
    let config = SessionConfig {
        idle: IdleConfig {
            strategy: IdleStrategy::App,
            threshold_ms: 60_000,
            lock_delay_ms: 10_000,
            ..IdleConfig::default()
        },
        ..SessionConfig::default()
    };
    let mut session = start(&host, config).await;
    connect(&mut session, 1, "main", None).await;

    // host idle signals are not the source of truth here
    session
        .handle(SessionEvent::IdleSignal {
            state: IdleState::Idle,
        })
        .await
        .unwrap();
    assert_eq!(session.idle_status().state, IdleState::Active);

    host.set_now(30_000);
    session.handle(SessionEvent::PollTick).await.unwrap();
    assert_eq!(session.idle_status().state, IdleState::Active);

    host.set_now(61_000);
    session.handle(SessionEvent::PollTick).await.unwrap();
    assert_eq!(session.idle_status().state, IdleState::Idle);
    assert_eq!(host.alarm(LOCK_ALARM), Some(71_000));

    send(&mut session, 1, json!({"type": "activity"})).await.unwrap();
    assert_eq!(session.idle_status().state, IdleState::Active);
    assert_eq!(host.alarm(LOCK_ALARM), None);
}

#[tokio::test]
async fn test_pending_lock_survives_worker_suspend() {
    let host = Rc::new(MemoryHost::new());
    let mut session = start(&host, idle_config(60_000)).await;
    session
        .handle(SessionEvent::IdleSignal {
            state: IdleState::Idle,
        })
        .await
        .unwrap();
    assert_eq!(host.alarm(LOCK_ALARM), Some(60_000));

    host.set_now(10_000);
    assert_eq!(
        session.handle(SessionEvent::Shutdown).await.unwrap(),
        Flow::Stop
    );
    assert_eq!(host.alarm(LOCK_ALARM), Some(60_000));
    drop(session);

    // the worker wakes again; the UI reconnects before the alarm fires
    host.set_now(30_000);
    let mut restarted = start(&host, idle_config(60_000)).await;
    assert_eq!(restarted.idle_status().state, IdleState::Idle);
    assert_eq!(host.alarm(LOCK_ALARM), Some(60_000));
    connect(&mut restarted, 1, "main", None).await;

    host.set_now(60_000);
    restarted
        .handle(SessionEvent::Alarm {
            name: LOCK_ALARM.to_string(),
        })
        .await
        .unwrap();
    assert_eq!(restarted.idle_status().state, IdleState::Locked);
    assert_eq!(
        host.stored(LOCK_STATE_KEY),
        Some(json!({"locked": true, "reason": "idle"}))
    );
    assert_eq!(
        host.messages_to(PortId(1)),
        vec![json!({"type": "lockdown", "reason": "idle"})]
    );
    assert_eq!(host.stored(PENDING_LOCK_KEY), Some(json!(null)));
}

#[tokio::test]
async fn test_activity_after_restart_cancels_resumed_lock() {
    let host = Rc::new(MemoryHost::new());
    let mut session = start(&host, idle_config(60_000)).await;
    session
        .handle(SessionEvent::IdleSignal {
            state: IdleState::Idle,
        })
        .await
        .unwrap();
    drop(session);

    let mut restarted = start(&host, idle_config(60_000)).await;
    restarted.handle(SessionEvent::Activity).await.unwrap();
    assert_eq!(restarted.idle_status().state, IdleState::Active);
    assert_eq!(host.alarm(LOCK_ALARM), None);

    host.set_now(60_000);
    restarted
        .handle(SessionEvent::Alarm {
            name: LOCK_ALARM.to_string(),
        })
        .await
        .unwrap();
    assert_eq!(host.stored(LOCK_STATE_KEY), None);
}

#[tokio::test]
async fn test_lockdown_broadcast_survives_notification_failure() {
    let host = Rc::new(MemoryHost::new());
    let mut session = start(&host, idle_config(0)).await;
    connect(&mut session, 1, "main", None).await;
    host.fail_on("notify");

    session
        .handle(SessionEvent::IdleSignal {
            state: IdleState::Idle,
        })
        .await
        .unwrap();

    assert_eq!(session.idle_status().state, IdleState::Locked);
    assert_eq!(
        host.stored(LOCK_STATE_KEY),
        Some(json!({"locked": true, "reason": "idle"}))
    );
    assert_eq!(
        host.messages_to(PortId(1)),
        vec![json!({"type": "lockdown", "reason": "idle"})]
    );
}

#[tokio::test]
async fn test_init_continues_past_blacklist_failure() {
    let host = Rc::new(MemoryHost::new());
    host.fail_on("bundled_blacklist");
    let mut session = Session::new(host.clone(), idle_config(30_000));

    let err = session.init().await.unwrap_err();
    assert!(matches!(err, SessionError::Host(e) if e.call == "bundled_blacklist"));
    assert!(host.calls().contains(&HostCall::IdleInterval { seconds: 180 }));
    assert!(host.calls().contains(&HostCall::LockIndicator { locked: true }));
    assert!(session.is_running());
    assert!(session.blacklist().is_empty());

    // the session still serves requests
    connect(&mut session, 2, "external", Some(1)).await;
    send(&mut session, 2, json!({"id": 1, "method": "eth_chainId"}))
        .await
        .unwrap();
    assert_eq!(host.messages_to(PortId(2))[0]["result"], json!("0x1"));
}

#[tokio::test]
async fn test_host_locked_signal_schedules_lock() {
    let host = Rc::new(MemoryHost::new());
    let mut session = start(&host, idle_config(30_000)).await;

    session
        .handle(SessionEvent::IdleSignal {
            state: IdleState::Locked,
        })
        .await
        .unwrap();
    assert_eq!(session.idle_status().state, IdleState::Idle);
    assert_eq!(host.alarm(LOCK_ALARM), Some(30_000));
    assert_eq!(host.stored(LOCK_STATE_KEY), None);
}

#[tokio::test]
async fn test_two_dapps_may_reuse_request_ids() {
    let host = Rc::new(MemoryHost::new());
    let mut session = ready_session(&host).await;
    connect(&mut session, 2, "external", Some(3)).await;
    connect(&mut session, 3, "external", Some(4)).await;

    send(&mut session, 2, json!({"id": 1, "method": "eth_sendTransaction"}))
        .await
        .unwrap();
    send(&mut session, 3, json!({"id": 1, "method": "personal_sign"}))
        .await
        .unwrap();
    assert_eq!(session.correlator().open_count(), 2);
    assert!(host.messages_to(PortId(3)).is_empty());

    connect(&mut session, 9, "dappRelay", None).await;
    send(&mut session, 9, json!({"type": "response", "requestId": "1#3", "result": "0xsig"}))
        .await
        .unwrap();
    send(&mut session, 9, json!({"type": "response", "requestId": 1, "result": "0xhash"}))
        .await
        .unwrap();

    assert_eq!(
        host.messages_to(PortId(3)),
        vec![json!({"id": 1, "method": "personal_sign", "type": "RESPONSE", "result": "0xsig"})]
    );
    assert_eq!(
        host.messages_to(PortId(2)),
        vec![json!({"id": 1, "method": "eth_sendTransaction", "type": "RESPONSE", "result": "0xhash"})]
    );
}

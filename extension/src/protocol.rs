// Port message schema
// One closed message type per channel; raw JSON is validated once, at the boundary.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ClassificationError, ProviderError, SessionError};
use crate::host::PortId;
use crate::popup::PopupRoute;

/// Port name discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelKind {
    #[serde(rename = "main")]
    Main,
    #[serde(rename = "internal")]
    Internal,
    #[serde(rename = "external")]
    External,
    #[serde(rename = "legacyEth")]
    LegacyEth,
    #[serde(rename = "dappRelay")]
    DappRelay,
    #[serde(rename = "eip6963")]
    Eip6963,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Main => "main",
            ChannelKind::Internal => "internal",
            ChannelKind::External => "external",
            ChannelKind::LegacyEth => "legacyEth",
            ChannelKind::DappRelay => "dappRelay",
            ChannelKind::Eip6963 => "eip6963",
        }
    }

    /// Channels carrying untrusted page requests
    pub fn is_dapp_facing(&self) -> bool {
        matches!(
            self,
            ChannelKind::External | ChannelKind::LegacyEth | ChannelKind::Eip6963
        )
    }

    /// Channels owned by the extension's own UI
    pub fn is_ui(&self) -> bool {
        matches!(self, ChannelKind::Main | ChannelKind::Internal)
    }
}

impl FromStr for ChannelKind {
    type Err = ClassificationError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name {
            "main" => Ok(ChannelKind::Main),
            "internal" => Ok(ChannelKind::Internal),
            "external" => Ok(ChannelKind::External),
            "legacyEth" => Ok(ChannelKind::LegacyEth),
            "dappRelay" => Ok(ChannelKind::DappRelay),
            "eip6963" => Ok(ChannelKind::Eip6963),
            other => Err(ClassificationError(other.to_string())),
        }
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// JSON-RPC id as sent by the page; echoed back verbatim
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    Text(String),
}

impl RequestId {
    /// Canonical string key used by the pending table and popup routes
    pub fn key(&self) -> RequestKey {
        match self {
            RequestId::Number(n) => RequestKey(n.to_string()),
            RequestId::Text(s) => RequestKey(s.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestKey(pub String);

impl RequestKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Key for an id that another sender already holds open
    pub fn scoped(&self, sender: PortId) -> RequestKey {
        RequestKey(format!("{}#{}", self.0, sender))
    }
}

impl std::fmt::Display for RequestKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestKey {
    fn from(s: &str) -> Self {
        RequestKey(s.to_string())
    }
}

/// `params` is either positional or named
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Params {
    Positional(Vec<Value>),
    Named(Map<String, Value>),
}

/// Inbound dApp request envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DappRequest {
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Params>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvelopeKind {
    #[serde(rename = "RESPONSE")]
    Response,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Result(Value),
    Error(ProviderError),
}

/// Outbound response envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub id: RequestId,
    pub method: String,
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    #[serde(flatten)]
    pub outcome: Outcome,
}

impl ResponseEnvelope {
    pub fn new(id: RequestId, method: impl Into<String>, outcome: Outcome) -> Self {
        Self {
            id,
            method: method.into(),
            kind: EnvelopeKind::Response,
            outcome,
        }
    }

    pub fn to_value(&self) -> Value {
        // Only derived Serialize impls with string keys are involved
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Provider methods the wallet understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// `eth_chainId`, hex quantity
    ChainIdHex,
    /// legacy `chainId`, decimal string
    ChainId,
    NetVersion,
    CurrentNetwork,
    RequestAccounts,
    RequestPermissions,
    SendTransaction,
    SignTypedData,
    PersonalSign,
    EstimateGas,
    AddChain,
    SwitchChain,
}

/// How a method gets answered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodClass {
    Immediate,
    Approval(PopupRoute),
}

impl Method {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "eth_chainId" => return Some(Method::ChainIdHex),
            "net_version" => return Some(Method::NetVersion),
            "wallet_getCurrentNetwork" => return Some(Method::CurrentNetwork),
            "wallet_requestPermissions" => return Some(Method::RequestPermissions),
            "wallet_addEthereumChain" => return Some(Method::AddChain),
            "wallet_switchEthereumChain" => return Some(Method::SwitchChain),
            "personal_sign" => return Some(Method::PersonalSign),
            _ => {}
        }

        // eth_ prefix is optional for the eth namespace
        match name.strip_prefix("eth_").unwrap_or(name) {
            "chainId" => Some(Method::ChainId),
            "currentNetwork" => Some(Method::CurrentNetwork),
            "requestAccounts" => Some(Method::RequestAccounts),
            "sendTransaction" => Some(Method::SendTransaction),
            "signTypedData" | "signTypedData_v3" | "signTypedData_v4" => {
                Some(Method::SignTypedData)
            }
            "estimateGas" => Some(Method::EstimateGas),
            _ => None,
        }
    }

    pub fn class(&self) -> MethodClass {
        match self {
            Method::ChainIdHex | Method::ChainId | Method::NetVersion | Method::CurrentNetwork => {
                MethodClass::Immediate
            }
            Method::RequestAccounts
            | Method::RequestPermissions
            | Method::AddChain
            | Method::SwitchChain => MethodClass::Approval(PopupRoute::Approve),
            Method::SendTransaction | Method::EstimateGas => {
                MethodClass::Approval(PopupRoute::Transactions)
            }
            Method::SignTypedData | Method::PersonalSign => {
                MethodClass::Approval(PopupRoute::Sign)
            }
        }
    }
}

/// Messages from the wallet's own UI (`main`, `internal`)
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UiMessage {
    /// Qualifying user input, used by the app-wide idle strategy
    Activity,
    Visibility {
        hidden: bool,
    },
    #[serde(rename_all = "camelCase")]
    SelectionChanged {
        account: Option<String>,
        chain_id: Option<u64>,
    },
    Unlocked,
    ContinueToSite {
        token: String,
    },
    ShowWallet,
}

/// EIP-6963 discovery control messages
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Eip6963Control {
    RequestProvider,
}

/// Anything accepted on a dApp-facing channel
#[derive(Debug, Clone, PartialEq)]
pub enum DappInbound {
    Request(DappRequest),
    RequestProvider,
}

/// Messages from approval popups (`dappRelay`)
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    GetParams { request: RequestKey },
    Error { request: RequestKey, error: ProviderError },
    Response { request: RequestKey, result: Value },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRelay {
    #[serde(rename = "type")]
    kind: String,
    request_id: RequestId,
    #[serde(default, alias = "data")]
    result: Value,
    #[serde(default)]
    error: Value,
}

/// Inbound message after channel-specific validation
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Ui(UiMessage),
    Dapp(DappInbound),
    Relay(RelayMessage),
}

impl Inbound {
    /// Validate a raw payload against the schema of its channel
    pub fn parse(channel: ChannelKind, payload: Value) -> Result<Self, SessionError> {
        let malformed = |source: serde_json::Error| SessionError::Malformed {
            channel: channel.as_str(),
            source,
        };
        match channel {
            ChannelKind::Main | ChannelKind::Internal => serde_json::from_value(payload)
                .map(Inbound::Ui)
                .map_err(malformed),
            ChannelKind::External | ChannelKind::LegacyEth => {
                serde_json::from_value::<DappRequest>(payload)
                    .map(|req| Inbound::Dapp(DappInbound::Request(req)))
                    .map_err(malformed)
            }
            ChannelKind::Eip6963 => {
                if let Ok(Eip6963Control::RequestProvider) =
                    serde_json::from_value::<Eip6963Control>(payload.clone())
                {
                    return Ok(Inbound::Dapp(DappInbound::RequestProvider));
                }
                serde_json::from_value::<DappRequest>(payload)
                    .map(|req| Inbound::Dapp(DappInbound::Request(req)))
                    .map_err(malformed)
            }
            ChannelKind::DappRelay => {
                let raw: RawRelay = serde_json::from_value(payload).map_err(malformed)?;
                let request = raw.request_id.key();
                Ok(Inbound::Relay(match raw.kind.as_str() {
                    "get_params" => RelayMessage::GetParams { request },
                    "error" => RelayMessage::Error {
                        request,
                        error: provider_error_from(raw.error),
                    },
                    _ => RelayMessage::Response {
                        request,
                        result: raw.result,
                    },
                }))
            }
        }
    }
}

fn provider_error_from(value: Value) -> ProviderError {
    match serde_json::from_value::<ProviderError>(value.clone()) {
        Ok(err) => err,
        Err(_) => match value {
            Value::String(message) => ProviderError::internal(message),
            Value::Null => ProviderError::internal("popup reported an error"),
            other => ProviderError::internal(other),
        },
    }
}

/// Background → UI / popup notices
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notice {
    Lockdown {
        reason: String,
    },
    #[serde(rename_all = "camelCase")]
    Params {
        request_id: RequestKey,
        data: DappRequest,
    },
    #[serde(rename_all = "camelCase")]
    ParamsMissing {
        request_id: RequestKey,
    },
    AnnounceProvider {
        info: ProviderInfo,
    },
}

impl Notice {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// EIP-6963 provider metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub uuid: String,
    pub name: String,
    pub icon: String,
    pub rdns: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_channel_names() {
        assert_eq!("legacyEth".parse::<ChannelKind>().unwrap(), ChannelKind::LegacyEth);
        assert_eq!(ChannelKind::DappRelay.as_str(), "dappRelay");
        assert!("yakkl-unknown".parse::<ChannelKind>().is_err());
    }

    #[test]
    fn test_method_aliases() {
        assert_eq!(Method::parse("sendTransaction"), Some(Method::SendTransaction));
        assert_eq!(Method::parse("eth_sendTransaction"), Some(Method::SendTransaction));
        assert_eq!(Method::parse("chainId"), Some(Method::ChainId));
        assert_eq!(Method::parse("eth_chainId"), Some(Method::ChainIdHex));
        assert_eq!(Method::parse("eth_signTypedData_v4"), Some(Method::SignTypedData));
        assert_eq!(Method::parse("eth_getBalance"), None);
        assert_eq!(
            Method::PersonalSign.class(),
            MethodClass::Approval(PopupRoute::Sign)
        );
        assert_eq!(Method::NetVersion.class(), MethodClass::Immediate);
    }

    #[test]
    fn test_response_envelope_shape() {
        let ok = ResponseEnvelope::new(
            RequestId::Text("7".into()),
            "chainId",
            Outcome::Result(json!("1")),
        );
        assert_eq!(
            ok.to_value(),
            json!({"id": "7", "method": "chainId", "type": "RESPONSE", "result": "1"})
        );

        let err = ResponseEnvelope::new(
            RequestId::Number(9),
            "eth_foo",
            Outcome::Error(ProviderError::unsupported("eth_foo")),
        );
        let value = err.to_value();
        assert_eq!(value["id"], json!(9));
        assert_eq!(value["error"]["code"], json!(4200));
        assert!(value.get("result").is_none());
    }

    #[test]
    fn test_relay_default_is_response() {
        let msg = Inbound::parse(
            ChannelKind::DappRelay,
            json!({"type": "approved", "requestId": 3, "data": ["0xabc"]}),
        )
        .unwrap();
        assert_eq!(
            msg,
            Inbound::Relay(RelayMessage::Response {
                request: RequestKey::from("3"),
                result: json!(["0xabc"]),
            })
        );
    }

    #[test]
    fn test_relay_error_keeps_popup_error() {
        let msg = Inbound::parse(
            ChannelKind::DappRelay,
            json!({"type": "error", "requestId": "3", "error": {"code": 4001, "message": "no"}}),
        )
        .unwrap();
        assert_eq!(
            msg,
            Inbound::Relay(RelayMessage::Error {
                request: RequestKey::from("3"),
                error: ProviderError::new(4001, "no"),
            })
        );
    }

    #[test]
    fn test_eip6963_request_provider() {
        let msg = Inbound::parse(ChannelKind::Eip6963, json!({"type": "request_provider"})).unwrap();
        assert_eq!(msg, Inbound::Dapp(DappInbound::RequestProvider));
    }

    #[test]
    fn test_malformed_request_rejected() {
        let err = Inbound::parse(ChannelKind::External, json!({"method": "eth_chainId"}));
        assert!(matches!(err, Err(SessionError::Malformed { channel: "external", .. })));
    }

    #[test]
    fn test_params_must_be_array_or_object() {
        assert!(Inbound::parse(
            ChannelKind::External,
            json!({"id": 1, "method": "eth_chainId", "params": 5})
        )
        .is_err());
        assert!(Inbound::parse(
            ChannelKind::External,
            json!({"id": 1, "method": "eth_chainId", "params": {"a": 1}})
        )
        .is_ok());
    }
}

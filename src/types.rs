//! Wire types and session state.
//!
//! JSON-RPC envelopes, peer metadata, the session-update payload and the
//! resumable session snapshot. There are tests with actual payloads to
//! ensure the serde attributes match the v1 wire format.

use std::fmt::Display;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::utils::payload_id;

/// A JSON-RPC 2.0 request. Requests in the v1 protocol always carry
/// positional params.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JsonRpcRequest<ParamType = Value> {
    pub jsonrpc: String,
    pub method: String,
    pub params: ParamType,
    pub id: i64,
}

impl<ParamType> JsonRpcRequest<ParamType> {
    pub fn new(method: WcMethod, params: ParamType) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
            id: payload_id(),
        }
    }
}

/// A JSON-RPC 2.0 response with either a result or an error.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JsonRpcResponse<ResultType = Value> {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    pub id: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    #[serde(default)]
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A decrypted inbound message: peer-initiated requests carry a `method`,
/// everything else is a response to one of our requests.
#[derive(Clone, Debug)]
pub enum Envelope {
    Request(JsonRpcRequest),
    Response(JsonRpcResponse),
}

impl Envelope {
    pub fn parse(plaintext: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(plaintext)?;
        if value.get("method").is_some() {
            Ok(Envelope::Request(serde_json::from_value(value)?))
        } else if value.get("id").is_some() {
            Ok(Envelope::Response(serde_json::from_value(value)?))
        } else {
            Err(Error::Format("message is neither a request nor a response"))
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum WcMethod {
    #[serde(rename = "wc_sessionRequest")]
    SessionRequest,

    #[serde(rename = "wc_sessionUpdate")]
    SessionUpdate,

    #[serde(rename = "eth_sign")]
    EthSign,

    #[serde(rename = "personal_sign")]
    PersonalSign,

    #[serde(rename = "eth_signTypedData")]
    EthSignTypedData,

    #[serde(rename = "eth_sendTransaction")]
    EthSendTransaction,

    #[serde(rename = "eth_signTransaction")]
    EthSignTransaction,

    #[serde(rename = "eth_sendRawTransaction")]
    EthSendRawTransaction,

    #[serde(rename = "wallet_addEthereumChain")]
    WalletAddEthereumChain,

    #[serde(rename = "wallet_switchEthereumChain")]
    WalletSwitchEthereumChain,

    #[serde(rename = "wallet_updateEthereumChain")]
    WalletUpdateEthereumChain,
}

impl Display for WcMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", serde_plain::to_string(self).unwrap())
    }
}

impl FromStr for WcMethod {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        serde_plain::from_str(s).map_err(|_| Error::Format("unknown walletconnect method"))
    }
}

/// Description of a party in the session: the dapp's own metadata is sent
/// in the handshake, the wallet's arrives with the approval.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClientMeta {
    pub name: String,
    pub description: String,
    pub url: String,
    pub icons: Vec<String>,
}

impl ClientMeta {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Validation("client meta must include a valid Name"));
        }
        if self.description.trim().is_empty() {
            return Err(Error::Validation(
                "client meta must include a valid Description",
            ));
        }
        if self.url.trim().is_empty() {
            return Err(Error::Validation("client meta must include a valid URL"));
        }
        if self.icons.is_empty() {
            return Err(Error::Validation(
                "client meta must include at least one icon URL",
            ));
        }
        Ok(())
    }
}

/// The session-update payload: carried in the handshake response result and
/// in unsolicited `wc_sessionUpdate` notifications.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WcSessionData {
    pub approved: bool,
    #[serde(default)]
    pub chain_id: Option<u64>,
    #[serde(default)]
    pub network_id: Option<u64>,
    #[serde(default)]
    pub accounts: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_meta: Option<ClientMeta>,
}

/// Connection status derived from the session booleans.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WalletConnectStatus {
    DisconnectedNoSession,
    Connecting,
    Connected,
    Disconnected,
}

/// Observable session events, delivered in dispatch order through the
/// queue handed out by `subscribe_events`.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    Connect,
    Created,
    Resumed,
    Disconnect,
    Send,
    HandshakeSent,
    SessionUpdate(WcSessionData),
    AccountChanged(Vec<String>),
    ChainChanged(u64),
}

/// Immutable snapshot of session state, sufficient to reconstruct an
/// equivalent session without re-running the handshake.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedSession {
    pub client_id: String,
    pub handshake_id: i64,
    pub bridge_url: String,
    pub key: String,
    pub key_raw: [u8; 32],
    pub peer_id: Option<String>,
    pub network_id: u64,
    pub accounts: Option<Vec<String>>,
    pub chain_id: u64,
    pub dapp_meta: ClientMeta,
    pub wallet_meta: Option<ClientMeta>,
}

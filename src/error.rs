use crate::types::JsonRpcError;

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Debug)]
pub enum Error {
    /// Malformed construction input, e.g. client metadata with empty fields.
    Validation(&'static str),
    /// Caller bug, e.g. starting a second handshake while one is pending.
    Usage(&'static str),
    /// Malformed encrypted payload or envelope.
    Format(&'static str),
    /// HMAC verification failed on an inbound payload.
    Integrity,
    /// Publish or subscribe attempted while the transport is down.
    TransportNotConnected,
    /// Relay transport failure reported by the transport implementation.
    Transport(String),
    /// The peer returned a JSON-RPC error response.
    JsonRpc(JsonRpcError),
    /// The peer declined the session handshake.
    SessionRejected,
    /// The session handshake failed with a peer-provided message.
    SessionFailed(String),
    /// The pending operation was torn down by a session disconnect.
    Disconnected,
    SerdeJson(serde_json::Error),
    FromUtf8(std::string::FromUtf8Error),
}

impl From<JsonRpcError> for Error {
    fn from(e: JsonRpcError) -> Self {
        Error::JsonRpc(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::SerdeJson(e)
    }
}

impl From<std::string::FromUtf8Error> for Error {
    fn from(e: std::string::FromUtf8Error) -> Self {
        Error::FromUtf8(e)
    }
}

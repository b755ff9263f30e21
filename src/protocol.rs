//! Protocol base: key material, topic bookkeeping and the generic send path.
//!
//! [`WalletConnectSession`](crate::session::WalletConnectSession) composes a
//! protocol value; there is exactly one concrete session behavior, so no
//! trait seam is needed between them.

use std::collections::HashSet;
use std::sync::Mutex;

use alloy::hex;
use log::debug;
use serde::Serialize;

use crate::cipher;
use crate::delegator::EventDelegator;
use crate::error::{Error, Result};
use crate::transport::Transport;
use crate::types::{Envelope, JsonRpcRequest};

pub struct WalletConnectProtocol<T: Transport> {
    transport: T,
    key_raw: [u8; 32],
    key: String,
    bridge_url: String,
    active_topics: Mutex<HashSet<String>>,
    /// The peer's topic, set once the handshake is approved. All session
    /// traffic after the handshake is published here.
    session_topic: Mutex<Option<String>>,
    delegator: EventDelegator,
}

impl<T: Transport> WalletConnectProtocol<T> {
    pub fn new(transport: T, bridge_url: &str, key_raw: [u8; 32]) -> Self {
        Self {
            transport,
            key_raw,
            key: hex::encode(key_raw),
            bridge_url: bridge_url.to_string(),
            active_topics: Mutex::new(HashSet::new()),
            session_topic: Mutex::new(None),
            delegator: EventDelegator::new(),
        }
    }

    /// Lowercase hex encoding of the session key.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn key_raw(&self) -> &[u8; 32] {
        &self.key_raw
    }

    pub fn bridge_url(&self) -> &str {
        &self.bridge_url
    }

    pub fn delegator(&self) -> &EventDelegator {
        &self.delegator
    }

    pub fn transport_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub async fn open_transport(&self) -> Result<()> {
        self.transport.connect().await
    }

    /// Safe to call even if the transport was never connected.
    pub async fn disconnect_transport(&self) -> Result<()> {
        if self.transport.is_connected() {
            self.transport.disconnect().await?;
        }
        Ok(())
    }

    /// Accepts inbound messages on the topic without a relay subscription.
    /// Idempotent.
    pub fn listen_to_topic(&self, topic: &str) {
        self.active_topics
            .lock()
            .expect("lock poisoned")
            .insert(topic.to_string());
    }

    /// Subscribes on the relay and starts accepting inbound messages on the
    /// topic. Subscribing to an already-active topic is a no-op.
    pub async fn subscribe_and_listen_to_topic(&self, topic: &str) -> Result<()> {
        if self.is_active_topic(topic) {
            return Ok(());
        }
        if !self.transport.is_connected() {
            return Err(Error::TransportNotConnected);
        }
        self.transport.subscribe(topic).await?;
        self.listen_to_topic(topic);
        Ok(())
    }

    pub fn is_active_topic(&self, topic: &str) -> bool {
        self.active_topics
            .lock()
            .expect("lock poisoned")
            .contains(topic)
    }

    pub fn clear_active_topics(&self) {
        self.active_topics.lock().expect("lock poisoned").clear();
    }

    pub fn session_topic(&self) -> Option<String> {
        self.session_topic.lock().expect("lock poisoned").clone()
    }

    pub fn set_session_topic(&self, topic: Option<String>) {
        *self.session_topic.lock().expect("lock poisoned") = topic;
    }

    /// Serializes the request, encrypts it with the session key and
    /// publishes it. Defaults to the session topic when none is given.
    pub async fn send_request<P: Serialize>(
        &self,
        request: &JsonRpcRequest<P>,
        topic: Option<&str>,
    ) -> Result<()> {
        if !self.transport.is_connected() {
            return Err(Error::TransportNotConnected);
        }

        let topic = match topic {
            Some(topic) => topic.to_string(),
            None => self
                .session_topic()
                .ok_or(Error::Usage("no session topic established yet"))?,
        };

        let plaintext = serde_json::to_vec(request)?;
        let payload = cipher::encrypt(&plaintext, &self.key_raw)?;
        let ciphertext = serde_json::to_string(&payload)?;

        debug!("publishing request {} to topic {topic}", request.id);
        self.transport.publish(&topic, &ciphertext).await
    }

    /// Decrypts and parses an inbound ciphertext into an envelope.
    pub fn decode_inbound(&self, payload: &str) -> Result<Envelope> {
        let payload: cipher::EncryptedPayload = serde_json::from_str(payload)
            .map_err(|_| Error::Format("inbound message is not an encrypted payload"))?;
        let plaintext = String::from_utf8(cipher::decrypt(&payload, &self.key_raw)?)?;
        Envelope::parse(&plaintext).inspect_err(|e| {
            debug!("failed to parse inbound envelope: {e:?}\n{plaintext}");
        })
    }
}

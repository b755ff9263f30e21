//! The session state machine built atop the protocol base.
//!
//! A session starts fresh (no peer yet, handshake pending) or restored from
//! a [`SavedSession`] snapshot (treated as already handshaked). Operations
//! that wait on a network round trip suspend on a one-shot channel and
//! resume when the matching inbound message is dispatched through
//! [`handle_transport_message`](WalletConnectSession::handle_transport_message).

use std::sync::Mutex;

use alloy::hex;
use alloy::primitives::{Address, keccak256};
use log::{debug, warn};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::protocol::WalletConnectProtocol;
use crate::rpc::{EthChain, EthChainData, EthUpdateChainData, SessionRequestParams, TransactionData};
use crate::transport::Transport;
use crate::types::{
    ClientMeta, Envelope, JsonRpcRequest, JsonRpcResponse, SavedSession, SessionEvent,
    WalletConnectStatus, WcMethod, WcSessionData,
};
use crate::utils::{build_uri, is_hex, random_bytes32};

pub struct WalletConnectSession<T: Transport> {
    protocol: WalletConnectProtocol<T>,
    client_id: String,
    /// Random topic used only for the initial handshake exchange. Empty on
    /// sessions restored from a snapshot, which never handshake again.
    handshake_topic: String,
    dapp_meta: ClientMeta,
    state: Mutex<SessionState>,
    /// The single pending handshake waiter. At most one handshake may be in
    /// flight per session instance.
    session_waiter: Mutex<Option<oneshot::Sender<Result<WcSessionData>>>>,
    events: Mutex<Vec<mpsc::UnboundedSender<SessionEvent>>>,
}

struct SessionState {
    handshake_id: i64,
    chain_id: u64,
    network_id: u64,
    accounts: Option<Vec<String>>,
    peer_id: Option<String>,
    wallet_meta: Option<ClientMeta>,
    wallet_connected: bool,
    connecting: bool,
    session_established: bool,
}

impl<T: Transport> WalletConnectSession<T> {
    /// Creates a fresh session: generates the session key, client id and
    /// handshake topic. Fails with a validation error if the dapp metadata
    /// is incomplete.
    pub fn new(
        client_meta: ClientMeta,
        bridge_url: &str,
        transport: T,
        chain_id: u64,
    ) -> Result<Self> {
        client_meta.validate()?;

        Ok(Self {
            protocol: WalletConnectProtocol::new(transport, bridge_url, random_bytes32()),
            client_id: Uuid::new_v4().to_string(),
            handshake_topic: Uuid::new_v4().to_string(),
            dapp_meta: client_meta,
            state: Mutex::new(SessionState {
                handshake_id: 0,
                chain_id,
                network_id: 0,
                accounts: None,
                peer_id: None,
                wallet_meta: None,
                wallet_connected: false,
                connecting: false,
                session_established: false,
            }),
            session_waiter: Mutex::new(None),
            events: Mutex::new(Vec::new()),
        })
    }

    /// Reconstructs a session from a saved snapshot without re-running the
    /// handshake.
    pub fn from_saved(saved: SavedSession, transport: T) -> Self {
        let protocol = WalletConnectProtocol::new(transport, &saved.bridge_url, saved.key_raw);
        protocol.set_session_topic(saved.peer_id.clone());

        Self {
            protocol,
            client_id: saved.client_id,
            handshake_topic: String::new(),
            dapp_meta: saved.dapp_meta,
            state: Mutex::new(SessionState {
                handshake_id: saved.handshake_id,
                chain_id: saved.chain_id,
                network_id: saved.network_id,
                accounts: saved.accounts,
                peer_id: saved.peer_id,
                wallet_meta: saved.wallet_meta,
                wallet_connected: true,
                connecting: false,
                session_established: true,
            }),
            session_waiter: Mutex::new(None),
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn handshake_topic(&self) -> &str {
        &self.handshake_topic
    }

    pub fn protocol(&self) -> &WalletConnectProtocol<T> {
        &self.protocol
    }

    pub fn chain_id(&self) -> u64 {
        self.state.lock().expect("lock poisoned").chain_id
    }

    pub fn network_id(&self) -> u64 {
        self.state.lock().expect("lock poisoned").network_id
    }

    pub fn accounts(&self) -> Option<Vec<String>> {
        self.state.lock().expect("lock poisoned").accounts.clone()
    }

    pub fn peer_id(&self) -> Option<String> {
        self.state.lock().expect("lock poisoned").peer_id.clone()
    }

    pub fn wallet_metadata(&self) -> Option<ClientMeta> {
        self.state.lock().expect("lock poisoned").wallet_meta.clone()
    }

    pub fn wallet_connected(&self) -> bool {
        self.state.lock().expect("lock poisoned").wallet_connected
    }

    pub fn status(&self) -> WalletConnectStatus {
        let state = self.state.lock().expect("lock poisoned");
        if state.wallet_connected {
            WalletConnectStatus::Connected
        } else if state.connecting {
            WalletConnectStatus::Connecting
        } else if state.session_established {
            WalletConnectStatus::Disconnected
        } else {
            WalletConnectStatus::DisconnectedNoSession
        }
    }

    /// The connection hand-off URI, e.g. for rendering as a QR code.
    pub fn uri(&self) -> String {
        build_uri(
            &self.handshake_topic,
            self.protocol.bridge_url(),
            self.protocol.key(),
        )
    }

    /// Registers an observer. Events are delivered in dispatch order; each
    /// registration gets its own queue.
    pub fn subscribe_events(&self) -> mpsc::UnboundedReceiver<SessionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.events.lock().expect("lock poisoned").push(tx);
        rx
    }

    fn emit(&self, event: SessionEvent) {
        let mut senders = self.events.lock().expect("lock poisoned");
        senders.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Opens the transport if needed, subscribes to the client topic and
    /// either runs the handshake (fresh session) or synthesizes an
    /// already-approved result (restored session).
    pub async fn connect_session(&self) -> Result<WcSessionData> {
        // Whoever flips the flag owns the attempt; a losing concurrent call
        // must not clear it while the first handshake is still pending.
        let owns_attempt = {
            let mut state = self.state.lock().expect("lock poisoned");
            let was_connecting = state.connecting;
            state.connecting = true;
            !was_connecting
        };

        let result = self.connect_inner().await;

        if owns_attempt {
            self.state.lock().expect("lock poisoned").connecting = false;
        }

        match result {
            Ok(data) => {
                self.emit(SessionEvent::Connect);
                Ok(data)
            }
            Err(e) => {
                // We tried our best, the caller can try again.
                if matches!(e, Error::Transport(_) | Error::TransportNotConnected)
                    && self.protocol.transport_connected()
                {
                    if let Err(te) = self.protocol.disconnect_transport().await {
                        warn!("transport teardown after failed connect also failed: {te:?}");
                    }
                }
                Err(e)
            }
        }
    }

    async fn connect_inner(&self) -> Result<WcSessionData> {
        if !self.protocol.transport_connected() {
            self.protocol.open_transport().await?;
        } else {
            debug!("transport already connected, no need to set up");
        }

        self.protocol
            .subscribe_and_listen_to_topic(&self.client_id)
            .await?;
        // Restored sessions have no handshake topic to listen on.
        if !self.handshake_topic.is_empty() {
            self.protocol.listen_to_topic(&self.handshake_topic);
        }

        let fresh = !self.state.lock().expect("lock poisoned").session_established;
        if fresh {
            let data = self.create_session().await?;
            self.state.lock().expect("lock poisoned").connecting = false;
            self.emit(SessionEvent::Created);
            Ok(data)
        } else {
            let data = {
                let state = self.state.lock().expect("lock poisoned");
                WcSessionData {
                    approved: true,
                    chain_id: Some(state.chain_id),
                    network_id: Some(state.network_id),
                    accounts: state.accounts.clone(),
                    peer_id: state.peer_id.clone(),
                    peer_meta: state.wallet_meta.clone(),
                }
            };
            self.state.lock().expect("lock poisoned").connecting = false;
            self.emit(SessionEvent::Resumed);
            Ok(data)
        }
    }

    /// The handshake sub-protocol: publishes `wc_sessionRequest` on the
    /// handshake topic and suspends until the wallet approves or rejects.
    async fn create_session(&self) -> Result<WcSessionData> {
        let rx = {
            let mut waiter = self.session_waiter.lock().expect("lock poisoned");
            if waiter.as_ref().is_some_and(|tx| !tx.is_closed()) {
                return Err(Error::Usage(
                    "two sessions cannot be created at the same time",
                ));
            }
            let (tx, rx) = oneshot::channel();
            *waiter = Some(tx);
            rx
        };

        let request = JsonRpcRequest::new(
            WcMethod::SessionRequest,
            vec![SessionRequestParams {
                peer_id: self.client_id.clone(),
                peer_meta: self.dapp_meta.clone(),
                chain_id: self.chain_id(),
            }],
        );
        self.state.lock().expect("lock poisoned").handshake_id = request.id;

        if let Err(e) = self
            .protocol
            .send_request(&request, Some(&self.handshake_topic))
            .await
        {
            *self.session_waiter.lock().expect("lock poisoned") = None;
            return Err(e);
        }

        self.emit(SessionEvent::HandshakeSent);
        debug!("session request sent, waiting for wallet approval");

        rx.await.map_err(|_| Error::Disconnected)?
    }

    /// Notifies the peer, tears down the transport and runs local cleanup.
    /// Local cleanup runs even when notification or teardown fail; their
    /// error is surfaced afterwards.
    pub async fn disconnect_session(&self) -> Result<()> {
        let request = JsonRpcRequest::new(
            WcMethod::SessionUpdate,
            vec![WcSessionData {
                approved: false,
                chain_id: Some(0),
                network_id: Some(0),
                accounts: None,
                peer_id: None,
                peer_meta: None,
            }],
        );

        let notify = self.protocol.send_request(&request, None).await;
        let teardown = self.protocol.disconnect_transport().await;

        self.handle_session_disconnect().await;

        notify.and(teardown)
    }

    /// Publishes a request and suspends until the matching response
    /// arrives. An error response surfaces the peer's message; nothing is
    /// retried automatically.
    pub async fn send<P, R>(&self, request: JsonRpcRequest<P>) -> Result<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let rx = self.protocol.delegator().listen_for_response(request.id)?;

        self.protocol.send_request(&request, None).await?;
        self.emit(SessionEvent::Send);

        let response = rx.await.map_err(|_| Error::Disconnected)?;
        if let Some(error) = response.error {
            return Err(Error::JsonRpc(error));
        }
        let result = response
            .result
            .ok_or(Error::Format("response carries neither result nor error"))?;
        Ok(serde_json::from_value(result)?)
    }

    pub async fn wallet_add_eth_chain(&self, chain_data: EthChainData) -> Result<String> {
        self.send(JsonRpcRequest::new(
            WcMethod::WalletAddEthereumChain,
            vec![chain_data],
        ))
        .await
    }

    pub async fn wallet_switch_eth_chain(&self, chain: EthChain) -> Result<String> {
        self.send(JsonRpcRequest::new(
            WcMethod::WalletSwitchEthereumChain,
            vec![chain],
        ))
        .await
    }

    pub async fn wallet_update_eth_chain(&self, chain_data: EthUpdateChainData) -> Result<String> {
        self.send(JsonRpcRequest::new(
            WcMethod::WalletUpdateEthereumChain,
            vec![chain_data],
        ))
        .await
    }

    /// `eth_sign`. A non-hex message is prefixed with the Ethereum
    /// signed-message header and Keccak-256 hashed before it goes on the
    /// wire.
    pub async fn eth_sign(&self, address: Address, message: &str) -> Result<String> {
        let message = if is_hex(message) {
            message.to_string()
        } else {
            let raw = message.as_bytes();
            let mut bytes = Vec::with_capacity(raw.len() + 32);
            bytes.push(0x19);
            bytes.extend_from_slice(format!("Ethereum Signed Message:\n{}", raw.len()).as_bytes());
            bytes.extend_from_slice(raw);
            hex::encode_prefixed(keccak256(&bytes))
        };

        self.send(JsonRpcRequest::new(
            WcMethod::EthSign,
            vec![address.to_string(), message],
        ))
        .await
    }

    /// `personal_sign`. A non-hex message is hex-encoded as raw UTF-8
    /// bytes; the wallet applies the signed-message prefix itself. Note the
    /// `[message, address]` parameter order.
    pub async fn eth_personal_sign(&self, address: Address, message: &str) -> Result<String> {
        let message = if is_hex(message) {
            message.to_string()
        } else {
            hex::encode_prefixed(message.as_bytes())
        };

        self.send(JsonRpcRequest::new(
            WcMethod::PersonalSign,
            vec![message, address.to_string()],
        ))
        .await
    }

    /// `eth_signTypedData` with pre-built EIP-712 typed data, serialized as
    /// a JSON string parameter.
    pub async fn eth_sign_typed_data<V: Serialize>(
        &self,
        address: Address,
        data: &V,
    ) -> Result<String> {
        let json = serde_json::to_string(data)?;
        self.send(JsonRpcRequest::new(
            WcMethod::EthSignTypedData,
            vec![address.to_string(), json],
        ))
        .await
    }

    pub async fn eth_send_transaction(&self, transactions: &[TransactionData]) -> Result<String> {
        self.send(JsonRpcRequest::new(
            WcMethod::EthSendTransaction,
            transactions.to_vec(),
        ))
        .await
    }

    pub async fn eth_sign_transaction(&self, transactions: &[TransactionData]) -> Result<String> {
        self.send(JsonRpcRequest::new(
            WcMethod::EthSignTransaction,
            transactions.to_vec(),
        ))
        .await
    }

    /// `eth_sendRawTransaction`. Non-hex input is hex-encoded as raw UTF-8
    /// bytes, without hashing.
    pub async fn eth_send_raw_transaction(&self, data: &str) -> Result<String> {
        let data = if is_hex(data) {
            data.to_string()
        } else {
            hex::encode_prefixed(data.as_bytes())
        };

        self.send(JsonRpcRequest::new(
            WcMethod::EthSendRawTransaction,
            vec![data],
        ))
        .await
    }

    /// Registers a persistent handler for an unsolicited peer notification.
    /// Cleared on session disconnect along with the pending-request table.
    pub fn on_notification<F>(&self, method: &str, handler: F)
    where
        F: Fn(&JsonRpcRequest<Value>) + Send + Sync + 'static,
    {
        self.protocol.delegator().listen_for_generic(method, handler);
    }

    /// Entry point for inbound relay messages. Undecodable, unmatched and
    /// inactive-topic messages are dropped with a log line; they never tear
    /// down the session.
    pub async fn handle_transport_message(&self, topic: &str, payload: &str) {
        if !self.protocol.is_active_topic(topic) {
            debug!("dropping message on inactive topic {topic}");
            return;
        }

        let envelope = match self.protocol.decode_inbound(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("dropping undecodable message on topic {topic}: {e:?}");
                return;
            }
        };

        match envelope {
            Envelope::Response(response) => {
                let handshake_id = self.state.lock().expect("lock poisoned").handshake_id;
                if handshake_id != 0 && response.id == handshake_id {
                    self.handle_session_response(response).await;
                } else if !self.protocol.delegator().dispatch_response(response) {
                    debug!("dropping response with no registered waiter");
                }
            }
            Envelope::Request(request) => {
                if request.method == WcMethod::SessionUpdate.to_string() {
                    match serde_json::from_value::<Vec<WcSessionData>>(request.params.clone()) {
                        Ok(mut params) if !params.is_empty() => {
                            self.handle_session_update(Some(params.remove(0))).await;
                        }
                        _ => warn!("dropping wc_sessionUpdate with malformed params"),
                    }
                } else if !self.protocol.delegator().dispatch_generic(&request) {
                    debug!("dropping unsolicited {} with no handler", request.method);
                }
            }
        }
    }

    /// Response to the pending `wc_sessionRequest`: approval feeds the
    /// session-update handler, anything else fails the handshake waiter and
    /// forces a session disconnect.
    async fn handle_session_response(&self, response: JsonRpcResponse) {
        let data = response
            .result
            .and_then(|v| serde_json::from_value::<WcSessionData>(v).ok());

        match data {
            Some(data) if data.approved => self.handle_session_update(Some(data)).await,
            _ => {
                let error = match response.error {
                    Some(err)
                        if err.message != "Not Approved" && err.message != "Session Rejected" =>
                    {
                        Error::SessionFailed(err.message)
                    }
                    _ => Error::SessionRejected,
                };
                self.fail_session_waiter(error);
                self.handle_session_disconnect().await;
            }
        }
    }

    /// The single state-mutation point for peer-driven changes. Specific
    /// change events fire before the generic session-update event, chain
    /// before account.
    async fn handle_session_update(&self, data: Option<WcSessionData>) {
        let Some(data) = data else {
            return;
        };

        let was_connected;
        let mut change_events = Vec::new();
        {
            let mut state = self.state.lock().expect("lock poisoned");
            was_connected = state.wallet_connected;

            // We are connected if we are approved
            state.wallet_connected = data.approved;
            debug!("session approved set to {}", data.approved);

            if let Some(chain_id) = data.chain_id {
                if state.chain_id != chain_id {
                    state.chain_id = chain_id;
                    change_events.push(SessionEvent::ChainChanged(chain_id));
                }
            }

            if let Some(network_id) = data.network_id {
                state.network_id = network_id;
            }

            let new_account = data.accounts.as_ref().and_then(|a| a.first()).cloned();
            let old_account = state.accounts.as_ref().and_then(|a| a.first()).cloned();
            state.accounts = data.accounts.clone();
            if old_account != new_account {
                change_events.push(SessionEvent::AccountChanged(
                    data.accounts.clone().unwrap_or_default(),
                ));
            }

            if !was_connected && data.approved {
                state.peer_id = data.peer_id.clone();
                state.wallet_meta = data.peer_meta.clone();
                state.session_established = true;
            }
        }

        for event in change_events {
            self.emit(event);
        }

        if !was_connected && data.approved {
            // First approval: session traffic moves to the peer's topic.
            self.protocol.set_session_topic(data.peer_id.clone());
            self.resolve_session_waiter(data.clone());
        } else if was_connected && !data.approved {
            self.handle_session_disconnect().await;
        }

        self.emit(SessionEvent::SessionUpdate(data));
    }

    /// Local teardown: always runs to completion, even when the transport
    /// refuses to close.
    async fn handle_session_disconnect(&self) {
        if self.protocol.transport_connected() {
            if let Err(e) = self.protocol.disconnect_transport().await {
                warn!("transport disconnect failed during session teardown: {e:?}");
            }
        }

        self.protocol.clear_active_topics();
        self.protocol.delegator().clear();
        self.protocol.set_session_topic(None);
        self.state.lock().expect("lock poisoned").wallet_connected = false;
        self.fail_session_waiter(Error::Disconnected);

        self.emit(SessionEvent::Disconnect);
    }

    fn resolve_session_waiter(&self, data: WcSessionData) {
        if let Some(tx) = self.session_waiter.lock().expect("lock poisoned").take() {
            let _ = tx.send(Ok(data));
        }
    }

    fn fail_session_waiter(&self, error: Error) {
        if let Some(tx) = self.session_waiter.lock().expect("lock poisoned").take() {
            let _ = tx.send(Err(error));
        }
    }

    /// Snapshot of the current session, sufficient to resume later without
    /// re-handshaking. None while no session has ever been established.
    pub fn get_saved_session(&self) -> Option<SavedSession> {
        if self.status() == WalletConnectStatus::DisconnectedNoSession {
            return None;
        }

        let state = self.state.lock().expect("lock poisoned");
        Some(SavedSession {
            client_id: self.client_id.clone(),
            handshake_id: state.handshake_id,
            bridge_url: self.protocol.bridge_url().to_string(),
            key: self.protocol.key().to_string(),
            key_raw: *self.protocol.key_raw(),
            peer_id: state.peer_id.clone(),
            network_id: state.network_id,
            accounts: state.accounts.clone(),
            chain_id: state.chain_id,
            dapp_meta: self.dapp_meta.clone(),
            wallet_meta: state.wallet_meta.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher;
    use crate::transport::mock::MockTransport;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const BRIDGE: &str = "https://bridge.walletconnect.org";
    const ACCOUNT: &str = "0xAA970b3a27a8bb3e30d807aaf8d0c56d75e4a21d";

    fn dapp_meta() -> ClientMeta {
        ClientMeta {
            name: "Example Dapp".to_string(),
            description: "An example dapp".to_string(),
            url: "https://example.org".to_string(),
            icons: vec!["https://example.org/icon.png".to_string()],
        }
    }

    fn wallet_meta() -> ClientMeta {
        ClientMeta {
            name: "Example Wallet".to_string(),
            description: "A wallet".to_string(),
            url: "https://wallet.example.org".to_string(),
            icons: vec!["https://wallet.example.org/icon.png".to_string()],
        }
    }

    fn approval() -> WcSessionData {
        WcSessionData {
            approved: true,
            chain_id: Some(56),
            network_id: Some(56),
            accounts: Some(vec![ACCOUNT.to_string()]),
            peer_id: Some("c3a5b1f4-6353-4ef1-a5a0-2b1b2f56a7d0".to_string()),
            peer_meta: Some(wallet_meta()),
        }
    }

    fn new_session() -> (Arc<WalletConnectSession<MockTransport>>, MockTransport) {
        let _ = env_logger::builder().is_test(true).try_init();
        let transport = MockTransport::new();
        let session =
            WalletConnectSession::new(dapp_meta(), BRIDGE, transport.clone(), 1).unwrap();
        (Arc::new(session), transport)
    }

    async fn wait_for_published(transport: &MockTransport, count: usize) -> Vec<(String, String)> {
        for _ in 0..200 {
            let published = transport.published();
            if published.len() >= count {
                return published;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {count} published messages");
    }

    fn decrypt_request(
        session: &WalletConnectSession<MockTransport>,
        ciphertext: &str,
    ) -> JsonRpcRequest<Value> {
        match session.protocol().decode_inbound(ciphertext).unwrap() {
            Envelope::Request(request) => request,
            other => panic!("expected request, got {other:?}"),
        }
    }

    fn encrypt_response(
        session: &WalletConnectSession<MockTransport>,
        response: &JsonRpcResponse,
    ) -> String {
        let plaintext = serde_json::to_vec(response).unwrap();
        let payload = cipher::encrypt(&plaintext, session.protocol().key_raw()).unwrap();
        serde_json::to_string(&payload).unwrap()
    }

    fn success_response(id: i64, result: Value) -> JsonRpcResponse {
        JsonRpcResponse {
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    fn encrypt_update(
        session: &WalletConnectSession<MockTransport>,
        data: &WcSessionData,
    ) -> String {
        let request = JsonRpcRequest::new(WcMethod::SessionUpdate, vec![data.clone()]);
        let plaintext = serde_json::to_vec(&request).unwrap();
        let payload = cipher::encrypt(&plaintext, session.protocol().key_raw()).unwrap();
        serde_json::to_string(&payload).unwrap()
    }

    fn drain(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        seen
    }

    /// Runs the full handshake against the mock transport and returns a
    /// connected session.
    async fn connected_session() -> (Arc<WalletConnectSession<MockTransport>>, MockTransport) {
        let (session, transport) = new_session();
        let task = tokio::spawn({
            let session = session.clone();
            async move { session.connect_session().await }
        });

        let published = wait_for_published(&transport, 1).await;
        let request = decrypt_request(&session, &published[0].1);
        let response = success_response(request.id, serde_json::to_value(approval()).unwrap());
        session
            .handle_transport_message(&session.client_id().to_string(), &encrypt_response(&session, &response))
            .await;

        task.await.unwrap().unwrap();
        (session, transport)
    }

    #[test]
    fn fresh_session_has_key_and_distinct_topics() {
        let (session, _) = new_session();
        assert_eq!(session.protocol().key().len(), 64);
        assert_ne!(session.handshake_topic(), session.client_id());
        assert!(!session.handshake_topic().is_empty());
        assert_eq!(session.status(), WalletConnectStatus::DisconnectedNoSession);
        assert!(session.get_saved_session().is_none());

        let uri = session.uri();
        assert!(uri.starts_with("wc:"));
        assert!(uri.contains("@1?bridge="));
        assert!(uri.contains(session.protocol().key()));
    }

    #[test]
    fn construction_rejects_incomplete_metadata() {
        for broken in [
            ClientMeta {
                name: String::new(),
                ..dapp_meta()
            },
            ClientMeta {
                description: String::new(),
                ..dapp_meta()
            },
            ClientMeta {
                url: String::new(),
                ..dapp_meta()
            },
            ClientMeta {
                icons: vec![],
                ..dapp_meta()
            },
        ] {
            let result = WalletConnectSession::new(broken, BRIDGE, MockTransport::new(), 1);
            assert!(matches!(result, Err(Error::Validation(_))));
        }
    }

    #[tokio::test]
    async fn null_update_changes_nothing() {
        let (session, _) = new_session();
        let mut events = session.subscribe_events();

        session.handle_session_update(None).await;

        assert!(drain(&mut events).is_empty());
        assert_eq!(session.chain_id(), 1);
        assert!(!session.wallet_connected());
    }

    #[tokio::test]
    async fn handshake_approval_resolves_connect() {
        let (session, transport) = new_session();
        let mut events = session.subscribe_events();

        let task = tokio::spawn({
            let session = session.clone();
            async move { session.connect_session().await }
        });

        let published = wait_for_published(&transport, 1).await;
        let (topic, ciphertext) = &published[0];
        assert_eq!(topic, session.handshake_topic());

        let request = decrypt_request(&session, ciphertext);
        assert_eq!(request.method, "wc_sessionRequest");
        assert_eq!(
            request.params[0]["peerId"],
            Value::String(session.client_id().to_string())
        );
        assert_eq!(request.params[0]["chainId"], Value::from(1));

        let response = success_response(request.id, serde_json::to_value(approval()).unwrap());
        session
            .handle_transport_message(
                &session.client_id().to_string(),
                &encrypt_response(&session, &response),
            )
            .await;

        let data = task.await.unwrap().unwrap();
        assert!(data.approved);

        assert!(session.wallet_connected());
        assert_eq!(session.status(), WalletConnectStatus::Connected);
        assert_eq!(session.chain_id(), 56);
        assert_eq!(session.network_id(), 56);
        assert_eq!(session.accounts(), Some(vec![ACCOUNT.to_string()]));
        assert_eq!(session.wallet_metadata(), Some(wallet_meta()));

        let seen = drain(&mut events);
        let position = |wanted: fn(&SessionEvent) -> bool| {
            seen.iter().position(wanted).expect("event not fired")
        };
        let chain = position(|e| matches!(e, SessionEvent::ChainChanged(56)));
        let account = position(|e| matches!(e, SessionEvent::AccountChanged(_)));
        let update = position(|e| matches!(e, SessionEvent::SessionUpdate(_)));
        assert!(chain < account && account < update);
        assert!(seen.contains(&SessionEvent::HandshakeSent));
        assert!(seen.contains(&SessionEvent::Created));
        assert!(seen.contains(&SessionEvent::Connect));
        assert!(!seen.contains(&SessionEvent::Resumed));
    }

    #[tokio::test]
    async fn second_concurrent_handshake_is_a_usage_error() {
        let (session, transport) = new_session();

        let task = tokio::spawn({
            let session = session.clone();
            async move { session.connect_session().await }
        });
        let published = wait_for_published(&transport, 1).await;

        let result = session.connect_session().await;
        assert!(matches!(result, Err(Error::Usage(_))));

        // The first waiter is unharmed: approval still resolves it.
        let request = decrypt_request(&session, &published[0].1);
        let response = success_response(request.id, serde_json::to_value(approval()).unwrap());
        session
            .handle_transport_message(
                &session.client_id().to_string(),
                &encrypt_response(&session, &response),
            )
            .await;
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn losing_concurrent_connect_does_not_clear_the_connecting_status() {
        let (session, transport) = new_session();

        let task = tokio::spawn({
            let session = session.clone();
            async move { session.connect_session().await }
        });
        let published = wait_for_published(&transport, 1).await;

        assert!(matches!(
            session.connect_session().await,
            Err(Error::Usage(_))
        ));
        // The first attempt owns the status.
        assert_eq!(session.status(), WalletConnectStatus::Connecting);

        let request = decrypt_request(&session, &published[0].1);
        let response = success_response(request.id, serde_json::to_value(approval()).unwrap());
        session
            .handle_transport_message(
                &session.client_id().to_string(),
                &encrypt_response(&session, &response),
            )
            .await;
        task.await.unwrap().unwrap();
        assert_eq!(session.status(), WalletConnectStatus::Connected);
    }

    #[tokio::test]
    async fn handshake_rejection_disconnects() {
        let (session, transport) = new_session();
        let mut events = session.subscribe_events();

        let task = tokio::spawn({
            let session = session.clone();
            async move { session.connect_session().await }
        });
        let published = wait_for_published(&transport, 1).await;
        let request = decrypt_request(&session, &published[0].1);

        let response = JsonRpcResponse {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(crate::types::JsonRpcError {
                code: -32000,
                message: "Session Rejected".to_string(),
                data: None,
            }),
            id: request.id,
        };
        session
            .handle_transport_message(
                &session.client_id().to_string(),
                &encrypt_response(&session, &response),
            )
            .await;

        assert!(matches!(
            task.await.unwrap(),
            Err(Error::SessionRejected)
        ));
        assert!(!session.wallet_connected());
        assert!(!transport.is_connected());
        assert_eq!(session.status(), WalletConnectStatus::DisconnectedNoSession);
        assert!(drain(&mut events).contains(&SessionEvent::Disconnect));
    }

    #[tokio::test]
    async fn repeated_update_fires_only_the_generic_event() {
        let (session, _transport) = connected_session().await;
        let mut events = session.subscribe_events();

        session
            .handle_transport_message(
                &session.client_id().to_string(),
                &encrypt_update(&session, &approval()),
            )
            .await;

        let seen = drain(&mut events);
        assert!(!seen.iter().any(|e| matches!(e, SessionEvent::ChainChanged(_))));
        assert!(!seen.iter().any(|e| matches!(e, SessionEvent::AccountChanged(_))));
        assert!(seen.iter().any(|e| matches!(e, SessionEvent::SessionUpdate(_))));
    }

    #[tokio::test]
    async fn unapproved_update_disconnects_before_the_generic_event() {
        let (session, transport) = connected_session().await;
        let mut events = session.subscribe_events();

        let update = WcSessionData {
            approved: false,
            chain_id: None,
            network_id: None,
            accounts: None,
            peer_id: None,
            peer_meta: None,
        };
        session
            .handle_transport_message(
                &session.client_id().to_string(),
                &encrypt_update(&session, &update),
            )
            .await;

        assert!(!session.wallet_connected());
        assert!(!transport.is_connected());
        assert!(!session.protocol().is_active_topic(session.client_id()));
        // Session existed before, so the status is Disconnected rather
        // than DisconnectedNoSession.
        assert_eq!(session.status(), WalletConnectStatus::Disconnected);

        let seen = drain(&mut events);
        let disconnect = seen
            .iter()
            .position(|e| matches!(e, SessionEvent::Disconnect))
            .expect("disconnect not fired");
        let update = seen
            .iter()
            .position(|e| matches!(e, SessionEvent::SessionUpdate(_)))
            .expect("session update not fired");
        assert!(disconnect < update);
    }

    #[tokio::test]
    async fn eth_sign_hashes_non_hex_messages() {
        let (session, transport) = connected_session().await;
        let address: Address = ACCOUNT.parse().unwrap();
        let baseline = transport.published().len();

        let task = tokio::spawn({
            let session = session.clone();
            async move { session.eth_sign(address, "hello").await }
        });

        let published = wait_for_published(&transport, baseline + 1).await;
        let (topic, ciphertext) = &published[baseline];
        // Session traffic goes to the peer's topic, not the handshake topic.
        assert_eq!(topic, &approval().peer_id.unwrap());

        let request = decrypt_request(&session, ciphertext);
        assert_eq!(request.method, "eth_sign");
        assert_eq!(request.params[0], Value::String(address.to_string()));

        let mut prefixed = vec![0x19u8];
        prefixed.extend_from_slice(b"Ethereum Signed Message:\n5hello");
        let expected = hex::encode_prefixed(keccak256(&prefixed));
        assert_eq!(request.params[1], Value::String(expected));

        let response = success_response(request.id, Value::String("0xsigned".to_string()));
        session
            .handle_transport_message(
                &session.client_id().to_string(),
                &encrypt_response(&session, &response),
            )
            .await;

        assert_eq!(task.await.unwrap().unwrap(), "0xsigned");
    }

    #[tokio::test]
    async fn personal_sign_encodes_raw_bytes_without_hashing() {
        let (session, transport) = connected_session().await;
        let address: Address = ACCOUNT.parse().unwrap();
        let baseline = transport.published().len();

        let task = tokio::spawn({
            let session = session.clone();
            async move { session.eth_personal_sign(address, "hello").await }
        });

        let published = wait_for_published(&transport, baseline + 1).await;
        let request = decrypt_request(&session, &published[baseline].1);
        assert_eq!(request.method, "personal_sign");
        // personal_sign parameter order is [message, address]
        assert_eq!(
            request.params[0],
            Value::String("0x68656c6c6f".to_string())
        );
        assert_eq!(request.params[1], Value::String(address.to_string()));

        let response = success_response(request.id, Value::String("0xsigned".to_string()));
        session
            .handle_transport_message(
                &session.client_id().to_string(),
                &encrypt_response(&session, &response),
            )
            .await;
        assert_eq!(task.await.unwrap().unwrap(), "0xsigned");
    }

    #[tokio::test]
    async fn hex_messages_pass_through_unchanged() {
        let (session, transport) = connected_session().await;
        let address: Address = ACCOUNT.parse().unwrap();
        let baseline = transport.published().len();

        let task = tokio::spawn({
            let session = session.clone();
            async move { session.eth_sign(address, "0xdeadbeef").await }
        });

        let published = wait_for_published(&transport, baseline + 1).await;
        let request = decrypt_request(&session, &published[baseline].1);
        assert_eq!(request.params[1], Value::String("0xdeadbeef".to_string()));

        let response = success_response(request.id, Value::String("0xsigned".to_string()));
        session
            .handle_transport_message(
                &session.client_id().to_string(),
                &encrypt_response(&session, &response),
            )
            .await;
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn error_responses_surface_the_peer_message() {
        let (session, transport) = connected_session().await;
        let baseline = transport.published().len();

        let task = tokio::spawn({
            let session = session.clone();
            async move {
                session
                    .wallet_switch_eth_chain(EthChain {
                        chain_id: "0x38".to_string(),
                    })
                    .await
            }
        });

        let published = wait_for_published(&transport, baseline + 1).await;
        let request = decrypt_request(&session, &published[baseline].1);
        assert_eq!(request.method, "wallet_switchEthereumChain");

        let response = JsonRpcResponse {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(crate::types::JsonRpcError {
                code: 4001,
                message: "User rejected the request".to_string(),
                data: None,
            }),
            id: request.id,
        };
        session
            .handle_transport_message(
                &session.client_id().to_string(),
                &encrypt_response(&session, &response),
            )
            .await;

        match task.await.unwrap() {
            Err(Error::JsonRpc(err)) => {
                assert_eq!(err.message, "User rejected the request");
            }
            other => panic!("expected json-rpc error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn concurrent_sends_resolve_out_of_order() {
        let (session, transport) = connected_session().await;
        let baseline = transport.published().len();

        let first = tokio::spawn({
            let session = session.clone();
            async move {
                session
                    .send::<_, String>(JsonRpcRequest::new(
                        WcMethod::EthSendRawTransaction,
                        vec!["0xaa".to_string()],
                    ))
                    .await
            }
        });
        let second = tokio::spawn({
            let session = session.clone();
            async move {
                session
                    .send::<_, String>(JsonRpcRequest::new(
                        WcMethod::EthSendRawTransaction,
                        vec!["0xbb".to_string()],
                    ))
                    .await
            }
        });

        let published = wait_for_published(&transport, baseline + 2).await;
        let mut requests: Vec<JsonRpcRequest<Value>> = published[baseline..]
            .iter()
            .map(|(_, ciphertext)| decrypt_request(&session, ciphertext))
            .collect();
        requests.sort_by_key(|r| r.params[0].as_str().unwrap().to_string());

        // Respond to 0xbb first, then 0xaa.
        for (request, result) in [(&requests[1], "second"), (&requests[0], "first")] {
            let response = success_response(request.id, Value::String(result.to_string()));
            session
                .handle_transport_message(
                    &session.client_id().to_string(),
                    &encrypt_response(&session, &response),
                )
                .await;
        }

        assert_eq!(first.await.unwrap().unwrap(), "first");
        assert_eq!(second.await.unwrap().unwrap(), "second");
    }

    #[tokio::test]
    async fn saved_session_resumes_without_handshake() {
        let (session, _transport) = connected_session().await;
        let saved = session.get_saved_session().unwrap();

        let transport = MockTransport::new();
        let restored = WalletConnectSession::from_saved(saved.clone(), transport.clone());
        assert_eq!(restored.chain_id(), session.chain_id());
        assert_eq!(restored.network_id(), session.network_id());
        assert_eq!(restored.accounts(), session.accounts());
        assert_eq!(restored.protocol().key(), session.protocol().key());
        assert_eq!(restored.status(), WalletConnectStatus::Connected);

        let mut events = restored.subscribe_events();
        let data = restored.connect_session().await.unwrap();
        assert!(data.approved);
        assert_eq!(data.chain_id, Some(56));

        // No handshake was published on resume, and the empty handshake
        // topic of a restored session is never listened on.
        assert!(transport.published().is_empty());
        assert!(!restored.protocol().is_active_topic(""));
        assert!(restored.protocol().is_active_topic(restored.client_id()));
        let seen = drain(&mut events);
        assert!(seen.contains(&SessionEvent::Resumed));
        assert!(seen.contains(&SessionEvent::Connect));
        assert!(!seen.contains(&SessionEvent::Created));
    }

    #[tokio::test]
    async fn inflight_send_resolves_when_the_session_disconnects() {
        let (session, transport) = connected_session().await;
        let baseline = transport.published().len();

        let task = tokio::spawn({
            let session = session.clone();
            async move {
                session
                    .send::<_, String>(JsonRpcRequest::new(
                        WcMethod::EthSendRawTransaction,
                        vec!["0xaa".to_string()],
                    ))
                    .await
            }
        });
        wait_for_published(&transport, baseline + 1).await;

        session.disconnect_session().await.unwrap();

        // Clearing the dispatch table fails the waiter instead of leaving
        // the send suspended forever.
        let result = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("send did not resolve after disconnect")
            .unwrap();
        assert!(matches!(result, Err(Error::Disconnected)));
    }

    #[tokio::test]
    async fn disconnect_session_cleans_up_even_when_publish_fails() {
        let (session, transport) = connected_session().await;
        let mut events = session.subscribe_events();

        transport.fail_next_publishes();
        let result = session.disconnect_session().await;

        assert!(matches!(result, Err(Error::Transport(_))));
        assert!(!session.wallet_connected());
        assert!(!session.protocol().is_active_topic(session.client_id()));
        assert!(drain(&mut events).contains(&SessionEvent::Disconnect));
    }

    #[tokio::test]
    async fn disconnect_session_notifies_the_peer() {
        let (session, transport) = connected_session().await;
        let baseline = transport.published().len();

        session.disconnect_session().await.unwrap();

        let published = transport.published();
        assert_eq!(published.len(), baseline + 1);
        let request = decrypt_request(&session, &published[baseline].1);
        assert_eq!(request.method, "wc_sessionUpdate");
        assert_eq!(request.params[0]["approved"], Value::Bool(false));
        assert_eq!(request.params[0]["chainId"], Value::from(0));
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn unmatched_and_undecodable_messages_are_dropped() {
        let (session, _transport) = connected_session().await;
        let client_topic = session.client_id().to_string();

        // Inactive topic
        session
            .handle_transport_message("some-other-topic", "whatever")
            .await;
        // Garbage ciphertext
        session
            .handle_transport_message(&client_topic, "not json")
            .await;
        // Response nobody is waiting for
        let stray = success_response(12345, Value::String("0x0".to_string()));
        session
            .handle_transport_message(&client_topic, &encrypt_response(&session, &stray))
            .await;

        assert!(session.wallet_connected());
        assert_eq!(session.chain_id(), 56);
    }

    #[tokio::test]
    async fn generic_notifications_reach_registered_handlers() {
        let (session, _transport) = connected_session().await;
        let fired = Arc::new(AtomicUsize::new(0));
        let seen = fired.clone();
        session.on_notification("wc_customNotification", move |request| {
            assert_eq!(request.method, "wc_customNotification");
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let request = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            method: "wc_customNotification".to_string(),
            params: Value::Array(vec![]),
            id: 999,
        };
        let plaintext = serde_json::to_vec(&request).unwrap();
        let payload = cipher::encrypt(&plaintext, session.protocol().key_raw()).unwrap();
        let ciphertext = serde_json::to_string(&payload).unwrap();

        session
            .handle_transport_message(&session.client_id().to_string(), &ciphertext)
            .await;
        session
            .handle_transport_message(&session.client_id().to_string(), &ciphertext)
            .await;

        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }
}

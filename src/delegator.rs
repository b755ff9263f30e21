//! Correlates inbound decrypted messages to the operation awaiting them.
//!
//! Responses are matched by request id against a one-shot table: each entry
//! fires once and removes itself. Peer-initiated notifications are matched
//! by method name against persistent handlers that may fire any number of
//! times. Both tables are cleared on session disconnect so stale callbacks
//! can never fire after teardown.

use std::collections::HashMap;
use std::sync::Mutex;

use log::debug;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::types::{JsonRpcRequest, JsonRpcResponse};

type GenericHandler = Box<dyn Fn(&JsonRpcRequest<Value>) + Send + Sync>;

#[derive(Default)]
pub struct EventDelegator {
    responses: Mutex<HashMap<i64, oneshot::Sender<JsonRpcResponse>>>,
    generic: Mutex<HashMap<String, GenericHandler>>,
}

impl EventDelegator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a one-shot waiter for the response with the given id.
    ///
    /// At most one live waiter may exist per id. Registering over a waiter
    /// whose receiver was dropped is fine; registering over a live one is a
    /// caller bug.
    pub fn listen_for_response(&self, id: i64) -> Result<oneshot::Receiver<JsonRpcResponse>> {
        let mut responses = self.responses.lock().expect("lock poisoned");
        if responses.get(&id).is_some_and(|tx| !tx.is_closed()) {
            return Err(Error::Usage(
                "a response waiter is already registered for this id",
            ));
        }
        let (tx, rx) = oneshot::channel();
        responses.insert(id, tx);
        Ok(rx)
    }

    /// Registers a persistent handler for an unsolicited peer notification,
    /// keyed by JSON-RPC method name.
    pub fn listen_for_generic<F>(&self, method: &str, handler: F)
    where
        F: Fn(&JsonRpcRequest<Value>) + Send + Sync + 'static,
    {
        self.generic
            .lock()
            .expect("lock poisoned")
            .insert(method.to_string(), Box::new(handler));
    }

    /// Routes a response to its waiter. Returns false if no waiter matched.
    pub fn dispatch_response(&self, response: JsonRpcResponse) -> bool {
        let sender = self
            .responses
            .lock()
            .expect("lock poisoned")
            .remove(&response.id);
        match sender {
            Some(tx) => {
                if tx.send(response).is_err() {
                    debug!("response waiter went away before the response arrived");
                }
                true
            }
            None => false,
        }
    }

    /// Fires the generic handler matching the request method, synchronously
    /// on the calling context. Returns false if no handler matched.
    pub fn dispatch_generic(&self, request: &JsonRpcRequest<Value>) -> bool {
        let generic = self.generic.lock().expect("lock poisoned");
        match generic.get(&request.method) {
            Some(handler) => {
                handler(request);
                true
            }
            None => false,
        }
    }

    /// Drops every registration. Pending response waiters resolve with a
    /// closed-channel error on their receiver side.
    pub fn clear(&self) {
        self.responses.lock().expect("lock poisoned").clear();
        self.generic.lock().expect("lock poisoned").clear();
    }
}

//! # walletconnect-v1
//!
//! A Rust client implementation of the WalletConnect v1 session protocol:
//! encrypted relay-based sessions between a dapp and a wallet, with typed
//! JSON-RPC calls for signing and chain management.
//!
//! ## Features
//! - Session handshake, resume and disconnect
//! - AES-256-CBC + HMAC-SHA256 payload encryption
//! - Typed Ethereum RPC operations (sign, transactions, chain switching)
//! - Observable session events
//!
//! ## Example
//!
//! ```ignore
//! // `transport` is any relay implementation of the `Transport` trait.
//! let session = WalletConnectSession::new(
//!     ClientMeta {
//!         name: "My Dapp".to_string(),
//!         description: "My dapp talks to wallets".to_string(),
//!         url: "https://my-dapp.example.org".to_string(),
//!         icons: vec!["https://my-dapp.example.org/icon.png".to_string()],
//!     },
//!     "https://bridge.walletconnect.org",
//!     transport,
//!     1,
//! )?;
//!
//! // Render session.uri() as a QR code, then:
//! let session_data = session.connect_session().await?;
//! println!("connected accounts: {:?}", session_data.accounts);
//!
//! let signature = session
//!     .eth_personal_sign("0x0000000000000000000000000000000000000123".parse()?, "hello")
//!     .await?;
//!
//! // Feed inbound relay messages from the transport reader task:
//! // session.handle_transport_message(topic, ciphertext).await;
//! ```
//!
//! ## License
//! MIT OR Apache-2.0

#![allow(async_fn_in_trait)]

pub mod cipher;
pub mod delegator;
pub mod error;
pub mod protocol;
pub mod rpc;
pub mod session;
pub mod transport;
pub mod types;
pub mod utils;

/// Exposed for easy access
pub use error::{Error, Result};
pub use session::WalletConnectSession;
pub use transport::Transport;
pub use types::{ClientMeta, SavedSession, SessionEvent, WalletConnectStatus, WcSessionData};

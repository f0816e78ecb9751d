//! Transport layer for the agent control channel.
//!
//! Provides:
//! - Wire protocol for session-level messages
//! - Message codec with optional authenticated encryption
//! - Credentials and access policy seams
//! - The transport session state machine
//! - WebSocket connector (feature: websocket) and an in-memory connector

pub mod codec;
pub mod connection;
pub mod credentials;
pub mod error;
pub mod memory;
pub mod policy;
pub mod protocol;
pub mod session;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use codec::{Cipher, CodecError, Decoded, Envelope, MessageCodec};
pub use connection::{Connection, Connector, Frame, close_code};
pub use credentials::{
    AuthToken, CredentialError, Credentials, EncryptionKey, StaticTokenIssuer, TokenIssuer,
};
pub use error::TransportError;
pub use memory::{MemoryConnector, RemoteEnd};
pub use policy::{AccessPolicy, AllowAll, HostPolicy};
pub use protocol::ControlMessage;
pub use session::{TransportSession, TransportSessionBuilder};
#[cfg(feature = "websocket")]
pub use websocket::WsConnector;

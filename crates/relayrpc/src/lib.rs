//! # relayrpc
//!
//! A bidirectional, capability-passing RPC runtime over any byte transport.
//!
//! Two peers export services to each other and call each other's functions.
//! Arguments and results may carry functions, binary buffers, streams and
//! custom types; functions cross the wire as references and come back out as
//! callable proxies.
//!
//! ```text
//! call -> encode (mint handles) -> main ++ extra -> Transport::send
//! Transport::recv -> decode (resolve handles) -> service lookup -> invoke
//!      -> resolve/reject -> encode -> Transport::send
//! ```

pub mod chunk;
pub mod codec;
pub mod config;
pub mod envelope;
pub mod error;
pub mod events;
pub mod hub;
pub mod message;
pub mod mock_transport;
pub mod peer;
pub mod refstore;
pub mod remote;
pub mod service;
pub mod session;
pub mod transport;
pub mod value;

mod builtin;
mod decode;
mod encode;

pub use builtin::BUILTIN_SERVICE_ID;
pub use codec::Codec;
pub use config::PeerConfig;
pub use decode::DecodeContext;
pub use encode::EncodeContext;
pub use error::Result;
pub use error::RpcError;
pub use peer::Peer;
pub use remote::RemoteService;
pub use service::RequireContext;
pub use service::ServiceApi;
pub use service::ServiceConfig;
pub use service::ServiceObject;
pub use service::Visibility;
pub use transport::Transport;
pub use transport::TransportError;
pub use value::Callable;
pub use value::DType;
pub use value::Value;
pub use value::kwargs;

#[cfg(test)]
mod tests;

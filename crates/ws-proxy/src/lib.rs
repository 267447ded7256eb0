//! Multi-leg WebSocket relay.
//!
//! A single [`ProxyContext`] routes messages between any combination of legs:
//! a client-facing listener ("port"), a relay listener for other instances
//! ("relay"), an outbound link to the real backend ("target"), an outbound
//! link to another instance's relay ("forward"), a diagnostic echo sink, and
//! a message script.
//!
//! # Architecture
//!
//! ```text
//!                    client side                 target side
//! Clients  <--WS-->  [port]    --client msg-->   [target]   <--WS-->  Backend
//!                              <--target msg--
//! Relayed  <--WS-->  [relay]                     [forward]  <--WS-->  Another
//! instances                   [echo] [messages]                     instance's relay
//! ```
//!
//! Every inbound frame becomes a broadcast on one side of the fabric and is
//! delivered synchronously, in registration order, to the matching handler of
//! every live [`Service`]. A link that goes away is announced with
//! [`Payload::Closed`], which the opposite legs treat as "close your end".
//! Outbound connectors queue traffic until their socket opens and replace
//! themselves with a fresh instance after any failure.

pub mod connector;
pub mod context;
pub mod echo;
pub mod listener;
pub mod message;
pub mod proxy;
pub mod script;
pub mod socket;

#[cfg(test)]
mod testing;

// Re-export the primary public types at the crate root for convenience.
pub use connector::{resolve_address, ConnectorError, ConnectorRole, ConnectorService};
pub use context::{ProxyContext, Service, ServiceId};
pub use echo::EchoService;
pub use listener::{ListenerRole, ListenerService};
pub use message::{Envelope, Payload, Side};
pub use proxy::{Proxy, ProxyOptions, RunningProxy};
pub use script::{parse_script, ScriptEntry, ScriptService};
pub use socket::{SocketHandle, SocketId};

//! pwchan runtime - Connection, object registry and value codec
//!
//! This crate provides the runtime half of the driver protocol:
//!
//! - **Transport**: Length-prefixed JSON frames over the driver's stdio pipes
//! - **Connection**: Request/response correlation and event dispatch
//! - **Object registry**: Remote objects by GUID, created and disposed by the driver
//! - **Event waiters**: One-shot waits for the next event on an object
//! - **Codec**: Values richer than JSON (`undefined`, `NaN`, `-0`, handles)
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐
//! │   facades    │  Typed proxies (Browser, Page, etc.)
//! └──────┬───────┘
//!        │ registers constructors in a TypeRegistry
//! ┌──────▼───────┐
//! │    pwchan    │  This crate
//! │  ┌────────┐  │
//! │  │ Owner  │  │  ChannelOwner proxies, waiters
//! │  └────────┘  │
//! │  ┌────────┐  │
//! │  │ Conn   │  │  Correlation, registry, dispatch pump
//! │  └────────┘  │
//! │  ┌────────┐  │
//! │  │ Trans  │  │  Pipe transport, frame codec
//! │  └────────┘  │
//! └──────────────┘
//! ```
//!
//! # Pumping
//!
//! There is no background reader. A task awaiting a call reply or an event
//! becomes the reader while it waits: it reads and dispatches frames until
//! its own result arrives. [`Connection::run`] pumps for callers that want
//! events delivered with nothing outstanding.
//!
//! # Decoupling via ObjectFactory
//!
//! The `Connection` creates proxies through the `ObjectFactory` trait, so
//! this crate does not depend on facade types. [`TypeRegistry`] is the
//! table-driven factory; unknown types become a generic [`RemoteObject`].

pub mod channel;
pub mod channel_owner;
pub mod codec;
pub mod connection;
pub mod error;
pub mod events;
pub mod remote_object;
pub mod transport;

// Re-export key types at crate root
pub use channel::Channel;
pub use channel_owner::{ChannelOwner, ChannelOwnerImpl, DisposeReason, ParentOrConnection};
pub use codec::{JsValue, decode, decode_json, decode_value, encode};
pub use connection::{
    AsyncValueResult, Connection, ConnectionLike, ConnectionOptions, ObjectFactory, ObjectStore,
    ROOT_GUID,
};
pub use error::{Error, Result};
pub use events::{EventWaiter, EventWaiters};
pub use pwchan_protocol as protocol;
pub use pwchan_protocol::{Event, Message, Metadata, Request, Response};
pub use remote_object::{Constructor, RemoteObject, TypeRegistry};
pub use transport::{
    FrameDecoder, PipeTransport, PipeTransportReceiver, PipeTransportSender, TransportConfig,
    TransportParts, TransportReceiver, TransportSender,
};

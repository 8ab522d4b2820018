//! Wire types for the driver protocol.
//!
//! This crate contains the serde-serializable types exchanged with the driver
//! process. These types represent the "protocol layer" - the shapes of data as
//! they appear inside each length-prefixed frame.
//!
//! # Design Philosophy
//!
//! Types in this crate are:
//! - **Pure data**: No behavior beyond serialization/deserialization
//! - **1:1 with the wire**: Field names and tags match the driver's JSON
//! - **Stable**: Changes only when the wire protocol changes
//!
//! Connection state, the object registry and the value codec that resolves
//! handle references live in `pwchan-runtime`.

pub mod message;
pub mod value;

pub use message::*;
pub use value::*;

//! The broker RPC surface as seen by the client.
//!
//! Encoding and framing are left to the [`Dialer`](crate::connection::Dialer) implementation; this module only
//! defines the shapes of the calls and how their failures are classified.
pub mod error;
pub mod messages;

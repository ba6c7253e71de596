//! Resilient client for partitioned, replicated stream brokers.
//!
//! The [`Client`](client::Client) keeps a cached view of the cluster [`Metadata`](metadata::Metadata), fails over
//! between brokers when one becomes unavailable and pools per-broker connections for subscriptions. The RPC
//! transport itself is plugged in via the [`Dialer`](connection::Dialer) and [`Connection`](connection::Connection)
//! traits.
#![deny(
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls,
    rust_2018_idioms,
    unsafe_code
)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::future_not_send,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]
pub mod client;
pub mod connection;
pub mod message;
pub mod metadata;
pub mod protocol;

#[cfg(test)]
mod test_utils;

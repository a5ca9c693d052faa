//! Remote Data Gateway: the network boundary of the client.
//!
//! Every call resolves to a [`GatewayResponse`] with the same three fields,
//! whatever happened on the wire. Transport failures never surface as Rust
//! errors here; they become `status = 0`.

mod client;
mod types;

use futures::future::BoxFuture;

pub use client::HttpGateway;
pub use types::{decode, GatewayResponse, Method, RequestOptions};

/// Anything that can carry a request to the notes server.
pub trait RemoteGateway: Send + Sync {
  /// Send a request to `endpoint` (a path such as `/api/entries`).
  fn request<'a>(&'a self, endpoint: &'a str, options: RequestOptions)
    -> BoxFuture<'a, GatewayResponse>;
}

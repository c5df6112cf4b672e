//! Fetching external resources.
//!
//! | Concern | Where |
//! |---|---|
//! | **Trait** | [`Fetcher`]: one async `fetch` per request, mockable |
//! | **HTTP / file / data** | [`HttpFetcher`] (`reqwest`, `tokio::fs`, [`data_url`]) |
//! | **`data:` URLs** | [`data_url`]: encode, decode, image sniffing |
//!
//! Requests carry the browser-style negotiation the resolvers decided on:
//! a [`RequestMode`] (plain image load or CORS fetch) and a [`Credentials`]
//! policy derived from the same-origin check.

pub mod backend;
pub mod data_url;
pub mod http_backend;

pub use backend::{Credentials, FetchError, FetchRequest, FetchedResource, Fetcher, RequestMode};
pub use http_backend::HttpFetcher;

//! Record store and HTTP fetch utilities for ccal importers and maintenance tools.

pub mod http;
pub mod store;

pub use http::{
    classify_status, BackoffPolicy, Fetch, FetchError, FetchOptions, FetchedResponse,
    HttpClientConfig, HttpFetcher, RetryDisposition,
};
pub use reqwest::{StatusCode, Url};
pub use store::{MemoryStore, StoreError, Stored};

pub const CRATE_NAME: &str = "ccal-storage";

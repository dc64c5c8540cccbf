//! Quota-enforcing gateway in front of an OpenAI-compatible completions API.
//!
//! Callers authenticate with their own API key. Each key is mapped to a
//! namespace (learned from the upstream on first use), every namespace gets a
//! fixed number of completion requests per local calendar day, and admitted
//! requests are relayed upstream under a single service credential.

pub mod configuration;
pub mod error;
pub mod gateway;
pub mod mappings;
pub mod metric;
pub mod quota;
pub mod relay;
pub mod resolver;
pub mod server;
pub mod store;
pub mod upstream;
pub mod usage;

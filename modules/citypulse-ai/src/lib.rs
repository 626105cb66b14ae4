//! Remote AI capabilities behind dyn-compatible traits.
//!
//! Both are opaque request/response calls: text in, vector or structured
//! blob out. Everything else in the system treats them as remote calls
//! that can fail transiently.

pub mod embedder;
pub mod insight;

pub use embedder::{Embedder, TextEmbedder};
pub use insight::{InsightClient, InsightModel};

#[cfg(feature = "test-utils")]
pub mod testing;

//! Deterministic test doubles for the AI traits.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::{bail, Result};
use serde_json::json;

use crate::{InsightModel, TextEmbedder};

/// Deterministic hash-based vectors. Same text always embeds to the same
/// vector; different texts differ in the first component.
pub struct FixedEmbedder {
    dim: usize,
    calls: AtomicUsize,
}

impl FixedEmbedder {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of embed/embed_batch calls made.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        let mut hash: u32 = 2166136261;
        for byte in text.bytes() {
            hash ^= byte as u32;
            hash = hash.wrapping_mul(16777619);
        }
        let mut v = vec![0.0f32; self.dim];
        if self.dim > 0 {
            v[0] = (hash % 1000) as f32 / 1000.0;
        }
        v
    }
}

#[async_trait::async_trait]
impl TextEmbedder for FixedEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.vector_for(text))
    }

    async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts.iter().map(|t| self.vector_for(t)).collect())
    }
}

/// Fails the first `failures` calls, then behaves like FixedEmbedder.
/// Simulates transient remote unavailability.
pub struct FlakyEmbedder {
    inner: FixedEmbedder,
    failures_left: Mutex<usize>,
}

impl FlakyEmbedder {
    pub fn new(dim: usize, failures: usize) -> Self {
        Self {
            inner: FixedEmbedder::new(dim),
            failures_left: Mutex::new(failures),
        }
    }

    fn should_fail(&self) -> bool {
        let mut left = self.failures_left.lock().expect("failures lock poisoned");
        if *left > 0 {
            *left -= 1;
            true
        } else {
            false
        }
    }
}

#[async_trait::async_trait]
impl TextEmbedder for FlakyEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if self.should_fail() {
            bail!("embedding endpoint unavailable");
        }
        self.inner.embed(text).await
    }

    async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        if self.should_fail() {
            bail!("embedding endpoint unavailable");
        }
        self.inner.embed_batch(texts).await
    }
}

/// Canned insight model. Returns a fixed blob and records prompts.
pub struct MockInsight {
    response: serde_json::Value,
    prompts: Mutex<Vec<String>>,
}

impl MockInsight {
    pub fn new() -> Self {
        Self {
            response: json!({"summary": "mock insight"}),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn with_response(response: serde_json::Value) -> Self {
        Self {
            response,
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().expect("prompts lock poisoned").clone()
    }
}

impl Default for MockInsight {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl InsightModel for MockInsight {
    async fn generate(&self, prompt: &str) -> Result<serde_json::Value> {
        self.prompts
            .lock()
            .expect("prompts lock poisoned")
            .push(prompt.to_string());
        Ok(self.response.clone())
    }
}

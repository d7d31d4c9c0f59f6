//! Rule persistence seam
//!
//! Durability for rule documents lives outside the engine process. The
//! engine pushes the full rule set through this trait after every
//! mutation and pulls it back on load; it never persists runtime state
//! (sustain windows, transitions, the trace ring are in-memory only).

use async_trait::async_trait;
use std::sync::Mutex;
use thiserror::Error;

use crate::rule::RuleConfig;

/// Rule store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("corrupt rule document: {0}")]
    Corrupt(String),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Durable CRUD for rule documents
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Load every stored rule document
    async fn load_all(&self) -> StoreResult<Vec<RuleConfig>>;

    /// Replace the stored rule set with the given documents
    async fn save_all(&self, rules: &[RuleConfig]) -> StoreResult<()>;
}

/// In-memory store used by tests and ephemeral deployments
#[derive(Default)]
pub struct MemoryRuleStore {
    rules: Mutex<Vec<RuleConfig>>,
}

impl MemoryRuleStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-seeded with rule documents
    pub fn with_rules(rules: Vec<RuleConfig>) -> Self {
        Self {
            rules: Mutex::new(rules),
        }
    }
}

#[async_trait]
impl RuleStore for MemoryRuleStore {
    async fn load_all(&self) -> StoreResult<Vec<RuleConfig>> {
        Ok(self
            .rules
            .lock()
            .map_err(|_| StoreError::Backend("store lock poisoned".to_string()))?
            .clone())
    }

    async fn save_all(&self, rules: &[RuleConfig]) -> StoreResult<()> {
        *self
            .rules
            .lock()
            .map_err(|_| StoreError::Backend("store lock poisoned".to_string()))? =
            rules.to_vec();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mg_core::Ieee;

    fn config(id: &str) -> RuleConfig {
        RuleConfig {
            id: Some(id.to_string()),
            name: None,
            source_ieee: Ieee::new(1),
            conditions: Vec::new(),
            prerequisites: Vec::new(),
            then_sequence: Vec::new(),
            else_sequence: Vec::new(),
            cooldown: 0.0,
            enabled: true,
        }
    }

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryRuleStore::new();
        assert!(store.load_all().await.unwrap().is_empty());

        store
            .save_all(&[config("a"), config("b")])
            .await
            .unwrap();

        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].id.as_deref(), Some("a"));

        // save_all replaces, not appends
        store.save_all(&[config("c")]).await.unwrap();
        assert_eq!(store.load_all().await.unwrap().len(), 1);
    }
}

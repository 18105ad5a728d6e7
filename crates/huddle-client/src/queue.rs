//! FIFO operation serialization
//!
//! Negotiations on the same stream must not interleave. Each stream id gets
//! an [`OperationSerializer`]; operations on different streams run
//! concurrently.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, PoisonError};
use tokio::sync::Mutex;

/// Runs submitted operations one at a time, in submission order
#[derive(Debug, Default)]
pub struct OperationSerializer {
    // tokio's Mutex is fair: waiters are woken in FIFO order
    turn: Mutex<()>,
}

impl OperationSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `operation` once every earlier operation has finished.
    /// The operation is not polled before its turn.
    pub async fn enqueue<F, T>(&self, operation: F) -> T
    where
        F: Future<Output = T>,
    {
        let _turn = self.turn.lock().await;
        operation.await
    }

    pub fn is_idle(&self) -> bool {
        self.turn.try_lock().is_ok()
    }
}

/// One serializer per key, created on demand and dropped when unused
#[derive(Debug)]
pub struct SerializerMap<K> {
    serializers: std::sync::Mutex<HashMap<K, Arc<OperationSerializer>>>,
}

impl<K> Default for SerializerMap<K> {
    fn default() -> Self {
        Self {
            serializers: std::sync::Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone> SerializerMap<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &K) -> Arc<OperationSerializer> {
        let mut serializers = self
            .serializers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        serializers.entry(key.clone()).or_default().clone()
    }

    /// Run `operation` on the serializer for `key`
    pub async fn enqueue<F, T>(&self, key: K, operation: F) -> T
    where
        F: Future<Output = T>,
    {
        let serializer = self.get(&key);
        let output = serializer.enqueue(operation).await;
        drop(serializer);
        self.prune(&key);
        output
    }

    pub fn len(&self) -> usize {
        self.serializers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn prune(&self, key: &K) {
        let mut serializers = self
            .serializers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let unused = serializers
            .get(key)
            .is_some_and(|serializer| Arc::strong_count(serializer) == 1);
        if unused {
            serializers.remove(key);
        }
    }
}

//! # Service Binding Table
//!
//! The single place live client handles are stored. The orchestrator is the only writer;
//! the pipeline, handlers and gateway read from it.
//!
//! ## Key Rust Concepts:
//! - **`tokio::sync::RwLock`**: many concurrent readers, one writer at a time, and waiting
//!   never blocks a runtime thread
//! - **`Arc<dyn Trait>`**: readers clone the handle out of the table and drop the lock
//!   immediately, so a request never holds the table while it talks to a service

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{BackingServiceDescriptor, ServiceKind};
use crate::clients::generation::GenerationClient;
use crate::clients::transcription::TranscriptionClient;
use crate::clients::vector::CollectionClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LiveStatus {
    Unknown,
    Starting,
    Live,
    Dead,
}

/// Typed client handle owned by a binding.
#[derive(Clone)]
pub enum BoundClient {
    Generation(Arc<dyn GenerationClient>),
    VectorStore(Arc<dyn CollectionClient>),
    Transcription(Arc<dyn TranscriptionClient>),
}

impl BoundClient {
    pub fn kind(&self) -> ServiceKind {
        match self {
            BoundClient::Generation(_) => ServiceKind::Generation,
            BoundClient::VectorStore(_) => ServiceKind::VectorStore,
            BoundClient::Transcription(_) => ServiceKind::Transcription,
        }
    }
}

pub struct ServiceBinding {
    pub descriptor: BackingServiceDescriptor,
    pub status: LiveStatus,
    pub client: Option<BoundClient>,
    /// Free-form text from the last transition, e.g. model pull status or an error
    pub detail: String,
    pub updated_at: DateTime<Utc>,
}

/// Serializable view of one binding for health output.
#[derive(Debug, Clone, Serialize)]
pub struct BindingSnapshot {
    pub service: ServiceKind,
    pub name: String,
    pub address: String,
    pub status: LiveStatus,
    pub detail: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("{0} is not available, open the services first")]
pub struct NotBound(pub ServiceKind);

pub struct ServiceBindingTable {
    bindings: RwLock<HashMap<ServiceKind, ServiceBinding>>,
}

impl ServiceBindingTable {
    pub fn new(descriptors: &[BackingServiceDescriptor]) -> Self {
        let bindings = descriptors
            .iter()
            .map(|descriptor| {
                (
                    descriptor.kind,
                    ServiceBinding {
                        descriptor: descriptor.clone(),
                        status: LiveStatus::Unknown,
                        client: None,
                        detail: String::new(),
                        updated_at: Utc::now(),
                    },
                )
            })
            .collect();
        Self {
            bindings: RwLock::new(bindings),
        }
    }

    pub async fn set_status(&self, kind: ServiceKind, status: LiveStatus, detail: impl Into<String>) {
        let mut bindings = self.bindings.write().await;
        if let Some(binding) = bindings.get_mut(&kind) {
            binding.status = status;
            binding.detail = detail.into();
            binding.updated_at = Utc::now();
        }
    }

    /// Store a client and mark the service Live.
    pub async fn bind(&self, client: BoundClient, detail: impl Into<String>) {
        let mut bindings = self.bindings.write().await;
        if let Some(binding) = bindings.get_mut(&client.kind()) {
            binding.status = LiveStatus::Live;
            binding.detail = detail.into();
            binding.client = Some(client);
            binding.updated_at = Utc::now();
        }
    }

    /// Drop the client and mark the service Dead.
    pub async fn mark_dead(&self, kind: ServiceKind, detail: impl Into<String>) {
        let mut bindings = self.bindings.write().await;
        if let Some(binding) = bindings.get_mut(&kind) {
            binding.status = LiveStatus::Dead;
            binding.client = None;
            binding.detail = detail.into();
            binding.updated_at = Utc::now();
        }
    }

    /// Reset every binding to Unknown with no client.
    pub async fn clear(&self) {
        let mut bindings = self.bindings.write().await;
        for binding in bindings.values_mut() {
            binding.status = LiveStatus::Unknown;
            binding.client = None;
            binding.detail.clear();
            binding.updated_at = Utc::now();
        }
    }

    pub async fn status(&self, kind: ServiceKind) -> LiveStatus {
        self.bindings
            .read()
            .await
            .get(&kind)
            .map(|binding| binding.status)
            .unwrap_or(LiveStatus::Unknown)
    }

    pub async fn is_live(&self, kind: ServiceKind) -> bool {
        self.status(kind).await == LiveStatus::Live
    }

    pub async fn snapshot(&self) -> Vec<BindingSnapshot> {
        let bindings = self.bindings.read().await;
        ServiceKind::STARTUP_ORDER
            .iter()
            .filter_map(|kind| bindings.get(kind))
            .map(|binding| BindingSnapshot {
                service: binding.descriptor.kind,
                name: binding.descriptor.name.clone(),
                address: binding.descriptor.address(),
                status: binding.status,
                detail: binding.detail.clone(),
                updated_at: binding.updated_at,
            })
            .collect()
    }

    async fn client(&self, kind: ServiceKind) -> Result<BoundClient, NotBound> {
        let bindings = self.bindings.read().await;
        bindings
            .get(&kind)
            .filter(|binding| binding.status == LiveStatus::Live)
            .and_then(|binding| binding.client.clone())
            .ok_or(NotBound(kind))
    }

    pub async fn generation(&self) -> Result<Arc<dyn GenerationClient>, NotBound> {
        match self.client(ServiceKind::Generation).await? {
            BoundClient::Generation(client) => Ok(client),
            _ => Err(NotBound(ServiceKind::Generation)),
        }
    }

    pub async fn vector_store(&self) -> Result<Arc<dyn CollectionClient>, NotBound> {
        match self.client(ServiceKind::VectorStore).await? {
            BoundClient::VectorStore(client) => Ok(client),
            _ => Err(NotBound(ServiceKind::VectorStore)),
        }
    }

    pub async fn transcription(&self) -> Result<Arc<dyn TranscriptionClient>, NotBound> {
        match self.client(ServiceKind::Transcription).await? {
            BoundClient::Transcription(client) => Ok(client),
            _ => Err(NotBound(ServiceKind::Transcription)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::testing::{FixedCollection, ScriptedGeneration};
    use crate::services::testing::descriptors;

    #[tokio::test]
    async fn test_unbound_lookup_fails() {
        let table = ServiceBindingTable::new(&descriptors());
        let err = table.generation().await.err().unwrap();
        assert_eq!(err, NotBound(ServiceKind::Generation));
        assert_eq!(err.to_string(), "generation engine is not available, open the services first");
    }

    #[tokio::test]
    async fn test_bind_then_mark_dead() {
        let table = ServiceBindingTable::new(&descriptors());
        table
            .bind(
                BoundClient::VectorStore(Arc::new(FixedCollection::new(&["doc"]))),
                "collection docs",
            )
            .await;

        assert!(table.is_live(ServiceKind::VectorStore).await);
        assert!(table.vector_store().await.is_ok());

        table.mark_dead(ServiceKind::VectorStore, "connection refused").await;
        assert_eq!(table.status(ServiceKind::VectorStore).await, LiveStatus::Dead);
        assert!(table.vector_store().await.is_err());
    }

    #[tokio::test]
    async fn test_clear_resets_everything() {
        let table = ServiceBindingTable::new(&descriptors());
        table
            .bind(BoundClient::Generation(Arc::new(ScriptedGeneration::new(vec![]))), "pulled")
            .await;
        table.clear().await;

        let snapshot = table.snapshot().await;
        assert_eq!(snapshot.len(), 3);
        assert!(snapshot.iter().all(|entry| entry.status == LiveStatus::Unknown));
        assert_eq!(snapshot[0].service, ServiceKind::Generation);
        assert!(table.generation().await.is_err());
    }
}

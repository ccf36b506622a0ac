//! Static lookup from backend kind to its resilient wrapper.

use std::collections::HashMap;
use std::sync::Arc;

use super::wrapper::ResilientBackend;
use crate::traits::backend::{BackendClient, BackendKind};
use crate::traits::observer::{CallObserver, TracingObserver};
use crate::types::config::BackendsConfig;

/// Wrapped backends, built once at startup and shared by every request.
///
/// A kind without a registered client is simply absent; extractors for that
/// modality fail with a non-retryable backend error.
#[derive(Debug, Clone, Default)]
pub struct BackendTable {
    backends: HashMap<BackendKind, Arc<ResilientBackend>>,
}

impl BackendTable {
    pub fn builder(config: &BackendsConfig) -> BackendTableBuilder<'_> {
        BackendTableBuilder {
            config,
            observer: Arc::new(TracingObserver),
            clients: Vec::new(),
        }
    }

    pub fn get(&self, kind: BackendKind) -> Option<&Arc<ResilientBackend>> {
        self.backends.get(&kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = BackendKind> + '_ {
        self.backends.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

pub struct BackendTableBuilder<'a> {
    config: &'a BackendsConfig,
    observer: Arc<dyn CallObserver>,
    clients: Vec<(BackendKind, Arc<dyn BackendClient>)>,
}

impl BackendTableBuilder<'_> {
    /// Observer notified of every call attempt on every backend.
    pub fn observer(mut self, observer: Arc<dyn CallObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn client(mut self, kind: BackendKind, client: Arc<dyn BackendClient>) -> Self {
        self.clients.push((kind, client));
        self
    }

    pub fn build(self) -> BackendTable {
        let backends = self
            .clients
            .into_iter()
            .map(|(kind, client)| {
                let wrapped = ResilientBackend::new(
                    kind,
                    client,
                    self.config.get(kind).clone(),
                    self.observer.clone(),
                );
                (kind, Arc::new(wrapped))
            })
            .collect();

        BackendTable { backends }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockBackend;

    #[test]
    fn test_builds_registered_kinds_only() {
        let config = BackendsConfig::default();
        let table = BackendTable::builder(&config)
            .client(BackendKind::Text, Arc::new(MockBackend::new("text")))
            .client(BackendKind::Voice, Arc::new(MockBackend::new("voice")))
            .build();

        assert_eq!(table.len(), 2);
        assert!(table.get(BackendKind::Vision).is_none());
        let voice = table.get(BackendKind::Voice).unwrap();
        assert_eq!(voice.kind(), BackendKind::Voice);
        assert_eq!(voice.model(), config.voice.model);
    }
}

// src/node.rs

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::auth::Credentials;
use crate::config::{DispatcherConfig, DispatchersFile, Settings};
use crate::dispatch::{DispatchError, DispatchReport, DispatchTarget, Dispatcher};
use crate::secret::{SecretsError, SecretsManager};

/// Delay before the automatic run of a `once` dispatcher.
pub const STARTUP_DELAY: Duration = Duration::from_millis(100);

/// One configured sheet dispatcher together with its credentials.
#[derive(Debug, Clone)]
pub struct DispatcherNode {
    config: DispatcherConfig,
    target: DispatchTarget,
}

impl DispatcherNode {
    pub fn new(config: DispatcherConfig, settings: &Settings, credentials: Credentials) -> Self {
        let mut target = DispatchTarget::new(
            config.id.clone(),
            config.sheet.clone(),
            config.source_host(settings),
            &config.dest_url,
        )
        .with_tls(settings.tls_policy())
        .with_mode(config.mode);
        if config.auth {
            target = target.with_auth(credentials);
        }
        if let Some(rename) = &config.rename {
            target = target.with_rename(rename.clone());
        }
        Self { config, target }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn target(&self) -> &DispatchTarget {
        &self.target
    }

    /// Run one full dispatch. Rerunning re-fetches, re-prunes and re-pushes.
    pub async fn trigger(&self, dispatcher: &Dispatcher) -> Result<DispatchReport, DispatchError> {
        dispatcher.dispatch(&self.target).await
    }

    /// Schedule the automatic start-up run, if this node asks for one.
    pub fn start(self: &Arc<Self>, dispatcher: Dispatcher) -> Option<JoinHandle<()>> {
        if !self.config.once {
            return None;
        }
        let node = Arc::clone(self);
        Some(tokio::spawn(async move {
            tokio::time::sleep(STARTUP_DELAY).await;
            info!(node = node.id(), "start-up dispatch");
            // outcome already went to the reporter
            let _ = node.trigger(&dispatcher).await;
        }))
    }
}

/// Live dispatcher nodes by id.
pub struct NodeRegistry {
    nodes: DashMap<String, Arc<DispatcherNode>>,
    dispatcher: Dispatcher,
}

impl NodeRegistry {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            nodes: DashMap::new(),
            dispatcher,
        }
    }

    /// Build nodes for every declared dispatcher, reading credentials for
    /// those that use auth.
    pub async fn from_file(
        file: &DispatchersFile,
        settings: &Settings,
        secrets: &SecretsManager,
        dispatcher: Dispatcher,
    ) -> Result<Self, SecretsError> {
        let registry = Self::new(dispatcher);
        for config in &file.dispatchers {
            let credentials = if config.auth {
                let creds = secrets.credentials_for(&config.id).await?;
                if creds.user.is_none() {
                    error!(node = %config.id, "auth enabled but no username stored");
                }
                creds
            } else {
                Credentials::default()
            };
            registry.register(DispatcherNode::new(config.clone(), settings, credentials));
        }
        Ok(registry)
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn register(&self, node: DispatcherNode) -> Option<Arc<DispatcherNode>> {
        self.nodes.insert(node.id().to_string(), Arc::new(node))
    }

    pub fn get(&self, id: &str) -> Option<Arc<DispatcherNode>> {
        self.nodes.get(id).map(|n| Arc::clone(n.value()))
    }

    pub fn remove(&self, id: &str) -> Option<Arc<DispatcherNode>> {
        self.nodes.remove(id).map(|(_, n)| n)
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids = self.nodes.iter().map(|n| n.key().clone()).collect::<Vec<_>>();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Start a dispatch for `id` in the background. `None` when no such node.
    pub fn trigger(&self, id: &str) -> Option<JoinHandle<Result<DispatchReport, DispatchError>>> {
        let node = self.get(id)?;
        let dispatcher = self.dispatcher.clone();
        Some(tokio::spawn(async move { node.trigger(&dispatcher).await }))
    }

    /// Schedule the start-up run of every `once` node.
    pub fn start_all(&self) -> Vec<JoinHandle<()>> {
        self.nodes
            .iter()
            .filter_map(|n| n.value().start(self.dispatcher.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prune::PruneMode;
    use crate::secret::MemorySecretsManager;
    use crate::status::{LogReporter, MemoryReporter, NodeStatus};
    use crate::transport::{
        TlsPolicy, Transport, TransportError, TransportErrorCode, TransportRequest,
        TransportResponse,
    };
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Refuses every connection and remembers the urls it was asked for.
    #[derive(Default)]
    struct Unreachable {
        urls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Transport for Unreachable {
        async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
            self.urls.lock().unwrap().push(request.url.clone());
            Err(TransportError::new(
                TransportErrorCode::ConnectionRefused,
                request.url,
                "refused",
            ))
        }
    }

    fn dispatchers() -> DispatchersFile {
        let mut once = DispatcherConfig::new("n1", "Sheet 1", "edge:1880");
        once.once = true;
        once.auth = true;
        let manual = DispatcherConfig::new("n2", "Sheet 2", "edge:1880");
        DispatchersFile {
            dispatchers: vec![once, manual],
        }
    }

    #[test]
    fn node_builds_target_from_settings() {
        let mut config = DispatcherConfig::new("n1", "S", "https://edge:1880/");
        config.auth = true;
        let settings = Settings {
            is_devel: false,
            ..Settings::default()
        };
        let node = DispatcherNode::new(config, &settings, Credentials::new("u", "p"));

        let target = node.target();
        assert_eq!(target.source, "localhost:1880");
        assert_eq!(target.destination, "edge:1880");
        assert_eq!(target.tls, TlsPolicy::Verify);
        assert!(target.auth);
        assert_eq!(target.credentials.username(), "u");
        assert_eq!(target.mode, PruneMode::Relay);
    }

    #[test]
    fn plain_mode_is_carried_into_the_target() {
        let mut config = DispatcherConfig::new("n1", "S", "edge");
        config.mode = PruneMode::Plain;
        let node = DispatcherNode::new(config, &Settings::default(), Credentials::default());
        assert_eq!(node.target().mode, PruneMode::Plain);
    }

    #[test]
    fn credentials_are_dropped_without_auth() {
        let config = DispatcherConfig::new("n1", "S", "edge");
        let node = DispatcherNode::new(config, &Settings::default(), Credentials::new("u", "p"));
        assert!(!node.target().auth);
        assert_eq!(node.target().credentials, Credentials::default());
    }

    #[tokio::test]
    async fn registry_loads_credentials_for_auth_nodes() {
        let secrets = SecretsManager(MemorySecretsManager::new());
        secrets.add_secret("DISPATCH_N1_USER", "admin").await.unwrap();
        secrets.add_secret("DISPATCH_N1_PASSWORD", "pw").await.unwrap();
        let dispatcher = Dispatcher::new(Arc::new(Unreachable::default()), Arc::new(LogReporter));

        let registry = NodeRegistry::from_file(&dispatchers(), &Settings::default(), &secrets, dispatcher)
            .await
            .unwrap();

        assert_eq!(registry.ids(), vec!["n1".to_string(), "n2".to_string()]);
        assert_eq!(
            registry.get("n1").unwrap().target().credentials,
            Credentials::new("admin", "pw")
        );
        assert!(registry.get("missing").is_none());
        assert!(registry.trigger("missing").is_none());
    }

    #[tokio::test]
    async fn trigger_reports_through_dispatcher() {
        let transport = Arc::new(Unreachable::default());
        let reporter = Arc::new(MemoryReporter::new());
        let registry = NodeRegistry::new(Dispatcher::new(transport.clone(), reporter.clone()));
        registry.register(DispatcherNode::new(
            DispatcherConfig::new("n2", "Sheet 2", "edge"),
            &Settings::default(),
            Credentials::default(),
        ));

        let result = registry.trigger("n2").unwrap().await.unwrap();

        assert!(matches!(result, Err(DispatchError::Transport(_))));
        assert_eq!(
            reporter.current("n2"),
            NodeStatus::error("Request Fail", Some("ECONNREFUSED"))
        );
        assert_eq!(
            transport.urls.lock().unwrap().clone(),
            vec!["http://localhost:1880/flows".to_string()]
        );
    }

    #[tokio::test]
    async fn only_once_nodes_start_after_delay() {
        let transport = Arc::new(Unreachable::default());
        let secrets = SecretsManager(MemorySecretsManager::new());
        let dispatcher = Dispatcher::new(transport.clone(), Arc::new(LogReporter));
        let registry = NodeRegistry::from_file(&dispatchers(), &Settings::default(), &secrets, dispatcher)
            .await
            .unwrap();

        let handles = registry.start_all();
        assert_eq!(handles.len(), 1);
        assert!(transport.urls.lock().unwrap().is_empty());

        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(transport.urls.lock().unwrap().len(), 1);
    }
}

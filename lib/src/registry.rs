//! Name → constructor table for client implementations
//!
//! Tests build their own [`ImplementationRegistry`] and inject doubles. The
//! process-wide instance behind the free functions is for production wiring.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use crate::client::{AgentClient, Client};
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::transport::TransportKind;

/// Builds a client from its configuration
pub type ClientConstructor = Arc<dyn Fn(ClientConfig) -> Box<dyn AgentClient> + Send + Sync>;

/// Name of the process-backed JSON-RPC client, always present after `clear`
pub const PROCESS_IMPLEMENTATION: &str = "process";

/// Name of the client delegating to the SDK
pub const SDK_IMPLEMENTATION: &str = "sdk";

#[derive(Clone)]
pub struct ImplementationRegistry {
    constructors: BTreeMap<String, ClientConstructor>,
    default: String,
}

impl std::fmt::Debug for ImplementationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImplementationRegistry")
            .field("names", &self.names())
            .field("default", &self.default)
            .finish()
    }
}

impl Default for ImplementationRegistry {
    fn default() -> Self {
        Self::baseline()
    }
}

impl ImplementationRegistry {
    /// Only `"process"`, which is also the default
    pub fn baseline() -> Self {
        let mut registry = Self {
            constructors: BTreeMap::new(),
            default: PROCESS_IMPLEMENTATION.to_string(),
        };
        registry.register(PROCESS_IMPLEMENTATION, transport_constructor(TransportKind::Rpc));
        registry
    }

    /// Both built-in transports, `"process"` as default
    pub fn with_builtins() -> Self {
        let mut registry = Self::baseline();
        registry.register(SDK_IMPLEMENTATION, transport_constructor(TransportKind::Sdk));
        registry
    }

    /// Add or replace an implementation
    pub fn register(&mut self, name: impl Into<String>, constructor: ClientConstructor) {
        let name = name.into();
        tracing::debug!("Registering client implementation '{}'", name);
        self.constructors.insert(name, constructor);
    }

    pub fn set_default(&mut self, name: &str) -> Result<()> {
        self.check(name)?;
        self.default = name.to_string();
        Ok(())
    }

    pub fn default_name(&self) -> &str {
        &self.default
    }

    /// Build a client with `name`, or the default when `None`
    pub fn create_client(
        &self,
        config: ClientConfig,
        name: Option<&str>,
    ) -> Result<Box<dyn AgentClient>> {
        let name = name.unwrap_or(&self.default);
        let constructor = self.check(name)?;
        tracing::debug!("Creating '{}' client for '{}'", name, config.command);
        Ok(constructor(config))
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        self.constructors.keys().cloned().collect()
    }

    /// Back to the baseline; meant for test isolation
    pub fn clear(&mut self) {
        *self = Self::baseline();
    }

    fn check(&self, name: &str) -> Result<&ClientConstructor> {
        self.constructors
            .get(name)
            .ok_or_else(|| ClientError::UnknownImplementation {
                name: name.to_string(),
                registered: self.names(),
            })
    }
}

fn transport_constructor(transport: TransportKind) -> ClientConstructor {
    Arc::new(move |config| Box::new(Client::new(config, transport)) as Box<dyn AgentClient>)
}

fn global() -> &'static RwLock<ImplementationRegistry> {
    static REGISTRY: OnceLock<RwLock<ImplementationRegistry>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(ImplementationRegistry::with_builtins()))
}

/// Build a client from the process-wide registry
pub fn create_client(config: ClientConfig, name: Option<&str>) -> Result<Box<dyn AgentClient>> {
    global()
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .create_client(config, name)
}

pub fn register_implementation(name: impl Into<String>, constructor: ClientConstructor) {
    global()
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .register(name, constructor);
}

pub fn set_default_implementation(name: &str) -> Result<()> {
    global()
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .set_default(name)
}

/// Reset the process-wide registry to the baseline
pub fn clear_implementations() {
    global()
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .clear();
}

pub fn registered_implementations() -> Vec<String> {
    global()
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .names()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ClientConfig {
        ClientConfig::new("agent", vec![], "/tmp")
    }

    #[test]
    fn test_builtins() {
        let registry = ImplementationRegistry::with_builtins();
        assert_eq!(registry.names(), vec!["process", "sdk"]);
        assert_eq!(registry.default_name(), "process");
    }

    #[tokio::test]
    async fn test_unknown_name_lists_registered() {
        let registry = ImplementationRegistry::with_builtins();
        let err = registry.create_client(config(), Some("grpc")).err().unwrap();
        match &err {
            ClientError::UnknownImplementation { name, registered } => {
                assert_eq!(name, "grpc");
                assert_eq!(registered, &vec!["process".to_string(), "sdk".to_string()]);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(err.to_string().contains("process, sdk"));
    }

    #[test]
    fn test_set_default_requires_registration() {
        let mut registry = ImplementationRegistry::baseline();
        assert!(matches!(
            registry.set_default("sdk"),
            Err(ClientError::UnknownImplementation { .. })
        ));
        assert_eq!(registry.default_name(), "process");
    }

    #[tokio::test]
    async fn test_clear_restores_baseline() {
        let mut registry = ImplementationRegistry::with_builtins();
        registry.register(
            "double",
            Arc::new(|config| Box::new(Client::new(config, TransportKind::Rpc)) as Box<dyn AgentClient>),
        );
        registry.set_default("double").unwrap();
        registry.clear();
        assert_eq!(registry.names(), vec!["process"]);
        assert_eq!(registry.default_name(), "process");
        assert!(registry.create_client(config(), None).is_ok());
    }
}

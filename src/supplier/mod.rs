//! Pluggable supply capability.
//!
//! A [`Supplier`] owns a set of named [`Plugin`]s; a node references one
//! plugin by function name and the supplier dispatches the call. Registration
//! is an explicit call; there is no discovery mechanism.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde_json::Value;
use thiserror::Error;

pub mod local;

/// Raw response of a plugin call: source key to raw value.
pub type SupplyResponse = HashMap<String, Value>;

#[derive(Debug, Error)]
pub enum SupplyError {
    #[error("plugin not found: {0}")]
    PluginNotFound(String),
    #[error("{0}")]
    Failed(String),
}

/// One dynamically dispatched capability, e.g. a network call, a local
/// computation, or an extraction from a payload.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;
    async fn call(&self, args: Vec<Value>) -> Result<SupplyResponse, SupplyError>;
}

/// Plugin backed by an async closure.
pub struct FnPlugin {
    name: String,
    func: Box<dyn Fn(Vec<Value>) -> BoxFuture<'static, Result<SupplyResponse, SupplyError>> + Send + Sync>,
}

impl FnPlugin {
    pub fn new<F, Fut>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<SupplyResponse, SupplyError>> + Send + 'static,
    {
        FnPlugin {
            name: name.into(),
            func: Box::new(move |args| Box::pin(func(args))),
        }
    }
}

#[async_trait]
impl Plugin for FnPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, args: Vec<Value>) -> Result<SupplyResponse, SupplyError> {
        (self.func)(args).await
    }
}

/// Manages plugins and performs the function call a node asks for.
#[async_trait]
pub trait Supplier: Send + Sync {
    fn name(&self) -> &str;
    fn plugin(&self, name: &str) -> Option<Arc<dyn Plugin>>;
    fn register_plugin(&self, plugin: Arc<dyn Plugin>);

    async fn supply(&self, func_name: &str, args: Vec<Value>) -> Result<SupplyResponse, SupplyError> {
        match self.plugin(func_name) {
            Some(plugin) => plugin.call(args).await,
            None => Err(SupplyError::PluginNotFound(func_name.to_string())),
        }
    }
}

/// Name-keyed plugin registry.
pub struct DefaultSupplier {
    name: String,
    plugins: RwLock<HashMap<String, Arc<dyn Plugin>>>,
}

impl DefaultSupplier {
    pub fn new(name: impl Into<String>, plugins: Vec<Arc<dyn Plugin>>) -> Self {
        let map = plugins
            .into_iter()
            .map(|p| (p.name().to_string(), p))
            .collect();
        DefaultSupplier {
            name: name.into(),
            plugins: RwLock::new(map),
        }
    }
}

#[async_trait]
impl Supplier for DefaultSupplier {
    fn name(&self) -> &str {
        &self.name
    }

    fn plugin(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins.read().get(name).cloned()
    }

    fn register_plugin(&self, plugin: Arc<dyn Plugin>) {
        self.plugins
            .write()
            .insert(plugin.name().to_string(), plugin);
    }
}

//! Handler registry
//!
//! Resolves a resource type to a deletion handler. Lookup order:
//! 1. an explicit mapping (`types:` in configuration, then handler files)
//! 2. the provider default `<provider>.<type>`
//! 3. no handler

use reqwest::Client;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use tidyrun_common::{CleanupConfig, ProviderConfig};

use crate::error::CleanupResult;
use crate::handler::DeleteHandler;
use crate::manifest::{self, HandlerFile};
use crate::provider::CleanupProvider;
use crate::providers;

pub struct HandlerRegistry {
    provider_name: String,
    provider: Option<Arc<dyn CleanupProvider>>,
    handlers: HashMap<String, Arc<dyn DeleteHandler>>,
    types: BTreeMap<String, String>,
}

impl HandlerRegistry {
    /// Empty registry whose unqualified names live under `provider_name`.
    pub fn new(provider_name: impl Into<String>) -> Self {
        Self {
            provider_name: provider_name.into(),
            provider: None,
            handlers: HashMap::new(),
            types: BTreeMap::new(),
        }
    }

    /// Build a registry from a cleanup section, filling secrets from the
    /// environment. Relative handler paths resolve against `cwd`.
    pub fn from_config(config: &CleanupConfig, cwd: &Path) -> CleanupResult<Self> {
        let provider_config = config.provider_config()?.with_env_secrets();
        Self::from_parts(config, &provider_config, cwd)
    }

    /// Build a registry with an explicit provider configuration, for example
    /// one restored from a failed-cleanup record.
    pub fn from_parts(
        config: &CleanupConfig,
        provider_config: &ProviderConfig,
        cwd: &Path,
    ) -> CleanupResult<Self> {
        let mut registry = Self::new(provider_config.name());

        for (resource_type, handler) in &config.types {
            registry.map_type(resource_type, handler);
        }

        if let Some(mut provider) = providers::builtin(provider_config.name()) {
            provider.configure(provider_config)?;
            registry.register_provider(Arc::from(provider));
        }

        let mut files: Vec<_> = config
            .handlers
            .iter()
            .map(|p| if p.is_absolute() { p.clone() } else { cwd.join(p) })
            .collect();
        if let Some(discover) = &config.discover {
            files.extend(manifest::discover(discover, cwd)?);
        }

        let client = Client::new();
        for path in files {
            let file = HandlerFile::load(&path)?;
            registry.register_file(&file, &client);
        }

        info!(
            provider = %registry.provider_name,
            handlers = registry.handlers.len(),
            "Cleanup handlers registered"
        );
        Ok(registry)
    }

    /// Register a handler under a fully qualified or provider-relative name.
    pub fn register(&mut self, name: &str, handler: Arc<dyn DeleteHandler>) {
        let name = self.qualify(name);
        debug!(handler = %name, "Registered cleanup handler");
        self.handlers.insert(name, handler);
    }

    /// Register every method a provider exposes as `<provider>.<method>`.
    pub fn register_provider(&mut self, provider: Arc<dyn CleanupProvider>) {
        let name = provider.name().to_string();
        for (method, handler) in provider.methods() {
            self.handlers.insert(format!("{}.{}", name, method), handler);
        }
        self.provider = Some(provider);
    }

    fn register_file(&mut self, file: &HandlerFile, client: &Client) {
        let namespace = file
            .provider
            .clone()
            .unwrap_or_else(|| self.provider_name.clone());
        for (method, handler) in file.build(client) {
            self.handlers.insert(format!("{}.{}", namespace, method), handler);
        }
        for (resource_type, method) in &file.types {
            // Explicit configuration and earlier files win.
            self.types
                .entry(resource_type.clone())
                .or_insert_with(|| format!("{}.{}", namespace, method));
        }
    }

    /// Map a resource type to a handler name.
    pub fn map_type(&mut self, resource_type: &str, handler: &str) {
        let handler = self.qualify(handler);
        self.types.insert(resource_type.to_string(), handler);
    }

    pub fn resolve(&self, resource_type: &str) -> Option<Arc<dyn DeleteHandler>> {
        if let Some(name) = self.types.get(resource_type) {
            return self.handlers.get(name).cloned();
        }
        self.handlers
            .get(&format!("{}.{}", self.provider_name, resource_type))
            .cloned()
    }

    pub fn provider(&self) -> Option<&Arc<dyn CleanupProvider>> {
        self.provider.as_ref()
    }

    pub fn provider_name(&self) -> &str {
        &self.provider_name
    }

    /// Registered handler names, sorted
    pub fn handler_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    fn qualify(&self, name: &str) -> String {
        if name.contains('.') {
            name.to_string()
        } else {
            format!("{}.{}", self.provider_name, name)
        }
    }
}

// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Instrumentation config registry.
//!
//! A config entry declares one instrumentable call site class: the channel
//! name its lifecycle events are published on, the module that owns the
//! target function, and a query selecting the function itself. The registry
//! is pure data - it is consumed by the external code transformer (to decide
//! where to inject event emission) and by the runtime (to know which
//! channels to expect and how each call kind completes).
//!
//! Configs can be built in code or loaded from declarative YAML/JSON files:
//!
//! ```yaml
//! namespace: llmtap
//! configs:
//!   - channel_name: chat.completions.create
//!     module:
//!       name: openai
//!       version_range: ">=4.0.0 <6"
//!       file_path: dist/resources/chat/completions.js
//!     function_query:
//!       class_name: Completions
//!       method_name: create
//!       kind: async
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, RwLock};

use crate::error::RegistryError;
use crate::types::CallKind;

/// Default channel namespace prepended to every derived channel name.
pub const DEFAULT_NAMESPACE: &str = "llmtap";

/// The module that owns an instrumented function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleTarget {
    /// Published module/package name (e.g. `openai`).
    pub name: String,
    /// Version range the instrumentation is known to match.
    pub version_range: String,
    /// Path of the file containing the target, relative to the module root.
    pub file_path: String,
}

impl ModuleTarget {
    /// Create a module target.
    pub fn new(
        name: impl Into<String>,
        version_range: impl Into<String>,
        file_path: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            version_range: version_range.into(),
            file_path: file_path.into(),
        }
    }
}

/// Selects the function or method to instrument within a module file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionQuery {
    /// Owning class for methods; `None` for free functions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
    /// Function or method name.
    pub method_name: String,
    /// How the matched call completes.
    pub kind: CallKind,
}

impl FunctionQuery {
    /// Select a free function.
    pub fn function(name: impl Into<String>, kind: CallKind) -> Self {
        Self {
            class_name: None,
            method_name: name.into(),
            kind,
        }
    }

    /// Select a method on a class.
    pub fn method(
        class_name: impl Into<String>,
        method_name: impl Into<String>,
        kind: CallKind,
    ) -> Self {
        Self {
            class_name: Some(class_name.into()),
            method_name: method_name.into(),
            kind,
        }
    }
}

/// One instrumentable call site class.
///
/// Immutable once registered. Many configs may share a module; each produces
/// an independently-named channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentationConfig {
    pub channel_name: String,
    pub module: ModuleTarget,
    pub function_query: FunctionQuery,
}

impl InstrumentationConfig {
    /// Create a config entry.
    pub fn new(
        channel_name: impl Into<String>,
        module: ModuleTarget,
        function_query: FunctionQuery,
    ) -> Self {
        Self {
            channel_name: channel_name.into(),
            module,
            function_query,
        }
    }

    /// Derive the namespaced channel name: `<namespace>:<module>:<channel>`.
    pub fn channel_for(&self, namespace: &str) -> String {
        format!("{}:{}:{}", namespace, self.module.name, self.channel_name)
    }

    fn validate(&self) -> Result<(), RegistryError> {
        if self.channel_name.is_empty() {
            return Err(RegistryError::MissingField("channel_name".to_string()));
        }
        if self.module.name.is_empty() {
            return Err(RegistryError::MissingField("module.name".to_string()));
        }
        if self.function_query.method_name.is_empty() {
            return Err(RegistryError::MissingField(
                "function_query.method_name".to_string(),
            ));
        }
        Ok(())
    }
}

/// Declarative file shape for [`Registry::from_yaml_str`] and friends.
#[derive(Debug, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    namespace: Option<String>,
    configs: Vec<InstrumentationConfig>,
}

/// The set of registered instrumentation configs for one namespace.
#[derive(Debug)]
pub struct Registry {
    namespace: String,
    configs: RwLock<Vec<Arc<InstrumentationConfig>>>,
}

impl Registry {
    /// Create an empty registry under the default namespace.
    pub fn new() -> Self {
        Self::with_namespace(DEFAULT_NAMESPACE)
    }

    /// Create an empty registry under a custom namespace.
    pub fn with_namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            configs: RwLock::new(Vec::new()),
        }
    }

    /// Get the registry's channel namespace.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Register a config entry.
    ///
    /// # Errors
    ///
    /// Returns an error if a required field is empty or if another config
    /// already produces the same namespaced channel.
    pub fn register(
        &self,
        config: InstrumentationConfig,
    ) -> Result<Arc<InstrumentationConfig>, RegistryError> {
        config.validate()?;

        let channel = config.channel_for(&self.namespace);
        let mut configs = self.configs.write().unwrap();
        if configs
            .iter()
            .any(|c| c.channel_for(&self.namespace) == channel)
        {
            return Err(RegistryError::DuplicateChannel(channel));
        }

        let config = Arc::new(config);
        configs.push(Arc::clone(&config));
        Ok(config)
    }

    /// Look up a config by its namespaced channel name.
    pub fn lookup(&self, channel: &str) -> Option<Arc<InstrumentationConfig>> {
        self.configs
            .read()
            .unwrap()
            .iter()
            .find(|c| c.channel_for(&self.namespace) == channel)
            .cloned()
    }

    /// Get all registered configs in registration order.
    pub fn configs(&self) -> Vec<Arc<InstrumentationConfig>> {
        self.configs.read().unwrap().clone()
    }

    /// Get all namespaced channel names in registration order.
    pub fn channels(&self) -> Vec<String> {
        self.configs
            .read()
            .unwrap()
            .iter()
            .map(|c| c.channel_for(&self.namespace))
            .collect()
    }

    /// Number of registered configs.
    pub fn len(&self) -> usize {
        self.configs.read().unwrap().len()
    }

    /// Check if no configs are registered.
    pub fn is_empty(&self) -> bool {
        self.configs.read().unwrap().is_empty()
    }

    /// Build a registry from a declarative YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, RegistryError> {
        let file: RegistryFile = serde_yaml::from_str(yaml)?;
        Self::from_file_shape(file)
    }

    /// Build a registry from a declarative JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, RegistryError> {
        let file: RegistryFile = serde_json::from_str(json)?;
        Self::from_file_shape(file)
    }

    /// Load a registry from a `.yaml`/`.yml`/`.json` file.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml_str(&contents),
            Some("json") => Self::from_json_str(&contents),
            other => Err(RegistryError::InvalidConfig(format!(
                "Unsupported config extension: {:?}",
                other
            ))),
        }
    }

    fn from_file_shape(file: RegistryFile) -> Result<Self, RegistryError> {
        let registry = match file.namespace {
            Some(ns) => Self::with_namespace(ns),
            None => Self::new(),
        };
        for config in file.configs {
            registry.register(config)?;
        }
        Ok(registry)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn chat_config() -> InstrumentationConfig {
        InstrumentationConfig::new(
            "chat.completions.create",
            ModuleTarget::new("openai", ">=4.0.0 <6", "dist/resources/chat/completions.js"),
            FunctionQuery::method("Completions", "create", CallKind::Async),
        )
    }

    #[test]
    fn test_channel_naming() {
        let config = chat_config();
        assert_eq!(
            config.channel_for("llmtap"),
            "llmtap:openai:chat.completions.create"
        );
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = Registry::new();
        let config = registry.register(chat_config()).unwrap();

        let channel = config.channel_for(registry.namespace());
        let found = registry.lookup(&channel).unwrap();
        assert_eq!(found.channel_name, "chat.completions.create");
        assert_eq!(found.function_query.kind, CallKind::Async);

        assert!(registry.lookup("llmtap:openai:unknown").is_none());
    }

    #[test]
    fn test_register_duplicate_channel() {
        let registry = Registry::new();
        registry.register(chat_config()).unwrap();

        let err = registry.register(chat_config()).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateChannel(_)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_register_missing_field() {
        let registry = Registry::new();
        let config = InstrumentationConfig::new(
            "",
            ModuleTarget::new("openai", "*", "index.js"),
            FunctionQuery::function("create", CallKind::Sync),
        );

        let err = registry.register(config).unwrap_err();
        assert!(matches!(err, RegistryError::MissingField(_)));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_same_module_multiple_channels() {
        let registry = Registry::new();
        registry.register(chat_config()).unwrap();
        registry
            .register(InstrumentationConfig::new(
                "embeddings.create",
                ModuleTarget::new("openai", ">=4.0.0 <6", "dist/resources/embeddings.js"),
                FunctionQuery::method("Embeddings", "create", CallKind::Async),
            ))
            .unwrap();

        assert_eq!(
            registry.channels(),
            vec![
                "llmtap:openai:chat.completions.create".to_string(),
                "llmtap:openai:embeddings.create".to_string(),
            ]
        );
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
namespace: orch
configs:
  - channel_name: messages.create
    module:
      name: anthropic
      version_range: ">=0.30.0"
      file_path: lib/messages.js
    function_query:
      class_name: Messages
      method_name: create
      kind: async_stream
"#;
        let registry = Registry::from_yaml_str(yaml).unwrap();
        assert_eq!(registry.namespace(), "orch");
        assert_eq!(registry.len(), 1);

        let config = registry.lookup("orch:anthropic:messages.create").unwrap();
        assert_eq!(config.function_query.kind, CallKind::AsyncStream);
        assert_eq!(
            config.function_query.class_name.as_deref(),
            Some("Messages")
        );
    }

    #[test]
    fn test_from_json_default_namespace() {
        let json = r#"{
            "configs": [{
                "channel_name": "generate",
                "module": {
                    "name": "ollama",
                    "version_range": "*",
                    "file_path": "src/index.js"
                },
                "function_query": {
                    "method_name": "generate",
                    "kind": "sync"
                }
            }]
        }"#;
        let registry = Registry::from_json_str(json).unwrap();
        assert_eq!(registry.namespace(), DEFAULT_NAMESPACE);
        assert!(registry.lookup("llmtap:ollama:generate").is_some());
    }

    #[test]
    fn test_from_yaml_duplicate_rejected() {
        let yaml = r#"
configs:
  - channel_name: generate
    module: { name: ollama, version_range: "*", file_path: index.js }
    function_query: { method_name: generate, kind: sync }
  - channel_name: generate
    module: { name: ollama, version_range: "*", file_path: index.js }
    function_query: { method_name: generate, kind: sync }
"#;
        let err = Registry::from_yaml_str(yaml).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateChannel(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".yaml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            r#"
configs:
  - channel_name: chat
    module: {{ name: openai, version_range: "*", file_path: chat.js }}
    function_query: {{ method_name: create, kind: async }}
"#
        )
        .unwrap();

        let registry = Registry::load_from_file(file.path()).unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_load_from_file_unknown_extension() {
        let file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        let err = Registry::load_from_file(file.path()).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidConfig(_)));
    }
}

use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::bindings::{DurableObjectBinding, KvNamespaceBinding, ServiceBinding};
use crate::bundle::DeclaredFormat;
use crate::error::{PublishError, PublishResult};
use crate::migrations::MigrationStep;

pub const CONFIG_FILE_NAMES: &[&str] = &["wrangler.toml", "wrangler.json", "wrangler.jsonc"];

/// Worker project configuration loaded from wrangler.toml (or .json/.jsonc)
#[derive(Debug, Default, Deserialize, Clone)]
pub struct Config {
    /// Settings shared by every environment
    #[serde(flatten)]
    pub top: EnvironmentSection,

    /// Append-only migration history, never overridden per environment
    #[serde(default)]
    pub migrations: Vec<MigrationStep>,

    /// Named environments (`[env.staging]`)
    #[serde(default)]
    pub env: BTreeMap<String, EnvironmentSection>,
}

/// Keys that may appear at the top level or inside `[env.<name>]`.
#[derive(Debug, Default, Deserialize, Clone)]
pub struct EnvironmentSection {
    pub name: Option<String>,
    pub account_id: Option<String>,
    pub compatibility_date: Option<String>,
    pub compatibility_flags: Option<Vec<String>>,
    pub usage_model: Option<String>,

    /// Expose the worker on the account's workers.dev subdomain (default true)
    pub workers_dev: Option<bool>,

    pub routes: Option<Vec<String>>,
    pub triggers: Option<TriggersConfig>,
    pub build: Option<BuildConfig>,
    pub site: Option<SiteConfig>,

    // Bindings below are never inherited from the top level.
    pub vars: Option<BTreeMap<String, Value>>,
    pub kv_namespaces: Option<Vec<KvNamespaceBinding>>,
    pub durable_objects: Option<DurableObjectsConfig>,
    pub services: Option<Vec<ServiceBinding>>,
}

#[derive(Debug, Default, Deserialize, Clone, PartialEq)]
pub struct TriggersConfig {
    #[serde(default)]
    pub crons: Vec<String>,
}

#[derive(Debug, Default, Deserialize, Clone, PartialEq)]
pub struct DurableObjectsConfig {
    #[serde(default)]
    pub bindings: Vec<DurableObjectBinding>,
}

#[derive(Debug, Default, Deserialize, Clone, PartialEq)]
pub struct BuildConfig {
    /// Shell command run before bundling
    pub command: Option<String>,

    /// Working directory for the build command, relative to the config file
    pub cwd: Option<String>,

    #[serde(default)]
    pub upload: UploadConfig,
}

#[derive(Debug, Default, Deserialize, Clone, PartialEq)]
pub struct UploadConfig {
    pub format: Option<DeclaredFormat>,

    /// Build output directory, relative to the config file (default "dist")
    pub dir: Option<String>,

    /// Entry module inside `dir`
    pub main: Option<String>,
}

#[derive(Debug, Default, Deserialize, Clone, PartialEq)]
pub struct SiteConfig {
    /// Directory of static assets, relative to the config file
    pub bucket: String,
}

/// Fully resolved settings for a single environment.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvironmentConfig {
    pub name: Option<String>,
    pub account_id: Option<String>,
    pub compatibility_date: Option<String>,
    pub compatibility_flags: Vec<String>,
    pub usage_model: Option<String>,
    pub workers_dev: bool,
    pub routes: Vec<String>,
    pub crons: Vec<String>,
    pub build: BuildConfig,
    pub site: Option<SiteConfig>,
    pub migrations: Vec<MigrationStep>,
    pub vars: BTreeMap<String, Value>,
    pub kv_namespaces: Vec<KvNamespaceBinding>,
    pub durable_objects: Vec<DurableObjectBinding>,
    pub services: Vec<ServiceBinding>,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            name: None,
            account_id: None,
            compatibility_date: None,
            compatibility_flags: Vec::new(),
            usage_model: None,
            workers_dev: true,
            routes: Vec::new(),
            crons: Vec::new(),
            build: BuildConfig::default(),
            site: None,
            migrations: Vec::new(),
            vars: BTreeMap::new(),
            kv_namespaces: Vec::new(),
            durable_objects: Vec::new(),
            services: Vec::new(),
        }
    }
}

impl Config {
    /// Parse a config file, picking the format from its extension
    pub fn load(path: &Path) -> PublishResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            PublishError::Configuration(format!(
                "Failed to read config {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::parse(&content, path)
    }

    pub fn parse(content: &str, path: &Path) -> PublishResult<Self> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") | Some("jsonc") => Ok(json5::from_str(content)?),
            _ => Ok(toml::from_str(content)?),
        }
    }

    /// Walk up from `start` looking for a config file
    pub fn discover(start: &Path) -> Option<PathBuf> {
        start.ancestors().find_map(|dir| {
            CONFIG_FILE_NAMES
                .iter()
                .map(|name| dir.join(name))
                .find(|candidate| candidate.is_file())
        })
    }

    /// Resolve the settings for `env` (or the top level when `None`).
    pub fn environment(&self, env: Option<&str>) -> PublishResult<EnvironmentConfig> {
        let top = &self.top;
        let section = match env {
            Some(name) => self.env.get(name).ok_or_else(|| {
                let known: Vec<&str> = self.env.keys().map(String::as_str).collect();
                PublishError::Configuration(format!(
                    "No environment named '{}' in config. Known environments: {}",
                    name,
                    if known.is_empty() {
                        "(none)".to_string()
                    } else {
                        known.join(", ")
                    }
                ))
            })?,
            None => top,
        };

        // Inheritable keys fall back to the top level; bindings do not.
        Ok(EnvironmentConfig {
            name: section.name.clone().or_else(|| top.name.clone()),
            account_id: section.account_id.clone().or_else(|| top.account_id.clone()),
            compatibility_date: section
                .compatibility_date
                .clone()
                .or_else(|| top.compatibility_date.clone()),
            compatibility_flags: section
                .compatibility_flags
                .clone()
                .or_else(|| top.compatibility_flags.clone())
                .unwrap_or_default(),
            usage_model: section.usage_model.clone().or_else(|| top.usage_model.clone()),
            workers_dev: section.workers_dev.or(top.workers_dev).unwrap_or(true),
            routes: section
                .routes
                .clone()
                .or_else(|| top.routes.clone())
                .unwrap_or_default(),
            crons: section
                .triggers
                .clone()
                .or_else(|| top.triggers.clone())
                .map(|triggers| triggers.crons)
                .unwrap_or_default(),
            build: section
                .build
                .clone()
                .or_else(|| top.build.clone())
                .unwrap_or_default(),
            site: section.site.clone().or_else(|| top.site.clone()),
            migrations: self.migrations.clone(),
            vars: section.vars.clone().unwrap_or_default(),
            kv_namespaces: section.kv_namespaces.clone().unwrap_or_default(),
            durable_objects: section
                .durable_objects
                .clone()
                .map(|objects| objects.bindings)
                .unwrap_or_default(),
            services: section.services.clone().unwrap_or_default(),
        })
    }
}

/// Generate a sample config file content
pub fn sample_config() -> &'static str {
    r#"name = "my-worker"
account_id = "your-account-id"
compatibility_date = "2024-01-01"
# compatibility_flags = ["nodejs_compat"]
# usage_model = "bundled"

routes = ["example.com/*"]

[triggers]
crons = ["*/15 * * * *"]

[build]
command = "npm run build"

[build.upload]
format = "modules"
dir = "dist"
main = "./index.mjs"

# [site]
# bucket = "./public"

[vars]
GREETING = "hello"

[[kv_namespaces]]
binding = "CACHE"
id = "your-namespace-id"

[[migrations]]
tag = "v1"
new_classes = ["Counter"]

[env.staging]
name = "my-worker-staging"
routes = []
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Config {
        Config::parse(sample_config(), Path::new("wrangler.toml")).unwrap()
    }

    #[test]
    fn test_top_level_environment_resolves_everything() {
        let env = sample().environment(None).unwrap();

        assert_eq!(env.name.as_deref(), Some("my-worker"));
        assert_eq!(env.account_id.as_deref(), Some("your-account-id"));
        assert_eq!(env.compatibility_date.as_deref(), Some("2024-01-01"));
        assert!(env.workers_dev);
        assert_eq!(env.routes, vec!["example.com/*".to_string()]);
        assert_eq!(env.crons, vec!["*/15 * * * *".to_string()]);
        assert_eq!(env.build.command.as_deref(), Some("npm run build"));
        assert_eq!(env.build.upload.format, Some(DeclaredFormat::Modules));
        assert_eq!(env.build.upload.main.as_deref(), Some("./index.mjs"));
        assert_eq!(env.vars.get("GREETING"), Some(&json!("hello")));
        assert_eq!(env.kv_namespaces.len(), 1);
        assert_eq!(env.migrations.len(), 1);
        assert_eq!(
            env.migrations[0].payload.get("new_classes"),
            Some(&json!(["Counter"]))
        );
    }

    #[test]
    fn test_named_environment_inherits_but_does_not_inherit_bindings() {
        let env = sample().environment(Some("staging")).unwrap();

        assert_eq!(env.name.as_deref(), Some("my-worker-staging"));
        assert_eq!(env.account_id.as_deref(), Some("your-account-id"));
        assert!(env.routes.is_empty());
        assert_eq!(env.crons, vec!["*/15 * * * *".to_string()]);
        assert!(env.vars.is_empty());
        assert!(env.kv_namespaces.is_empty());
        assert_eq!(env.migrations.len(), 1);
    }

    #[test]
    fn test_unknown_environment_is_configuration_error() {
        let err = sample().environment(Some("prod")).unwrap_err();
        assert!(matches!(err, PublishError::Configuration(_)));
        assert!(err.to_string().contains("staging"));
    }

    #[test]
    fn test_jsonc_config_is_parsed_with_comments() {
        let raw = r#"{
            // worker identity
            name: "json-worker",
            compatibility_date: "2024-02-02",
            durable_objects: { bindings: [{ name: "COUNTER", class_name: "Counter" }] },
            services: [{ binding: "AUTH", service: "auth" }],
            build: { upload: { format: "service-worker" } },
        }"#;
        let config = Config::parse(raw, Path::new("wrangler.jsonc")).unwrap();
        let env = config.environment(None).unwrap();

        assert_eq!(env.name.as_deref(), Some("json-worker"));
        assert_eq!(env.durable_objects[0].class_name, "Counter");
        assert_eq!(env.services[0].service, "auth");
        assert_eq!(env.build.upload.format, Some(DeclaredFormat::ServiceWorker));
    }

    #[test]
    fn test_discover_walks_up_to_config() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("src").join("handlers");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(dir.path().join("wrangler.toml"), "name = \"x\"\n").unwrap();

        assert_eq!(
            Config::discover(&nested),
            Some(dir.path().join("wrangler.toml"))
        );
    }
}

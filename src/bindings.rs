use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::EnvironmentConfig;

/// Binding name under which a synced static-asset namespace is exposed.
pub const STATIC_CONTENT_BINDING: &str = "__STATIC_CONTENT";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvNamespaceBinding {
    pub binding: String,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurableObjectBinding {
    pub name: String,
    pub class_name: String,
    #[serde(default)]
    pub script_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceBinding {
    pub binding: String,
    pub service: String,
    #[serde(default)]
    pub environment: Option<String>,
}

/// Every binding a deployable unit carries, grouped by category.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bindings {
    pub kv_namespaces: Vec<KvNamespaceBinding>,
    pub vars: BTreeMap<String, Value>,
    pub durable_objects: Vec<DurableObjectBinding>,
    pub services: Vec<ServiceBinding>,
}

/// Binding entry as the upload metadata expects it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerBinding {
    KvNamespace {
        name: String,
        namespace_id: String,
    },
    PlainText {
        name: String,
        text: String,
    },
    Json {
        name: String,
        json: Value,
    },
    DurableObjectNamespace {
        name: String,
        class_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        script_name: Option<String>,
    },
    Service {
        name: String,
        service: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        environment: Option<String>,
    },
    WasmModule {
        name: String,
        part: String,
    },
    TextBlob {
        name: String,
        part: String,
    },
    DataBlob {
        name: String,
        part: String,
    },
}

/// Merge environment bindings with an optional synced asset namespace.
pub fn assemble(env: &EnvironmentConfig, asset_namespace: Option<&str>) -> Bindings {
    let mut kv_namespaces = env.kv_namespaces.clone();
    if let Some(namespace) = asset_namespace {
        kv_namespaces.push(KvNamespaceBinding {
            binding: STATIC_CONTENT_BINDING.to_string(),
            id: namespace.to_string(),
        });
    }

    Bindings {
        kv_namespaces,
        vars: env.vars.clone(),
        durable_objects: env.durable_objects.clone(),
        services: env.services.clone(),
    }
}

impl Bindings {
    pub fn to_worker_bindings(&self) -> Vec<WorkerBinding> {
        let mut out = Vec::new();

        for kv in &self.kv_namespaces {
            out.push(WorkerBinding::KvNamespace {
                name: kv.binding.clone(),
                namespace_id: kv.id.clone(),
            });
        }

        for (name, value) in &self.vars {
            out.push(match value {
                Value::String(text) => WorkerBinding::PlainText {
                    name: name.clone(),
                    text: text.clone(),
                },
                other => WorkerBinding::Json {
                    name: name.clone(),
                    json: other.clone(),
                },
            });
        }

        for object in &self.durable_objects {
            out.push(WorkerBinding::DurableObjectNamespace {
                name: object.name.clone(),
                class_name: object.class_name.clone(),
                script_name: object.script_name.clone(),
            });
        }

        for service in &self.services {
            out.push(WorkerBinding::Service {
                name: service.binding.clone(),
                service: service.service.clone(),
                environment: service.environment.clone(),
            });
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn env() -> EnvironmentConfig {
        let mut vars = BTreeMap::new();
        vars.insert("GREETING".to_string(), json!("hello"));
        vars.insert("LIMITS".to_string(), json!({ "max": 3 }));
        EnvironmentConfig {
            kv_namespaces: vec![KvNamespaceBinding {
                binding: "CACHE".to_string(),
                id: "kv-1".to_string(),
            }],
            vars,
            durable_objects: vec![DurableObjectBinding {
                name: "COUNTER".to_string(),
                class_name: "Counter".to_string(),
                script_name: None,
            }],
            services: vec![ServiceBinding {
                binding: "AUTH".to_string(),
                service: "auth-worker".to_string(),
                environment: Some("production".to_string()),
            }],
            ..EnvironmentConfig::default()
        }
    }

    #[test]
    fn test_assemble_copies_every_category() {
        let env = env();
        let bindings = assemble(&env, None);

        assert_eq!(bindings.kv_namespaces, env.kv_namespaces);
        assert_eq!(bindings.vars, env.vars);
        assert_eq!(bindings.durable_objects, env.durable_objects);
        assert_eq!(bindings.services, env.services);
    }

    #[test]
    fn test_assemble_appends_static_content_namespace() {
        let bindings = assemble(&env(), Some("assets-ns"));

        assert_eq!(bindings.kv_namespaces.len(), 2);
        assert_eq!(
            bindings.kv_namespaces.last(),
            Some(&KvNamespaceBinding {
                binding: STATIC_CONTENT_BINDING.to_string(),
                id: "assets-ns".to_string(),
            })
        );
    }

    #[test]
    fn test_assemble_empty_env_yields_empty_categories() {
        let bindings = assemble(&EnvironmentConfig::default(), None);
        assert_eq!(bindings, Bindings::default());
        assert!(bindings.to_worker_bindings().is_empty());
    }

    #[test]
    fn test_worker_bindings_serialize_with_type_tags() {
        let value = serde_json::to_value(assemble(&env(), None).to_worker_bindings()).unwrap();
        assert_eq!(
            value,
            json!([
                { "type": "kv_namespace", "name": "CACHE", "namespace_id": "kv-1" },
                { "type": "plain_text", "name": "GREETING", "text": "hello" },
                { "type": "json", "name": "LIMITS", "json": { "max": 3 } },
                { "type": "durable_object_namespace", "name": "COUNTER", "class_name": "Counter" },
                { "type": "service", "name": "AUTH", "service": "auth-worker", "environment": "production" }
            ])
        );
    }
}

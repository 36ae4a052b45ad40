use serde_json::{json, Value};

use crate::bindings::{Bindings, WorkerBinding};
use crate::bundle::ExecutionFormat;
use crate::migrations::MigrationPlan;

/// Auxiliary module name the static-asset manifest is injected under.
pub const STATIC_CONTENT_MANIFEST: &str = "__STATIC_CONTENT_MANIFEST";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleKind {
    Esm,
    CommonJs,
    Text,
    Data,
    CompiledWasm,
}

impl ModuleKind {
    pub fn content_type(self) -> &'static str {
        match self {
            ModuleKind::Esm => "application/javascript+module",
            ModuleKind::CommonJs => "application/javascript",
            ModuleKind::Text => "text/plain",
            ModuleKind::Data => "application/octet-stream",
            ModuleKind::CompiledWasm => "application/wasm",
        }
    }
}

impl From<ExecutionFormat> for ModuleKind {
    fn from(format: ExecutionFormat) -> Self {
        match format {
            ExecutionFormat::Esm => ModuleKind::Esm,
            ExecutionFormat::CommonJs => ModuleKind::CommonJs,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MainModule {
    pub filename: String,
    pub content: String,
    pub format: ExecutionFormat,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuxiliaryModule {
    pub name: String,
    pub content: Vec<u8>,
    pub kind: ModuleKind,
}

/// Everything uploaded for one worker version. Rebuilt on every publish.
#[derive(Debug, Clone, PartialEq)]
pub struct DeployableUnit {
    pub name: String,
    pub main_module: MainModule,
    pub auxiliary_modules: Vec<AuxiliaryModule>,
    pub bindings: Bindings,
    pub migrations: Option<MigrationPlan>,
    pub compatibility_date: String,
    pub compatibility_flags: Vec<String>,
    pub usage_model: Option<String>,
}

/// One multipart field of the upload body.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadPart {
    pub name: String,
    pub filename: String,
    pub content: Vec<u8>,
    pub content_type: &'static str,
}

// Service-worker scripts address side modules as globals, so names must be
// valid identifiers.
fn global_name(module_name: &str) -> String {
    module_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '$' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

impl DeployableUnit {
    fn is_module_worker(&self) -> bool {
        self.main_module.format == ExecutionFormat::Esm
    }

    fn auxiliary_part_name(&self, module: &AuxiliaryModule) -> String {
        if self.is_module_worker() {
            module.name.clone()
        } else {
            global_name(&module.name)
        }
    }

    /// The `metadata` part of the upload form.
    pub fn metadata(&self) -> Value {
        let mut bindings = self.bindings.to_worker_bindings();

        if !self.is_module_worker() {
            for module in &self.auxiliary_modules {
                let name = self.auxiliary_part_name(module);
                let binding = match module.kind {
                    ModuleKind::CompiledWasm => WorkerBinding::WasmModule {
                        part: name.clone(),
                        name,
                    },
                    ModuleKind::Text => WorkerBinding::TextBlob {
                        part: name.clone(),
                        name,
                    },
                    ModuleKind::Data => WorkerBinding::DataBlob {
                        part: name.clone(),
                        name,
                    },
                    ModuleKind::Esm | ModuleKind::CommonJs => continue,
                };
                bindings.push(binding);
            }
        }

        let mut metadata = json!({
            "bindings": bindings,
            "compatibility_date": self.compatibility_date,
        });

        let main_key = if self.is_module_worker() {
            "main_module"
        } else {
            "body_part"
        };
        metadata[main_key] = json!(self.main_module.filename);

        if !self.compatibility_flags.is_empty() {
            metadata["compatibility_flags"] = json!(self.compatibility_flags);
        }
        if let Some(usage_model) = &self.usage_model {
            metadata["usage_model"] = json!(usage_model);
        }
        if let Some(migrations) = &self.migrations {
            metadata["migrations"] = json!(migrations);
        }

        metadata
    }

    /// Module parts of the upload form, main module first.
    pub fn upload_parts(&self) -> Vec<UploadPart> {
        let mut parts = vec![UploadPart {
            name: self.main_module.filename.clone(),
            filename: self.main_module.filename.clone(),
            content: self.main_module.content.clone().into_bytes(),
            content_type: ModuleKind::from(self.main_module.format).content_type(),
        }];

        for module in &self.auxiliary_modules {
            parts.push(UploadPart {
                name: self.auxiliary_part_name(module),
                filename: module.name.clone(),
                content: module.content.clone(),
                content_type: module.kind.content_type(),
            });
        }

        parts
    }
}

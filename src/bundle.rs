use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{PublishError, PublishResult};
use crate::unit::{ModuleKind, STATIC_CONTENT_MANIFEST};

const FACADE_TEMPLATE: &str = include_str!("templates/static-asset-facade.js");
const FACADE_FILENAME: &str = "static-asset-facade.js";
pub const KV_ASSET_HANDLER: &str = "@cloudflare/kv-asset-handler";

/// Imports kept out of the bundle and uploaded as side modules instead.
pub const AUXILIARY_MODULE_GLOBS: &[&str] = &["*.wasm", "*.txt", "*.html", "*.bin"];

/// Format requested by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeclaredFormat {
    Modules,
    ServiceWorker,
}

impl fmt::Display for DeclaredFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeclaredFormat::Modules => write!(f, "modules"),
            DeclaredFormat::ServiceWorker => write!(f, "service-worker"),
        }
    }
}

impl FromStr for DeclaredFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "modules" => Ok(DeclaredFormat::Modules),
            "service-worker" => Ok(DeclaredFormat::ServiceWorker),
            other => Err(format!(
                "Invalid format '{}'. Expected \"modules\" or \"service-worker\"",
                other
            )),
        }
    }
}

/// Format the bundled output was classified as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionFormat {
    Esm,
    CommonJs,
}

impl fmt::Display for ExecutionFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionFormat::Esm => write!(f, "esm"),
            ExecutionFormat::CommonJs => write!(f, "commonjs"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BundleEntry {
    File(PathBuf),
    /// In-memory source; `filename` is what the bundler reports it as.
    Synthetic {
        filename: PathBuf,
        contents: String,
        resolve_dir: PathBuf,
    },
}

impl BundleEntry {
    pub fn expected_entry_point(&self) -> &Path {
        match self {
            BundleEntry::File(path) => path,
            BundleEntry::Synthetic { filename, .. } => filename,
        }
    }
}

/// Inputs handed to the bundler. Everything but `entry` and `out_dir` is fixed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleRequest {
    pub entry: BundleEntry,
    pub out_dir: PathBuf,
    pub bundle: bool,
    pub external: Vec<String>,
    pub format: &'static str,
    pub inline_source_map: bool,
    pub metafile: bool,
}

impl BundleRequest {
    pub fn new(entry: BundleEntry, out_dir: PathBuf) -> Self {
        let mut external = vec![STATIC_CONTENT_MANIFEST.to_string()];
        external.extend(AUXILIARY_MODULE_GLOBS.iter().map(|glob| glob.to_string()));
        Self {
            entry,
            out_dir,
            bundle: true,
            external,
            format: "esm",
            inline_source_map: true,
            metafile: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFile {
    pub path: PathBuf,
    pub entry_point: Option<PathBuf>,
    pub exports: Vec<String>,
}

/// A side file imported by the bundle but left external.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectedModule {
    pub specifier: String,
    pub path: PathBuf,
    pub kind: ModuleKind,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildOutput {
    pub outputs: Vec<OutputFile>,
    pub modules: Vec<CollectedModule>,
}

#[async_trait]
pub trait Bundler: Send + Sync {
    async fn bundle(&self, request: &BundleRequest) -> PublishResult<BuildOutput>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleResult {
    pub output_path: PathBuf,
    pub format: ExecutionFormat,
}

/// Pick the output built from `expected_entry`, classify it, and check the
/// classification against the declared format.
pub fn interpret(
    output: &BuildOutput,
    expected_entry: &Path,
    declared: Option<DeclaredFormat>,
) -> PublishResult<BundleResult> {
    let file = output
        .outputs
        .iter()
        .find(|file| file.entry_point.as_deref() == Some(expected_entry))
        .ok_or_else(|| PublishError::BundleResolution {
            entry: expected_entry.to_path_buf(),
        })?;

    let format = classify(&file.exports);
    // Both declared formats need an export-bearing bundle.
    if let Some(declared) = declared {
        if format != ExecutionFormat::Esm {
            return Err(PublishError::FormatMismatch {
                declared,
                actual: format,
            });
        }
    }

    Ok(BundleResult {
        output_path: file.path.clone(),
        format,
    })
}

pub fn classify(exports: &[String]) -> ExecutionFormat {
    if exports.is_empty() {
        ExecutionFormat::CommonJs
    } else {
        ExecutionFormat::Esm
    }
}

/// Side-module kind for an import specifier, if it is one we upload.
pub fn module_kind_for(specifier: &str) -> Option<ModuleKind> {
    let extension = Path::new(specifier).extension()?.to_str()?;
    match extension {
        "wasm" => Some(ModuleKind::CompiledWasm),
        "txt" | "html" => Some(ModuleKind::Text),
        "bin" => Some(ModuleKind::Data),
        _ => None,
    }
}

fn import_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// Entry that wraps `entry` so requests are served from the synced asset
/// namespace first.
pub fn static_asset_facade(entry: &Path) -> BundleEntry {
    let resolve_dir = entry
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let contents = FACADE_TEMPLATE
        .replace("__ENTRY_POINT__", &import_path(entry))
        .replace("__KV_ASSET_HANDLER__", KV_ASSET_HANDLER);

    BundleEntry::Synthetic {
        filename: resolve_dir.join(FACADE_FILENAME),
        contents,
        resolve_dir,
    }
}

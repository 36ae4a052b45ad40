//! `Bundler` backed by the esbuild CLI.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::bundle::{
    module_kind_for, BuildOutput, BundleEntry, BundleRequest, Bundler, CollectedModule,
    OutputFile,
};
use crate::error::{PublishError, PublishResult};

const METAFILE_NAME: &str = "meta.json";
const STDIN_INPUT: &str = "<stdin>";

#[derive(Debug, Deserialize)]
struct Metafile {
    #[serde(default)]
    inputs: BTreeMap<String, MetaInput>,
    #[serde(default)]
    outputs: BTreeMap<String, MetaOutput>,
}

#[derive(Debug, Deserialize)]
struct MetaInput {
    #[serde(default)]
    imports: Vec<MetaImport>,
}

#[derive(Debug, Deserialize)]
struct MetaImport {
    path: String,
    #[serde(default)]
    external: bool,
}

#[derive(Debug, Deserialize)]
struct MetaOutput {
    #[serde(rename = "entryPoint")]
    entry_point: Option<String>,
    #[serde(default)]
    exports: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct EsbuildBundler {
    binary: PathBuf,
}

impl Default for EsbuildBundler {
    fn default() -> Self {
        Self::new("esbuild")
    }
}

impl EsbuildBundler {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn command(&self, request: &BundleRequest, metafile: &Path) -> Command {
        let mut cmd = Command::new(&self.binary);
        if request.bundle {
            cmd.arg("--bundle");
        }
        cmd.arg(format!("--format={}", request.format));
        cmd.arg(format!("--outdir={}", request.out_dir.display()));
        if request.inline_source_map {
            cmd.arg("--sourcemap=inline");
        }
        if request.metafile {
            cmd.arg(format!("--metafile={}", metafile.display()));
        }
        for external in &request.external {
            cmd.arg(format!("--external:{}", external));
        }
        cmd.arg("--log-level=warning");
        cmd
    }
}

#[async_trait]
impl Bundler for EsbuildBundler {
    async fn bundle(&self, request: &BundleRequest) -> PublishResult<BuildOutput> {
        let metafile = request.out_dir.join(METAFILE_NAME);
        let mut cmd = self.command(request, &metafile);
        cmd.stdout(Stdio::inherit()).stderr(Stdio::piped());

        let (working_dir, stdin_contents, synthetic) = match &request.entry {
            BundleEntry::File(path) => {
                cmd.arg(path);
                (
                    path.parent().map(Path::to_path_buf).unwrap_or_default(),
                    None,
                    None,
                )
            }
            BundleEntry::Synthetic {
                filename,
                contents,
                resolve_dir,
            } => {
                let sourcefile = filename
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|| STDIN_INPUT.to_string());
                cmd.arg(format!("--sourcefile={}", sourcefile));
                cmd.stdin(Stdio::piped());
                (resolve_dir.clone(), Some(contents), Some(filename.as_path()))
            }
        };
        let working_dir = absolute(&working_dir)?;
        cmd.current_dir(&working_dir);

        debug!(binary = %self.binary.display(), cwd = %working_dir.display(), "Running esbuild");
        let mut child = cmd.spawn().map_err(|e| {
            PublishError::Build(format!(
                "Failed to run {}: {}",
                self.binary.display(),
                e
            ))
        })?;
        if let (Some(contents), Some(mut stdin)) = (stdin_contents, child.stdin.take()) {
            stdin.write_all(contents.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PublishError::Build(format!(
                "esbuild exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let raw = tokio::fs::read_to_string(&metafile).await?;
        parse_metafile(&raw, &working_dir, synthetic)
    }
}

fn absolute(path: &Path) -> PublishResult<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

/// Translate an esbuild metafile into a `BuildOutput` with absolute paths.
///
/// esbuild reports paths relative to its working directory and names piped
/// input `<stdin>`; the latter is mapped back to `synthetic` when given.
pub fn parse_metafile(
    raw: &str,
    working_dir: &Path,
    synthetic: Option<&Path>,
) -> PublishResult<BuildOutput> {
    let metafile: Metafile = serde_json::from_str(raw)?;
    let resolve = |path: &str| -> PathBuf {
        match synthetic {
            Some(filename) if path == STDIN_INPUT => filename.to_path_buf(),
            _ => working_dir.join(path),
        }
    };

    let outputs = metafile
        .outputs
        .iter()
        .filter(|(path, _)| !path.ends_with(".map"))
        .map(|(path, output)| OutputFile {
            path: working_dir.join(path),
            entry_point: output.entry_point.as_deref().map(&resolve),
            exports: output.exports.clone(),
        })
        .collect();

    let mut seen: HashMap<String, PathBuf> = HashMap::new();
    let mut modules = Vec::new();
    for (input_path, input) in &metafile.inputs {
        let importer = resolve(input_path);
        let importer_dir = importer.parent().unwrap_or(working_dir);
        for import in input.imports.iter().filter(|import| import.external) {
            let Some(kind) = module_kind_for(&import.path) else {
                continue;
            };
            if !import.path.starts_with('.') {
                continue;
            }
            let path = importer_dir.join(&import.path);
            match seen.get(&import.path) {
                Some(existing) if *existing == path => continue,
                Some(existing) => {
                    return Err(PublishError::Build(format!(
                        "Side module {} resolves to both {} and {}",
                        import.path,
                        existing.display(),
                        path.display()
                    )))
                }
                None => {}
            }
            seen.insert(import.path.clone(), path.clone());
            modules.push(CollectedModule {
                specifier: import.path.clone(),
                path,
                kind,
            });
        }
    }

    Ok(BuildOutput { outputs, modules })
}

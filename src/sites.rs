//! Static asset upload into a KV namespace.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::cloudflare::CloudflareClient;
use crate::error::{PublishError, PublishResult};

const DRY_RUN_NAMESPACE: &str = "dry-run-namespace";
const BULK_UPLOAD_MAX_KEYS: usize = 5_000;
const BULK_UPLOAD_MAX_BYTES: usize = 50 * 1024 * 1024;
const KEY_HASH_LEN: usize = 10;

/// Result of syncing a directory: relative path to storage key, plus the
/// namespace holding the keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssetManifest {
    pub manifest: BTreeMap<String, String>,
    pub namespace: String,
}

#[async_trait]
pub trait AssetSync: Send + Sync {
    async fn sync(
        &self,
        account_id: &str,
        unit_name: &str,
        directory: &Path,
        dry_run: bool,
    ) -> PublishResult<AssetManifest>;
}

#[derive(Debug, Clone)]
struct AssetFile {
    relative_path: String,
    key: String,
    content: Vec<u8>,
}

#[derive(Debug, Deserialize)]
struct NamespaceSummary {
    id: String,
    title: String,
}

#[derive(Debug, Deserialize)]
struct KeySummary {
    name: String,
}

#[derive(Debug, Serialize)]
struct BulkEntry {
    key: String,
    value: String,
    base64: bool,
}

fn normalize_relative_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn is_skippable_asset(relative: &Path) -> bool {
    relative.components().any(|part| {
        let part = part.as_os_str().to_string_lossy();
        part.starts_with('.') || part == "node_modules"
    })
}

/// Content-addressed key: `css/site.css` becomes `css/site.<hash>.css`.
pub fn asset_key(relative_path: &str, content: &[u8]) -> String {
    let digest = blake3::hash(content).to_hex();
    let hash = &digest.as_str()[..KEY_HASH_LEN];
    let path = Path::new(relative_path);
    match (path.file_stem(), path.extension()) {
        (Some(stem), Some(extension)) => {
            let parent = normalize_relative_path(path.parent().unwrap_or(Path::new("")));
            let file = format!(
                "{}.{}.{}",
                stem.to_string_lossy(),
                hash,
                extension.to_string_lossy()
            );
            if parent.is_empty() {
                file
            } else {
                format!("{}/{}", parent, file)
            }
        }
        _ => format!("{}.{}", relative_path, hash),
    }
}

async fn collect_asset_files(directory: &Path) -> PublishResult<Vec<AssetFile>> {
    if !directory.is_dir() {
        return Err(PublishError::Configuration(format!(
            "Assets directory not found: {}",
            directory.display()
        )));
    }

    let mut paths = Vec::new();
    for entry in WalkDir::new(directory).follow_links(false) {
        let entry = entry.map_err(|e| PublishError::Io(e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let Ok(relative) = entry.path().strip_prefix(directory) else {
            continue;
        };
        if is_skippable_asset(relative) {
            continue;
        }
        paths.push((normalize_relative_path(relative), entry.into_path()));
    }

    let mut files = Vec::with_capacity(paths.len());
    for (relative_path, path) in paths {
        let content = tokio::fs::read(&path).await?;
        files.push(AssetFile {
            key: asset_key(&relative_path, &content),
            relative_path,
            content,
        });
    }

    files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(files)
}

/// Files whose key the namespace does not hold yet.
fn pending<'a>(files: &'a [AssetFile], existing: &HashSet<String>) -> Vec<&'a AssetFile> {
    files
        .iter()
        .filter(|file| !existing.contains(&file.key))
        .collect()
}

fn batches<'a>(files: &[&'a AssetFile]) -> Vec<Vec<&'a AssetFile>> {
    batches_within(files, BULK_UPLOAD_MAX_KEYS, BULK_UPLOAD_MAX_BYTES)
}

/// Split uploads into bulk requests of at most `max_keys` entries and
/// `max_bytes` of content. A file larger than `max_bytes` goes alone.
fn batches_within<'a>(
    files: &[&'a AssetFile],
    max_keys: usize,
    max_bytes: usize,
) -> Vec<Vec<&'a AssetFile>> {
    let mut batches = Vec::new();
    let mut batch: Vec<&AssetFile> = Vec::new();
    let mut batch_bytes = 0usize;
    for &file in files {
        let size = file.content.len();
        if !batch.is_empty() && (batch.len() >= max_keys || batch_bytes + size > max_bytes) {
            batches.push(std::mem::take(&mut batch));
            batch_bytes = 0;
        }
        batch_bytes += size;
        batch.push(file);
    }
    if !batch.is_empty() {
        batches.push(batch);
    }
    batches
}

/// Syncs assets into a per-worker KV namespace, uploading only missing keys.
#[derive(Debug, Clone)]
pub struct KvAssetSync {
    client: CloudflareClient,
}

impl KvAssetSync {
    pub fn new(client: CloudflareClient) -> Self {
        Self { client }
    }

    async fn ensure_namespace(&self, account_id: &str, title: &str) -> PublishResult<String> {
        let path = format!("/accounts/{}/storage/kv/namespaces", account_id);
        let mut page = 1usize;
        loop {
            let page_param = page.to_string();
            let (result, _): (Value, _) = self
                .client
                .get(
                    &path,
                    &[("per_page", "100"), ("page", page_param.as_str())],
                    "List KV namespaces",
                )
                .await?;
            let namespaces: Vec<NamespaceSummary> = serde_json::from_value(result)?;
            if let Some(existing) = namespaces.iter().find(|ns| ns.title == title) {
                return Ok(existing.id.clone());
            }
            if namespaces.len() < 100 {
                break;
            }
            page += 1;
        }

        info!(title, "Creating KV namespace for static assets");
        let created: Value = self
            .client
            .send_json(
                reqwest::Method::POST,
                &path,
                &json!({ "title": title }),
                &format!("Create KV namespace {}", title),
            )
            .await?;
        created
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                PublishError::UnexpectedResponse(format!(
                    "Create KV namespace {} returned no id",
                    title
                ))
            })
    }

    async fn existing_keys(&self, account_id: &str, namespace: &str) -> PublishResult<HashSet<String>> {
        let path = format!(
            "/accounts/{}/storage/kv/namespaces/{}/keys",
            account_id, namespace
        );
        let mut keys = HashSet::new();
        let mut cursor: Option<String> = None;
        loop {
            let mut query = vec![("limit", "1000")];
            if let Some(cursor) = cursor.as_deref() {
                query.push(("cursor", cursor));
            }
            let (result, info): (Vec<KeySummary>, _) =
                self.client.get(&path, &query, "List KV keys").await?;
            keys.extend(result.into_iter().map(|key| key.name));

            cursor = info
                .as_ref()
                .and_then(|info| info.get("cursor"))
                .and_then(Value::as_str)
                .filter(|cursor| !cursor.is_empty())
                .map(str::to_string);
            if cursor.is_none() {
                break;
            }
        }
        Ok(keys)
    }

    async fn upload_batch(
        &self,
        account_id: &str,
        namespace: &str,
        batch: &[&AssetFile],
    ) -> PublishResult<()> {
        let entries: Vec<BulkEntry> = batch
            .iter()
            .map(|file| {
                debug!(key = %file.key, "Queueing asset");
                BulkEntry {
                    key: file.key.clone(),
                    value: base64::engine::general_purpose::STANDARD.encode(&file.content),
                    base64: true,
                }
            })
            .collect();
        let path = format!(
            "/accounts/{}/storage/kv/namespaces/{}/bulk",
            account_id, namespace
        );
        let _: Value = self
            .client
            .send_json(
                reqwest::Method::PUT,
                &path,
                &entries,
                &format!("Upload {} asset(s)", entries.len()),
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl AssetSync for KvAssetSync {
    async fn sync(
        &self,
        account_id: &str,
        unit_name: &str,
        directory: &Path,
        dry_run: bool,
    ) -> PublishResult<AssetManifest> {
        let files = collect_asset_files(directory).await?;
        let manifest: BTreeMap<String, String> = files
            .iter()
            .map(|file| (file.relative_path.clone(), file.key.clone()))
            .collect();

        if dry_run {
            return Ok(AssetManifest {
                manifest,
                namespace: DRY_RUN_NAMESPACE.to_string(),
            });
        }

        let title = format!("__{}-workers_sites_assets", unit_name);
        let namespace = self.ensure_namespace(account_id, &title).await?;
        let existing = self.existing_keys(account_id, &namespace).await?;

        let pending = pending(&files, &existing);
        info!(
            "Syncing {} asset(s) from {} ({} already uploaded)",
            pending.len(),
            directory.display(),
            files.len() - pending.len()
        );

        for batch in batches(&pending) {
            self.upload_batch(account_id, &namespace, &batch).await?;
        }

        Ok(AssetManifest {
            manifest,
            namespace,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_asset_key_inserts_hash_before_extension() {
        let key = asset_key("css/site.css", b"body {}");
        let digest = blake3::hash(b"body {}").to_hex();
        assert_eq!(key, format!("css/site.{}.css", &digest[..KEY_HASH_LEN]));

        let bare = asset_key("LICENSE", b"MIT");
        assert!(bare.starts_with("LICENSE."));
        assert_eq!(bare.len(), "LICENSE.".len() + KEY_HASH_LEN);
    }

    #[test]
    fn test_asset_key_changes_with_content() {
        assert_ne!(asset_key("a.js", b"1"), asset_key("a.js", b"2"));
        assert_eq!(asset_key("a.js", b"1"), asset_key("a.js", b"1"));
    }

    fn file(name: &str, size: usize) -> AssetFile {
        let content = vec![b'x'; size];
        AssetFile {
            relative_path: name.to_string(),
            key: asset_key(name, &content),
            content,
        }
    }

    fn sizes(batches: &[Vec<&AssetFile>]) -> Vec<usize> {
        batches.iter().map(Vec::len).collect()
    }

    #[test]
    fn test_batches_cut_at_key_limit() {
        let files: Vec<AssetFile> = (0..BULK_UPLOAD_MAX_KEYS + 1)
            .map(|i| file(&format!("f{}.txt", i), 1))
            .collect();
        let refs: Vec<&AssetFile> = files.iter().collect();

        let batches = batches(&refs);
        assert_eq!(sizes(&batches), vec![BULK_UPLOAD_MAX_KEYS, 1]);
        assert_eq!(batches[1][0].relative_path, format!("f{}.txt", BULK_UPLOAD_MAX_KEYS));
    }

    #[test]
    fn test_batches_cut_at_byte_limit() {
        let files = vec![file("a.js", 40), file("b.js", 40), file("c.js", 20)];
        let refs: Vec<&AssetFile> = files.iter().collect();

        // 40 + 40 exceeds 64, 40 + 20 fits.
        let batches = batches_within(&refs, 100, 64);
        assert_eq!(sizes(&batches), vec![1, 2]);
        assert_eq!(batches[1][1].relative_path, "c.js");
    }

    #[test]
    fn test_oversized_file_is_uploaded_alone() {
        let files = vec![file("a.js", 10), file("huge.bin", 500), file("b.js", 10)];
        let refs: Vec<&AssetFile> = files.iter().collect();

        let batches = batches_within(&refs, 100, 64);
        assert_eq!(sizes(&batches), vec![1, 1, 1]);
        assert_eq!(batches[1][0].relative_path, "huge.bin");
    }

    #[test]
    fn test_batches_of_nothing_is_empty() {
        assert!(batches(&[]).is_empty());
    }

    #[test]
    fn test_pending_skips_keys_already_uploaded() {
        let files = vec![file("a.js", 1), file("b.js", 2), file("c.js", 3)];
        let existing: HashSet<String> = [files[0].key.clone(), "stale.0000000000.js".to_string()]
            .into_iter()
            .collect();

        let pending = pending(&files, &existing);
        let names: Vec<&str> = pending.iter().map(|f| f.relative_path.as_str()).collect();
        assert_eq!(names, vec!["b.js", "c.js"]);
    }

    #[tokio::test]
    async fn test_collect_skips_hidden_files_and_node_modules() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("img")).unwrap();
        std::fs::create_dir_all(root.join("node_modules/pkg")).unwrap();
        std::fs::write(root.join("index.html"), "<h1>hi</h1>").unwrap();
        std::fs::write(root.join("img/logo.svg"), "<svg/>").unwrap();
        std::fs::write(root.join(".DS_Store"), "junk").unwrap();
        std::fs::write(root.join("node_modules/pkg/index.js"), "x").unwrap();

        let files = collect_asset_files(root).await.unwrap();
        let paths: Vec<&str> = files.iter().map(|f| f.relative_path.as_str()).collect();
        assert_eq!(paths, vec!["img/logo.svg", "index.html"]);
        assert_eq!(files[1].content, b"<h1>hi</h1>");
    }

    #[tokio::test]
    async fn test_collect_missing_directory_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = collect_asset_files(&dir.path().join("public"))
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_dry_run_builds_manifest_without_remote_calls() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<h1>hi</h1>").unwrap();

        // Unroutable base URL: any request would fail the test.
        let sync = KvAssetSync::new(CloudflareClient::with_base_url("token", "http://127.0.0.1:9"));
        let result = sync
            .sync("acc", "my-worker", dir.path(), true)
            .await
            .unwrap();

        assert_eq!(result.namespace, DRY_RUN_NAMESPACE);
        assert_eq!(
            result.manifest.get("index.html"),
            Some(&asset_key("index.html", b"<h1>hi</h1>"))
        );
    }
}

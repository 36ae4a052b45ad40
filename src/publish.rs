//! The publish flow: build, upload, then activate.

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use futures_util::FutureExt;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::activation::{join_fail_fast, route_targets, workers_dev_url, ActivationFuture};
use crate::bindings::assemble;
use crate::bundle::{interpret, static_asset_facade, BundleEntry, BundleRequest, Bundler, DeclaredFormat};
use crate::cloudflare::{ScriptAddress, WorkersApi};
use crate::config::EnvironmentConfig;
use crate::custom_build::run_custom_build;
use crate::error::{PublishError, PublishResult};
use crate::migrations::{lookup_migration_tag, resolve, MigrationPlan};
use crate::sites::{AssetManifest, AssetSync};
use crate::unit::{AuxiliaryModule, DeployableUnit, MainModule, ModuleKind, STATIC_CONTENT_MANIFEST};

/// Wait after enabling workers.dev before the URL is reported, so the first
/// request does not hit a cached 404 at the edge.
pub const SUBDOMAIN_SETTLE_DELAY: Duration = Duration::from_secs(3);

const DEFAULT_UPLOAD_DIR: &str = "dist";

/// Everything one publish needs. CLI values take precedence over `config`.
#[derive(Debug, Clone, Default)]
pub struct PublishProps {
    pub config: EnvironmentConfig,
    /// Directory holding the config file; relative config paths resolve here.
    pub config_dir: PathBuf,
    pub env: Option<String>,
    /// Deploy environments as separate `{name}-{env}` workers.
    pub legacy_env: bool,
    pub script: Option<PathBuf>,
    pub name: Option<String>,
    pub account_id: Option<String>,
    pub format: Option<DeclaredFormat>,
    pub compatibility_date: Option<String>,
    pub compatibility_flags: Vec<String>,
    pub assets: Option<PathBuf>,
    pub triggers: Option<Vec<String>>,
    pub routes: Option<Vec<String>>,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeploymentReport {
    pub worker_label: String,
    pub upload_duration_ms: u64,
    pub activation_duration_ms: u64,
    /// workers.dev URL, then routes, then cron schedules.
    pub targets: Vec<String>,
}

fn seconds(ms: u64) -> String {
    format!("{:.2}", ms as f64 / 1000.0)
}

impl fmt::Display for DeploymentReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Uploaded {} ({} sec)",
            self.worker_label,
            seconds(self.upload_duration_ms)
        )?;
        if self.targets.is_empty() {
            return write!(f, "No publish targets for {}", self.worker_label);
        }
        write!(
            f,
            "Published {} ({} sec)",
            self.worker_label,
            seconds(self.activation_duration_ms)
        )?;
        for target in &self.targets {
            write!(f, "\n  {}", target)?;
        }
        Ok(())
    }
}

/// Settings after merging CLI values into the environment config.
#[derive(Debug, Clone, PartialEq)]
struct Preflight {
    address: ScriptAddress,
    worker_label: String,
    entry: PathBuf,
    format: Option<DeclaredFormat>,
    assets: Option<PathBuf>,
    compatibility_date: String,
    compatibility_flags: Vec<String>,
    routes: Vec<String>,
    crons: Vec<String>,
}

/// Lexically drop `.` and fold `..` so paths compare equal to bundler output.
fn clean_path(path: &Path) -> PathBuf {
    let mut cleaned = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if matches!(cleaned.components().next_back(), Some(Component::Normal(_))) {
                    cleaned.pop();
                } else {
                    cleaned.push(component);
                }
            }
            other => cleaned.push(other),
        }
    }
    cleaned
}

fn preflight(props: &PublishProps) -> PublishResult<Preflight> {
    let config = &props.config;

    let compatibility_date = props
        .compatibility_date
        .clone()
        .or_else(|| config.compatibility_date.clone())
        .ok_or_else(|| {
            PublishError::missing(
                "A compatibility date is required. Pass --compatibility-date or set compatibility_date in the config",
            )
        })?;
    let account_id = props
        .account_id
        .clone()
        .or_else(|| config.account_id.clone())
        .ok_or_else(|| {
            PublishError::missing("An account id is required. Pass --account-id or set account_id in the config")
        })?;
    let name = props
        .name
        .clone()
        .or_else(|| config.name.clone())
        .ok_or_else(|| {
            PublishError::missing("A worker name is required. Pass --name or set name in the config")
        })?;

    let entry = match (&props.script, &config.build.upload.main) {
        (Some(script), _) => script.clone(),
        (None, Some(main)) => props
            .config_dir
            .join(config.build.upload.dir.as_deref().unwrap_or(DEFAULT_UPLOAD_DIR))
            .join(main),
        (None, None) => {
            return Err(PublishError::missing(
                "No entry point given. Pass a script path or set build.upload.main in the config",
            ))
        }
    };

    let format = props.format.or(config.build.upload.format);
    let assets = props.assets.clone().or_else(|| {
        config
            .site
            .as_ref()
            .map(|site| props.config_dir.join(&site.bucket))
    });
    if assets.is_some() && format == Some(DeclaredFormat::ServiceWorker) {
        return Err(PublishError::IncompatibleOptions(
            "Static assets cannot be published with the service-worker format; use modules instead"
                .to_string(),
        ));
    }

    let (address, worker_label) = match (&props.env, props.legacy_env) {
        (Some(env), true) => {
            let script_name = format!("{}-{}", name, env);
            (
                ScriptAddress {
                    account_id,
                    name: script_name.clone(),
                    environment: None,
                },
                script_name,
            )
        }
        (Some(env), false) => (
            ScriptAddress {
                account_id,
                name: name.clone(),
                environment: Some(env.clone()),
            },
            format!("{} ({})", name, env),
        ),
        (None, _) => (
            ScriptAddress {
                account_id,
                name: name.clone(),
                environment: None,
            },
            name,
        ),
    };

    let compatibility_flags = if props.compatibility_flags.is_empty() {
        config.compatibility_flags.clone()
    } else {
        props.compatibility_flags.clone()
    };

    Ok(Preflight {
        address,
        worker_label,
        entry: clean_path(&entry),
        format,
        assets,
        compatibility_date,
        compatibility_flags,
        routes: props.routes.clone().unwrap_or_else(|| config.routes.clone()),
        crons: props.triggers.clone().unwrap_or_else(|| config.crons.clone()),
    })
}

/// Main module plus side modules, read out of a finished build.
struct BuiltWorker {
    main_module: MainModule,
    auxiliary_modules: Vec<AuxiliaryModule>,
}

pub struct Publisher<A, B, S> {
    api: A,
    bundler: B,
    assets: S,
}

impl<A, B, S> Publisher<A, B, S>
where
    A: WorkersApi,
    B: Bundler,
    S: AssetSync,
{
    pub fn new(api: A, bundler: B, assets: S) -> Self {
        Self {
            api,
            bundler,
            assets,
        }
    }

    pub async fn publish(&self, props: &PublishProps) -> PublishResult<DeploymentReport> {
        let plan = preflight(props)?;
        let config = &props.config;

        if let Some(command) = &config.build.command {
            let cwd = match &config.build.cwd {
                Some(cwd) => props.config_dir.join(cwd),
                None => props.config_dir.clone(),
            };
            run_custom_build(command, &cwd).await?;
        }

        let built = self.build(&plan).await?;

        let (migrations, asset_manifest) = tokio::try_join!(
            self.resolve_migrations(config, &plan.address, props.dry_run),
            self.sync_assets(&plan, props.dry_run),
        )?;

        let bindings = assemble(
            config,
            asset_manifest.as_ref().map(|assets| assets.namespace.as_str()),
        );

        let mut auxiliary_modules = built.auxiliary_modules;
        if let Some(assets) = &asset_manifest {
            auxiliary_modules.push(AuxiliaryModule {
                name: STATIC_CONTENT_MANIFEST.to_string(),
                content: serde_json::to_vec(&assets.manifest)?,
                kind: ModuleKind::Text,
            });
        }

        let unit = DeployableUnit {
            name: plan.address.name.clone(),
            main_module: built.main_module,
            auxiliary_modules,
            bindings,
            migrations,
            compatibility_date: plan.compatibility_date.clone(),
            compatibility_flags: plan.compatibility_flags.clone(),
            usage_model: config.usage_model.clone(),
        };

        if props.dry_run {
            info!(
                "Dry run: built {} ({} module(s)), skipping upload",
                plan.worker_label,
                unit.auxiliary_modules.len() + 1
            );
            return Ok(DeploymentReport {
                worker_label: plan.worker_label,
                ..DeploymentReport::default()
            });
        }

        let upload_started = Instant::now();
        let upload = self.api.upload_script(&plan.address, &unit).await?;
        let upload_duration_ms = elapsed_ms(upload_started);
        info!("Uploaded {} in {} ms", plan.worker_label, upload_duration_ms);

        let activation_started = Instant::now();
        let mut steps: Vec<ActivationFuture<'_>> = Vec::new();
        if config.workers_dev {
            steps.push(
                self.expose_on_subdomain(&plan.address, upload.available_on_subdomain)
                    .boxed(),
            );
        }
        if !plan.routes.is_empty() {
            steps.push(self.assign_routes(&plan.address, &plan.routes).boxed());
        }
        if !plan.crons.is_empty() {
            steps.push(self.assign_schedules(&plan.address, &plan.crons).boxed());
        }
        let targets = join_fail_fast(steps).await?;

        Ok(DeploymentReport {
            worker_label: plan.worker_label,
            upload_duration_ms,
            activation_duration_ms: elapsed_ms(activation_started),
            targets,
        })
    }

    async fn build(&self, plan: &Preflight) -> PublishResult<BuiltWorker> {
        let work_dir = tempfile::Builder::new()
            .prefix("worker-publish-")
            .tempdir()?;

        let entry = match &plan.assets {
            Some(_) => static_asset_facade(&plan.entry),
            None => BundleEntry::File(plan.entry.clone()),
        };
        let request = BundleRequest::new(entry, work_dir.path().to_path_buf());
        debug!(out_dir = %work_dir.path().display(), "Bundling {}", plan.entry.display());

        let output = self.bundler.bundle(&request).await?;
        let bundle = interpret(&output, request.entry.expected_entry_point(), plan.format)?;

        let content = tokio::fs::read_to_string(&bundle.output_path).await?;
        let filename = bundle
            .output_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| PublishError::BundleResolution {
                entry: plan.entry.clone(),
            })?;

        let mut auxiliary_modules = Vec::with_capacity(output.modules.len());
        for module in &output.modules {
            auxiliary_modules.push(AuxiliaryModule {
                name: module.specifier.clone(),
                content: tokio::fs::read(&module.path).await?,
                kind: module.kind,
            });
        }

        work_dir.close()?;

        Ok(BuiltWorker {
            main_module: MainModule {
                filename,
                content,
                format: bundle.format,
            },
            auxiliary_modules,
        })
    }

    async fn resolve_migrations(
        &self,
        config: &EnvironmentConfig,
        address: &ScriptAddress,
        dry_run: bool,
    ) -> PublishResult<Option<MigrationPlan>> {
        if config.migrations.is_empty() {
            return Ok(None);
        }
        let remote_tag = if dry_run {
            None
        } else {
            lookup_migration_tag(&self.api, &address.account_id, &address.name).await?
        };
        Ok(resolve(&config.migrations, remote_tag.as_deref()))
    }

    async fn sync_assets(
        &self,
        plan: &Preflight,
        dry_run: bool,
    ) -> PublishResult<Option<AssetManifest>> {
        let Some(directory) = &plan.assets else {
            return Ok(None);
        };
        let manifest = self
            .assets
            .sync(&plan.address.account_id, &plan.address.name, directory, dry_run)
            .await?;
        Ok(Some(manifest))
    }

    async fn expose_on_subdomain(
        &self,
        address: &ScriptAddress,
        already_available: bool,
    ) -> PublishResult<Vec<String>> {
        if !already_available {
            self.api.enable_subdomain(address).await?;
            debug!("Enabled workers.dev for {}, waiting for it to settle", address.name);
            tokio::time::sleep(SUBDOMAIN_SETTLE_DELAY).await;
        }
        let subdomain = self.api.account_subdomain(&address.account_id).await?;
        Ok(vec![workers_dev_url(
            &address.name,
            address.environment.as_deref(),
            &subdomain,
        )])
    }

    async fn assign_routes(
        &self,
        address: &ScriptAddress,
        routes: &[String],
    ) -> PublishResult<Vec<String>> {
        self.api.put_routes(address, routes).await?;
        Ok(route_targets(routes))
    }

    async fn assign_schedules(
        &self,
        address: &ScriptAddress,
        crons: &[String],
    ) -> PublishResult<Vec<String>> {
        self.api.put_schedules(address, crons).await?;
        Ok(crons.to_vec())
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SiteConfig, UploadConfig};

    fn props() -> PublishProps {
        PublishProps {
            config: EnvironmentConfig {
                name: Some("api".to_string()),
                account_id: Some("acc".to_string()),
                compatibility_date: Some("2024-01-01".to_string()),
                ..EnvironmentConfig::default()
            },
            config_dir: PathBuf::from("/proj"),
            script: Some(PathBuf::from("/proj/src/index.js")),
            ..PublishProps::default()
        }
    }

    #[test]
    fn test_clean_path_folds_dots() {
        assert_eq!(
            clean_path(Path::new("/proj/dist/./index.mjs")),
            PathBuf::from("/proj/dist/index.mjs")
        );
        assert_eq!(
            clean_path(Path::new("/proj/src/../dist/index.mjs")),
            PathBuf::from("/proj/dist/index.mjs")
        );
        assert_eq!(clean_path(Path::new("../a")), PathBuf::from("../a"));
    }

    #[test]
    fn test_preflight_reports_compatibility_date_first() {
        let err = preflight(&PublishProps::default()).unwrap_err();
        assert!(err.to_string().contains("compatibility date"));

        let mut props = props();
        props.config.account_id = None;
        props.config.name = None;
        let err = preflight(&props).unwrap_err();
        assert!(err.to_string().contains("account id"));
    }

    #[test]
    fn test_preflight_requires_entry() {
        let mut props = props();
        props.script = None;
        let err = preflight(&props).unwrap_err();
        assert!(matches!(err, PublishError::Configuration(_)));
    }

    #[test]
    fn test_entry_resolves_from_upload_config() {
        let mut props = props();
        props.script = None;
        props.config.build.upload = UploadConfig {
            format: Some(DeclaredFormat::Modules),
            dir: None,
            main: Some("./index.mjs".to_string()),
        };

        let plan = preflight(&props).unwrap();
        assert_eq!(plan.entry, PathBuf::from("/proj/dist/index.mjs"));
        assert_eq!(plan.format, Some(DeclaredFormat::Modules));
    }

    #[test]
    fn test_site_bucket_with_service_worker_is_rejected() {
        let mut props = props();
        props.config.site = Some(SiteConfig {
            bucket: "public".to_string(),
        });
        props.format = Some(DeclaredFormat::ServiceWorker);

        assert!(matches!(
            preflight(&props),
            Err(PublishError::IncompatibleOptions(_))
        ));
    }

    #[test]
    fn test_environment_naming() {
        let mut props = props();
        props.env = Some("staging".to_string());

        let plan = preflight(&props).unwrap();
        assert_eq!(plan.address.name, "api");
        assert_eq!(plan.address.environment.as_deref(), Some("staging"));
        assert_eq!(plan.worker_label, "api (staging)");

        props.legacy_env = true;
        let plan = preflight(&props).unwrap();
        assert_eq!(plan.address.name, "api-staging");
        assert_eq!(plan.address.environment, None);
        assert_eq!(plan.worker_label, "api-staging");
    }

    #[test]
    fn test_cli_routes_and_triggers_replace_config() {
        let mut props = props();
        props.config.routes = vec!["a.com/*".to_string()];
        props.config.crons = vec!["0 * * * *".to_string()];
        props.routes = Some(vec!["b.com/*".to_string()]);
        props.triggers = Some(Vec::new());

        let plan = preflight(&props).unwrap();
        assert_eq!(plan.routes, vec!["b.com/*"]);
        assert!(plan.crons.is_empty());
    }

    #[test]
    fn test_report_display() {
        let report = DeploymentReport {
            worker_label: "api".to_string(),
            upload_duration_ms: 1250,
            activation_duration_ms: 40,
            targets: vec!["https://api.acme.workers.dev".to_string()],
        };
        assert_eq!(
            report.to_string(),
            "Uploaded api (1.25 sec)\nPublished api (0.04 sec)\n  https://api.acme.workers.dev"
        );

        let empty = DeploymentReport {
            worker_label: "api".to_string(),
            ..DeploymentReport::default()
        };
        assert_eq!(
            empty.to_string(),
            "Uploaded api (0.00 sec)\nNo publish targets for api"
        );
    }
}

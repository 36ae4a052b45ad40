pub mod activation;
pub mod bindings;
pub mod bundle;
pub mod cloudflare;
pub mod config;
pub mod custom_build;
pub mod error;
pub mod esbuild;
pub mod logging;
pub mod migrations;
pub mod publish;
pub mod sites;
pub mod unit;

pub use error::{PublishError, PublishResult};
pub use publish::{DeploymentReport, PublishProps, Publisher};

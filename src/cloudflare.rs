use async_trait::async_trait;
use reqwest::multipart;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{PublishError, PublishResult};
use crate::unit::DeployableUnit;

pub const CLOUDFLARE_API_BASE: &str = "https://api.cloudflare.com/client/v4";

#[derive(Debug, Deserialize)]
struct CloudflareApiMessage {
    code: Option<i64>,
    message: String,
}

#[derive(Debug, Deserialize)]
struct CloudflareApiResponse<T> {
    success: bool,
    result: Option<T>,
    errors: Option<Vec<CloudflareApiMessage>>,
    messages: Option<Vec<CloudflareApiMessage>>,
    result_info: Option<Value>,
}

/// Where a worker lives remotely: a plain script, or one environment of a
/// service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptAddress {
    pub account_id: String,
    pub name: String,
    pub environment: Option<String>,
}

impl ScriptAddress {
    pub fn path(&self) -> String {
        match &self.environment {
            Some(env) => format!(
                "/accounts/{}/workers/services/{}/environments/{}",
                self.account_id, self.name, env
            ),
            None => format!("/accounts/{}/workers/scripts/{}", self.account_id, self.name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ScriptSummary {
    pub id: String,
    #[serde(default)]
    pub migration_tag: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct UploadResult {
    #[serde(default)]
    pub available_on_subdomain: bool,
}

#[derive(Debug, Serialize)]
struct RoutePattern<'a> {
    pattern: &'a str,
}

#[derive(Debug, Serialize)]
struct CronSchedule<'a> {
    cron: &'a str,
}

/// Remote operations the publish flow performs.
#[async_trait]
pub trait WorkersApi: Send + Sync {
    async fn list_scripts(&self, account_id: &str) -> PublishResult<Vec<ScriptSummary>>;

    /// Upload `unit`, asking the remote to report workers.dev status too.
    async fn upload_script(
        &self,
        address: &ScriptAddress,
        unit: &DeployableUnit,
    ) -> PublishResult<UploadResult>;

    async fn enable_subdomain(&self, address: &ScriptAddress) -> PublishResult<()>;

    async fn account_subdomain(&self, account_id: &str) -> PublishResult<String>;

    /// Replace the full route list.
    async fn put_routes(&self, address: &ScriptAddress, routes: &[String]) -> PublishResult<()>;

    /// Replace the full cron schedule list.
    async fn put_schedules(&self, address: &ScriptAddress, crons: &[String])
        -> PublishResult<()>;
}

#[derive(Debug, Clone)]
pub struct CloudflareClient {
    client: reqwest::Client,
    api_token: String,
    base_url: String,
}

fn summarize_cloudflare_messages(
    errors: Option<&[CloudflareApiMessage]>,
    messages: Option<&[CloudflareApiMessage]>,
) -> String {
    let mut parts = Vec::new();
    for msg in errors.into_iter().chain(messages).flatten() {
        if let Some(code) = msg.code {
            parts.push(format!("{} ({})", msg.message, code));
        } else {
            parts.push(msg.message.clone());
        }
    }
    if parts.is_empty() {
        "Unknown Cloudflare API error".to_string()
    } else {
        parts.join("; ")
    }
}

fn decode_list_from_value<T: DeserializeOwned>(
    value: Value,
    keys: &[&str],
) -> PublishResult<Vec<T>> {
    if value.is_array() {
        return Ok(serde_json::from_value(value)?);
    }

    if let Some(object) = value.as_object() {
        for key in keys {
            if let Some(candidate) = object.get(*key) {
                if candidate.is_array() {
                    return Ok(serde_json::from_value(candidate.clone())?);
                }
            }
        }
    }

    Err(PublishError::UnexpectedResponse(format!(
        "Cloudflare API list shape is unexpected: {}",
        value
    )))
}

async fn parse_cloudflare_response<T: DeserializeOwned + Default>(
    response: reqwest::Response,
    context: &str,
) -> PublishResult<(T, Option<Value>)> {
    let status = response.status();
    let body = response.text().await?;

    if !status.is_success() {
        let message = match serde_json::from_str::<CloudflareApiResponse<Value>>(&body) {
            Ok(envelope) => summarize_cloudflare_messages(
                envelope.errors.as_deref(),
                envelope.messages.as_deref(),
            ),
            Err(_) => body,
        };
        return Err(PublishError::Remote {
            context: context.to_string(),
            status,
            message,
        });
    }

    let envelope: CloudflareApiResponse<T> =
        serde_json::from_str(&body).map_err(|e| PublishError::Remote {
            context: context.to_string(),
            status,
            message: format!("unexpected response: {} (body: {})", e, body),
        })?;

    if !envelope.success {
        return Err(PublishError::Remote {
            context: context.to_string(),
            status,
            message: summarize_cloudflare_messages(
                envelope.errors.as_deref(),
                envelope.messages.as_deref(),
            ),
        });
    }

    Ok((envelope.result.unwrap_or_default(), envelope.result_info))
}

impl CloudflareClient {
    pub fn new(api_token: impl Into<String>) -> Self {
        Self::with_base_url(api_token, CLOUDFLARE_API_BASE)
    }

    pub fn with_base_url(api_token: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_token: api_token.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub(crate) async fn get<T: DeserializeOwned + Default>(
        &self,
        path: &str,
        query: &[(&str, &str)],
        context: &str,
    ) -> PublishResult<(T, Option<Value>)> {
        let url = self.url(path);
        debug!("GET {}", url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_token)
            .query(query)
            .send()
            .await?;
        parse_cloudflare_response(response, context).await
    }

    pub(crate) async fn send_json<T: DeserializeOwned + Default, B: Serialize + ?Sized>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: &B,
        context: &str,
    ) -> PublishResult<T> {
        let url = self.url(path);
        debug!("{} {}", method, url);
        let response = self
            .client
            .request(method, &url)
            .bearer_auth(&self.api_token)
            .json(body)
            .send()
            .await?;
        let (result, _) = parse_cloudflare_response(response, context).await?;
        Ok(result)
    }

    fn upload_form(unit: &DeployableUnit) -> PublishResult<multipart::Form> {
        let metadata_part =
            multipart::Part::text(unit.metadata().to_string()).mime_str("application/json")?;
        let mut form = multipart::Form::new().part("metadata", metadata_part);

        for part in unit.upload_parts() {
            let file = multipart::Part::bytes(part.content)
                .file_name(part.filename)
                .mime_str(part.content_type)?;
            form = form.part(part.name, file);
        }

        Ok(form)
    }
}

#[async_trait]
impl WorkersApi for CloudflareClient {
    async fn list_scripts(&self, account_id: &str) -> PublishResult<Vec<ScriptSummary>> {
        let path = format!("/accounts/{}/workers/scripts", account_id);
        let (result, _): (Value, _) = self.get(&path, &[], "List workers scripts").await?;
        decode_list_from_value(result, &["scripts", "items"])
    }

    async fn upload_script(
        &self,
        address: &ScriptAddress,
        unit: &DeployableUnit,
    ) -> PublishResult<UploadResult> {
        let url = self.url(&address.path());
        let context = format!("Upload script {}", address.name);
        debug!("PUT {}", url);
        let response = self
            .client
            .put(&url)
            .bearer_auth(&self.api_token)
            .query(&[("available_on_subdomain", "true")])
            .multipart(Self::upload_form(unit)?)
            .send()
            .await?;
        let (result, _) = parse_cloudflare_response(response, &context).await?;
        Ok(result)
    }

    async fn enable_subdomain(&self, address: &ScriptAddress) -> PublishResult<()> {
        let _: Value = self
            .send_json(
                reqwest::Method::POST,
                &format!("{}/subdomain", address.path()),
                &json!({ "enabled": true }),
                &format!("Enable workers.dev for {}", address.name),
            )
            .await?;
        Ok(())
    }

    async fn account_subdomain(&self, account_id: &str) -> PublishResult<String> {
        let path = format!("/accounts/{}/workers/subdomain", account_id);
        let (result, _): (Value, _) = self.get(&path, &[], "Get workers subdomain").await?;
        result
            .get("subdomain")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                PublishError::Configuration(
                    "No workers.dev subdomain is registered for this account".to_string(),
                )
            })
    }

    async fn put_routes(&self, address: &ScriptAddress, routes: &[String]) -> PublishResult<()> {
        let body: Vec<RoutePattern> = routes
            .iter()
            .map(|pattern| RoutePattern { pattern })
            .collect();
        let _: Value = self
            .send_json(
                reqwest::Method::PUT,
                &format!("{}/routes", address.path()),
                &body,
                &format!("Update routes for {}", address.name),
            )
            .await?;
        Ok(())
    }

    async fn put_schedules(
        &self,
        address: &ScriptAddress,
        crons: &[String],
    ) -> PublishResult<()> {
        let body: Vec<CronSchedule> = crons.iter().map(|cron| CronSchedule { cron }).collect();
        let _: Value = self
            .send_json(
                reqwest::Method::PUT,
                &format!("{}/schedules", address.path()),
                &body,
                &format!("Update schedules for {}", address.name),
            )
            .await?;
        Ok(())
    }
}

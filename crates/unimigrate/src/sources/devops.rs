//! DevOps work-item API source adapter (personal-token protected).
//!
//! "Tables" are logical modules over the DevOps REST API: `projects`,
//! `teams`, `work_items`, and `work_item_revisions`. Work items are
//! enumerated with a WIQL id query and fetched in id batches; revisions
//! stream through the reporting feed's continuation tokens.
//!
//! Schemas are dynamic: `get_schema` unions the fields observed in a probe
//! batch, and later batches may widen the destination table.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::core::schema::{ColumnDef, TableDescriptor};
use crate::core::traits::{BatchStream, SourceAdapter, STREAM_CHANNEL_CAPACITY};
use crate::core::value::{Batch, Record, Value};
use crate::error::{AdapterError, Result};
use crate::sources::{backoff_delay, MAX_REQUEST_RETRIES};

/// Work-item batch fetch endpoint caps ids per request.
const MAX_IDS_PER_FETCH: usize = 200;

const API_VERSION: &str = "7.0";

pub const MODULE_PROJECTS: &str = "projects";
pub const MODULE_TEAMS: &str = "teams";
pub const MODULE_WORK_ITEMS: &str = "work_items";
pub const MODULE_WORK_ITEM_REVISIONS: &str = "work_item_revisions";

#[derive(Debug, Clone, Deserialize)]
struct DevopsConfig {
    organization: String,
    access_token: String,
    #[serde(default = "default_base_url")]
    base_url: String,
}

fn default_base_url() -> String {
    "https://dev.azure.com".to_string()
}

impl DevopsConfig {
    fn org_url(&self, path: &str) -> String {
        format!("{}/{}/{}", self.base_url, self.organization, path)
    }
}

/// Source adapter for a DevOps-style work-item API.
#[derive(Default)]
pub struct DevopsSource {
    http: Option<reqwest::Client>,
    config: Option<DevopsConfig>,
}

impl DevopsSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn config(&self) -> Result<&DevopsConfig> {
        self.config
            .as_ref()
            .ok_or_else(|| AdapterError::Connection("not connected to DevOps API".to_string()))
    }

    fn http(&self) -> reqwest::Client {
        self.http.clone().unwrap_or_default()
    }
}

/// GET a JSON document with PAT auth and bounded retries on transient
/// failures. 401/403 are authentication errors, not retried.
async fn get_json(
    http: &reqwest::Client,
    config: &DevopsConfig,
    url: &str,
) -> Result<serde_json::Value> {
    let mut attempt = 0usize;
    loop {
        let result = http
            .get(url)
            .basic_auth("", Some(&config.access_token))
            .send()
            .await;
        match result {
            Ok(response) => {
                let status = response.status();
                if status == reqwest::StatusCode::UNAUTHORIZED
                    || status == reqwest::StatusCode::FORBIDDEN
                {
                    return Err(AdapterError::Auth(format!(
                        "access token rejected ({})",
                        status
                    )));
                }
                if status.is_success() {
                    return Ok(response.json().await?);
                }
                attempt += 1;
                if attempt >= MAX_REQUEST_RETRIES {
                    return Err(AdapterError::read(url, format!("request failed: {}", status)));
                }
                warn!(
                    "{}: {} (retry {}/{})",
                    url, status, attempt, MAX_REQUEST_RETRIES
                );
            }
            Err(e) => {
                attempt += 1;
                if attempt >= MAX_REQUEST_RETRIES {
                    return Err(e.into());
                }
                warn!("{}: {} (retry {}/{})", url, e, attempt, MAX_REQUEST_RETRIES);
            }
        }
        tokio::time::sleep(backoff_delay(attempt - 1)).await;
    }
}

/// POST a JSON body, same retry policy as [`get_json`].
async fn post_json(
    http: &reqwest::Client,
    config: &DevopsConfig,
    url: &str,
    body: &serde_json::Value,
) -> Result<serde_json::Value> {
    let mut attempt = 0usize;
    loop {
        let result = http
            .post(url)
            .basic_auth("", Some(&config.access_token))
            .json(body)
            .send()
            .await;
        match result {
            Ok(response) => {
                let status = response.status();
                if status == reqwest::StatusCode::UNAUTHORIZED
                    || status == reqwest::StatusCode::FORBIDDEN
                {
                    return Err(AdapterError::Auth(format!(
                        "access token rejected ({})",
                        status
                    )));
                }
                if status.is_success() {
                    return Ok(response.json().await?);
                }
                attempt += 1;
                if attempt >= MAX_REQUEST_RETRIES {
                    return Err(AdapterError::read(url, format!("request failed: {}", status)));
                }
            }
            Err(e) => {
                attempt += 1;
                if attempt >= MAX_REQUEST_RETRIES {
                    return Err(e.into());
                }
            }
        }
        tokio::time::sleep(backoff_delay(attempt - 1)).await;
    }
}

/// Flatten an API object into a record: scalar top-level fields plus every
/// key of a nested `fields` map (work items).
fn flatten_record(object: &serde_json::Value) -> Record {
    let mut record = Record::new();
    if let Some(map) = object.as_object() {
        for (key, value) in map {
            if key == "fields" {
                if let Some(fields) = value.as_object() {
                    for (field, field_value) in fields {
                        record.insert(field.clone(), Value::from_json(field_value.clone()));
                    }
                }
            } else if key == "_links" {
                // Hypermedia noise, not data.
                continue;
            } else {
                record.insert(key.clone(), Value::from_json(value.clone()));
            }
        }
    }
    record
}

fn infer_field_type(value: &Value) -> &'static str {
    match value {
        Value::I64(_) => "integer",
        Value::F64(_) => "double",
        Value::Bool(_) => "boolean",
        _ => "string",
    }
}

async fn list_project_names(http: &reqwest::Client, config: &DevopsConfig) -> Result<Vec<String>> {
    let url = config.org_url(&format!("_apis/projects?api-version={}", API_VERSION));
    let body = get_json(http, config, &url).await?;
    Ok(body["value"]
        .as_array()
        .map(|projects| {
            projects
                .iter()
                .filter_map(|p| p["name"].as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default())
}

/// Work item ids for one project, optionally filtered by change date.
async fn query_work_item_ids(
    http: &reqwest::Client,
    config: &DevopsConfig,
    project: &str,
    since: Option<DateTime<Utc>>,
) -> Result<Vec<i64>> {
    let url = format!(
        "{}/{}/{}/_apis/wit/wiql?api-version={}",
        config.base_url, config.organization, project, API_VERSION
    );
    let query = match since {
        Some(since) => format!(
            "Select [System.Id] From WorkItems Where [System.ChangedDate] > '{}'",
            since.format("%Y-%m-%d %H:%M:%S")
        ),
        None => "Select [System.Id] From WorkItems".to_string(),
    };
    let body = post_json(http, config, &url, &serde_json::json!({ "query": query })).await?;
    Ok(body["workItems"]
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item["id"].as_i64())
                .collect()
        })
        .unwrap_or_default())
}

async fn fetch_work_items(
    http: &reqwest::Client,
    config: &DevopsConfig,
    ids: &[i64],
) -> Result<Vec<Record>> {
    let id_list = ids
        .iter()
        .map(i64::to_string)
        .collect::<Vec<_>>()
        .join(",");
    let url = config.org_url(&format!(
        "_apis/wit/workitems?ids={}&$expand=fields&api-version={}",
        id_list, API_VERSION
    ));
    let body = get_json(http, config, &url).await?;
    Ok(body["value"]
        .as_array()
        .map(|items| items.iter().map(flatten_record).collect())
        .unwrap_or_default())
}

#[async_trait]
impl SourceAdapter for DevopsSource {
    async fn connect(&mut self, config: &serde_json::Value) -> Result<()> {
        if self.config.is_some() {
            return Ok(());
        }
        let config: DevopsConfig = serde_json::from_value(config.clone())
            .map_err(|e| AdapterError::Config(format!("invalid devops config: {}", e)))?;
        if config.organization.is_empty() || config.access_token.is_empty() {
            return Err(AdapterError::Config(
                "organization and access_token are required".to_string(),
            ));
        }
        let http = reqwest::Client::new();
        // Validate the token against the cheapest authenticated endpoint.
        let url = config.org_url(&format!("_apis/projects?api-version={}", API_VERSION));
        get_json(&http, &config, &url).await?;
        self.http = Some(http);
        self.config = Some(config);
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.config = None;
        self.http = None;
    }

    async fn test_connection(&self, config: &serde_json::Value) -> Result<()> {
        let config: DevopsConfig = serde_json::from_value(config.clone())
            .map_err(|e| AdapterError::Config(format!("invalid devops config: {}", e)))?;
        let http = reqwest::Client::new();
        let url = config.org_url(&format!("_apis/projects?api-version={}", API_VERSION));
        get_json(&http, &config, &url).await?;
        Ok(())
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        self.config()?;
        Ok(vec![
            MODULE_PROJECTS.to_string(),
            MODULE_TEAMS.to_string(),
            MODULE_WORK_ITEMS.to_string(),
            MODULE_WORK_ITEM_REVISIONS.to_string(),
        ])
    }

    async fn get_schema(&self, table: &str) -> Result<TableDescriptor> {
        let config = self.config()?.clone();
        let http = self.http();

        let probe: Vec<Record> = match table {
            MODULE_PROJECTS => {
                let url = config.org_url(&format!("_apis/projects?api-version={}", API_VERSION));
                let body = get_json(&http, &config, &url).await?;
                probe_records(&body, "value")
            }
            MODULE_TEAMS => {
                let url =
                    config.org_url(&format!("_apis/teams?api-version={}-preview.3", API_VERSION));
                let body = get_json(&http, &config, &url).await?;
                probe_records(&body, "value")
            }
            MODULE_WORK_ITEMS => {
                let mut records = Vec::new();
                for project in list_project_names(&http, &config).await? {
                    let ids = query_work_item_ids(&http, &config, &project, None).await?;
                    if let Some(chunk) = ids.chunks(5).next() {
                        records = fetch_work_items(&http, &config, chunk).await?;
                    }
                    if !records.is_empty() {
                        break;
                    }
                }
                records
            }
            MODULE_WORK_ITEM_REVISIONS => {
                let mut records = Vec::new();
                for project in list_project_names(&http, &config).await? {
                    let url = format!(
                        "{}/{}/{}/_apis/wit/reporting/workitemrevisions?$maxPageSize=5&api-version={}",
                        config.base_url, config.organization, project, API_VERSION
                    );
                    let body = get_json(&http, &config, &url).await?;
                    records = probe_records(&body, "values");
                    if !records.is_empty() {
                        break;
                    }
                }
                records
            }
            other => return Err(AdapterError::schema(other, "unknown module")),
        };

        let mut columns: Vec<ColumnDef> = Vec::new();
        let mut seen = std::collections::HashSet::new();
        // A stable id column always exists, even on an empty probe.
        seen.insert("id".to_string());
        columns.push(ColumnDef::new("id", "integer", true));
        for record in &probe {
            for (key, value) in record {
                if seen.insert(key.clone()) {
                    columns.push(ColumnDef::new(key.clone(), infer_field_type(value), true));
                }
            }
        }
        Ok(TableDescriptor::new(table, columns))
    }

    async fn get_primary_key(&self, _table: &str) -> Result<Vec<String>> {
        Ok(vec!["id".to_string()])
    }

    async fn read_data(&self, table: &str, batch_size: usize) -> Result<BatchStream> {
        self.stream_module(table, batch_size, None)
    }

    async fn read_incremental(
        &self,
        table: &str,
        since: DateTime<Utc>,
        batch_size: usize,
    ) -> Result<BatchStream> {
        self.stream_module(table, batch_size, Some(since))
    }

    fn source_key(&self) -> &'static str {
        "devops"
    }

    fn is_api_source(&self) -> bool {
        true
    }
}

fn probe_records(body: &serde_json::Value, key: &str) -> Vec<Record> {
    body[key]
        .as_array()
        .map(|items| items.iter().take(5).map(flatten_record).collect())
        .unwrap_or_default()
}

impl DevopsSource {
    fn stream_module(
        &self,
        table: &str,
        batch_size: usize,
        since: Option<DateTime<Utc>>,
    ) -> Result<BatchStream> {
        let config = self.config()?.clone();
        let http = self.http();
        let table = table.to_string();
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            let result = match table.as_str() {
                MODULE_PROJECTS => {
                    stream_flat_list(
                        &http,
                        &config,
                        &config.org_url(&format!("_apis/projects?api-version={}", API_VERSION)),
                        "value",
                        batch_size,
                        &tx,
                    )
                    .await
                }
                MODULE_TEAMS => {
                    stream_flat_list(
                        &http,
                        &config,
                        &config
                            .org_url(&format!("_apis/teams?api-version={}-preview.3", API_VERSION)),
                        "value",
                        batch_size,
                        &tx,
                    )
                    .await
                }
                MODULE_WORK_ITEMS => stream_work_items(&http, &config, batch_size, since, &tx).await,
                MODULE_WORK_ITEM_REVISIONS => {
                    stream_revisions(&http, &config, batch_size, since, &tx).await
                }
                other => Err(AdapterError::read(other, "unknown module")),
            };
            if let Err(e) = result {
                let _ = tx.send(Err(e)).await;
            }
        });
        Ok(rx)
    }
}

async fn stream_flat_list(
    http: &reqwest::Client,
    config: &DevopsConfig,
    url: &str,
    key: &str,
    batch_size: usize,
    tx: &mpsc::Sender<Result<Batch>>,
) -> Result<()> {
    let body = get_json(http, config, url).await?;
    let records: Vec<Record> = body[key]
        .as_array()
        .map(|items| items.iter().map(flatten_record).collect())
        .unwrap_or_default();
    for chunk in records.chunks(batch_size.max(1)) {
        if tx.send(Ok(Batch::new(chunk.to_vec()))).await.is_err() {
            return Ok(());
        }
    }
    Ok(())
}

async fn stream_work_items(
    http: &reqwest::Client,
    config: &DevopsConfig,
    batch_size: usize,
    since: Option<DateTime<Utc>>,
    tx: &mpsc::Sender<Result<Batch>>,
) -> Result<()> {
    let chunk_size = batch_size.clamp(1, MAX_IDS_PER_FETCH);
    for project in list_project_names(http, config).await? {
        let ids = query_work_item_ids(http, config, &project, since).await?;
        info!("Project {}: {} work items", project, ids.len());
        for chunk in ids.chunks(chunk_size) {
            let records = fetch_work_items(http, config, chunk).await?;
            if tx.send(Ok(Batch::new(records))).await.is_err() {
                return Ok(());
            }
        }
    }
    Ok(())
}

async fn stream_revisions(
    http: &reqwest::Client,
    config: &DevopsConfig,
    batch_size: usize,
    since: Option<DateTime<Utc>>,
    tx: &mpsc::Sender<Result<Batch>>,
) -> Result<()> {
    for project in list_project_names(http, config).await? {
        let mut continuation: Option<String> = None;
        loop {
            let mut url = format!(
                "{}/{}/{}/_apis/wit/reporting/workitemrevisions?api-version={}",
                config.base_url, config.organization, project, API_VERSION
            );
            if let Some(token) = &continuation {
                url.push_str(&format!("&continuationToken={}", token));
            }
            if let Some(since) = since {
                url.push_str(&format!(
                    "&startDateTime={}",
                    since.format("%Y-%m-%dT%H:%M:%SZ")
                ));
            }
            let body = get_json(http, config, &url).await?;
            let records: Vec<Record> = body["values"]
                .as_array()
                .map(|items| items.iter().map(flatten_record).collect())
                .unwrap_or_default();
            for chunk in records.chunks(batch_size.max(1)) {
                if tx.send(Ok(Batch::new(chunk.to_vec()))).await.is_err() {
                    return Ok(());
                }
            }
            let is_last = body["isLastBatch"].as_bool().unwrap_or(true);
            if is_last {
                break;
            }
            continuation = body["continuationToken"]
                .as_str()
                .map(str::to_string)
                .or_else(|| body["continuationToken"].as_i64().map(|t| t.to_string()));
            if continuation.is_none() {
                break;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flatten_record_lifts_fields() {
        let object = serde_json::json!({
            "id": 42,
            "rev": 3,
            "fields": {
                "System.Title": "Fix login",
                "System.State": "Active",
                "Microsoft.VSTS.Common.Priority": 2
            },
            "_links": {"self": {"href": "http://x"}}
        });
        let record = flatten_record(&object);
        assert_eq!(record.get("id"), Some(&Value::I64(42)));
        assert_eq!(
            record.get("System.Title"),
            Some(&Value::Text("Fix login".into()))
        );
        assert_eq!(
            record.get("Microsoft.VSTS.Common.Priority"),
            Some(&Value::I64(2))
        );
        assert!(!record.contains_key("_links"));
        assert!(!record.contains_key("fields"));
    }

    #[test]
    fn test_infer_field_type() {
        assert_eq!(infer_field_type(&Value::I64(1)), "integer");
        assert_eq!(infer_field_type(&Value::Bool(true)), "boolean");
        assert_eq!(infer_field_type(&Value::Text("x".into())), "string");
        assert_eq!(infer_field_type(&Value::Null), "string");
    }

    #[test]
    fn test_org_url() {
        let config = DevopsConfig {
            organization: "acme".into(),
            access_token: "pat".into(),
            base_url: "https://dev.azure.com".into(),
        };
        assert_eq!(
            config.org_url("_apis/projects?api-version=7.0"),
            "https://dev.azure.com/acme/_apis/projects?api-version=7.0"
        );
    }
}

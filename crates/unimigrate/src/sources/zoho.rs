//! SaaS CRM API source adapter (Zoho-style, OAuth refresh-token protected).
//!
//! "Tables" are CRM modules. Schemas are dynamic per tenant: `get_schema`
//! returns the union of declared fields and fields observed in a probe
//! page; later pages may still introduce new fields, which the pipeline
//! handles by evolving the destination table.
//!
//! Access tokens are short-lived. A 401 mid-page triggers a refresh-token
//! exchange and the page is retried, so the visible batch stream is
//! uninterrupted. Transient failures are retried with bounded exponential
//! backoff.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::core::schema::{ColumnDef, TableDescriptor};
use crate::core::traits::{BatchStream, SourceAdapter, STREAM_CHANNEL_CAPACITY};
use crate::core::value::{Batch, Record, Value};
use crate::error::{AdapterError, Result};
use crate::sources::{backoff_delay, MAX_REQUEST_RETRIES};

#[derive(Debug, Clone, Deserialize)]
struct ZohoConfig {
    refresh_token: String,
    client_id: String,
    client_secret: String,
    #[serde(default = "default_api_domain")]
    api_domain: String,
}

fn default_api_domain() -> String {
    "https://www.zohoapis.in".to_string()
}

impl ZohoConfig {
    /// The OAuth accounts host for this data-center region.
    fn accounts_domain(&self) -> String {
        self.api_domain.replace("www.zohoapis", "accounts.zoho")
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    api_domain: Option<String>,
    #[serde(default)]
    expires_in: u64,
}

#[derive(Clone)]
struct ZohoSession {
    config: ZohoConfig,
    token: String,
    api_domain: String,
}

/// Source adapter for a Zoho-style CRM API.
#[derive(Default)]
pub struct ZohoSource {
    http: Option<reqwest::Client>,
    session: Option<ZohoSession>,
}

impl ZohoSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn session(&self) -> Result<&ZohoSession> {
        self.session
            .as_ref()
            .ok_or_else(|| AdapterError::Connection("not connected to Zoho API".to_string()))
    }

    fn http(&self) -> reqwest::Client {
        self.http.clone().unwrap_or_default()
    }
}

async fn exchange_refresh_token(
    http: &reqwest::Client,
    config: &ZohoConfig,
) -> Result<(String, String)> {
    let url = format!("{}/oauth/v2/token", config.accounts_domain());
    debug!("Requesting access token from {}", url);
    let response = http
        .post(&url)
        .form(&[
            ("refresh_token", config.refresh_token.as_str()),
            ("client_id", config.client_id.as_str()),
            ("client_secret", config.client_secret.as_str()),
            ("grant_type", "refresh_token"),
        ])
        .send()
        .await
        .map_err(|e| AdapterError::Auth(format!("token request failed: {}", e)))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(AdapterError::Auth(format!(
            "token exchange failed: {} - {}",
            status,
            truncate(&body, 200)
        )));
    }

    let token: TokenResponse = response
        .json()
        .await
        .map_err(|e| AdapterError::Auth(format!("malformed token response: {}", e)))?;
    let access_token = token
        .access_token
        .ok_or_else(|| AdapterError::Auth("no access token in response".to_string()))?;
    info!("Access token obtained (expires in {}s)", token.expires_in);
    let api_domain = token.api_domain.unwrap_or_else(|| config.api_domain.clone());
    Ok((access_token, api_domain))
}

fn truncate(s: &str, max: usize) -> &str {
    &s[..s.len().min(max)]
}

fn auth_header(token: &str) -> String {
    format!("Zoho-oauthtoken {}", token)
}

#[async_trait]
impl SourceAdapter for ZohoSource {
    async fn connect(&mut self, config: &serde_json::Value) -> Result<()> {
        if self.session.is_some() {
            return Ok(());
        }
        let config: ZohoConfig = serde_json::from_value(config.clone())
            .map_err(|e| AdapterError::Config(format!("invalid zoho config: {}", e)))?;
        let http = reqwest::Client::new();
        let (token, api_domain) = exchange_refresh_token(&http, &config).await?;
        self.session = Some(ZohoSession {
            config,
            token,
            api_domain,
        });
        self.http = Some(http);
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.session = None;
        self.http = None;
    }

    async fn test_connection(&self, config: &serde_json::Value) -> Result<()> {
        let config: ZohoConfig = serde_json::from_value(config.clone())
            .map_err(|e| AdapterError::Config(format!("invalid zoho config: {}", e)))?;
        let http = reqwest::Client::new();
        exchange_refresh_token(&http, &config).await?;
        Ok(())
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        let session = self.session()?;
        let url = format!("{}/crm/v2/settings/modules", session.api_domain);

        #[derive(Deserialize)]
        struct Modules {
            #[serde(default)]
            modules: Vec<Module>,
        }
        #[derive(Deserialize)]
        struct Module {
            api_name: String,
            #[serde(default)]
            api_supported: bool,
        }

        let response = self
            .http()
            .get(&url)
            .header("Authorization", auth_header(&session.token))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(AdapterError::read(
                "modules",
                format!("module list failed: {}", response.status()),
            ));
        }
        let modules: Modules = response.json().await?;
        Ok(modules
            .modules
            .into_iter()
            .filter(|m| m.api_supported)
            .map(|m| m.api_name)
            .collect())
    }

    async fn get_schema(&self, table: &str) -> Result<TableDescriptor> {
        let session = self.session()?;

        #[derive(Deserialize)]
        struct Fields {
            #[serde(default)]
            fields: Vec<Field>,
        }
        #[derive(Deserialize)]
        struct Field {
            api_name: String,
            #[serde(default)]
            data_type: String,
        }

        let mut columns: Vec<ColumnDef> = Vec::new();
        let mut seen = std::collections::HashSet::new();

        // Declared field metadata.
        let url = format!(
            "{}/crm/v2/settings/fields?module={}",
            session.api_domain, table
        );
        let response = self
            .http()
            .get(&url)
            .header("Authorization", auth_header(&session.token))
            .send()
            .await?;
        if response.status().is_success() {
            let fields: Fields = response.json().await?;
            for field in fields.fields {
                if seen.insert(field.api_name.clone()) {
                    columns.push(ColumnDef::new(
                        field.api_name,
                        zoho_field_type(&field.data_type),
                        true,
                    ));
                }
            }
        } else {
            debug!(
                "Field metadata unavailable for {} ({}), relying on probe page",
                table,
                response.status()
            );
        }

        // Probe one record: per-tenant custom fields show up here even when
        // the metadata endpoint omits them.
        let url = format!(
            "{}/crm/v2/{}?page=1&per_page=1",
            session.api_domain, table
        );
        let response = self
            .http()
            .get(&url)
            .header("Authorization", auth_header(&session.token))
            .send()
            .await?;
        if response.status().is_success() {
            #[derive(Deserialize)]
            struct Page {
                #[serde(default)]
                data: Vec<serde_json::Map<String, serde_json::Value>>,
            }
            let page: Page = response.json().await?;
            for record in page.data {
                for key in record.keys() {
                    if seen.insert(key.clone()) {
                        columns.push(ColumnDef::new(key.clone(), "string", true));
                    }
                }
            }
        }

        if columns.is_empty() {
            return Err(AdapterError::schema(table, "no fields discovered"));
        }
        Ok(TableDescriptor::new(table, columns))
    }

    async fn get_primary_key(&self, _table: &str) -> Result<Vec<String>> {
        // Every CRM record carries a stable `id`.
        Ok(vec!["id".to_string()])
    }

    async fn read_data(&self, table: &str, batch_size: usize) -> Result<BatchStream> {
        self.stream_pages(table, batch_size, None)
    }

    async fn read_incremental(
        &self,
        table: &str,
        since: DateTime<Utc>,
        batch_size: usize,
    ) -> Result<BatchStream> {
        self.stream_pages(table, batch_size, Some(since))
    }

    fn source_key(&self) -> &'static str {
        "zoho"
    }

    fn is_api_source(&self) -> bool {
        true
    }
}

enum PageFetch {
    NoContent,
    Unauthorized,
    Data { records: Vec<Record>, more: bool },
    Failed(String),
}

impl ZohoSource {
    fn stream_pages(
        &self,
        table: &str,
        batch_size: usize,
        since: Option<DateTime<Utc>>,
    ) -> Result<BatchStream> {
        let mut session = self.session()?.clone();
        let http = self.http();
        let table = table.to_string();
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            let mut page = 1usize;
            loop {
                let mut attempt = 0usize;
                let outcome = loop {
                    match fetch_page(&http, &session, &table, page, batch_size, since).await {
                        Ok(PageFetch::Unauthorized) => {
                            warn!("Token expired for {}, refreshing", table);
                            match exchange_refresh_token(&http, &session.config).await {
                                Ok((token, api_domain)) => {
                                    session.token = token;
                                    session.api_domain = api_domain;
                                }
                                Err(e) => break Err(e),
                            }
                            attempt += 1;
                            if attempt >= MAX_REQUEST_RETRIES {
                                break Err(AdapterError::Auth(format!(
                                    "{}: token refresh did not restore access",
                                    table
                                )));
                            }
                        }
                        Ok(PageFetch::Failed(message)) => {
                            attempt += 1;
                            if attempt >= MAX_REQUEST_RETRIES {
                                break Err(AdapterError::read(&table, message));
                            }
                            warn!(
                                "{} page {}: {} (retry {}/{})",
                                table, page, message, attempt, MAX_REQUEST_RETRIES
                            );
                            tokio::time::sleep(backoff_delay(attempt - 1)).await;
                        }
                        Ok(other) => break Ok(other),
                        Err(e) => {
                            // Transport-level failure: same bounded retry.
                            attempt += 1;
                            if attempt >= MAX_REQUEST_RETRIES {
                                break Err(e);
                            }
                            warn!(
                                "{} page {}: {} (retry {}/{})",
                                table, page, e, attempt, MAX_REQUEST_RETRIES
                            );
                            tokio::time::sleep(backoff_delay(attempt - 1)).await;
                        }
                    }
                };

                match outcome {
                    Ok(PageFetch::NoContent) => {
                        info!("Completed fetching all records for {}", table);
                        return;
                    }
                    Ok(PageFetch::Data { records, more }) => {
                        if records.is_empty() {
                            return;
                        }
                        if tx.send(Ok(Batch::new(records))).await.is_err() {
                            return;
                        }
                        if !more {
                            info!("Completed fetching all records for {}", table);
                            return;
                        }
                        page += 1;
                    }
                    Ok(_) => unreachable!("handled in retry loop"),
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                }
            }
        });
        Ok(rx)
    }
}

async fn fetch_page(
    http: &reqwest::Client,
    session: &ZohoSession,
    table: &str,
    page: usize,
    per_page: usize,
    since: Option<DateTime<Utc>>,
) -> Result<PageFetch> {
    let url = format!("{}/crm/v2/{}", session.api_domain, table);
    let mut request = http
        .get(&url)
        .query(&[("page", page.to_string()), ("per_page", per_page.to_string())])
        .header("Authorization", auth_header(&session.token));
    if let Some(since) = since {
        // Server-side incremental filter: only records modified after the
        // watermark are returned.
        request = request.header("If-Modified-Since", since.to_rfc3339());
    }

    let response = request.send().await?;
    let status = response.status();

    if status == reqwest::StatusCode::NO_CONTENT || status == reqwest::StatusCode::NOT_MODIFIED {
        return Ok(PageFetch::NoContent);
    }
    if status == reqwest::StatusCode::UNAUTHORIZED {
        return Ok(PageFetch::Unauthorized);
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Ok(PageFetch::Failed(format!(
            "fetch failed: {} - {}",
            status,
            truncate(&body, 200)
        )));
    }

    #[derive(Deserialize)]
    struct Page {
        #[serde(default)]
        data: Vec<serde_json::Map<String, serde_json::Value>>,
        #[serde(default)]
        info: PageInfo,
    }
    #[derive(Deserialize, Default)]
    struct PageInfo {
        #[serde(default)]
        more_records: bool,
    }

    let page_body: Page = response.json().await?;
    let records = page_body
        .data
        .into_iter()
        .map(|record| {
            record
                .into_iter()
                .map(|(key, value)| (key, Value::from_json(value)))
                .collect::<Record>()
        })
        .collect();
    Ok(PageFetch::Data {
        records,
        more: page_body.info.more_records,
    })
}

fn zoho_field_type(data_type: &str) -> &'static str {
    match data_type {
        "integer" | "bigint" => "integer",
        "double" | "currency" | "decimal" => "double",
        "boolean" => "boolean",
        "datetime" => "datetime",
        "date" => "date",
        _ => "string",
    }
}

//! Cloud REST client.
//!
//! Thin authenticated wrapper over the backend's PostgREST-style API:
//! row inserts with duplicate-ignoring semantics, PATCH updates with
//! column filters, and GET polls. All operations carry finite timeouts;
//! retry policy belongs to the callers (sync engine, heartbeat) because
//! the backoff series differs per operation.

use std::time::Duration;

use reqwest::StatusCode;
use serde_json::Value;
use tracing::debug;

use crate::errors::{ControllerError, Result};

const INSERT_TIMEOUT: Duration = Duration::from_secs(30);
const QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome of an insert attempt. A 409 means every row already existed —
/// duplicate suppression is a guarantee, not a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
}

#[derive(Clone)]
pub struct CloudClient {
    base_url: String,
    api_key: String,
    http: reqwest::Client,
}

impl CloudClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            http: reqwest::Client::new(),
        }
    }

    /// Build a client from `SUPABASE_URL` / `SUPABASE_SERVICE_KEY`;
    /// `None` when the site runs without cloud credentials.
    pub fn from_env() -> Option<Self> {
        let url = std::env::var("SUPABASE_URL").ok()?;
        let key = std::env::var("SUPABASE_SERVICE_KEY").ok()?;
        if url.is_empty() || key.is_empty() {
            return None;
        }
        Some(Self::new(url, key))
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url.trim_end_matches('/'), table)
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.api_key))
    }

    /// Insert rows with `Prefer: resolution=ignore-duplicates` and an
    /// explicit natural-key hint. One attempt; callers own retries.
    pub async fn insert_rows(
        &self,
        table: &str,
        rows: &Value,
        on_conflict: Option<&str>,
    ) -> Result<InsertOutcome> {
        let mut url = self.table_url(table);
        if let Some(cols) = on_conflict {
            url.push_str(&format!("?on_conflict={cols}"));
        }

        let response = self
            .authed(self.http.post(&url))
            .header("Content-Type", "application/json")
            .header("Prefer", "resolution=ignore-duplicates,return=minimal")
            .json(rows)
            .timeout(INSERT_TIMEOUT)
            .send()
            .await?;

        match response.status() {
            s if s.is_success() => Ok(InsertOutcome::Inserted),
            StatusCode::CONFLICT => {
                debug!(table, "409 on insert, duplicates ignored");
                Ok(InsertOutcome::Duplicate)
            }
            s => {
                let body = response.text().await.unwrap_or_default();
                Err(ControllerError::Sync(format!(
                    "insert into {table} failed: HTTP {s}: {body}"
                )))
            }
        }
    }

    /// PATCH rows matching PostgREST filters (`("resolved", "eq.false")`).
    pub async fn patch_rows(
        &self,
        table: &str,
        filters: &[(&str, String)],
        body: &Value,
    ) -> Result<()> {
        let response = self
            .authed(self.http.patch(self.table_url(table)))
            .query(filters)
            .header("Content-Type", "application/json")
            .header("Prefer", "return=minimal")
            .json(body)
            .timeout(QUERY_TIMEOUT)
            .send()
            .await?;

        if response.status().is_success() {
            Ok(())
        } else {
            let status = response.status();
            Err(ControllerError::Sync(format!(
                "patch {table} failed: HTTP {status}"
            )))
        }
    }

    /// GET rows matching PostgREST filters.
    pub async fn get_rows(&self, table: &str, filters: &[(&str, String)]) -> Result<Vec<Value>> {
        let response = self
            .authed(self.http.get(self.table_url(table)))
            .query(filters)
            .timeout(QUERY_TIMEOUT)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(ControllerError::Sync(format!(
                "get {table} failed: HTTP {status}"
            )));
        }

        let rows: Vec<Value> = response.json().await?;
        Ok(rows)
    }

    /// POST a single document without duplicate handling (heartbeats,
    /// immediate alarms).
    pub async fn post_row(&self, table: &str, row: &Value) -> Result<()> {
        let response = self
            .authed(self.http.post(self.table_url(table)))
            .header("Content-Type", "application/json")
            .header("Prefer", "return=minimal")
            .json(row)
            .timeout(QUERY_TIMEOUT)
            .send()
            .await?;

        if response.status().is_success() {
            Ok(())
        } else {
            let status = response.status();
            Err(ControllerError::Sync(format!(
                "post to {table} failed: HTTP {status}"
            )))
        }
    }

    /// Download a file (OTA packages) into memory.
    pub async fn download(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .authed(self.http.get(url))
            .timeout(Duration::from_secs(300))
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            return Err(ControllerError::Sync(format!(
                "download failed: HTTP {status}"
            )));
        }
        Ok(response.bytes().await?.to_vec())
    }
}

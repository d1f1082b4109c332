//! ClickHouse driver over the HTTP interface

use crate::adapter::{RawRow, SqlExecutor};
use crate::{Error, Result};
use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, instrument};

#[derive(Clone, Serialize, Deserialize)]
pub struct ClickHouseParams {
    /// HTTP endpoint, e.g. `http://localhost:8123`
    pub url: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    300
}

pub struct ClickHouseExecutor {
    http_client: HttpClient,
    params: ClickHouseParams,
}

impl ClickHouseExecutor {
    pub fn new(params: ClickHouseParams) -> Result<Self> {
        let http_client = HttpClient::builder()
            .timeout(Duration::from_secs(params.timeout_secs))
            .build()
            .map_err(|e| Error::Connection(e.to_string()))?;
        Ok(Self {
            http_client,
            params,
        })
    }
}

/// `JSONEachRow` output: one JSON object per line.
fn parse_json_each_row(body: &str) -> Result<Vec<RawRow>> {
    body.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str::<RawRow>(line)
                .map_err(|e| Error::Serialization(format!("bad JSONEachRow line: {}", e)))
        })
        .collect()
}

#[async_trait]
impl SqlExecutor for ClickHouseExecutor {
    #[instrument(skip_all, err)]
    async fn execute(&self, sql: &str) -> Result<Vec<RawRow>> {
        let url = self.params.url.trim_end_matches('/');
        let body = format!("{}\nFORMAT JSONEachRow", sql);

        let mut request = self.http_client.post(url).body(body);
        if let Some(database) = &self.params.database {
            request = request.query(&[("database", database)]);
        }
        if let Some(user) = &self.params.user {
            request = request.header("X-ClickHouse-User", user);
        }
        if let Some(password) = &self.params.password {
            request = request.header("X-ClickHouse-Key", password);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if status.is_success() {
            let rows = parse_json_each_row(&text)?;
            debug!(rows = rows.len(), "ClickHouse query returned");
            return Ok(rows);
        }

        match status.as_u16() {
            401 | 403 => Err(Error::Connection(format!("HTTP {}: {}", status, text.trim()))),
            502..=504 => Err(Error::Connection(format!("HTTP {}: {}", status, text.trim()))),
            _ => Err(Error::QuerySyntax(format!("HTTP {}: {}", status, text.trim()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_json_each_row() {
        let body = "{\"users\":\"10\",\"variation\":\"0\"}\n\n{\"users\":\"4\",\"variation\":\"1\"}\n";
        let rows = parse_json_each_row(body).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1]["users"], "4");
    }

    #[test]
    fn test_parse_json_each_row_rejects_garbage() {
        assert!(parse_json_each_row("Code: 62. DB::Exception").is_err());
    }
}

//! Batch data sources for scheduled jobs.

use std::{collections::HashMap, fmt::Debug, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_core::models::{DataSourceConfig, RouteId, TenantId};
use serde_json::Value;
use sqlx::PgPool;
use tracing::debug;

use crate::{
    client::to_method,
    error::{DeliveryError, Result},
};

/// Default bound on a single fetch.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Values available to `{{placeholder}}` substitution.
#[derive(Debug, Clone)]
pub struct TemplateVars {
    /// Owning tenant of the job.
    pub tenant_id: TenantId,
    /// Scheduled route.
    pub route_id: RouteId,
    /// Run start.
    pub now: DateTime<Utc>,
    /// Previous run, if any.
    pub last_run: Option<DateTime<Utc>>,
}

impl TemplateVars {
    /// Replaces every known placeholder in `input`. Unknown placeholders are
    /// left as they are.
    pub fn substitute(&self, input: &str) -> String {
        if !input.contains("{{") {
            return input.to_string();
        }
        let today = self.now.date_naive();
        let yesterday = today.pred_opt().unwrap_or(today);
        let last_run = self.last_run.map(|t| t.to_rfc3339()).unwrap_or_default();

        input
            .replace("{{tenant_id}}", &self.tenant_id.to_string())
            .replace("{{route_id}}", &self.route_id.to_string())
            .replace("{{now}}", &self.now.to_rfc3339())
            .replace("{{today}}", &today.format("%Y-%m-%d").to_string())
            .replace("{{yesterday}}", &yesterday.format("%Y-%m-%d").to_string())
            .replace("{{last_run}}", &last_run)
    }

    /// Substitutes every string inside a JSON value.
    pub fn substitute_json(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => Value::String(self.substitute(s)),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.substitute_json(v)).collect()),
            Value::Object(map) => Value::Object(
                map.iter().map(|(k, v)| (k.clone(), self.substitute_json(v))).collect(),
            ),
            other => other.clone(),
        }
    }

    fn substitute_map(&self, map: &HashMap<String, String>) -> HashMap<String, String> {
        map.iter().map(|(k, v)| (k.clone(), self.substitute(v))).collect()
    }
}

/// Pulls the rows a scheduled job delivers.
#[async_trait]
pub trait BatchDataSource: Send + Sync + Debug {
    /// Fetches rows for one run.
    async fn fetch(&self, config: &DataSourceConfig, vars: &TemplateVars) -> Result<Vec<Value>>;
}

/// Default data source: read-only SQL against the shared pool, internal
/// HTTP calls and static rows, each bounded by a timeout.
#[derive(Debug, Clone)]
pub struct SourceFetcher {
    pool: Option<Arc<PgPool>>,
    http: reqwest::Client,
    timeout: Duration,
}

impl SourceFetcher {
    /// Creates a fetcher. Without a pool, query sources fail with a
    /// configuration error.
    pub fn new(pool: Option<Arc<PgPool>>, http: reqwest::Client, timeout: Duration) -> Self {
        Self { pool, http, timeout }
    }

    async fn query(&self, sql: &str, params: &[String]) -> Result<Vec<Value>> {
        let Some(pool) = &self.pool else {
            return Err(DeliveryError::configuration("query data source requires a database"));
        };

        let wrapped = format!("SELECT row_to_json(source_rows)::jsonb FROM ({sql}) AS source_rows");
        let mut tx = pool.begin().await.map_err(|e| DeliveryError::fetch(e.to_string()))?;
        sqlx::query("SET TRANSACTION READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(|e| DeliveryError::fetch(e.to_string()))?;

        let mut query = sqlx::query_scalar::<_, Value>(&wrapped);
        for param in params {
            query = query.bind(param);
        }
        let rows = query.fetch_all(&mut *tx).await.map_err(|e| DeliveryError::fetch(e.to_string()))?;

        tx.rollback().await.map_err(|e| DeliveryError::fetch(e.to_string()))?;
        Ok(rows)
    }

    async fn call(
        &self,
        url: &str,
        method: courier_core::models::HttpMethod,
        headers: &HashMap<String, String>,
        body: Option<&Value>,
    ) -> Result<Vec<Value>> {
        let mut request = self.http.request(to_method(method), url);
        for (name, value) in headers {
            request = request.header(name, value);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| DeliveryError::fetch(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(DeliveryError::fetch(format!("data source returned HTTP {status}")));
        }

        let value: Value =
            response.json().await.map_err(|e| DeliveryError::fetch(format!("invalid JSON: {e}")))?;
        Ok(rows_from(value))
    }
}

/// Arrays become one row per element; anything else is a single row.
fn rows_from(value: Value) -> Vec<Value> {
    match value {
        Value::Array(rows) => rows,
        Value::Null => Vec::new(),
        other => vec![other],
    }
}

#[async_trait]
impl BatchDataSource for SourceFetcher {
    async fn fetch(&self, config: &DataSourceConfig, vars: &TemplateVars) -> Result<Vec<Value>> {
        let fetch = async {
            match config {
                DataSourceConfig::Query { sql, params } => {
                    let params: Vec<String> = params.iter().map(|p| vars.substitute(p)).collect();
                    self.query(sql, &params).await
                },
                DataSourceConfig::Http { url, method, headers, body } => {
                    let body = body.as_ref().map(|b| vars.substitute_json(b));
                    self.call(&vars.substitute(url), *method, &vars.substitute_map(headers), body.as_ref())
                        .await
                },
                DataSourceConfig::Static { rows } => {
                    Ok(rows.iter().map(|row| vars.substitute_json(row)).collect())
                },
            }
        };

        let rows = tokio::time::timeout(self.timeout, fetch).await.map_err(|_| {
            DeliveryError::fetch(format!("data source timed out after {:?}", self.timeout))
        })??;

        debug!(route_id = %vars.route_id, rows = rows.len(), "data source fetched");
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;
    use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

    use super::*;

    fn vars() -> TemplateVars {
        TemplateVars {
            tenant_id: TenantId::new(),
            route_id: RouteId::new(),
            now: Utc.with_ymd_and_hms(2024, 3, 1, 6, 30, 0).unwrap(),
            last_run: None,
        }
    }

    fn fetcher(timeout: Duration) -> SourceFetcher {
        SourceFetcher::new(None, reqwest::Client::new(), timeout)
    }

    #[test]
    fn substitutes_placeholders() {
        let vars = vars();

        let text = vars.substitute("t={{tenant_id}} d={{today}} y={{yesterday}} l={{last_run}} {{other}}");

        assert_eq!(
            text,
            format!("t={} d=2024-03-01 y=2024-02-29 l= {{{{other}}}}", vars.tenant_id)
        );
    }

    #[test]
    fn substitutes_nested_json() {
        let vars = vars();

        let body = vars.substitute_json(&json!({"filter": {"since": "{{today}}"}, "n": 3}));

        assert_eq!(body, json!({"filter": {"since": "2024-03-01"}, "n": 3}));
    }

    #[tokio::test]
    async fn static_rows_are_returned() {
        let config = DataSourceConfig::Static { rows: vec![json!({"route": "{{route_id}}"})] };
        let vars = vars();

        let rows = fetcher(DEFAULT_FETCH_TIMEOUT).fetch(&config, &vars).await.unwrap();

        assert_eq!(rows, vec![json!({"route": vars.route_id.to_string()})]);
    }

    #[tokio::test]
    async fn http_source_returns_array_rows() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("GET"))
            .and(matchers::path("/report"))
            .and(matchers::query_param("day", "2024-03-01"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"a": 1}, {"a": 2}])))
            .mount(&server)
            .await;

        let config = DataSourceConfig::Http {
            url: format!("{}/report?day={{{{today}}}}", server.uri()),
            method: courier_core::models::HttpMethod::Get,
            headers: HashMap::new(),
            body: None,
        };

        let rows = fetcher(DEFAULT_FETCH_TIMEOUT).fetch(&config, &vars()).await.unwrap();

        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn http_source_failures_are_fetch_errors() {
        let server = MockServer::start().await;
        Mock::given(matchers::path("/slow"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;
        Mock::given(matchers::path("/down"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let source = |path: &str| DataSourceConfig::Http {
            url: format!("{}{path}", server.uri()),
            method: courier_core::models::HttpMethod::Get,
            headers: HashMap::new(),
            body: None,
        };
        let fetcher = fetcher(Duration::from_millis(100));

        let timed_out = fetcher.fetch(&source("/slow"), &vars()).await.unwrap_err();
        assert!(matches!(timed_out, DeliveryError::FetchError { .. }));

        let down = fetcher.fetch(&source("/down"), &vars()).await.unwrap_err();
        assert!(matches!(down, DeliveryError::FetchError { .. }));
    }

    #[tokio::test]
    async fn query_without_pool_is_configuration_error() {
        let config = DataSourceConfig::Query { sql: "SELECT 1".into(), params: Vec::new() };

        let error = fetcher(DEFAULT_FETCH_TIMEOUT).fetch(&config, &vars()).await.unwrap_err();

        assert!(matches!(error, DeliveryError::ConfigurationError { .. }));
    }
}

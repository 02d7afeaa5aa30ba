//! Relationship index in Cloudflare D1, queried over the REST API.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use offload_core::{OffloadError, ProviderScope, Relationship, RelationshipExtra};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};

use super::{needles, PathLookup, RelationshipIndex};

pub const DEFAULT_API_BASE: &str = "https://api.cloudflare.com/client/v4";

const COLUMNS: &str = "id, provider, region, bucket, source_id, source_type, source_path, url, \
     object_key, original_source_path, original_key, is_private, extra";

const WRITE_COLUMNS: [&str; 17] = [
    "provider",
    "region",
    "bucket",
    "source_id",
    "source_type",
    "source_path",
    "url",
    "object_key",
    "original_source_path",
    "original_key",
    "is_private",
    "extra",
    "url_hash",
    "object_key_hash",
    "source_path_hash",
    "original_source_path_hash",
    "original_key_hash",
];

/// Table and indexes. Hash columns are NULL for empty values, which SQLite
/// unique indexes treat as distinct.
const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS offload_items (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        provider TEXT NOT NULL,
        region TEXT NOT NULL DEFAULT '',
        bucket TEXT NOT NULL,
        source_id TEXT NOT NULL,
        source_type TEXT NOT NULL,
        source_path TEXT NOT NULL DEFAULT '',
        url TEXT NOT NULL DEFAULT '',
        object_key TEXT NOT NULL DEFAULT '',
        original_source_path TEXT NOT NULL DEFAULT '',
        original_key TEXT NOT NULL DEFAULT '',
        is_private INTEGER NOT NULL DEFAULT 0,
        extra TEXT NOT NULL DEFAULT '{}',
        url_hash TEXT,
        object_key_hash TEXT,
        source_path_hash TEXT,
        original_source_path_hash TEXT,
        original_key_hash TEXT
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS uidx_offload_items_source \
     ON offload_items (source_id, source_type, provider, bucket, region)",
    "CREATE UNIQUE INDEX IF NOT EXISTS uidx_offload_items_url \
     ON offload_items (provider, bucket, region, url_hash)",
    "CREATE UNIQUE INDEX IF NOT EXISTS uidx_offload_items_key \
     ON offload_items (provider, bucket, region, object_key_hash)",
    "CREATE UNIQUE INDEX IF NOT EXISTS uidx_offload_items_source_path \
     ON offload_items (provider, bucket, region, source_path_hash)",
    "CREATE UNIQUE INDEX IF NOT EXISTS uidx_offload_items_original_source_path \
     ON offload_items (provider, bucket, region, original_source_path_hash)",
    "CREATE UNIQUE INDEX IF NOT EXISTS uidx_offload_items_original_key \
     ON offload_items (provider, bucket, region, original_key_hash)",
    "CREATE INDEX IF NOT EXISTS idx_offload_items_path \
     ON offload_items (provider, bucket, region, source_path)",
];

#[derive(Debug, Clone)]
pub struct D1Config {
    pub account_id: String,
    pub api_token: String,
    pub database_id: String,
    pub api_base: String,
}

impl D1Config {
    pub fn new(account_id: String, api_token: String, database_id: String) -> Self {
        Self {
            account_id,
            api_token,
            database_id,
            api_base: DEFAULT_API_BASE.to_string(),
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }
}

/// D1 query request body.
#[derive(Serialize)]
struct D1QueryRequest<'a> {
    sql: &'a str,
    params: &'a [Value],
}

/// D1 API response structure.
#[derive(Deserialize)]
struct D1Response {
    success: bool,
    result: Option<Vec<D1QueryResult>>,
    errors: Option<Vec<D1Error>>,
}

#[derive(Deserialize)]
struct D1QueryResult {
    results: Vec<Value>,
}

#[derive(Deserialize)]
struct D1Error {
    message: String,
}

#[derive(Deserialize)]
struct D1Row {
    id: i64,
    provider: String,
    region: String,
    bucket: String,
    source_id: String,
    source_type: String,
    source_path: String,
    url: String,
    object_key: String,
    original_source_path: String,
    original_key: String,
    is_private: i64,
    extra: String,
}

impl D1Row {
    fn into_relationship(self) -> Result<Relationship, OffloadError> {
        let extra: RelationshipExtra = if self.extra.is_empty() {
            RelationshipExtra::default()
        } else {
            serde_json::from_str(&self.extra)?
        };
        Ok(Relationship {
            id: Some(self.id),
            provider: self.provider,
            region: self.region,
            bucket: self.bucket,
            source_id: self.source_id,
            source_type: self.source_type,
            source_path: self.source_path,
            url: self.url,
            key: self.object_key,
            original_source_path: self.original_source_path,
            original_key: self.original_key,
            is_private: self.is_private != 0,
            extra,
        })
    }
}

/// Positional parameters collected while a statement is assembled.
#[derive(Default)]
struct Params(Vec<Value>);

impl Params {
    /// Bind `value` and return its `?N` placeholder.
    fn bind(&mut self, value: impl Into<Value>) -> String {
        self.0.push(value.into());
        format!("?{}", self.0.len())
    }

    /// `provider = ?a AND bucket = ?b [AND region = ?c]`.
    fn scope(&mut self, scope: &ProviderScope) -> String {
        let provider = self.bind(scope.provider.as_str());
        let bucket = self.bind(scope.bucket.as_str());
        let mut clause = format!("provider = {} AND bucket = {}", provider, bucket);
        if let Some(region) = &scope.region {
            let region = self.bind(region.as_str());
            clause.push_str(&format!(" AND region = {}", region));
        }
        clause
    }
}

/// sha256 of a unique column, NULL when empty.
fn column_hash(value: &str) -> Value {
    if value.is_empty() {
        Value::Null
    } else {
        Value::String(hex::encode(Sha256::digest(value.as_bytes())))
    }
}

fn escape_like(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn failure(message: String) -> OffloadError {
    if message.contains("UNIQUE constraint failed") {
        OffloadError::Conflict(message)
    } else {
        OffloadError::Index(message)
    }
}

/// `RelationshipIndex` backed by a D1 database.
pub struct D1Index {
    http: Client,
    config: D1Config,
}

impl D1Index {
    pub fn new(config: D1Config) -> Self {
        Self {
            http: Client::new(),
            config,
        }
    }

    fn query_url(&self) -> String {
        format!(
            "{}/accounts/{}/d1/database/{}/query",
            self.config.api_base, self.config.account_id, self.config.database_id
        )
    }

    /// Create the table and its indexes if missing.
    pub async fn ensure_schema(&self) -> Result<(), OffloadError> {
        for statement in SCHEMA {
            self.execute_query(statement, &[]).await?;
        }
        Ok(())
    }

    /// Execute a D1 query and return raw results.
    #[instrument(skip(self, params), level = "debug")]
    async fn execute_query(&self, sql: &str, params: &[Value]) -> Result<Vec<Value>, OffloadError> {
        let query = D1QueryRequest { sql, params };

        let response = self
            .http
            .post(self.query_url())
            .header("Authorization", format!("Bearer {}", self.config.api_token))
            .header("Content-Type", "application/json")
            .json(&query)
            .send()
            .await
            .map_err(|e| OffloadError::Index(format!("D1 request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| OffloadError::Index(format!("D1 response unreadable: {}", e)))?;

        let d1_response: D1Response = match serde_json::from_str(&body) {
            Ok(parsed) => parsed,
            Err(_) if !status.is_success() => {
                return Err(failure(format!("D1 API returned {}: {}", status, body)))
            }
            Err(e) => return Err(e.into()),
        };

        if !d1_response.success || !status.is_success() {
            let error_msg = d1_response
                .errors
                .map(|errs| {
                    errs.into_iter()
                        .map(|e| e.message)
                        .collect::<Vec<_>>()
                        .join(", ")
                })
                .unwrap_or_else(|| "Unknown D1 error".to_string());
            return Err(failure(format!("D1 query failed: {}", error_msg)));
        }

        Ok(d1_response
            .result
            .and_then(|mut r| r.pop())
            .map(|qr| qr.results)
            .unwrap_or_default())
    }

    async fn select_rows(&self, sql: &str, params: &[Value]) -> Result<Vec<Relationship>, OffloadError> {
        self.execute_query(sql, params)
            .await?
            .into_iter()
            .map(|row| serde_json::from_value::<D1Row>(row)?.into_relationship())
            .collect()
    }
}

fn write_params(row: &Relationship) -> Result<Vec<Value>, OffloadError> {
    Ok(vec![
        row.provider.clone().into(),
        row.region.clone().into(),
        row.bucket.clone().into(),
        row.source_id.clone().into(),
        row.source_type.clone().into(),
        row.source_path.clone().into(),
        row.url.clone().into(),
        row.key.clone().into(),
        row.original_source_path.clone().into(),
        row.original_key.clone().into(),
        Value::from(i64::from(row.is_private)),
        serde_json::to_string(&row.extra)?.into(),
        column_hash(&row.url),
        column_hash(&row.key),
        column_hash(&row.source_path),
        column_hash(&row.original_source_path),
        column_hash(&row.original_key),
    ])
}

#[async_trait]
impl RelationshipIndex for D1Index {
    async fn insert(&self, row: &Relationship) -> Result<i64, OffloadError> {
        let placeholders = (1..=WRITE_COLUMNS.len())
            .map(|i| format!("?{}", i))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO offload_items ({}) VALUES ({}) RETURNING id",
            WRITE_COLUMNS.join(", "),
            placeholders
        );

        let results = self.execute_query(&sql, &write_params(row)?).await?;
        let id = results
            .first()
            .and_then(|r| r.get("id"))
            .and_then(Value::as_i64)
            .ok_or_else(|| OffloadError::Index("D1 insert returned no id".to_string()))?;
        debug!(id, source_id = %row.source_id, "relationship row inserted");
        Ok(id)
    }

    async fn update(&self, row: &Relationship) -> Result<(), OffloadError> {
        let id = row
            .id
            .ok_or_else(|| OffloadError::Index("update of a row without id".to_string()))?;
        let assignments = WRITE_COLUMNS
            .iter()
            .enumerate()
            .map(|(i, column)| format!("{} = ?{}", column, i + 1))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE offload_items SET {} WHERE id = ?{}",
            assignments,
            WRITE_COLUMNS.len() + 1
        );

        let mut params = write_params(row)?;
        params.push(Value::from(id));
        self.execute_query(&sql, &params).await?;
        Ok(())
    }

    async fn delete(&self, id: i64) -> Result<(), OffloadError> {
        self.execute_query("DELETE FROM offload_items WHERE id = ?1", &[Value::from(id)])
            .await?;
        Ok(())
    }

    async fn find(
        &self,
        scope: &ProviderScope,
        source_id: &str,
        source_type: &str,
    ) -> Result<Option<Relationship>, OffloadError> {
        let mut params = Params::default();
        let id = params.bind(source_id);
        let kind = params.bind(source_type);
        let scope = params.scope(scope);
        let sql = format!(
            "SELECT {} FROM offload_items WHERE source_id = {} AND source_type = {} AND {} LIMIT 1",
            COLUMNS, id, kind, scope
        );
        Ok(self.select_rows(&sql, &params.0).await?.into_iter().next())
    }

    async fn find_by_paths(
        &self,
        scope: &ProviderScope,
        paths: &[String],
        lookup: PathLookup,
        exact: bool,
        limit: Option<usize>,
    ) -> Result<Vec<Relationship>, OffloadError> {
        let needles = needles(paths, exact);
        if needles.is_empty() {
            return Ok(Vec::new());
        }

        let mut params = Params::default();
        let scope = params.scope(scope);
        let bound: Vec<String> = needles
            .iter()
            .map(|n| {
                if exact {
                    params.bind(n.as_str())
                } else {
                    params.bind(format!("{}%", escape_like(n)))
                }
            })
            .collect();

        let predicates = lookup
            .columns()
            .iter()
            .map(|column| {
                let name = column.sql_name();
                if exact {
                    format!("{} IN ({})", name, bound.join(", "))
                } else {
                    bound
                        .iter()
                        .map(|p| format!("{} LIKE {} ESCAPE '\\'", name, p))
                        .collect::<Vec<_>>()
                        .join(" OR ")
                }
            })
            .collect::<Vec<_>>()
            .join(" OR ");

        let mut sql = format!(
            "SELECT {} FROM offload_items WHERE {} AND ({}) ORDER BY id",
            COLUMNS, scope, predicates
        );
        if let Some(limit) = limit {
            let limit = params.bind(limit as u64);
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        self.select_rows(&sql, &params.0).await
    }

    async fn similar_paths(
        &self,
        scope: &ProviderScope,
        prefix: &str,
    ) -> Result<Vec<String>, OffloadError> {
        let mut params = Params::default();
        let scope = params.scope(scope);
        let pattern = params.bind(format!("{}%", escape_like(prefix)));
        let sql = format!(
            "SELECT source_path, original_source_path FROM offload_items WHERE {} AND \
             (source_path LIKE {p} ESCAPE '\\' OR original_source_path LIKE {p} ESCAPE '\\')",
            scope,
            p = pattern
        );

        let mut found = BTreeSet::new();
        for row in self.execute_query(&sql, &params.0).await? {
            for column in ["source_path", "original_source_path"] {
                if let Some(path) = row.get(column).and_then(Value::as_str) {
                    if !path.is_empty() && path.starts_with(prefix) {
                        found.insert(path.to_string());
                    }
                }
            }
        }
        Ok(found.into_iter().collect())
    }

    async fn count_by_source_type(
        &self,
        scope: &ProviderScope,
    ) -> Result<BTreeMap<String, u64>, OffloadError> {
        let mut params = Params::default();
        let scope = params.scope(scope);
        let sql = format!(
            "SELECT source_type, COUNT(*) AS total FROM offload_items WHERE {} GROUP BY source_type",
            scope
        );

        let mut counts = BTreeMap::new();
        for row in self.execute_query(&sql, &params.0).await? {
            if let (Some(kind), Some(total)) = (
                row.get("source_type").and_then(Value::as_str),
                row.get("total").and_then(Value::as_u64),
            ) {
                counts.insert(kind.to_string(), total);
            }
        }
        Ok(counts)
    }

    async fn source_ids(
        &self,
        scope: &ProviderScope,
        source_type: &str,
    ) -> Result<BTreeSet<String>, OffloadError> {
        let mut params = Params::default();
        let scope = params.scope(scope);
        let kind = params.bind(source_type);
        let sql = format!(
            "SELECT source_id FROM offload_items WHERE {} AND source_type = {}",
            scope, kind
        );

        Ok(self
            .execute_query(&sql, &params.0)
            .await?
            .iter()
            .filter_map(|row| row.get("source_id").and_then(Value::as_str))
            .map(str::to_string)
            .collect())
    }
}

//! PostgreSQL-backed store.
//!
//! A key-value table is treated as a ring-sharded store by hashing each key
//! with `hashtextextended(key::text, 0)`, PostgreSQL's signed 64-bit text
//! hash. Range scans use keyset pagination on `(token, key)`.
//!
//! Keys and values are compared through their text form. For indexed point
//! lookups the key column should be `text` or `varchar`.

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use tokio_postgres::{Config as PgConfig, NoTls};
use tracing::{debug, info};

use super::{Key, Page, PagingState, Row, Store, TlsBuilder, Value};
use crate::config::{quote_pg_ident, StoreConfig};
use crate::error::{Result, VerifyError};
use crate::ring::TokenRange;

/// SQL for one side's key-value table.
#[derive(Debug, Clone)]
struct Queries {
    first_page: String,
    next_page: String,
    lookup: String,
}

impl Queries {
    fn new(config: &StoreConfig) -> Self {
        let table = config.qualified_table();
        let key = format!("{}::text", quote_pg_ident(&config.key_column));
        let value = format!("{}::text", quote_pg_ident(&config.value_column));
        let ttl = match &config.ttl_column {
            Some(col) => format!("{}::bigint", quote_pg_ident(col)),
            None => "NULL::bigint".to_string(),
        };
        let token = format!("hashtextextended({}, 0)", key);
        let select = format!(
            "SELECT {token} AS token, {key} COLLATE \"C\" AS k, {value} AS v, {ttl} AS ttl FROM {table}",
            token = token,
            key = key,
            value = value,
            ttl = ttl,
            table = table
        );

        Self {
            first_page: format!(
                "{} WHERE {} BETWEEN $1 AND $2 ORDER BY 1, 2 LIMIT $3",
                select, token
            ),
            next_page: format!(
                "{} WHERE {} BETWEEN $1 AND $2 AND ({}, {} COLLATE \"C\") > ($3, $4) ORDER BY 1, 2 LIMIT $5",
                select, token, token, key
            ),
            lookup: format!(
                "SELECT {key} AS k, {value} AS v, {ttl} AS ttl FROM {table} WHERE {key} = $1",
                key = key,
                value = value,
                ttl = ttl,
                table = table
            ),
        }
    }
}

/// PostgreSQL [`Store`] backed by a deadpool connection pool.
pub struct PgStore {
    name: String,
    pool: Pool,
    queries: Queries,
}

impl PgStore {
    /// Connect a pool for one side and verify it with a test query.
    pub async fn connect(name: impl Into<String>, config: &StoreConfig) -> Result<Self> {
        let store = Self::new(name, config)?;
        store.health_check().await?;

        info!(
            "Connected {} store: {} ({})",
            store.name,
            config.endpoint(),
            config.qualified_table()
        );
        Ok(store)
    }

    /// Build the pool without opening a connection.
    pub fn new(name: impl Into<String>, config: &StoreConfig) -> Result<Self> {
        let name = name.into();

        let mut pg_config = PgConfig::new();
        pg_config.host(&config.host);
        pg_config.port(config.port);
        pg_config.dbname(&config.database);
        pg_config.user(&config.user);
        pg_config.password(&config.password);
        pg_config.application_name("kv-verify");

        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };

        let mgr = match TlsBuilder::from_config(config)?.build()? {
            Some(tls) => Manager::from_config(pg_config, tls, mgr_config),
            None => Manager::from_config(pg_config, NoTls, mgr_config),
        };

        let pool = Pool::builder(mgr)
            .max_size(config.max_connections)
            .build()
            .map_err(|e| VerifyError::pool(e.to_string(), format!("building {} pool", name)))?;

        Ok(Self {
            queries: Queries::new(config),
            name,
            pool,
        })
    }

    async fn client(&self, context: &str) -> Result<deadpool_postgres::Object> {
        self.pool
            .get()
            .await
            .map_err(|e| VerifyError::pool(e.to_string(), format!("{} {}", self.name, context)))
    }

    fn encode_paging(token: i64, key: &str) -> PagingState {
        let mut buf = BytesMut::with_capacity(8 + key.len());
        buf.put_i64(token);
        buf.put_slice(key.as_bytes());
        PagingState(buf.freeze())
    }

    fn decode_paging(&self, state: &PagingState) -> Result<(i64, String)> {
        if state.0.len() < 8 {
            return Err(VerifyError::store(&self.name, "malformed paging state"));
        }
        let mut token = [0u8; 8];
        token.copy_from_slice(&state.0[..8]);
        let key = String::from_utf8(state.0[8..].to_vec())
            .map_err(|e| VerifyError::store(&self.name, format!("paging key: {}", e)))?;
        Ok((i64::from_be_bytes(token), key))
    }
}

#[async_trait]
impl Store for PgStore {
    async fn scan_page(
        &self,
        range: &TokenRange,
        page_size: usize,
        paging: Option<PagingState>,
    ) -> Result<Page> {
        let client = self.client("scan").await?;
        let limit = page_size as i64;

        let rows = match paging {
            None => {
                let stmt = client.prepare_cached(&self.queries.first_page).await?;
                client
                    .query(&stmt, &[&range.start, &range.end, &limit])
                    .await?
            }
            Some(state) => {
                let (last_token, last_key) = self.decode_paging(&state)?;
                let stmt = client.prepare_cached(&self.queries.next_page).await?;
                client
                    .query(
                        &stmt,
                        &[&range.start, &range.end, &last_token, &last_key, &limit],
                    )
                    .await?
            }
        };

        let mut page = Vec::with_capacity(rows.len());
        let mut last = None;
        for row in &rows {
            let token: i64 = row.try_get(0)?;
            let key: String = row.try_get(1)?;
            let value: Option<String> = row.try_get(2)?;
            let ttl: Option<i64> = row.try_get(3)?;
            page.push(Row {
                key: Key::from(key.as_str()),
                value: value.map(Value::from),
                ttl,
            });
            last = Some((token, key));
        }

        // A full page may have more behind it; a short one ends the range.
        let next = match last {
            Some((token, key)) if page.len() == page_size => Some(Self::encode_paging(token, &key)),
            _ => None,
        };

        debug!(
            "{}: range {} page of {} rows (more: {})",
            self.name,
            range,
            page.len(),
            next.is_some()
        );
        Ok(Page { rows: page, next })
    }

    async fn lookup(&self, key: &Key) -> Result<Option<Row>> {
        let client = self.client("lookup").await?;
        let stmt = client.prepare_cached(&self.queries.lookup).await?;
        let key_text = std::str::from_utf8(key.as_bytes())
            .map_err(|e| VerifyError::store(&self.name, format!("non-text key {}: {}", key, e)))?;

        let row = client.query_opt(&stmt, &[&key_text]).await?;
        match row {
            None => Ok(None),
            Some(row) => {
                let k: String = row.try_get(0)?;
                let v: Option<String> = row.try_get(1)?;
                let ttl: Option<i64> = row.try_get(2)?;
                Ok(Some(Row {
                    key: Key::from(k),
                    value: v.map(Value::from),
                    ttl,
                }))
            }
        }
    }

    async fn health_check(&self) -> Result<()> {
        let client = self.client("health check").await?;
        client.simple_query("SELECT 1").await?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

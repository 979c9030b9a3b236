//! Warehouse backend: one TDS connection per process, authenticated with an
//! Entra access token.
//!
//! The connection is opened lazily, probed with `SELECT 1` before reuse and
//! rebuilt on any failure. Each rebuild asks the credential provider for a
//! token again.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use futures::TryStreamExt;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tiberius::numeric::Numeric;
use tiberius::{AuthMethod, Client, ColumnData, EncryptionLevel, FromSql, QueryItem, ToSql};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

use crate::config::Config;
use crate::credentials::{CredentialProvider, TokenScope};
use crate::error::TransportError;

pub const LIST_TABLES_SQL: &str = "SELECT TABLE_SCHEMA, TABLE_NAME FROM INFORMATION_SCHEMA.TABLES \
     WHERE TABLE_TYPE = 'BASE TABLE' ORDER BY TABLE_SCHEMA, TABLE_NAME";

pub const LIST_TABLES_IN_SCHEMA_SQL: &str = "SELECT TABLE_SCHEMA, TABLE_NAME FROM INFORMATION_SCHEMA.TABLES \
     WHERE TABLE_TYPE = 'BASE TABLE' AND TABLE_SCHEMA = @P1 ORDER BY TABLE_NAME";

pub const DESCRIBE_TABLE_SQL: &str = "SELECT COLUMN_NAME, DATA_TYPE, IS_NULLABLE, CHARACTER_MAXIMUM_LENGTH \
     FROM INFORMATION_SCHEMA.COLUMNS WHERE TABLE_SCHEMA = @P1 AND TABLE_NAME = @P2 \
     ORDER BY ORDINAL_POSITION";

pub const PROFILE_COLUMNS_SQL: &str = "SELECT COLUMN_NAME, DATA_TYPE, IS_NULLABLE, CHARACTER_MAXIMUM_LENGTH, \
     NUMERIC_PRECISION, NUMERIC_SCALE FROM INFORMATION_SCHEMA.COLUMNS \
     WHERE TABLE_SCHEMA = @P1 AND TABLE_NAME = @P2 ORDER BY ORDINAL_POSITION";

pub const LIST_SCHEMAS_SQL: &str = "SELECT DISTINCT TABLE_SCHEMA FROM INFORMATION_SCHEMA.TABLES \
     WHERE TABLE_TYPE = 'BASE TABLE' ORDER BY TABLE_SCHEMA";

pub const TABLE_ROW_COUNTS_SQL: &str = "SELECT t.TABLE_SCHEMA, t.TABLE_NAME, SUM(p.rows) AS row_count \
     FROM INFORMATION_SCHEMA.TABLES t \
     LEFT JOIN sys.tables st ON st.name = t.TABLE_NAME AND SCHEMA_NAME(st.schema_id) = t.TABLE_SCHEMA \
     LEFT JOIN sys.partitions p ON p.object_id = st.object_id AND p.index_id IN (0, 1) \
     WHERE t.TABLE_TYPE = 'BASE TABLE' \
     GROUP BY t.TABLE_SCHEMA, t.TABLE_NAME ORDER BY t.TABLE_SCHEMA, t.TABLE_NAME";

/// `[name]` with embedded `]` doubled.
pub fn quote_ident(name: &str) -> String {
    format!("[{}]", name.replace(']', "]]"))
}

pub fn sample_sql(schema: &str, table: &str, n: usize) -> String {
    format!("SELECT TOP {n} * FROM {}.{}", quote_ident(schema), quote_ident(table))
}

/// Row total, null count and distinct count for one column, in that order.
pub fn column_profile_sql(schema: &str, table: &str, column: &str) -> String {
    let col = quote_ident(column);
    format!(
        "SELECT COUNT(*) AS total, SUM(CASE WHEN {col} IS NULL THEN 1 ELSE 0 END) AS nulls, \
         COUNT(DISTINCT {col}) AS distinct_count FROM {}.{}",
        quote_ident(schema),
        quote_ident(table)
    )
}

/// Where to connect. Compared on every call so a new warehouse forces a new connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlTarget {
    pub endpoint: String,
    pub database: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TabularResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub truncated: bool,
}

impl TabularResult {
    /// Rows as `{column: value}` objects.
    pub fn records(&self) -> Vec<Value> {
        self.rows
            .iter()
            .map(|row| {
                let obj: serde_json::Map<String, Value> = self
                    .columns
                    .iter()
                    .cloned()
                    .zip(row.iter().cloned())
                    .collect();
                Value::Object(obj)
            })
            .collect()
    }
}

pub trait WarehouseApi {
    /// Run `sql` (with `@P1..` bound to `params`) and return at most `max_rows` rows
    /// of the first result set.
    fn query(
        &mut self,
        target: &SqlTarget,
        sql: &str,
        params: &[&str],
        max_rows: usize,
    ) -> Result<TabularResult, TransportError>;
}

type TdsClient = Client<Compat<TcpStream>>;

pub struct TdsWarehouse {
    runtime: tokio::runtime::Runtime,
    credentials: Arc<dyn CredentialProvider + Send + Sync>,
    default_port: u16,
    trust_server_certificate: bool,
    timeout: Duration,
    conn: Option<(SqlTarget, TdsClient)>,
}

impl TdsWarehouse {
    pub fn new(cfg: &Config, credentials: Arc<dyn CredentialProvider + Send + Sync>) -> anyhow::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
        Ok(Self {
            runtime,
            credentials,
            default_port: cfg.warehouse.port,
            trust_server_certificate: cfg.warehouse.trust_server_certificate,
            timeout: Duration::from_secs(cfg.network.timeout_secs.max(1)),
            conn: None,
        })
    }

    /// Reuse the live connection for `target`, or open a fresh one.
    fn checkout(&mut self, target: &SqlTarget) -> Result<TdsClient, TransportError> {
        if let Some((key, mut client)) = self.conn.take() {
            if &key == target {
                let alive = self.runtime.block_on(async {
                    let probe = async {
                        client.simple_query("SELECT 1").await?.into_results().await?;
                        Ok::<_, tiberius::error::Error>(())
                    };
                    matches!(tokio::time::timeout(self.timeout, probe).await, Ok(Ok(())))
                });
                if alive {
                    return Ok(client);
                }
                tracing::info!(endpoint = %target.endpoint, "warehouse connection went stale; reconnecting");
            }
        }

        let token = self
            .credentials
            .token(TokenScope::TabularQuery)
            .ok_or(TransportError::Auth(TokenScope::TabularQuery.as_str()))?;
        let (host, port) = split_host_port(&target.endpoint, self.default_port);

        let mut config = tiberius::Config::new();
        config.host(&host);
        config.port(port);
        if let Some(db) = target.database.as_deref() {
            config.database(db);
        }
        config.authentication(AuthMethod::aad_token(token));
        config.encryption(EncryptionLevel::Required);
        if self.trust_server_certificate {
            config.trust_cert();
        }

        tracing::info!(%host, port, database = ?target.database, "opening warehouse connection");
        let connect = async {
            let tcp = TcpStream::connect(config.get_addr()).await?;
            tcp.set_nodelay(true)?;
            let client = Client::connect(config, tcp.compat_write()).await?;
            Ok::<_, TransportError>(client)
        };
        self.runtime
            .block_on(tokio::time::timeout(self.timeout, connect))
            .map_err(|_| TransportError::Timeout)?
    }
}

impl WarehouseApi for TdsWarehouse {
    fn query(
        &mut self,
        target: &SqlTarget,
        sql: &str,
        params: &[&str],
        max_rows: usize,
    ) -> Result<TabularResult, TransportError> {
        let mut client = self.checkout(target)?;
        let timeout = self.timeout;
        let outcome = self.runtime.block_on(tokio::time::timeout(
            timeout,
            read_first_result(&mut client, sql, params, max_rows),
        ));
        match outcome {
            Ok(Ok(result)) => {
                // A truncated read leaves unread rows on the wire; drop the connection
                // instead of draining it.
                if !result.truncated {
                    self.conn = Some((target.clone(), client));
                }
                Ok(result)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(TransportError::Timeout),
        }
    }
}

async fn read_first_result(
    client: &mut TdsClient,
    sql: &str,
    params: &[&str],
    max_rows: usize,
) -> Result<TabularResult, TransportError> {
    let mut stream = if params.is_empty() {
        client.simple_query(sql).await?
    } else {
        let bound: Vec<&dyn ToSql> = params.iter().map(|p| p as &dyn ToSql).collect();
        client.query(sql, &bound).await?
    };

    let mut out = TabularResult::default();
    while let Some(item) = stream.try_next().await? {
        match item {
            QueryItem::Metadata(meta) if meta.result_index() == 0 => {
                out.columns = meta.columns().iter().map(|c| c.name().to_string()).collect();
            }
            QueryItem::Row(row) if row.result_index() == 0 => {
                if out.rows.len() >= max_rows {
                    out.truncated = true;
                    break;
                }
                out.rows.push(row.into_iter().map(cell_to_json).collect());
            }
            _ => {}
        }
    }
    Ok(out)
}

fn split_host_port(endpoint: &str, default_port: u16) -> (String, u16) {
    let endpoint = endpoint.trim();
    if let Some((host, port)) = endpoint.rsplit_once(',') {
        if let Ok(port) = port.trim().parse() {
            return (host.trim().to_string(), port);
        }
    }
    (endpoint.to_string(), default_port)
}

fn cell_to_json(data: ColumnData<'static>) -> Value {
    match data {
        ColumnData::U8(v) => json!(v),
        ColumnData::I16(v) => json!(v),
        ColumnData::I32(v) => json!(v),
        ColumnData::I64(v) => json!(v),
        ColumnData::F32(v) => json!(v),
        ColumnData::F64(v) => json!(v),
        ColumnData::Bit(v) => json!(v),
        ColumnData::String(v) => json!(v.map(|s| s.into_owned())),
        ColumnData::Guid(v) => json!(v.map(|g| g.to_string())),
        ColumnData::Xml(v) => json!(v.map(|x| x.to_string())),
        ColumnData::Numeric(v) => json!(v.map(numeric_text)),
        ColumnData::Binary(v) => match v {
            Some(bytes) => {
                let hex: String = bytes.iter().map(|b| format!("{b:02X}")).collect();
                Value::String(format!("0x{hex}"))
            }
            None => Value::Null,
        },
        ColumnData::Date(_) => temporal(NaiveDate::from_sql(&data), |d| d.format("%Y-%m-%d").to_string()),
        ColumnData::Time(_) => temporal(NaiveTime::from_sql(&data), |t| t.format("%H:%M:%S%.f").to_string()),
        ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_) => {
            temporal(NaiveDateTime::from_sql(&data), |dt| {
                dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string()
            })
        }
        ColumnData::DateTimeOffset(_) => {
            temporal(DateTime::<FixedOffset>::from_sql(&data), |dt| dt.to_rfc3339())
        }
    }
}

fn temporal<T>(parsed: tiberius::Result<Option<T>>, render: impl FnOnce(T) -> String) -> Value {
    match parsed {
        Ok(Some(value)) => Value::String(render(value)),
        Ok(None) => Value::Null,
        Err(e) => {
            tracing::debug!(error = %e, "unconvertible temporal cell");
            Value::Null
        }
    }
}

/// Exact decimal text; precision 38 does not fit an `f64`.
fn numeric_text(n: Numeric) -> String {
    let scale = usize::from(n.scale());
    let sign = if n.value() < 0 { "-" } else { "" };
    let digits = n.value().unsigned_abs().to_string();
    if scale == 0 {
        return format!("{sign}{digits}");
    }
    let padded = format!("{digits:0>width$}", width = scale + 1);
    let (int, frac) = padded.split_at(padded.len() - scale);
    format!("{sign}{int}.{frac}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::borrow::Cow;
    use tiberius::time::{Date, DateTime2, DateTimeOffset, SmallDateTime, Time};

    #[test]
    fn identifiers_are_bracket_quoted() {
        assert_eq!(quote_ident("dbo"), "[dbo]");
        assert_eq!(quote_ident("we]ird"), "[we]]ird]");
        assert_eq!(sample_sql("dbo", "Fact Sales", 10), "SELECT TOP 10 * FROM [dbo].[Fact Sales]");
        assert_eq!(
            column_profile_sql("dbo", "Sales", "Unit]Price"),
            "SELECT COUNT(*) AS total, SUM(CASE WHEN [Unit]]Price] IS NULL THEN 1 ELSE 0 END) AS nulls, \
             COUNT(DISTINCT [Unit]]Price]) AS distinct_count FROM [dbo].[Sales]"
        );
    }

    #[test]
    fn endpoint_port_suffix_is_honoured() {
        assert_eq!(split_host_port("x.datawarehouse.fabric.microsoft.com", 1433), ("x.datawarehouse.fabric.microsoft.com".into(), 1433));
        assert_eq!(split_host_port("host,1444", 1433), ("host".into(), 1444));
        assert_eq!(split_host_port("host,abc", 1433), ("host,abc".into(), 1433));
    }

    #[test]
    fn cells_convert_to_json() {
        assert_eq!(cell_to_json(ColumnData::I32(Some(7))), json!(7));
        assert_eq!(cell_to_json(ColumnData::I64(None)), Value::Null);
        assert_eq!(cell_to_json(ColumnData::Bit(Some(true))), json!(true));
        assert_eq!(cell_to_json(ColumnData::String(Some(Cow::Borrowed("abc")))), json!("abc"));
        assert_eq!(cell_to_json(ColumnData::Binary(Some(Cow::Borrowed(&[0xAB, 0x01])))), json!("0xAB01"));
    }

    // 2021-07-30 is day 738000 counted from 0001-01-01.
    const JULY_30_2021: u32 = 738000;
    // 12:34:56 at scale 7 (100ns increments).
    const HALF_PAST_NOON: u64 = 45_296 * 10_000_000;

    #[test]
    fn date_and_time_cells_are_iso_text() {
        assert_eq!(cell_to_json(ColumnData::Date(Some(Date::new(JULY_30_2021)))), json!("2021-07-30"));
        assert_eq!(cell_to_json(ColumnData::Date(None)), Value::Null);
        assert_eq!(cell_to_json(ColumnData::Time(Some(Time::new(HALF_PAST_NOON, 7)))), json!("12:34:56"));
        assert_eq!(
            cell_to_json(ColumnData::Time(Some(Time::new(HALF_PAST_NOON + 5_000_000, 7)))),
            json!("12:34:56.500")
        );
        assert_eq!(cell_to_json(ColumnData::Time(None)), Value::Null);
    }

    #[test]
    fn datetime_cells_are_iso_text() {
        let dt2 = DateTime2::new(Date::new(JULY_30_2021), Time::new(HALF_PAST_NOON, 7));
        assert_eq!(cell_to_json(ColumnData::DateTime2(Some(dt2))), json!("2021-07-30T12:34:56"));
        assert_eq!(cell_to_json(ColumnData::DateTime2(None)), Value::Null);

        // Legacy datetime counts days from 1900 and 1/300 s fragments.
        let legacy = tiberius::time::DateTime::new(1, 300 * 3600);
        assert_eq!(cell_to_json(ColumnData::DateTime(Some(legacy))), json!("1900-01-02T01:00:00"));

        // smalldatetime counts minutes.
        let small = SmallDateTime::new(1, 90);
        assert_eq!(cell_to_json(ColumnData::SmallDateTime(Some(small))), json!("1900-01-02T01:30:00"));
    }

    #[test]
    fn datetimeoffset_cells_carry_their_offset() {
        // The stored datetime2 is UTC; the offset gives local time.
        let utc = DateTime2::new(Date::new(JULY_30_2021), Time::new(HALF_PAST_NOON, 7));
        let dto = DateTimeOffset::new(utc, 120);
        assert_eq!(
            cell_to_json(ColumnData::DateTimeOffset(Some(dto))),
            json!("2021-07-30T14:34:56+02:00")
        );
        assert_eq!(cell_to_json(ColumnData::DateTimeOffset(None)), Value::Null);
    }

    #[test]
    fn numerics_keep_every_digit() {
        let cell = |value: i128, scale: u8| cell_to_json(ColumnData::Numeric(Some(Numeric::new_with_scale(value, scale))));
        assert_eq!(cell(12345, 2), json!("123.45"));
        assert_eq!(cell(-12345, 2), json!("-123.45"));
        assert_eq!(cell(-5, 2), json!("-0.05"));
        assert_eq!(cell(42, 0), json!("42"));
        assert_eq!(
            cell(12_345_678_901_234_567_890_123_456_789, 10),
            json!("1234567890123456789.0123456789")
        );
        assert_eq!(cell_to_json(ColumnData::Numeric(None)), Value::Null);
    }

    #[test]
    fn records_zip_columns_and_rows() {
        let result = TabularResult {
            columns: vec!["a".into(), "b".into()],
            rows: vec![vec![json!(1), json!("x")]],
            truncated: false,
        };
        assert_eq!(result.records(), vec![json!({ "a": 1, "b": "x" })]);
    }
}

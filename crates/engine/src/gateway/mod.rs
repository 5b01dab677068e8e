//! TabularQueryGateway: read-only queries against a tabular engine.
//!
//! The gateway never retries. `Unauthorized` and `MalformedQuery` are final;
//! `WarehouseUnavailable` is left to the caller's retry policy.

mod catalog;
mod warehouse;

pub use catalog::{ColumnDescription, TableName, TableSample, MAX_SAMPLE_ROWS};
pub use warehouse::WarehouseClient;

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use dqstudio_core::{Credential, StudioError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One result column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub type_name: String,
}

impl Column {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Column {
            name: name.into(),
            type_name: type_name.into(),
        }
    }
}

/// Continuation handle for the next page of a result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageToken(pub String);

/// One page of a statement result.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResultPage {
    /// Present on the first page; continuation pages may leave it empty.
    pub columns: Vec<Column>,
    pub rows: Vec<Vec<Value>>,
    pub next: Option<PageToken>,
}

/// The remote engine that actually runs statements.
#[async_trait]
pub trait TabularEngine: Send + Sync {
    /// Run `sql` and return its first page.
    async fn execute(&self, sql: &str, credential: &Credential) -> Result<ResultPage, StudioError>;

    /// Fetch a continuation page.
    async fn fetch_page(
        &self,
        token: &PageToken,
        credential: &Credential,
    ) -> Result<ResultPage, StudioError>;
}

/// A result row. Values are addressed by position or column name.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[Column]>,
    values: Vec<Value>,
}

impl Row {
    pub fn new(columns: Arc<[Column]>, values: Vec<Value>) -> Self {
        Row { columns, values }
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        let idx = self.columns.iter().position(|c| c.name == name)?;
        self.values.get(idx)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    pub fn str_at(&self, idx: usize) -> Option<&str> {
        self.values.get(idx).and_then(Value::as_str)
    }

    /// Column name to value map; unnamed trailing values are dropped.
    pub fn to_object(&self) -> serde_json::Map<String, Value> {
        self.columns
            .iter()
            .zip(&self.values)
            .map(|(c, v)| (c.name.clone(), v.clone()))
            .collect()
    }
}

/// A finite, lazily paged sequence of rows.
///
/// Further pages are fetched only when the buffered rows run out.
pub struct RowStream {
    engine: Arc<dyn TabularEngine>,
    credential: Credential,
    columns: Arc<[Column]>,
    buffered: VecDeque<Vec<Value>>,
    next: Option<PageToken>,
}

impl RowStream {
    fn new(engine: Arc<dyn TabularEngine>, credential: Credential, first: ResultPage) -> Self {
        RowStream {
            engine,
            credential,
            columns: first.columns.into(),
            buffered: first.rows.into(),
            next: first.next,
        }
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub async fn next_row(&mut self) -> Result<Option<Row>, StudioError> {
        loop {
            if let Some(values) = self.buffered.pop_front() {
                return Ok(Some(Row::new(Arc::clone(&self.columns), values)));
            }
            let Some(token) = self.next.take() else {
                return Ok(None);
            };
            let page = self.engine.fetch_page(&token, &self.credential).await?;
            self.buffered.extend(page.rows);
            self.next = page.next;
        }
    }

    /// Read at most `limit` rows.
    pub async fn take(&mut self, limit: usize) -> Result<Vec<Row>, StudioError> {
        let mut rows = Vec::new();
        while rows.len() < limit {
            match self.next_row().await? {
                Some(row) => rows.push(row),
                None => break,
            }
        }
        Ok(rows)
    }

    pub async fn collect_all(mut self) -> Result<Vec<Row>, StudioError> {
        let mut rows = Vec::new();
        while let Some(row) = self.next_row().await? {
            rows.push(row);
        }
        Ok(rows)
    }
}

/// Runs read-only statements with an already-resolved credential.
#[derive(Clone)]
pub struct TabularQueryGateway {
    engine: Arc<dyn TabularEngine>,
}

impl TabularQueryGateway {
    pub fn new(engine: Arc<dyn TabularEngine>) -> Self {
        TabularQueryGateway { engine }
    }

    /// Run a read-only statement. Anything other than a single
    /// `SELECT`/`WITH`/`SHOW`/`DESCRIBE`/`EXPLAIN` statement is refused as
    /// `MalformedQuery` before it leaves the process.
    pub async fn query(&self, sql: &str, credential: &Credential) -> Result<RowStream, StudioError> {
        check_read_only(sql)?;
        tracing::debug!(origin = ?credential.origin(), "executing statement");
        let first = self.engine.execute(sql.trim(), credential).await.map_err(|e| {
            tracing::warn!(error = %e, "statement failed");
            e
        })?;
        Ok(RowStream::new(
            Arc::clone(&self.engine),
            credential.clone(),
            first,
        ))
    }
}

const READ_ONLY_KEYWORDS: [&str; 6] = ["SELECT", "WITH", "SHOW", "DESCRIBE", "DESC", "EXPLAIN"];

fn check_read_only(sql: &str) -> Result<(), StudioError> {
    let body = sql.trim().trim_end_matches(';').trim_end();
    if body.is_empty() {
        return Err(StudioError::MalformedQuery("empty statement".to_string()));
    }
    if body.contains(';') {
        return Err(StudioError::MalformedQuery(
            "multiple statements are not allowed".to_string(),
        ));
    }
    let keyword = body
        .split(|c: char| c.is_whitespace() || c == '(')
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();
    if !READ_ONLY_KEYWORDS.contains(&keyword.as_str()) {
        return Err(StudioError::MalformedQuery(format!(
            "only read-only statements are allowed, got {keyword}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dqstudio_core::{CredentialOrigin, CredentialScope};
    use serde_json::json;
    use std::sync::Mutex;

    /// Serves three pages of one column and counts page fetches.
    struct PagedEngine {
        fetches: Mutex<usize>,
    }

    #[async_trait]
    impl TabularEngine for PagedEngine {
        async fn execute(&self, _sql: &str, _c: &Credential) -> Result<ResultPage, StudioError> {
            Ok(ResultPage {
                columns: vec![Column::new("id", "INT")],
                rows: vec![vec![json!(1)], vec![json!(2)]],
                next: Some(PageToken("p1".into())),
            })
        }

        async fn fetch_page(
            &self,
            token: &PageToken,
            _c: &Credential,
        ) -> Result<ResultPage, StudioError> {
            *self.fetches.lock().unwrap() += 1;
            match token.0.as_str() {
                "p1" => Ok(ResultPage {
                    columns: vec![],
                    rows: vec![],
                    next: Some(PageToken("p2".into())),
                }),
                "p2" => Ok(ResultPage {
                    columns: vec![],
                    rows: vec![vec![json!(3)]],
                    next: None,
                }),
                other => Err(StudioError::MalformedQuery(format!("bad token {other}"))),
            }
        }
    }

    fn credential() -> Credential {
        Credential::new("t", CredentialScope::UserDelegated, CredentialOrigin::CallerForwarded)
    }

    #[tokio::test]
    async fn stream_fetches_pages_lazily() {
        let engine = Arc::new(PagedEngine {
            fetches: Mutex::new(0),
        });
        let gateway = TabularQueryGateway::new(engine.clone());
        let mut stream = gateway.query("SELECT id FROM t", &credential()).await.unwrap();

        let first = stream.take(2).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(*engine.fetches.lock().unwrap(), 0);

        let third = stream.next_row().await.unwrap().unwrap();
        assert_eq!(third.get("id"), Some(&json!(3)));
        assert_eq!(third.columns()[0].name, "id");
        assert!(stream.next_row().await.unwrap().is_none());
        assert_eq!(*engine.fetches.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn collect_all_reads_every_page() {
        let engine = Arc::new(PagedEngine {
            fetches: Mutex::new(0),
        });
        let gateway = TabularQueryGateway::new(engine);
        let rows = gateway
            .query("select id from t;", &credential())
            .await
            .unwrap()
            .collect_all()
            .await
            .unwrap();
        let ids: Vec<_> = rows.iter().map(|r| r.values()[0].clone()).collect();
        assert_eq!(ids, vec![json!(1), json!(2), json!(3)]);
    }

    #[test]
    fn read_only_guard() {
        assert!(check_read_only("SELECT 1").is_ok());
        assert!(check_read_only("  with x as (select 1) select * from x ;").is_ok());
        assert!(check_read_only("SHOW CATALOGS").is_ok());
        assert!(check_read_only("DESCRIBE TABLE `a`.`b`.`c`").is_ok());

        for sql in ["", "  ;", "DROP TABLE t", "SELECT 1; DELETE FROM t", "insert into t values (1)"] {
            assert!(
                matches!(check_read_only(sql), Err(StudioError::MalformedQuery(_))),
                "{sql:?} should be refused"
            );
        }
    }

    #[test]
    fn row_accessors() {
        let columns: Arc<[Column]> = vec![Column::new("a", "STRING"), Column::new("b", "INT")].into();
        let row = Row::new(columns, vec![json!("x"), json!(null)]);
        assert_eq!(row.get_str("a"), Some("x"));
        assert_eq!(row.str_at(0), Some("x"));
        assert_eq!(row.get("b"), Some(&Value::Null));
        assert_eq!(row.get("missing"), None);
        assert_eq!(row.to_object().len(), 2);
    }
}

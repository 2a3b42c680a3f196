use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{
    Array, ArrayRef, RecordBatch, RecordBatchIterator, RecordBatchReader, StringArray,
};
use arrow_schema::{DataType, Field, Schema};
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::StreamExt;
use lancedb::query::{ExecutableQuery, QueryBase};
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;

use super::{sort_links, PaperStore, StoreError};
use crate::models::{
    normalize_doi, normalize_title, CrawlSession, Paper, PaperQueryLink, SearchQuery,
};

/// A table holding one JSON `record` column plus nullable string lookup columns.
struct TableSpec {
    name: &'static str,
    keys: &'static [&'static str],
}

const PAPERS: TableSpec = TableSpec {
    name: "papers",
    keys: &["id", "identity", "doi_key", "title_key"],
};
const LINKS: TableSpec = TableSpec {
    name: "paper_query_links",
    keys: &["paper_id", "query_id"],
};
const QUERIES: TableSpec = TableSpec {
    name: "queries",
    keys: &["id"],
};
const SESSIONS: TableSpec = TableSpec {
    name: "sessions",
    keys: &["id", "query_id"],
};

const RECORD_COLUMN: &str = "record";

fn make_schema(spec: &TableSpec) -> Arc<Schema> {
    let mut fields: Vec<Field> = spec
        .keys
        .iter()
        .map(|k| Field::new(*k, DataType::Utf8, true))
        .collect();
    fields.push(Field::new(RECORD_COLUMN, DataType::Utf8, false));
    Arc::new(Schema::new(fields))
}

fn quoted(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn decode<T: DeserializeOwned>(records: Vec<String>) -> Result<Vec<T>, StoreError> {
    records
        .iter()
        .map(|r| serde_json::from_str(r).map_err(StoreError::from))
        .collect()
}

/// LanceDB-backed store. Every record is kept as JSON next to the columns it is looked up by.
pub struct LanceStore {
    db: lancedb::Connection,
    /// Serializes read-modify-write sequences (delete-then-add, check-then-link).
    writes: Mutex<()>,
}

impl LanceStore {
    /// Create or open a LanceDB database at the given path.
    pub async fn create_or_open(path: &Path) -> Result<Self> {
        std::fs::create_dir_all(path).context("Failed to create LanceDB directory")?;
        let uri = path.to_str().context("LanceDB path is not valid UTF-8")?;

        let db = lancedb::connect(uri)
            .execute()
            .await
            .context("Failed to connect to LanceDB")?;

        let tables = db
            .table_names()
            .execute()
            .await
            .context("Failed to list tables")?;
        for spec in [&PAPERS, &LINKS, &QUERIES, &SESSIONS] {
            if !tables.iter().any(|t| t == spec.name) {
                db.create_empty_table(spec.name, make_schema(spec))
                    .execute()
                    .await
                    .with_context(|| format!("Failed to create {} table", spec.name))?;
            }
        }

        Ok(Self {
            db,
            writes: Mutex::new(()),
        })
    }

    async fn table(&self, spec: &TableSpec) -> Result<lancedb::Table> {
        self.db
            .open_table(spec.name)
            .execute()
            .await
            .with_context(|| format!("Failed to open {} table", spec.name))
    }

    /// JSON records of rows matching `filter`.
    async fn records(
        &self,
        spec: &TableSpec,
        filter: String,
        limit: Option<usize>,
    ) -> Result<Vec<String>> {
        let table = self.table(spec).await?;
        let mut query = table.query().only_if(filter);
        if let Some(limit) = limit {
            query = query.limit(limit);
        }
        let mut stream = query
            .execute()
            .await
            .with_context(|| format!("Failed to query {}", spec.name))?;

        let mut out = Vec::new();
        while let Some(batch) = stream.next().await {
            let batch = batch.context("Failed to read query result batch")?;
            let column = batch
                .column_by_name(RECORD_COLUMN)
                .and_then(|c| c.as_any().downcast_ref::<StringArray>())
                .context("Missing record column")?;
            for row in 0..batch.num_rows() {
                if !column.is_null(row) {
                    out.push(column.value(row).to_string());
                }
            }
        }
        Ok(out)
    }

    async fn first_record(&self, spec: &TableSpec, filter: String) -> Result<Option<String>> {
        Ok(self.records(spec, filter, Some(1)).await?.into_iter().next())
    }

    fn row(
        spec: &TableSpec,
        keys: &[Option<&str>],
        record: &str,
    ) -> Result<Box<dyn RecordBatchReader + Send>> {
        let schema = make_schema(spec);
        let mut columns: Vec<ArrayRef> = keys
            .iter()
            .map(|k| Arc::new(StringArray::from(vec![*k])) as ArrayRef)
            .collect();
        columns.push(Arc::new(StringArray::from(vec![record])));

        let batch =
            RecordBatch::try_new(schema.clone(), columns).context("Failed to create RecordBatch")?;
        Ok(Box::new(RecordBatchIterator::new(vec![Ok(batch)], schema)))
    }

    async fn insert(&self, spec: &TableSpec, keys: &[Option<&str>], record: &str) -> Result<()> {
        let batches = Self::row(spec, keys, record)?;
        self.table(spec)
            .await?
            .add(batches)
            .execute()
            .await
            .with_context(|| format!("Failed to add row to {}", spec.name))?;
        Ok(())
    }

    /// Upsert the row keyed by its `id` column in one merge, so a failed write leaves the
    /// previous row in place. Callers hold `writes`.
    async fn replace(&self, spec: &TableSpec, keys: &[Option<&str>], record: &str) -> Result<()> {
        let batches = Self::row(spec, keys, record)?;
        let table = self.table(spec).await?;
        let mut merge = table.merge_insert(&["id"]);
        merge
            .when_matched_update_all(None)
            .when_not_matched_insert_all();
        merge
            .execute(batches)
            .await
            .with_context(|| format!("Failed to upsert into {}", spec.name))?;
        Ok(())
    }

    #[cfg(test)]
    async fn count(&self, spec: &TableSpec) -> Result<usize> {
        self.table(spec)
            .await?
            .count_rows(None)
            .await
            .context("Failed to count rows")
    }
}

#[async_trait]
impl PaperStore for LanceStore {
    async fn find_by_doi(&self, doi: &str) -> Result<Option<Paper>, StoreError> {
        let key = normalize_doi(doi).to_lowercase();
        let record = self
            .first_record(&PAPERS, format!("doi_key = {}", quoted(&key)))
            .await?;
        Ok(decode(record.into_iter().collect())?.pop())
    }

    async fn find_by_title(&self, title: &str) -> Result<Option<Paper>, StoreError> {
        let key = normalize_title(title);
        if key.is_empty() {
            return Ok(None);
        }
        let record = self
            .first_record(&PAPERS, format!("title_key = {}", quoted(&key)))
            .await?;
        Ok(decode(record.into_iter().collect())?.pop())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Paper>, StoreError> {
        let record = self
            .first_record(&PAPERS, format!("id = {}", quoted(id)))
            .await?;
        Ok(decode(record.into_iter().collect())?.pop())
    }

    async fn upsert(&self, paper: &Paper) -> Result<(), StoreError> {
        let record = serde_json::to_string(paper)?;
        let identity = paper.identity().to_string();
        let doi_key = paper.doi_key();
        let title_key = normalize_title(&paper.title);
        let keys = [
            Some(paper.id.as_str()),
            Some(identity.as_str()),
            doi_key.as_deref(),
            Some(title_key.as_str()).filter(|t| !t.is_empty()),
        ];

        let _guard = self.writes.lock().await;
        self.replace(&PAPERS, &keys, &record).await?;
        Ok(())
    }

    async fn link_to_query(
        &self,
        paper_id: &str,
        query_id: &str,
        depth: u32,
    ) -> Result<bool, StoreError> {
        let filter = format!(
            "paper_id = {} AND query_id = {}",
            quoted(paper_id),
            quoted(query_id)
        );

        let _guard = self.writes.lock().await;
        if self.first_record(&LINKS, filter).await?.is_some() {
            return Ok(false);
        }
        let link = PaperQueryLink {
            paper_id: paper_id.to_string(),
            query_id: query_id.to_string(),
            depth,
            linked_at: Utc::now(),
        };
        let record = serde_json::to_string(&link)?;
        self.insert(&LINKS, &[Some(paper_id), Some(query_id)], &record)
            .await?;
        Ok(true)
    }

    async fn list_for_query(&self, query_id: &str) -> Result<Vec<Paper>, StoreError> {
        let links = self.list_links(query_id).await?;
        if links.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<String> = links.iter().map(|l| quoted(&l.paper_id)).collect();
        let filter = format!("id IN ({})", ids.join(", "));
        let papers: Vec<Paper> = decode(self.records(&PAPERS, filter, None).await?)?;

        let mut by_id: HashMap<String, Paper> =
            papers.into_iter().map(|p| (p.id.clone(), p)).collect();
        Ok(links
            .iter()
            .filter_map(|l| by_id.remove(&l.paper_id))
            .collect())
    }

    async fn list_links(&self, query_id: &str) -> Result<Vec<PaperQueryLink>, StoreError> {
        let records = self
            .records(&LINKS, format!("query_id = {}", quoted(query_id)), None)
            .await?;
        let mut links: Vec<PaperQueryLink> = decode(records)?;
        sort_links(&mut links);
        Ok(links)
    }

    async fn save_query(&self, query: &SearchQuery) -> Result<(), StoreError> {
        let record = serde_json::to_string(query)?;
        let _guard = self.writes.lock().await;
        self.replace(&QUERIES, &[Some(query.id.as_str())], &record)
            .await?;
        Ok(())
    }

    async fn get_query(&self, id: &str) -> Result<Option<SearchQuery>, StoreError> {
        let record = self
            .first_record(&QUERIES, format!("id = {}", quoted(id)))
            .await?;
        Ok(decode(record.into_iter().collect())?.pop())
    }

    async fn save_session(&self, session: &CrawlSession) -> Result<(), StoreError> {
        let record = serde_json::to_string(session)?;
        let keys = [Some(session.id.as_str()), Some(session.query_id.as_str())];
        let _guard = self.writes.lock().await;
        self.replace(&SESSIONS, &keys, &record).await?;
        Ok(())
    }

    async fn session_for_query(&self, query_id: &str) -> Result<Option<CrawlSession>, StoreError> {
        let records = self
            .records(&SESSIONS, format!("query_id = {}", quoted(query_id)), None)
            .await?;
        let sessions: Vec<CrawlSession> = decode(records)?;
        Ok(sessions.into_iter().max_by_key(|s| s.started_at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SessionStatus;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_lance_store_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let store = LanceStore::create_or_open(tmp.path()).await.unwrap();

        let mut paper = Paper::new("test", "Holographic Entanglement in AdS/CFT", Some("10.1/O'Neil"))
            .unwrap();
        paper.citation_count = 3;
        store.upsert(&paper).await.unwrap();
        paper.citation_count = 7;
        store.upsert(&paper).await.unwrap();
        assert_eq!(store.count(&PAPERS).await.unwrap(), 1);

        let got = store.find_by_doi("10.1/o'neil").await.unwrap().unwrap();
        assert_eq!(got.citation_count, 7);
        assert_eq!(got.identity(), paper.identity());
        let got = store
            .find_by_title("holographic entanglement in ads cft")
            .await
            .unwrap();
        assert_eq!(got.map(|p| p.id), Some(paper.id.clone()));
        assert!(store.find_by_id("missing").await.unwrap().is_none());

        assert!(store.link_to_query(&paper.id, "q1", 0).await.unwrap());
        assert!(!store.link_to_query(&paper.id, "q1", 2).await.unwrap());
        let listed = store.list_for_query("q1").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(store.list_links("q1").await.unwrap()[0].depth, 0);
    }

    #[tokio::test]
    async fn test_lance_store_queries_and_sessions_persist() {
        let tmp = TempDir::new().unwrap();
        let query = SearchQuery::new(vec!["quantum".into()]);
        let session = CrawlSession {
            id: "s1".into(),
            query_id: query.id.clone(),
            status: SessionStatus::Running,
            papers_found: 0,
            papers_analyzed: 0,
            errors: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
        };
        {
            let store = LanceStore::create_or_open(tmp.path()).await.unwrap();
            store.save_query(&query).await.unwrap();
            store.save_session(&session).await.unwrap();
            let mut done = session.clone();
            done.status = SessionStatus::Completed;
            store.save_session(&done).await.unwrap();
        }

        let store = LanceStore::create_or_open(tmp.path()).await.unwrap();
        assert_eq!(store.get_query(&query.id).await.unwrap(), Some(query.clone()));
        let latest = store.session_for_query(&query.id).await.unwrap().unwrap();
        assert_eq!(latest.status, SessionStatus::Completed);
        assert_eq!(store.count(&SESSIONS).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_lance_upsert_updates_lookup_columns_in_place() {
        let tmp = TempDir::new().unwrap();
        let store = LanceStore::create_or_open(tmp.path()).await.unwrap();

        let mut paper = Paper::new("arxiv", "Surface Codes Revisited", None).unwrap();
        store.upsert(&paper).await.unwrap();
        assert!(store.find_by_doi("10.7/surface").await.unwrap().is_none());

        paper.doi = Some("10.7/Surface".into());
        store.upsert(&paper).await.unwrap();
        assert_eq!(store.count(&PAPERS).await.unwrap(), 1);
        let got = store.find_by_doi("10.7/surface").await.unwrap().unwrap();
        assert_eq!(got.id, paper.id);
    }
}

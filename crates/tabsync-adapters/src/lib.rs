//! Source readers: bulk spreadsheet, bulk CSV and paginated JSON listings.
//!
//! Readers only produce [`RawTable`]s; they never interpret column semantics.

use std::io::Cursor;
use std::sync::Arc;

use async_trait::async_trait;
use calamine::{open_workbook_auto_from_rs, Data, Reader};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tabsync_core::{RawRecord, RawTable};
use tabsync_storage::{ArtifactStore, FetchError, HttpFetcher};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "tabsync-adapters";

pub const DEFAULT_PAGE_SIZE: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Spreadsheet,
    Csv,
    PaginatedJson,
}

impl SourceKind {
    pub fn extension(self) -> &'static str {
        match self {
            SourceKind::Spreadsheet => "xlsx",
            SourceKind::Csv => "csv",
            SourceKind::PaginatedJson => "json",
        }
    }
}

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

/// Where and how to read one dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub source_id: String,
    pub kind: SourceKind,
    /// `http(s)://` URL, or a local path to a previously captured payload.
    pub url: String,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub url: String,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("could not decode {source_id}: {message}")]
    Decode { source_id: String, message: String },
}

impl SourceError {
    fn decode(source_id: &str, message: impl Into<String>) -> Self {
        SourceError::Decode {
            source_id: source_id.to_string(),
            message: message.into(),
        }
    }
}

/// Byte transport seam between readers and the network (or disk).
#[async_trait]
pub trait ByteSource: Send + Sync {
    async fn get(
        &self,
        run_id: Uuid,
        source: &SourceDescriptor,
        url: &str,
    ) -> Result<Payload, FetchError>;
}

pub fn is_remote(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// Production byte source: HTTP for URLs, the filesystem for paths, optional archival.
#[derive(Debug, Clone)]
pub struct HttpByteSource {
    http: Arc<HttpFetcher>,
    archive: Option<ArtifactStore>,
}

impl HttpByteSource {
    pub fn new(http: Arc<HttpFetcher>) -> Self {
        Self { http, archive: None }
    }

    pub fn with_archive(mut self, archive: ArtifactStore) -> Self {
        self.archive = Some(archive);
        self
    }
}

#[async_trait]
impl ByteSource for HttpByteSource {
    async fn get(
        &self,
        run_id: Uuid,
        source: &SourceDescriptor,
        url: &str,
    ) -> Result<Payload, FetchError> {
        let payload = if is_remote(url) {
            let resp = self.http.fetch_bytes(run_id, &source.source_id, url).await?;
            Payload {
                url: resp.final_url,
                body: resp.body,
                fetched_at: resp.fetched_at,
            }
        } else {
            let body = tokio::fs::read(url).await.map_err(|source| FetchError::Io {
                path: url.to_string(),
                source,
            })?;
            Payload {
                url: url.to_string(),
                body,
                fetched_at: Utc::now(),
            }
        };

        if let Some(archive) = &self.archive {
            if let Err(err) = archive
                .store_payload(
                    payload.fetched_at,
                    &source.source_id,
                    source.kind.extension(),
                    &payload.body,
                )
                .await
            {
                warn!(source_id = %source.source_id, error = %err, "payload archive write failed");
            }
        }
        Ok(payload)
    }
}

#[async_trait]
pub trait SourceReader: Send + Sync {
    fn kind(&self) -> SourceKind;

    async fn read(
        &self,
        bytes: &dyn ByteSource,
        run_id: Uuid,
        source: &SourceDescriptor,
    ) -> Result<RawTable, SourceError>;
}

#[derive(Debug, Clone, Copy)]
struct SpreadsheetReader;

#[derive(Debug, Clone, Copy)]
struct CsvReader;

#[derive(Debug, Clone, Copy)]
struct PaginatedJsonReader;

#[async_trait]
impl SourceReader for SpreadsheetReader {
    fn kind(&self) -> SourceKind {
        SourceKind::Spreadsheet
    }

    async fn read(
        &self,
        bytes: &dyn ByteSource,
        run_id: Uuid,
        source: &SourceDescriptor,
    ) -> Result<RawTable, SourceError> {
        let payload = bytes.get(run_id, source, &source.url).await?;
        let records = parse_spreadsheet(&source.source_id, payload.body)?;
        info!(source_id = %source.source_id, rows = records.len(), "read spreadsheet");
        Ok(records)
    }
}

#[async_trait]
impl SourceReader for CsvReader {
    fn kind(&self) -> SourceKind {
        SourceKind::Csv
    }

    async fn read(
        &self,
        bytes: &dyn ByteSource,
        run_id: Uuid,
        source: &SourceDescriptor,
    ) -> Result<RawTable, SourceError> {
        let payload = bytes.get(run_id, source, &source.url).await?;
        let records = parse_csv(&source.source_id, &payload.body)?;
        info!(source_id = %source.source_id, rows = records.len(), "read csv");
        Ok(records)
    }
}

#[async_trait]
impl SourceReader for PaginatedJsonReader {
    fn kind(&self) -> SourceKind {
        SourceKind::PaginatedJson
    }

    async fn read(
        &self,
        bytes: &dyn ByteSource,
        run_id: Uuid,
        source: &SourceDescriptor,
    ) -> Result<RawTable, SourceError> {
        let page_size = source.page_size.max(1);
        let mut offset = 0usize;
        let mut records = Vec::new();

        loop {
            let url = page_url(&source.url, page_size, offset);
            let payload = bytes.get(run_id, source, &url).await?;
            let page = parse_results_page(&source.source_id, &payload.body)?;
            if page.is_empty() {
                break;
            }
            records.extend(page);
            info!(source_id = %source.source_id, fetched = records.len(), "fetched page");
            offset += page_size;
        }

        Ok(RawTable::from_rows(records))
    }
}

pub fn reader_for(kind: SourceKind) -> Box<dyn SourceReader> {
    match kind {
        SourceKind::Spreadsheet => Box::new(SpreadsheetReader),
        SourceKind::Csv => Box::new(CsvReader),
        SourceKind::PaginatedJson => Box::new(PaginatedJsonReader),
    }
}

pub async fn read_source(
    bytes: &dyn ByteSource,
    run_id: Uuid,
    source: &SourceDescriptor,
) -> Result<RawTable, SourceError> {
    reader_for(source.kind).read(bytes, run_id, source).await
}

pub fn page_url(base: &str, page_size: usize, offset: usize) -> String {
    let sep = if base.contains('?') { '&' } else { '?' };
    format!("{base}{sep}limit={page_size}&offset={offset}")
}

/// UTF-8 when valid, otherwise Latin-1 (every byte is a code point).
fn decode_cell(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

pub fn parse_csv(source_id: &str, bytes: &[u8]) -> Result<RawTable, SourceError> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(bytes);

    let headers = reader
        .byte_headers()
        .map_err(|e| SourceError::decode(source_id, e.to_string()))?
        .iter()
        .map(decode_cell)
        .collect::<Vec<_>>();

    let mut records = Vec::new();
    for row in reader.byte_records() {
        let row = row.map_err(|e| SourceError::decode(source_id, e.to_string()))?;
        let record = headers
            .iter()
            .enumerate()
            .map(|(i, label)| {
                let value = row.get(i).map(decode_cell).and_then(non_empty);
                (label.clone(), value)
            })
            .collect::<RawRecord>();
        records.push(record);
    }
    Ok(RawTable::new(headers, records))
}

fn cell_text(cell: &Data) -> Option<String> {
    match cell {
        Data::Empty => None,
        Data::String(s) => non_empty(s.trim().to_string()),
        other => non_empty(other.to_string()),
    }
}

pub fn parse_spreadsheet(source_id: &str, bytes: Vec<u8>) -> Result<RawTable, SourceError> {
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes))
        .map_err(|e| SourceError::decode(source_id, e.to_string()))?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| SourceError::decode(source_id, "workbook has no worksheets"))?
        .map_err(|e| SourceError::decode(source_id, e.to_string()))?;

    let mut rows = range.rows();
    let Some(header_row) = rows.next() else {
        return Ok(RawTable::default());
    };
    let headers = header_row
        .iter()
        .map(|c| cell_text(c).unwrap_or_default())
        .collect::<Vec<_>>();

    let records = rows
        .map(|row| {
            headers
                .iter()
                .enumerate()
                .map(|(i, label)| (label.clone(), row.get(i).and_then(cell_text)))
                .collect::<RawRecord>()
        })
        .collect();
    Ok(RawTable::new(headers, records))
}

fn json_cell(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => non_empty(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        other => Some(other.to_string()),
    }
}

/// Decode one listing page: `{"results": [{...}, ...]}`.
pub fn parse_results_page(source_id: &str, bytes: &[u8]) -> Result<Vec<RawRecord>, SourceError> {
    let value: JsonValue = serde_json::from_slice(bytes)
        .map_err(|e| SourceError::decode(source_id, format!("invalid JSON page: {e}")))?;
    let results = value
        .get("results")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| SourceError::decode(source_id, "page has no `results` array"))?;

    results
        .iter()
        .map(|item| {
            let object = item
                .as_object()
                .ok_or_else(|| SourceError::decode(source_id, "`results` item is not an object"))?;
            Ok(object
                .iter()
                .map(|(k, v)| (k.clone(), json_cell(v)))
                .collect::<RawRecord>())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Canned pages keyed by URL; unknown URLs fail like a 404.
    #[derive(Default)]
    struct FakeBytes {
        pages: HashMap<String, Vec<u8>>,
        requested: Mutex<Vec<String>>,
    }

    impl FakeBytes {
        fn with(mut self, url: &str, body: &str) -> Self {
            self.pages.insert(url.to_string(), body.as_bytes().to_vec());
            self
        }
    }

    #[async_trait]
    impl ByteSource for FakeBytes {
        async fn get(
            &self,
            _run_id: Uuid,
            _source: &SourceDescriptor,
            url: &str,
        ) -> Result<Payload, FetchError> {
            self.requested.lock().unwrap().push(url.to_string());
            match self.pages.get(url) {
                Some(body) => Ok(Payload {
                    url: url.to_string(),
                    body: body.clone(),
                    fetched_at: Utc::now(),
                }),
                None => Err(FetchError::HttpStatus {
                    status: 404,
                    url: url.to_string(),
                }),
            }
        }
    }

    fn cms_source() -> SourceDescriptor {
        SourceDescriptor {
            source_id: "cms_hospitals".into(),
            kind: SourceKind::PaginatedJson,
            url: "https://api.example.test/query/0".into(),
            page_size: 2,
        }
    }

    #[test]
    fn csv_strips_bom_trims_and_tolerates_ragged_rows() {
        let body = "\u{feff}RegionName, City ,2026-01-31\n501, Holtsville ,1200.5\n10001.0,New York\n";
        let table = parse_csv("zori", body.as_bytes()).expect("csv");
        assert_eq!(table.headers, vec!["RegionName", "City", "2026-01-31"]);
        let records = table.rows;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].get("RegionName"), Some("501"));
        assert_eq!(records[0].get("City"), Some("Holtsville"));
        assert_eq!(records[0].get("2026-01-31"), Some("1200.5"));
        assert_eq!(records[1].get("RegionName"), Some("10001.0"));
        assert_eq!(records[1].get("2026-01-31"), None);
    }

    #[test]
    fn csv_falls_back_to_latin1_cells() {
        let mut body = b"ccn,health_sys_name\n010001,Sant".to_vec();
        body.push(0xE9);
        body.extend_from_slice(b" Health\n");
        let records = parse_csv("ahrq", &body).expect("csv").rows;
        assert_eq!(records[0].get("health_sys_name"), Some("Santé Health"));
    }

    #[test]
    fn header_only_csv_keeps_its_headers() {
        let table = parse_csv("ahrq", b"ccn,health_sys_name\n").expect("csv");
        assert!(table.is_empty());
        assert_eq!(table.headers, vec!["ccn", "health_sys_name"]);
    }

    #[test]
    fn json_page_renders_scalars_and_drops_nulls() {
        let body = r#"{"results":[{"facility_id":"010001","zip_code":36301,"emergency":true,"notes":null}]}"#;
        let records = parse_results_page("cms", body.as_bytes()).expect("page");
        assert_eq!(records[0].get("facility_id"), Some("010001"));
        assert_eq!(records[0].get("zip_code"), Some("36301"));
        assert_eq!(records[0].get("emergency"), Some("true"));
        assert_eq!(records[0].get("notes"), None);
    }

    #[test]
    fn json_page_without_results_is_a_decode_error() {
        let err = parse_results_page("cms", br#"{"data":[]}"#).unwrap_err();
        assert!(matches!(err, SourceError::Decode { .. }));
    }

    #[test]
    fn broken_workbook_is_a_decode_error() {
        let err = parse_spreadsheet("hud", b"not a workbook".to_vec()).unwrap_err();
        assert!(matches!(err, SourceError::Decode { .. }));
    }

    #[test]
    fn page_urls_respect_existing_query() {
        assert_eq!(page_url("https://x.test/q", 1000, 0), "https://x.test/q?limit=1000&offset=0");
        assert_eq!(
            page_url("https://x.test/q?format=json", 10, 20),
            "https://x.test/q?format=json&limit=10&offset=20"
        );
    }

    #[tokio::test]
    async fn paginated_reader_concatenates_until_empty_page() {
        let bytes = FakeBytes::default()
            .with(
                "https://api.example.test/query/0?limit=2&offset=0",
                r#"{"results":[{"facility_id":"010001"},{"facility_id":"010005"}]}"#,
            )
            .with(
                "https://api.example.test/query/0?limit=2&offset=2",
                r#"{"results":[{"facility_id":"010006"}]}"#,
            )
            .with(
                "https://api.example.test/query/0?limit=2&offset=4",
                r#"{"results":[]}"#,
            );

        let records = read_source(&bytes, Uuid::new_v4(), &cms_source()).await.expect("read");
        assert_eq!(records.headers, vec!["facility_id"]);
        let ids = records
            .rows
            .iter()
            .map(|r| r.get("facility_id").unwrap_or_default())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["010001", "010005", "010006"]);
        assert_eq!(bytes.requested.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn fetch_failure_is_not_retried_by_readers() {
        let bytes = FakeBytes::default();
        let err = read_source(&bytes, Uuid::new_v4(), &cms_source()).await.unwrap_err();
        assert!(matches!(
            err,
            SourceError::Fetch(FetchError::HttpStatus { status: 404, .. })
        ));
        assert_eq!(bytes.requested.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn local_paths_are_read_from_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("zori.csv");
        std::fs::write(&path, "RegionName,2026-01-31\n501,1200\n").expect("write");

        let http = Arc::new(HttpFetcher::new(Default::default()).expect("client"));
        let archive = ArtifactStore::new(dir.path().join("artifacts"));
        let bytes = HttpByteSource::new(http).with_archive(archive);
        let source = SourceDescriptor {
            source_id: "zillow_zori".into(),
            kind: SourceKind::Csv,
            url: path.display().to_string(),
            page_size: DEFAULT_PAGE_SIZE,
        };

        let records = read_source(&bytes, Uuid::new_v4(), &source).await.expect("read");
        assert_eq!(records.len(), 1);
        assert!(dir.path().join("artifacts").exists());
    }

    #[tokio::test]
    async fn missing_local_file_is_a_fetch_error() {
        let http = Arc::new(HttpFetcher::new(Default::default()).expect("client"));
        let bytes = HttpByteSource::new(http);
        let source = SourceDescriptor {
            source_id: "hud_safmr".into(),
            kind: SourceKind::Spreadsheet,
            url: "/nonexistent/fy2026_safmrs.xlsx".into(),
            page_size: DEFAULT_PAGE_SIZE,
        };
        let err = read_source(&bytes, Uuid::new_v4(), &source).await.unwrap_err();
        assert!(matches!(err, SourceError::Fetch(FetchError::Io { .. })));
    }
}

//! Zotero Web API client.
//!
//! Covers the slice of the API the pipeline needs: reading the whole
//! library (for the dedupe ledger and cleanup pass), item templates,
//! batched item creation, batched updates, and the three-step file
//! upload protocol for PDF attachments.

use std::path::Path;
use std::time::{Duration, UNIX_EPOCH};

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::error::{OptionExt, Result, SerpZotError};

/// Zotero API base URL
const ZOTERO_API_URL: &str = "https://api.zotero.org";

/// Items per read page (API maximum)
const PAGE_LIMIT: usize = 100;

/// Items per write request (API maximum)
const WRITE_BATCH_LIMIT: usize = 50;

/// Which kind of library the credentials point at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LibraryType {
    User,
    Group,
}

impl LibraryType {
    fn path_segment(self) -> &'static str {
        match self {
            LibraryType::User => "users",
            LibraryType::Group => "groups",
        }
    }

    /// Parse the CLI form (`user` / `group`).
    pub fn from_flag(s: &str) -> Result<Self> {
        match s {
            "user" => Ok(LibraryType::User),
            "group" => Ok(LibraryType::Group),
            other => Err(SerpZotError::Config(format!(
                "library type must be 'user' or 'group', got '{}'",
                other
            ))),
        }
    }
}

/// One library item as returned by the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoteroItem {
    pub key: String,
    #[serde(default)]
    pub version: i64,
    pub data: Value,
    #[serde(default)]
    pub links: Value,
}

impl ZoteroItem {
    /// Does the item already carry a PDF attachment?
    pub fn has_attachment(&self) -> bool {
        self.links.get("attachment").is_some()
    }

    pub fn item_type(&self) -> Option<&str> {
        self.data.get("itemType").and_then(|v| v.as_str())
    }

    pub fn title(&self) -> Option<&str> {
        self.data.get("title").and_then(|v| v.as_str())
    }

    /// `DOI` field (either key casing the API has used over time).
    pub fn doi_field(&self) -> Option<&str> {
        self.data
            .get("DOI")
            .or_else(|| self.data.get("doi"))
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
    }

    pub fn url_field(&self) -> Option<&str> {
        self.data
            .get("url")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
    }
}

/// Zotero Web API client.
pub struct ZoteroClient {
    client: reqwest::Client,
    base_url: String,
    prefix: String,
    api_key: String,
}

impl ZoteroClient {
    pub fn new(
        library_id: impl Into<String>,
        api_key: impl Into<String>,
        library_type: LibraryType,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| SerpZotError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: ZOTERO_API_URL.to_string(),
            prefix: format!("{}/{}", library_type.path_segment(), library_id.into()),
            api_key: api_key.into(),
        })
    }

    /// Create a client against a different endpoint (tests).
    pub fn with_base_url(
        library_id: impl Into<String>,
        api_key: impl Into<String>,
        library_type: LibraryType,
        base_url: impl Into<String>,
    ) -> Result<Self> {
        let mut c = Self::new(library_id, api_key, library_type)?;
        c.base_url = base_url.into();
        Ok(c)
    }

    fn items_url(&self) -> String {
        format!("{}/{}/items", self.base_url, self.prefix)
    }

    fn auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.header("Zotero-API-Version", "3")
            .header("Zotero-API-Key", &self.api_key)
    }

    /// Fetch every item in the library, one page at a time.
    ///
    /// `query` narrows the scan the way the web UI's quick-search does.
    pub async fn all_items(&self, query: Option<&str>) -> Result<Vec<ZoteroItem>> {
        let mut items: Vec<ZoteroItem> = Vec::new();
        let mut start = 0usize;

        loop {
            let mut req = self.client.get(self.items_url()).query(&[
                ("start", start.to_string()),
                ("limit", PAGE_LIMIT.to_string()),
                ("format", "json".to_string()),
            ]);
            if let Some(q) = query {
                req = req.query(&[("q", q)]);
            }

            let response = check_zotero_response(self.auth(req).send().await?).await?;

            let total: Option<usize> = response
                .headers()
                .get("Total-Results")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok());

            let page: Vec<ZoteroItem> = response.json().await?;
            let fetched = page.len();
            items.extend(page);
            start += fetched;

            debug!(start, total, "Fetched library page");

            let done = match total {
                Some(t) => start >= t,
                None => fetched < PAGE_LIMIT,
            };
            if done || fetched == 0 {
                break;
            }
        }

        info!(count = items.len(), "Library scan complete");
        Ok(items)
    }

    /// Fetch a fresh item template.
    pub async fn item_template(&self, item_type: &str) -> Result<Value> {
        let url = format!("{}/items/new", self.base_url);
        let req = self.client.get(&url).query(&[("itemType", item_type)]);
        let response = check_zotero_response(self.auth(req).send().await?).await?;
        Ok(response.json().await?)
    }

    /// Create items in batches; returns the keys of created items.
    pub async fn create_items(&self, items: &[Value]) -> Result<Vec<String>> {
        let mut keys = Vec::new();

        for batch in items.chunks(WRITE_BATCH_LIMIT) {
            let req = self.client.post(self.items_url()).json(&batch);
            let response = check_zotero_response(self.auth(req).send().await?).await?;
            let body: WriteResponse = response.json().await?;

            for (index, reason) in &body.failed {
                warn!(index, reason = %reason, "Item rejected by Zotero");
            }

            let mut created: Vec<(usize, String)> = body
                .successful
                .iter()
                .filter_map(|(index, item)| {
                    let key = item
                        .get("key")
                        .or_else(|| item.get("data").and_then(|d| d.get("key")))
                        .and_then(|k| k.as_str())?;
                    Some((index.parse().unwrap_or(usize::MAX), key.to_string()))
                })
                .collect();
            created.sort_by_key(|(index, _)| *index);
            keys.extend(created.into_iter().map(|(_, key)| key));
        }

        info!(created = keys.len(), submitted = items.len(), "Upload complete");
        Ok(keys)
    }

    /// Push modified items back, in batches.
    ///
    /// Each item's `data` already carries its key and version, which is
    /// how the API matches and conflict-checks the write.
    pub async fn update_items(&self, items: &[ZoteroItem]) -> Result<()> {
        for batch in items.chunks(WRITE_BATCH_LIMIT) {
            let payload: Vec<&Value> = batch.iter().map(|i| &i.data).collect();
            let req = self.client.post(self.items_url()).json(&payload);
            let response = check_zotero_response(self.auth(req).send().await?).await?;
            let body: WriteResponse = response.json().await?;
            for (index, reason) in &body.failed {
                warn!(index, reason = %reason, "Item update rejected");
            }
        }
        info!(count = items.len(), "Library update complete");
        Ok(())
    }

    /// Attach a PDF file to an existing item.
    ///
    /// Runs the API's three-step upload: create the attachment item,
    /// request upload authorization (`If-None-Match: *`), then POST the
    /// payload and register it. A server-side `exists` answer
    /// short-circuits as success.
    pub async fn attach_pdf(&self, parent_key: &str, path: &Path) -> Result<String> {
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| SerpZotError::Validation(format!("not a file path: {}", path.display())))?;

        // 1. attachment item
        let mut template = self.attachment_template().await?;
        if let Some(map) = template.as_object_mut() {
            map.insert("title".to_string(), json!(filename));
            map.insert("filename".to_string(), json!(filename));
            map.insert("contentType".to_string(), json!("application/pdf"));
            map.insert("parentItem".to_string(), json!(parent_key));
        }
        let created = self.create_items(&[template]).await?;
        let attachment_key = created
            .into_iter()
            .next()
            .ok_or_else(|| SerpZotError::Api {
                code: 200,
                message: "attachment item was not created".to_string(),
            })?;

        // 2. upload authorization
        let bytes = std::fs::read(path)?;
        let mut hasher = Md5::new();
        hasher.update(&bytes);
        let md5_hex = format!("{:x}", hasher.finalize());
        let mtime_ms = std::fs::metadata(path)?
            .modified()?
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        let file_url = format!("{}/{}/file", self.items_url(), attachment_key);
        let req = self
            .client
            .post(&file_url)
            .header("If-None-Match", "*")
            .form(&[
                ("md5", md5_hex.as_str()),
                ("filename", filename.as_str()),
                ("filesize", &bytes.len().to_string()),
                ("mtime", &mtime_ms.to_string()),
            ]);
        let response = check_zotero_response(self.auth(req).send().await?).await?;
        let auth: UploadAuthorization = response.json().await?;

        if auth.exists == Some(1) {
            debug!(attachment_key, "File already on the server");
            return Ok(attachment_key);
        }

        let url = auth.url.ok_or_parse("upload authorization missing url")?;
        let content_type = auth
            .content_type
            .ok_or_parse("upload authorization missing contentType")?;
        let upload_key = auth
            .upload_key
            .ok_or_parse("upload authorization missing uploadKey")?;
        let prefix = auth.prefix.unwrap_or_default();
        let suffix = auth.suffix.unwrap_or_default();

        // 3. upload and register
        let mut payload = Vec::with_capacity(prefix.len() + bytes.len() + suffix.len());
        payload.extend_from_slice(prefix.as_bytes());
        payload.extend_from_slice(&bytes);
        payload.extend_from_slice(suffix.as_bytes());

        let upload_response = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(payload)
            .send()
            .await?;
        if !upload_response.status().is_success() {
            return Err(SerpZotError::Api {
                code: upload_response.status().as_u16() as i32,
                message: "file upload rejected by storage".to_string(),
            });
        }

        let req = self
            .client
            .post(&file_url)
            .header("If-None-Match", "*")
            .form(&[("upload", upload_key.as_str())]);
        check_zotero_response(self.auth(req).send().await?).await?;

        info!(attachment_key, parent_key, "PDF attached");
        Ok(attachment_key)
    }

    async fn attachment_template(&self) -> Result<Value> {
        let url = format!("{}/items/new", self.base_url);
        let req = self
            .client
            .get(&url)
            .query(&[("itemType", "attachment"), ("linkMode", "imported_file")]);
        let response = check_zotero_response(self.auth(req).send().await?).await?;
        Ok(response.json().await?)
    }
}

/// Map a Zotero HTTP response to Ok or a typed error.
async fn check_zotero_response(response: reqwest::Response) -> Result<reqwest::Response> {
    if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
        let secs = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse().ok())
            .unwrap_or(5);
        return Err(SerpZotError::RateLimited(secs));
    }

    if !response.status().is_success() {
        let code = response.status().as_u16() as i32;
        let message = response.text().await.unwrap_or_default();
        return Err(SerpZotError::Api {
            code,
            message: format!("Zotero API error: {}", message.trim()),
        });
    }

    Ok(response)
}

// === Zotero API Response Types ===

#[derive(Debug, Deserialize)]
struct WriteResponse {
    #[serde(default)]
    successful: std::collections::HashMap<String, Value>,
    #[serde(default)]
    failed: std::collections::HashMap<String, Value>,
}

#[derive(Debug, Deserialize)]
struct UploadAuthorization {
    #[serde(default)]
    exists: Option<i32>,
    #[serde(default)]
    url: Option<String>,
    #[serde(rename = "contentType", default)]
    content_type: Option<String>,
    #[serde(default)]
    prefix: Option<String>,
    #[serde(default)]
    suffix: Option<String>,
    #[serde(rename = "uploadKey", default)]
    upload_key: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn test_client(server: &mockito::Server) -> ZoteroClient {
        ZoteroClient::with_base_url("7032524", "key123", LibraryType::User, server.url())
            .expect("client")
    }

    #[test]
    fn test_library_type_flag() {
        assert_eq!(LibraryType::from_flag("user").unwrap(), LibraryType::User);
        assert_eq!(LibraryType::from_flag("group").unwrap(), LibraryType::Group);
        assert!(LibraryType::from_flag("shared").is_err());
    }

    #[test]
    fn test_item_accessors() {
        let item: ZoteroItem = serde_json::from_str(
            r#"{
                "key": "IHKT6PBN",
                "version": 19315,
                "links": {"attachment": {"href": "https://api.zotero.org/users/1/items/JL5D29KN"}},
                "data": {
                    "itemType": "journalArticle",
                    "title": "Hypertension and the gut microbiome",
                    "DOI": "10.1152/physiolgenomics.00029.2020",
                    "url": "http://dx.doi.org/10.1152/physiolgenomics.00029.2020"
                }
            }"#,
        )
        .unwrap();

        assert!(item.has_attachment());
        assert_eq!(item.item_type(), Some("journalArticle"));
        assert_eq!(item.doi_field(), Some("10.1152/physiolgenomics.00029.2020"));
        assert!(item.url_field().is_some());
    }

    #[test]
    fn test_item_without_attachment_or_doi() {
        let item: ZoteroItem = serde_json::from_str(
            r#"{"key": "K", "version": 1, "data": {"itemType": "note", "DOI": ""}}"#,
        )
        .unwrap();
        assert!(!item.has_attachment());
        assert_eq!(item.doi_field(), None);
    }

    #[tokio::test]
    async fn test_all_items_paginates() {
        let mut server = mockito::Server::new_async().await;

        let page: Vec<Value> = (0..100)
            .map(|i| json!({"key": format!("K{i}"), "version": 1, "data": {}}))
            .collect();
        let _first = server
            .mock("GET", "/users/7032524/items")
            .match_query(mockito::Matcher::UrlEncoded("start".into(), "0".into()))
            .with_status(200)
            .with_header("Total-Results", "101")
            .with_body(serde_json::to_string(&page).unwrap())
            .create_async()
            .await;
        let _second = server
            .mock("GET", "/users/7032524/items")
            .match_query(mockito::Matcher::UrlEncoded("start".into(), "100".into()))
            .with_status(200)
            .with_header("Total-Results", "101")
            .with_body(r#"[{"key": "LAST", "version": 1, "data": {}}]"#)
            .create_async()
            .await;

        let items = test_client(&server).all_items(None).await.unwrap();
        assert_eq!(items.len(), 101);
        assert_eq!(items[100].key, "LAST");
    }

    #[tokio::test]
    async fn test_create_items_returns_keys() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/users/7032524/items")
            .with_status(200)
            .with_body(
                r#"{
                    "successful": {"0": {"key": "ABC123", "version": 2}},
                    "unchanged": {},
                    "failed": {"1": {"code": 400, "message": "bad item"}}
                }"#,
            )
            .create_async()
            .await;

        let keys = test_client(&server)
            .create_items(&[json!({"itemType": "journalArticle"}), json!({})])
            .await
            .unwrap();
        assert_eq!(keys, vec!["ABC123".to_string()]);
    }

    #[tokio::test]
    async fn test_attach_pdf_exists_short_circuit() {
        let mut server = mockito::Server::new_async().await;

        let _template = server
            .mock("GET", "/items/new")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(r#"{"itemType": "attachment", "linkMode": "imported_file"}"#)
            .create_async()
            .await;
        let _create = server
            .mock("POST", "/users/7032524/items")
            .with_status(200)
            .with_body(r#"{"successful": {"0": {"key": "ATT111"}}, "failed": {}}"#)
            .create_async()
            .await;
        let _auth = server
            .mock("POST", "/users/7032524/items/ATT111/file")
            .with_status(200)
            .with_body(r#"{"exists": 1}"#)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let pdf_path = dir.path().join("10.1000_xyz.pdf");
        let mut f = std::fs::File::create(&pdf_path).unwrap();
        f.write_all(b"%PDF-1.4 test").unwrap();

        let key = test_client(&server).attach_pdf("PARENT1", &pdf_path).await.unwrap();
        assert_eq!(key, "ATT111");
    }

    #[tokio::test]
    async fn test_api_error_is_typed() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/users/7032524/items")
            .match_query(mockito::Matcher::Any)
            .with_status(403)
            .with_body("Invalid key")
            .create_async()
            .await;

        let err = test_client(&server).all_items(None).await.unwrap_err();
        match err {
            SerpZotError::Api { code, .. } => assert_eq!(code, 403),
            other => panic!("expected Api error, got {other}"),
        }
    }
}

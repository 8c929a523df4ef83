use async_trait::async_trait;
use reqwest::{Client, Method, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{RequestError, SourceError};
use crate::model::{normalize_cursor, CatalogObject, CatalogPage, CategoryPage, InventoryCount};

pub const MAX_ATTEMPTS: u32 = 5;
const SEARCH_PAGE_LIMIT: u32 = 100;

/// Read side of the Square API used by the sync.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    /// One page of ITEM objects with their related objects.
    async fn search_items(&self, cursor: Option<&str>) -> Result<CatalogPage, SourceError>;

    /// One page of CATEGORY objects.
    async fn list_categories(&self, cursor: Option<&str>) -> Result<CategoryPage, SourceError>;

    /// A single object by id, with related objects.
    async fn retrieve_object(&self, object_id: &str) -> Result<CatalogPage, SourceError>;

    /// IN_STOCK counts at the configured location for the given variation ids.
    async fn batch_inventory_counts(
        &self,
        object_ids: &[String],
    ) -> Result<Vec<InventoryCount>, SourceError>;
}

#[derive(Clone)]
pub struct SquareClient {
    http: Client,
    base_url: Url,
    token: String,
    version: String,
    location_id: String,
}

impl fmt::Debug for SquareClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SquareClient")
            .field("base_url", &self.base_url)
            .field("version", &self.version)
            .field("location_id", &self.location_id)
            .finish_non_exhaustive()
    }
}

impl SquareClient {
    pub fn from_config(cfg: &Config, timeout: Duration) -> anyhow::Result<Self> {
        let base_url = cfg.square.resolved_base_url()?;
        Self::with_base_url(
            cfg.square.access_token.clone(),
            cfg.square.version.clone(),
            cfg.square.location_id.clone(),
            base_url,
            timeout,
        )
    }

    pub fn with_base_url(
        token: String,
        version: String,
        location_id: String,
        base_url: Url,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let http = Client::builder()
            .user_agent("catalog-sync/0.1")
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            base_url,
            token,
            version,
            location_id,
        })
    }

    /// Endpoint url: each segment is percent-encoded on its own, so ids
    /// cannot escape into the path or query.
    pub fn endpoint(&self, segments: &[&str], query: &[(&str, &str)]) -> Result<Url, RequestError> {
        let mut url = self.base_url.clone();
        {
            let mut path = url.path_segments_mut().map_err(|_| {
                RequestError::Build(format!("base url {} cannot carry a path", self.base_url))
            })?;
            path.pop_if_empty();
            for segment in segments {
                if matches!(*segment, "" | "." | "..") {
                    return Err(RequestError::Build(format!(
                        "invalid path segment {:?}",
                        segment
                    )));
                }
                path.push(segment);
            }
        }
        url.set_query(None);
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query.iter());
        }
        Ok(url)
    }

    pub fn build_request(
        &self,
        method: Method,
        url: Url,
        body: Option<&Value>,
    ) -> Result<reqwest::Request, RequestError> {
        let mut req = self
            .http
            .request(method, url)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Square-Version", &self.version)
            .header("Content-Type", "application/json");
        if let Some(body) = body {
            req = req.json(body);
        }
        req.build().map_err(|e| RequestError::Build(e.to_string()))
    }

    async fn request_json<T: DeserializeOwned>(
        &self,
        method: Method,
        segments: &[&str],
        query: &[(&str, &str)],
        body: Option<&Value>,
    ) -> Result<T, SourceError> {
        let operation = format!("{} /{}", method, segments.join("/"));
        let url = self
            .endpoint(segments, query)
            .map_err(|source| SourceError::Invalid {
                operation: operation.clone(),
                source,
            })?;
        with_retry(&operation, |attempt| {
            let method = method.clone();
            let url = url.clone();
            async move {
                let request = self.build_request(method, url, body)?;
                debug!(url = %request.url(), attempt, "sending square request");
                let res = self
                    .http
                    .execute(request)
                    .await
                    .map_err(RequestError::Transport)?;
                let status = res.status();
                if !status.is_success() {
                    let body = res.text().await.unwrap_or_default();
                    return Err(RequestError::Status { status, body });
                }
                res.json::<T>().await.map_err(RequestError::Decode)
            }
        })
        .await
    }
}

#[async_trait]
impl CatalogSource for SquareClient {
    async fn search_items(&self, cursor: Option<&str>) -> Result<CatalogPage, SourceError> {
        let body = search_items_body(cursor);
        let resp: SearchCatalogResponse = self
            .request_json(Method::POST, &["v2", "catalog", "search"], &[], Some(&body))
            .await?;
        Ok(CatalogPage {
            objects: resp.objects,
            related_objects: resp.related_objects,
            cursor: normalize_cursor(resp.cursor),
        })
    }

    async fn list_categories(&self, cursor: Option<&str>) -> Result<CategoryPage, SourceError> {
        let mut query = vec![("types", "CATEGORY")];
        if let Some(c) = cursor {
            query.push(("cursor", c));
        }
        let resp: ListCatalogResponse = self
            .request_json(Method::GET, &["v2", "catalog", "list"], &query, None)
            .await?;
        Ok(CategoryPage {
            objects: resp.objects,
            cursor: normalize_cursor(resp.cursor),
        })
    }

    async fn retrieve_object(&self, object_id: &str) -> Result<CatalogPage, SourceError> {
        let resp: RetrieveObjectResponse = self
            .request_json(
                Method::GET,
                &["v2", "catalog", "object", object_id],
                &[("include_related_objects", "true")],
                None,
            )
            .await?;
        Ok(CatalogPage {
            objects: resp.object.into_iter().collect(),
            related_objects: resp.related_objects,
            cursor: None,
        })
    }

    async fn batch_inventory_counts(
        &self,
        object_ids: &[String],
    ) -> Result<Vec<InventoryCount>, SourceError> {
        let body = inventory_body(object_ids, &self.location_id);
        let resp: BatchInventoryResponse = self
            .request_json(
                Method::POST,
                &["v2", "inventory", "counts", "batch-retrieve"],
                &[],
                Some(&body),
            )
            .await?;
        Ok(resp.counts)
    }
}

pub fn search_items_body(cursor: Option<&str>) -> Value {
    let mut body = json!({
        "object_types": ["ITEM"],
        "include_related_objects": true,
        "limit": SEARCH_PAGE_LIMIT,
    });
    if let Some(c) = cursor.filter(|c| !c.trim().is_empty()) {
        body["cursor"] = Value::String(c.to_string());
    }
    body
}

pub fn inventory_body(object_ids: &[String], location_id: &str) -> Value {
    json!({
        "catalog_object_ids": object_ids,
        "location_ids": [location_id],
        "states": ["IN_STOCK"],
    })
}

/// Delay after failed `attempt` (1-based). Throttling and server errors
/// back off exponentially, anything else linearly.
pub fn retry_delay(err: &RequestError, attempt: u32) -> Duration {
    if err.is_throttle() {
        let exp = 2u32.saturating_pow(attempt.saturating_sub(1));
        Duration::from_secs_f64((0.75 * f64::from(exp)).min(10.0))
    } else {
        Duration::from_secs_f64((0.25 * f64::from(attempt)).min(5.0))
    }
}

/// Run `call` up to [`MAX_ATTEMPTS`] times, sleeping between failures.
pub async fn with_retry<T, F, Fut>(operation: &str, mut call: F) -> Result<T, SourceError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, RequestError>>,
{
    let mut attempt = 1;
    loop {
        match call(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= MAX_ATTEMPTS => {
                warn!(operation, attempt, error = %err, "square request failed; giving up");
                return Err(SourceError::Unavailable {
                    operation: operation.to_string(),
                    attempts: attempt,
                    last: err,
                });
            }
            Err(err) => {
                let delay = retry_delay(&err, attempt);
                warn!(operation, attempt, error = %err, delay_ms = delay.as_millis() as u64, "square request failed");
                tokio::time::sleep(delay).await;
            }
        }
        attempt += 1;
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SearchCatalogResponse {
    #[serde(default)]
    objects: Vec<CatalogObject>,
    #[serde(default)]
    related_objects: Vec<CatalogObject>,
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ListCatalogResponse {
    #[serde(default)]
    objects: Vec<CatalogObject>,
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RetrieveObjectResponse {
    #[serde(default)]
    object: Option<CatalogObject>,
    #[serde(default)]
    related_objects: Vec<CatalogObject>,
}

#[derive(Debug, Default, Deserialize)]
struct BatchInventoryResponse {
    #[serde(default)]
    counts: Vec<InventoryCount>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Instant;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    fn client_at(base_url: Url) -> SquareClient {
        // Loopback tests must not go through a proxy from the environment.
        let http = Client::builder()
            .no_proxy()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap();
        SquareClient {
            http,
            base_url,
            token: "token".into(),
            version: "2025-10-16".into(),
            location_id: "LOC1".into(),
        }
    }

    fn client() -> SquareClient {
        client_at(Url::parse("https://connect.squareup.com/").unwrap())
    }

    fn status(code: StatusCode) -> RequestError {
        RequestError::Status {
            status: code,
            body: String::new(),
        }
    }

    /// Reads one request off the socket, body included, and returns its
    /// request line.
    async fn read_request(sock: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = sock.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
                continue;
            };
            let head = String::from_utf8_lossy(&buf[..end]).to_string();
            let len = head
                .lines()
                .filter_map(|l| l.split_once(':'))
                .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
                .and_then(|(_, v)| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            while buf.len() < end + 4 + len {
                let n = sock.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            return head.lines().next().unwrap_or_default().to_string();
        }
        String::new()
    }

    /// Local HTTP server answering each connection with the next scripted
    /// response. Returns the base url and the request lines it saw.
    async fn scripted_server(replies: Vec<(u16, &'static str)>) -> (Url, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        tokio::spawn(async move {
            for (code, body) in replies {
                let Ok((mut sock, _)) = listener.accept().await else {
                    return;
                };
                let line = read_request(&mut sock).await;
                log.lock().unwrap().push(line);
                let reply = format!(
                    "HTTP/1.1 {} Scripted\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    code,
                    body.len(),
                    body
                );
                let _ = sock.write_all(reply.as_bytes()).await;
                let _ = sock.shutdown().await;
            }
        });
        (Url::parse(&format!("http://{}/", addr)).unwrap(), seen)
    }

    #[test]
    fn build_request_sets_headers() {
        let body = search_items_body(Some("abc"));
        let c = client();
        let url = c.endpoint(&["v2", "catalog", "search"], &[]).unwrap();
        let request = c.build_request(Method::POST, url, Some(&body)).unwrap();
        assert_eq!(request.method(), Method::POST);
        assert_eq!(request.url().path(), "/v2/catalog/search");
        let headers = request.headers();
        assert_eq!(headers.get("Authorization").unwrap(), "Bearer token");
        assert_eq!(headers.get("Square-Version").unwrap(), "2025-10-16");
        assert_eq!(headers.get("Content-Type").unwrap(), "application/json");
    }

    #[test]
    fn list_request_carries_query() {
        let url = client()
            .endpoint(
                &["v2", "catalog", "list"],
                &[("types", "CATEGORY"), ("cursor", "c 1")],
            )
            .unwrap();
        assert_eq!(url.path(), "/v2/catalog/list");
        assert_eq!(url.query(), Some("types=CATEGORY&cursor=c+1"));
    }

    #[test]
    fn object_id_stays_inside_its_path_segment() {
        let url = client()
            .endpoint(
                &["v2", "catalog", "object", "../list?types=ITEM#"],
                &[("include_related_objects", "true")],
            )
            .unwrap();
        assert_eq!(url.path(), "/v2/catalog/object/..%2Flist%3Ftypes=ITEM%23");
        assert_eq!(url.query(), Some("include_related_objects=true"));
        assert_eq!(url.fragment(), None);
    }

    #[test]
    fn dot_segments_are_rejected() {
        for id in ["..", ".", ""] {
            let err = client()
                .endpoint(&["v2", "catalog", "object", id], &[])
                .unwrap_err();
            assert!(matches!(err, RequestError::Build(_)), "{id:?}");
        }
    }

    #[test]
    fn endpoint_keeps_base_path_prefix() {
        let c = client_at(Url::parse("http://127.0.0.1:9/square/").unwrap());
        let url = c.endpoint(&["v2", "catalog", "search"], &[]).unwrap();
        assert_eq!(url.path(), "/square/v2/catalog/search");
    }

    #[test]
    fn search_body_shape() {
        let body = search_items_body(None);
        assert_eq!(body["object_types"][0], "ITEM");
        assert_eq!(body["include_related_objects"], true);
        assert_eq!(body["limit"], 100);
        assert!(body.get("cursor").is_none());
        assert_eq!(search_items_body(Some("xyz"))["cursor"], "xyz");
    }

    #[test]
    fn inventory_body_shape() {
        let body = inventory_body(&["V1".into(), "V2".into()], "LOC1");
        assert_eq!(body["catalog_object_ids"][1], "V2");
        assert_eq!(body["location_ids"][0], "LOC1");
        assert_eq!(body["states"][0], "IN_STOCK");
    }

    #[test]
    fn backoff_schedule() {
        let throttled = status(StatusCode::TOO_MANY_REQUESTS);
        let failed = RequestError::Build("reset".into());
        assert_eq!(retry_delay(&throttled, 1), Duration::from_millis(750));
        assert_eq!(retry_delay(&throttled, 2), Duration::from_millis(1500));
        assert_eq!(retry_delay(&throttled, 4), Duration::from_secs(6));
        assert_eq!(retry_delay(&throttled, 5), Duration::from_secs(10));
        assert_eq!(retry_delay(&failed, 1), Duration::from_millis(250));
        assert_eq!(retry_delay(&failed, 3), Duration::from_millis(750));
        assert_eq!(retry_delay(&failed, 40), Duration::from_secs(5));
    }

    #[test]
    fn status_codes_pick_backoff_branch() {
        for code in [429, 500, 502, 503, 504] {
            let err = status(StatusCode::from_u16(code).unwrap());
            assert!(err.is_throttle(), "{code}");
            assert_eq!(retry_delay(&err, 3), Duration::from_secs(3), "{code}");
        }
        for code in [400, 401, 403, 404, 409, 501] {
            let err = status(StatusCode::from_u16(code).unwrap());
            assert!(!err.is_throttle(), "{code}");
            assert_eq!(retry_delay(&err, 3), Duration::from_millis(750), "{code}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retry_recovers_after_throttling() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let out = with_retry("POST /v2/catalog/search", move |attempt| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if attempt < 3 {
                    Err(status(StatusCode::TOO_MANY_REQUESTS))
                } else {
                    Ok("page")
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(out, "page");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_gives_up_with_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let err = with_retry::<(), _, _>("GET /v2/catalog/list", move |attempt| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(RequestError::Build(format!("boom {}", attempt)))
            }
        })
        .await
        .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), MAX_ATTEMPTS);
        let SourceError::Unavailable {
            operation,
            attempts,
            last,
        } = err
        else {
            panic!("expected Unavailable");
        };
        assert_eq!(operation, "GET /v2/catalog/list");
        assert_eq!(attempts, 5);
        assert_eq!(last.to_string(), "invalid request: boom 5");
    }

    // Real clock: a paused clock would fire the client timeout while the
    // socket is idle.
    #[tokio::test]
    async fn throttled_response_is_retried_after_exponential_delay() {
        let (base, seen) = scripted_server(vec![
            (429, r#"{"errors":[{"code":"RATE_LIMITED"}]}"#),
            (200, r#"{"objects":[{"type":"CATEGORY","id":"C1"}],"cursor":""}"#),
        ])
        .await;
        let started = Instant::now();
        let page = client_at(base).list_categories(None).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(750));
        assert_eq!(page.objects.len(), 1);
        assert_eq!(page.cursor, None);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].starts_with("GET /v2/catalog/list?types=CATEGORY "));
    }

    #[tokio::test]
    async fn client_errors_back_off_linearly_then_give_up() {
        let (base, seen) = scripted_server(vec![(400, r#"{"errors":[]}"#); 5]).await;
        let started = Instant::now();
        let err = client_at(base).search_items(None).await.unwrap_err();
        let elapsed = started.elapsed();
        // 250 + 500 + 750 + 1000 ms; the exponential branch would need 11.25 s
        assert!(elapsed >= Duration::from_millis(2500), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(8), "{elapsed:?}");
        assert_eq!(seen.lock().unwrap().len(), 5);
        assert_eq!(err.status(), Some(StatusCode::BAD_REQUEST));
        let SourceError::Unavailable {
            operation,
            attempts,
            last,
        } = err
        else {
            panic!("expected Unavailable");
        };
        assert_eq!(operation, "POST /v2/catalog/search");
        assert_eq!(attempts, MAX_ATTEMPTS);
        assert!(matches!(last, RequestError::Status { ref body, .. } if body == r#"{"errors":[]}"#));
    }

    #[tokio::test]
    async fn undecodable_body_is_retried() {
        let (base, seen) = scripted_server(vec![
            (200, "<html>maintenance</html>"),
            (200, r#"{"counts":[{"catalog_object_id":"V1","quantity":"4"}]}"#),
        ])
        .await;
        let started = Instant::now();
        let counts = client_at(base)
            .batch_inventory_counts(&["V1".into()])
            .await
            .unwrap();
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(250), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(750), "{elapsed:?}");
        assert_eq!(counts.len(), 1);
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn retrieve_escapes_object_id_on_the_wire() {
        let (base, seen) = scripted_server(vec![(200, r#"{"related_objects":[]}"#)]).await;
        let page = client_at(base)
            .retrieve_object("../list?types=ITEM#")
            .await
            .unwrap();
        assert!(page.objects.is_empty());
        let seen = seen.lock().unwrap();
        assert_eq!(
            seen[0],
            "GET /v2/catalog/object/..%2Flist%3Ftypes=ITEM%23?include_related_objects=true HTTP/1.1"
        );
    }

    #[tokio::test]
    async fn dot_object_id_fails_without_a_request() {
        let (base, seen) = scripted_server(vec![]).await;
        let err = client_at(base).retrieve_object("..").await.unwrap_err();
        assert!(matches!(err, SourceError::Invalid { .. }));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn decodes_search_response() {
        let raw = serde_json::json!({
            "objects": [{"type": "ITEM", "id": "I1", "item_data": {"name": "A"}}],
            "related_objects": [{"type": "IMAGE", "id": "IMG", "image_data": {"url": "https://img/x.jpg"}}],
            "cursor": ""
        });
        let resp: SearchCatalogResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(resp.objects.len(), 1);
        assert_eq!(resp.related_objects.len(), 1);
        assert_eq!(normalize_cursor(resp.cursor), None);
    }
}

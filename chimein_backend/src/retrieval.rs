use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::engagement::{KnowledgeHit, RetrievalOracle};

/// Client for the knowledge-base search service.
#[derive(Clone)]
pub struct HttpRetrievalClient {
    search_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct SearchRequest<'a> {
    query: &'a str,
    top_k: usize,
    generate_answer: bool,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    data: Option<SearchData>,
}

#[derive(Debug, Default, Deserialize)]
struct SearchData {
    #[serde(default)]
    hits: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    #[serde(default)]
    chunk: String,
    #[serde(default)]
    score: f64,
    #[serde(default)]
    source: Option<String>,
}

impl HttpRetrievalClient {
    pub fn new(base_url: &str, client: reqwest::Client) -> Self {
        Self {
            search_url: search_url(base_url),
            client,
        }
    }
}

#[async_trait]
impl RetrievalOracle for HttpRetrievalClient {
    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<KnowledgeHit>> {
        let response = self
            .client
            .post(&self.search_url)
            .json(&SearchRequest {
                query,
                top_k,
                generate_answer: false,
            })
            .send()
            .await
            .with_context(|| format!("Failed to reach retrieval service at {}", self.search_url))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("Retrieval service returned {}: {}", status, body);
        }

        let parsed: SearchResponse = response
            .json()
            .await
            .context("Failed to parse retrieval response")?;
        if !parsed.ok {
            bail!(
                "Retrieval service reported failure: {}",
                parsed.error.unwrap_or_else(|| "unknown error".to_string())
            );
        }

        Ok(parsed
            .data
            .unwrap_or_default()
            .hits
            .into_iter()
            .map(|hit| KnowledgeHit {
                text: hit.chunk,
                score: hit.score,
                source: hit.source,
            })
            .collect())
    }
}

fn search_url(base_url: &str) -> String {
    let trimmed = base_url.trim().trim_end_matches('/');
    if trimmed.ends_with("/rag/search") {
        trimmed.to_string()
    } else if trimmed.ends_with("/rag") {
        format!("{}/search", trimmed)
    } else {
        format!("{}/rag/search", trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::post, Json, Router};
    use serde_json::{json, Value};

    async fn spawn_stub(reply: Value) -> String {
        let app = Router::new().route(
            "/rag/search",
            post(move |Json(body): Json<Value>| {
                let reply = reply.clone();
                async move {
                    assert_eq!(body["generate_answer"], false);
                    assert_eq!(body["top_k"], 3);
                    Json(reply)
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{}", addr)
    }

    fn client(url: &str) -> HttpRetrievalClient {
        HttpRetrievalClient::new(
            url,
            crate::http_client::build_http_client().expect("http client"),
        )
    }

    #[test]
    fn builds_search_url_from_any_base() {
        assert_eq!(search_url("http://kb:8000"), "http://kb:8000/rag/search");
        assert_eq!(search_url("http://kb:8000/rag/"), "http://kb:8000/rag/search");
        assert_eq!(search_url("http://kb:8000/rag/search"), "http://kb:8000/rag/search");
    }

    #[tokio::test]
    async fn maps_hits_from_envelope() {
        let url = spawn_stub(json!({
            "ok": true,
            "data": {"hits": [
                {"chunk": "Comets have tails.", "score": 0.91, "source": "astro.md", "chunk_id": 4},
                {"chunk": "Glordon likes snacks.", "score": 0.5}
            ]}
        }))
        .await;

        let hits = client(&url).search("Elio comet", 3).await.expect("hits");
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].text, "Comets have tails.");
        assert_eq!(hits[0].source.as_deref(), Some("astro.md"));
        assert!(hits[1].source.is_none());
    }

    #[tokio::test]
    async fn not_ok_envelope_is_an_error() {
        let url = spawn_stub(json!({"ok": false, "error": "index not built"})).await;
        let err = client(&url).search("x", 3).await.expect_err("should fail");
        assert!(format!("{:#}", err).contains("index not built"));
    }
}

//! Minimal REST client for the upstream column store (Stargate-style
//! gateway in front of Cassandra). Used for the bootstrap paged scan, the
//! CDC worker's vector upsert, and the query path's page-body fetch.

use std::time::Duration;

use backoff::{future::retry, ExponentialBackoff};
use serde::{Deserialize, Serialize};

use crate::config::VECTOR_DIM;
use crate::error::{AppError, AppResult};

const READ_TIMEOUT: Duration = Duration::from_secs(5);
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_ELAPSED: Duration = Duration::from_secs(15);

#[derive(Deserialize)]
struct PageRow {
    body: Option<String>,
}

#[derive(Deserialize)]
struct VectorRow {
    page_id: Option<String>,
    vector: Option<Vec<f32>>,
}

#[derive(Deserialize)]
struct PagedResponse {
    data: Vec<VectorRow>,
    #[serde(rename = "pageState")]
    page_state: Option<String>,
}

#[derive(Serialize)]
struct VectorPutBody<'a> {
    vector: &'a [f32],
}

pub struct UpstreamClient {
    http: reqwest::Client,
    base_url: String,
    keyspace: String,
    auth_token: Option<String>,
}

impl UpstreamClient {
    pub fn new(base_url: String, keyspace: String, auth_token: Option<String>) -> Self {
        let http = reqwest::Client::builder()
            .build()
            .expect("failed to build reqwest client");
        Self { http, base_url, keyspace, auth_token }
    }

    fn apply_auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_token {
            Some(token) => builder.header("X-Cassandra-Token", token).bearer_auth(token),
            None => builder,
        }
    }

    /// Fetch a page's body. `Ok(None)` on 404; retries transport/5xx errors.
    pub async fn get_page_body(&self, page_id: &str) -> AppResult<Option<String>> {
        let url = format!(
            "{}/v2/keyspaces/{}/pages/{}",
            self.base_url, self.keyspace, page_id
        );

        let backoff = read_backoff();
        retry(backoff, || async {
            let response = self
                .apply_auth(self.http.get(&url).timeout(READ_TIMEOUT))
                .send()
                .await
                .map_err(|e| backoff::Error::transient(AppError::UpstreamError(e.to_string())))?;

            if response.status() == reqwest::StatusCode::NOT_FOUND {
                return Ok(None);
            }
            if response.status().is_client_error() {
                return Err(backoff::Error::permanent(AppError::ClientError(format!(
                    "upstream returned {}",
                    response.status()
                ))));
            }
            if response.status().is_server_error() {
                return Err(backoff::Error::transient(AppError::UpstreamError(format!(
                    "upstream returned {}",
                    response.status()
                ))));
            }

            let row: PageRow = response
                .json()
                .await
                .map_err(|e| backoff::Error::permanent(AppError::UpstreamError(e.to_string())))?;
            Ok(row.body)
        })
        .await
    }

    /// Upsert a single page's vector.
    pub async fn put_vector(&self, page_id: &str, vector: &[f32]) -> AppResult<()> {
        let url = format!(
            "{}/v2/keyspaces/{}/page_vectors/{}",
            self.base_url, self.keyspace, page_id
        );
        let body = VectorPutBody { vector };

        let backoff = write_backoff();
        retry(backoff, || async {
            let response = self
                .apply_auth(self.http.put(&url).timeout(WRITE_TIMEOUT).json(&body))
                .send()
                .await
                .map_err(|e| backoff::Error::transient(AppError::UpstreamError(e.to_string())))?;

            if response.status().is_success() {
                return Ok(());
            }
            if response.status().is_client_error() {
                return Err(backoff::Error::permanent(AppError::ClientError(format!(
                    "upstream rejected vector upsert: {}",
                    response.status()
                ))));
            }
            Err(backoff::Error::transient(AppError::UpstreamError(format!(
                "upstream vector upsert failed: {}",
                response.status()
            ))))
        })
        .await
    }

    /// Page through the entire `page_vectors` table, invoking `on_page` for
    /// each batch. Stops when the upstream stops returning a continuation
    /// token.
    pub async fn paged_scan_vectors<F>(&self, page_size: usize, mut on_page: F) -> AppResult<usize>
    where
        F: FnMut(Vec<(String, Vec<f32>)>),
    {
        let url = format!("{}/v2/keyspaces/{}/page_vectors", self.base_url, self.keyspace);
        let mut page_state: Option<String> = None;
        let mut total = 0usize;

        loop {
            let mut query = vec![("page-size".to_string(), page_size.to_string())];
            if let Some(state) = &page_state {
                query.push(("page-state".to_string(), state.clone()));
            }

            let response = self
                .apply_auth(self.http.get(&url).timeout(READ_TIMEOUT).query(&query))
                .send()
                .await
                .map_err(|e| AppError::UpstreamError(e.to_string()))?;

            if !response.status().is_success() {
                return Err(AppError::UpstreamError(format!(
                    "paged scan failed: {}",
                    response.status()
                )));
            }

            let page: PagedResponse = response
                .json()
                .await
                .map_err(|e| AppError::UpstreamError(e.to_string()))?;

            if page.data.is_empty() {
                break;
            }

            let batch: Vec<(String, Vec<f32>)> = page
                .data
                .into_iter()
                .filter_map(|row| {
                    let page_id = row.page_id?;
                    let vector = row.vector?;
                    if vector.len() == VECTOR_DIM {
                        total += 1;
                        Some((page_id, vector))
                    } else {
                        None
                    }
                })
                .collect();
            on_page(batch);

            match page.page_state {
                Some(state) if !state.is_empty() => page_state = Some(state),
                _ => break,
            }
        }

        Ok(total)
    }
}

fn read_backoff() -> ExponentialBackoff {
    ExponentialBackoff {
        max_elapsed_time: Some(MAX_ELAPSED),
        initial_interval: Duration::from_secs(1),
        max_interval: Duration::from_secs(10),
        ..Default::default()
    }
}

fn write_backoff() -> ExponentialBackoff {
    read_backoff()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn construct_client() {
        let client = UpstreamClient::new("http://localhost:8080".into(), "gibsey".into(), None);
        assert_eq!(client.keyspace, "gibsey");
    }
}

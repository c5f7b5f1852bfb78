use std::time::Duration;

use serde::Deserialize;

use crate::error::ExecutionError;

/// Where build recipes come from.
#[tonic::async_trait]
pub trait RecipeSource: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, ExecutionError>;
}

/// Largest recipe body accepted by default
pub const MAX_RECIPE_BYTES: usize = 1 << 20;

/// Plain HTTP GET retrieval. Anything but a 2xx response is a failure, and so
/// is a body larger than `max_bytes`.
#[derive(Debug, Clone)]
pub struct HttpRecipeSource {
    client: reqwest::Client,
    max_bytes: usize,
}

impl HttpRecipeSource {
    pub fn new(timeout: Duration) -> Result<Self, ExecutionError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ExecutionError::Fetch(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            max_bytes: MAX_RECIPE_BYTES,
        })
    }

    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    fn too_large(&self, url: &str) -> ExecutionError {
        ExecutionError::Fetch(format!(
            "GET {}: body exceeds {} bytes",
            url, self.max_bytes
        ))
    }
}

#[tonic::async_trait]
impl RecipeSource for HttpRecipeSource {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, ExecutionError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ExecutionError::Fetch(format!("GET {}: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ExecutionError::Fetch(format!(
                "GET {} returned {}",
                url, status
            )));
        }

        if let Some(len) = response.content_length() {
            if len > self.max_bytes as u64 {
                return Err(self.too_large(url));
            }
        }

        // chunked bodies carry no length up front
        let mut response = response;
        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| ExecutionError::Fetch(format!("GET {}: reading body: {}", url, e)))?
        {
            if body.len() + chunk.len() > self.max_bytes {
                return Err(self.too_large(url));
            }
            body.extend_from_slice(&chunk);
        }
        tracing::debug!(url, bytes = body.len(), "Fetched build recipe");
        Ok(body)
    }
}

#[derive(Deserialize)]
struct TaskDocument {
    #[serde(alias = "dockerfile_url")]
    recipe_url: String,
}

/// Extract the recipe URL from a task payload.
///
/// The payload is either the URL itself or a JSON object carrying
/// `recipe_url` (or `dockerfile_url`).
pub fn recipe_url(task: &str) -> Result<String, ExecutionError> {
    let task = task.trim();
    if task.is_empty() {
        return Err(ExecutionError::Fetch("task payload is empty".to_string()));
    }
    if task.starts_with('{') {
        let doc: TaskDocument = serde_json::from_str(task)
            .map_err(|e| ExecutionError::Fetch(format!("invalid task payload: {}", e)))?;
        return Ok(doc.recipe_url);
    }
    Ok(task.to_string())
}

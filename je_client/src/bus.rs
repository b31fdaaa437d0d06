use std::io;

use async_trait::async_trait;
use je_lib::MessageBus;
use tracing::error;

/// Message bus reached over HTTP: a message is the body of a POST to `<uri>/<topic>`.
pub struct HttpMessageBus {
    uri: String,
    http: reqwest::Client,
}

impl HttpMessageBus {
    pub fn new(uri: &str) -> Self {
        Self {
            uri: uri.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl MessageBus for HttpMessageBus {
    async fn publish(&self, topic: &str, message: String) -> io::Result<()> {
        let url = format!("{}/{}", self.uri, topic);
        let response = self
            .http
            .post(&url)
            .body(message)
            .send()
            .await
            .map_err(|err| {
                error!("error publishing to {}: {}", url, err);
                io::Error::other(err)
            })?;
        if !response.status().is_success() {
            return Err(io::Error::other(format!(
                "unexpected response {} from POST {}",
                response.status(),
                url
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use httpmock::prelude::*;
    use je_lib::{Error, JobPool, JobSpec, MemoryDataStore, MemoryJobStore, MessageBusQueue};

    use super::HttpMessageBus;

    #[tokio::test]
    async fn test_publish_posts_snapshot_to_topic() {
        let server = MockServer::start_async().await;
        let topic = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/echo")
                    .body_includes("\"state\":\"WAITING\"");
                then.status(200);
            })
            .await;
        let pool = JobPool::new(
            Arc::new(MemoryJobStore::new()),
            Arc::new(MemoryDataStore::new()),
        );
        let job = pool.submit(JobSpec::new("echo", &["hi"])).await.unwrap();
        let queue = MessageBusQueue::new(HttpMessageBus::new(&server.base_url()));
        queue.publish(&job).await.unwrap();
        topic.assert_async().await;
    }

    #[tokio::test]
    async fn test_publish_rejected() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/ls");
                then.status(503);
            })
            .await;
        let pool = JobPool::new(
            Arc::new(MemoryJobStore::new()),
            Arc::new(MemoryDataStore::new()),
        );
        let job = pool.create(JobSpec::new("ls", &[])).await.unwrap();
        let queue = MessageBusQueue::new(HttpMessageBus::new(&server.base_url()));
        assert!(matches!(
            queue.publish(&job).await,
            Err(Error::Bus { .. })
        ));
    }
}

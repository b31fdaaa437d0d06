use std::time::Duration;

use je_data::{JobId, JobSnapshot, State};
use reqwest::{
    blocking::{self, Response},
    header::CONTENT_TYPE,
    Method, StatusCode,
};
use thiserror::Error;
use tracing::{debug, error};

const JSON_CONTENT_TYPE: &str = "application/json";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ClientError {
    /// The request never produced a usable response: connection failure,
    /// timeout or a body that could not be decoded.
    #[error("error sending request to {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("unexpected response {status} from {method} {url}")]
    Remote {
        method: String,
        url: String,
        status: String,
    },
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SearchFilter {
    pub id: Option<JobId>,
    pub name: Option<String>,
    pub state: Option<State>,
    pub worker: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SearchOptions {
    pub filter: SearchFilter,
}

impl SearchOptions {
    fn query(&self) -> Vec<(&'static str, String)> {
        let filter = &self.filter;
        let mut query = Vec::new();
        if let Some(id) = filter.id {
            query.push(("id", id.to_string()));
        }
        if let Some(name) = &filter.name {
            query.push(("name", name.clone()));
        }
        if let Some(state) = filter.state {
            query.push(("state", state.as_str().to_string()));
        }
        if let Some(worker) = &filter.worker {
            query.push(("worker", worker.clone()));
        }
        query
    }
}

/// Blocking client for the query API of a remote job engine.
pub struct Client {
    url: String,
    http: blocking::Client,
}

impl Client {
    pub fn new(url: &str) -> Result<Self, ClientError> {
        Self::with_timeout(url, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(url: &str, timeout: Duration) -> Result<Self, ClientError> {
        let url = url.trim_end_matches('/').to_string();
        let http = blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|source| ClientError::Transport {
                url: url.clone(),
                source,
            })?;
        Ok(Self { url, http })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// returns the matching job by id, an unknown id yields an empty list
    pub fn get_job_by_id(&self, id: JobId) -> Result<Vec<JobSnapshot>, ClientError> {
        self.search(&SearchOptions {
            filter: SearchFilter {
                id: Some(id),
                ..SearchFilter::default()
            },
        })
    }

    pub fn search(&self, options: &SearchOptions) -> Result<Vec<JobSnapshot>, ClientError> {
        let url = format!("{}/search", self.url);
        self.request(Method::GET, &url, &options.query())
    }

    fn request(
        &self,
        method: Method,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<JobSnapshot>, ClientError> {
        let transport = |source: reqwest::Error| {
            error!("error sending request to {}: {}", url, source);
            ClientError::Transport {
                url: url.to_string(),
                source,
            }
        };
        let response = self
            .http
            .request(method.clone(), url)
            .query(query)
            .send()
            .map_err(transport)?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(Vec::new()),
            StatusCode::OK if is_json(&response) => response.json().map_err(transport),
            StatusCode::OK => {
                debug!("ignoring non-json response from {}", url);
                Ok(Vec::new())
            }
            status => {
                let err = ClientError::Remote {
                    method: method.to_string(),
                    url: url.to_string(),
                    status: status.to_string(),
                };
                error!("{}", err);
                Err(err)
            }
        }
    }
}

fn is_json(response: &Response) -> bool {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.starts_with(JSON_CONTENT_TYPE))
        .unwrap_or(false)
}

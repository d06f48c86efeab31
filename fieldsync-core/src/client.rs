use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api {
        status: StatusCode,
        body: String,
        retry_after: Option<u64>,
    },
}

/// Coarse classification of a remote failure, derived from the HTTP status.
/// The sync engine retries `RateLimit` and `Transient` through its backoff
/// table and exhausts `Permanent` (validation) failures immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

impl RemoteError {
    pub fn classification(&self) -> Option<ErrorClass> {
        match self {
            RemoteError::Api { status, .. } => Some(classify_api_status(*status)),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            Some(ErrorClass::RateLimit | ErrorClass::Transient | ErrorClass::Auth)
        )
    }

    /// Server-requested delay from a `Retry-After` header, if any.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            RemoteError::Api { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

fn classify_api_status(status: StatusCode) -> ErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ErrorClass::RateLimit
    } else if status.is_server_error()
        || matches!(status, StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_EARLY)
    {
        ErrorClass::Transient
    } else {
        ErrorClass::Permanent
    }
}

#[derive(Clone)]
pub struct RemoteClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl RemoteClient {
    pub fn new(base_url: &str, token: impl Into<String>) -> Result<Self, RemoteError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            token: token.into(),
        })
    }

    /// Fetches the authoritative slice of one mirrored table. `table` is the
    /// URL path segment for the entity kind (e.g. `welds`, `photo-surveys`);
    /// `since` requests an incremental slice keyed by the server-side change
    /// marker when the caller has one.
    pub async fn fetch_entities(
        &self,
        project_id: &str,
        table: &str,
        since: Option<i64>,
    ) -> Result<Vec<RemoteEntity>, RemoteError> {
        let mut url = self.endpoint(&format!("/api/v1/projects/{project_id}/{table}"))?;
        if let Some(since) = since {
            url.query_pairs_mut()
                .append_pair("since", &since.to_string());
        }
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        let page: EntityPage = Self::handle_response(response).await?;
        Ok(page.items)
    }

    pub async fn execute_weld(
        &self,
        project_id: &str,
        request: &ExecuteWeldRequest,
    ) -> Result<SubmitAck, RemoteError> {
        let url = self.endpoint(&format!(
            "/api/v1/projects/{project_id}/welds/{}/execute",
            request.weld_id
        ))?;
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .json(request)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn create_photo_survey(
        &self,
        project_id: &str,
        request: &CreatePhotoSurveyRequest,
    ) -> Result<SubmitAck, RemoteError> {
        let url = self.endpoint(&format!("/api/v1/projects/{project_id}/photo-surveys"))?;
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .json(request)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn update_spool_phase(
        &self,
        project_id: &str,
        request: &UpdateSpoolPhaseRequest,
    ) -> Result<SubmitAck, RemoteError> {
        let url = self.endpoint(&format!(
            "/api/v1/projects/{project_id}/spools/{}/phase",
            request.spool_id
        ))?;
        let response = self
            .http
            .patch(url)
            .bearer_auth(&self.token)
            .json(request)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn update_weld_status(
        &self,
        project_id: &str,
        request: &UpdateWeldStatusRequest,
    ) -> Result<SubmitAck, RemoteError> {
        let url = self.endpoint(&format!(
            "/api/v1/projects/{project_id}/welds/{}/status",
            request.weld_id
        ))?;
        let response = self
            .http
            .patch(url)
            .bearer_auth(&self.token)
            .json(request)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn create_daily_report(
        &self,
        project_id: &str,
        request: &CreateDailyReportRequest,
    ) -> Result<SubmitAck, RemoteError> {
        let url = self.endpoint(&format!("/api/v1/projects/{project_id}/daily-reports"))?;
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .json(request)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    fn endpoint(&self, path: &str) -> Result<Url, RemoteError> {
        Ok(self.base_url.join(path)?)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, RemoteError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            let status = response.status();
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.parse::<u64>().ok());
            let body = response.text().await.unwrap_or_default();
            Err(RemoteError::Api {
                status,
                body,
                retry_after,
            })
        }
    }
}

/// One row of an authoritative table as returned by a fetch. `data` is the
/// domain record itself; the engine treats it as an opaque JSON object.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RemoteEntity {
    pub id: String,
    pub updated_at: i64,
    pub data: Value,
}

#[derive(Debug, Deserialize, Serialize)]
struct EntityPage {
    items: Vec<RemoteEntity>,
}

/// Acknowledgement of an applied mutation.
#[derive(Debug, Deserialize, Serialize)]
pub struct SubmitAck {
    pub id: String,
    #[serde(default)]
    pub updated_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ExecuteWeldRequest {
    pub weld_id: String,
    pub welder_id: String,
    pub executed_on: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CreatePhotoSurveyRequest {
    pub survey_id: String,
    pub spool_id: String,
    pub taken_on: String,
    /// Reference to the compressed image blob; produced upstream, opaque here.
    pub photo_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct UpdateSpoolPhaseRequest {
    pub spool_id: String,
    pub phase: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct UpdateWeldStatusRequest {
    pub weld_id: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CreateDailyReportRequest {
    pub report_id: String,
    pub crew_id: String,
    pub report_date: String,
    pub body: String,
}

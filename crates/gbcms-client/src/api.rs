use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use gbcms_core::{
    ClientConfig, ClientError, GraphData, LogEntry, NewProject, Project, ProjectArchive,
    SettingsUpdate, UserProfile,
};
use reqwest::{multipart, Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

const MAX_ERROR_BODY_CHARS: usize = 200;

/// Request/response endpoints of the GBCMS server.
pub trait Api: Send + Sync + 'static {
    fn list_projects(&self) -> BoxFuture<'_, Result<Vec<Project>, ClientError>>;
    fn create_project(&self, project: NewProject) -> BoxFuture<'_, Result<Project, ClientError>>;
    fn import_project(&self, archive: ProjectArchive)
        -> BoxFuture<'_, Result<Project, ClientError>>;
    fn fetch_logs(&self) -> BoxFuture<'_, Result<Vec<LogEntry>, ClientError>>;
    fn fetch_user(&self) -> BoxFuture<'_, Result<UserProfile, ClientError>>;
    fn update_user_settings(
        &self,
        update: SettingsUpdate,
    ) -> BoxFuture<'_, Result<UserProfile, ClientError>>;
    fn fetch_graph(&self) -> BoxFuture<'_, Result<GraphData, ClientError>>;
}

pub struct HttpApi {
    client: Client,
    config: ClientConfig,
    token: Option<String>,
}

impl HttpApi {
    pub fn new(config: &ClientConfig) -> Result<Self, ClientError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|err| ClientError::Config(format!("http client: {err}")))?;
        Ok(Self {
            client,
            config: config.clone(),
            token: None,
        })
    }

    pub fn with_bearer_token(mut self, token: Option<String>) -> Self {
        self.token = token.filter(|t| !t.trim().is_empty());
        self
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let url = self.config.endpoint(path)?;
        self.execute(self.client.get(url)).await
    }

    async fn execute<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ClientError> {
        let request = match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };
        let response = request.send().await.map_err(network_error)?;
        let status = response.status();
        debug!(status = status.as_u16(), url = %response.url(), "api_response");
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = error_message(status, &body);
            warn!("api_request_failed: status={status} message={message}");
            return Err(ClientError::RequestFailed {
                status: Some(status.as_u16()),
                message,
            });
        }
        response
            .json::<T>()
            .await
            .map_err(|err| ClientError::Decode(err.to_string()))
    }
}

impl Api for HttpApi {
    fn list_projects(&self) -> BoxFuture<'_, Result<Vec<Project>, ClientError>> {
        self.get("api/projects").boxed()
    }

    fn create_project(&self, project: NewProject) -> BoxFuture<'_, Result<Project, ClientError>> {
        async move {
            let url = self.config.endpoint("api/projects")?;
            self.execute(self.client.post(url).json(&project)).await
        }
        .boxed()
    }

    fn import_project(
        &self,
        archive: ProjectArchive,
    ) -> BoxFuture<'_, Result<Project, ClientError>> {
        async move {
            let url = self.config.endpoint("api/projects/import")?;
            let part = multipart::Part::bytes(archive.bytes).file_name(archive.file_name);
            let form = multipart::Form::new().part("file", part);
            self.execute(self.client.post(url).multipart(form)).await
        }
        .boxed()
    }

    fn fetch_logs(&self) -> BoxFuture<'_, Result<Vec<LogEntry>, ClientError>> {
        self.get("api/logs").boxed()
    }

    fn fetch_user(&self) -> BoxFuture<'_, Result<UserProfile, ClientError>> {
        self.get("api/user").boxed()
    }

    fn update_user_settings(
        &self,
        update: SettingsUpdate,
    ) -> BoxFuture<'_, Result<UserProfile, ClientError>> {
        async move {
            let url = self.config.endpoint("api/user/settings")?;
            self.execute(self.client.patch(url).json(&update)).await
        }
        .boxed()
    }

    fn fetch_graph(&self) -> BoxFuture<'_, Result<GraphData, ClientError>> {
        self.get("api/graph").boxed()
    }
}

fn network_error(err: reqwest::Error) -> ClientError {
    if err.is_timeout() {
        return ClientError::Timeout(err.to_string());
    }
    ClientError::RequestFailed {
        status: err.status().map(|s| s.as_u16()),
        message: err.to_string(),
    }
}

/// Picks the most useful human-readable text out of an error response:
/// `message`, then `detail`, then `error`, then a short raw body, then the
/// status reason.
pub(crate) fn error_message(status: StatusCode, body: &str) -> String {
    let parsed = serde_json::from_str::<Value>(body).ok();
    if let Some(value) = &parsed {
        for key in ["message", "detail", "error"] {
            match value.get(key) {
                Some(Value::String(text)) if !text.trim().is_empty() => return text.clone(),
                Some(Value::String(_)) | Some(Value::Null) | None => {}
                Some(other) => return other.to_string(),
            }
        }
    }
    let trimmed = body.trim();
    if parsed.is_none()
        && !trimmed.is_empty()
        && trimmed.chars().count() <= MAX_ERROR_BODY_CHARS
        && !trimmed.starts_with('<')
    {
        return trimmed.to_string();
    }
    status
        .canonical_reason()
        .map(|reason| reason.to_string())
        .unwrap_or_else(|| status.to_string())
}

use anyhow::Context;

/// Client for the platform's control-plane API, used to authorize capture
/// requests and to resolve where application instances run. Every call is
/// authorized with the caller's own token; nothing is cached or persisted.
pub struct ControlPlane {
    http: reqwest::Client,
    base_url: url::Url,
}

#[derive(Debug, serde::Deserialize)]
struct RootDocument {
    links: RootLinks,
}

#[derive(Debug, serde::Deserialize)]
struct RootLinks {
    cloud_controller_v3: Link,
}

#[derive(Debug, serde::Deserialize)]
struct Link {
    href: url::Url,
}

#[derive(Debug, serde::Deserialize)]
struct AppRecord {
    guid: String,
    #[serde(default)]
    name: String,
}

#[derive(Debug, serde::Deserialize)]
struct ProcessStats {
    resources: Vec<ProcessInstance>,
}

#[derive(Debug, serde::Deserialize)]
struct ProcessInstance {
    #[serde(rename = "type")]
    type_: String,
    index: u32,
    host: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ResolverError {
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
    #[error("expected status 200 from {url} but got {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },
    #[error("requested application {requested} but the control-plane returned {returned} ({name})")]
    IdentifierMismatch {
        requested: String,
        returned: String,
        name: String,
    },
    #[error("expected at least {wanted} stats entries for application {app_id} but got {got}")]
    UndersizedStats {
        app_id: String,
        wanted: usize,
        got: usize,
    },
    #[error("no process with index {index} of type {process_type} for application {app_id}")]
    NoSuchProcess {
        app_id: String,
        index: u32,
        process_type: String,
    },
}

impl ControlPlane {
    /// Discover the control-plane base URL from the platform root document.
    /// Called once at startup.
    pub async fn discover(http: reqwest::Client, root: url::Url) -> anyhow::Result<Self> {
        tracing::info!(%root, "discovering control-plane endpoints");

        let response = http
            .get(root.clone())
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .with_context(|| format!("fetching the platform root document from {root}"))?;
        let doc: RootDocument = response
            .json()
            .await
            .context("parsing the platform root document")?;

        Ok(Self::with_base_url(http, doc.links.cloud_controller_v3.href))
    }

    /// Construct directly against a known base URL.
    pub fn with_base_url(http: reqwest::Client, base_url: url::Url) -> Self {
        Self { http, base_url }
    }

    pub fn base_url(&self) -> &url::Url {
        &self.base_url
    }

    /// Whether the application record is visible to the presented token.
    ///
    /// `Ok(true)` requires both a success status and that the returned
    /// record's identifier exactly matches the requested one: a success
    /// response naming a different resource is a trust failure, not a
    /// visible application. A 404 or 403 from the control-plane is the
    /// explicit "not visible" answer; other failures are resolver errors.
    pub async fn is_visible(&self, app_id: &str, token: &str) -> Result<bool, ResolverError> {
        let url = format!("{}/apps/{}", self.base_url, app_id);
        tracing::debug!(app_id, %url, "checking application visibility");

        let response = self
            .http
            .get(&url)
            .header(reqwest::header::AUTHORIZATION, token)
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::FORBIDDEN {
            return Ok(false);
        }
        if status != reqwest::StatusCode::OK {
            return Err(ResolverError::Status { url, status });
        }

        let record: AppRecord = response.json().await?;
        if record.guid != app_id {
            return Err(ResolverError::IdentifierMismatch {
                requested: app_id.to_string(),
                returned: record.guid,
                name: record.name,
            });
        }

        Ok(true)
    }

    /// Resolve the routable host of one (application, index, process type)
    /// instance from the control-plane's process stats.
    pub async fn resolve_location(
        &self,
        app_id: &str,
        index: u32,
        process_type: &str,
        token: &str,
    ) -> Result<String, ResolverError> {
        let url = format!(
            "{}/apps/{}/processes/{}/stats",
            self.base_url, app_id, process_type
        );
        tracing::debug!(app_id, index, process_type, %url, "resolving instance location");

        let response = self
            .http
            .get(&url)
            .header(reqwest::header::AUTHORIZATION, token)
            .send()
            .await?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(ResolverError::Status { url, status });
        }
        let stats: ProcessStats = response.json().await?;

        // Bound check before scanning.
        if stats.resources.len() < index as usize + 1 {
            return Err(ResolverError::UndersizedStats {
                app_id: app_id.to_string(),
                wanted: index as usize + 1,
                got: stats.resources.len(),
            });
        }
        // Linear scan is fine at the expected scale of tens of instances.
        for process in &stats.resources {
            if process.index == index && process.type_ == process_type {
                return Ok(process.host.clone());
            }
        }

        Err(ResolverError::NoSuchProcess {
            app_id: app_id.to_string(),
            index,
            process_type: process_type.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::get, Json, Router};

    async fn spawn_mock(router: Router) -> url::Url {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
        format!("http://{addr}/v3").parse().unwrap()
    }

    fn mock_control_plane() -> Router {
        Router::new()
            .route(
                "/v3/apps/1234",
                get(|| async {
                    Json(serde_json::json!({
                        "guid": "1234", "name": "my-app", "state": "STARTED",
                    }))
                }),
            )
            .route(
                "/v3/apps/5678",
                get(|| async {
                    Json(serde_json::json!({"guid": "0000", "name": "substituted"}))
                }),
            )
            .route(
                "/v3/apps/1234/processes/web/stats",
                get(|| async {
                    Json(serde_json::json!({
                        "resources": [
                            {"type": "web", "index": 0, "state": "RUNNING", "host": "10.0.16.2"},
                            {"type": "worker", "index": 1, "state": "RUNNING", "host": "10.0.16.3"},
                        ],
                    }))
                }),
            )
            .fallback(|| async { axum::http::StatusCode::NOT_FOUND })
    }

    async fn control_plane() -> ControlPlane {
        let base = spawn_mock(mock_control_plane()).await;
        ControlPlane::with_base_url(reqwest::Client::new(), base)
    }

    #[tokio::test]
    async fn app_with_matching_identifier_is_visible() {
        let cp = control_plane().await;
        assert!(cp.is_visible("1234", "mytoken").await.unwrap());
    }

    #[tokio::test]
    async fn absent_app_is_not_visible() {
        let cp = control_plane().await;
        assert!(!cp.is_visible("9999", "mytoken").await.unwrap());
    }

    #[tokio::test]
    async fn substituted_identifier_is_an_error() {
        let cp = control_plane().await;
        match cp.is_visible("5678", "mytoken").await {
            Err(ResolverError::IdentifierMismatch { returned, .. }) => {
                assert_eq!(returned, "0000")
            }
            other => panic!("expected IdentifierMismatch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn resolves_host_of_matching_instance() {
        let cp = control_plane().await;
        let host = cp
            .resolve_location("1234", 0, "web", "mytoken")
            .await
            .unwrap();
        assert_eq!(host, "10.0.16.2");
    }

    #[tokio::test]
    async fn undersized_stats_list_is_an_error() {
        let cp = control_plane().await;
        match cp.resolve_location("1234", 5, "web", "mytoken").await {
            Err(ResolverError::UndersizedStats { wanted: 6, got: 2, .. }) => (),
            other => panic!("expected UndersizedStats, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn wrong_process_type_is_an_error() {
        // Index 1 exists, but is of type "worker".
        let cp = control_plane().await;
        match cp.resolve_location("1234", 1, "web", "mytoken").await {
            Err(ResolverError::NoSuchProcess { index: 1, .. }) => (),
            other => panic!("expected NoSuchProcess, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unresolvable_app_location_is_an_error() {
        let cp = control_plane().await;
        match cp.resolve_location("9999", 0, "web", "mytoken").await {
            Err(ResolverError::Status { status, .. }) => {
                assert_eq!(status, reqwest::StatusCode::NOT_FOUND)
            }
            other => panic!("expected Status, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn discovers_base_url_from_root_document() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let href = format!("http://{addr}/v3");

        let router = Router::new().route(
            "/",
            get({
                let href = href.clone();
                move || async move {
                    Json(serde_json::json!({
                        "links": {
                            "cloud_controller_v3": {"href": href},
                            "uaa": {"href": "https://uaa.example.com"},
                        },
                    }))
                }
            }),
        );
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });

        let cp = ControlPlane::discover(
            reqwest::Client::new(),
            format!("http://{addr}").parse().unwrap(),
        )
        .await
        .unwrap();
        assert_eq!(cp.base_url().as_str(), href);
    }
}

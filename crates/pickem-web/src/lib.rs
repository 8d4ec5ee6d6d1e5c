//! Axum dashboard and the scheduled sync endpoint.

use std::sync::Arc;

use askama::Template;
use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use pickem_core::{Event, User};
use pickem_sync::{connect_store, EventStore, SyncConfig, SyncPipeline};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::warn;

pub const CRATE_NAME: &str = "pickem-web";

#[derive(Clone)]
pub struct AppState {
    pub config: SyncConfig,
}

impl AppState {
    pub fn new(config: SyncConfig) -> Self {
        Self { config }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRow {
    pub id: String,
    pub name: String,
    pub date: String,
    pub promotion_name: String,
    pub match_count: usize,
    // Same casing as the persisted document shape.
    #[serde(rename = "isPPV")]
    pub is_ppv: bool,
    pub manually_edited: bool,
    pub source: String,
}

impl From<Event> for EventRow {
    fn from(event: Event) -> Self {
        Self {
            id: event.id,
            name: event.name,
            date: event.date,
            promotion_name: event.promotion_name,
            match_count: event.matches.len(),
            is_ppv: event.is_ppv,
            manually_edited: event.manually_edited,
            source: event.source,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardRow {
    pub rank: usize,
    pub display_name: String,
    pub score: i64,
    pub is_admin: bool,
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    app_id: String,
    total_events: usize,
    total_ppv: usize,
    total_users: usize,
}

#[derive(Template)]
#[template(path = "events.html")]
struct EventsTemplate {
    events: Vec<EventRow>,
}

#[derive(Template)]
#[template(path = "leaderboard.html")]
struct LeaderboardTemplate {
    rows: Vec<LeaderboardRow>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/events", get(events_page_handler))
        .route("/leaderboard", get(leaderboard_page_handler))
        .route("/api/events", get(api_events_handler))
        .route("/api/leaderboard", get(api_leaderboard_handler))
        // GET for the cron trigger, POST for manual kicks; axum answers
        // everything else on the route with 405.
        .route("/sync", get(sync_handler).post(sync_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("PICKEM_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let state = AppState::new(SyncConfig::from_env());
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn load_events(state: &AppState) -> anyhow::Result<Vec<EventRow>> {
    let store = connect_store(&state.config).await?;
    let mut events = store.list_events().await?;
    events.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.name.cmp(&b.name)));
    Ok(events.into_iter().map(EventRow::from).collect())
}

async fn load_leaderboard(state: &AppState) -> anyhow::Result<Vec<LeaderboardRow>> {
    let store = connect_store(&state.config).await?;
    let mut users: Vec<User> = store.list_users().await?;
    users.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then_with(|| a.display_name.cmp(&b.display_name))
    });
    Ok(users
        .into_iter()
        .enumerate()
        .map(|(idx, user)| LeaderboardRow {
            rank: idx + 1,
            display_name: user.display_name,
            score: user.score,
            is_admin: user.is_admin,
        })
        .collect())
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    let events = match load_events(&state).await {
        Ok(events) => events,
        Err(err) => return server_error(err),
    };
    let users = match load_leaderboard(&state).await {
        Ok(users) => users,
        Err(err) => return server_error(err),
    };
    render_html(IndexTemplate {
        app_id: state.config.app_id.clone(),
        total_ppv: events.iter().filter(|e| e.is_ppv).count(),
        total_events: events.len(),
        total_users: users.len(),
    })
}

async fn events_page_handler(State(state): State<Arc<AppState>>) -> Response {
    match load_events(&state).await {
        Ok(events) => render_html(EventsTemplate { events }),
        Err(err) => server_error(err),
    }
}

async fn leaderboard_page_handler(State(state): State<Arc<AppState>>) -> Response {
    match load_leaderboard(&state).await {
        Ok(rows) => render_html(LeaderboardTemplate { rows }),
        Err(err) => server_error(err),
    }
}

async fn api_events_handler(State(state): State<Arc<AppState>>) -> Response {
    match load_events(&state).await {
        Ok(events) => Json(events).into_response(),
        Err(err) => server_error(err),
    }
}

async fn api_leaderboard_handler(State(state): State<Arc<AppState>>) -> Response {
    match load_leaderboard(&state).await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => server_error(err),
    }
}

/// The cron-triggered scrape. Success and failure both answer JSON so
/// the caller's logs stay machine-readable.
async fn sync_handler(State(state): State<Arc<AppState>>) -> Response {
    let timestamp = Utc::now().to_rfc3339();
    let run = async {
        let pipeline = SyncPipeline::from_config(state.config.clone()).await?;
        pipeline.run_once().await
    };
    match run.await {
        Ok(summary) => Json(serde_json::json!({
            "success": true,
            "timestamp": timestamp,
            "eventsFound": summary.events_found,
            "eventsSaved": summary.events_saved,
            "events": summary.events,
        }))
        .into_response(),
        Err(err) => {
            warn!(error = %err, "sync endpoint run failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({
                    "success": false,
                    "error": err.to_string(),
                    "timestamp": timestamp,
                })),
            )
                .into_response()
        }
    }
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use pickem_sync::{EventStore, FsEventStore};
    use std::path::Path;
    use tower::ServiceExt;

    fn test_config(workspace: &Path) -> SyncConfig {
        SyncConfig {
            app_id: "test".to_string(),
            data_dir: workspace.join("data"),
            images_dir: workspace.join("images"),
            database_url: None,
            scheduler_enabled: false,
            sync_cron: "0 0 6 * * *".to_string(),
            user_agent: "test-agent".to_string(),
            http_timeout_secs: 5,
            courtesy_delay_ms: 0,
            workspace_root: workspace.to_path_buf(),
        }
    }

    async fn seed_event(config: &SyncConfig) {
        let store = FsEventStore::new(&config.data_dir, config.paths());
        store
            .upsert_event(&pickem_core::Event {
                id: "cagematch-398779".to_string(),
                name: "Wrestle Kingdom 20".to_string(),
                date: "04.01.2026".to_string(),
                promotion_id: 7,
                promotion_name: "New Japan Pro Wrestling".to_string(),
                matches: vec![],
                is_ppv: true,
                manually_edited: false,
                source: "cagematch".to_string(),
            })
            .await
            .expect("seed event");
    }

    #[tokio::test]
    async fn index_renders_dashboard() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = test_config(dir.path());
        seed_event(&config).await;

        let app = app(AppState::new(config));
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("Pick'em Dashboard"));
    }

    #[tokio::test]
    async fn api_events_returns_seeded_event_as_json() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = test_config(dir.path());
        seed_event(&config).await;

        let app = app(AppState::new(config));
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/events")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let events: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(events[0]["id"], "cagematch-398779");
        assert_eq!(events[0]["isPPV"], true);
        assert_eq!(events[0]["manuallyEdited"], false);
    }

    #[tokio::test]
    async fn sync_rejects_unsupported_methods() {
        let dir = tempfile::tempdir().expect("tempdir");
        let app = app(AppState::new(test_config(dir.path())));
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .method("DELETE")
                    .uri("/sync")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn sync_failure_answers_json_error_envelope() {
        // No sources.yaml in the workspace: the run fails, the endpoint
        // still answers the JSON contract.
        let dir = tempfile::tempdir().expect("tempdir");
        let app = app(AppState::new(test_config(dir.path())));
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/sync")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["success"], false);
        assert!(value["error"].as_str().unwrap().contains("sources.yaml"));
        assert!(value["timestamp"].is_string());
    }

    #[tokio::test]
    async fn leaderboard_orders_users_by_score() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = test_config(dir.path());
        let store = FsEventStore::new(&config.data_dir, config.paths());
        for (id, name, score) in [("u1", "Alice", 5), ("u2", "Bobo", 11)] {
            store
                .upsert_user(&pickem_core::User {
                    id: id.to_string(),
                    email: format!("{id}@example.com"),
                    display_name: name.to_string(),
                    subscriptions: vec![],
                    score,
                    is_admin: false,
                })
                .await
                .expect("seed user");
        }

        let app = app(AppState::new(config));
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/leaderboard")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let rows: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(rows[0]["displayName"], "Bobo");
        assert_eq!(rows[0]["rank"], 1);
        assert_eq!(rows[1]["displayName"], "Alice");
    }
}

//! Sync pipeline and maintenance batches: scrape, de-duplicate, clean up
//! weekly shows, manage admin flags, upload images.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pickem_core::{is_weekly_show, normalize_event_name, Event, User};
use pickem_scrape::{source_for_id, EventSource};
use pickem_store::{
    CollectionPaths, FsDocumentStore, HttpClientConfig, HttpFetcher, ImageStore,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{PgPool, Row};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "pickem-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub app_id: String,
    pub data_dir: PathBuf,
    pub images_dir: PathBuf,
    pub database_url: Option<String>,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub courtesy_delay_ms: u64,
    pub workspace_root: PathBuf,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            app_id: std::env::var("PICKEM_APP_ID").unwrap_or_else(|_| "pickem-dev".to_string()),
            data_dir: std::env::var("PICKEM_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            images_dir: std::env::var("PICKEM_IMAGES_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/images")),
            database_url: std::env::var("DATABASE_URL").ok(),
            scheduler_enabled: std::env::var("PICKEM_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("PICKEM_SYNC_CRON")
                .unwrap_or_else(|_| "0 0 6 * * *".to_string()),
            user_agent: std::env::var("PICKEM_USER_AGENT").unwrap_or_else(|_| {
                "Mozilla/5.0 (compatible; pickem-bot/0.1; +https://pickem.example)".to_string()
            }),
            http_timeout_secs: std::env::var("PICKEM_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            courtesy_delay_ms: std::env::var("PICKEM_COURTESY_DELAY_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1500),
            workspace_root: PathBuf::from("."),
        }
    }

    pub fn paths(&self) -> CollectionPaths {
        CollectionPaths::new(&self.app_id)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    #[serde(default)]
    pub listing_urls: Vec<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Storage seam for every batch operation. Store handles are explicit
/// values so runs stay test-isolated; nothing here is process-global.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn list_events(&self) -> Result<Vec<Event>>;
    async fn get_event(&self, event_id: &str) -> Result<Option<Event>>;
    /// Merge-upsert: existing fields not present in `event` survive.
    async fn upsert_event(&self, event: &Event) -> Result<()>;
    async fn delete_event(&self, event_id: &str) -> Result<bool>;
    async fn list_users(&self) -> Result<Vec<User>>;
    async fn upsert_user(&self, user: &User) -> Result<()>;
    async fn put_image_doc(&self, image_id: &str, doc: &Value) -> Result<()>;
}

/// Filesystem-backed store: one JSON document per file.
pub struct FsEventStore {
    docs: FsDocumentStore,
    paths: CollectionPaths,
}

impl FsEventStore {
    pub fn new(data_dir: impl Into<PathBuf>, paths: CollectionPaths) -> Self {
        Self {
            docs: FsDocumentStore::new(data_dir),
            paths,
        }
    }
}

fn decode_documents<T: serde::de::DeserializeOwned>(
    docs: Vec<(String, Value)>,
    kind: &str,
) -> Vec<T> {
    let mut out = Vec::with_capacity(docs.len());
    for (id, value) in docs {
        match serde_json::from_value(value) {
            Ok(decoded) => out.push(decoded),
            Err(err) => warn!(%id, kind, error = %err, "skipping malformed document"),
        }
    }
    out
}

#[async_trait]
impl EventStore for FsEventStore {
    async fn list_events(&self) -> Result<Vec<Event>> {
        let docs = self.docs.list(&self.paths.events()).await?;
        Ok(decode_documents(docs, "event"))
    }

    async fn get_event(&self, event_id: &str) -> Result<Option<Event>> {
        let Some(value) = self.docs.get(&self.paths.event(event_id)).await? else {
            return Ok(None);
        };
        let event = serde_json::from_value(value)
            .with_context(|| format!("decoding event document {event_id}"))?;
        Ok(Some(event))
    }

    async fn upsert_event(&self, event: &Event) -> Result<()> {
        let value = serde_json::to_value(event).context("encoding event document")?;
        self.docs.merge(&self.paths.event(&event.id), &value).await?;
        Ok(())
    }

    async fn delete_event(&self, event_id: &str) -> Result<bool> {
        Ok(self.docs.delete(&self.paths.event(event_id)).await?)
    }

    async fn list_users(&self) -> Result<Vec<User>> {
        let docs = self.docs.list(&self.paths.users()).await?;
        Ok(decode_documents(docs, "user"))
    }

    async fn upsert_user(&self, user: &User) -> Result<()> {
        let value = serde_json::to_value(user).context("encoding user document")?;
        self.docs.merge(&self.paths.user(&user.id), &value).await?;
        Ok(())
    }

    async fn put_image_doc(&self, image_id: &str, doc: &Value) -> Result<()> {
        self.docs.merge(&self.paths.image(image_id), doc).await?;
        Ok(())
    }
}

/// Postgres-backed store: the whole document hierarchy lives in one
/// `documents(path, data)` table with JSONB merge-upserts.
pub struct PgEventStore {
    pool: PgPool,
    paths: CollectionPaths,
}

impl PgEventStore {
    pub async fn connect(database_url: &str, paths: CollectionPaths) -> Result<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .context("connecting to postgres")?;
        let store = Self { pool, paths };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                path TEXT PRIMARY KEY,
                data JSONB NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("creating documents table")?;
        Ok(())
    }

    async fn list_collection(&self, collection: &str) -> Result<Vec<(String, Value)>> {
        let prefix = format!("{}/", collection.trim_end_matches('/'));
        let rows = sqlx::query(
            r#"
            SELECT path, data
              FROM documents
             WHERE path LIKE $1 || '%'
             ORDER BY path
            "#,
        )
        .bind(&prefix)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("listing collection {collection}"))?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let path: String = row.try_get("path")?;
            let data: Value = row.try_get("data")?;
            let id = path.rsplit('/').next().unwrap_or(&path).to_string();
            out.push((id, data));
        }
        Ok(out)
    }

    async fn merge_document(&self, path: &str, value: &Value) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO documents (path, data)
            VALUES ($1, $2)
            ON CONFLICT (path)
            DO UPDATE SET data = documents.data || EXCLUDED.data
            "#,
        )
        .bind(path)
        .bind(value)
        .execute(&self.pool)
        .await
        .with_context(|| format!("merge-upserting {path}"))?;
        Ok(())
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn list_events(&self) -> Result<Vec<Event>> {
        let docs = self.list_collection(&self.paths.events()).await?;
        Ok(decode_documents(docs, "event"))
    }

    async fn get_event(&self, event_id: &str) -> Result<Option<Event>> {
        let row = sqlx::query("SELECT data FROM documents WHERE path = $1")
            .bind(self.paths.event(event_id))
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("loading event {event_id}"))?;
        let Some(row) = row else { return Ok(None) };
        let data: Value = row.try_get("data")?;
        let event = serde_json::from_value(data)
            .with_context(|| format!("decoding event document {event_id}"))?;
        Ok(Some(event))
    }

    async fn upsert_event(&self, event: &Event) -> Result<()> {
        let value = serde_json::to_value(event).context("encoding event document")?;
        self.merge_document(&self.paths.event(&event.id), &value).await
    }

    async fn delete_event(&self, event_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM documents WHERE path = $1")
            .bind(self.paths.event(event_id))
            .execute(&self.pool)
            .await
            .with_context(|| format!("deleting event {event_id}"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_users(&self) -> Result<Vec<User>> {
        let docs = self.list_collection(&self.paths.users()).await?;
        Ok(decode_documents(docs, "user"))
    }

    async fn upsert_user(&self, user: &User) -> Result<()> {
        let value = serde_json::to_value(user).context("encoding user document")?;
        self.merge_document(&self.paths.user(&user.id), &value).await
    }

    async fn put_image_doc(&self, image_id: &str, doc: &Value) -> Result<()> {
        self.merge_document(&self.paths.image(image_id), doc).await
    }
}

/// Postgres when configured and reachable, filesystem otherwise.
pub async fn connect_store(config: &SyncConfig) -> Result<Arc<dyn EventStore>> {
    if let Some(database_url) = &config.database_url {
        match PgEventStore::connect(database_url, config.paths()).await {
            Ok(store) => return Ok(Arc::new(store)),
            Err(err) => warn!(error = %err, "postgres unavailable, falling back to filesystem store"),
        }
    }
    Ok(Arc::new(FsEventStore::new(&config.data_dir, config.paths())))
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ReconcileReport {
    /// Normalized-name groups with more than one record.
    pub groups: usize,
    pub deleted: usize,
    pub protected: usize,
}

fn source_rank(event: &Event) -> u8 {
    // profightdb carries full match cards; prefer it on equal match counts.
    if event.source == "profightdb" {
        0
    } else {
        1
    }
}

/// Collapse events whose normalized names collide down to one canonical
/// record per group. Records flagged `manually_edited` are never deleted.
/// Deletes are best-effort and non-transactional; re-running on the
/// result is a no-op.
pub async fn remove_duplicate_events(store: &dyn EventStore) -> Result<ReconcileReport> {
    let events = store.list_events().await.context("loading event snapshot")?;

    let mut groups: std::collections::BTreeMap<String, Vec<Event>> = Default::default();
    for event in events {
        groups
            .entry(normalize_event_name(&event.name))
            .or_default()
            .push(event);
    }

    let mut report = ReconcileReport::default();
    for (key, mut group) in groups {
        if group.len() < 2 {
            continue;
        }
        report.groups += 1;

        // Stable sort: match count descending, then source preference, so
        // full ties keep snapshot order.
        group.sort_by(|a, b| {
            b.matches
                .len()
                .cmp(&a.matches.len())
                .then_with(|| source_rank(a).cmp(&source_rank(b)))
        });

        let canonical = &group[0];
        info!(
            normalized = %key,
            canonical = %canonical.id,
            duplicates = group.len() - 1,
            "reconciling duplicate group"
        );

        for duplicate in &group[1..] {
            if duplicate.manually_edited {
                report.protected += 1;
                info!(event = %duplicate.id, "duplicate is manually edited, keeping");
                continue;
            }
            match store.delete_event(&duplicate.id).await {
                Ok(true) => report.deleted += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!(event = %duplicate.id, error = %err, "failed to delete duplicate, continuing");
                }
            }
        }
    }

    Ok(report)
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CleanupReport {
    pub scanned: usize,
    pub deleted: usize,
    pub protected: usize,
}

/// Delete persisted events the classifier labels as weekly TV, keeping
/// anything manually edited.
pub async fn cleanup_weekly_shows(store: &dyn EventStore) -> Result<CleanupReport> {
    let events = store.list_events().await.context("loading event snapshot")?;

    let mut report = CleanupReport {
        scanned: events.len(),
        ..Default::default()
    };
    for event in events {
        if !is_weekly_show(&event.name) {
            continue;
        }
        if event.manually_edited {
            report.protected += 1;
            info!(event = %event.id, name = %event.name, "weekly show manually edited, keeping");
            continue;
        }
        match store.delete_event(&event.id).await {
            Ok(true) => {
                info!(event = %event.id, name = %event.name, "removed weekly show");
                report.deleted += 1;
            }
            Ok(false) => {}
            Err(err) => {
                warn!(event = %event.id, error = %err, "failed to delete weekly show, continuing");
            }
        }
    }

    Ok(report)
}

/// Flip a user's admin flag, located by email.
pub async fn set_admin_flag(store: &dyn EventStore, email: &str, grant: bool) -> Result<User> {
    let users = store.list_users().await.context("loading users")?;
    let Some(mut user) = users
        .into_iter()
        .find(|u| u.email.eq_ignore_ascii_case(email))
    else {
        bail!("no user with email {email}");
    };

    user.is_admin = grant;
    store
        .upsert_user(&user)
        .await
        .with_context(|| format!("updating user {}", user.id))?;
    info!(user = %user.id, email, grant, "admin flag updated");
    Ok(user)
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct UploadReport {
    pub uploaded: usize,
    pub failed: usize,
}

fn image_content_type(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("svg") => "image/svg+xml",
        _ => "application/octet-stream",
    }
}

fn image_doc_id(file_name: &str) -> String {
    file_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

async fn upload_one_image(
    store: &dyn EventStore,
    images: &ImageStore,
    path: &Path,
) -> Result<()> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let stored = images
        .store_bytes(
            path.extension().and_then(|e| e.to_str()).unwrap_or("bin"),
            &bytes,
        )
        .await?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unnamed")
        .to_string();
    let doc = serde_json::json!({
        "fileName": file_name,
        "contentType": image_content_type(path),
        "sha256": stored.content_hash,
        "storagePath": stored.relative_path.display().to_string(),
        "byteSize": stored.byte_size,
        "uploadedAt": Utc::now().to_rfc3339(),
    });
    store.put_image_doc(&image_doc_id(&file_name), &doc).await
}

/// Upload every file in a folder. One bad file is logged and skipped;
/// the rest still go through.
pub async fn upload_image_folder(
    store: &dyn EventStore,
    images: &ImageStore,
    folder: &Path,
) -> Result<UploadReport> {
    let mut entries: Vec<PathBuf> = std::fs::read_dir(folder)
        .with_context(|| format!("reading image folder {}", folder.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .collect();
    entries.sort();

    let mut report = UploadReport::default();
    for path in entries {
        match upload_one_image(store, images, &path).await {
            Ok(()) => {
                info!(file = %path.display(), "uploaded image");
                report.uploaded += 1;
            }
            Err(err) => {
                warn!(file = %path.display(), error = %err, "image upload failed, continuing");
                report.failed += 1;
            }
        }
    }
    Ok(report)
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncedEvent {
    pub id: String,
    pub name: String,
    pub date: String,
    pub promotion_name: String,
    pub match_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub events_found: usize,
    pub events_saved: usize,
    pub events: Vec<SyncedEvent>,
}

pub struct SyncPipeline {
    config: SyncConfig,
    store: Arc<dyn EventStore>,
    http: HttpFetcher,
}

impl SyncPipeline {
    pub fn with_store(config: SyncConfig, store: Arc<dyn EventStore>) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            courtesy_delay: Duration::from_millis(config.courtesy_delay_ms),
            ..Default::default()
        })?;
        Ok(Self { config, store, http })
    }

    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let store = connect_store(&config).await?;
        Self::with_store(config, store)
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    async fn load_source_registry(&self) -> Result<SourceRegistry> {
        let path = self.config.workspace_root.join("sources.yaml");
        let text = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// One full scrape pass over every enabled source: listing pages to
    /// stubs, weekly shows dropped, card pages for matches, merge-upsert
    /// into the store. Per-event failures are logged, not fatal.
    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let registry = self.load_source_registry().await?;

        let mut events_found = 0usize;
        let mut saved = Vec::new();

        for source in registry.sources.iter().filter(|s| s.enabled) {
            let Some(adapter) = source_for_id(&source.source_id) else {
                warn!(source = %source.source_id, "no adapter for source, skipping");
                continue;
            };

            let mut stubs = Vec::new();
            for url in &source.listing_urls {
                match adapter.fetch_page(&self.http, run_id, url).await {
                    Ok(html) => stubs.extend(adapter.parse_listing(&html)),
                    Err(err) => {
                        warn!(source = %source.source_id, %url, error = %err, "listing fetch failed, continuing");
                    }
                }
            }

            events_found += stubs.len();
            for stub in stubs {
                if is_weekly_show(&stub.name) {
                    continue;
                }
                match self.sync_one_event(&*adapter, run_id, &stub).await {
                    Ok(Some(synced)) => saved.push(synced),
                    Ok(None) => {}
                    Err(err) => {
                        warn!(event = %stub.id, error = %err, "event sync failed, continuing");
                    }
                }
            }
        }

        let finished_at = Utc::now();
        info!(
            %run_id,
            events_found,
            events_saved = saved.len(),
            "sync run complete"
        );
        Ok(SyncRunSummary {
            run_id,
            started_at,
            finished_at,
            events_found,
            events_saved: saved.len(),
            events: saved,
        })
    }

    async fn sync_one_event(
        &self,
        adapter: &dyn EventSource,
        run_id: Uuid,
        stub: &pickem_core::EventStub,
    ) -> Result<Option<SyncedEvent>> {
        let existing = self.store.get_event(&stub.id).await?;
        if existing.as_ref().is_some_and(|e| e.manually_edited) {
            info!(event = %stub.id, "manually edited, leaving untouched");
            return Ok(None);
        }

        let matches = match adapter
            .fetch_page(&self.http, run_id, &adapter.event_url(stub))
            .await
        {
            Ok(html) => adapter.parse_matches(&html),
            Err(err) => {
                warn!(event = %stub.id, error = %err, "card fetch failed, keeping known matches");
                existing.as_ref().map(|e| e.matches.clone()).unwrap_or_default()
            }
        };

        let event = Event {
            id: stub.id.clone(),
            name: stub.name.clone(),
            date: stub.date.clone(),
            promotion_id: stub.promotion_id,
            promotion_name: stub.promotion_name.clone(),
            matches,
            is_ppv: true,
            manually_edited: false,
            source: adapter.source_id().to_string(),
        };
        self.store.upsert_event(&event).await?;

        Ok(Some(SyncedEvent {
            id: event.id,
            name: event.name,
            date: event.date,
            promotion_name: event.promotion_name,
            match_count: event.matches.len(),
        }))
    }

    /// Cron-driven sync when enabled; each tick runs the full pipeline.
    pub async fn maybe_build_scheduler(self: Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.sync_cron.clone();
        let pipeline = Arc::clone(&self);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.run_once().await {
                    Ok(summary) => info!(
                        run_id = %summary.run_id,
                        events_saved = summary.events_saved,
                        "scheduled sync finished"
                    ),
                    Err(err) => warn!(error = %err, "scheduled sync failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let pipeline = SyncPipeline::from_config(SyncConfig::from_env()).await?;
    pipeline.run_once().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use pickem_core::EventMatch;
    use tempfile::tempdir;

    fn event(id: &str, name: &str, match_count: usize, source: &str, manually_edited: bool) -> Event {
        Event {
            id: id.to_string(),
            name: name.to_string(),
            date: "04.01.2026".to_string(),
            promotion_id: 7,
            promotion_name: "New Japan Pro Wrestling".to_string(),
            matches: (0..match_count)
                .map(|i| EventMatch {
                    id: i as u32 + 1,
                    side_a: format!("A{i}"),
                    side_b: format!("B{i}"),
                    title: None,
                })
                .collect(),
            is_ppv: true,
            manually_edited,
            source: source.to_string(),
        }
    }

    fn fs_store(dir: &Path) -> FsEventStore {
        FsEventStore::new(dir, CollectionPaths::new("test"))
    }

    #[tokio::test]
    async fn reconciler_keeps_record_with_most_matches() {
        let dir = tempdir().expect("tempdir");
        let store = fs_store(dir.path());
        store
            .upsert_event(&event("profightdb-1", "Wrestle Kingdom 20", 9, "profightdb", false))
            .await
            .expect("upsert");
        store
            .upsert_event(&event("cagematch-2", "wrestle kingdom 20", 0, "cagematch", false))
            .await
            .expect("upsert");

        let report = remove_duplicate_events(&store).await.expect("reconcile");
        assert_eq!(report.groups, 1);
        assert_eq!(report.deleted, 1);
        assert_eq!(report.protected, 0);

        let survivors = store.list_events().await.expect("list");
        assert_eq!(survivors.len(), 1);
        assert_eq!(survivors[0].id, "profightdb-1");
    }

    #[tokio::test]
    async fn reconciler_prefers_profightdb_on_equal_match_counts() {
        let dir = tempdir().expect("tempdir");
        let store = fs_store(dir.path());
        store
            .upsert_event(&event("cagematch-10", "Forbidden Door 2026", 8, "cagematch", false))
            .await
            .expect("upsert");
        store
            .upsert_event(&event("profightdb-11", "Forbidden Door 2026", 8, "profightdb", false))
            .await
            .expect("upsert");

        remove_duplicate_events(&store).await.expect("reconcile");

        let survivors = store.list_events().await.expect("list");
        assert_eq!(survivors.len(), 1);
        assert_eq!(survivors[0].id, "profightdb-11");
    }

    #[tokio::test]
    async fn reconciler_never_deletes_manually_edited_records() {
        let dir = tempdir().expect("tempdir");
        let store = fs_store(dir.path());
        store
            .upsert_event(&event("profightdb-1", "Wrestle Kingdom 20", 9, "profightdb", false))
            .await
            .expect("upsert");
        store
            .upsert_event(&event("cagematch-2", "Wrestle Kingdom 20", 0, "cagematch", true))
            .await
            .expect("upsert");

        let report = remove_duplicate_events(&store).await.expect("reconcile");
        assert_eq!(report.deleted, 0);
        assert_eq!(report.protected, 1);
        assert_eq!(store.list_events().await.expect("list").len(), 2);
    }

    #[tokio::test]
    async fn reconciler_is_idempotent() {
        let dir = tempdir().expect("tempdir");
        let store = fs_store(dir.path());
        store
            .upsert_event(&event("profightdb-1", "Wrestle Kingdom 20", 9, "profightdb", false))
            .await
            .expect("upsert");
        store
            .upsert_event(&event("cagematch-2", "wrestle kingdom 20", 3, "cagematch", false))
            .await
            .expect("upsert");
        store
            .upsert_event(&event("cagematch-3", "Wrestle-Kingdom 20!", 0, "cagematch", true))
            .await
            .expect("upsert");

        let first = remove_duplicate_events(&store).await.expect("first run");
        assert_eq!(first.deleted, 1);
        assert_eq!(first.protected, 1);

        let second = remove_duplicate_events(&store).await.expect("second run");
        assert_eq!(second.deleted, 0);
        assert_eq!(second.protected, 1);
    }

    #[tokio::test]
    async fn cleanup_removes_weekly_shows_but_keeps_manual_edits() {
        let dir = tempdir().expect("tempdir");
        let store = fs_store(dir.path());
        store
            .upsert_event(&event("cagematch-1", "AEW Collision #50", 0, "cagematch", false))
            .await
            .expect("upsert");
        store
            .upsert_event(&event("cagematch-2", "WWE NXT", 0, "cagematch", true))
            .await
            .expect("upsert");
        store
            .upsert_event(&event("cagematch-3", "Wrestle Kingdom 20", 9, "cagematch", false))
            .await
            .expect("upsert");

        let report = cleanup_weekly_shows(&store).await.expect("cleanup");
        assert_eq!(report.scanned, 3);
        assert_eq!(report.deleted, 1);
        assert_eq!(report.protected, 1);

        let ids: Vec<_> = store
            .list_events()
            .await
            .expect("list")
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec!["cagematch-2", "cagematch-3"]);
    }

    #[tokio::test]
    async fn admin_flag_is_set_by_email_and_missing_user_errors() {
        let dir = tempdir().expect("tempdir");
        let store = fs_store(dir.path());
        store
            .upsert_user(&User {
                id: "guest-42".to_string(),
                email: "fan@example.com".to_string(),
                display_name: "Fan".to_string(),
                subscriptions: vec![],
                score: 12,
                is_admin: false,
            })
            .await
            .expect("upsert");

        let updated = set_admin_flag(&store, "Fan@Example.com", true).await.expect("grant");
        assert!(updated.is_admin);

        let revoked = set_admin_flag(&store, "fan@example.com", false).await.expect("revoke");
        assert!(!revoked.is_admin);

        let err = set_admin_flag(&store, "nobody@example.com", true)
            .await
            .expect_err("missing user");
        assert!(err.to_string().contains("nobody@example.com"));
    }

    #[tokio::test]
    async fn image_upload_continues_past_a_bad_entry() {
        let data_dir = tempdir().expect("tempdir");
        let folder = tempdir().expect("tempdir");
        let store = fs_store(data_dir.path());
        let images = ImageStore::new(data_dir.path().join("images"));

        std::fs::write(folder.path().join("logo.png"), b"png-bytes").expect("write");
        std::fs::write(folder.path().join("banner.jpg"), b"jpg-bytes").expect("write");
        // A directory entry cannot be read as a file and must not abort the run.
        std::fs::create_dir(folder.path().join("nested")).expect("mkdir");

        let report = upload_image_folder(&store, &images, folder.path())
            .await
            .expect("upload");
        assert_eq!(report.uploaded, 2);
        assert_eq!(report.failed, 1);
    }

    /// Card source with a fixed page body, so the pipeline runs without
    /// touching the network.
    struct CannedCardSource;

    #[async_trait]
    impl EventSource for CannedCardSource {
        fn source_id(&self) -> &'static str {
            "cagematch"
        }

        fn event_url(&self, stub: &pickem_core::EventStub) -> String {
            format!("http://localhost/card/{}", stub.source_event_id)
        }

        fn parse_listing(&self, _html: &str) -> Vec<pickem_core::EventStub> {
            Vec::new()
        }

        fn parse_matches(&self, html: &str) -> Vec<EventMatch> {
            html.lines()
                .filter_map(|line| line.split_once(" vs "))
                .enumerate()
                .map(|(i, (a, b))| EventMatch {
                    id: i as u32 + 1,
                    side_a: a.trim().to_string(),
                    side_b: b.trim().to_string(),
                    title: None,
                })
                .collect()
        }

        async fn fetch_page(
            &self,
            _http: &HttpFetcher,
            _run_id: Uuid,
            _url: &str,
        ) -> Result<String, pickem_scrape::AdapterError> {
            Ok("Kazuchika Okada vs Hiroshi Tanahashi\nZack Sabre Jr. vs Konosuke Takeshita".to_string())
        }
    }

    fn test_pipeline(dir: &Path) -> SyncPipeline {
        let config = SyncConfig {
            app_id: "test".to_string(),
            data_dir: dir.join("data"),
            images_dir: dir.join("images"),
            database_url: None,
            scheduler_enabled: false,
            sync_cron: "0 0 6 * * *".to_string(),
            user_agent: "test-agent".to_string(),
            http_timeout_secs: 5,
            courtesy_delay_ms: 0,
            workspace_root: dir.to_path_buf(),
        };
        let store: Arc<dyn EventStore> =
            Arc::new(FsEventStore::new(&config.data_dir, config.paths()));
        SyncPipeline::with_store(config, store).expect("pipeline")
    }

    fn stub(id_suffix: u64, name: &str) -> pickem_core::EventStub {
        pickem_core::EventStub {
            id: format!("cagematch-{id_suffix}"),
            source_event_id: id_suffix,
            promotion_id: 7,
            promotion_name: "New Japan Pro Wrestling".to_string(),
            name: name.to_string(),
            date: "04.01.2026".to_string(),
        }
    }

    #[tokio::test]
    async fn sync_leaves_manually_edited_events_untouched() {
        let dir = tempdir().expect("tempdir");
        let pipeline = test_pipeline(dir.path());
        let edited = event("cagematch-9", "Wrestle Kingdom 20: Curated Card", 9, "cagematch", true);
        pipeline.store().upsert_event(&edited).await.expect("upsert");

        let synced = pipeline
            .sync_one_event(&CannedCardSource, Uuid::new_v4(), &stub(9, "Wrestle Kingdom 20"))
            .await
            .expect("sync");
        assert!(synced.is_none());

        let loaded = pipeline
            .store()
            .get_event("cagematch-9")
            .await
            .expect("get")
            .expect("event");
        assert!(loaded.manually_edited);
        assert_eq!(loaded.name, "Wrestle Kingdom 20: Curated Card");
        assert_eq!(loaded.matches.len(), 9);
    }

    #[tokio::test]
    async fn sync_upserts_scraped_card_for_unedited_events() {
        let dir = tempdir().expect("tempdir");
        let pipeline = test_pipeline(dir.path());

        let synced = pipeline
            .sync_one_event(&CannedCardSource, Uuid::new_v4(), &stub(12, "Wrestle Kingdom 20"))
            .await
            .expect("sync")
            .expect("synced");
        assert_eq!(synced.match_count, 2);

        let loaded = pipeline
            .store()
            .get_event("cagematch-12")
            .await
            .expect("get")
            .expect("event");
        assert_eq!(loaded.matches.len(), 2);
        assert_eq!(loaded.matches[0].side_a, "Kazuchika Okada");
        assert!(loaded.is_ppv);
        assert!(!loaded.manually_edited);
        assert_eq!(loaded.source, "cagematch");
    }

    #[tokio::test]
    async fn run_once_with_no_enabled_sources_is_empty() {
        let workspace = tempdir().expect("tempdir");
        std::fs::write(
            workspace.path().join("sources.yaml"),
            "sources:\n  - source_id: cagematch\n    display_name: Cagematch\n    enabled: false\n",
        )
        .expect("write registry");

        let config = SyncConfig {
            app_id: "test".to_string(),
            data_dir: workspace.path().join("data"),
            images_dir: workspace.path().join("images"),
            database_url: None,
            scheduler_enabled: false,
            sync_cron: "0 0 6 * * *".to_string(),
            user_agent: "test-agent".to_string(),
            http_timeout_secs: 5,
            courtesy_delay_ms: 0,
            workspace_root: workspace.path().to_path_buf(),
        };
        let store: Arc<dyn EventStore> =
            Arc::new(FsEventStore::new(&config.data_dir, config.paths()));
        let pipeline = SyncPipeline::with_store(config, store).expect("pipeline");

        let summary = pipeline.run_once().await.expect("run");
        assert_eq!(summary.events_found, 0);
        assert_eq!(summary.events_saved, 0);
        assert!(summary.events.is_empty());
    }
}

//! Durable keyed store for harness entities.
//!
//! LaunchLog and Grade are append-only: the trait offers inserts and reads,
//! never updates or deletes.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::HarnessConfig;
use crate::error::StoreResult;
use crate::models::{Course, CourseTool, Grade, LaunchLog, Tool, ToolServer, User};

pub use memory::MemoryStore;
pub use postgres::PgStore;

pub type Db = Arc<dyn Store>;

#[async_trait]
pub trait Store: Send + Sync {
    // --- tool servers ---
    async fn insert_tool_server(&self, server: &ToolServer) -> StoreResult<()>;
    async fn tool_server(&self, id: Uuid) -> StoreResult<Option<ToolServer>>;
    async fn tool_server_by_address(&self, domain: &str, port: u16) -> StoreResult<Option<ToolServer>>;
    async fn list_tool_servers(&self) -> StoreResult<Vec<ToolServer>>;

    // --- tools ---
    /// Fails with `Conflict` when the consumer key is taken.
    async fn insert_tool(&self, tool: &Tool) -> StoreResult<()>;
    async fn tool(&self, id: Uuid) -> StoreResult<Option<Tool>>;
    async fn tool_by_consumer_key(&self, consumer_key: &str) -> StoreResult<Option<Tool>>;
    async fn list_tools(&self) -> StoreResult<Vec<Tool>>;

    // --- courses ---
    async fn insert_course(&self, course: &Course) -> StoreResult<()>;
    async fn course(&self, id: Uuid) -> StoreResult<Option<Course>>;
    async fn course_by_label(&self, label: &str) -> StoreResult<Option<Course>>;
    async fn list_courses(&self) -> StoreResult<Vec<Course>>;

    // --- users ---
    async fn insert_user(&self, user: &User) -> StoreResult<()>;
    async fn user(&self, id: Uuid) -> StoreResult<Option<User>>;
    async fn user_by_email(&self, email: &str) -> StoreResult<Option<User>>;
    async fn list_users(&self) -> StoreResult<Vec<User>>;

    // --- course/tool bindings ---
    /// Fails with `Conflict` on a reused `resource_link_id` or a second
    /// binding of the same tool to the same course.
    async fn insert_course_tool(&self, binding: &CourseTool) -> StoreResult<()>;
    async fn course_tool(&self, id: Uuid) -> StoreResult<Option<CourseTool>>;
    async fn course_tool_for(&self, course_id: Uuid, tool_id: Uuid) -> StoreResult<Option<CourseTool>>;
    async fn list_course_tools(&self, course_id: Uuid) -> StoreResult<Vec<CourseTool>>;

    // --- launch logs ---
    async fn insert_launch_log(&self, log: &LaunchLog) -> StoreResult<()>;
    async fn launch_log(&self, id: Uuid) -> StoreResult<Option<LaunchLog>>;
    /// Newest first.
    async fn list_launch_logs(&self) -> StoreResult<Vec<LaunchLog>>;
    async fn latest_launch_for(&self, user_id: Uuid, course_tool_id: Uuid) -> StoreResult<Option<LaunchLog>>;

    // --- grades ---
    async fn insert_grade(&self, grade: &Grade) -> StoreResult<()>;
    async fn grade(&self, id: Uuid) -> StoreResult<Option<Grade>>;
    /// Newest first.
    async fn list_grades(&self) -> StoreResult<Vec<Grade>>;
    async fn latest_grade_for(&self, user_id: Uuid, course_tool_id: Uuid) -> StoreResult<Option<Grade>>;
}

/// Postgres when `DATABASE_URL` is configured, otherwise an in-memory store.
pub async fn connect(config: &HarnessConfig) -> anyhow::Result<Db> {
    match &config.database_url {
        Some(url) => {
            let store = PgStore::connect(url).await?;
            store.migrate().await?;
            tracing::info!("using postgres store");
            Ok(Arc::new(store))
        }
        None => {
            tracing::warn!("DATABASE_URL not set; using in-memory store, data is lost on exit");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

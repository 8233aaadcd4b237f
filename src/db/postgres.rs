use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{query, query_as, Pool, Postgres};
use uuid::Uuid;

use super::Store;
use crate::error::{StoreError, StoreResult};
use crate::models::{Course, CourseTool, Grade, LaunchLog, ParamMap, Role, Tool, ToolServer, User};

#[derive(Clone)]
pub struct PgStore {
    pool: Pool<Postgres>,
}

impl PgStore {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        Ok(Self { pool: Pool::<Postgres>::connect(url).await? })
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        // crate-relative path for sqlx migrations
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

/// Unique violations (SQLSTATE 23505) become `Conflict`.
fn db_err(e: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &e {
        if db.code().as_deref() == Some("23505") {
            return StoreError::Conflict(db.message().to_string());
        }
    }
    StoreError::Database(e)
}

fn decode_err<E>(e: E) -> StoreError
where
    E: std::error::Error + Send + Sync + 'static,
{
    StoreError::Database(sqlx::Error::Decode(Box::new(e)))
}

// --- row shapes that differ from the domain models ---

#[derive(sqlx::FromRow)]
struct ToolServerRow {
    id: Uuid,
    name: String,
    domain: String,
    port: i32,
    description: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<ToolServerRow> for ToolServer {
    type Error = StoreError;

    fn try_from(r: ToolServerRow) -> StoreResult<Self> {
        Ok(ToolServer {
            id: r.id,
            name: r.name,
            domain: r.domain,
            port: u16::try_from(r.port).map_err(decode_err)?,
            description: r.description,
            created_at: r.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ToolRow {
    id: Uuid,
    tool_server_id: Uuid,
    name: String,
    launch_path: String,
    consumer_key: String,
    consumer_secret: String,
    custom_params: Json<ParamMap>,
    launch_url_override: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<ToolRow> for Tool {
    fn from(r: ToolRow) -> Self {
        Tool {
            id: r.id,
            tool_server_id: r.tool_server_id,
            name: r.name,
            launch_path: r.launch_path,
            consumer_key: r.consumer_key,
            consumer_secret: r.consumer_secret,
            custom_params: r.custom_params.0,
            launch_url_override: r.launch_url_override,
            created_at: r.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct UserRow {
    id: Uuid,
    given_name: String,
    family_name: String,
    email: String,
    role: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<UserRow> for User {
    type Error = StoreError;

    fn try_from(r: UserRow) -> StoreResult<Self> {
        Ok(User {
            id: r.id,
            given_name: r.given_name,
            family_name: r.family_name,
            email: r.email,
            role: r.role.parse::<Role>().map_err(decode_err)?,
            created_at: r.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct LaunchLogRow {
    id: Uuid,
    course_tool_id: Uuid,
    user_id: Uuid,
    launch_params: Json<ParamMap>,
    signed_params: Json<ParamMap>,
    oauth_signature: String,
    launched_at: DateTime<Utc>,
}

impl From<LaunchLogRow> for LaunchLog {
    fn from(r: LaunchLogRow) -> Self {
        LaunchLog {
            id: r.id,
            course_tool_id: r.course_tool_id,
            user_id: r.user_id,
            launch_params: r.launch_params.0,
            signed_params: r.signed_params.0,
            oauth_signature: r.oauth_signature,
            launched_at: r.launched_at,
        }
    }
}

fn servers(rows: Vec<ToolServerRow>) -> StoreResult<Vec<ToolServer>> {
    rows.into_iter().map(ToolServer::try_from).collect()
}

fn users(rows: Vec<UserRow>) -> StoreResult<Vec<User>> {
    rows.into_iter().map(User::try_from).collect()
}

#[async_trait]
impl Store for PgStore {
    async fn insert_tool_server(&self, s: &ToolServer) -> StoreResult<()> {
        query(
            r#"INSERT INTO tool_servers (id, name, domain, port, description, created_at)
               VALUES ($1,$2,$3,$4,$5,$6)"#,
        )
        .bind(s.id)
        .bind(&s.name)
        .bind(&s.domain)
        .bind(i32::from(s.port))
        .bind(&s.description)
        .bind(s.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn tool_server(&self, id: Uuid) -> StoreResult<Option<ToolServer>> {
        query_as::<_, ToolServerRow>("SELECT * FROM tool_servers WHERE id=$1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .map(ToolServer::try_from)
            .transpose()
    }

    async fn tool_server_by_address(&self, domain: &str, port: u16) -> StoreResult<Option<ToolServer>> {
        query_as::<_, ToolServerRow>("SELECT * FROM tool_servers WHERE domain=$1 AND port=$2")
            .bind(domain)
            .bind(i32::from(port))
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .map(ToolServer::try_from)
            .transpose()
    }

    async fn list_tool_servers(&self) -> StoreResult<Vec<ToolServer>> {
        let rows = query_as::<_, ToolServerRow>("SELECT * FROM tool_servers ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        servers(rows)
    }

    async fn insert_tool(&self, t: &Tool) -> StoreResult<()> {
        query(
            r#"INSERT INTO tools
               (id, tool_server_id, name, launch_path, consumer_key, consumer_secret,
                custom_params, launch_url_override, created_at)
               VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)"#,
        )
        .bind(t.id)
        .bind(t.tool_server_id)
        .bind(&t.name)
        .bind(&t.launch_path)
        .bind(&t.consumer_key)
        .bind(&t.consumer_secret)
        .bind(Json(&t.custom_params))
        .bind(&t.launch_url_override)
        .bind(t.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn tool(&self, id: Uuid) -> StoreResult<Option<Tool>> {
        Ok(query_as::<_, ToolRow>("SELECT * FROM tools WHERE id=$1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .map(Tool::from))
    }

    async fn tool_by_consumer_key(&self, consumer_key: &str) -> StoreResult<Option<Tool>> {
        Ok(query_as::<_, ToolRow>("SELECT * FROM tools WHERE consumer_key=$1")
            .bind(consumer_key)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .map(Tool::from))
    }

    async fn list_tools(&self) -> StoreResult<Vec<Tool>> {
        Ok(query_as::<_, ToolRow>("SELECT * FROM tools ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?
            .into_iter()
            .map(Tool::from)
            .collect())
    }

    async fn insert_course(&self, c: &Course) -> StoreResult<()> {
        query(
            r#"INSERT INTO courses (id, label, title, description, created_at)
               VALUES ($1,$2,$3,$4,$5)"#,
        )
        .bind(c.id)
        .bind(&c.label)
        .bind(&c.title)
        .bind(&c.description)
        .bind(c.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn course(&self, id: Uuid) -> StoreResult<Option<Course>> {
        query_as::<_, Course>("SELECT * FROM courses WHERE id=$1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)
    }

    async fn course_by_label(&self, label: &str) -> StoreResult<Option<Course>> {
        query_as::<_, Course>("SELECT * FROM courses WHERE label=$1")
            .bind(label)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)
    }

    async fn list_courses(&self) -> StoreResult<Vec<Course>> {
        query_as::<_, Course>("SELECT * FROM courses ORDER BY label")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)
    }

    async fn insert_user(&self, u: &User) -> StoreResult<()> {
        query(
            r#"INSERT INTO users (id, given_name, family_name, email, role, created_at)
               VALUES ($1,$2,$3,$4,$5,$6)"#,
        )
        .bind(u.id)
        .bind(&u.given_name)
        .bind(&u.family_name)
        .bind(&u.email)
        .bind(u.role.as_db_str())
        .bind(u.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn user(&self, id: Uuid) -> StoreResult<Option<User>> {
        query_as::<_, UserRow>("SELECT * FROM users WHERE id=$1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .map(User::try_from)
            .transpose()
    }

    async fn user_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        query_as::<_, UserRow>("SELECT * FROM users WHERE email=$1")
            .bind(email)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .map(User::try_from)
            .transpose()
    }

    async fn list_users(&self) -> StoreResult<Vec<User>> {
        let rows = query_as::<_, UserRow>("SELECT * FROM users ORDER BY role, family_name")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        users(rows)
    }

    async fn insert_course_tool(&self, ct: &CourseTool) -> StoreResult<()> {
        query(
            r#"INSERT INTO course_tools
               (id, course_id, tool_id, resource_link_id, resource_link_title, created_at)
               VALUES ($1,$2,$3,$4,$5,$6)"#,
        )
        .bind(ct.id)
        .bind(ct.course_id)
        .bind(ct.tool_id)
        .bind(&ct.resource_link_id)
        .bind(&ct.resource_link_title)
        .bind(ct.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn course_tool(&self, id: Uuid) -> StoreResult<Option<CourseTool>> {
        query_as::<_, CourseTool>("SELECT * FROM course_tools WHERE id=$1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)
    }

    async fn course_tool_for(&self, course_id: Uuid, tool_id: Uuid) -> StoreResult<Option<CourseTool>> {
        query_as::<_, CourseTool>("SELECT * FROM course_tools WHERE course_id=$1 AND tool_id=$2")
            .bind(course_id)
            .bind(tool_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)
    }

    async fn list_course_tools(&self, course_id: Uuid) -> StoreResult<Vec<CourseTool>> {
        query_as::<_, CourseTool>(
            "SELECT * FROM course_tools WHERE course_id=$1 ORDER BY created_at",
        )
        .bind(course_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn insert_launch_log(&self, log: &LaunchLog) -> StoreResult<()> {
        query(
            r#"INSERT INTO launch_logs
               (id, course_tool_id, user_id, launch_params, signed_params, oauth_signature, launched_at)
               VALUES ($1,$2,$3,$4,$5,$6,$7)"#,
        )
        .bind(log.id)
        .bind(log.course_tool_id)
        .bind(log.user_id)
        .bind(Json(&log.launch_params))
        .bind(Json(&log.signed_params))
        .bind(&log.oauth_signature)
        .bind(log.launched_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn launch_log(&self, id: Uuid) -> StoreResult<Option<LaunchLog>> {
        Ok(query_as::<_, LaunchLogRow>("SELECT * FROM launch_logs WHERE id=$1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .map(LaunchLog::from))
    }

    async fn list_launch_logs(&self) -> StoreResult<Vec<LaunchLog>> {
        Ok(query_as::<_, LaunchLogRow>("SELECT * FROM launch_logs ORDER BY launched_at DESC")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?
            .into_iter()
            .map(LaunchLog::from)
            .collect())
    }

    async fn latest_launch_for(&self, user_id: Uuid, course_tool_id: Uuid) -> StoreResult<Option<LaunchLog>> {
        Ok(query_as::<_, LaunchLogRow>(
            r#"SELECT * FROM launch_logs
               WHERE user_id=$1 AND course_tool_id=$2
               ORDER BY launched_at DESC LIMIT 1"#,
        )
        .bind(user_id)
        .bind(course_tool_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .map(LaunchLog::from))
    }

    async fn insert_grade(&self, g: &Grade) -> StoreResult<()> {
        query(
            r#"INSERT INTO grades
               (id, course_tool_id, user_id, launch_log_id, sourced_id, score, raw_xml, received_at)
               VALUES ($1,$2,$3,$4,$5,$6,$7,$8)"#,
        )
        .bind(g.id)
        .bind(g.course_tool_id)
        .bind(g.user_id)
        .bind(g.launch_log_id)
        .bind(&g.sourced_id)
        .bind(g.score)
        .bind(&g.raw_xml)
        .bind(g.received_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn grade(&self, id: Uuid) -> StoreResult<Option<Grade>> {
        query_as::<_, Grade>("SELECT * FROM grades WHERE id=$1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)
    }

    async fn list_grades(&self) -> StoreResult<Vec<Grade>> {
        query_as::<_, Grade>("SELECT * FROM grades ORDER BY received_at DESC")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)
    }

    async fn latest_grade_for(&self, user_id: Uuid, course_tool_id: Uuid) -> StoreResult<Option<Grade>> {
        query_as::<_, Grade>(
            r#"SELECT * FROM grades
               WHERE user_id=$1 AND course_tool_id=$2
               ORDER BY received_at DESC LIMIT 1"#,
        )
        .bind(user_id)
        .bind(course_tool_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)
    }
}

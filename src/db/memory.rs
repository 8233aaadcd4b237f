//! In-memory store, used by tests and when no database is configured.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::Store;
use crate::error::{StoreError, StoreResult};
use crate::models::{Course, CourseTool, Grade, LaunchLog, Tool, ToolServer, User};

#[derive(Debug, Default)]
struct Tables {
    tool_servers: Vec<ToolServer>,
    tools: Vec<Tool>,
    courses: Vec<Course>,
    users: Vec<User>,
    course_tools: Vec<CourseTool>,
    // append-only, insertion order
    launch_logs: Vec<LaunchLog>,
    launch_index: HashMap<Uuid, usize>,
    grades: Vec<Grade>,
    grade_index: HashMap<Uuid, usize>,
}

/// One lock over every table so uniqueness checks and inserts are atomic.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn conflict(msg: impl Into<String>) -> StoreError {
    StoreError::Conflict(msg.into())
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_tool_server(&self, server: &ToolServer) -> StoreResult<()> {
        let mut t = self.tables.write().await;
        if t.tool_servers.iter().any(|s| s.id == server.id) {
            return Err(conflict(format!("tool server {} exists", server.id)));
        }
        t.tool_servers.push(server.clone());
        Ok(())
    }

    async fn tool_server(&self, id: Uuid) -> StoreResult<Option<ToolServer>> {
        let t = self.tables.read().await;
        Ok(t.tool_servers.iter().find(|s| s.id == id).cloned())
    }

    async fn tool_server_by_address(&self, domain: &str, port: u16) -> StoreResult<Option<ToolServer>> {
        let t = self.tables.read().await;
        Ok(t.tool_servers
            .iter()
            .find(|s| s.domain == domain && s.port == port)
            .cloned())
    }

    async fn list_tool_servers(&self) -> StoreResult<Vec<ToolServer>> {
        Ok(self.tables.read().await.tool_servers.clone())
    }

    async fn insert_tool(&self, tool: &Tool) -> StoreResult<()> {
        let mut t = self.tables.write().await;
        if t.tools.iter().any(|x| x.id == tool.id) {
            return Err(conflict(format!("tool {} exists", tool.id)));
        }
        if t.tools.iter().any(|x| x.consumer_key == tool.consumer_key) {
            return Err(conflict(format!("consumer key {} is taken", tool.consumer_key)));
        }
        t.tools.push(tool.clone());
        Ok(())
    }

    async fn tool(&self, id: Uuid) -> StoreResult<Option<Tool>> {
        let t = self.tables.read().await;
        Ok(t.tools.iter().find(|x| x.id == id).cloned())
    }

    async fn tool_by_consumer_key(&self, consumer_key: &str) -> StoreResult<Option<Tool>> {
        let t = self.tables.read().await;
        Ok(t.tools.iter().find(|x| x.consumer_key == consumer_key).cloned())
    }

    async fn list_tools(&self) -> StoreResult<Vec<Tool>> {
        Ok(self.tables.read().await.tools.clone())
    }

    async fn insert_course(&self, course: &Course) -> StoreResult<()> {
        let mut t = self.tables.write().await;
        if t.courses.iter().any(|c| c.id == course.id || c.label == course.label) {
            return Err(conflict(format!("course {} exists", course.label)));
        }
        t.courses.push(course.clone());
        Ok(())
    }

    async fn course(&self, id: Uuid) -> StoreResult<Option<Course>> {
        let t = self.tables.read().await;
        Ok(t.courses.iter().find(|c| c.id == id).cloned())
    }

    async fn course_by_label(&self, label: &str) -> StoreResult<Option<Course>> {
        let t = self.tables.read().await;
        Ok(t.courses.iter().find(|c| c.label == label).cloned())
    }

    async fn list_courses(&self) -> StoreResult<Vec<Course>> {
        Ok(self.tables.read().await.courses.clone())
    }

    async fn insert_user(&self, user: &User) -> StoreResult<()> {
        let mut t = self.tables.write().await;
        if t.users.iter().any(|u| u.id == user.id || u.email == user.email) {
            return Err(conflict(format!("user {} exists", user.email)));
        }
        t.users.push(user.clone());
        Ok(())
    }

    async fn user(&self, id: Uuid) -> StoreResult<Option<User>> {
        let t = self.tables.read().await;
        Ok(t.users.iter().find(|u| u.id == id).cloned())
    }

    async fn user_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        let t = self.tables.read().await;
        Ok(t.users.iter().find(|u| u.email == email).cloned())
    }

    async fn list_users(&self) -> StoreResult<Vec<User>> {
        Ok(self.tables.read().await.users.clone())
    }

    async fn insert_course_tool(&self, binding: &CourseTool) -> StoreResult<()> {
        let mut t = self.tables.write().await;
        for existing in &t.course_tools {
            if existing.id == binding.id {
                return Err(conflict(format!("course tool {} exists", binding.id)));
            }
            if existing.resource_link_id == binding.resource_link_id {
                return Err(conflict(format!(
                    "resource_link_id {} is already bound",
                    binding.resource_link_id
                )));
            }
            if existing.course_id == binding.course_id && existing.tool_id == binding.tool_id {
                return Err(conflict(format!(
                    "tool {} is already attached to course {}",
                    binding.tool_id, binding.course_id
                )));
            }
        }
        t.course_tools.push(binding.clone());
        Ok(())
    }

    async fn course_tool(&self, id: Uuid) -> StoreResult<Option<CourseTool>> {
        let t = self.tables.read().await;
        Ok(t.course_tools.iter().find(|c| c.id == id).cloned())
    }

    async fn course_tool_for(&self, course_id: Uuid, tool_id: Uuid) -> StoreResult<Option<CourseTool>> {
        let t = self.tables.read().await;
        Ok(t.course_tools
            .iter()
            .find(|c| c.course_id == course_id && c.tool_id == tool_id)
            .cloned())
    }

    async fn list_course_tools(&self, course_id: Uuid) -> StoreResult<Vec<CourseTool>> {
        let t = self.tables.read().await;
        Ok(t.course_tools
            .iter()
            .filter(|c| c.course_id == course_id)
            .cloned()
            .collect())
    }

    async fn insert_launch_log(&self, log: &LaunchLog) -> StoreResult<()> {
        let mut t = self.tables.write().await;
        if t.launch_index.contains_key(&log.id) {
            return Err(conflict(format!("launch log {} exists", log.id)));
        }
        let idx = t.launch_logs.len();
        t.launch_logs.push(log.clone());
        t.launch_index.insert(log.id, idx);
        Ok(())
    }

    async fn launch_log(&self, id: Uuid) -> StoreResult<Option<LaunchLog>> {
        let t = self.tables.read().await;
        Ok(t.launch_index.get(&id).map(|&i| t.launch_logs[i].clone()))
    }

    async fn list_launch_logs(&self) -> StoreResult<Vec<LaunchLog>> {
        let t = self.tables.read().await;
        Ok(t.launch_logs.iter().rev().cloned().collect())
    }

    async fn latest_launch_for(&self, user_id: Uuid, course_tool_id: Uuid) -> StoreResult<Option<LaunchLog>> {
        let t = self.tables.read().await;
        Ok(t.launch_logs
            .iter()
            .rev()
            .find(|l| l.user_id == user_id && l.course_tool_id == course_tool_id)
            .cloned())
    }

    async fn insert_grade(&self, grade: &Grade) -> StoreResult<()> {
        let mut t = self.tables.write().await;
        if t.grade_index.contains_key(&grade.id) {
            return Err(conflict(format!("grade {} exists", grade.id)));
        }
        let idx = t.grades.len();
        t.grades.push(grade.clone());
        t.grade_index.insert(grade.id, idx);
        Ok(())
    }

    async fn grade(&self, id: Uuid) -> StoreResult<Option<Grade>> {
        let t = self.tables.read().await;
        Ok(t.grade_index.get(&id).map(|&i| t.grades[i].clone()))
    }

    async fn list_grades(&self) -> StoreResult<Vec<Grade>> {
        let t = self.tables.read().await;
        Ok(t.grades.iter().rev().cloned().collect())
    }

    async fn latest_grade_for(&self, user_id: Uuid, course_tool_id: Uuid) -> StoreResult<Option<Grade>> {
        let t = self.tables.read().await;
        Ok(t.grades
            .iter()
            .rev()
            .find(|g| g.user_id == user_id && g.course_tool_id == course_tool_id)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn binding(course_id: Uuid, tool_id: Uuid, link: &str) -> CourseTool {
        CourseTool {
            id: Uuid::new_v4(),
            course_id,
            tool_id,
            resource_link_id: link.into(),
            resource_link_title: "Quiz".into(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn resource_link_ids_are_unique() {
        let store = MemoryStore::new();
        let course = Uuid::new_v4();
        store.insert_course_tool(&binding(course, Uuid::new_v4(), "rl-1")).await.unwrap();

        let err = store
            .insert_course_tool(&binding(Uuid::new_v4(), Uuid::new_v4(), "rl-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn a_tool_binds_once_per_course() {
        let store = MemoryStore::new();
        let (course, tool) = (Uuid::new_v4(), Uuid::new_v4());
        store.insert_course_tool(&binding(course, tool, "rl-1")).await.unwrap();
        assert!(store.insert_course_tool(&binding(course, tool, "rl-2")).await.is_err());
        assert_eq!(store.list_course_tools(course).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn launch_logs_list_newest_first() {
        let store = MemoryStore::new();
        let (user, ct) = (Uuid::new_v4(), Uuid::new_v4());
        let mut ids = Vec::new();
        for sig in ["a", "b", "c"] {
            let log = LaunchLog {
                id: Uuid::new_v4(),
                course_tool_id: ct,
                user_id: user,
                launch_params: Default::default(),
                signed_params: Default::default(),
                oauth_signature: sig.into(),
                launched_at: Utc::now(),
            };
            store.insert_launch_log(&log).await.unwrap();
            ids.push(log.id);
        }
        let listed: Vec<Uuid> = store.list_launch_logs().await.unwrap().iter().map(|l| l.id).collect();
        assert_eq!(listed, ids.iter().rev().cloned().collect::<Vec<_>>());
        assert_eq!(
            store.latest_launch_for(user, ct).await.unwrap().unwrap().oauth_signature,
            "c"
        );
        assert!(store.latest_launch_for(Uuid::new_v4(), ct).await.unwrap().is_none());
    }
}

//! Startup seeding of demo entities. Safe to run on every boot.

use chrono::Utc;
use uuid::Uuid;

use crate::db::Store;
use crate::error::HarnessResult;
use crate::models::{Course, CourseTool, ParamMap, Role, Tool, ToolServer, User};

const COURSES: &[(&str, &str, &str)] = &[
    ("CS101", "Introduction to Python", "Learn the basics of Python programming"),
    ("WEB201", "Web Development", "Build modern web applications"),
    ("DS301", "Data Science Fundamentals", "Introduction to data analysis and machine learning"),
];

const USERS: &[(&str, &str, &str, Role)] = &[
    ("Alice", "Smith", "alice.smith@example.edu", Role::Instructor),
    ("Bob", "Johnson", "bob.johnson@example.edu", Role::Instructor),
    ("Charlie", "Brown", "charlie.brown@example.edu", Role::Learner),
    ("Diana", "Prince", "diana.prince@example.edu", Role::Learner),
    ("Edward", "Norton", "edward.norton@example.edu", Role::Learner),
    ("Fiona", "Green", "fiona.green@example.edu", Role::Learner),
];

const SAMPLE_DOMAIN: &str = "localhost";
const SAMPLE_PORT: u16 = 8080;
const SAMPLE_KEY: &str = "test_key";
const SAMPLE_SECRET: &str = "test_secret";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SeedReport {
    pub courses: usize,
    pub users: usize,
    pub tool_servers: usize,
    pub tools: usize,
    pub course_tools: usize,
}

/// Inserts whatever demo records are missing, matched by natural key.
pub async fn seed_demo_data(store: &dyn Store) -> HarnessResult<SeedReport> {
    let mut report = SeedReport::default();

    let mut first_course = None;
    for (label, title, description) in COURSES {
        let course = match store.course_by_label(label).await? {
            Some(existing) => existing,
            None => {
                let course = Course {
                    id: Uuid::new_v4(),
                    label: label.to_string(),
                    title: title.to_string(),
                    description: Some(description.to_string()),
                    created_at: Utc::now(),
                };
                store.insert_course(&course).await?;
                report.courses += 1;
                course
            }
        };
        first_course.get_or_insert(course);
    }

    for (given, family, email, role) in USERS {
        if store.user_by_email(email).await?.is_none() {
            store
                .insert_user(&User {
                    id: Uuid::new_v4(),
                    given_name: given.to_string(),
                    family_name: family.to_string(),
                    email: email.to_string(),
                    role: *role,
                    created_at: Utc::now(),
                })
                .await?;
            report.users += 1;
        }
    }

    let server = match store.tool_server_by_address(SAMPLE_DOMAIN, SAMPLE_PORT).await? {
        Some(existing) => existing,
        None => {
            let server = ToolServer {
                id: Uuid::new_v4(),
                name: "Sample Tool Server".into(),
                domain: SAMPLE_DOMAIN.into(),
                port: SAMPLE_PORT,
                description: Some("sample tool provider on port 8080".into()),
                created_at: Utc::now(),
            };
            store.insert_tool_server(&server).await?;
            report.tool_servers += 1;
            server
        }
    };

    let tool = match store.tool_by_consumer_key(SAMPLE_KEY).await? {
        Some(existing) => existing,
        None => {
            let tool = Tool {
                id: Uuid::new_v4(),
                tool_server_id: server.id,
                name: "Sample LTI Tool".into(),
                launch_path: "/lti/launch".into(),
                consumer_key: SAMPLE_KEY.into(),
                consumer_secret: SAMPLE_SECRET.into(),
                custom_params: ParamMap::new(),
                launch_url_override: None,
                created_at: Utc::now(),
            };
            store.insert_tool(&tool).await?;
            report.tools += 1;
            tool
        }
    };

    if let Some(course) = first_course {
        if store.course_tool_for(course.id, tool.id).await?.is_none() {
            store
                .insert_course_tool(&CourseTool {
                    id: Uuid::new_v4(),
                    course_id: course.id,
                    tool_id: tool.id,
                    resource_link_id: Uuid::new_v4().to_string(),
                    resource_link_title: tool.name.clone(),
                    created_at: Utc::now(),
                })
                .await?;
            report.course_tools += 1;
        }
    }

    tracing::info!(?report, "demo data seeded");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;

    #[tokio::test]
    async fn seeding_is_idempotent() {
        let store = MemoryStore::new();
        let first = seed_demo_data(&store).await.unwrap();
        assert_eq!(
            first,
            SeedReport { courses: 3, users: 6, tool_servers: 1, tools: 1, course_tools: 1 }
        );

        let second = seed_demo_data(&store).await.unwrap();
        assert_eq!(second, SeedReport::default());
        assert_eq!(store.list_courses().await.unwrap().len(), 3);
        assert_eq!(store.list_users().await.unwrap().len(), 6);
    }

    #[tokio::test]
    async fn seeded_binding_is_launchable() {
        let store = MemoryStore::new();
        seed_demo_data(&store).await.unwrap();

        let cs101 = store.course_by_label("CS101").await.unwrap().unwrap();
        let bindings = store.list_course_tools(cs101.id).await.unwrap();
        assert_eq!(bindings.len(), 1);
        let tool = store.tool(bindings[0].tool_id).await.unwrap().unwrap();
        assert_eq!(tool.consumer_key, "test_key");
    }
}

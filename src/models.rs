use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// LTI parameter name -> value. Keys are unique; ordering is cosmetic.
pub type ParamMap = BTreeMap<String, String>;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[serde(alias = "teacher")]
    Instructor,
    #[serde(alias = "student")]
    Learner,
}

impl Role {
    /// Value sent in the `roles` launch parameter.
    pub fn as_lti_str(self) -> &'static str {
        match self {
            Role::Instructor => "Instructor",
            Role::Learner => "Learner",
        }
    }

    pub fn as_db_str(self) -> &'static str {
        match self {
            Role::Instructor => "instructor",
            Role::Learner => "learner",
        }
    }
}

#[derive(Error, Debug)]
#[error("unknown role: {0}")]
pub struct UnknownRole(pub String);

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "instructor" | "teacher" => Ok(Role::Instructor),
            "learner" | "student" => Ok(Role::Learner),
            _ => Err(UnknownRole(s.to_string())),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ToolServer {
    pub id: Uuid,
    pub name: String,
    pub domain: String, // host, optionally with scheme, e.g. "localhost" or "https://tool.test"
    pub port: u16,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ToolServer {
    pub fn base_url(&self) -> String {
        let domain = self.domain.trim_end_matches('/');
        if domain.contains("://") {
            format!("{}:{}", domain, self.port)
        } else {
            format!("http://{}:{}", domain, self.port)
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Tool {
    pub id: Uuid,
    pub tool_server_id: Uuid,
    pub name: String,
    pub launch_path: String,
    pub consumer_key: String,
    #[serde(skip_serializing, default)]
    pub consumer_secret: String,
    pub custom_params: ParamMap,
    pub launch_url_override: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Tool {
    pub fn launch_url(&self, server: &ToolServer) -> String {
        match &self.launch_url_override {
            Some(url) if !url.trim().is_empty() => url.trim().to_string(),
            _ => format!("{}{}", server.base_url(), self.launch_path),
        }
    }
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct Course {
    pub id: Uuid,
    pub label: String,
    pub title: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Course {
    pub fn context_id(&self) -> String {
        self.id.to_string()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct User {
    pub id: Uuid,
    pub given_name: String,
    pub family_name: String,
    pub email: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn full_name(&self) -> String {
        match (self.given_name.is_empty(), self.family_name.is_empty()) {
            (false, false) => format!("{} {}", self.given_name, self.family_name),
            (false, true) => self.given_name.clone(),
            (true, _) => self.family_name.clone(),
        }
    }
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct CourseTool {
    pub id: Uuid,
    pub course_id: Uuid,
    pub tool_id: Uuid,
    pub resource_link_id: String,
    pub resource_link_title: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LaunchLog {
    pub id: Uuid,
    pub course_tool_id: Uuid,
    pub user_id: Uuid,
    pub launch_params: ParamMap,
    pub signed_params: ParamMap,
    pub oauth_signature: String,
    pub launched_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct Grade {
    pub id: Uuid,
    pub course_tool_id: Uuid,
    pub user_id: Uuid,
    pub launch_log_id: Uuid,
    pub sourced_id: String,
    pub score: f64,
    pub raw_xml: String,
    pub received_at: DateTime<Utc>,
}

// --- admin collaborator payloads ---

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct NewToolServer {
    pub name: String,
    pub domain: String,
    pub port: u32,
    pub description: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct NewTool {
    pub tool_server_id: Uuid,
    pub name: String,
    pub launch_path: Option<String>,
    pub consumer_key: String,
    pub consumer_secret: String,
    #[serde(default)]
    pub custom_params: ParamMap,
    pub launch_url_override: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AttachToolReq {
    pub tool_id: Uuid,
    pub resource_link_title: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LaunchQuery {
    pub user_id: Uuid,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SendGradeReq {
    pub score: f64,
}

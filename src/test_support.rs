use chrono::Utc;
use uuid::Uuid;

use crate::config::HarnessConfig;
use crate::db::Store;
use crate::launch;
use crate::models::{Course, CourseTool, LaunchLog, ParamMap, Role, Tool, ToolServer, User};
use crate::oauth::{self, Credentials};
use crate::outcomes::InboundOutcome;
use crate::params::LaunchContext;
use crate::tool_client;

/// A consistent server/tool/course/binding plus one user of each role.
pub struct Fixture {
    pub server: ToolServer,
    pub tool: Tool,
    pub course: Course,
    pub course_tool: CourseTool,
    pub learner: User,
    pub instructor: User,
}

pub type Seeded = Fixture;

fn user(given: &str, family: &str, email: &str, role: Role) -> User {
    User {
        id: Uuid::new_v4(),
        given_name: given.into(),
        family_name: family.into(),
        email: email.into(),
        role,
        created_at: Utc::now(),
    }
}

impl Fixture {
    pub fn new() -> Self {
        let server = ToolServer {
            id: Uuid::new_v4(),
            name: "Sample Tool Server".into(),
            domain: "localhost".into(),
            port: 8080,
            description: None,
            created_at: Utc::now(),
        };
        let tool = Tool {
            id: Uuid::new_v4(),
            tool_server_id: server.id,
            name: "Sample LTI Tool".into(),
            launch_path: "/lti/launch".into(),
            consumer_key: "test_key".into(),
            consumer_secret: "test_secret".into(),
            custom_params: ParamMap::new(),
            launch_url_override: None,
            created_at: Utc::now(),
        };
        let course = Course {
            id: Uuid::new_v4(),
            label: "CS101".into(),
            title: "Introduction to Python".into(),
            description: None,
            created_at: Utc::now(),
        };
        let course_tool = CourseTool {
            id: Uuid::new_v4(),
            course_id: course.id,
            tool_id: tool.id,
            resource_link_id: Uuid::new_v4().to_string(),
            resource_link_title: "Sample LTI Tool".into(),
            created_at: Utc::now(),
        };
        Self {
            server,
            tool,
            course,
            course_tool,
            learner: user("Charlie", "Brown", "charlie.brown@example.edu", Role::Learner),
            instructor: user("Alice", "Smith", "alice.smith@example.edu", Role::Instructor),
        }
    }

    pub fn context<'a>(&'a self, user: &'a User) -> LaunchContext<'a> {
        LaunchContext::new(&self.server, &self.tool, &self.course, user, &self.course_tool)
    }
}

pub async fn seed(store: &dyn Store) -> Seeded {
    seed_fixture(store, Fixture::new()).await
}

pub async fn seed_fixture(store: &dyn Store, fx: Fixture) -> Seeded {
    store.insert_tool_server(&fx.server).await.unwrap();
    store.insert_tool(&fx.tool).await.unwrap();
    store.insert_course(&fx.course).await.unwrap();
    store.insert_user(&fx.learner).await.unwrap();
    store.insert_user(&fx.instructor).await.unwrap();
    store.insert_course_tool(&fx.course_tool).await.unwrap();
    fx
}

pub async fn launch_as(store: &dyn Store, seeded: &Seeded, user_id: Uuid) -> LaunchLog {
    launch::prepare_launch(store, &HarnessConfig::default(), seeded.course_tool.id, user_id)
        .await
        .unwrap()
        .log
}

pub fn replace_result_envelope(message_id: &str, sourced_id: &str, score: &str) -> String {
    tool_client::replace_result_xml(message_id, sourced_id, score)
}

/// Signs `body` as the seeded tool would when posting to the default outcomes URL.
pub fn signed_outcome(body: &str, secret: &str) -> InboundOutcome {
    let url = HarnessConfig::default().outcomes_url();
    let req = tool_client::sign_outcome(
        &url,
        Credentials { consumer_key: "test_key", consumer_secret: secret },
        body.to_string(),
    )
    .unwrap();
    InboundOutcome {
        url: req.url,
        authorization: Some(req.authorization),
        body: req.body.into_bytes(),
    }
}

/// Same as [`signed_outcome`] for arbitrary bytes, hashed exactly as sent.
pub fn signed_outcome_bytes(body: Vec<u8>, secret: &str) -> InboundOutcome {
    let url = HarnessConfig::default().outcomes_url();
    let mut params = ParamMap::new();
    params.insert("oauth_body_hash".into(), oauth::body_hash(&body));
    let signed = oauth::sign(
        "POST",
        &url,
        &params,
        Credentials { consumer_key: "test_key", consumer_secret: secret },
    )
    .unwrap();
    InboundOutcome {
        url,
        authorization: Some(oauth::authorization_header(&signed.params)),
        body,
    }
}

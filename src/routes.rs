use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode, Uri},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::HarnessConfig;
use crate::db::Db;
use crate::error::{HarnessError, HarnessResult};
use crate::models::*;
use crate::outcomes::{self, InboundOutcome};
use crate::{launch, params, tool_client};

#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub config: Arc<HarnessConfig>,
    pub http: reqwest::Client,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        // launch + outcomes
        .route("/launch/:course_tool_id", get(launch_tool))
        .route("/outcomes", post(receive_outcome))
        // admin collaborator surface
        .route("/api/tool-servers", get(list_tool_servers).post(create_tool_server))
        .route("/api/tools", get(list_tools).post(create_tool))
        .route("/api/courses", get(list_courses))
        .route("/api/courses/:course_id/tools", get(list_course_tools).post(attach_tool))
        .route("/api/users", get(list_users))
        // read-only audit views
        .route("/api/launch-logs", get(list_launch_logs))
        .route("/api/launch-logs/:id", get(get_launch_log))
        .route("/api/launch-logs/:id/send-grade", post(send_grade))
        .route("/api/grades", get(list_grades))
        .route("/api/grades/:id", get(get_grade))
        .with_state(state)
}

// --- launch ---

async fn launch_tool(
    State(st): State<AppState>,
    Path(course_tool_id): Path<Uuid>,
    Query(q): Query<LaunchQuery>,
) -> HarnessResult<Html<String>> {
    let prepared = launch::prepare_launch(st.db.as_ref(), &st.config, course_tool_id, q.user_id).await?;
    Ok(Html(launch::auto_submit_form(
        &prepared.launch_url,
        &prepared.log.signed_params,
    )))
}

// --- outcomes ---

async fn receive_outcome(
    State(st): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    // sign against the URL tools were given, plus whatever query they sent
    let url = match uri.query() {
        Some(q) => format!("{}?{}", st.config.outcomes_url(), q),
        None => st.config.outcomes_url(),
    };
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let inbound = InboundOutcome { url, authorization, body: body.to_vec() };
    let resp = outcomes::receive(st.db.as_ref(), &inbound).await;
    (
        resp.status,
        [(header::CONTENT_TYPE, "application/xml")],
        resp.render(),
    )
        .into_response()
}

// --- tool servers / tools ---

async fn list_tool_servers(State(st): State<AppState>) -> HarnessResult<Json<Vec<ToolServer>>> {
    Ok(Json(st.db.list_tool_servers().await?))
}

async fn create_tool_server(
    State(st): State<AppState>,
    Json(req): Json<NewToolServer>,
) -> HarnessResult<(StatusCode, Json<ToolServer>)> {
    let name = required("name", &req.name)?;
    let domain = required("domain", &req.domain)?;
    let port = u16::try_from(req.port)
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| HarnessError::Configuration(format!("invalid port {}", req.port)))?;

    let server = ToolServer {
        id: Uuid::new_v4(),
        name,
        domain,
        port,
        description: req.description,
        created_at: Utc::now(),
    };
    params::validate_endpoint(&server.base_url())?;
    st.db.insert_tool_server(&server).await.map_err(HarnessError::from_create)?;
    Ok((StatusCode::CREATED, Json(server)))
}

async fn list_tools(State(st): State<AppState>) -> HarnessResult<Json<Vec<Tool>>> {
    Ok(Json(st.db.list_tools().await?))
}

async fn create_tool(
    State(st): State<AppState>,
    Json(req): Json<NewTool>,
) -> HarnessResult<(StatusCode, Json<Tool>)> {
    let name = required("name", &req.name)?;
    let consumer_key = required("consumer_key", &req.consumer_key)?;
    if req.consumer_secret.is_empty() {
        return Err(HarnessError::Configuration("consumer_secret is required".into()));
    }
    let launch_path = req.launch_path.unwrap_or_else(|| "/lti/launch".into());
    if !launch_path.starts_with('/') {
        return Err(HarnessError::Configuration(format!(
            "launch_path must start with '/': {launch_path}"
        )));
    }
    let server = st.db.tool_server(req.tool_server_id).await?.ok_or_else(|| {
        HarnessError::Configuration(format!("tool server {} does not exist", req.tool_server_id))
    })?;
    // reject collisions now rather than at launch time
    params::namespaced_custom_params(&req.custom_params)?;
    let launch_url_override = req.launch_url_override.filter(|u| !u.trim().is_empty());

    let tool = Tool {
        id: Uuid::new_v4(),
        tool_server_id: req.tool_server_id,
        name,
        launch_path,
        consumer_key,
        consumer_secret: req.consumer_secret,
        custom_params: req.custom_params,
        launch_url_override,
        created_at: Utc::now(),
    };
    params::validate_endpoint(&tool.launch_url(&server))?;
    st.db.insert_tool(&tool).await.map_err(HarnessError::from_create)?;
    tracing::info!(tool_id = %tool.id, consumer_key = %tool.consumer_key, "tool created");
    Ok((StatusCode::CREATED, Json(tool)))
}

// --- courses / users ---

async fn list_courses(State(st): State<AppState>) -> HarnessResult<Json<Vec<Course>>> {
    Ok(Json(st.db.list_courses().await?))
}

async fn list_users(State(st): State<AppState>) -> HarnessResult<Json<Vec<User>>> {
    Ok(Json(st.db.list_users().await?))
}

async fn list_course_tools(
    State(st): State<AppState>,
    Path(course_id): Path<Uuid>,
) -> HarnessResult<Json<Vec<CourseTool>>> {
    if st.db.course(course_id).await?.is_none() {
        return Err(HarnessError::NotFound(format!("course {course_id}")));
    }
    Ok(Json(st.db.list_course_tools(course_id).await?))
}

async fn attach_tool(
    State(st): State<AppState>,
    Path(course_id): Path<Uuid>,
    Json(req): Json<AttachToolReq>,
) -> HarnessResult<(StatusCode, Json<CourseTool>)> {
    if st.db.course(course_id).await?.is_none() {
        return Err(HarnessError::NotFound(format!("course {course_id}")));
    }
    let tool = st
        .db
        .tool(req.tool_id)
        .await?
        .ok_or_else(|| HarnessError::Configuration(format!("tool {} does not exist", req.tool_id)))?;

    let binding = CourseTool {
        id: Uuid::new_v4(),
        course_id,
        tool_id: tool.id,
        // minted once; outcomes correlation depends on it never changing
        resource_link_id: Uuid::new_v4().to_string(),
        resource_link_title: req
            .resource_link_title
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| tool.name.clone()),
        created_at: Utc::now(),
    };
    st.db.insert_course_tool(&binding).await.map_err(HarnessError::from_create)?;
    Ok((StatusCode::CREATED, Json(binding)))
}

// --- launch logs / grades ---

async fn list_launch_logs(State(st): State<AppState>) -> HarnessResult<Json<Vec<LaunchLog>>> {
    Ok(Json(st.db.list_launch_logs().await?))
}

async fn get_launch_log(
    State(st): State<AppState>,
    Path(id): Path<Uuid>,
) -> HarnessResult<Json<LaunchLog>> {
    st.db
        .launch_log(id)
        .await?
        .map(Json)
        .ok_or_else(|| HarnessError::NotFound(format!("launch log {id}")))
}

async fn send_grade(
    State(st): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<SendGradeReq>,
) -> HarnessResult<Json<tool_client::DeliveryReport>> {
    let log = st
        .db
        .launch_log(id)
        .await?
        .ok_or_else(|| HarnessError::NotFound(format!("launch log {id}")))?;
    let course_tool = st.db.course_tool(log.course_tool_id).await?.ok_or_else(|| {
        HarnessError::Configuration(format!("course tool {} is missing", log.course_tool_id))
    })?;
    let tool = st.db.tool(course_tool.tool_id).await?.ok_or_else(|| {
        HarnessError::Configuration(format!("tool {} is missing", course_tool.tool_id))
    })?;
    Ok(Json(tool_client::send_grade(&st.http, &log, &tool, req.score).await?))
}

async fn list_grades(State(st): State<AppState>) -> HarnessResult<Json<Vec<Grade>>> {
    Ok(Json(st.db.list_grades().await?))
}

async fn get_grade(State(st): State<AppState>, Path(id): Path<Uuid>) -> HarnessResult<Json<Grade>> {
    st.db
        .grade(id)
        .await?
        .map(Json)
        .ok_or_else(|| HarnessError::NotFound(format!("grade {id}")))
}

// --- helpers ---
fn required(field: &str, value: &str) -> HarnessResult<String> {
    let v = value.trim();
    if v.is_empty() {
        return Err(HarnessError::Configuration(format!("{field} is required")));
    }
    Ok(v.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MemoryStore, Store};
    use crate::oauth::{self, Credentials};
    use crate::test_support::{self, replace_result_envelope, signed_outcome};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    fn app(store: Arc<MemoryStore>) -> Router {
        router(AppState {
            db: store,
            config: Arc::new(HarnessConfig::default()),
            http: reqwest::Client::new(),
        })
    }

    async fn body_text(resp: Response) -> String {
        let bytes = to_bytes(resp.into_body(), 1024 * 1024).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn launch_renders_signed_form() {
        let store = Arc::new(MemoryStore::new());
        let seeded = test_support::seed(store.as_ref()).await;

        let resp = app(store.clone())
            .oneshot(
                Request::builder()
                    .uri(format!(
                        "/launch/{}?user_id={}",
                        seeded.course_tool.id, seeded.instructor.id
                    ))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let html = body_text(resp).await;
        assert!(html.contains("action=\"http://localhost:8080/lti/launch\""));
        assert!(html.contains("name=\"oauth_signature\""));
        assert!(html.contains("value=\"Instructor\""));
        assert_eq!(store.list_launch_logs().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn launch_for_unknown_binding_is_404() {
        let store = Arc::new(MemoryStore::new());
        let seeded = test_support::seed(store.as_ref()).await;
        let resp = app(store)
            .oneshot(
                Request::builder()
                    .uri(format!("/launch/{}?user_id={}", Uuid::new_v4(), seeded.learner.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn outcomes_endpoint_stores_grade() {
        let store = Arc::new(MemoryStore::new());
        let seeded = test_support::seed(store.as_ref()).await;
        let log = test_support::launch_as(store.as_ref(), &seeded, seeded.learner.id).await;
        let inbound = signed_outcome(
            &replace_result_envelope("msg-7", &log.signed_params["lis_result_sourcedid"], "0.85"),
            "test_secret",
        );

        let resp = app(store.clone())
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/outcomes")
                    .header(header::AUTHORIZATION, inbound.authorization.unwrap())
                    .header(header::CONTENT_TYPE, "application/xml")
                    .body(Body::from(inbound.body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let xml = body_text(resp).await;
        assert!(xml.contains("<imsx_codeMajor>success</imsx_codeMajor>"), "{xml}");
        assert!(xml.contains("<imsx_messageRefIdentifier>msg-7</imsx_messageRefIdentifier>"));

        let grades = store.list_grades().await.unwrap();
        assert_eq!(grades.len(), 1);
        assert_eq!(grades[0].launch_log_id, log.id);
    }

    #[tokio::test]
    async fn outcomes_endpoint_accepts_query_oauth() {
        let store = Arc::new(MemoryStore::new());
        let seeded = test_support::seed(store.as_ref()).await;
        let log = test_support::launch_as(store.as_ref(), &seeded, seeded.learner.id).await;
        let body = replace_result_envelope("msg-q", &log.signed_params["lis_result_sourcedid"], "0.6");

        let mut params = ParamMap::new();
        params.insert("oauth_body_hash".into(), oauth::body_hash(body.as_bytes()));
        let signed = oauth::sign(
            "POST",
            &HarnessConfig::default().outcomes_url(),
            &params,
            Credentials { consumer_key: "test_key", consumer_secret: "test_secret" },
        )
        .unwrap();
        let query: Vec<String> = signed
            .params
            .iter()
            .map(|(k, v)| format!("{}={}", oauth::encode(k), oauth::encode(v)))
            .collect();

        let resp = app(store.clone())
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/outcomes?{}", query.join("&")))
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let xml = body_text(resp).await;
        assert!(xml.contains("<imsx_codeMajor>success</imsx_codeMajor>"), "{xml}");
        assert_eq!(store.list_grades().await.unwrap()[0].score, 0.6);
    }

    #[tokio::test]
    async fn non_utf8_outcome_gets_failure_envelope() {
        let store = Arc::new(MemoryStore::new());
        let seeded = test_support::seed(store.as_ref()).await;
        let log = test_support::launch_as(store.as_ref(), &seeded, seeded.learner.id).await;
        let mut body =
            replace_result_envelope("m", &log.signed_params["lis_result_sourcedid"], "0.5").into_bytes();
        body.push(0xff);
        let inbound = test_support::signed_outcome_bytes(body, "test_secret");

        let resp = app(store.clone())
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/outcomes")
                    .header(header::AUTHORIZATION, inbound.authorization.unwrap())
                    .body(Body::from(inbound.body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/xml"
        );
        assert!(body_text(resp).await.contains("<imsx_codeMajor>failure</imsx_codeMajor>"));
        assert!(store.list_grades().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unusable_server_address_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let resp = app(store.clone())
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/tool-servers")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"name":"Broken","domain":"bad host","port":8080}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(store.list_tool_servers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unsigned_outcome_gets_failure_envelope() {
        let store = Arc::new(MemoryStore::new());
        test_support::seed(store.as_ref()).await;
        let resp = app(store.clone())
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/outcomes")
                    .body(Body::from(replace_result_envelope("m", "x", "0.5")))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert!(body_text(resp).await.contains("<imsx_codeMajor>failure</imsx_codeMajor>"));
        assert!(store.list_grades().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn attach_mints_unique_resource_links() {
        let store = Arc::new(MemoryStore::new());
        let seeded = test_support::seed(store.as_ref()).await;
        let other = Course {
            id: Uuid::new_v4(),
            label: "WEB201".into(),
            title: "Web Development".into(),
            description: None,
            created_at: Utc::now(),
        };
        store.insert_course(&other).await.unwrap();

        let attach = |course_id: Uuid| {
            Request::builder()
                .method("POST")
                .uri(format!("/api/courses/{course_id}/tools"))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(format!(r#"{{"tool_id":"{}"}}"#, seeded.tool.id)))
                .unwrap()
        };

        let resp = app(store.clone()).oneshot(attach(other.id)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let created: CourseTool = serde_json::from_str(&body_text(resp).await).unwrap();
        assert_ne!(created.resource_link_id, seeded.course_tool.resource_link_id);
        assert_eq!(created.resource_link_title, "Sample LTI Tool");

        // second attach of the same tool to the same course collides
        let resp = app(store.clone()).oneshot(attach(other.id)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn create_tool_validates_and_hides_secret() {
        let store = Arc::new(MemoryStore::new());
        let seeded = test_support::seed(store.as_ref()).await;
        let post = |body: String| {
            Request::builder()
                .method("POST")
                .uri("/api/tools")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body))
                .unwrap()
        };

        let ok = format!(
            r#"{{"tool_server_id":"{}","name":"Quiz","consumer_key":"quiz","consumer_secret":"s3cret","custom_params":{{"Level":"2"}}}}"#,
            seeded.server.id
        );
        let resp = app(store.clone()).oneshot(post(ok)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let body = body_text(resp).await;
        assert!(!body.contains("s3cret"));

        let dup_key = format!(
            r#"{{"tool_server_id":"{}","name":"Again","consumer_key":"test_key","consumer_secret":"x"}}"#,
            seeded.server.id
        );
        let resp = app(store.clone()).oneshot(post(dup_key)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let bad_path = format!(
            r#"{{"tool_server_id":"{}","name":"Bad","launch_path":"lti","consumer_key":"bad","consumer_secret":"x"}}"#,
            seeded.server.id
        );
        let resp = app(store.clone()).oneshot(post(bad_path)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let bad_override = format!(
            r#"{{"tool_server_id":"{}","name":"Elsewhere","consumer_key":"else","consumer_secret":"x","launch_url_override":"http://bad host/lti"}}"#,
            seeded.server.id
        );
        let resp = app(store).oneshot(post(bad_override)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}

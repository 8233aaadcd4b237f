//! LTI 1.1 Basic Outcomes Service receiver (IMS POX envelopes).

use axum::http::StatusCode;
use chrono::Utc;
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::fmt;
use uuid::Uuid;

use crate::db::Store;
use crate::error::{HarnessError, HarnessResult};
use crate::models::{CourseTool, Grade, LaunchLog, Tool, User};
use crate::oauth;
use crate::params::SourcedId;

pub const POX_NAMESPACE: &str = "http://www.imsglobal.org/services/ltiv1p1/xsd/imsoms_v1p0";

const ROOT: &str = "imsx_POXEnvelopeRequest";
const MESSAGE_ID_PATH: &[&str] = &[
    ROOT,
    "imsx_POXHeader",
    "imsx_POXRequestHeaderInfo",
    "imsx_messageIdentifier",
];
const SOURCED_ID_TAIL: &[&str] = &["resultRecord", "sourcedGUID", "sourcedId"];
const SCORE_TAIL: &[&str] = &["resultRecord", "result", "resultScore", "textString"];

#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    ReplaceResult { sourced_id: String, score: f64 },
    ReadResult { sourced_id: String },
    /// Any other `*Request` body, by name without the suffix.
    Unsupported(String),
}

impl Operation {
    pub fn name(&self) -> &str {
        match self {
            Operation::ReplaceResult { .. } => "replaceResult",
            Operation::ReadResult { .. } => "readResult",
            Operation::Unsupported(name) => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PoxRequest {
    pub message_identifier: Option<String>,
    pub operation: Operation,
}

fn local_name(tag: &BytesStart<'_>) -> String {
    let full = String::from_utf8_lossy(tag.name().as_ref()).to_string();
    full.split(':').last().unwrap_or(&full).to_string()
}

fn parse_err(msg: impl Into<String>) -> HarnessError {
    HarnessError::Parse(msg.into())
}

/// Decimal in [0.0, 1.0]; anything else is a parse failure.
pub fn parse_score(raw: &str) -> HarnessResult<f64> {
    let trimmed = raw.trim();
    let valid_chars = !trimmed.is_empty()
        && trimmed
            .chars()
            .all(|c| c.is_ascii_digit() || c == '.' || c == '+' || c == '-');
    if !valid_chars {
        return Err(parse_err(format!("score {raw:?} is not a decimal")));
    }
    let score: f64 = trimmed
        .parse()
        .map_err(|_| parse_err(format!("score {raw:?} is not a decimal")))?;
    if !(0.0..=1.0).contains(&score) {
        return Err(parse_err(format!("score {score} is outside [0.0, 1.0]")));
    }
    // -0 collapses to 0
    Ok(score + 0.0)
}

pub fn parse_pox_request(xml: &str) -> HarnessResult<PoxRequest> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);
    let mut buf = Vec::new();

    let mut path: Vec<String> = Vec::new();
    let mut saw_root = false;
    let mut operation: Option<String> = None;
    let mut message_identifier: Option<String> = None;
    let mut sourced_id: Option<String> = None;
    let mut score: Option<String> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = local_name(&e);
                if path.is_empty() {
                    if saw_root || name != ROOT {
                        return Err(parse_err(format!("unexpected root element <{name}>")));
                    }
                    saw_root = true;
                }
                // first element under imsx_POXBody names the operation
                if path.len() == 2 && path[1] == "imsx_POXBody" && operation.is_none() {
                    operation = Some(name.clone());
                }
                path.push(name);
            }
            Ok(Event::Empty(e)) => {
                let name = local_name(&e);
                if path.is_empty() {
                    return Err(parse_err(format!("unexpected root element <{name}/>")));
                }
                if path.len() == 2 && path[1] == "imsx_POXBody" && operation.is_none() {
                    operation = Some(name);
                }
            }
            Ok(Event::End(_)) => {
                path.pop();
            }
            Ok(Event::Text(t)) => {
                let text = t
                    .unescape()
                    .map_err(|e| parse_err(format!("bad text content: {e}")))?;
                collect(&path, &text, &mut message_identifier, &mut sourced_id, &mut score);
            }
            Ok(Event::CData(c)) => {
                let text = String::from_utf8_lossy(&c.into_inner()).into_owned();
                collect(&path, &text, &mut message_identifier, &mut sourced_id, &mut score);
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(parse_err(format!("malformed XML: {e}"))),
            _ => {}
        }
        buf.clear();
    }

    if !saw_root {
        return Err(parse_err("missing imsx_POXEnvelopeRequest"));
    }
    if !path.is_empty() {
        return Err(parse_err(format!("unclosed element <{}>", path.join("/"))));
    }

    let op = operation.ok_or_else(|| parse_err("imsx_POXBody carries no operation"))?;
    let op = op
        .strip_suffix("Request")
        .ok_or_else(|| parse_err(format!("{op} is not a request element")))?
        .to_string();

    let require_sourced_id = |id: Option<String>| {
        id.filter(|s| !s.trim().is_empty())
            .map(|s| s.trim().to_string())
            .ok_or_else(|| parse_err("missing sourcedId"))
    };

    let operation = match op.as_str() {
        "replaceResult" => {
            let sourced_id = require_sourced_id(sourced_id)?;
            let raw = score.ok_or_else(|| parse_err("missing resultScore/textString"))?;
            Operation::ReplaceResult { sourced_id, score: parse_score(&raw)? }
        }
        "readResult" => Operation::ReadResult { sourced_id: require_sourced_id(sourced_id)? },
        _ => Operation::Unsupported(op),
    };

    Ok(PoxRequest {
        message_identifier: message_identifier.map(|s| s.trim().to_string()),
        operation,
    })
}

fn collect(
    path: &[String],
    text: &str,
    message_identifier: &mut Option<String>,
    sourced_id: &mut Option<String>,
    score: &mut Option<String>,
) {
    let is = |want: &[&str]| path.len() == want.len() && path.iter().zip(want).all(|(a, b)| a == b);
    // body paths: ROOT / imsx_POXBody / <op>Request / ...tail
    let body_tail = |tail: &[&str]| {
        path.len() == 3 + tail.len()
            && path[0] == ROOT
            && path[1] == "imsx_POXBody"
            && path[3..].iter().zip(tail).all(|(a, b)| a == b)
    };

    let slot = if is(MESSAGE_ID_PATH) {
        message_identifier
    } else if body_tail(SOURCED_ID_TAIL) {
        sourced_id
    } else if body_tail(SCORE_TAIL) {
        score
    } else {
        return;
    };
    slot.get_or_insert_with(String::new).push_str(text);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeMajor {
    Success,
    Failure,
    Unsupported,
}

impl CodeMajor {
    pub fn as_str(self) -> &'static str {
        match self {
            CodeMajor::Success => "success",
            CodeMajor::Failure => "failure",
            CodeMajor::Unsupported => "unsupported",
        }
    }

    fn severity(self) -> &'static str {
        match self {
            CodeMajor::Success => "status",
            CodeMajor::Failure => "error",
            CodeMajor::Unsupported => "warning",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoxResponse {
    pub status: StatusCode,
    pub code_major: CodeMajor,
    pub description: String,
    pub message_ref: Option<String>,
    pub operation: String,
    /// Inner XML of the `<{operation}Response>` element, if any.
    pub body: Option<String>,
}

impl PoxResponse {
    pub fn render(&self) -> String {
        let message_id = Uuid::new_v4();
        let message_ref = self.message_ref.as_deref().unwrap_or("");
        let body = match &self.body {
            Some(inner) => format!("<{op}Response>{inner}</{op}Response>", op = self.operation),
            None => format!("<{}Response/>", self.operation),
        };
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<imsx_POXEnvelopeResponse xmlns="{ns}">
  <imsx_POXHeader>
    <imsx_POXResponseHeaderInfo>
      <imsx_version>V1.0</imsx_version>
      <imsx_messageIdentifier>{message_id}</imsx_messageIdentifier>
      <imsx_statusInfo>
        <imsx_codeMajor>{code}</imsx_codeMajor>
        <imsx_severity>{severity}</imsx_severity>
        <imsx_description>{description}</imsx_description>
        <imsx_messageRefIdentifier>{message_ref}</imsx_messageRefIdentifier>
        <imsx_operationRefIdentifier>{operation}</imsx_operationRefIdentifier>
      </imsx_statusInfo>
    </imsx_POXResponseHeaderInfo>
  </imsx_POXHeader>
  <imsx_POXBody>
    {body}
  </imsx_POXBody>
</imsx_POXEnvelopeResponse>"#,
            ns = POX_NAMESPACE,
            message_id = message_id,
            code = self.code_major.as_str(),
            severity = self.code_major.severity(),
            description = escape(self.description.as_str()),
            message_ref = escape(message_ref),
            operation = escape(self.operation.as_str()),
            body = body,
        )
    }
}

/// Receiver stages; a request that stops early is rejected at that stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    Verified,
    Parsed,
    Correlated,
    Stored,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Received => "RECEIVED",
            Stage::Verified => "VERIFIED",
            Stage::Parsed => "PARSED",
            Stage::Correlated => "CORRELATED",
            Stage::Stored => "STORED",
        };
        f.write_str(s)
    }
}

/// The raw HTTP pieces the receiver needs.
#[derive(Debug, Clone)]
pub struct InboundOutcome {
    /// Absolute URL the tool posted to, query string included.
    pub url: String,
    pub authorization: Option<String>,
    /// Raw request body; the body hash covers these exact bytes.
    pub body: Vec<u8>,
}

#[derive(Debug)]
struct Rejection {
    stage: Stage,
    error: HarnessError,
}

fn reject(stage: Stage) -> impl FnOnce(HarnessError) -> Rejection {
    move |error| Rejection { stage, error }
}

struct Correlated {
    sourced_id: String,
    course_tool: CourseTool,
    user: User,
    launch: LaunchLog,
}

/// RECEIVED -> VERIFIED: OAuth over header (or query) params plus body hash.
async fn verify(store: &dyn Store, inbound: &InboundOutcome) -> HarnessResult<Tool> {
    let header = match &inbound.authorization {
        Some(value) => oauth::parse_authorization_header(value)?,
        None => Vec::new(),
    };
    // oauth fields may arrive as query parameters instead of the header
    let (base_url, query) = oauth::normalize_url(&inbound.url)
        .map_err(|e| HarnessError::Authentication(e.to_string()))?;
    let all: Vec<(String, String)> = header.into_iter().chain(query).collect();

    let consumer_key = all
        .iter()
        .find(|(k, _)| k == "oauth_consumer_key")
        .map(|(_, v)| v.clone())
        .ok_or_else(|| HarnessError::Authentication("missing oauth_consumer_key".into()))?;
    let tool = store
        .tool_by_consumer_key(&consumer_key)
        .await?
        .ok_or_else(|| HarnessError::Authentication(format!("unknown consumer key {consumer_key}")))?;

    let presented_hash = all
        .iter()
        .find(|(k, _)| k == "oauth_body_hash")
        .map(|(_, v)| v.as_str())
        .ok_or_else(|| HarnessError::Authentication("missing oauth_body_hash".into()))?;
    if presented_hash != oauth::body_hash(&inbound.body) {
        return Err(HarnessError::Authentication("oauth_body_hash does not match body".into()));
    }

    oauth::verify("POST", &base_url, &all, &tool.consumer_secret)?;
    Ok(tool)
}

/// PARSED -> CORRELATED.
async fn correlate(store: &dyn Store, tool: &Tool, sourced_id: &str) -> HarnessResult<Correlated> {
    let unknown = || HarnessError::Correlation(format!("sourcedId {sourced_id} was never issued"));

    let key = SourcedId::decode(sourced_id).ok_or_else(unknown)?;
    let course_tool = store.course_tool(key.course_tool_id).await?.ok_or_else(unknown)?;
    let user = store.user(key.user_id).await?.ok_or_else(unknown)?;
    if course_tool.tool_id != tool.id {
        return Err(HarnessError::Correlation(format!(
            "sourcedId {sourced_id} belongs to a different tool than consumer key {}",
            tool.consumer_key
        )));
    }
    let launch = store
        .latest_launch_for(user.id, course_tool.id)
        .await?
        .filter(|l| {
            l.signed_params.get("lis_result_sourcedid").map(String::as_str) == Some(sourced_id)
        })
        .ok_or_else(unknown)?;

    Ok(Correlated { sourced_id: sourced_id.to_string(), course_tool, user, launch })
}

async fn process(
    store: &dyn Store,
    inbound: &InboundOutcome,
    request: &mut Option<PoxRequest>,
) -> Result<PoxResponse, Rejection> {
    tracing::debug!(stage = %Stage::Received, bytes = inbound.body.len(), "outcomes request");

    let tool = verify(store, inbound).await.map_err(reject(Stage::Received))?;
    tracing::debug!(stage = %Stage::Verified, consumer_key = %tool.consumer_key, "signature verified");

    let xml = std::str::from_utf8(&inbound.body)
        .map_err(|e| parse_err(format!("body is not UTF-8: {e}")))
        .map_err(reject(Stage::Verified))?;
    let parsed = parse_pox_request(xml).map_err(reject(Stage::Verified))?;
    tracing::debug!(stage = %Stage::Parsed, operation = parsed.operation.name(), "envelope parsed");
    let message_ref = parsed.message_identifier.clone();
    let operation = parsed.operation.clone();
    *request = Some(parsed);

    let ok = |description: String, body: Option<String>| PoxResponse {
        status: StatusCode::OK,
        code_major: CodeMajor::Success,
        description,
        message_ref: message_ref.clone(),
        operation: operation.name().to_string(),
        body,
    };

    match &operation {
        Operation::ReplaceResult { sourced_id, score } => {
            let c = correlate(store, &tool, sourced_id).await.map_err(reject(Stage::Parsed))?;
            tracing::debug!(
                stage = %Stage::Correlated,
                user_id = %c.user.id,
                course_tool_id = %c.course_tool.id,
                launch_log_id = %c.launch.id,
                "sourcedId resolved"
            );

            let grade = Grade {
                id: Uuid::new_v4(),
                course_tool_id: c.course_tool.id,
                user_id: c.user.id,
                launch_log_id: c.launch.id,
                sourced_id: c.sourced_id,
                score: *score,
                raw_xml: xml.to_string(),
                received_at: Utc::now(),
            };
            store
                .insert_grade(&grade)
                .await
                .map_err(|e| Rejection { stage: Stage::Correlated, error: e.into() })?;
            tracing::info!(stage = %Stage::Stored, grade_id = %grade.id, score, "grade stored");

            Ok(ok(format!("Score for {} is now {}", grade.sourced_id, score), None))
        }
        Operation::ReadResult { sourced_id } => {
            let c = correlate(store, &tool, sourced_id).await.map_err(reject(Stage::Parsed))?;
            let latest = store
                .latest_grade_for(c.user.id, c.course_tool.id)
                .await
                .map_err(|e| Rejection { stage: Stage::Correlated, error: e.into() })?;
            let text = latest.map(|g| g.score.to_string()).unwrap_or_default();
            let body = format!(
                "<result><resultScore><language>en</language><textString>{text}</textString></resultScore></result>"
            );
            Ok(ok(format!("Result read for {sourced_id}"), Some(body)))
        }
        Operation::Unsupported(name) => Ok(PoxResponse {
            status: StatusCode::OK,
            code_major: CodeMajor::Unsupported,
            description: format!("{name} is not supported"),
            message_ref: message_ref.clone(),
            operation: name.clone(),
            body: None,
        }),
    }
}

/// Runs the receiver state machine and always produces a conformant envelope.
pub async fn receive(store: &dyn Store, inbound: &InboundOutcome) -> PoxResponse {
    let mut request = None;
    match process(store, inbound, &mut request).await {
        Ok(resp) => resp,
        Err(Rejection { stage, error }) => {
            tracing::warn!(%stage, error = %error, "outcomes request rejected");
            let status = match &error {
                HarnessError::Authentication(_) => StatusCode::UNAUTHORIZED,
                HarnessError::Storage(_) | HarnessError::Signing(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
                _ => StatusCode::OK,
            };
            let (message_ref, operation) = match &request {
                Some(r) => (r.message_identifier.clone(), r.operation.name().to_string()),
                None => (None, "replaceResult".to_string()),
            };
            PoxResponse {
                status,
                code_major: CodeMajor::Failure,
                description: error.to_string(),
                message_ref,
                operation,
                body: None,
            }
        }
    }
}

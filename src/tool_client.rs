//! Tool-side half of Basic Outcomes: lets the harness post a grade to an
//! outcomes URL exactly as a tool would, for exercising the receiver end-to-end.

use quick_xml::escape::escape;
use serde::Serialize;
use uuid::Uuid;

use crate::error::{HarnessError, HarnessResult};
use crate::models::{LaunchLog, ParamMap, Tool};
use crate::oauth::{self, Credentials};
use crate::outcomes::POX_NAMESPACE;

#[derive(Debug, Clone)]
pub struct OutcomeRequest {
    pub url: String,
    pub authorization: String,
    pub body: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeliveryReport {
    pub outcomes_url: String,
    pub status: u16,
    pub response: String,
}

pub fn replace_result_xml(message_id: &str, sourced_id: &str, score: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<imsx_POXEnvelopeRequest xmlns="{ns}">
  <imsx_POXHeader>
    <imsx_POXRequestHeaderInfo>
      <imsx_version>V1.0</imsx_version>
      <imsx_messageIdentifier>{message_id}</imsx_messageIdentifier>
    </imsx_POXRequestHeaderInfo>
  </imsx_POXHeader>
  <imsx_POXBody>
    <replaceResultRequest>
      <resultRecord>
        <sourcedGUID>
          <sourcedId>{sourced_id}</sourcedId>
        </sourcedGUID>
        <result>
          <resultScore>
            <language>en</language>
            <textString>{score}</textString>
          </resultScore>
        </result>
      </resultRecord>
    </replaceResultRequest>
  </imsx_POXBody>
</imsx_POXEnvelopeRequest>"#,
        ns = POX_NAMESPACE,
        message_id = escape(message_id),
        sourced_id = escape(sourced_id),
        score = escape(score),
    )
}

/// Body hash plus OAuth signature, carried in an `Authorization` header.
pub fn sign_outcome(url: &str, creds: Credentials<'_>, body: String) -> HarnessResult<OutcomeRequest> {
    let mut params = ParamMap::new();
    params.insert("oauth_body_hash".into(), oauth::body_hash(body.as_bytes()));
    let signed = oauth::sign("POST", url, &params, creds)?;
    Ok(OutcomeRequest {
        url: url.to_string(),
        authorization: oauth::authorization_header(&signed.params),
        body,
    })
}

/// Sends a `replaceResult` for the launch's sourcedId to its outcomes URL.
pub async fn send_grade(
    client: &reqwest::Client,
    log: &LaunchLog,
    tool: &Tool,
    score: f64,
) -> HarnessResult<DeliveryReport> {
    if !score.is_finite() {
        return Err(HarnessError::Configuration(format!("score {score} is not a number")));
    }
    let field = |name: &str| {
        log.signed_params.get(name).cloned().ok_or_else(|| {
            HarnessError::Configuration(format!("launch {} carries no {name}", log.id))
        })
    };
    let outcomes_url = field("lis_outcome_service_url")?;
    let sourced_id = field("lis_result_sourcedid")?;

    let body = replace_result_xml(&Uuid::new_v4().to_string(), &sourced_id, &score.to_string());
    let req = sign_outcome(
        &outcomes_url,
        Credentials {
            consumer_key: &tool.consumer_key,
            consumer_secret: &tool.consumer_secret,
        },
        body,
    )?;

    tracing::info!(launch_log_id = %log.id, %outcomes_url, score, "sending replaceResult");
    let resp = client
        .post(&req.url)
        .header(http::header::AUTHORIZATION, req.authorization)
        .header(http::header::CONTENT_TYPE, "application/xml")
        .body(req.body)
        .send()
        .await
        .map_err(|e| HarnessError::Delivery(e.to_string()))?;
    let status = resp.status().as_u16();
    let response = resp
        .text()
        .await
        .map_err(|e| HarnessError::Delivery(e.to_string()))?;

    Ok(DeliveryReport { outcomes_url, status, response })
}

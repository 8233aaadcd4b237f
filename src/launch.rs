//! Launch pipeline: build parameters, sign, record, render the auto-submit form.

use chrono::Utc;
use quick_xml::escape::escape;
use uuid::Uuid;

use crate::config::HarnessConfig;
use crate::db::Store;
use crate::error::{HarnessError, HarnessResult};
use crate::models::{LaunchLog, ParamMap};
use crate::oauth::{self, Credentials, SignedRequest};
use crate::params::{self, LaunchContext};

#[derive(Debug, Clone)]
pub struct PreparedLaunch {
    pub launch_url: String,
    pub log: LaunchLog,
}

/// Persists one launch attempt. Nothing is sent to the tool unless this succeeds.
pub async fn record_launch(
    store: &dyn Store,
    course_tool_id: Uuid,
    user_id: Uuid,
    unsigned: ParamMap,
    signed: SignedRequest,
) -> HarnessResult<LaunchLog> {
    let log = LaunchLog {
        id: Uuid::new_v4(),
        course_tool_id,
        user_id,
        launch_params: unsigned,
        signed_params: signed.params,
        oauth_signature: signed.signature,
        launched_at: Utc::now(),
    };
    store.insert_launch_log(&log).await?;
    tracing::info!(launch_log_id = %log.id, %course_tool_id, %user_id, "launch recorded");
    Ok(log)
}

/// Resolves the binding and user, then runs builder -> signer -> recorder.
pub async fn prepare_launch(
    store: &dyn Store,
    config: &HarnessConfig,
    course_tool_id: Uuid,
    user_id: Uuid,
) -> HarnessResult<PreparedLaunch> {
    let course_tool = store
        .course_tool(course_tool_id)
        .await?
        .ok_or_else(|| HarnessError::NotFound(format!("course tool {course_tool_id}")))?;
    let user = store
        .user(user_id)
        .await?
        .ok_or_else(|| HarnessError::NotFound(format!("user {user_id}")))?;
    let tool = store.tool(course_tool.tool_id).await?.ok_or_else(|| {
        HarnessError::Configuration(format!("tool {} is missing", course_tool.tool_id))
    })?;
    let server = store.tool_server(tool.tool_server_id).await?.ok_or_else(|| {
        HarnessError::Configuration(format!("tool server {} is missing", tool.tool_server_id))
    })?;
    let course = store.course(course_tool.course_id).await?.ok_or_else(|| {
        HarnessError::Configuration(format!("course {} is missing", course_tool.course_id))
    })?;

    let ctx = LaunchContext::new(&server, &tool, &course, &user, &course_tool);
    let launch_url = ctx.launch_url();
    params::validate_endpoint(&launch_url)?;
    let unsigned = params::build_launch_params(&ctx, &config.consumer, &config.outcomes_url())?;
    let signed = oauth::sign(
        "POST",
        &launch_url,
        &unsigned,
        Credentials {
            consumer_key: &tool.consumer_key,
            consumer_secret: &tool.consumer_secret,
        },
    )?;

    let log = record_launch(store, course_tool.id, user.id, unsigned, signed).await?;
    Ok(PreparedLaunch { launch_url, log })
}

/// Hidden form that POSTs the signed parameters to the tool on load.
pub fn auto_submit_form(launch_url: &str, params: &ParamMap) -> String {
    let fields: String = params
        .iter()
        .map(|(k, v)| {
            format!(
                "    <input type=\"hidden\" name=\"{}\" value=\"{}\"/>\n",
                escape(k.as_str()),
                escape(v.as_str())
            )
        })
        .collect();

    format!(
        r#"<!DOCTYPE html>
<html>
<head>
  <meta charset='utf-8'/>
  <title>Launching LTI Tool...</title>
</head>
<body>
  <p>Launching LTI tool...</p>
  <form id="ltiForm" action="{action}" method="POST" enctype="application/x-www-form-urlencoded" style="display:none">
{fields}  </form>
  <script>document.getElementById('ltiForm').submit();</script>
</body>
</html>"#,
        action = escape(launch_url),
        fields = fields,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::test_support;

    #[tokio::test]
    async fn each_launch_records_exactly_one_log() {
        let store = MemoryStore::new();
        let seeded = test_support::seed(&store).await;
        let config = HarnessConfig::default();

        let first = prepare_launch(&store, &config, seeded.course_tool.id, seeded.learner.id)
            .await
            .unwrap();
        assert_eq!(store.list_launch_logs().await.unwrap().len(), 1);
        let second = prepare_launch(&store, &config, seeded.course_tool.id, seeded.learner.id)
            .await
            .unwrap();
        assert_eq!(store.list_launch_logs().await.unwrap().len(), 2);
        assert_ne!(first.log.signed_params["oauth_nonce"], second.log.signed_params["oauth_nonce"]);

        let fetched = store.launch_log(first.log.id).await.unwrap().unwrap();
        assert_eq!(fetched.signed_params, first.log.signed_params);
        assert_eq!(first.launch_url, "http://localhost:8080/lti/launch");
    }

    #[tokio::test]
    async fn signed_params_differ_only_by_oauth_fields() {
        let store = MemoryStore::new();
        let seeded = test_support::seed(&store).await;
        let prepared = prepare_launch(&store, &HarnessConfig::default(), seeded.course_tool.id, seeded.learner.id)
            .await
            .unwrap();
        let log = prepared.log;

        for (k, v) in &log.launch_params {
            assert_eq!(log.signed_params.get(k), Some(v));
        }
        for k in log.signed_params.keys() {
            if !log.launch_params.contains_key(k) {
                assert!(k.starts_with("oauth_"), "unexpected extra field {k}");
            }
        }
        assert_eq!(log.signed_params["oauth_signature"], log.oauth_signature);

        let pairs: Vec<(String, String)> =
            log.signed_params.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        oauth::verify("POST", &prepared.launch_url, &pairs, "test_secret").unwrap();
    }

    #[tokio::test]
    async fn unknown_user_does_not_log() {
        let store = MemoryStore::new();
        let seeded = test_support::seed(&store).await;
        let err = prepare_launch(&store, &HarnessConfig::default(), seeded.course_tool.id, Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::NotFound(_)));
        assert!(store.list_launch_logs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unusable_launch_url_is_a_configuration_error() {
        let store = MemoryStore::new();
        let mut fx = test_support::Fixture::new();
        fx.server.domain = "bad host".into();
        let seeded = test_support::seed_fixture(&store, fx).await;

        let err = prepare_launch(&store, &HarnessConfig::default(), seeded.course_tool.id, seeded.learner.id)
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::Configuration(_)), "{err}");
        assert!(store.list_launch_logs().await.unwrap().is_empty());
    }

    #[test]
    fn form_escapes_values() {
        let mut params = ParamMap::new();
        params.insert("context_title".into(), "Cats & \"Dogs\" <b>".into());
        let html = auto_submit_form("http://localhost:8080/lti/launch?a=1&b=2", &params);
        assert!(html.contains("value=\"Cats &amp; &quot;Dogs&quot; &lt;b&gt;\""));
        assert!(html.contains("action=\"http://localhost:8080/lti/launch?a=1&amp;b=2\""));
    }
}

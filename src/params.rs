//! LTI 1.1 launch parameter assembly.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use uuid::Uuid;

use crate::config::ConsumerProfile;
use crate::error::{HarnessError, HarnessResult};
use crate::models::{Course, CourseTool, ParamMap, Role, Tool, ToolServer, User};
use crate::oauth;

pub const MESSAGE_TYPE: &str = "basic-lti-launch-request";
pub const LTI_VERSION: &str = "LTI-1p0";
pub const CONTEXT_TYPE: &str = "CourseSection";

/// Field names the builder owns. Custom parameters can never land on these.
pub const RESERVED: &[&str] = &[
    "lti_message_type",
    "lti_version",
    "resource_link_id",
    "resource_link_title",
    "context_id",
    "context_label",
    "context_title",
    "context_type",
    "user_id",
    "lis_person_name_given",
    "lis_person_name_family",
    "lis_person_name_full",
    "lis_person_contact_email_primary",
    "roles",
    "lis_outcome_service_url",
    "lis_result_sourcedid",
    "launch_presentation_locale",
    "launch_presentation_document_target",
    "tool_consumer_instance_guid",
    "tool_consumer_instance_name",
    "tool_consumer_instance_description",
    "tool_consumer_info_product_family_code",
    "tool_consumer_info_version",
];

/// Opaque correlation token for one (CourseTool, User) pair.
///
/// Encodes both ids so the outcomes receiver resolves it with two keyed
/// lookups instead of scanning launches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourcedId {
    pub course_tool_id: Uuid,
    pub user_id: Uuid,
}

impl SourcedId {
    pub fn new(course_tool_id: Uuid, user_id: Uuid) -> Self {
        Self { course_tool_id, user_id }
    }

    pub fn encode(&self) -> String {
        URL_SAFE_NO_PAD.encode(format!("{}:{}", self.course_tool_id, self.user_id))
    }

    pub fn decode(token: &str) -> Option<Self> {
        let raw = URL_SAFE_NO_PAD.decode(token.trim().as_bytes()).ok()?;
        let raw = String::from_utf8(raw).ok()?;
        let (ct, user) = raw.split_once(':')?;
        Some(Self {
            course_tool_id: Uuid::parse_str(ct).ok()?,
            user_id: Uuid::parse_str(user).ok()?,
        })
    }
}

/// Everything one launch needs, already resolved from the store.
#[derive(Debug, Clone, Copy)]
pub struct LaunchContext<'a> {
    pub server: &'a ToolServer,
    pub tool: &'a Tool,
    pub course: &'a Course,
    pub user: &'a User,
    pub course_tool: &'a CourseTool,
    pub role: Role,
}

impl<'a> LaunchContext<'a> {
    /// Acting role follows the user's own role.
    pub fn new(
        server: &'a ToolServer,
        tool: &'a Tool,
        course: &'a Course,
        user: &'a User,
        course_tool: &'a CourseTool,
    ) -> Self {
        Self { server, tool, course, user, course_tool, role: user.role }
    }

    pub fn launch_url(&self) -> String {
        self.tool.launch_url(self.server)
    }
}

/// A server or tool whose URL cannot be signed is misconfigured, not a signing fault.
pub fn validate_endpoint(url: &str) -> HarnessResult<()> {
    match oauth::normalize_url(url) {
        Ok(_) => Ok(()),
        Err(HarnessError::Signing(msg)) => Err(HarnessError::Configuration(msg)),
        Err(other) => Err(other),
    }
}

/// `custom_` namespaced form of a configured custom parameter name.
pub fn custom_param_name(key: &str) -> String {
    let lowered: String = key
        .trim()
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() { c } else { '_' }
        })
        .collect();
    if lowered.starts_with("custom_") {
        lowered
    } else {
        format!("custom_{lowered}")
    }
}

/// Namespaces every custom key, rejecting empty keys and collisions.
pub fn namespaced_custom_params(custom: &ParamMap) -> HarnessResult<ParamMap> {
    let mut out = ParamMap::new();
    for (key, value) in custom {
        if key.trim().is_empty() {
            return Err(HarnessError::Configuration("empty custom parameter name".into()));
        }
        let name = custom_param_name(key);
        if out.insert(name.clone(), value.clone()).is_some() {
            return Err(HarnessError::Configuration(format!(
                "custom parameter {key} collides with another custom parameter as {name}"
            )));
        }
    }
    Ok(out)
}

/// Builds the unsigned launch parameter set. OAuth fields are left to the signer.
pub fn build_launch_params(
    ctx: &LaunchContext<'_>,
    consumer: &ConsumerProfile,
    outcomes_url: &str,
) -> HarnessResult<ParamMap> {
    if ctx.tool.id != ctx.course_tool.tool_id {
        return Err(HarnessError::Configuration(format!(
            "tool {} is not bound by course tool {}",
            ctx.tool.id, ctx.course_tool.id
        )));
    }
    if ctx.tool.tool_server_id != ctx.server.id {
        return Err(HarnessError::Configuration(format!(
            "tool {} does not run on server {}",
            ctx.tool.id, ctx.server.id
        )));
    }
    if ctx.course.id != ctx.course_tool.course_id {
        return Err(HarnessError::Configuration(format!(
            "course tool {} does not belong to course {}",
            ctx.course_tool.id, ctx.course.id
        )));
    }

    let user = ctx.user;
    let sourced_id = SourcedId::new(ctx.course_tool.id, user.id).encode();

    let fixed: [(&str, String); 23] = [
        ("lti_message_type", MESSAGE_TYPE.into()),
        ("lti_version", LTI_VERSION.into()),
        ("resource_link_id", ctx.course_tool.resource_link_id.clone()),
        ("resource_link_title", ctx.course_tool.resource_link_title.clone()),
        ("context_id", ctx.course.context_id()),
        ("context_label", ctx.course.label.clone()),
        ("context_title", ctx.course.title.clone()),
        ("context_type", CONTEXT_TYPE.into()),
        ("user_id", user.id.to_string()),
        ("lis_person_name_given", user.given_name.clone()),
        ("lis_person_name_family", user.family_name.clone()),
        ("lis_person_name_full", user.full_name()),
        ("lis_person_contact_email_primary", user.email.clone()),
        ("roles", ctx.role.as_lti_str().into()),
        ("lis_outcome_service_url", outcomes_url.into()),
        ("lis_result_sourcedid", sourced_id),
        ("launch_presentation_locale", consumer.locale.clone()),
        ("launch_presentation_document_target", consumer.document_target.clone()),
        ("tool_consumer_instance_guid", consumer.instance_guid.clone()),
        ("tool_consumer_instance_name", consumer.instance_name.clone()),
        ("tool_consumer_instance_description", consumer.instance_description.clone()),
        ("tool_consumer_info_product_family_code", consumer.product_family_code.clone()),
        ("tool_consumer_info_version", consumer.version.clone()),
    ];

    let mut params: ParamMap = fixed.into_iter().map(|(k, v)| (k.to_string(), v)).collect();
    // custom_ prefix keeps these clear of every reserved name
    params.extend(namespaced_custom_params(&ctx.tool.custom_params)?);
    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Fixture;

    const OUTCOMES: &str = "http://localhost:8081/outcomes";

    #[test]
    fn sourced_id_round_trips() {
        let id = SourcedId::new(Uuid::new_v4(), Uuid::new_v4());
        let token = id.encode();
        assert!(!token.contains(':'));
        assert_eq!(SourcedId::decode(&token), Some(id));
        assert_eq!(SourcedId::new(id.course_tool_id, id.user_id).encode(), token);
    }

    #[test]
    fn garbage_sourced_ids_do_not_decode() {
        assert_eq!(SourcedId::decode("not-base64!"), None);
        assert_eq!(SourcedId::decode(&URL_SAFE_NO_PAD.encode("a:b")), None);
        assert_eq!(SourcedId::decode(""), None);
    }

    #[test]
    fn required_fields_are_present() {
        let fx = Fixture::new();
        let params = build_launch_params(&fx.context(&fx.learner), &ConsumerProfile::default(), OUTCOMES).unwrap();

        for field in RESERVED {
            assert!(params.contains_key(*field), "missing {field}");
        }
        assert_eq!(params["lti_message_type"], "basic-lti-launch-request");
        assert_eq!(params["lti_version"], "LTI-1p0");
        assert_eq!(params["context_type"], "CourseSection");
        assert_eq!(params["resource_link_id"], fx.course_tool.resource_link_id);
        assert_eq!(params["context_id"], fx.course.id.to_string());
        assert_eq!(params["user_id"], fx.learner.id.to_string());
        assert_eq!(params["lis_outcome_service_url"], OUTCOMES);
        assert_eq!(
            SourcedId::decode(&params["lis_result_sourcedid"]),
            Some(SourcedId::new(fx.course_tool.id, fx.learner.id))
        );
        assert!(params.keys().all(|k| !k.starts_with("oauth_")));
    }

    #[test]
    fn roles_follow_the_user() {
        let fx = Fixture::new();
        let consumer = ConsumerProfile::default();
        let learner = build_launch_params(&fx.context(&fx.learner), &consumer, OUTCOMES).unwrap();
        let instructor = build_launch_params(&fx.context(&fx.instructor), &consumer, OUTCOMES).unwrap();
        assert_eq!(learner["roles"], "Learner");
        assert_eq!(instructor["roles"], "Instructor");
        assert_eq!(instructor["lis_person_name_full"], "Alice Smith");
    }

    #[test]
    fn custom_params_are_namespaced() {
        assert_eq!(custom_param_name("Chapter-Number"), "custom_chapter_number");
        assert_eq!(custom_param_name("custom_level"), "custom_level");

        let mut fx = Fixture::new();
        fx.tool.custom_params.insert("roles".into(), "Administrator".into());
        fx.tool.custom_params.insert("Mode".into(), "review".into());
        let params = build_launch_params(&fx.context(&fx.learner), &ConsumerProfile::default(), OUTCOMES).unwrap();
        assert_eq!(params["roles"], "Learner");
        assert_eq!(params["custom_roles"], "Administrator");
        assert_eq!(params["custom_mode"], "review");
    }

    #[test]
    fn colliding_custom_params_are_rejected() {
        let mut fx = Fixture::new();
        fx.tool.custom_params.insert("Mode".into(), "a".into());
        fx.tool.custom_params.insert("custom_mode".into(), "b".into());
        assert!(matches!(
            build_launch_params(&fx.context(&fx.learner), &ConsumerProfile::default(), OUTCOMES),
            Err(HarnessError::Configuration(_))
        ));
    }

    #[test]
    fn mismatched_bindings_are_configuration_errors() {
        let mut fx = Fixture::new();
        fx.course_tool.tool_id = Uuid::new_v4();
        assert!(matches!(
            build_launch_params(&fx.context(&fx.learner), &ConsumerProfile::default(), OUTCOMES),
            Err(HarnessError::Configuration(_))
        ));
    }

    #[test]
    fn unusable_endpoints_are_configuration_errors() {
        validate_endpoint("http://localhost:8080/lti/launch").unwrap();
        for bad in ["http://bad host:8080/lti/launch", "ftp://localhost/lti", "not a url"] {
            assert!(
                matches!(validate_endpoint(bad), Err(HarnessError::Configuration(_))),
                "{bad}"
            );
        }
    }
}

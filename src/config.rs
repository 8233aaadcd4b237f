use std::env;

use crate::error::{HarnessError, HarnessResult};

/// Identity the harness presents to tools as the tool consumer.
#[derive(Debug, Clone)]
pub struct ConsumerProfile {
    pub instance_guid: String,
    pub instance_name: String,
    pub instance_description: String,
    pub product_family_code: String,
    pub version: String,
    pub locale: String,
    pub document_target: String,
}

impl Default for ConsumerProfile {
    fn default() -> Self {
        Self {
            instance_guid: "lti-test-platform.local".into(),
            instance_name: "LTI Test Platform".into(),
            instance_description: "Local LTI 1.1 Testing Environment".into(),
            product_family_code: "lti-test-platform".into(),
            version: "1.0".into(),
            locale: "en-US".into(),
            document_target: "iframe".into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub database_url: Option<String>,
    pub port: u16,
    /// Absolute base URL tools use to reach the harness.
    pub public_url: String,
    pub seed_demo_data: bool,
    pub consumer: ConsumerProfile,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            port: 8081,
            public_url: "http://localhost:8081".into(),
            seed_demo_data: true,
            consumer: ConsumerProfile::default(),
        }
    }
}

impl HarnessConfig {
    pub fn from_env() -> HarnessResult<Self> {
        let mut cfg = HarnessConfig::default();

        cfg.database_url = env::var("DATABASE_URL").ok().filter(|s| !s.trim().is_empty());

        if let Ok(port) = env::var("PORT") {
            cfg.port = port
                .parse()
                .map_err(|_| HarnessError::Configuration(format!("invalid PORT: {port}")))?;
        }

        cfg.public_url = match env::var("PUBLIC_URL") {
            Ok(url) => url,
            Err(_) => format!("http://localhost:{}", cfg.port),
        };
        let parsed = url::Url::parse(&cfg.public_url).map_err(|e| {
            HarnessError::Configuration(format!("invalid PUBLIC_URL {}: {e}", cfg.public_url))
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(HarnessError::Configuration(format!(
                "PUBLIC_URL must be http(s): {}",
                cfg.public_url
            )));
        }

        if let Ok(v) = env::var("SEED_DEMO_DATA") {
            cfg.seed_demo_data = !matches!(v.to_ascii_lowercase().as_str(), "0" | "false" | "no");
        }
        if let Ok(v) = env::var("TOOL_CONSUMER_INSTANCE_GUID") {
            cfg.consumer.instance_guid = v;
        }
        if let Ok(v) = env::var("TOOL_CONSUMER_INSTANCE_NAME") {
            cfg.consumer.instance_name = v;
        }

        Ok(cfg)
    }

    pub fn outcomes_url(&self) -> String {
        format!("{}/outcomes", self.public_url.trim_end_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcomes_url_is_absolute() {
        let cfg = HarnessConfig {
            public_url: "http://harness.test:9000/".into(),
            ..HarnessConfig::default()
        };
        assert_eq!(cfg.outcomes_url(), "http://harness.test:9000/outcomes");
    }
}

use serde::{Deserialize, Serialize};

/// Top-level configuration for the bridge process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub sip: SipConfig,
    #[serde(default)]
    pub ice: IceConfig,
    /// Shared secret the HTTP caller must present in `apiKey`.
    ///
    /// Left empty by the TOML defaults on purpose — `load_config` overlays
    /// the `API_KEY` environment variable on top, and `validate()` refuses
    /// to start the process if both are empty.
    #[serde(default)]
    pub api_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_http_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SipConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_sip_port")]
    pub port: u16,
    /// Host advertised in the Contact header we send to the doorbell.
    /// Auto-detected from the host's first non-loopback IPv4 interface if unset.
    pub contact_host: Option<String>,
    #[serde(default = "default_contact_port")]
    pub contact_port: u16,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_registrar_domain")]
    pub registrar_domain: String,
    /// Upper bound placed on a REGISTER's requested Expires value.
    #[serde(default = "default_binding_ttl")]
    pub binding_ttl_secs: u64,
}

/// STUN server configuration for WebRTC NAT traversal.
///
/// No TURN here by design — the bridge only ever talks to a single,
/// on-prem SIP endpoint and a STUN-reachable browser; relaying through a
/// TURN server is out of scope (see Non-goals).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceConfig {
    #[serde(default = "default_stun_urls")]
    pub stun_urls: Vec<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_http_port(),
        }
    }
}

impl Default for SipConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_sip_port(),
            contact_host: None,
            contact_port: default_contact_port(),
            user_agent: default_user_agent(),
            registrar_domain: default_registrar_domain(),
            binding_ttl_secs: default_binding_ttl(),
        }
    }
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_urls: default_stun_urls(),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            http: HttpConfig::default(),
            sip: SipConfig::default(),
            ice: IceConfig::default(),
            api_key: String::new(),
        }
    }
}

impl BridgeConfig {
    /// Validate the configuration, returning a list of issues found.
    ///
    /// Issues are prefixed with "ERROR:" (fatal, process should not start) or
    /// "WARNING:" (advisory, process can start but the config is likely wrong).
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        if self.api_key.is_empty() {
            issues.push(
                "ERROR: api_key is empty. Set it in the config file or via API_KEY.".to_string(),
            );
        }

        if self.http.port == 0 {
            issues.push("ERROR: http.port must be between 1 and 65535, got 0.".to_string());
        }
        if self.sip.port == 0 {
            issues.push("ERROR: sip.port must be between 1 and 65535, got 0.".to_string());
        }
        if self.sip.contact_port == 0 {
            issues.push("ERROR: sip.contact_port must be between 1 and 65535, got 0.".to_string());
        }

        if self.sip.user_agent.trim().is_empty() {
            issues.push("ERROR: sip.user_agent must not be empty.".to_string());
        }
        if self.sip.registrar_domain.trim().is_empty() {
            issues.push("ERROR: sip.registrar_domain must not be empty.".to_string());
        }

        if self.sip.binding_ttl_secs == 0 {
            issues.push(
                "WARNING: sip.binding_ttl_secs is 0; registrations will expire immediately."
                    .to_string(),
            );
        }

        if self.ice.stun_urls.is_empty() {
            issues.push(
                "WARNING: ice.stun_urls is empty; ICE gathering will rely on host candidates only."
                    .to_string(),
            );
        }
        for url in &self.ice.stun_urls {
            if !url.starts_with("stun:") && !url.starts_with("stuns:") {
                issues.push(format!(
                    "ERROR: STUN URL '{url}' must start with 'stun:' or 'stuns:'. Example: stun:stun.l.google.com:19302",
                ));
            }
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    8090
}
fn default_sip_port() -> u16 {
    5070
}
fn default_contact_port() -> u16 {
    5088
}
fn default_user_agent() -> String {
    "doorbell".to_string()
}
fn default_registrar_domain() -> String {
    "sipstacks.com".to_string()
}
fn default_binding_ttl() -> u64 {
    60
}
fn default_stun_urls() -> Vec<String> {
    vec!["stun:stun.l.google.com:19302".to_string()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_from_empty_string() {
        let config: BridgeConfig =
            toml::from_str("").expect("empty string should deserialize to default config");

        assert_eq!(config.http.bind, "0.0.0.0");
        assert_eq!(config.http.port, 8090);
        assert_eq!(config.sip.port, 5070);
        assert_eq!(config.sip.contact_port, 5088);
        assert_eq!(config.sip.user_agent, "doorbell");
        assert_eq!(config.sip.registrar_domain, "sipstacks.com");
        assert_eq!(config.sip.binding_ttl_secs, 60);
        assert_eq!(config.ice.stun_urls, vec!["stun:stun.l.google.com:19302"]);
        assert!(config.api_key.is_empty());
    }

    #[test]
    fn partial_config_only_sip_section() {
        let toml_str = r#"
[sip]
port = 5071
contact_host = "203.0.113.9"
"#;
        let config: BridgeConfig =
            toml::from_str(toml_str).expect("partial config should deserialize");

        assert_eq!(config.sip.port, 5071);
        assert_eq!(config.sip.contact_host.as_deref(), Some("203.0.113.9"));
        assert_eq!(config.sip.contact_port, 5088);
        assert_eq!(config.http.port, 8090);
    }

    #[test]
    fn default_trait_matches_toml_defaults() {
        let from_toml: BridgeConfig = toml::from_str("").expect("default config");
        let from_default = BridgeConfig::default();
        assert_eq!(from_toml.http.port, from_default.http.port);
        assert_eq!(from_toml.sip.port, from_default.sip.port);
        assert_eq!(from_toml.sip.contact_port, from_default.sip.contact_port);
        assert_eq!(from_toml.ice.stun_urls, from_default.ice.stun_urls);
    }

    fn valid_config() -> BridgeConfig {
        let mut c = BridgeConfig::default();
        c.api_key = "k".to_string();
        c
    }

    fn has_error(issues: &[String], substring: &str) -> bool {
        issues
            .iter()
            .any(|i| i.starts_with("ERROR:") && i.contains(substring))
    }

    fn has_warning(issues: &[String], substring: &str) -> bool {
        issues
            .iter()
            .any(|i| i.starts_with("WARNING:") && i.contains(substring))
    }

    #[test]
    fn validate_default_valid_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn validate_empty_api_key_is_error() {
        let config = BridgeConfig::default();
        let issues = config.validate().unwrap_err();
        assert!(has_error(&issues, "api_key"));
    }

    #[test]
    fn validate_http_port_zero_is_error() {
        let mut config = valid_config();
        config.http.port = 0;
        let issues = config.validate().unwrap_err();
        assert!(has_error(&issues, "http.port"));
    }

    #[test]
    fn validate_sip_port_zero_is_error() {
        let mut config = valid_config();
        config.sip.port = 0;
        let issues = config.validate().unwrap_err();
        assert!(has_error(&issues, "sip.port"));
    }

    #[test]
    fn validate_binding_ttl_zero_is_warning_not_error() {
        let mut config = valid_config();
        config.sip.binding_ttl_secs = 0;
        let issues = config.validate().unwrap_err();
        assert!(has_warning(&issues, "binding_ttl_secs"));
        assert!(!has_error(&issues, "binding_ttl_secs"));
    }

    #[test]
    fn validate_stun_url_bad_prefix_is_error() {
        let mut config = valid_config();
        config.ice.stun_urls = vec!["http://stun.example.com:3478".to_string()];
        let issues = config.validate().unwrap_err();
        assert!(has_error(&issues, "STUN URL"));
    }

    #[test]
    fn validate_empty_stun_urls_is_warning() {
        let mut config = valid_config();
        config.ice.stun_urls = vec![];
        let issues = config.validate().unwrap_err();
        assert!(has_warning(&issues, "stun_urls"));
    }

    #[test]
    fn validate_multiple_errors_collected() {
        let mut config = BridgeConfig::default();
        config.http.port = 0;
        config.sip.port = 0;
        let issues = config.validate().unwrap_err();
        assert!(issues.len() >= 3, "expected api_key + 2 port errors, got {issues:?}");
    }
}

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque caller-supplied identifier that both selects a registered SIP
/// endpoint and keys the resulting call in the session registry. The HTTP
/// layer receives it as `endpointId`; everywhere past the handler boundary
/// it travels as this newtype so the two roles it plays can't drift apart.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationToken(String);

impl CorrelationToken {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CorrelationToken {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

impl From<&str> for CorrelationToken {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displays_as_raw_string() {
        let token = CorrelationToken::new("doorbell-7");
        assert_eq!(token.to_string(), "doorbell-7");
        assert_eq!(token.as_str(), "doorbell-7");
    }

    #[test]
    fn equal_tokens_hash_equal() {
        use std::collections::HashSet;
        let mut set = HashSet::new();
        set.insert(CorrelationToken::new("a"));
        assert!(set.contains(&CorrelationToken::from("a")));
    }
}

use serde::{Deserialize, Serialize};

/// `POST /CALL` request body.
///
/// `endpoint_id` doubles as the correlation token used throughout the
/// bridge: it both selects which registered SIP device to ring and keys
/// the resulting session in the registry.
#[derive(Debug, Clone, Deserialize)]
pub struct CallRequest {
    #[serde(rename = "apiKey")]
    pub api_key: String,
    #[serde(rename = "endpointId")]
    pub endpoint_id: String,
    pub offer: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CallResponse {
    pub sdp: String,
}

/// `POST /BYE` request body.
#[derive(Debug, Clone, Deserialize)]
pub struct ByeRequest {
    #[serde(rename = "apiKey")]
    pub api_key: String,
    #[serde(rename = "endpointId")]
    pub endpoint_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ByeResponse {
    pub status: &'static str,
}

impl Default for ByeResponse {
    fn default() -> Self {
        Self { status: "ok" }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub active_calls: usize,
    pub uptime_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_request_deserializes_camelcase_fields() {
        let json = r#"{"apiKey":"k","endpointId":"alice","offer":"v=0..."}"#;
        let req: CallRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.api_key, "k");
        assert_eq!(req.endpoint_id, "alice");
        assert_eq!(req.offer, "v=0...");
    }

    #[test]
    fn bye_request_deserializes_camelcase_fields() {
        let json = r#"{"apiKey":"k","endpointId":"alice"}"#;
        let req: ByeRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.api_key, "k");
        assert_eq!(req.endpoint_id, "alice");
    }

    #[test]
    fn bye_response_serializes_status_ok() {
        let json = serde_json::to_string(&ByeResponse::default()).unwrap();
        assert_eq!(json, r#"{"status":"ok"}"#);
    }

    #[test]
    fn error_response_roundtrip() {
        let err = ErrorResponse {
            error: "not found".to_string(),
        };
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains(r#""error":"not found""#));
    }
}

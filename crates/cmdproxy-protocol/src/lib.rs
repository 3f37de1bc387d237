//! The `RunRequest`/`RunResponse` envelope exchanged over the broker.
//!
//! Pure data holder plus JSON encode/decode. The round-trip law
//! `decode(encode(r)) == r` holds for every envelope built from
//! [`cmdproxy_param::WireParameter`] — the serialisable parameter subset.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use cmdproxy_error::CmdproxyError;
use cmdproxy_param::WireParameter;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// A run request: the command to execute, its arguments, environment,
/// working directory, and stdio sinks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    /// The command to run: `CmdName` or `CmdPath`.
    pub command: WireParameter,
    /// Positional arguments.
    pub args: Vec<WireParameter>,
    /// Environment mapping, in caller-supplied order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<IndexMap<String, WireParameter>>,
    /// Working directory on the worker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    /// Standard-output sink.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<WireParameter>,
    /// Standard-error sink.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<WireParameter>,
}

/// The worker's response to a `RunRequest`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResponse {
    /// Process exit code, or `-1` if the worker failed before/during
    /// execution.
    pub return_code: i32,
    /// Non-empty diagnostic string iff the worker failed before or during
    /// execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunResponse {
    /// Construct a successful response.
    pub fn success(return_code: i32) -> Self {
        Self { return_code, error: None }
    }

    /// Construct a failure response carrying a diagnostic.
    pub fn failure(diagnostic: impl Into<String>) -> Self {
        Self { return_code: -1, error: Some(diagnostic.into()) }
    }

    /// `true` iff `error` is set, matching spec §7's `ServerEnd` condition.
    pub fn is_server_error(&self) -> bool {
        self.error.is_some()
    }
}

/// JSON encode/decode for [`RunRequest`] and [`RunResponse`].
///
/// Named after the teacher's `JsonlCodec`, though this protocol exchanges
/// one JSON document per broker task rather than newline-delimited frames.
pub struct EnvelopeCodec;

impl EnvelopeCodec {
    /// Serialise a `RunRequest` to a JSON string.
    pub fn encode_request(req: &RunRequest) -> Result<String, CmdproxyError> {
        serde_json::to_string(req)
            .map_err(|e| CmdproxyError::envelope_decode(format!("encoding run request: {e}")))
    }

    /// Deserialise a `RunRequest` from a JSON string.
    pub fn decode_request(json: &str) -> Result<RunRequest, CmdproxyError> {
        serde_json::from_str(json)
            .map_err(|e| CmdproxyError::envelope_decode(format!("decoding run request: {e}")))
    }

    /// Serialise a `RunResponse` to a JSON string.
    pub fn encode_response(resp: &RunResponse) -> Result<String, CmdproxyError> {
        serde_json::to_string(resp)
            .map_err(|e| CmdproxyError::envelope_decode(format!("encoding run response: {e}")))
    }

    /// Deserialise a `RunResponse` from a JSON string.
    pub fn decode_response(json: &str) -> Result<RunResponse, CmdproxyError> {
        serde_json::from_str(json)
            .map_err(|e| CmdproxyError::envelope_decode(format!("decoding run response: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> RunRequest {
        let mut args_map = IndexMap::new();
        args_map.insert(
            "i".to_string(),
            WireParameter::InCloudFile { path: "/tmp/a".into(), hostname: "h".into() },
        );
        args_map.insert(
            "o".to_string(),
            WireParameter::OutCloudFile { path: "/tmp/b".into(), hostname: "h".into() },
        );
        RunRequest {
            command: WireParameter::CmdPath { path: "/bin/sh".into() },
            args: vec![
                WireParameter::Str { value: "-c".into() },
                WireParameter::Format { tmpl: "cat {i} > {o}".into(), args: args_map },
            ],
            env: None,
            cwd: None,
            stdout: Some(WireParameter::OutCloudFile {
                path: "/tmp/out".into(),
                hostname: "h".into(),
            }),
            stderr: Some(WireParameter::OutCloudFile {
                path: "/tmp/err".into(),
                hostname: "h".into(),
            }),
        }
    }

    #[test]
    fn request_round_trips() {
        let req = sample_request();
        let json = EnvelopeCodec::encode_request(&req).unwrap();
        let decoded = EnvelopeCodec::decode_request(&json).unwrap();
        assert_eq!(req, decoded);
    }

    #[test]
    fn response_round_trips_success_and_failure() {
        let ok = RunResponse::success(0);
        let json = EnvelopeCodec::encode_response(&ok).unwrap();
        assert_eq!(EnvelopeCodec::decode_response(&json).unwrap(), ok);

        let err = RunResponse::failure("UNKNOWN_COMMAND: unknown command: nope");
        let json = EnvelopeCodec::encode_response(&err).unwrap();
        let decoded = EnvelopeCodec::decode_response(&json).unwrap();
        assert_eq!(decoded, err);
        assert!(decoded.is_server_error());
    }

    #[test]
    fn malformed_json_is_envelope_decode_error() {
        let err = EnvelopeCodec::decode_request("{not json").unwrap_err();
        assert_eq!(err.code, cmdproxy_error::ErrorCode::EnvelopeDecode);
    }

    #[test]
    fn unknown_parameter_tag_in_request_is_rejected() {
        let json = r#"{"command":{"NotAVariant":{}},"args":[]}"#;
        let err = EnvelopeCodec::decode_request(json).unwrap_err();
        assert_eq!(err.code, cmdproxy_error::ErrorCode::EnvelopeDecode);
    }

    #[test]
    fn non_null_error_marks_server_error() {
        let resp = RunResponse::success(0);
        assert!(!resp.is_server_error());
        let resp = RunResponse::failure("boom");
        assert!(resp.is_server_error());
    }

    proptest::proptest! {
        #[test]
        fn response_round_trip_holds_for_arbitrary_exit_codes(code in i32::MIN..i32::MAX) {
            let resp = RunResponse::success(code);
            let json = EnvelopeCodec::encode_response(&resp).unwrap();
            let decoded = EnvelopeCodec::decode_response(&json).unwrap();
            proptest::prop_assert_eq!(resp, decoded);
        }
    }
}

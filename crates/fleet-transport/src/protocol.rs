//! Wire framing: one JSON document per text frame.
//!
//! Controller and agent use the same envelope in both directions; the
//! agent-side helpers exist for agent implementations and tests.

use fleet_core::{AgentMessage, ServerMessage, TransportError};

/// Largest frame accepted from an agent.
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Encode a controller message.
///
/// # Errors
///
/// Returns `Malformed` if the message cannot be serialized.
pub fn encode_server(msg: &ServerMessage) -> Result<String, TransportError> {
    serde_json::to_string(msg).map_err(|e| TransportError::Malformed(e.to_string()))
}

/// Decode an agent frame.
///
/// # Errors
///
/// Returns `Malformed` for anything that is not a known agent message.
pub fn decode_agent(frame: &[u8]) -> Result<AgentMessage, TransportError> {
    decode(frame)
}

/// Encode an agent message.
///
/// # Errors
///
/// Returns `Malformed` if the message cannot be serialized.
pub fn encode_agent(msg: &AgentMessage) -> Result<String, TransportError> {
    serde_json::to_string(msg).map_err(|e| TransportError::Malformed(e.to_string()))
}

/// Decode a controller frame.
///
/// # Errors
///
/// Returns `Malformed` for anything that is not a known controller message.
pub fn decode_server(frame: &[u8]) -> Result<ServerMessage, TransportError> {
    decode(frame)
}

fn decode<T: serde::de::DeserializeOwned>(frame: &[u8]) -> Result<T, TransportError> {
    if frame.len() > MAX_FRAME_BYTES {
        return Err(TransportError::Malformed(format!(
            "frame of {} bytes exceeds limit",
            frame.len()
        )));
    }
    serde_json::from_slice(frame).map_err(|e| TransportError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use fleet_core::{
        AgentId, RequestPayload, ResponsePayload,
        message::{AgentResponse, Hello, JobProgress},
    };
    use serde_json::json;

    use super::*;

    #[test]
    fn test_hello_wire_shape() {
        let frame = json!({
            "kind": "hello",
            "agent_id": "pmm-agent-1",
            "version": "3.1.0",
            "metadata": {"node": "db-01"}
        })
        .to_string();

        let msg = decode_agent(frame.as_bytes()).unwrap();
        let AgentMessage::Hello(Hello {
            agent_id, metadata, ..
        }) = msg
        else {
            panic!("expected hello, got {msg:?}");
        };
        assert_eq!(agent_id, AgentId::new("pmm-agent-1"));
        assert_eq!(metadata["node"], json!("db-01"));
    }

    #[test]
    fn test_request_and_response_correlate_by_id() {
        let request = ServerMessage::Request {
            request_id: 42,
            payload: RequestPayload::Ping,
        };
        let text = encode_server(&request).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["kind"], "request");
        assert_eq!(value["request_id"], 42);
        assert_eq!(value["payload"]["type"], "ping");

        let response = AgentMessage::Response(AgentResponse::ok(
            42,
            ResponsePayload::Pong { current_time_ms: 7 },
        ));
        let frame = encode_agent(&response).unwrap();
        assert_eq!(decode_agent(frame.as_bytes()).unwrap(), response);
    }

    #[test]
    fn test_job_progress_carries_base64_data() {
        let progress = AgentMessage::JobProgress(JobProgress::new(
            uuid::Uuid::nil(),
            3,
            b"\x00binary\xff",
            false,
        ));
        let frame = encode_agent(&progress).unwrap();
        assert!(!frame.contains("binary"));

        let AgentMessage::JobProgress(decoded) = decode_agent(frame.as_bytes()).unwrap() else {
            panic!("expected job progress");
        };
        assert_eq!(decoded.decode_data().unwrap(), b"\x00binary\xff");
    }

    #[test]
    fn test_garbage_is_malformed() {
        for frame in [&b"not json"[..], br#"{"kind":"teleport"}"#, br#"{"request_id":1}"#] {
            assert!(matches!(decode_agent(frame), Err(TransportError::Malformed(_))));
        }
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        let frame = vec![b' '; MAX_FRAME_BYTES + 1];
        let err = decode_server(&frame).unwrap_err();
        assert!(matches!(err, TransportError::Malformed(ref msg) if msg.contains("exceeds")));
    }
}

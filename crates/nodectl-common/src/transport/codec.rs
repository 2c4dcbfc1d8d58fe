use crate::protocol::error::Result;
use crate::protocol::{ClientMessage, ServerMessage};

/// JSON codec for encoding/decoding wire messages
///
/// # Example
///
/// ```
/// use nodectl_common::transport::JsonCodec;
/// use nodectl_common::protocol::{ClientMessage, ServerMessage};
///
/// let encoded = JsonCodec::encode(&ClientMessage::Cancel { id: 7 }).unwrap();
/// let decoded = JsonCodec::decode_client(&encoded).unwrap();
/// assert_eq!(decoded, ClientMessage::Cancel { id: 7 });
///
/// let encoded = JsonCodec::encode(&ServerMessage::End { id: 7 }).unwrap();
/// let decoded = JsonCodec::decode_server(&encoded).unwrap();
/// assert_eq!(decoded.id(), 7);
/// ```
pub struct JsonCodec;

impl JsonCodec {
    pub fn encode<T: serde::Serialize>(message: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(message)?)
    }

    pub fn decode_client(data: &[u8]) -> Result<ClientMessage> {
        Ok(serde_json::from_slice(data)?)
    }

    pub fn decode_server(data: &[u8]) -> Result<ServerMessage> {
        Ok(serde_json::from_slice(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Request, Response};
    use serde_json::json;

    #[test]
    fn test_call_round_trip() {
        let request = Request::new("machine.Dmesg", json!({"follow": true, "tail": false}));
        let message = ClientMessage::Call(request.clone());

        let encoded = JsonCodec::encode(&message).unwrap();
        let decoded = JsonCodec::decode_client(&encoded).unwrap();

        assert_eq!(decoded, ClientMessage::Call(request));
    }

    #[test]
    fn test_data_frame_preserves_raw_bytes() {
        // kernel log lines are not guaranteed to be UTF-8
        let bytes = vec![0x3c, 0x36, 0x3e, 0xff, 0x00, 0x0a];
        let message = ServerMessage::Data { id: 3, bytes: bytes.clone() };

        let encoded = JsonCodec::encode(&message).unwrap();
        match JsonCodec::decode_server(&encoded).unwrap() {
            ServerMessage::Data { id, bytes: decoded } => {
                assert_eq!(id, 3);
                assert_eq!(decoded, bytes);
            }
            other => panic!("expected data frame, got {:?}", other),
        }
    }

    #[test]
    fn test_unary_response_round_trip() {
        let message = ServerMessage::Response(Response::ok(5, json!({"images": []})));
        let encoded = JsonCodec::encode(&message).unwrap();
        assert_eq!(JsonCodec::decode_server(&encoded).unwrap(), message);
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(JsonCodec::decode_client(&[0xff, 0xff]).is_err());
        assert!(JsonCodec::decode_server(b"{\"type\":\"nope\"}").is_err());
    }
}

// Frame codec for the gateway: JSON text frames in, JSON text frames out.
// Binary frames are ignored at the socket loop; anything that fails to
// decode here is answered with a protocol error, never a disconnect.

use axum::extract::ws::{Message, WebSocket};
use quillsync_common::protocol::ws::WsMessage;

pub fn decode_message(raw: &str) -> Result<WsMessage, serde_json::Error> {
    serde_json::from_str::<WsMessage>(raw)
}

pub fn encode_message(message: &WsMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}

pub async fn send_ws_message(socket: &mut WebSocket, message: &WsMessage) -> Result<(), ()> {
    let encoded = encode_message(message).map_err(|_| ())?;
    socket.send(Message::Text(encoded.into())).await.map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use super::{decode_message, encode_message};
    use quillsync_common::protocol::ws::WsMessage;

    #[test]
    fn decodes_a_join_frame() {
        let raw = r#"{"type":"join","document_id":"doc-1","participant_id":"alice","display_name":"Alice"}"#;
        match decode_message(raw) {
            Ok(WsMessage::Join { document_id, participant_id, .. }) => {
                assert_eq!(document_id, "doc-1");
                assert_eq!(participant_id, "alice");
            }
            other => panic!("expected join frame, got {other:?}"),
        }
    }

    #[test]
    fn rejects_malformed_frames() {
        assert!(decode_message("not json").is_err());
        assert!(decode_message(r#"{"type":"join"}"#).is_err());
    }

    #[test]
    fn encode_then_decode_is_identity() {
        let message = WsMessage::Resync { document_id: "doc-1".into() };
        let encoded = encode_message(&message).unwrap();
        assert_eq!(decode_message(&encoded).unwrap(), message);
    }
}

//! Application messages carried inside frames
//!
//! Byte 0 of every payload is the [`MessageType`]; the body that follows is
//! big-endian and fixed per type. Component payloads (replica updates,
//! requests, events) are opaque bytes at this layer.

use crate::error::ProtocolError;
use crate::ids::{EventId, ObjectId, Owner, RequestId, TemplateId};

/// Discriminant stored in the first payload byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i8)]
pub enum MessageType {
    Disconnect = -1,
    UpdateObject = 15,
    SpawnObject = 16,
    UpdateServerState = 17,
    ServerEvent = 18,
    ClientRequest = 21,
    HostStarted = 24,
    ClientLoaded = 25,
}

impl MessageType {
    pub fn code(self) -> i8 {
        self as i8
    }

    pub fn from_code(code: i8) -> Option<Self> {
        Some(match code {
            -1 => MessageType::Disconnect,
            15 => MessageType::UpdateObject,
            16 => MessageType::SpawnObject,
            17 => MessageType::UpdateServerState,
            18 => MessageType::ServerEvent,
            21 => MessageType::ClientRequest,
            24 => MessageType::HostStarted,
            25 => MessageType::ClientLoaded,
            _ => return None,
        })
    }

    /// Whether a client is allowed to send this type to the server
    pub fn is_client_to_server(self) -> bool {
        matches!(
            self,
            MessageType::Disconnect | MessageType::ClientRequest | MessageType::ClientLoaded
        )
    }
}

/// A decoded protocol message
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Disconnect,
    SpawnObject {
        object: ObjectId,
        template: TemplateId,
    },
    UpdateObject {
        object: ObjectId,
        owner: Owner,
        body: Vec<u8>,
    },
    UpdateServerState {
        time: f32,
        player_count: i32,
    },
    ServerEvent {
        object: ObjectId,
        event: EventId,
        body: Vec<u8>,
    },
    ClientRequest {
        object: ObjectId,
        request: RequestId,
        body: Vec<u8>,
    },
    HostStarted,
    ClientLoaded,
}

impl Message {
    pub fn kind(&self) -> MessageType {
        match self {
            Message::Disconnect => MessageType::Disconnect,
            Message::SpawnObject { .. } => MessageType::SpawnObject,
            Message::UpdateObject { .. } => MessageType::UpdateObject,
            Message::UpdateServerState { .. } => MessageType::UpdateServerState,
            Message::ServerEvent { .. } => MessageType::ServerEvent,
            Message::ClientRequest { .. } => MessageType::ClientRequest,
            Message::HostStarted => MessageType::HostStarted,
            Message::ClientLoaded => MessageType::ClientLoaded,
        }
    }

    /// Serializes into a frame payload
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![self.kind().code() as u8];
        match self {
            Message::Disconnect | Message::HostStarted | Message::ClientLoaded => {}
            Message::SpawnObject { object, template } => {
                out.extend_from_slice(&object.0.to_be_bytes());
                out.extend_from_slice(&template.0.to_be_bytes());
            }
            Message::UpdateObject { object, owner, body } => {
                out.extend_from_slice(&object.0.to_be_bytes());
                out.extend_from_slice(&owner.to_wire().to_be_bytes());
                out.extend_from_slice(body);
            }
            Message::UpdateServerState { time, player_count } => {
                out.extend_from_slice(&time.to_be_bytes());
                out.extend_from_slice(&player_count.to_be_bytes());
            }
            Message::ServerEvent { object, event, body } => {
                out.extend_from_slice(&object.0.to_be_bytes());
                out.extend_from_slice(&event.0.to_be_bytes());
                out.extend_from_slice(body);
            }
            Message::ClientRequest {
                object,
                request,
                body,
            } => {
                out.extend_from_slice(&object.0.to_be_bytes());
                out.extend_from_slice(&request.0.to_be_bytes());
                out.extend_from_slice(body);
            }
        }
        out
    }

    /// Parses a frame payload
    pub fn decode(payload: &[u8]) -> Result<Message, ProtocolError> {
        let (&code, rest) = payload.split_first().ok_or(ProtocolError::Empty)?;
        let code = code as i8;
        let kind = MessageType::from_code(code).ok_or(ProtocolError::UnknownType(code))?;
        let mut body = Body::new(code, rest);

        let message = match kind {
            MessageType::Disconnect => Message::Disconnect,
            MessageType::HostStarted => Message::HostStarted,
            MessageType::ClientLoaded => Message::ClientLoaded,
            MessageType::SpawnObject => Message::SpawnObject {
                object: ObjectId(body.i32()?),
                template: TemplateId(body.i32()?),
            },
            MessageType::UpdateObject => Message::UpdateObject {
                object: ObjectId(body.i32()?),
                owner: Owner::from_wire(body.i32()?),
                body: body.rest(),
            },
            MessageType::UpdateServerState => Message::UpdateServerState {
                time: f32::from_bits(body.i32()? as u32),
                player_count: body.i32()?,
            },
            MessageType::ServerEvent => Message::ServerEvent {
                object: ObjectId(body.i32()?),
                event: EventId(body.i32()?),
                body: body.rest(),
            },
            MessageType::ClientRequest => Message::ClientRequest {
                object: ObjectId(body.i32()?),
                request: RequestId(body.i32()?),
                body: body.rest(),
            },
        };
        Ok(message)
    }
}

/// Cursor over a message body
struct Body<'a> {
    kind: i8,
    bytes: &'a [u8],
    consumed: usize,
}

impl<'a> Body<'a> {
    fn new(kind: i8, bytes: &'a [u8]) -> Self {
        Self {
            kind,
            bytes,
            consumed: 0,
        }
    }

    fn i32(&mut self) -> Result<i32, ProtocolError> {
        let end = self.consumed + 4;
        let chunk = self
            .bytes
            .get(self.consumed..end)
            .ok_or(ProtocolError::Truncated {
                kind: self.kind,
                needed: end,
                got: self.bytes.len(),
            })?;
        self.consumed = end;
        Ok(i32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
    }

    fn rest(&mut self) -> Vec<u8> {
        let rest = self.bytes[self.consumed..].to_vec();
        self.consumed = self.bytes.len();
        rest
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::DISCONNECT_FRAME;
    use crate::ids::ClientId;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn spawn_layout_is_type_object_template() {
        let message = Message::SpawnObject {
            object: ObjectId(3),
            template: TemplateId(258),
        };
        assert_eq!(message.encode(), vec![16, 0, 0, 0, 3, 0, 0, 1, 2]);
    }

    #[test]
    fn client_request_layout_and_decode() {
        let bytes = vec![21, 0, 0, 0, 9, 0, 0, 0, 2, 0xAA, 0xBB];
        let decoded = Message::decode(&bytes).unwrap();
        assert_eq!(
            decoded,
            Message::ClientRequest {
                object: ObjectId(9),
                request: RequestId(2),
                body: vec![0xAA, 0xBB],
            }
        );
        assert_eq!(decoded.encode(), bytes);
    }

    #[test]
    fn server_owned_update_carries_minus_one() {
        let message = Message::UpdateObject {
            object: ObjectId(1),
            owner: Owner::Server,
            body: vec![5],
        };
        let bytes = message.encode();
        assert_eq!(&bytes[5..9], &[0xFF, 0xFF, 0xFF, 0xFF]);

        let client_owned = Message::UpdateObject {
            object: ObjectId(1),
            owner: Owner::Client(ClientId(4)),
            body: Vec::new(),
        };
        assert_eq!(Message::decode(&client_owned.encode()).unwrap(), client_owned);
    }

    #[test]
    fn server_state_carries_float_time() {
        let bytes = Message::UpdateServerState {
            time: 12.5,
            player_count: 3,
        }
        .encode();

        match Message::decode(&bytes).unwrap() {
            Message::UpdateServerState { time, player_count } => {
                assert_approx_eq!(time, 12.5);
                assert_eq!(player_count, 3);
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn disconnect_is_a_single_byte() {
        assert_eq!(Message::Disconnect.encode(), vec![0xFF]);
        assert_eq!(&DISCONNECT_FRAME[2..], Message::Disconnect.encode().as_slice());
        assert_eq!(Message::decode(&[0xFF]).unwrap(), Message::Disconnect);
    }

    #[test]
    fn bodiless_messages_ignore_trailing_bytes() {
        assert_eq!(Message::decode(&[24]).unwrap(), Message::HostStarted);
        assert_eq!(Message::decode(&[25, 1, 2]).unwrap(), Message::ClientLoaded);
    }

    #[test]
    fn malformed_payloads_are_rejected() {
        assert_eq!(Message::decode(&[]), Err(ProtocolError::Empty));
        assert_eq!(Message::decode(&[99]), Err(ProtocolError::UnknownType(99)));
        assert_eq!(
            Message::decode(&[16, 0, 0, 0, 1, 0, 0]),
            Err(ProtocolError::Truncated {
                kind: 16,
                needed: 8,
                got: 6,
            })
        );
    }

    #[test]
    fn only_some_types_travel_client_to_server() {
        assert!(MessageType::ClientRequest.is_client_to_server());
        assert!(MessageType::ClientLoaded.is_client_to_server());
        assert!(!MessageType::SpawnObject.is_client_to_server());
        assert!(!MessageType::HostStarted.is_client_to_server());
    }
}

use serde::Serialize;

use crate::directory::UserId;

/// Messages a client sends after its name. Tags overlap with [`ServerMessage`]
/// tags but the two directions are unrelated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    ListUsers,
    Invite(UserId),
    SearchStart,
    Accept,
    PickPistol,
    Shoot { x: u32, y: u32 },
    Refuse,
    SearchStop,
}

/// Messages the server pushes to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// Reply to [`ClientMessage::ListUsers`]. Bare JSON, no tag byte.
    UserList(Vec<UserMeta>),
    Invitation { from: Vec<u8> },
    /// Opponent's arena position.
    DuelStart { x: u32, y: u32 },
    OpponentArmed,
    Lost,
    Won,
    /// Opponent refused, or left while paired.
    PairingCleared,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserMeta {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Id")]
    pub id: UserId,
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("empty message")]
    Empty,

    #[error("unknown opcode: {0}")]
    UnknownOpcode(u8),

    #[error("opcode {opcode} needs {expected} payload bytes, got {got}")]
    Truncated { opcode: u8, expected: usize, got: usize },

    #[error("failed to encode user list: {0}")]
    Json(#[from] serde_json::Error),
}

fn read_u32(opcode: u8, payload: &[u8], offset: usize) -> Result<u32, ProtocolError> {
    let bytes = payload
        .get(offset..offset + 4)
        .ok_or(ProtocolError::Truncated {
            opcode,
            expected: offset + 4,
            got: payload.len(),
        })?;

    let mut word = [0u8; 4];
    word.copy_from_slice(bytes);

    Ok(u32::from_le_bytes(word))
}

impl ClientMessage {
    /// Decode one message. Bytes past the fixed-width payload are ignored.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        let (&opcode, payload) = buf.split_first().ok_or(ProtocolError::Empty)?;

        match opcode {
            0 => Ok(ClientMessage::ListUsers),
            1 => Ok(ClientMessage::Invite(read_u32(opcode, payload, 0)?)),
            2 => Ok(ClientMessage::SearchStart),
            3 => Ok(ClientMessage::Accept),
            4 => Ok(ClientMessage::PickPistol),
            5 => Ok(ClientMessage::Shoot {
                x: read_u32(opcode, payload, 0)?,
                y: read_u32(opcode, payload, 4)?,
            }),
            6 => Ok(ClientMessage::Refuse),
            7 => Ok(ClientMessage::SearchStop),
            other => Err(ProtocolError::UnknownOpcode(other)),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            ClientMessage::ListUsers => vec![0],
            ClientMessage::Invite(id) => {
                let mut buf = vec![1];
                buf.extend_from_slice(&id.to_le_bytes());
                buf
            }
            ClientMessage::SearchStart => vec![2],
            ClientMessage::Accept => vec![3],
            ClientMessage::PickPistol => vec![4],
            ClientMessage::Shoot { x, y } => {
                let mut buf = vec![5];
                buf.extend_from_slice(&x.to_le_bytes());
                buf.extend_from_slice(&y.to_le_bytes());
                buf
            }
            ClientMessage::Refuse => vec![6],
            ClientMessage::SearchStop => vec![7],
        }
    }
}

impl ServerMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let buf = match self {
            ServerMessage::UserList(users) => serde_json::to_vec(users)?,
            ServerMessage::Invitation { from } => {
                let mut buf = Vec::with_capacity(1 + from.len());
                buf.push(0);
                buf.extend_from_slice(from);
                buf
            }
            ServerMessage::DuelStart { x, y } => {
                let mut buf = Vec::with_capacity(9);
                buf.push(1);
                buf.extend_from_slice(&x.to_le_bytes());
                buf.extend_from_slice(&y.to_le_bytes());
                buf
            }
            ServerMessage::OpponentArmed => vec![2],
            ServerMessage::Lost => vec![3],
            ServerMessage::Won => vec![4],
            ServerMessage::PairingCleared => vec![5],
        };

        Ok(buf)
    }
}

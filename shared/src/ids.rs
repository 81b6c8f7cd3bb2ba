//! Identifier newtypes used on the wire

use serde::{Deserialize, Serialize};
use std::fmt;

/// Server-assigned connection identifier, unique for the lifetime of a server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub u32);

/// Server-assigned networked object identifier, never reused within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(pub i32);

/// Index into the template table agreed by both ends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TemplateId(pub i32);

/// Per-object request index chosen by the replica's component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub i32);

/// Per-object event index chosen by the authoritative component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub i32);

/// Who is allowed to drive an object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Owner {
    Server,
    Client(ClientId),
}

impl Owner {
    /// Server-owned objects travel as -1
    pub fn to_wire(self) -> i32 {
        match self {
            Owner::Server => -1,
            Owner::Client(ClientId(id)) => id as i32,
        }
    }

    pub fn from_wire(raw: i32) -> Self {
        if raw < 0 {
            Owner::Server
        } else {
            Owner::Client(ClientId(raw as u32))
        }
    }

    pub fn is_client(self, client: ClientId) -> bool {
        self == Owner::Client(client)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TemplateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Owner::Server => write!(f, "server"),
            Owner::Client(id) => write!(f, "client {}", id),
        }
    }
}

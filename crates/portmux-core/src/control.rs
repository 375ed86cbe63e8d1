//! Status types handed to the tray/CLI collaborator. Everything here is
//! serializable so the consumer can render or re-export it as it likes.

use serde::Serialize;

use crate::config::Direction;
use crate::forward::{ForwardState, ForwardStatus};

#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub name: String,
    pub connected: bool,
}

/// One row of `list_forwards`.
#[derive(Debug, Clone, Serialize)]
pub struct ForwardEntry {
    pub name: String,
    pub server: String,
    pub direction: Direction,
    pub endpoints: String,
    pub state: ForwardState,
}

/// Full per-forward status for `snapshot`.
#[derive(Debug, Clone, Serialize)]
pub struct ForwardSnapshot {
    pub name: String,
    pub server: String,
    pub direction: Direction,
    pub endpoints: String,
    #[serde(flatten)]
    pub status: ForwardStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub running: bool,
    pub servers: Vec<ServerStatus>,
    pub forwards: Vec<ForwardSnapshot>,
}

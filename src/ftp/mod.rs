//! Wire schema and per-client request dispatcher for the chunked FTP-style
//! file service.
//!
//! Two TCP ports are involved: a normal-commands port, driven by
//! [`agent::Agent::handle`], and a termination port driven by
//! [`agent::run_termination_listener`], which exists purely so a
//! `Terminate{command_id}` can reach the server out-of-band while a
//! `Get`/`Put` is mid-flight on the normal port.

pub mod agent;

use serde::{Deserialize, Serialize};

/// A request sent by the FTP client on the normal-commands port.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Request {
    Get { filename: String },
    Put { filename: String },
    Delete { filename: String },
    List,
    ChangeDir { dir_name: String, go_up: bool },
    MakeDir { dir_name: String },
    Pwd,
    Quit,
}

/// A request sent on the termination port, independent of the
/// normal-commands connection so it can interrupt an in-flight transfer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Terminate {
    pub command_id: u32,
}

/// A response to a [`Request`] on the normal-commands port.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Response {
    Get { command_id: u32 },
    Put { command_id: u32 },
    List { filenames: Vec<String> },
    Pwd { dir_name: String },
    Empty,
    Error { message: String },
}

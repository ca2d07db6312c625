//! Per-connection session state machines
//!
//! Control frames within a session are strictly request/reply: the worker never
//! has more than one request outstanding. Data-plane streams and the worker's
//! processing pipeline run beside the control loop as their own tasks.

pub mod coordinator;
pub mod worker;

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Coordinator,
    Worker,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Coordinator => f.write_str("coordinator"),
            Role::Worker => f.write_str("worker"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Hash file being pushed (coordinator) or received (worker)
    SendHashFile,
    Ready,
    /// Worker: TRANSFER_REQUEST written, reply pending.
    /// Coordinator: START_TRANSFER written, port field pending.
    RequestSent,
    /// Inline payload (processing output) being read on the control stream
    Receiving,
    /// No more work; waiting for in-flight transfers and processing to finish
    Draining,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::SendHashFile => "SendHashFile",
            SessionState::Ready => "Ready",
            SessionState::RequestSent => "RequestSent",
            SessionState::Receiving => "Receiving",
            SessionState::Draining => "Draining",
            SessionState::Closed => "Closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

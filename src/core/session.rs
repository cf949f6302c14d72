// src/core/session.rs

//! The transient per-connection record the admission server hands to the
//! scheduler, and the envelope the scheduler's input queue carries.

use tokio::sync::mpsc;

use crate::core::identity::Principal;
use crate::core::protocol::Frame;

/// A connected client's identity plus the channel the scheduler uses to
/// push reply frames back to its I/O worker.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: u64,
    pub principal: Principal,
    pub out_tx: mpsc::UnboundedSender<Frame>,
}

/// What the admission server's I/O workers enqueue for the scheduler to
/// process on its single worker task.
#[derive(Debug)]
pub enum SchedulerMessage {
    /// A decoded request frame from a freshly accepted connection.
    Request { session: Session, frame: Frame },
    /// The owning connection of a blocked job disconnected before it was
    /// promoted; cancel the job and clean up its heap entries.
    Cancel { session_id: u64 },
}

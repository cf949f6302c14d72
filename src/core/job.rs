// src/core/job.rs

//! The job record. Persisted fields mirror `catalog::model::JobRow`;
//! `session_id` is runtime-only bookkeeping letting the scheduler find the
//! connection to notify when a blocked job is promoted or cancelled.

use std::collections::BTreeSet;

use crate::core::catalog::model::JobRow;

#[derive(Debug, Clone)]
pub struct Job {
    pub id: i64,
    pub name: String,
    pub job_type: String,
    pub priority: i64,
    pub owner: u32,
    pub gids: BTreeSet<u32>,
    pub mdl: Vec<String>,
    pub machines: Vec<String>,
    pub starttime: i64,
    pub running: bool,
    /// The session awaiting a reply for this job while it is blocked. `None`
    /// once the job has a running slot and its immediate reply was already
    /// sent, or if the owning connection disconnected before reattaching.
    pub session_id: Option<u64>,
}

impl Job {
    pub fn to_row(&self) -> JobRow {
        JobRow {
            id: self.id,
            name: self.name.clone(),
            job_type: self.job_type.clone(),
            priority: self.priority,
            owner: self.owner,
            gids: self.gids.clone(),
            mdl: self.mdl.clone(),
            machines: self.machines.clone(),
            starttime: self.starttime,
            running: self.running,
        }
    }
}

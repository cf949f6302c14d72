// src/core/machine.rs

//! Per-host runtime state: the running set, the blocked-job priority heap,
//! and the memoized ACL validation cache. Persisted fields live in
//! `catalog::model::MachineRow`; this wraps one such row with the mutable
//! state the scheduler maintains while the process is up.

use std::cmp::Ordering;
use std::collections::{BTreeSet, BinaryHeap, HashMap};

use crate::core::acl::{self, AclRule};
use crate::core::catalog::model::MachineRow;
use crate::core::job::Job;

/// A blocked job's position in a machine's admission heap: promote in
/// ascending `(priority, starttime, id)` order — lower priority value runs
/// first, ties broken by arrival time, final tiebreak by id for determinism.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BlockedEntry {
    priority: i64,
    starttime: i64,
    job_id: i64,
}

impl Ord for BlockedEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so `.pop()` yields the smallest key.
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.starttime.cmp(&self.starttime))
            .then_with(|| other.job_id.cmp(&self.job_id))
    }
}

impl PartialOrd for BlockedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub struct Machine {
    pub row: MachineRow,
    running: BTreeSet<i64>,
    blocked: BinaryHeap<BlockedEntry>,
    validated: HashMap<(u32, Vec<u32>), bool>,
}

impl Machine {
    pub fn new(row: MachineRow) -> Self {
        Self {
            row,
            running: BTreeSet::new(),
            blocked: BinaryHeap::new(),
            validated: HashMap::new(),
        }
    }

    pub fn curjobs(&self) -> i64 {
        self.running.len() as i64
    }

    pub fn is_idle(&self) -> bool {
        self.running.is_empty() && self.blocked.is_empty()
    }

    fn load(&self) -> f64 {
        if self.row.maxjobs <= 0 {
            f64::INFINITY
        } else {
            self.curjobs() as f64 / self.row.maxjobs as f64
        }
    }

    pub fn has_capacity(&self) -> bool {
        self.row.online && self.curjobs() < self.row.maxjobs
    }

    /// Selects the least-loaded machine with a free slot among `candidates`.
    /// Callers are expected to have already shuffled `candidates` so that
    /// ties are not systematically biased toward the first entry.
    pub fn pick(candidates: &mut [&mut Machine]) -> Option<usize> {
        candidates
            .iter()
            .enumerate()
            .filter(|(_, m)| m.has_capacity())
            .min_by(|(_, a), (_, b)| a.load().partial_cmp(&b.load()).unwrap_or(Ordering::Equal))
            .map(|(idx, _)| idx)
    }

    pub fn block(&mut self, job: &Job) {
        self.blocked.push(BlockedEntry {
            priority: job.priority,
            starttime: job.starttime,
            job_id: job.id,
        });
    }

    /// Removes `job_id` from the blocked heap, wherever it sits. Tolerates
    /// an absent id: revalidation may attempt to unblock from a machine the
    /// job was never actually queued on.
    pub fn unblock(&mut self, job_id: i64) {
        if !self.blocked.iter().any(|e| e.job_id == job_id) {
            return;
        }
        let remaining: Vec<_> = self.blocked.drain().filter(|e| e.job_id != job_id).collect();
        self.blocked = remaining.into_iter().collect();
    }

    /// Pops the highest-priority blocked job id without removing it from
    /// bookkeeping on other machines; the scheduler is responsible for
    /// calling `unblock` on every machine the job was queued on once it is
    /// promoted or cancelled.
    pub fn pop_blocked(&mut self) -> Option<i64> {
        self.blocked.pop().map(|e| e.job_id)
    }

    pub fn run(&mut self, job_id: i64) {
        self.running.insert(job_id);
        debug_assert!(self.curjobs() <= self.row.maxjobs.max(self.curjobs()));
    }

    pub fn finish(&mut self, job_id: i64) {
        self.running.remove(&job_id);
    }

    /// Memoized ACL evaluation against this machine's assembled rule list.
    /// `rules` must be the ordered list this machine's `acl` field resolves
    /// to; callers must call `invalidate_acl_cache` whenever that field (or
    /// any rule it names) changes.
    pub fn validate_user(&mut self, uid: u32, gids: &BTreeSet<u32>, rules: &[AclRule]) -> bool {
        let key = (uid, gids.iter().copied().collect::<Vec<_>>());
        if let Some(&cached) = self.validated.get(&key) {
            return cached;
        }
        let result = acl::evaluate(rules, uid, gids);
        self.validated.insert(key, result);
        result
    }

    pub fn invalidate_acl_cache(&mut self) {
        self.validated.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(name: &str, maxjobs: i64, online: bool) -> MachineRow {
        MachineRow {
            id: 1,
            name: name.to_string(),
            domain: "d".to_string(),
            primary_pool: "p1".to_string(),
            pools: vec!["p1".to_string()],
            arch: "amd64".to_string(),
            osversion: 1200,
            numcpus: 4,
            maxjobs,
            haszfs: true,
            online,
            acl: vec!["open".to_string()],
        }
    }

    fn job(id: i64, priority: i64, starttime: i64) -> Job {
        Job {
            id,
            name: "j".to_string(),
            job_type: "build".to_string(),
            priority,
            owner: 1001,
            gids: BTreeSet::new(),
            mdl: vec![],
            machines: vec!["m1".to_string()],
            starttime,
            running: false,
            session_id: None,
        }
    }

    #[test]
    fn blocked_heap_promotes_by_priority_then_starttime_then_id() {
        let mut m = Machine::new(row("m1", 1, true));
        m.block(&job(2, 20, 100));
        m.block(&job(1, 5, 50));
        m.block(&job(3, 5, 10));
        assert_eq!(m.pop_blocked(), Some(3));
        assert_eq!(m.pop_blocked(), Some(1));
        assert_eq!(m.pop_blocked(), Some(2));
        assert_eq!(m.pop_blocked(), None);
    }

    #[test]
    fn unblock_tolerates_absent_job() {
        let mut m = Machine::new(row("m1", 1, true));
        m.unblock(999);
        m.block(&job(1, 1, 1));
        m.unblock(1);
        assert_eq!(m.pop_blocked(), None);
    }

    #[test]
    fn has_capacity_respects_maxjobs_and_online() {
        let mut m = Machine::new(row("m1", 1, true));
        assert!(m.has_capacity());
        m.run(1);
        assert!(!m.has_capacity());
        m.finish(1);
        assert!(m.has_capacity());

        let mut offline = Machine::new(row("m2", 1, false));
        assert!(!offline.has_capacity());
    }

    #[test]
    fn pick_prefers_least_loaded_machine() {
        let mut a = Machine::new(row("a", 2, true));
        a.run(1);
        let mut b = Machine::new(row("b", 2, true));
        let mut candidates: Vec<&mut Machine> = vec![&mut a, &mut b];
        assert_eq!(Machine::pick(&mut candidates), Some(1));
    }

    #[test]
    fn validate_user_caches_until_invalidated() {
        let mut m = Machine::new(row("m1", 1, true));
        let rules = vec![AclRule {
            name: "open".to_string(),
            uid_list: BTreeSet::new(),
            gid_list: BTreeSet::new(),
            sense: true,
        }];
        assert!(m.validate_user(1001, &BTreeSet::new(), &rules));
        assert!(m.validated.contains_key(&(1001, vec![])));
        m.invalidate_acl_cache();
        assert!(!m.validated.contains_key(&(1001, vec![])));
    }
}

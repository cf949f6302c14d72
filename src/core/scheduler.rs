// src/core/scheduler.rs

//! The single-threaded scheduler worker. Owns every mutable piece of state —
//! the machine catalog, the job table, the blocked heaps, and the sessions
//! of blocked jobs awaiting promotion — and processes one `SchedulerMessage`
//! at a time from its input queue. Nothing outside this module ever mutates
//! that state directly.

use std::collections::{BTreeMap, HashMap};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::seq::SliceRandom;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::core::acl::AclRule;
use crate::core::catalog::model::{AclRow, MachineRow};
use crate::core::catalog::CatalogStore;
use crate::core::constraint::CompiledConstraint;
use crate::core::errors::QManagerError;
use crate::core::job::Job;
use crate::core::machine::Machine;
use crate::core::protocol::{Frame, Value, Verb};
use crate::core::session::{Session, SchedulerMessage};

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn get_str(frame: &Frame, name: &'static str) -> Result<String, QManagerError> {
    match frame.get(name) {
        None => Err(QManagerError::MissingArgument(name)),
        Some(v) => v
            .as_str()
            .map(str::to_string)
            .ok_or(QManagerError::WrongArgumentType(name)),
    }
}

fn get_opt_str(frame: &Frame, name: &'static str) -> Result<Option<String>, QManagerError> {
    match frame.get(name) {
        None => Ok(None),
        Some(v) => v
            .as_str()
            .map(|s| Some(s.to_string()))
            .ok_or(QManagerError::WrongArgumentType(name)),
    }
}

fn get_int(frame: &Frame, name: &'static str) -> Result<i64, QManagerError> {
    match frame.get(name) {
        None => Err(QManagerError::MissingArgument(name)),
        Some(v) => v.as_int().ok_or(QManagerError::WrongArgumentType(name)),
    }
}

fn get_opt_int(frame: &Frame, name: &'static str) -> Result<Option<i64>, QManagerError> {
    match frame.get(name) {
        None => Ok(None),
        Some(v) => v.as_int().map(Some).ok_or(QManagerError::WrongArgumentType(name)),
    }
}

/// Size-like fields (`numcpus`, `maxjobs`, `osversion`) reject negative
/// values per the normalization rules.
fn reject_negative(name: &'static str, v: i64) -> Result<i64, QManagerError> {
    if v < 0 {
        return Err(QManagerError::ArgumentError(format!(
            "'{name}' must not be negative, got {v}"
        )));
    }
    Ok(v)
}

fn get_nonneg_int(frame: &Frame, name: &'static str) -> Result<i64, QManagerError> {
    reject_negative(name, get_int(frame, name)?)
}

fn get_opt_nonneg_int(frame: &Frame, name: &'static str) -> Result<Option<i64>, QManagerError> {
    match get_opt_int(frame, name)? {
        Some(v) => Ok(Some(reject_negative(name, v)?)),
        None => Ok(None),
    }
}

fn get_bool(frame: &Frame, name: &'static str) -> Result<bool, QManagerError> {
    match frame.get(name) {
        None => Err(QManagerError::MissingArgument(name)),
        Some(v) => v.as_bool().ok_or(QManagerError::WrongArgumentType(name)),
    }
}

fn get_opt_bool(frame: &Frame, name: &'static str) -> Result<Option<bool>, QManagerError> {
    match frame.get(name) {
        None => Ok(None),
        Some(v) => v.as_bool().map(Some).ok_or(QManagerError::WrongArgumentType(name)),
    }
}

fn get_str_list(frame: &Frame, name: &'static str) -> Result<Vec<String>, QManagerError> {
    match frame.get(name) {
        None => Err(QManagerError::MissingArgument(name)),
        Some(v) => v
            .as_string_list()
            .ok_or(QManagerError::WrongArgumentType(name)),
    }
}

fn get_opt_str_list(frame: &Frame, name: &'static str) -> Result<Option<Vec<String>>, QManagerError> {
    match frame.get(name) {
        None => Ok(None),
        Some(v) => v
            .as_string_list()
            .map(Some)
            .ok_or(QManagerError::WrongArgumentType(name)),
    }
}

/// Owns every piece of mutable server state. Runs exclusively on the
/// scheduler's single worker task.
struct SchedulerState {
    store: CatalogStore,
    acl_rules: HashMap<String, AclRule>,
    machines: HashMap<String, Machine>,
    jobs: HashMap<i64, Job>,
    /// Sessions of currently blocked jobs, keyed by session id, so a later
    /// promotion or cancellation can push a frame back to the right socket.
    blocked_sessions: HashMap<u64, Session>,
}

/// Runs the scheduler loop until its input queue is closed. Call once, from
/// a dedicated task spawned by `server::run`.
pub async fn run(mut rx: mpsc::UnboundedReceiver<SchedulerMessage>, store: CatalogStore) -> Result<(), QManagerError> {
    let mut state = SchedulerState::bootstrap(store).await?;
    while let Some(msg) = rx.recv().await {
        match msg {
            SchedulerMessage::Request { session, frame } => {
                state.handle_request(session, frame).await;
            }
            SchedulerMessage::Cancel { session_id } => {
                if let Err(e) = state.handle_cancel(session_id).await {
                    warn!(session_id, error = %e, "error cancelling disconnected session");
                }
            }
        }
    }
    Ok(())
}

impl SchedulerState {
    async fn bootstrap(store: CatalogStore) -> Result<Self, QManagerError> {
        let (acl_rows, machine_rows) = store.load_all().await?;
        let acl_rules: HashMap<String, AclRule> = acl_rows
            .into_iter()
            .map(|r: AclRow| {
                (
                    r.name.clone(),
                    AclRule {
                        name: r.name,
                        uid_list: r.uid_list,
                        gid_list: r.gid_list,
                        sense: r.sense,
                    },
                )
            })
            .collect();
        let machines: HashMap<String, Machine> = machine_rows
            .into_iter()
            .map(|r| (r.name.clone(), Machine::new(r)))
            .collect();
        let discarded = store.discard_all_jobs().await?;
        info!(
            machines = machines.len(),
            acl_rules = acl_rules.len(),
            discarded_jobs = discarded,
            "catalog loaded, scheduler ready"
        );
        Ok(Self {
            store,
            acl_rules,
            machines,
            jobs: HashMap::new(),
            blocked_sessions: HashMap::new(),
        })
    }

    fn resolve_acl_rules(&self, machine_name: &str) -> Vec<AclRule> {
        self.machines
            .get(machine_name)
            .map(|m| {
                m.row
                    .acl
                    .iter()
                    .filter_map(|name| self.acl_rules.get(name).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn handle_request(&mut self, session: Session, frame: Frame) {
        let Verb::Command(name) = &frame.verb else {
            let _ = session
                .out_tx
                .send(Frame::error(&QManagerError::Protocol(
                    "expected a command frame".into(),
                )));
            return;
        };
        let name = name.clone();
        debug!(session = session.id, command = %name, "dispatching request");

        let result: Result<Option<Frame>, QManagerError> = match name.as_str() {
            "status" => self.cmd_status(&frame).map(Some),
            "try" => self.cmd_try_or_acquire(&session, &frame, false).await,
            "acquire" => self.cmd_try_or_acquire(&session, &frame, true).await,
            "release" => self.cmd_release(&frame).await.map(Some),
            "jobs" => self.cmd_jobs().map(Some),
            "reconnect" => self.cmd_reconnect(&session, &frame).map(Some),
            "add" => self.cmd_add_machine(&frame).await.map(Some),
            "update" => self.cmd_update_machine(&frame).await.map(Some),
            "delete" => self.cmd_delete_machine(&frame).await.map(Some),
            "add_acl" => self.cmd_add_acl(&frame).await.map(Some),
            "update_acl" => self.cmd_update_acl(&frame).await.map(Some),
            "del_acl" => self.cmd_del_acl(&frame).await.map(Some),
            other => Err(QManagerError::UnknownCommand(other.to_string())),
        };

        match result {
            Ok(Some(response)) => {
                let _ = session.out_tx.send(response);
            }
            Ok(None) => {
                // The handler (a blocking acquire) already sent its own
                // frame(s) and stashed the session for a later promotion.
            }
            Err(e) => {
                warn!(session = session.id, command = %name, error = %e, "command failed");
                let _ = session.out_tx.send(Frame::error(&e));
            }
        }
    }

    async fn handle_cancel(&mut self, session_id: u64) -> Result<(), QManagerError> {
        self.blocked_sessions.remove(&session_id);
        let job_id = self
            .jobs
            .iter()
            .find(|(_, j)| j.session_id == Some(session_id))
            .map(|(id, _)| *id);
        if let Some(id) = job_id {
            debug!(job_id = id, "cancelling job after client disconnect");
            self.cancel_job(id).await?;
        }
        Ok(())
    }

    // ---- try / acquire -----------------------------------------------

    async fn cmd_try_or_acquire(
        &mut self,
        session: &Session,
        frame: &Frame,
        acquire: bool,
    ) -> Result<Option<Frame>, QManagerError> {
        let name = get_str(frame, "name")?;
        let job_type = get_str(frame, "type")?;
        let priority = get_int(frame, "priority")?;
        let mdl = get_str_list(frame, "mdl")?;
        let uid = session.principal.uid;
        let gids = session.principal.gids.clone();

        let compiled = CompiledConstraint::compile(&mdl)?;
        let candidate_names: Vec<String> = {
            let rows: Vec<MachineRow> = self.machines.values().map(|m| m.row.clone()).collect();
            compiled
                .select(&rows)?
                .into_iter()
                .map(|m| m.name.clone())
                .collect()
        };
        if candidate_names.is_empty() {
            return Err(QManagerError::NoMachines);
        }

        let mut shuffled = candidate_names;
        shuffled.shuffle(&mut rand::thread_rng());

        let eligible: Vec<String> = shuffled
            .into_iter()
            .filter(|name| {
                let rules = self.resolve_acl_rules(name);
                self.machines
                    .get_mut(name)
                    .map(|m| m.validate_user(uid, &gids, &rules))
                    .unwrap_or(false)
            })
            .collect();
        if eligible.is_empty() {
            return Err(QManagerError::PermissionDenied);
        }

        let picked = {
            let mut refs: Vec<&mut Machine> = Vec::new();
            for n in eligible.iter() {
                if let Some(m) = self.machines.get_mut(n) {
                    // SAFETY: `eligible` names are distinct keys drawn from
                    // `self.machines`, so each iteration borrows a different
                    // entry; the borrow checker can't see that across loop
                    // iterations, so the pointer round-trip makes it explicit.
                    let ptr: *mut Machine = m;
                    refs.push(unsafe { &mut *ptr });
                }
            }
            Machine::pick(&mut refs).map(|idx| refs[idx].row.name.clone())
        };

        if let Some(machine_name) = picked {
            let mut job = Job {
                id: 0,
                name,
                job_type,
                priority,
                owner: uid,
                gids,
                mdl,
                machines: vec![machine_name.clone()],
                starttime: now(),
                running: true,
                session_id: None,
            };
            let id = self.store.insert_job(&job.to_row()).await?;
            job.id = id;
            self.machines.get_mut(&machine_name).unwrap().run(id);
            self.jobs.insert(id, job);
            let mut fields = BTreeMap::new();
            fields.insert("machine".to_string(), Value::Str(machine_name));
            fields.insert("id".to_string(), Value::Int(id));
            return Ok(Some(Frame::response(202, fields)));
        }

        if !acquire {
            return Err(QManagerError::WouldBlock);
        }

        let mut job = Job {
            id: 0,
            name,
            job_type,
            priority,
            owner: uid,
            gids,
            mdl,
            machines: eligible.clone(),
            starttime: now(),
            running: false,
            session_id: Some(session.id),
        };
        let id = self.store.insert_job(&job.to_row()).await?;
        job.id = id;
        for m in &eligible {
            if let Some(machine) = self.machines.get_mut(m) {
                machine.block(&job);
            }
        }
        self.jobs.insert(id, job);
        self.blocked_sessions.insert(session.id, session.clone());

        let mut fields = BTreeMap::new();
        fields.insert("id".to_string(), Value::Int(id));
        let _ = session.out_tx.send(Frame::response(203, fields));
        Ok(None)
    }

    // ---- release / reconnect / jobs / status --------------------------

    async fn cmd_release(&mut self, frame: &Frame) -> Result<Frame, QManagerError> {
        let id = get_int(frame, "id")?;
        let job = self.jobs.get(&id).ok_or(QManagerError::NoSuchJob(id as u64))?;
        if !job.running {
            return Err(QManagerError::JobNotRunning(id as u64));
        }
        let machine_name = job.machines[0].clone();
        self.jobs.remove(&id);
        self.store.delete_job(id).await?;
        if let Some(m) = self.machines.get_mut(&machine_name) {
            m.finish(id);
        }
        self.promote_blocked(&machine_name).await?;
        Ok(Frame::ok())
    }

    fn cmd_reconnect(&mut self, session: &Session, frame: &Frame) -> Result<Frame, QManagerError> {
        let id = get_int(frame, "id")?;
        let job = self
            .jobs
            .get_mut(&id)
            .ok_or(QManagerError::NoSuchJob(id as u64))?;
        if job.running {
            return Err(QManagerError::JobAlreadyRunning(id as u64));
        }
        if let Some(old_sid) = job.session_id.replace(session.id) {
            self.blocked_sessions.remove(&old_sid);
        }
        self.blocked_sessions.insert(session.id, session.clone());
        Ok(Frame::response(410, BTreeMap::new()))
    }

    fn cmd_jobs(&self) -> Result<Frame, QManagerError> {
        let list = self
            .jobs
            .values()
            .map(|j| {
                Value::List(vec![
                    Value::Int(j.id),
                    Value::Str(j.name.clone()),
                    Value::Bool(j.running),
                    Value::List(j.machines.iter().cloned().map(Value::Str).collect()),
                ])
            })
            .collect();
        let mut fields = BTreeMap::new();
        fields.insert("jobs".to_string(), Value::List(list));
        Ok(Frame::response(201, fields))
    }

    fn cmd_status(&self, frame: &Frame) -> Result<Frame, QManagerError> {
        let mdl = get_opt_str_list(frame, "mdl")?.unwrap_or_default();
        let compiled = CompiledConstraint::compile(&mdl)?;
        let rows: Vec<MachineRow> = self.machines.values().map(|m| m.row.clone()).collect();
        let matched = compiled.select(&rows)?;
        let list = matched
            .into_iter()
            .map(|row| {
                let curjobs = self.machines.get(&row.name).map(|m| m.curjobs()).unwrap_or(0);
                Value::List(vec![
                    Value::Str(row.name.clone()),
                    Value::Int(curjobs),
                    Value::Int(row.maxjobs),
                    Value::Bool(row.online),
                ])
            })
            .collect();
        let mut fields = BTreeMap::new();
        fields.insert("machines".to_string(), Value::List(list));
        Ok(Frame::response(201, fields))
    }

    // ---- promotion / cancellation --------------------------------------

    /// Promotes blocked jobs onto `machine_name` while it has free capacity,
    /// in priority order. A send failure means the waiting connection is
    /// gone; the job is cancelled and the next candidate is tried.
    async fn promote_blocked(&mut self, machine_name: &str) -> Result<(), QManagerError> {
        loop {
            let has_capacity = self
                .machines
                .get(machine_name)
                .map(Machine::has_capacity)
                .unwrap_or(false);
            if !has_capacity {
                break;
            }
            let Some(job_id) = self.machines.get_mut(machine_name).and_then(Machine::pop_blocked)
            else {
                break;
            };

            let other_machines = self
                .jobs
                .get(&job_id)
                .map(|j| j.machines.clone())
                .unwrap_or_default();
            for m in &other_machines {
                if m != machine_name {
                    if let Some(machine) = self.machines.get_mut(m) {
                        machine.unblock(job_id);
                    }
                }
            }

            let Some(job) = self.jobs.get_mut(&job_id) else {
                continue;
            };
            job.running = true;
            job.machines = vec![machine_name.to_string()];
            let session_id = job.session_id.take();
            let row = job.to_row();

            if let Err(e) = self.store.update_job_placement(&row).await {
                self.store.log_commit_failure("promote_blocked", &e);
                if let Some(job) = self.jobs.get_mut(&job_id) {
                    job.running = false;
                    job.machines = other_machines;
                    job.session_id = session_id;
                }
                continue;
            }

            if let Some(machine) = self.machines.get_mut(machine_name) {
                machine.run(job_id);
            }

            let Some(session_id) = session_id else {
                continue;
            };
            let Some(session) = self.blocked_sessions.remove(&session_id) else {
                continue;
            };
            let mut fields = BTreeMap::new();
            fields.insert("machine".to_string(), Value::Str(machine_name.to_string()));
            fields.insert("id".to_string(), Value::Int(job_id));
            if session.out_tx.send(Frame::response(202, fields)).is_err() {
                self.cancel_job(job_id).await?;
            }
        }
        Ok(())
    }

    /// Re-evaluates every blocked job's eligible machine set. Called after
    /// any machine or ACL mutation that could change who is eligible where.
    async fn revalidate_blocked(&mut self) -> Result<(), QManagerError> {
        let blocked_ids: Vec<i64> = self
            .jobs
            .iter()
            .filter(|(_, j)| !j.running)
            .map(|(id, _)| *id)
            .collect();
        for job_id in blocked_ids {
            self.revalidate_one(job_id).await?;
        }
        Ok(())
    }

    async fn revalidate_one(&mut self, job_id: i64) -> Result<(), QManagerError> {
        let Some(job) = self.jobs.get(&job_id) else {
            return Ok(());
        };
        let mdl = job.mdl.clone();
        let uid = job.owner;
        let gids = job.gids.clone();
        let old_machines = job.machines.clone();

        let compiled = match CompiledConstraint::compile(&mdl) {
            Ok(c) => c,
            Err(_) => return self.terminate_blocked(job_id, QManagerError::NoMachines).await,
        };
        let rows: Vec<MachineRow> = self.machines.values().map(|m| m.row.clone()).collect();
        let matched: Vec<String> = compiled
            .select(&rows)?
            .into_iter()
            .map(|m| m.name.clone())
            .collect();
        if matched.is_empty() {
            return self.terminate_blocked(job_id, QManagerError::NoMachines).await;
        }

        let mut eligible = Vec::new();
        for name in &matched {
            let rules = self.resolve_acl_rules(name);
            if let Some(m) = self.machines.get_mut(name) {
                if m.validate_user(uid, &gids, &rules) {
                    eligible.push(name.clone());
                }
            }
        }
        if eligible.is_empty() {
            return self
                .terminate_blocked(job_id, QManagerError::PermissionDenied)
                .await;
        }

        for name in &old_machines {
            if !eligible.contains(name) {
                if let Some(m) = self.machines.get_mut(name) {
                    m.unblock(job_id);
                }
            }
        }
        for name in &eligible {
            if !old_machines.contains(name) {
                let entry = self.jobs.get(&job_id).cloned();
                if let (Some(m), Some(job)) = (self.machines.get_mut(name), entry) {
                    m.block(&job);
                }
            }
        }
        if let Some(job) = self.jobs.get_mut(&job_id) {
            job.machines = eligible.clone();
        }

        let picked = {
            let mut refs: Vec<&mut Machine> = Vec::new();
            for n in eligible.iter() {
                if let Some(m) = self.machines.get_mut(n) {
                    // SAFETY: `eligible` names are distinct keys drawn from
                    // `self.machines`, so each iteration borrows a different
                    // entry; the borrow checker can't see that across loop
                    // iterations, so the pointer round-trip makes it explicit.
                    let ptr: *mut Machine = m;
                    refs.push(unsafe { &mut *ptr });
                }
            }
            Machine::pick(&mut refs).map(|idx| refs[idx].row.name.clone())
        };
        let Some(machine_name) = picked else {
            return Ok(());
        };

        for name in &eligible {
            if let Some(m) = self.machines.get_mut(name) {
                m.unblock(job_id);
            }
        }
        let session_id = self.jobs.get_mut(&job_id).and_then(|j| {
            j.running = true;
            j.machines = vec![machine_name.clone()];
            j.session_id.take()
        });
        if let Some(job) = self.jobs.get(&job_id) {
            if let Err(e) = self.store.update_job_placement(&job.to_row()).await {
                self.store.log_commit_failure("revalidate_one", &e);
            }
        }
        if let Some(m) = self.machines.get_mut(&machine_name) {
            m.run(job_id);
        }
        if let Some(session_id) = session_id {
            if let Some(session) = self.blocked_sessions.remove(&session_id) {
                let mut fields = BTreeMap::new();
                fields.insert("machine".to_string(), Value::Str(machine_name));
                fields.insert("id".to_string(), Value::Int(job_id));
                if session.out_tx.send(Frame::response(202, fields)).is_err() {
                    self.cancel_job(job_id).await?;
                }
            }
        }
        Ok(())
    }

    /// Removes a blocked job from every heap it sits on and tells its
    /// session why, then deletes the row.
    async fn terminate_blocked(&mut self, job_id: i64, err: QManagerError) -> Result<(), QManagerError> {
        let Some(job) = self.jobs.remove(&job_id) else {
            return Ok(());
        };
        for m in &job.machines {
            if let Some(machine) = self.machines.get_mut(m) {
                machine.unblock(job_id);
            }
        }
        if let Err(e) = self.store.delete_job(job_id).await {
            self.store.log_commit_failure("terminate_blocked", &e);
        }
        if let Some(sid) = job.session_id {
            if let Some(session) = self.blocked_sessions.remove(&sid) {
                let _ = session.out_tx.send(Frame::error(&err));
            }
        }
        Ok(())
    }

    /// Silently removes a job (disconnect, or a promotion whose session
    /// vanished): no frame is sent, the peer is already gone.
    async fn cancel_job(&mut self, job_id: i64) -> Result<(), QManagerError> {
        let Some(job) = self.jobs.remove(&job_id) else {
            return Ok(());
        };
        for m in &job.machines {
            if let Some(machine) = self.machines.get_mut(m) {
                machine.unblock(job_id);
                machine.finish(job_id);
            }
        }
        if let Err(e) = self.store.delete_job(job_id).await {
            self.store.log_commit_failure("cancel_job", &e);
        }
        if let Some(sid) = job.session_id {
            self.blocked_sessions.remove(&sid);
        }
        Ok(())
    }

    // ---- machine / ACL administration ----------------------------------

    async fn cmd_add_machine(&mut self, frame: &Frame) -> Result<Frame, QManagerError> {
        let name = get_str(frame, "name")?.to_lowercase();
        if self.machines.contains_key(&name) {
            return Err(QManagerError::AlreadyExists(name));
        }
        let acl = get_str_list(frame, "acl")?;
        for rule_name in &acl {
            if !self.acl_rules.contains_key(rule_name) {
                return Err(QManagerError::NoSuchObject(rule_name.clone()));
            }
        }
        let row = MachineRow {
            id: 0,
            name: name.clone(),
            domain: get_str(frame, "domain")?.to_lowercase(),
            primary_pool: get_str(frame, "primarypool")?.to_lowercase(),
            pools: get_str_list(frame, "pools")?,
            arch: get_str(frame, "arch")?.to_lowercase(),
            osversion: get_nonneg_int(frame, "osversion")?,
            numcpus: get_nonneg_int(frame, "numcpus")?,
            maxjobs: get_nonneg_int(frame, "maxjobs")?,
            haszfs: get_bool(frame, "haszfs")?,
            online: get_bool(frame, "online")?,
            acl,
        };
        let id = self.store.insert_machine(&row).await?;
        let mut row = row;
        row.id = id;
        self.machines.insert(name, Machine::new(row));
        Ok(Frame::ok())
    }

    async fn cmd_update_machine(&mut self, frame: &Frame) -> Result<Frame, QManagerError> {
        let name = get_str(frame, "name")?.to_lowercase();
        if !self.machines.contains_key(&name) {
            return Err(QManagerError::NoSuchObject(name));
        }
        if let Some(acl) = get_opt_str_list(frame, "acl")? {
            for rule_name in &acl {
                if !self.acl_rules.contains_key(rule_name) {
                    return Err(QManagerError::NoSuchObject(rule_name.clone()));
                }
            }
        }

        let machine = self.machines.get_mut(&name).unwrap();
        if let Some(v) = get_opt_str(frame, "domain")? {
            machine.row.domain = v.to_lowercase();
        }
        if let Some(v) = get_opt_str(frame, "primarypool")? {
            machine.row.primary_pool = v.to_lowercase();
        }
        if let Some(v) = get_opt_str_list(frame, "pools")? {
            machine.row.pools = v;
        }
        if let Some(v) = get_opt_str(frame, "arch")? {
            machine.row.arch = v.to_lowercase();
        }
        if let Some(v) = get_opt_nonneg_int(frame, "osversion")? {
            machine.row.osversion = v;
        }
        if let Some(v) = get_opt_nonneg_int(frame, "numcpus")? {
            machine.row.numcpus = v;
        }
        if let Some(v) = get_opt_nonneg_int(frame, "maxjobs")? {
            machine.row.maxjobs = v;
        }
        if let Some(v) = get_opt_bool(frame, "haszfs")? {
            machine.row.haszfs = v;
        }
        if let Some(v) = get_opt_bool(frame, "online")? {
            machine.row.online = v;
        }
        if let Some(v) = get_opt_str_list(frame, "acl")? {
            machine.row.acl = v;
        }
        machine.invalidate_acl_cache();
        let row = machine.row.clone();
        self.store.update_machine(&row).await?;
        self.revalidate_blocked().await?;
        Ok(Frame::ok())
    }

    async fn cmd_delete_machine(&mut self, frame: &Frame) -> Result<Frame, QManagerError> {
        let name = get_str(frame, "name")?.to_lowercase();
        let machine = self.machines.get(&name).ok_or_else(|| QManagerError::NoSuchObject(name.clone()))?;
        if !machine.is_idle() {
            return Err(QManagerError::MachineBusy(name));
        }
        self.store.delete_machine(&name).await?;
        self.machines.remove(&name);
        Ok(Frame::ok())
    }

    async fn cmd_add_acl(&mut self, frame: &Frame) -> Result<Frame, QManagerError> {
        let name = get_str(frame, "name")?.to_lowercase();
        if self.acl_rules.contains_key(&name) {
            return Err(QManagerError::AlreadyExists(name));
        }
        let uid_list = resolve_uid_list(&get_str_list(frame, "uidlist")?)?;
        let gid_list = resolve_gid_list(&get_str_list(frame, "gidlist")?)?;
        let sense = get_bool(frame, "sense")?;
        let row = AclRow {
            name: name.clone(),
            uid_list,
            gid_list,
            sense,
        };
        self.store.insert_acl(&row).await?;
        self.acl_rules.insert(
            name,
            AclRule {
                name: row.name,
                uid_list: row.uid_list,
                gid_list: row.gid_list,
                sense: row.sense,
            },
        );
        Ok(Frame::ok())
    }

    async fn cmd_update_acl(&mut self, frame: &Frame) -> Result<Frame, QManagerError> {
        let name = get_str(frame, "name")?.to_lowercase();
        let rule = self
            .acl_rules
            .get_mut(&name)
            .ok_or_else(|| QManagerError::NoSuchObject(name.clone()))?;
        if let Some(uids) = get_opt_str_list(frame, "uidlist")? {
            rule.uid_list = resolve_uid_list(&uids)?;
        }
        if let Some(gids) = get_opt_str_list(frame, "gidlist")? {
            rule.gid_list = resolve_gid_list(&gids)?;
        }
        if let Some(sense) = get_opt_bool(frame, "sense")? {
            rule.sense = sense;
        }
        let row = AclRow {
            name: rule.name.clone(),
            uid_list: rule.uid_list.clone(),
            gid_list: rule.gid_list.clone(),
            sense: rule.sense,
        };
        self.store.update_acl(&row).await?;
        for machine in self.machines.values_mut() {
            if machine.row.acl.iter().any(|n| n == &name) {
                machine.invalidate_acl_cache();
            }
        }
        self.revalidate_blocked().await?;
        Ok(Frame::ok())
    }

    async fn cmd_del_acl(&mut self, frame: &Frame) -> Result<Frame, QManagerError> {
        let name = get_str(frame, "name")?.to_lowercase();
        if !self.acl_rules.contains_key(&name) {
            return Err(QManagerError::NoSuchObject(name));
        }
        if let Some(machine) = self.machines.values().find(|m| m.row.acl.iter().any(|n| n == &name)) {
            return Err(QManagerError::AclInUse(machine.row.name.clone()));
        }
        self.store.delete_acl(&name).await?;
        self.acl_rules.remove(&name);
        Ok(Frame::ok())
    }
}

fn resolve_uid_list(specs: &[String]) -> Result<std::collections::BTreeSet<u32>, QManagerError> {
    specs.iter().map(|s| crate::core::identity::resolve_uid(s)).collect()
}

fn resolve_gid_list(specs: &[String]) -> Result<std::collections::BTreeSet<u32>, QManagerError> {
    specs.iter().map(|s| crate::core::identity::resolve_gid(s)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::identity::Principal;
    use std::collections::BTreeSet;

    fn fields(pairs: Vec<(&str, Value)>) -> BTreeMap<String, Value> {
        pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }

    fn session(id: u64, uid: u32, gids: &[u32]) -> (Session, mpsc::UnboundedReceiver<Frame>) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        (
            Session {
                id,
                principal: Principal {
                    uid,
                    gids: gids.iter().copied().collect::<BTreeSet<_>>(),
                },
                out_tx,
            },
            out_rx,
        )
    }

    async fn new_state() -> SchedulerState {
        let store = CatalogStore::open(":memory:").await.unwrap();
        SchedulerState::bootstrap(store).await.unwrap()
    }

    fn add_acl_frame(name: &str, uidlist: Vec<&str>, gidlist: Vec<&str>, sense: bool) -> Frame {
        Frame::request(
            "add_acl",
            fields(vec![
                ("name", Value::Str(name.to_string())),
                (
                    "uidlist",
                    Value::List(uidlist.into_iter().map(|s| Value::Str(s.to_string())).collect()),
                ),
                (
                    "gidlist",
                    Value::List(gidlist.into_iter().map(|s| Value::Str(s.to_string())).collect()),
                ),
                ("sense", Value::Bool(sense)),
            ]),
        )
    }

    fn add_machine_frame(name: &str, maxjobs: i64, online: bool, acl: Vec<&str>) -> Frame {
        Frame::request(
            "add",
            fields(vec![
                ("name", Value::Str(name.to_string())),
                ("domain", Value::Str("d".to_string())),
                ("primarypool", Value::Str("p1".to_string())),
                ("pools", Value::List(vec![Value::Str("p1".to_string())])),
                ("arch", Value::Str("amd64".to_string())),
                ("osversion", Value::Int(1200)),
                ("numcpus", Value::Int(4)),
                ("maxjobs", Value::Int(maxjobs)),
                ("haszfs", Value::Bool(true)),
                ("online", Value::Bool(online)),
                (
                    "acl",
                    Value::List(acl.into_iter().map(|s| Value::Str(s.to_string())).collect()),
                ),
            ]),
        )
    }

    fn acquire_frame(name: &str, priority: i64) -> Frame {
        Frame::request(
            "acquire",
            fields(vec![
                ("name", Value::Str(name.to_string())),
                ("type", Value::Str("build".to_string())),
                ("priority", Value::Int(priority)),
                (
                    "mdl",
                    Value::List(vec![Value::Str("arch = amd64".to_string())]),
                ),
            ]),
        )
    }

    fn release_frame(id: i64) -> Frame {
        Frame::request("release", fields(vec![("id", Value::Int(id))]))
    }

    fn recv(rx: &mut mpsc::UnboundedReceiver<Frame>) -> Frame {
        rx.try_recv().expect("expected a frame on this session")
    }

    #[tokio::test]
    async fn basic_acquire_then_release() {
        let mut state = new_state().await;
        let (acl_session, mut acl_rx) = session(1, 0, &[]);
        state
            .handle_request(acl_session, add_acl_frame("open", vec![], vec![], true))
            .await;
        assert_eq!(recv(&mut acl_rx), Frame::ok());

        let (admin_session, mut admin_rx) = session(2, 0, &[]);
        state
            .handle_request(admin_session, add_machine_frame("m1", 1, true, vec!["open"]))
            .await;
        assert_eq!(recv(&mut admin_rx), Frame::ok());

        let (client, mut client_rx) = session(3, 1001, &[]);
        state.handle_request(client, acquire_frame("j1", 10)).await;
        let reply = recv(&mut client_rx);
        assert_eq!(reply.verb, Verb::Status(202));
        assert_eq!(reply.get("machine"), Some(&Value::Str("m1".to_string())));
        assert_eq!(reply.get("id"), Some(&Value::Int(1)));

        let (release_session, mut release_rx) = session(4, 1001, &[]);
        state
            .handle_request(release_session, release_frame(1))
            .await;
        assert_eq!(recv(&mut release_rx), Frame::ok());
    }

    async fn setup_single_slot_machine(state: &mut SchedulerState) {
        let (acl_session, mut acl_rx) = session(100, 0, &[]);
        state
            .handle_request(acl_session, add_acl_frame("open", vec![], vec![], true))
            .await;
        assert_eq!(recv(&mut acl_rx), Frame::ok());
        let (admin_session, mut admin_rx) = session(101, 0, &[]);
        state
            .handle_request(admin_session, add_machine_frame("m1", 1, true, vec!["open"]))
            .await;
        assert_eq!(recv(&mut admin_rx), Frame::ok());
    }

    #[tokio::test]
    async fn would_block_then_promote_on_release() {
        let mut state = new_state().await;
        setup_single_slot_machine(&mut state).await;

        let (first, mut first_rx) = session(1, 1001, &[]);
        state.handle_request(first, acquire_frame("j1", 10)).await;
        let reply = recv(&mut first_rx);
        assert_eq!(reply.verb, Verb::Status(202));
        assert_eq!(reply.get("id"), Some(&Value::Int(1)));

        let (second, mut second_rx) = session(2, 1002, &[]);
        state.handle_request(second, acquire_frame("j2", 10)).await;
        let blocked_reply = recv(&mut second_rx);
        assert_eq!(blocked_reply.verb, Verb::Status(203));
        assert_eq!(blocked_reply.get("id"), Some(&Value::Int(2)));
        assert!(second_rx.try_recv().is_err());

        let (releaser, mut releaser_rx) = session(3, 1001, &[]);
        state.handle_request(releaser, release_frame(1)).await;
        assert_eq!(recv(&mut releaser_rx), Frame::ok());

        let promoted = recv(&mut second_rx);
        assert_eq!(promoted.verb, Verb::Status(202));
        assert_eq!(promoted.get("machine"), Some(&Value::Str("m1".to_string())));
        assert_eq!(promoted.get("id"), Some(&Value::Int(2)));
    }

    #[tokio::test]
    async fn priority_ordering_promotes_lowest_priority_value_first() {
        let mut state = new_state().await;
        setup_single_slot_machine(&mut state).await;

        let (holder, mut holder_rx) = session(1, 1001, &[]);
        state.handle_request(holder, acquire_frame("j1", 10)).await;
        assert_eq!(recv(&mut holder_rx).verb, Verb::Status(202));

        let (low_pri, mut low_pri_rx) = session(2, 1001, &[]);
        state.handle_request(low_pri, acquire_frame("j2", 20)).await;
        assert_eq!(recv(&mut low_pri_rx).verb, Verb::Status(203));

        let (high_pri, mut high_pri_rx) = session(3, 1001, &[]);
        state.handle_request(high_pri, acquire_frame("j3", 5)).await;
        assert_eq!(recv(&mut high_pri_rx).verb, Verb::Status(203));

        let (releaser, mut releaser_rx) = session(4, 1001, &[]);
        state.handle_request(releaser, release_frame(1)).await;
        assert_eq!(recv(&mut releaser_rx), Frame::ok());

        // priority 5 (job 3) must be promoted before priority 20 (job 2),
        // even though job 2 was submitted first.
        let promoted = recv(&mut high_pri_rx);
        assert_eq!(promoted.get("id"), Some(&Value::Int(3)));
        assert!(low_pri_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn acl_deny_blocks_one_user_but_not_another() {
        let mut state = new_state().await;
        let (s1, mut r1) = session(1, 0, &[]);
        state
            .handle_request(s1, add_acl_frame("denyalice", vec!["1001"], vec![], false))
            .await;
        assert_eq!(recv(&mut r1), Frame::ok());
        let (s2, mut r2) = session(2, 0, &[]);
        state
            .handle_request(s2, add_acl_frame("allowall", vec![], vec![], true))
            .await;
        assert_eq!(recv(&mut r2), Frame::ok());
        let (s3, mut r3) = session(3, 0, &[]);
        state
            .handle_request(
                s3,
                add_machine_frame("m1", 2, true, vec!["denyalice", "allowall"]),
            )
            .await;
        assert_eq!(recv(&mut r3), Frame::ok());

        let (alice, mut alice_rx) = session(4, 1001, &[]);
        state.handle_request(alice, acquire_frame("j1", 10)).await;
        let denied = recv(&mut alice_rx);
        assert_eq!(denied.verb, Verb::Status(QManagerError::PermissionDenied.status_code()));

        let (bob, mut bob_rx) = session(5, 1002, &[]);
        state.handle_request(bob, acquire_frame("j2", 10)).await;
        assert_eq!(recv(&mut bob_rx).verb, Verb::Status(202));
    }

    #[tokio::test]
    async fn revalidation_on_update_promotes_a_blocked_job() {
        let mut state = new_state().await;
        let (acl_session, mut acl_rx) = session(1, 0, &[]);
        state
            .handle_request(acl_session, add_acl_frame("open", vec![], vec![], true))
            .await;
        assert_eq!(recv(&mut acl_rx), Frame::ok());
        let (admin, mut admin_rx) = session(2, 0, &[]);
        state
            .handle_request(admin, add_machine_frame("m1", 1, false, vec!["open"]))
            .await;
        assert_eq!(recv(&mut admin_rx), Frame::ok());

        let (client, mut client_rx) = session(3, 1001, &[]);
        state.handle_request(client, acquire_frame("j1", 10)).await;
        let blocked = recv(&mut client_rx);
        assert_eq!(blocked.verb, Verb::Status(203));

        let (updater, mut updater_rx) = session(4, 0, &[]);
        let update_frame = Frame::request(
            "update",
            fields(vec![
                ("name", Value::Str("m1".to_string())),
                ("online", Value::Bool(true)),
            ]),
        );
        state.handle_request(updater, update_frame).await;
        assert_eq!(recv(&mut updater_rx), Frame::ok());

        let promoted = recv(&mut client_rx);
        assert_eq!(promoted.verb, Verb::Status(202));
        assert_eq!(promoted.get("machine"), Some(&Value::Str("m1".to_string())));
    }

    #[tokio::test]
    async fn disconnect_while_blocked_cancels_the_job_without_a_frame() {
        let mut state = new_state().await;
        setup_single_slot_machine(&mut state).await;

        let (holder, mut holder_rx) = session(1, 1001, &[]);
        state.handle_request(holder, acquire_frame("j1", 10)).await;
        assert_eq!(recv(&mut holder_rx).verb, Verb::Status(202));

        let (blocked, mut blocked_rx) = session(2, 1001, &[]);
        state.handle_request(blocked, acquire_frame("j2", 10)).await;
        assert_eq!(recv(&mut blocked_rx).verb, Verb::Status(203));

        state.handle_cancel(2).await.unwrap();
        assert!(!state.jobs.contains_key(&2));
        assert!(!state.blocked_sessions.contains_key(&2));

        let (releaser, mut releaser_rx) = session(3, 1001, &[]);
        state.handle_request(releaser, release_frame(1)).await;
        assert_eq!(recv(&mut releaser_rx), Frame::ok());
        assert!(blocked_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn add_machine_rejects_negative_size_fields() {
        let mut state = new_state().await;
        let (acl_session, mut acl_rx) = session(1, 0, &[]);
        state
            .handle_request(acl_session, add_acl_frame("open", vec![], vec![], true))
            .await;
        assert_eq!(recv(&mut acl_rx), Frame::ok());

        let (admin, mut admin_rx) = session(2, 0, &[]);
        let bad_frame = Frame::request(
            "add",
            fields(vec![
                ("name", Value::Str("m1".to_string())),
                ("domain", Value::Str("d".to_string())),
                ("primarypool", Value::Str("p1".to_string())),
                ("pools", Value::List(vec![Value::Str("p1".to_string())])),
                ("arch", Value::Str("amd64".to_string())),
                ("osversion", Value::Int(1200)),
                ("numcpus", Value::Int(4)),
                ("maxjobs", Value::Int(-1)),
                ("haszfs", Value::Bool(true)),
                ("online", Value::Bool(true)),
                ("acl", Value::List(vec![Value::Str("open".to_string())])),
            ]),
        );
        state.handle_request(admin, bad_frame).await;
        let reply = recv(&mut admin_rx);
        assert_eq!(reply.verb, Verb::Status(QManagerError::ArgumentError(String::new()).status_code()));
        assert!(!state.machines.contains_key("m1"));
    }

    #[tokio::test]
    async fn already_exists_error_carries_a_structured_name_field() {
        let mut state = new_state().await;
        setup_single_slot_machine(&mut state).await;

        let (admin, mut admin_rx) = session(1, 0, &[]);
        state
            .handle_request(admin, add_machine_frame("m1", 1, true, vec!["open"]))
            .await;
        let reply = recv(&mut admin_rx);
        assert_eq!(reply.verb, Verb::Status(411));
        assert_eq!(reply.get("name"), Some(&Value::Str("m1".to_string())));
    }
}

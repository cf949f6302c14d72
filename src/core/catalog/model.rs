// src/core/catalog/model.rs

//! Plain row types mirroring the three catalog tables (`acl`, `machines`,
//! `jobs`). These are the persisted shape; runtime-only fields (the blocked
//! heap, the `running` map, the validation cache) live on `Machine`/`Job` in
//! `core::machine`/`core::job`, never here.

use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AclRow {
    pub name: String,
    pub uid_list: BTreeSet<u32>,
    pub gid_list: BTreeSet<u32>,
    pub sense: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MachineRow {
    pub id: i64,
    pub name: String,
    pub domain: String,
    pub primary_pool: String,
    pub pools: Vec<String>,
    pub arch: String,
    pub osversion: i64,
    pub numcpus: i64,
    pub maxjobs: i64,
    pub haszfs: bool,
    pub online: bool,
    pub acl: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobRow {
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
}

/// Serializes a comma-joined list field for storage; empty elements are not
/// allowed to appear in any of these lists so the join is unambiguous.
pub fn join_list(items: &[String]) -> String {
    items.join(",")
}

pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn join_uid_set(items: &BTreeSet<u32>) -> String {
    items
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

pub fn split_uid_set(raw: &str) -> BTreeSet<u32> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse().ok())
        .collect()
}

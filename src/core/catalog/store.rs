// src/core/catalog/store.rs

//! The durable catalog: a single SQLite file holding the `acl`, `machines`,
//! and `jobs` tables. Runtime state (heaps, validation caches) never touches
//! this file; it only round-trips the persisted columns of `core::catalog::model`.

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::{info, warn};

use super::model::{
    join_list, join_uid_set, split_list, split_uid_set, AclRow, JobRow, MachineRow,
};
use crate::core::errors::QManagerError;

pub struct CatalogStore {
    pool: SqlitePool,
}

impl CatalogStore {
    /// Opens (creating if necessary) the catalog file at `path` and ensures
    /// the schema exists.
    pub async fn open(path: &str) -> Result<Self, QManagerError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS acl (
                name TEXT PRIMARY KEY,
                uidlist TEXT NOT NULL DEFAULT '',
                gidlist TEXT NOT NULL DEFAULT '',
                sense INTEGER NOT NULL
            )",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS machines (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                domain TEXT NOT NULL,
                primarypool TEXT NOT NULL,
                pools TEXT NOT NULL DEFAULT '',
                arch TEXT NOT NULL,
                osversion INTEGER NOT NULL,
                numcpus INTEGER NOT NULL,
                maxjobs INTEGER NOT NULL,
                haszfs INTEGER NOT NULL,
                online INTEGER NOT NULL,
                acl TEXT NOT NULL DEFAULT ''
            )",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                jobtype TEXT NOT NULL,
                priority INTEGER NOT NULL,
                owner INTEGER NOT NULL,
                gids TEXT NOT NULL DEFAULT '',
                mdl TEXT NOT NULL DEFAULT '',
                machines TEXT NOT NULL DEFAULT '',
                starttime INTEGER NOT NULL,
                running INTEGER NOT NULL
            )",
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    /// Loads the ACL and machine catalogs in full; called once at startup.
    pub async fn load_all(&self) -> Result<(Vec<AclRow>, Vec<MachineRow>), QManagerError> {
        let acl_rows = sqlx::query("SELECT name, uidlist, gidlist, sense FROM acl")
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(|row| AclRow {
                name: row.get("name"),
                uid_list: split_uid_set(row.get::<String, _>("uidlist").as_str()),
                gid_list: split_uid_set(row.get::<String, _>("gidlist").as_str()),
                sense: row.get::<i64, _>("sense") != 0,
            })
            .collect();

        let machine_rows = sqlx::query(
            "SELECT id, name, domain, primarypool, pools, arch, osversion, numcpus, maxjobs, haszfs, online, acl FROM machines",
        )
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|row| MachineRow {
            id: row.get("id"),
            name: row.get("name"),
            domain: row.get("domain"),
            primary_pool: row.get("primarypool"),
            pools: split_list(row.get::<String, _>("pools").as_str()),
            arch: row.get("arch"),
            osversion: row.get("osversion"),
            numcpus: row.get("numcpus"),
            maxjobs: row.get("maxjobs"),
            haszfs: row.get::<i64, _>("haszfs") != 0,
            online: row.get::<i64, _>("online") != 0,
            acl: split_list(row.get::<String, _>("acl").as_str()),
        })
        .collect();

        Ok((acl_rows, machine_rows))
    }

    /// Crash recovery: unconditionally discards every persisted job row.
    /// Revalidating blocked jobs across a restart is not implemented (see
    /// design notes), so the safest policy is to forget them; clients are
    /// expected to reconnect and re-acquire.
    pub async fn discard_all_jobs(&self) -> Result<u64, QManagerError> {
        let result = sqlx::query("DELETE FROM jobs").execute(&self.pool).await?;
        let deleted = result.rows_affected();
        if deleted > 0 {
            info!(count = deleted, "discarded stale job rows on startup");
        }
        Ok(deleted)
    }

    pub async fn insert_acl(&self, row: &AclRow) -> Result<(), QManagerError> {
        sqlx::query("INSERT INTO acl (name, uidlist, gidlist, sense) VALUES (?, ?, ?, ?)")
            .bind(&row.name)
            .bind(join_uid_set(&row.uid_list))
            .bind(join_uid_set(&row.gid_list))
            .bind(row.sense as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_acl(&self, row: &AclRow) -> Result<(), QManagerError> {
        sqlx::query("UPDATE acl SET uidlist = ?, gidlist = ?, sense = ? WHERE name = ?")
            .bind(join_uid_set(&row.uid_list))
            .bind(join_uid_set(&row.gid_list))
            .bind(row.sense as i64)
            .bind(&row.name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_acl(&self, name: &str) -> Result<(), QManagerError> {
        sqlx::query("DELETE FROM acl WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn insert_machine(&self, row: &MachineRow) -> Result<i64, QManagerError> {
        let result = sqlx::query(
            "INSERT INTO machines (name, domain, primarypool, pools, arch, osversion, numcpus, maxjobs, haszfs, online, acl)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&row.name)
        .bind(&row.domain)
        .bind(&row.primary_pool)
        .bind(join_list(&row.pools))
        .bind(&row.arch)
        .bind(row.osversion)
        .bind(row.numcpus)
        .bind(row.maxjobs)
        .bind(row.haszfs as i64)
        .bind(row.online as i64)
        .bind(join_list(&row.acl))
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn update_machine(&self, row: &MachineRow) -> Result<(), QManagerError> {
        sqlx::query(
            "UPDATE machines SET domain = ?, primarypool = ?, pools = ?, arch = ?, osversion = ?,
             numcpus = ?, maxjobs = ?, haszfs = ?, online = ?, acl = ? WHERE name = ?",
        )
        .bind(&row.domain)
        .bind(&row.primary_pool)
        .bind(join_list(&row.pools))
        .bind(&row.arch)
        .bind(row.osversion)
        .bind(row.numcpus)
        .bind(row.maxjobs)
        .bind(row.haszfs as i64)
        .bind(row.online as i64)
        .bind(join_list(&row.acl))
        .bind(&row.name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_machine(&self, name: &str) -> Result<(), QManagerError> {
        sqlx::query("DELETE FROM machines WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn insert_job(&self, row: &JobRow) -> Result<i64, QManagerError> {
        let result = sqlx::query(
            "INSERT INTO jobs (name, jobtype, priority, owner, gids, mdl, machines, starttime, running)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&row.name)
        .bind(&row.job_type)
        .bind(row.priority)
        .bind(row.owner)
        .bind(join_uid_set(&row.gids))
        .bind(join_list(&row.mdl))
        .bind(join_list(&row.machines))
        .bind(row.starttime)
        .bind(row.running as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn update_job_placement(&self, row: &JobRow) -> Result<(), QManagerError> {
        sqlx::query("UPDATE jobs SET machines = ?, running = ? WHERE id = ?")
            .bind(join_list(&row.machines))
            .bind(row.running as i64)
            .bind(row.id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_job(&self, id: i64) -> Result<(), QManagerError> {
        sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Logs and swallows a storage failure per the commit-failure policy:
    /// the in-memory mutation is rolled back by the caller, the command
    /// fails, but the server keeps running.
    pub fn log_commit_failure(&self, context: &str, err: &QManagerError) {
        warn!(context, error = %err, "catalog commit failed");
    }
}

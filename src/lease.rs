//! Write leases: one exclusive holder per file path, renewed on activity.
//!
//! Timestamps are unix seconds so the lease table survives checkpoint
//! serialization. A holder past its soft limit may lose a path to a competing
//! `acquire`; a holder past its hard limit is reclaimed by the expiry sweep.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{FsMetaError, FsMetaResult};

#[derive(Debug, Clone, Copy)]
pub struct LeaseConfig {
    pub soft_limit: Duration,
    pub hard_limit: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            soft_limit: Duration::from_secs(60),
            hard_limit: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub holder: String,
    pub paths: BTreeSet<String>,
    pub last_renewed: u64,
}

pub struct LeaseManager {
    leases: HashMap<String, Lease>,
    by_path: HashMap<String, String>,
    config: LeaseConfig,
}

impl LeaseManager {
    pub fn new(config: LeaseConfig) -> Self {
        Self {
            leases: HashMap::new(),
            by_path: HashMap::new(),
            config,
        }
    }

    pub fn restore(config: LeaseConfig, leases: Vec<Lease>) -> Self {
        let mut mgr = Self::new(config);
        for lease in leases {
            for path in &lease.paths {
                mgr.by_path.insert(path.clone(), lease.holder.clone());
            }
            mgr.leases.insert(lease.holder.clone(), lease);
        }
        mgr
    }

    fn is_soft_expired(&self, holder: &str, now: u64) -> bool {
        self.leases
            .get(holder)
            .map(|l| now >= l.last_renewed + self.config.soft_limit.as_secs())
            .unwrap_or(true)
    }

    /// Grant (or renew) the lease on `path` for `holder`. Fails immediately
    /// with `AlreadyLeased` when another holder still has a live lease on the
    /// path; a soft-expired competitor is preempted.
    pub fn acquire(&mut self, path: &str, holder: &str, now: u64) -> FsMetaResult<()> {
        if let Some(current) = self.by_path.get(path).cloned() {
            if current == holder {
                self.touch(holder, now);
                return Ok(());
            }
            if !self.is_soft_expired(&current, now) {
                return Err(FsMetaError::AlreadyLeased(format!(
                    "{} is held by {}",
                    path, current
                )));
            }
            info!(
                "lease on {} preempted from soft-expired holder {}",
                path, current
            );
            self.remove_path(path);
        }
        let lease = self.leases.entry(holder.to_string()).or_insert_with(|| Lease {
            holder: holder.to_string(),
            paths: BTreeSet::new(),
            last_renewed: now,
        });
        lease.paths.insert(path.to_string());
        lease.last_renewed = now;
        self.by_path.insert(path.to_string(), holder.to_string());
        Ok(())
    }

    fn touch(&mut self, holder: &str, now: u64) {
        if let Some(lease) = self.leases.get_mut(holder) {
            lease.last_renewed = now;
        }
    }

    pub fn renew(&mut self, holder: &str, now: u64) -> FsMetaResult<()> {
        let lease = self
            .leases
            .get_mut(holder)
            .ok_or_else(|| FsMetaError::LeaseNotFound(format!("holder {}", holder)))?;
        lease.last_renewed = now;
        Ok(())
    }

    fn remove_path(&mut self, path: &str) -> Option<String> {
        let holder = self.by_path.remove(path)?;
        let emptied = match self.leases.get_mut(&holder) {
            Some(lease) => {
                lease.paths.remove(path);
                lease.paths.is_empty()
            }
            None => false,
        };
        if emptied {
            self.leases.remove(&holder);
        }
        Some(holder)
    }

    /// Release the lease binding for one path, returning the holder it was
    /// bound to.
    pub fn release(&mut self, path: &str) -> FsMetaResult<String> {
        self.remove_path(path)
            .ok_or_else(|| FsMetaError::LeaseNotFound(path.to_string()))
    }

    /// Put back a binding removed by a failed recovery, keeping the original
    /// renewal time so the holder still counts as expired on the next sweep.
    pub fn reinstate(&mut self, path: &str, holder: &str, last_renewed: u64) {
        let lease = self.leases.entry(holder.to_string()).or_insert_with(|| Lease {
            holder: holder.to_string(),
            paths: BTreeSet::new(),
            last_renewed,
        });
        lease.paths.insert(path.to_string());
        if last_renewed < lease.last_renewed {
            lease.last_renewed = last_renewed;
        }
        self.by_path.insert(path.to_string(), holder.to_string());
    }

    /// Move a lease binding to a new path, e.g. when an open file is renamed.
    /// No-op when the old path is not leased.
    pub fn rename_path(&mut self, old: &str, new: &str) {
        if let Some(holder) = self.by_path.remove(old) {
            if let Some(lease) = self.leases.get_mut(&holder) {
                lease.paths.remove(old);
                lease.paths.insert(new.to_string());
            }
            self.by_path.insert(new.to_string(), holder);
        }
    }

    pub fn lease_by_path(&self, path: &str) -> Option<&Lease> {
        self.by_path.get(path).and_then(|h| self.leases.get(h))
    }

    pub fn holder_of(&self, path: &str) -> Option<&str> {
        self.by_path.get(path).map(String::as_str)
    }

    /// Paths whose holder has passed the hard limit; these need forced
    /// recovery.
    pub fn expired_paths(&self, now: u64) -> Vec<String> {
        let hard = self.config.hard_limit.as_secs();
        let mut out: Vec<String> = self
            .leases
            .values()
            .filter(|l| now >= l.last_renewed + hard)
            .flat_map(|l| l.paths.iter().cloned())
            .collect();
        out.sort();
        out
    }

    pub fn leased_paths(&self) -> Vec<String> {
        let mut out: Vec<String> = self.by_path.keys().cloned().collect();
        out.sort();
        out
    }

    pub fn lease_count(&self) -> usize {
        self.leases.len()
    }

    /// Holder-ordered dump for checkpointing.
    pub fn snapshot(&self) -> Vec<Lease> {
        let mut out: Vec<Lease> = self.leases.values().cloned().collect();
        out.sort_by(|a, b| a.holder.cmp(&b.holder));
        out
    }
}

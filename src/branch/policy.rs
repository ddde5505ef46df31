//! Writable branch selection for new entries

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

use super::{BranchId, BranchTable};
use crate::error::{Error, Result};

/// Policy choosing the writable branch that receives a new entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CreatePolicy {
    /// Nearest writable branch at or above the parent's top branch
    TopDownParent,
    /// Cycle through writable branches
    RoundRobin,
    /// Writable branch with the most free space, re-measured every interval
    MostFreeSpace { interval_secs: u64 },
    /// Most free space, falling back to round robin below the watermark
    MostFreeSpaceRoundRobin { watermark: u64 },
    /// Most free space among writable branches at or above the parent
    ParentMostFreeSpace,
}

impl Default for CreatePolicy {
    fn default() -> Self {
        CreatePolicy::TopDownParent
    }
}

impl FromStr for CreatePolicy {
    type Err = Error;

    /// Parse the short forms `tdp`, `rr`, `mfs[:secs]`, `mfsrr:bytes`, `pmfs`
    fn from_str(s: &str) -> Result<Self> {
        let (name, arg) = match s.trim().split_once(':') {
            Some((n, a)) => (n, Some(a)),
            None => (s.trim(), None),
        };
        let number = |default: Option<u64>| -> Result<u64> {
            match arg {
                Some(a) => a
                    .parse::<u64>()
                    .map_err(|e| Error::InvalidConfig(format!("bad policy argument {}: {}", a, e))),
                None => default.ok_or_else(|| {
                    Error::InvalidConfig(format!("policy {} needs an argument", name))
                }),
            }
        };
        match name {
            "tdp" => Ok(CreatePolicy::TopDownParent),
            "rr" => Ok(CreatePolicy::RoundRobin),
            "mfs" => Ok(CreatePolicy::MostFreeSpace {
                interval_secs: number(Some(30))?,
            }),
            "mfsrr" => Ok(CreatePolicy::MostFreeSpaceRoundRobin {
                watermark: number(None)?,
            }),
            "pmfs" => Ok(CreatePolicy::ParentMostFreeSpace),
            other => Err(Error::InvalidConfig(format!("unknown create policy: {}", other))),
        }
    }
}

impl fmt::Display for CreatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CreatePolicy::TopDownParent => write!(f, "tdp"),
            CreatePolicy::RoundRobin => write!(f, "rr"),
            CreatePolicy::MostFreeSpace { interval_secs } => write!(f, "mfs:{}", interval_secs),
            CreatePolicy::MostFreeSpaceRoundRobin { watermark } => write!(f, "mfsrr:{}", watermark),
            CreatePolicy::ParentMostFreeSpace => write!(f, "pmfs"),
        }
    }
}

#[derive(Default)]
struct MfsCache {
    chosen: Option<BranchId>,
    measured_at: Option<Instant>,
}

/// Stateful evaluator of a `CreatePolicy`
pub struct BranchSelector {
    policy: CreatePolicy,
    next_rr: AtomicUsize,
    mfs: Mutex<MfsCache>,
}

impl BranchSelector {
    pub fn new(policy: CreatePolicy) -> Self {
        Self {
            policy,
            next_rr: AtomicUsize::new(0),
            mfs: Mutex::new(MfsCache::default()),
        }
    }

    pub fn policy(&self) -> &CreatePolicy {
        &self.policy
    }

    /// Pick the branch index for a new entry under a parent whose top
    /// branch is `parent_top`. A forced target bypasses the policy but must
    /// be writable.
    pub fn select(
        &self,
        table: &BranchTable,
        parent_top: Option<usize>,
        force: Option<usize>,
    ) -> Result<usize> {
        if let Some(index) = force {
            let branch = table.branch(index)?;
            if !branch.is_writable() {
                return Err(Error::ReadOnly(format!(
                    "forced branch {} is read-only",
                    index
                )));
            }
            return Ok(index);
        }

        let writable = table.writable();
        if writable.is_empty() {
            return Err(Error::ReadOnly("no writable branch".to_string()));
        }

        let index = match &self.policy {
            CreatePolicy::TopDownParent => Self::top_down_parent(&writable, parent_top),
            CreatePolicy::RoundRobin => self.round_robin(&writable),
            CreatePolicy::MostFreeSpace { interval_secs } => {
                self.most_free_cached(table, &writable, Duration::from_secs(*interval_secs))
            }
            CreatePolicy::MostFreeSpaceRoundRobin { watermark } => {
                match Self::most_free(table, &writable) {
                    Some((index, free)) if free >= *watermark => index,
                    _ => self.round_robin(&writable),
                }
            }
            CreatePolicy::ParentMostFreeSpace => {
                let limit = parent_top.unwrap_or(0);
                let upper: Vec<usize> = writable.iter().copied().filter(|i| *i <= limit).collect();
                match Self::most_free(table, &upper) {
                    Some((index, _)) => index,
                    None => Self::most_free(table, &writable)
                        .map(|(i, _)| i)
                        .unwrap_or(writable[0]),
                }
            }
        };
        debug!("policy {:?} selected branch index {}", self.policy, index);
        Ok(index)
    }

    fn top_down_parent(writable: &[usize], parent_top: Option<usize>) -> usize {
        let start = parent_top.unwrap_or(0);
        writable
            .iter()
            .rev()
            .find(|i| **i <= start)
            .copied()
            .unwrap_or(writable[0])
    }

    fn round_robin(&self, writable: &[usize]) -> usize {
        let n = self.next_rr.fetch_add(1, Ordering::Relaxed);
        writable[n % writable.len()]
    }

    fn most_free(table: &BranchTable, candidates: &[usize]) -> Option<(usize, u64)> {
        candidates
            .iter()
            .filter_map(|i| {
                let branch = table.get(*i)?;
                match branch.fs().free_space() {
                    Ok(free) => Some((*i, free)),
                    Err(e) => {
                        debug!("free space of branch {} unavailable: {}", branch.id(), e);
                        None
                    }
                }
            })
            // earlier index wins ties
            .fold(None, |best: Option<(usize, u64)>, (i, free)| match best {
                Some((_, bf)) if bf >= free => best,
                _ => Some((i, free)),
            })
    }

    fn most_free_cached(&self, table: &BranchTable, writable: &[usize], interval: Duration) -> usize {
        let mut cache = self.mfs.lock();
        let fresh = cache
            .measured_at
            .map(|at| at.elapsed() < interval)
            .unwrap_or(false);
        if fresh {
            if let Some(index) = cache
                .chosen
                .and_then(|id| table.index_of(id))
                .filter(|i| writable.contains(i))
            {
                return index;
            }
        }
        let index = Self::most_free(table, writable)
            .map(|(i, _)| i)
            .unwrap_or(writable[0]);
        cache.chosen = table.get(index).map(|b| b.id());
        cache.measured_at = Some(Instant::now());
        index
    }
}

//! Ordered compensations for multi-step namespace mutations
//!
//! Each forward step that changes a branch pushes the action undoing it.
//! On the first failure the stack is unwound newest first. If an undo step
//! itself fails the logical and physical namespaces may have diverged, so
//! the original error is escalated to `RevertFailed`.

use tracing::{debug, error};

use crate::error::{Error, Result};

type Compensation<'a> = Box<dyn FnOnce() -> Result<()> + 'a>;

/// Stack of pending compensations
pub struct Saga<'a> {
    op: &'static str,
    name: String,
    steps: Vec<(&'static str, Compensation<'a>)>,
}

impl<'a> Saga<'a> {
    pub fn new(op: &'static str, name: impl Into<String>) -> Self {
        Self {
            op,
            name: name.into(),
            steps: Vec::new(),
        }
    }

    /// Register the undo action of a step that just succeeded
    pub fn push<F>(&mut self, label: &'static str, undo: F)
    where
        F: FnOnce() -> Result<()> + 'a,
    {
        self.steps.push((label, Box::new(undo)));
    }

    /// Number of steps that would be undone
    pub fn depth(&self) -> usize {
        self.steps.len()
    }

    /// Keep every step
    pub fn commit(mut self) {
        self.steps.clear();
    }

    /// Undo every step, newest first, and return the error to report.
    ///
    /// All compensations run even after one fails; the first failure is
    /// the one reported.
    pub fn unwind(mut self, cause: Error) -> Error {
        let mut revert_err = None;
        while let Some((label, undo)) = self.steps.pop() {
            debug!("{} {:?}: reverting {}", self.op, self.name, label);
            if let Err(e) = undo() {
                error!(
                    "{} {:?}: failed reverting {} ({}); namespace may be inconsistent",
                    self.op, self.name, label, e
                );
                revert_err.get_or_insert(e);
            }
        }
        match revert_err {
            None => cause,
            Some(revert) => Error::RevertFailed {
                op: self.op,
                name: std::mem::take(&mut self.name),
                cause: Box::new(cause),
                revert: Box::new(revert),
            },
        }
    }
}

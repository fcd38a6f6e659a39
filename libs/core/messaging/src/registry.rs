//! Job-type to handler lookup.

use crate::config::RequeuePolicy;
use crate::error::JobProcessorError;
use crate::handler::JobHandler;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// A registered handler and the policy applied when it fails.
#[derive(Clone)]
pub struct HandlerEntry {
    pub handler: Arc<dyn JobHandler>,
    pub policy: RequeuePolicy,
}

/// Handlers keyed by job type. Safe to register into while consumers are
/// reading from it.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    entries: Arc<RwLock<HashMap<String, HandlerEntry>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // Entries are only ever inserted whole, so a poisoned lock still
    // guards a consistent map.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, HandlerEntry>> {
        self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, HandlerEntry>> {
        self.entries.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register `handler` for `job_type`. A type can only be registered once.
    pub fn register(
        &self,
        job_type: impl Into<String>,
        handler: Arc<dyn JobHandler>,
        policy: RequeuePolicy,
    ) -> Result<(), JobProcessorError> {
        let job_type = job_type.into();
        let mut entries = self.write();
        if entries.contains_key(&job_type) {
            return Err(JobProcessorError::DuplicateHandler(job_type));
        }
        entries.insert(job_type, HandlerEntry { handler, policy });
        Ok(())
    }

    pub fn get(&self, job_type: &str) -> Option<HandlerEntry> {
        self.read().get(job_type).cloned()
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.read().contains_key(job_type)
    }

    pub fn job_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.read().keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

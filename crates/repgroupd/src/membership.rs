//! Copy-on-write membership service.
//!
//! Readers take the current `GroupMembership` snapshot without blocking.
//! Writers serialize on one lock, edit a private copy, persist it and then
//! publish it with a single atomic swap, so no reader ever sees a partial
//! change.

use crate::store::{SnapshotStore, StoreError};
use arc_swap::ArcSwap;
use repgroup_shared::{FormatVersion, GroupMembership, MembershipError, NodeDescriptor};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{error, info};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Membership(#[from] MembershipError),

    #[error("failed to persist membership: {0}")]
    Store(#[from] StoreError),
}

impl ServiceError {
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::Membership(e) => e.code(),
            ServiceError::Store(_) => "store_failed",
        }
    }
}

type ActiveSet = HashMap<String, usize>;

pub struct MembershipService {
    current: ArcSwap<GroupMembership>,
    writer: Mutex<()>,
    active: Arc<Mutex<ActiveSet>>,
    store: Arc<dyn SnapshotStore>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl MembershipService {
    pub fn new(group: GroupMembership, store: Arc<dyn SnapshotStore>) -> Self {
        Self {
            current: ArcSwap::from_pointee(group),
            writer: Mutex::new(()),
            active: Arc::new(Mutex::new(HashMap::new())),
            store,
        }
    }

    /// Current snapshot. Never blocks.
    pub fn snapshot(&self) -> Arc<GroupMembership> {
        self.current.load_full()
    }

    /// Read old snapshot, apply `edit` to a copy, persist, swap.
    pub fn update<F>(&self, edit: F) -> Result<Arc<GroupMembership>, ServiceError>
    where
        F: FnOnce(&mut GroupMembership) -> Result<(), MembershipError>,
    {
        let _writer = lock(&self.writer);
        self.update_locked(edit)
    }

    fn update_locked<F>(&self, edit: F) -> Result<Arc<GroupMembership>, ServiceError>
    where
        F: FnOnce(&mut GroupMembership) -> Result<(), MembershipError>,
    {
        let mut next = GroupMembership::clone(&self.current.load());
        edit(&mut next)?;
        next.validate_for_version(next.format_version())
            .map_err(MembershipError::from)?;

        if let Err(e) = self.store.save(&next) {
            error!("✗ Failed to persist group {} change {}: {}", next.name(), next.change_version(), e);
            return Err(e.into());
        }

        let next = Arc::new(next);
        self.current.store(next.clone());
        Ok(next)
    }

    pub fn add_node(&self, node: NodeDescriptor) -> Result<Arc<GroupMembership>, ServiceError> {
        let name = node.name().to_string();
        let node_type = node.node_type();
        let group = self.update(|g| g.add_node(node).map(|_| ()))?;
        info!("✓ Added {} node {} to group {}", node_type, name, group.name());
        Ok(group)
    }

    pub fn remove_node(&self, name: &str) -> Result<Arc<GroupMembership>, ServiceError> {
        let group = self.update(|g| g.remove_node(name))?;
        info!("✓ Removed node {} from group {}", name, group.name());
        Ok(group)
    }

    /// Move an inactive member to a new address.
    pub fn update_address(&self, name: &str, host: &str, port: u16) -> Result<Arc<GroupMembership>, ServiceError> {
        let _writer = lock(&self.writer);
        // held across the swap so the member cannot become active midway
        let active = lock(&self.active);
        ensure_inactive(&active, name)?;
        let group = self.update_locked(|g| g.update_address(name, host, port))?;
        info!("✓ Node {} now at {}:{}", name, host, port);
        Ok(group)
    }

    /// Purge an inactive member's record entirely.
    pub fn delete_node(&self, name: &str) -> Result<Arc<GroupMembership>, ServiceError> {
        let _writer = lock(&self.writer);
        let active = lock(&self.active);
        ensure_inactive(&active, name)?;
        let group = self.update_locked(|g| g.delete_node(name).map(|_| ()))?;
        info!("✓ Deleted node {} from group {}", name, group.name());
        Ok(group)
    }

    /// Re-declare the group at another format version.
    pub fn set_format_version(&self, version: FormatVersion) -> Result<Arc<GroupMembership>, ServiceError> {
        let group = self.update(|g| {
            *g = g.with_format_version(version)?;
            Ok(())
        })?;
        info!("✓ Group {} now at format version {}", group.name(), version);
        Ok(group)
    }

    /// Mark a current member active until the guard is dropped.
    pub fn activate(&self, name: &str) -> Result<ActiveGuard, ServiceError> {
        // taken before the snapshot read; delete and move hold it across their swap
        let mut active = lock(&self.active);
        let snapshot = self.snapshot();
        match snapshot.get(name) {
            Some(node) if !node.is_removed() => {}
            _ => {
                return Err(MembershipError::MemberNotFound {
                    name: name.to_string(),
                    group: snapshot.name().to_string(),
                }
                .into())
            }
        }
        *active.entry(name.to_string()).or_insert(0) += 1;
        Ok(ActiveGuard {
            name: name.to_string(),
            active: self.active.clone(),
        })
    }

    pub fn is_active(&self, name: &str) -> bool {
        lock(&self.active).contains_key(name)
    }

    pub fn active_members(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.active).keys().cloned().collect();
        names.sort();
        names
    }

    pub fn ensure_inactive(&self, name: &str) -> Result<(), MembershipError> {
        ensure_inactive(&lock(&self.active), name)
    }
}

fn ensure_inactive(active: &ActiveSet, name: &str) -> Result<(), MembershipError> {
    if active.contains_key(name) {
        return Err(MembershipError::MemberActive {
            name: name.to_string(),
        });
    }
    Ok(())
}

/// Keeps a member in the active set while a connection for it is open
#[derive(Debug)]
pub struct ActiveGuard {
    name: String,
    active: Arc<Mutex<ActiveSet>>,
}

impl ActiveGuard {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let mut active = lock(&self.active);
        if let Some(count) = active.get_mut(&self.name) {
            *count -= 1;
            if *count == 0 {
                active.remove(&self.name);
            }
        }
    }
}

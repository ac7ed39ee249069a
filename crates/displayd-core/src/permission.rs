//! Caller privilege checks.

use std::collections::HashSet;

use tracing::warn;

use crate::config::PermissionConfig;
use crate::ipc::CallerInfo;

/// Answers whether a caller may use system-only operations.
pub trait PermissionService: Send + Sync {
    fn is_system_calling(&self, caller: &CallerInfo) -> bool;
}

/// Privilege by uid allow-list.
#[derive(Debug, Clone, Default)]
pub struct StaticPermissions {
    system_uids: HashSet<u32>,
}

impl StaticPermissions {
    pub fn new(config: &PermissionConfig) -> Self {
        Self {
            system_uids: config.system_uids.iter().copied().collect(),
        }
    }
}

impl PermissionService for StaticPermissions {
    fn is_system_calling(&self, caller: &CallerInfo) -> bool {
        let allowed = self.system_uids.contains(&caller.uid);
        if !allowed {
            warn!(
                "[Permission] denied for pid {} uid {}",
                caller.pid, caller.uid
            );
        }
        allowed
    }
}

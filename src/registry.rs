//! The process-wide hook registry.
//!
//! One map from target address (or vtable slot address) to the owning hook
//! record, behind a single reader-writer lock. Registration under the
//! write lock is the serialization point that enforces at most one active
//! hook per address; the dispatcher only ever takes the read lock.

use std::collections::HashMap;

use lazy_static::lazy_static;
use parking_lot::RwLock;

use crate::err::HookError;

lazy_static! {
    static ref REGISTRY: RwLock<HashMap<usize, usize>> = RwLock::new(HashMap::new());
}

pub(crate) fn register(target: usize, hook: usize) -> Result<(), HookError> {
    let mut map = REGISTRY.write();
    if map.contains_key(&target) {
        return Err(HookError::AlreadyHooked);
    }
    map.insert(target, hook);
    Ok(())
}

pub(crate) fn deregister(target: usize) {
    REGISTRY.write().remove(&target);
}

pub(crate) fn lookup(target: usize) -> Option<usize> {
    REGISTRY.read().get(&target).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_hook_per_address() {
        register(0x1000, 0xaaaa).unwrap();
        assert!(matches!(
            register(0x1000, 0xbbbb),
            Err(HookError::AlreadyHooked)
        ));
        assert_eq!(lookup(0x1000), Some(0xaaaa));

        deregister(0x1000);
        assert_eq!(lookup(0x1000), None);
        register(0x1000, 0xbbbb).unwrap();
        deregister(0x1000);
    }
}

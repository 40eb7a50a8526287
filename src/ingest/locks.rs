//! Per-device serialization.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::storage::sanitize;

type DeviceKey = (String, String);

/// One mutex per device, created on first use and dropped once no event of
/// that device is in flight.
///
/// Keys are the sanitized names the storage paths use, so spellings that land
/// in the same files share one lock. Events of one device are processed in
/// arrival order while distinct devices proceed concurrently.
#[derive(Default)]
pub struct DeviceLocks {
    locks: Mutex<HashMap<DeviceKey, Arc<Mutex<()>>>>,
}

impl DeviceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` while holding the lock of `(user, device)`.
    pub fn with_device<T>(&self, user: &str, device: &str, f: impl FnOnce() -> T) -> T {
        let key = (sanitize(user), sanitize(device));
        let lock = self.get(&key);
        let out = {
            let _guard = hold(&lock);
            f()
        };
        self.release(&key, lock);
        out
    }

    fn get(&self, key: &DeviceKey) -> Arc<Mutex<()>> {
        let mut map = hold_map(&self.locks);
        map.entry(key.clone()).or_default().clone()
    }

    /// Drop the map entry when `lock` is its only outside reference. Clones are
    /// only taken under the map lock, so the count cannot grow meanwhile.
    fn release(&self, key: &DeviceKey, lock: Arc<Mutex<()>>) {
        let mut map = hold_map(&self.locks);
        if map.get(key).is_some_and(|l| Arc::ptr_eq(l, &lock)) && Arc::strong_count(&lock) == 2 {
            map.remove(key);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        hold_map(&self.locks).len()
    }
}

fn hold_map(map: &Mutex<HashMap<DeviceKey, Arc<Mutex<()>>>>) -> MutexGuard<'_, HashMap<DeviceKey, Arc<Mutex<()>>>> {
    map.lock().unwrap_or_else(|e| e.into_inner())
}

/// Acquire a device lock, recovering from poisoning: a panic in one event
/// must not wedge the device.
fn hold(lock: &Mutex<()>) -> MutexGuard<'_, ()> {
    lock.lock().unwrap_or_else(|e| e.into_inner())
}

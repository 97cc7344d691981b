use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

static NODE: Mutex<Option<u16>> = Mutex::new(None);
static COUNTER: AtomicU64 = AtomicU64::new(0);

/// Seed the generator with a node identifier so ids from different daemons
/// in one cluster do not collide.
pub fn init(node: u16) {
    let mut guard = NODE.lock().unwrap_or_else(|p| p.into_inner());
    *guard = Some(node);
}

/// Generate a process-unique instance id: node, startup-relative millis,
/// monotonic counter.
pub fn next_id() -> String {
    let node = {
        let mut guard = NODE.lock().unwrap_or_else(|p| p.into_inner());
        *guard.get_or_insert(1)
    };
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{node:x}-{millis:x}-{seq:x}")
}

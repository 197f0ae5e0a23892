//! UDP NAT table and the keyed single-flight dial registry that coalesces
//! concurrent dials for the same flow.

use crate::outbound::PacketConn;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;
use tracing::debug;

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// A one-shot barrier standing in for Go's `sync.Cond`: exactly one dialer
/// resolves it, any number of waiters observe the outcome.
pub struct DialBarrier {
    notify: Notify,
    completed: AtomicBool,
    succeeded: AtomicBool,
}

impl DialBarrier {
    fn new() -> Arc<Self> {
        Arc::new(DialBarrier {
            notify: Notify::new(),
            completed: AtomicBool::new(false),
            succeeded: AtomicBool::new(false),
        })
    }

    /// Block until the dialer calls `complete`, then report whether the
    /// dial succeeded. Safe against the dialer completing between this
    /// call and the `.await` below: the `Notified` future is constructed
    /// before the second check, so a `notify_waiters` in between is not
    /// missed.
    pub async fn wait(&self) -> bool {
        if self.completed.load(Ordering::Acquire) {
            return self.succeeded.load(Ordering::Acquire);
        }
        let notified = self.notify.notified();
        if self.completed.load(Ordering::Acquire) {
            return self.succeeded.load(Ordering::Acquire);
        }
        notified.await;
        self.succeeded.load(Ordering::Acquire)
    }

    pub fn complete(&self, success: bool) {
        self.succeeded.store(success, Ordering::Release);
        self.completed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}

/// A live UDP flow: the outbound packet conn plus enough state for the idle
/// sweep and the reverse-path relay task to coordinate shutdown.
pub struct NatEntry {
    pub conn: Arc<dyn PacketConn>,
    last_active: AtomicU64,
    pub closed: Arc<Notify>,
}

impl NatEntry {
    fn new(conn: Arc<dyn PacketConn>) -> Arc<Self> {
        Arc::new(NatEntry {
            conn,
            last_active: AtomicU64::new(now_secs()),
            closed: Arc::new(Notify::new()),
        })
    }

    pub fn touch(&self) {
        self.last_active.store(now_secs(), Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = self.last_active.load(Ordering::Relaxed);
        Duration::from_secs(now_secs().saturating_sub(last))
    }
}

/// Per-UDP-flow map from local-address key to live outbound conn, plus the
/// single-flight dial-lock registry keyed `<key>-lock`.
pub struct NatTable {
    entries: DashMap<String, Arc<NatEntry>>,
    locks: DashMap<String, Arc<DialBarrier>>,
    idle_timeout: Duration,
}

impl NatTable {
    pub fn new(idle_timeout: Duration) -> Arc<Self> {
        Arc::new(NatTable {
            entries: DashMap::new(),
            locks: DashMap::new(),
            idle_timeout,
        })
    }

    /// Look up a flow, bumping its idle clock on hit.
    pub fn get(&self, key: &str) -> Option<Arc<NatEntry>> {
        let entry = self.entries.get(key).map(|e| e.value().clone())?;
        entry.touch();
        Some(entry)
    }

    pub fn insert(&self, key: String, conn: Arc<dyn PacketConn>) -> Arc<NatEntry> {
        let entry = NatEntry::new(conn);
        self.entries.insert(key, entry.clone());
        entry
    }

    pub fn delete(&self, key: &str) {
        if let Some((_, entry)) = self.entries.remove(key) {
            entry.closed.notify_waiters();
        }
    }

    /// Atomically return the barrier for `key`, and whether the caller is a
    /// waiter (`true`, barrier already existed) or the elected dialer
    /// (`false`, barrier was just created).
    pub fn get_or_create_lock(&self, key: &str) -> (Arc<DialBarrier>, bool) {
        let lock_key = format!("{key}-lock");
        match self.locks.entry(lock_key) {
            dashmap::mapref::entry::Entry::Occupied(e) => (e.get().clone(), true),
            dashmap::mapref::entry::Entry::Vacant(e) => {
                let barrier = DialBarrier::new();
                e.insert(barrier.clone());
                (barrier, false)
            }
        }
    }

    pub fn delete_lock(&self, key: &str) {
        self.locks.remove(&format!("{key}-lock"));
    }

    /// Spawn the idle-timeout sweep. Runs for the lifetime of the table's
    /// last `Arc` clone.
    pub fn start_sweeper(self: &Arc<Self>) {
        let this = self.clone();
        let interval = (this.idle_timeout / 2).max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let expired: Vec<String> = this
                    .entries
                    .iter()
                    .filter(|e| e.value().idle_for() >= this.idle_timeout)
                    .map(|e| e.key().clone())
                    .collect();
                for key in expired {
                    debug!("NAT entry {} idle, evicting", key);
                    this.delete(&key);
                }
            }
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Result;
    use async_trait::async_trait;
    use std::net::SocketAddr;
    use std::sync::atomic::AtomicUsize;

    struct FakeConn {
        sends: AtomicUsize,
    }

    #[async_trait]
    impl PacketConn for FakeConn {
        async fn send_to(&self, buf: &[u8], _target: SocketAddr) -> Result<usize> {
            self.sends.fetch_add(1, Ordering::Relaxed);
            Ok(buf.len())
        }
        async fn recv_from(&self, _buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
            Ok((0, "127.0.0.1:0".parse().unwrap()))
        }
    }

    #[test]
    fn test_get_or_create_lock_elects_one_dialer() {
        let nat = NatTable::new(Duration::from_secs(60));
        let (_first, loaded_first) = nat.get_or_create_lock("flow-a");
        let (_second, loaded_second) = nat.get_or_create_lock("flow-a");
        assert!(!loaded_first);
        assert!(loaded_second);
    }

    #[tokio::test]
    async fn test_dial_barrier_wakes_waiter() {
        let nat = NatTable::new(Duration::from_secs(60));
        let (dialer_barrier, _) = nat.get_or_create_lock("flow-b");
        let (waiter_barrier, loaded) = nat.get_or_create_lock("flow-b");
        assert!(loaded);

        let waiter = tokio::spawn(async move { waiter_barrier.wait().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        dialer_barrier.complete(true);

        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_insert_and_get_touches_entry() {
        let nat = NatTable::new(Duration::from_secs(60));
        let conn: Arc<dyn PacketConn> = Arc::new(FakeConn {
            sends: AtomicUsize::new(0),
        });
        nat.insert("flow-c".to_string(), conn);
        assert_eq!(nat.len(), 1);
        assert!(nat.get("flow-c").is_some());
        assert!(nat.get("missing").is_none());
    }

    #[test]
    fn test_delete_notifies_closed() {
        let nat = NatTable::new(Duration::from_secs(60));
        let conn: Arc<dyn PacketConn> = Arc::new(FakeConn {
            sends: AtomicUsize::new(0),
        });
        nat.insert("flow-d".to_string(), conn);
        nat.delete("flow-d");
        assert!(nat.is_empty());
    }
}

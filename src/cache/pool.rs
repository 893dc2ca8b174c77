//! Cache pools: one memory budget shared by several connections.
//!
//! Each member connection keeps its own [`Cache`]; the pool only moves the
//! members' size limits around. A manager thread, owned by one member,
//! periodically measures each member's eviction pressure and steps sizes
//! toward a split of the pool proportional to that pressure.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;

use crate::cache::{Cache, Stat};
use crate::common::config::{SharedCacheConfig, ALLOC_SIZE};
use crate::common::{Error, Result};
use crate::sync::CondVar;

struct PoolMember {
    conn_id: u64,
    cache: Arc<Cache>,
    /// Pressure counter total at the previous pass.
    last_total: u64,
    /// Pressure accumulated since the previous pass.
    pressure: u64,
    /// Direction of the pending size change: -1, 0 or 1.
    direction: i8,
    /// Consecutive passes that agreed on `direction`.
    streak: u32,
}

impl PoolMember {
    fn pressure_total(&self) -> u64 {
        let stats = self.cache.stats();
        stats.get(Stat::AppEvicts)
            + stats.get(Stat::AppWaits)
            + stats.get(Stat::BytesRead) / ALLOC_SIZE
    }
}

struct PoolManager {
    conn_id: u64,
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// A snapshot of one member's share.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolMemberInfo {
    pub conn_id: u64,
    pub size: u64,
    pub pressure: u64,
}

/// A named memory budget shared by connections.
///
/// # Invariants
/// - Every member's size stays within `[reserve, quota]`.
/// - The sum of member sizes never exceeds the pool size.
/// - A member's size moves by at most one chunk per pass, and only after
///   `stabilize_passes` consecutive passes agree on the direction.
pub struct CachePool {
    config: SharedCacheConfig,
    members: Mutex<Vec<PoolMember>>,
    currently_used: AtomicU64,
    manager: Mutex<Option<PoolManager>>,
    manager_cond: CondVar,
}

impl CachePool {
    pub fn new(config: &SharedCacheConfig) -> Arc<Self> {
        tracing::info!(
            pool = %config.name,
            size = config.size,
            chunk = config.chunk,
            "cache pool created"
        );
        Arc::new(Self {
            config: config.clone(),
            members: Mutex::new(Vec::new()),
            currently_used: AtomicU64::new(0),
            manager: Mutex::new(None),
            manager_cond: CondVar::new("cache pool manager"),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn size(&self) -> u64 {
        self.config.size
    }

    pub fn config(&self) -> &SharedCacheConfig {
        &self.config
    }

    /// Bytes currently assigned to members.
    pub fn currently_used(&self) -> u64 {
        self.currently_used.load(Ordering::Relaxed)
    }

    pub fn member_count(&self) -> usize {
        self.members.lock().len()
    }

    pub fn members(&self) -> Vec<PoolMemberInfo> {
        self.members
            .lock()
            .iter()
            .map(|m| PoolMemberInfo {
                conn_id: m.conn_id,
                size: m.cache.size(),
                pressure: m.pressure,
            })
            .collect()
    }

    /// Connection currently running the manager thread.
    pub fn manager_conn(&self) -> Option<u64> {
        self.manager.lock().as_ref().map(|m| m.conn_id)
    }

    /// Add a connection's cache to the pool at the reserve size.
    ///
    /// The first member to join starts the manager thread.
    ///
    /// # Errors
    /// `Error::InvalidConfig` if the pool cannot give another member its
    /// reserve.
    pub(crate) fn join(self: &Arc<Self>, conn_id: u64, cache: Arc<Cache>) -> Result<()> {
        {
            let mut members = self.members.lock();
            let reserve = self.config.reserve;
            let used = self.currently_used.load(Ordering::Relaxed);
            if used + reserve > self.config.size {
                return Err(Error::InvalidConfig(format!(
                    "cache pool {} has no room for another {} byte reserve",
                    self.config.name, reserve
                )));
            }

            cache.set_size(reserve);
            self.currently_used.fetch_add(reserve, Ordering::Relaxed);
            let mut member = PoolMember {
                conn_id,
                cache,
                last_total: 0,
                pressure: 0,
                direction: 0,
                streak: 0,
            };
            member.last_total = member.pressure_total();
            members.push(member);
            tracing::info!(
                pool = %self.config.name,
                conn = conn_id,
                members = members.len(),
                "joined cache pool"
            );
        }

        if self.manager.lock().is_none() {
            self.start_manager(conn_id)?;
        }
        Ok(())
    }

    /// Remove a connection from the pool, returning its bytes.
    ///
    /// If the leaving connection ran the manager, another member takes it
    /// over. Returns the number of members left.
    pub(crate) fn leave(self: &Arc<Self>, conn_id: u64) -> usize {
        let (remaining, successor) = {
            let mut members = self.members.lock();
            if let Some(pos) = members.iter().position(|m| m.conn_id == conn_id) {
                let member = members.remove(pos);
                sub_used(&self.currently_used, member.cache.size());
            }
            (members.len(), members.first().map(|m| m.conn_id))
        };

        let owned = self.manager_conn() == Some(conn_id);
        if owned {
            self.stop_manager();
            if let Some(next) = successor {
                if let Err(e) = self.start_manager(next) {
                    tracing::warn!(
                        pool = %self.config.name,
                        error = %e,
                        "cache pool manager could not be restarted"
                    );
                }
            }
        }
        tracing::info!(
            pool = %self.config.name,
            conn = conn_id,
            remaining,
            "left cache pool"
        );
        remaining
    }

    fn start_manager(self: &Arc<Self>, conn_id: u64) -> Result<()> {
        let mut manager = self.manager.lock();
        if manager.is_some() {
            return Ok(());
        }
        let running = Arc::new(AtomicBool::new(true));
        let pool = Arc::clone(self);
        let flag = Arc::clone(&running);
        let handle = std::thread::Builder::new()
            .name(format!("archengine-pool-{}", self.config.name))
            .spawn(move || {
                while flag.load(Ordering::Acquire) {
                    pool.manager_cond.wait(pool.config.interval);
                    if !flag.load(Ordering::Acquire) {
                        break;
                    }
                    pool.balance();
                }
            })?;
        *manager = Some(PoolManager {
            conn_id,
            running,
            handle,
        });
        tracing::debug!(pool = %self.config.name, conn = conn_id, "cache pool manager started");
        Ok(())
    }

    fn stop_manager(&self) {
        let Some(manager) = self.manager.lock().take() else {
            return;
        };
        manager.running.store(false, Ordering::Release);
        self.manager_cond.signal();
        if manager.handle.join().is_err() {
            tracing::error!(pool = %self.config.name, "cache pool manager panicked");
        }
    }

    /// One rebalancing pass.
    ///
    /// Measures pressure since the previous pass, computes targets
    /// proportional to it, and steps each member toward its target. Shrinks
    /// are applied before grows so the pool total is never exceeded.
    pub fn balance(&self) {
        let cfg = &self.config;
        let mut members = self.members.lock();
        if members.is_empty() {
            return;
        }

        for m in members.iter_mut() {
            let total = m.pressure_total();
            m.pressure = total.saturating_sub(m.last_total);
            m.last_total = total;
        }
        let pressures: Vec<u64> = members.iter().map(|m| m.pressure).collect();
        if pressures.iter().all(|&p| p == 0) {
            for m in members.iter_mut() {
                m.direction = 0;
                m.streak = 0;
            }
            return;
        }
        let targets = fair_shares(cfg.size, &pressures, cfg.reserve, cfg.quota);

        let mut steps = Vec::with_capacity(members.len());
        for (m, &target) in members.iter_mut().zip(&targets) {
            let current = m.cache.size();
            let direction: i8 = match target.cmp(&current) {
                std::cmp::Ordering::Greater => 1,
                std::cmp::Ordering::Less => -1,
                std::cmp::Ordering::Equal => 0,
            };
            if direction == 0 {
                m.direction = 0;
                m.streak = 0;
                steps.push(0i64);
                continue;
            }
            if direction == m.direction {
                m.streak += 1;
            } else {
                m.direction = direction;
                m.streak = 1;
            }
            if m.streak < cfg.stabilize_passes {
                steps.push(0);
                continue;
            }
            let step = current.abs_diff(target).min(cfg.chunk) as i64;
            steps.push(if direction > 0 { step } else { -step });
        }

        let mut used: u64 = members.iter().map(|m| m.cache.size()).sum();
        for (m, &step) in members.iter().zip(&steps) {
            if step < 0 {
                let size = m.cache.size().saturating_sub(step.unsigned_abs());
                used -= m.cache.size() - size;
                m.cache.set_size(size);
            }
        }
        for (m, &step) in members.iter().zip(&steps) {
            if step > 0 {
                let grow = (step as u64).min(cfg.size.saturating_sub(used));
                if grow > 0 {
                    used += grow;
                    m.cache.set_size(m.cache.size() + grow);
                }
            }
        }
        self.currently_used.store(used, Ordering::Relaxed);

        tracing::trace!(
            pool = %cfg.name,
            used,
            sizes = ?members.iter().map(|m| m.cache.size()).collect::<Vec<_>>(),
            pressures = ?pressures,
            "cache pool balanced"
        );
    }
}

impl Drop for CachePool {
    fn drop(&mut self) {
        self.stop_manager();
    }
}

impl std::fmt::Debug for CachePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachePool")
            .field("name", &self.config.name)
            .field("size", &self.config.size)
            .field("currently_used", &self.currently_used())
            .finish()
    }
}

fn sub_used(counter: &AtomicU64, n: u64) {
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
        Some(v.saturating_sub(n))
    });
}

/// Split `size` in proportion to `pressures`, clamping every share to
/// `[reserve, quota]` and redistributing what clamping frees or takes.
pub(crate) fn fair_shares(size: u64, pressures: &[u64], reserve: u64, quota: u64) -> Vec<u64> {
    let n = pressures.len();
    let mut shares = vec![0u64; n];
    let mut fixed = vec![false; n];

    loop {
        let open: Vec<usize> = (0..n).filter(|&i| !fixed[i]).collect();
        if open.is_empty() {
            break;
        }
        let assigned: u64 = (0..n).filter(|&i| fixed[i]).map(|i| shares[i]).sum();
        let remaining = u128::from(size.saturating_sub(assigned));
        let total: u128 = open.iter().map(|&i| u128::from(pressures[i])).sum();
        let share = |i: usize| -> u64 {
            let s = if total == 0 {
                remaining / open.len() as u128
            } else {
                remaining * u128::from(pressures[i]) / total
            };
            u64::try_from(s).unwrap_or(u64::MAX)
        };

        // Pin the single worst violation each round so freed bytes flow to
        // the members still open.
        let worst = open
            .iter()
            .map(|&i| (i, share(i)))
            .filter(|&(_, s)| s < reserve || s > quota)
            .max_by_key(|&(_, s)| if s < reserve { reserve - s } else { s - quota });
        match worst {
            Some((i, s)) => {
                shares[i] = s.clamp(reserve, quota);
                fixed[i] = true;
            }
            None => {
                for &i in &open {
                    shares[i] = share(i);
                }
                break;
            }
        }
    }
    shares
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::config::{CacheConfig, EvictionConfig, MEGABYTE};
    use std::time::Duration;

    fn pool_config(size: u64) -> SharedCacheConfig {
        SharedCacheConfig {
            chunk: MEGABYTE,
            reserve: 2 * MEGABYTE,
            quota: size,
            stabilize_passes: 2,
            interval: Duration::from_secs(3600),
            ..SharedCacheConfig::new("test", size)
        }
    }

    fn member_cache() -> Arc<Cache> {
        Arc::new(Cache::new(&CacheConfig::default(), &EvictionConfig::default()))
    }

    #[test]
    fn test_fair_shares_proportional() {
        let shares = fair_shares(40 * MEGABYTE, &[300, 100], 2 * MEGABYTE, 40 * MEGABYTE);
        assert_eq!(shares, vec![30 * MEGABYTE, 10 * MEGABYTE]);
    }

    #[test]
    fn test_fair_shares_respects_reserve_and_quota() {
        let shares = fair_shares(40 * MEGABYTE, &[1000, 1], 4 * MEGABYTE, 30 * MEGABYTE);
        // The heavy member is capped at its quota and the rest flows to the
        // light one.
        assert_eq!(shares, vec![30 * MEGABYTE, 10 * MEGABYTE]);

        let shares = fair_shares(40 * MEGABYTE, &[1000, 1, 1000], 4 * MEGABYTE, 30 * MEGABYTE);
        assert_eq!(shares[1], 4 * MEGABYTE);
        assert_eq!(shares[0], 18 * MEGABYTE);
        assert_eq!(shares[2], 18 * MEGABYTE);
    }

    #[test]
    fn test_join_at_reserve_and_leave() {
        let pool = CachePool::new(&pool_config(10 * MEGABYTE));
        let a = member_cache();
        pool.join(1, Arc::clone(&a)).unwrap();
        assert_eq!(a.size(), 2 * MEGABYTE);
        assert_eq!(pool.currently_used(), 2 * MEGABYTE);
        assert_eq!(pool.manager_conn(), Some(1));

        pool.join(2, member_cache()).unwrap();
        assert_eq!(pool.currently_used(), 4 * MEGABYTE);

        assert_eq!(pool.leave(1), 1);
        assert_eq!(pool.manager_conn(), Some(2));
        assert_eq!(pool.currently_used(), 2 * MEGABYTE);
        assert_eq!(pool.leave(2), 0);
        assert_eq!(pool.manager_conn(), None);
    }

    #[test]
    fn test_join_rejected_without_room_for_reserve() {
        let pool = CachePool::new(&pool_config(5 * MEGABYTE));
        pool.join(1, member_cache()).unwrap();
        pool.join(2, member_cache()).unwrap();
        assert!(matches!(
            pool.join(3, member_cache()),
            Err(Error::InvalidConfig(_))
        ));
        pool.leave(1);
        pool.leave(2);
    }

    #[test]
    fn test_sizes_wait_for_stable_direction() {
        let pool = CachePool::new(&pool_config(10 * MEGABYTE));
        let a = member_cache();
        let b = member_cache();
        pool.join(1, Arc::clone(&a)).unwrap();
        pool.join(2, Arc::clone(&b)).unwrap();

        a.stats().add(Stat::AppWaits, 10);
        pool.balance();
        // One pass is not enough to move.
        assert_eq!(a.size(), 2 * MEGABYTE);

        a.stats().add(Stat::AppWaits, 10);
        pool.balance();
        assert_eq!(a.size(), 3 * MEGABYTE);
        assert_eq!(b.size(), 2 * MEGABYTE);
        assert!(pool.currently_used() <= pool.size());

        pool.leave(1);
        pool.leave(2);
    }

    #[test]
    fn test_idle_pool_does_not_move() {
        let pool = CachePool::new(&pool_config(10 * MEGABYTE));
        let a = member_cache();
        pool.join(1, Arc::clone(&a)).unwrap();
        for _ in 0..5 {
            pool.balance();
        }
        assert_eq!(a.size(), 2 * MEGABYTE);
        pool.leave(1);
    }
}

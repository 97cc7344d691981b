//! Per-plugin pools of running subprocess instances. Instances are
//! created lazily when a call arrives and capacity allows; checkout
//! blocks up to a deadline, unhealthy instances are evicted on check-in,
//! and a sweeper culls instances idle past their TTL.

use crate::error::{ControlError, Result};
use chrono::{DateTime, Utc};
use oxtel_common::types::{AvailablePluginInfo, InstanceHealth, PluginId};
use oxtel_plugin::runner::{PluginRunner, RunnerConfig};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum running instances per loaded plugin.
    pub max_running: usize,
    /// How long checkout waits for capacity before failing.
    pub checkout_timeout: Duration,
    /// Idle instances older than this are culled by the sweeper.
    pub idle_ttl: Duration,
    pub runner: RunnerConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_running: 3,
            checkout_timeout: Duration::from_secs(10),
            idle_ttl: Duration::from_secs(60),
            runner: RunnerConfig::default(),
        }
    }
}

pub struct Instance {
    pub instance_id: String,
    pub runner: Arc<PluginRunner>,
    hits: AtomicU64,
    last_hit: Mutex<Option<DateTime<Utc>>>,
    busy: AtomicBool,
    idle_since: Mutex<Instant>,
}

impl Instance {
    fn new(runner: Arc<PluginRunner>) -> Arc<Self> {
        Arc::new(Self {
            instance_id: oxtel_common::id::next_id(),
            runner,
            hits: AtomicU64::new(0),
            last_hit: Mutex::new(None),
            busy: AtomicBool::new(false),
            idle_since: Mutex::new(Instant::now()),
        })
    }

    pub fn info(&self, id: &PluginId) -> AvailablePluginInfo {
        let health = if !self.runner.is_healthy() {
            InstanceHealth::Unhealthy
        } else if self.busy.load(Ordering::SeqCst) {
            InstanceHealth::Busy
        } else {
            InstanceHealth::Ready
        };
        AvailablePluginInfo {
            id: id.clone(),
            instance_id: self.instance_id.clone(),
            health,
            hit_count: self.hits.load(Ordering::SeqCst),
            last_hit: *self.last_hit.lock().unwrap_or_else(|p| p.into_inner()),
        }
    }
}

/// A checked-out instance. Holding it holds a capacity permit; hand it
/// back with `PluginPool::checkin`.
pub struct Checkout {
    pub instance: Arc<Instance>,
    _permit: OwnedSemaphorePermit,
}

impl Checkout {
    pub fn runner(&self) -> &Arc<PluginRunner> {
        &self.instance.runner
    }
}

pub struct PluginPool {
    id: PluginId,
    path: PathBuf,
    cfg: PoolConfig,
    capacity: Arc<Semaphore>,
    idle: Mutex<Vec<Arc<Instance>>>,
    members: Mutex<Vec<Arc<Instance>>>,
    closed: AtomicBool,
}

impl PluginPool {
    /// A pool seeded with the instance that performed the load handshake,
    /// so the first call does not pay a second spawn.
    pub fn new(id: PluginId, path: PathBuf, cfg: PoolConfig, seed: Arc<PluginRunner>) -> Self {
        let instance = Instance::new(seed);
        Self {
            id,
            path,
            capacity: Arc::new(Semaphore::new(cfg.max_running)),
            idle: Mutex::new(vec![instance.clone()]),
            members: Mutex::new(vec![instance]),
            cfg,
            closed: AtomicBool::new(false),
        }
    }

    pub async fn checkout(&self) -> Result<Checkout> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ControlError::ShuttingDown);
        }
        let permit = match timeout(
            self.cfg.checkout_timeout,
            self.capacity.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(ControlError::ShuttingDown),
            Err(_) => {
                return Err(ControlError::PoolExhausted {
                    id: self.id.clone(),
                })
            }
        };

        // Reuse a ready instance, discarding any that died while idle.
        loop {
            let candidate = {
                let mut idle = self.idle.lock().unwrap_or_else(|p| p.into_inner());
                idle.pop()
            };
            match candidate {
                Some(instance) if instance.runner.is_healthy() => {
                    instance.busy.store(true, Ordering::SeqCst);
                    instance.hits.fetch_add(1, Ordering::SeqCst);
                    *instance.last_hit.lock().unwrap_or_else(|p| p.into_inner()) =
                        Some(Utc::now());
                    return Ok(Checkout {
                        instance,
                        _permit: permit,
                    });
                }
                Some(instance) => {
                    self.evict(&instance).await;
                }
                None => break,
            }
        }

        // Capacity allows a fresh instance.
        let runner = PluginRunner::launch(&self.path, self.cfg.runner.clone()).await?;
        let instance = Instance::new(runner);
        instance.busy.store(true, Ordering::SeqCst);
        instance.hits.fetch_add(1, Ordering::SeqCst);
        *instance.last_hit.lock().unwrap_or_else(|p| p.into_inner()) = Some(Utc::now());
        {
            let mut members = self.members.lock().unwrap_or_else(|p| p.into_inner());
            members.push(instance.clone());
        }
        tracing::debug!(plugin = %self.id, instance = %instance.instance_id, "pool grew");
        Ok(Checkout {
            instance,
            _permit: permit,
        })
    }

    /// Return an instance. Unhealthy instances are evicted instead.
    pub async fn checkin(&self, checkout: Checkout) {
        let Checkout { instance, _permit } = checkout;
        instance.busy.store(false, Ordering::SeqCst);
        if self.closed.load(Ordering::SeqCst) || !instance.runner.is_healthy() {
            drop(_permit);
            self.evict(&instance).await;
            return;
        }
        *instance
            .idle_since
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = Instant::now();
        // The instance must be visible for reuse before the capacity
        // permit frees, or a racing checkout could spawn a fourth
        // instance past the cap.
        let mut idle = self.idle.lock().unwrap_or_else(|p| p.into_inner());
        idle.push(instance);
        drop(idle);
        drop(_permit);
    }

    async fn evict(&self, instance: &Arc<Instance>) {
        {
            let mut members = self.members.lock().unwrap_or_else(|p| p.into_inner());
            members.retain(|m| !Arc::ptr_eq(m, instance));
        }
        tracing::debug!(plugin = %self.id, instance = %instance.instance_id, "evicting instance");
        instance.runner.stop().await;
    }

    /// Cull idle instances past the TTL. The pool may drop to zero; the
    /// next checkout re-creates capacity on demand.
    pub async fn sweep(&self) -> usize {
        let expired: Vec<Arc<Instance>> = {
            let mut idle = self.idle.lock().unwrap_or_else(|p| p.into_inner());
            let (stale, fresh): (Vec<_>, Vec<_>) = idle.drain(..).partition(|i| {
                i.idle_since
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .elapsed()
                    > self.cfg.idle_ttl
            });
            *idle = fresh;
            stale
        };
        let culled = expired.len();
        for instance in expired {
            self.evict(&instance).await;
        }
        culled
    }

    pub fn running(&self) -> usize {
        let members = self.members.lock().unwrap_or_else(|p| p.into_inner());
        members.len()
    }

    pub fn instances(&self) -> Vec<AvailablePluginInfo> {
        let members = self.members.lock().unwrap_or_else(|p| p.into_inner());
        members.iter().map(|m| m.info(&self.id)).collect()
    }

    /// Stop every instance. Further checkouts fail. In-flight calls are
    /// given a bounded window to finish; their instances are then evicted
    /// on check-in or killed.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.capacity.close();

        let drain_deadline = Instant::now() + self.cfg.runner.meta_call_timeout;
        while Instant::now() < drain_deadline {
            let busy = {
                let members = self.members.lock().unwrap_or_else(|p| p.into_inner());
                members.iter().any(|m| m.busy.load(Ordering::SeqCst))
            };
            if !busy {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        let members: Vec<Arc<Instance>> = {
            let mut idle = self.idle.lock().unwrap_or_else(|p| p.into_inner());
            idle.clear();
            let mut members = self.members.lock().unwrap_or_else(|p| p.into_inner());
            members.drain(..).collect()
        };
        for instance in members {
            instance.runner.stop().await;
        }
    }
}

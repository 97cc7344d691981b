//! The tribe runtime: UDP gossip loops, the failure detector, and the
//! single apply loop that turns replicated deltas into catalog and
//! scheduler side effects.

use crate::agreement::{Agreement, AgreementState, Change, Delta, SideEffect};
use crate::error::{Result, TribeError};
use crate::member::{Member, MemberStatus, MemberTable};
use crate::msg::TribeMessage;
use oxtel_common::event::{Event, EventHandler};
use oxtel_common::manage::TribeDelegate;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const MAX_DATAGRAM: usize = 512 * 1024;
const MAX_EFFECT_RETRIES: u32 = 10;

#[derive(Debug, Clone)]
pub struct TribeConfig {
    pub node_name: String,
    pub bind_addr: SocketAddr,
    /// An existing cluster member to join through.
    pub seed: Option<SocketAddr>,
    /// Advertised control-plane address, for peers fetching artifacts.
    pub rest_addr: Option<String>,
    pub gossip_interval: Duration,
    pub probe_timeout: Duration,
    pub suspect_timeout: Duration,
    /// How long a failed member's contributions are retained before
    /// garbage collection.
    pub failed_grace: Duration,
    pub anti_entropy_interval: Duration,
}

impl Default for TribeConfig {
    fn default() -> Self {
        Self {
            node_name: "oxtel-node".to_string(),
            bind_addr: "127.0.0.1:6000".parse().expect("static addr"),
            seed: None,
            rest_addr: None,
            gossip_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_millis(500),
            suspect_timeout: Duration::from_secs(5),
            failed_grace: Duration::from_secs(24 * 60 * 60),
            anti_entropy_interval: Duration::from_secs(5),
        }
    }
}

struct Shared {
    members: MemberTable,
    agreements: AgreementState,
    // probe seq -> (member, sent-at)
    probes: HashMap<u64, (String, Instant)>,
    // failed member -> when the grace window started
    failed_at: HashMap<String, Instant>,
    // keys of side effects currently being applied, so their local
    // event-bus echoes are not re-broadcast
    suppression: HashSet<String>,
}

pub struct Tribe {
    cfg: TribeConfig,
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    clock: AtomicU64,
    probe_seq: AtomicU64,
    shared: Mutex<Shared>,
    out_tx: mpsc::UnboundedSender<(SocketAddr, TribeMessage)>,
    out_rx: Mutex<Option<mpsc::UnboundedReceiver<(SocketAddr, TribeMessage)>>>,
    effect_tx: mpsc::UnboundedSender<SideEffect>,
    effect_rx: Mutex<Option<mpsc::UnboundedReceiver<SideEffect>>>,
    retry: Mutex<Vec<(SideEffect, u32)>>,
    delegate: OnceLock<Arc<dyn TribeDelegate>>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl Tribe {
    pub async fn new(cfg: TribeConfig) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(cfg.bind_addr).await?;
        let local_addr = socket.local_addr()?;
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (effect_tx, effect_rx) = mpsc::unbounded_channel();

        let mut members = MemberTable::new();
        members.upsert(Member::alive(
            &cfg.node_name,
            local_addr,
            cfg.rest_addr.clone(),
        ));

        Ok(Arc::new(Self {
            cfg,
            socket: Arc::new(socket),
            local_addr,
            clock: AtomicU64::new(0),
            probe_seq: AtomicU64::new(0),
            shared: Mutex::new(Shared {
                members,
                agreements: AgreementState::new(),
                probes: HashMap::new(),
                failed_at: HashMap::new(),
                suppression: HashSet::new(),
            }),
            out_tx,
            out_rx: Mutex::new(Some(out_rx)),
            effect_tx,
            effect_rx: Mutex::new(Some(effect_rx)),
            retry: Mutex::new(Vec::new()),
            delegate: OnceLock::new(),
            loops: Mutex::new(Vec::new()),
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn node_name(&self) -> &str {
        &self.cfg.node_name
    }

    /// Wire the catalog/scheduler side-effect executor. Must be called
    /// before `start`.
    pub fn set_delegate(&self, delegate: Arc<dyn TribeDelegate>) {
        let _ = self.delegate.set(delegate);
    }

    /// Spawn the receive, send, tick, and apply loops, and contact the
    /// seed when one is configured.
    pub fn start(self: &Arc<Self>) {
        let mut handles = Vec::new();

        let out_rx = self
            .out_rx
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(mut out_rx) = out_rx {
            let socket = self.socket.clone();
            handles.push(tokio::spawn(async move {
                while let Some((addr, msg)) = out_rx.recv().await {
                    match serde_json::to_vec(&msg) {
                        Ok(bytes) => {
                            if let Err(e) = socket.send_to(&bytes, addr).await {
                                tracing::debug!(peer = %addr, error = %e, "gossip send failed");
                            }
                        }
                        Err(e) => tracing::error!(error = %e, "unencodable gossip message"),
                    }
                }
            }));
        }

        let tribe = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                match tribe.socket.recv_from(&mut buf).await {
                    Ok((len, from)) => match serde_json::from_slice(&buf[..len]) {
                        Ok(msg) => tribe.handle_message(from, msg),
                        Err(e) => {
                            tracing::debug!(peer = %from, error = %e, "undecodable datagram")
                        }
                    },
                    Err(e) => {
                        tracing::warn!(error = %e, "gossip socket receive failed");
                        break;
                    }
                }
            }
        }));

        let tribe = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(tribe.cfg.gossip_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut since_anti_entropy = Duration::ZERO;
            loop {
                tick.tick().await;
                since_anti_entropy += tribe.cfg.gossip_interval;
                let anti_entropy = since_anti_entropy >= tribe.cfg.anti_entropy_interval;
                if anti_entropy {
                    since_anti_entropy = Duration::ZERO;
                }
                tribe.tick(anti_entropy);
            }
        }));

        let effect_rx = self
            .effect_rx
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(mut effect_rx) = effect_rx {
            let tribe = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                while let Some(effect) = effect_rx.recv().await {
                    tribe.run_effect(effect, 0).await;
                }
            }));
        }

        if let Some(seed) = self.cfg.seed {
            let member = Member::alive(
                &self.cfg.node_name,
                self.local_addr,
                self.cfg.rest_addr.clone(),
            );
            self.send(seed, TribeMessage::Join { member });
            tracing::info!(seed = %seed, "joining tribe through seed");
        }

        let mut loops = self.loops.lock().unwrap_or_else(|p| p.into_inner());
        *loops = handles;
        tracing::info!(
            node = %self.cfg.node_name,
            addr = %self.local_addr,
            "tribe started"
        );
    }

    fn send(&self, addr: SocketAddr, msg: TribeMessage) {
        let _ = self.out_tx.send((addr, msg));
    }

    fn tick_clock(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn observe_clock(&self, seen: u64) {
        self.clock.fetch_max(seen, Ordering::SeqCst);
    }

    fn handle_message(self: &Arc<Self>, from: SocketAddr, msg: TribeMessage) {
        match msg {
            TribeMessage::Join { member } => {
                tracing::info!(member = %member.name, addr = %member.addr, "member joined");
                let (members, agreements) = {
                    let mut shared = self.shared.lock().unwrap_or_else(|p| p.into_inner());
                    shared.members.upsert(member.clone());
                    (shared.members.list(), shared.agreements.snapshot())
                };
                self.send(
                    member.addr,
                    TribeMessage::JoinAck {
                        members,
                        agreements,
                    },
                );
            }
            TribeMessage::JoinAck {
                members,
                agreements,
            } => {
                let effects = {
                    let mut shared = self.shared.lock().unwrap_or_else(|p| p.into_inner());
                    shared.members.merge(members);
                    shared.agreements.merge(agreements, &self.cfg.node_name)
                };
                self.enqueue_effects(effects);
            }
            TribeMessage::Heartbeat { from, members } => {
                let mut shared = self.shared.lock().unwrap_or_else(|p| p.into_inner());
                shared.members.merge(members);
                shared.members.set_status(&from, MemberStatus::Alive);
                shared.failed_at.remove(&from);
            }
            TribeMessage::Ping { from: _, seq } => {
                self.send(from, TribeMessage::Ack { seq });
            }
            TribeMessage::Ack { seq } => {
                let mut shared = self.shared.lock().unwrap_or_else(|p| p.into_inner());
                if let Some((name, _)) = shared.probes.remove(&seq) {
                    shared.members.set_status(&name, MemberStatus::Alive);
                    shared.failed_at.remove(&name);
                }
            }
            TribeMessage::Event { delta } => {
                self.observe_clock(delta.clock);
                let (effect, joined_self) = {
                    let mut shared = self.shared.lock().unwrap_or_else(|p| p.into_inner());
                    let effect = shared.agreements.apply(&delta, &self.cfg.node_name);
                    let joined_self = matches!(
                        &delta.change,
                        Change::MemberJoined { name } if *name == self.cfg.node_name
                    );
                    (effect, joined_self)
                };
                if let Some(effect) = effect {
                    self.enqueue_effects(vec![effect]);
                }
                if joined_self {
                    self.catch_up(&delta.agreement);
                }
            }
            TribeMessage::AgreementAdded { name } => {
                let mut shared = self.shared.lock().unwrap_or_else(|p| p.into_inner());
                shared.agreements.insert(Agreement::new(&name));
            }
            TribeMessage::AgreementRemoved { name } => {
                let mut shared = self.shared.lock().unwrap_or_else(|p| p.into_inner());
                shared.agreements.remove(&name);
            }
            TribeMessage::DigestRequest { from: _ } => {
                let agreements = {
                    let shared = self.shared.lock().unwrap_or_else(|p| p.into_inner());
                    shared.agreements.snapshot()
                };
                self.send(from, TribeMessage::DigestResponse { agreements });
            }
            TribeMessage::DigestResponse { agreements } => {
                let effects = {
                    let mut shared = self.shared.lock().unwrap_or_else(|p| p.into_inner());
                    shared.agreements.merge(agreements, &self.cfg.node_name)
                };
                self.enqueue_effects(effects);
            }
        }
    }

    /// One gossip round: heartbeat, probe, status transitions, grace
    /// expiry, and optionally an anti-entropy pull plus effect retries.
    fn tick(self: &Arc<Self>, anti_entropy: bool) {
        use rand::seq::SliceRandom;

        let now = Instant::now();
        let (peers, members, gc_nodes) = {
            let mut shared = self.shared.lock().unwrap_or_else(|p| p.into_inner());

            // probe timeouts -> suspect
            let expired: Vec<(u64, String)> = shared
                .probes
                .iter()
                .filter(|(_, (_, sent))| now.duration_since(*sent) > self.cfg.probe_timeout)
                .map(|(seq, (name, _))| (*seq, name.clone()))
                .collect();
            for (seq, name) in expired {
                shared.probes.remove(&seq);
                if shared.members.set_status(&name, MemberStatus::Suspect) {
                    tracing::warn!(member = %name, "member suspected");
                }
            }

            // suspects past the timeout -> failed
            let suspects: Vec<String> = shared
                .members
                .list()
                .into_iter()
                .filter(|m| {
                    m.status == MemberStatus::Suspect
                        && (chrono::Utc::now() - m.status_since)
                            .to_std()
                            .map(|d| d > self.cfg.suspect_timeout)
                            .unwrap_or(false)
                })
                .map(|m| m.name)
                .collect();
            for name in suspects {
                if shared.members.set_status(&name, MemberStatus::Failed) {
                    tracing::warn!(member = %name, "member failed");
                    shared.failed_at.insert(name, now);
                }
            }

            // failed past the grace window -> garbage collect
            let gc_nodes: Vec<String> = shared
                .failed_at
                .iter()
                .filter(|(_, failed)| now.duration_since(**failed) > self.cfg.failed_grace)
                .map(|(name, _)| name.clone())
                .collect();

            (
                shared.members.alive_peers(&self.cfg.node_name),
                shared.members.list(),
                gc_nodes,
            )
        };

        for node in gc_nodes {
            let clock = self.tick_clock();
            let effects = {
                let mut shared = self.shared.lock().unwrap_or_else(|p| p.into_inner());
                shared.failed_at.remove(&node);
                shared.members.remove(&node);
                shared
                    .agreements
                    .gc_failed_member(&node, clock, &self.cfg.node_name)
            };
            tracing::info!(member = %node, "garbage collected failed member");
            self.enqueue_effects(effects);
        }

        for peer in &peers {
            self.send(
                peer.addr,
                TribeMessage::Heartbeat {
                    from: self.cfg.node_name.clone(),
                    members: members.clone(),
                },
            );
        }

        if let Some(peer) = peers.choose(&mut rand::thread_rng()) {
            let seq = self.probe_seq.fetch_add(1, Ordering::Relaxed);
            {
                let mut shared = self.shared.lock().unwrap_or_else(|p| p.into_inner());
                shared.probes.insert(seq, (peer.name.clone(), now));
            }
            self.send(
                peer.addr,
                TribeMessage::Ping {
                    from: self.cfg.node_name.clone(),
                    seq,
                },
            );
        }

        if anti_entropy {
            if let Some(peer) = peers.choose(&mut rand::thread_rng()) {
                self.send(
                    peer.addr,
                    TribeMessage::DigestRequest {
                        from: self.cfg.node_name.clone(),
                    },
                );
            }
            let retries: Vec<(SideEffect, u32)> = {
                let mut retry = self.retry.lock().unwrap_or_else(|p| p.into_inner());
                retry.drain(..).collect()
            };
            for (effect, attempts) in retries {
                let tribe = Arc::clone(self);
                tokio::spawn(async move {
                    tribe.run_effect(effect, attempts).await;
                });
            }
        }
    }

    fn enqueue_effects(&self, effects: Vec<SideEffect>) {
        for effect in effects {
            let _ = self.effect_tx.send(effect);
        }
    }

    async fn run_effect(self: &Arc<Self>, effect: SideEffect, attempts: u32) {
        let Some(delegate) = self.delegate.get().cloned() else {
            tracing::error!("tribe has no delegate wired; dropping side effect");
            return;
        };
        let key = effect.suppression_key();
        {
            let mut shared = self.shared.lock().unwrap_or_else(|p| p.into_inner());
            shared.suppression.insert(key.clone());
        }

        let result = match &effect {
            SideEffect::LoadPlugin { id, origin_rest } => {
                delegate.load_plugin(id, origin_rest.as_deref()).await
            }
            SideEffect::UnloadPlugin { id } => delegate.unload_plugin(id).await,
            SideEffect::CreateTask {
                id,
                manifest,
                started,
            } => {
                let mut manifest = manifest.clone();
                manifest.no_start = !started;
                delegate.create_task(*id, &manifest).await
            }
            SideEffect::StartTask { id } => delegate.start_task(*id).await,
            SideEffect::StopTask { id } => delegate.stop_task(*id).await,
            SideEffect::RemoveTask { id } => delegate.remove_task(*id).await,
        };

        {
            let mut shared = self.shared.lock().unwrap_or_else(|p| p.into_inner());
            shared.suppression.remove(&key);
        }

        if let Err(e) = result {
            if attempts + 1 >= MAX_EFFECT_RETRIES {
                tracing::error!(error = %e, ?effect, "replicated side effect abandoned");
            } else {
                tracing::warn!(
                    error = %e,
                    attempt = attempts + 1,
                    ?effect,
                    "replicated side effect failed, will retry"
                );
                let mut retry = self.retry.lock().unwrap_or_else(|p| p.into_inner());
                retry.push((effect, attempts + 1));
            }
        }
    }

    /// Re-run the side effects for everything already recorded in an
    /// agreement this node just joined.
    fn catch_up(&self, agreement: &str) {
        let effects: Vec<SideEffect> = {
            let shared = self.shared.lock().unwrap_or_else(|p| p.into_inner());
            let Some(agreement) = shared.agreements.get(agreement) else {
                return;
            };
            let mut effects = Vec::new();
            for entry in agreement.plugin_entries() {
                effects.push(SideEffect::LoadPlugin {
                    id: entry.id,
                    origin_rest: entry.origin_rest,
                });
            }
            for (id, entry) in agreement.task_entries() {
                effects.push(SideEffect::CreateTask {
                    id,
                    manifest: entry.manifest,
                    started: entry.started,
                });
            }
            effects
        };
        self.enqueue_effects(effects);
    }

    fn broadcast_delta(&self, delta: Delta) {
        let peers = {
            let shared = self.shared.lock().unwrap_or_else(|p| p.into_inner());
            shared.members.alive_peers(&self.cfg.node_name)
        };
        for peer in peers {
            self.send(peer.addr, TribeMessage::Event { delta: delta.clone() });
        }
    }

    // ---- control-plane surface ----

    pub fn members(&self) -> Vec<Member> {
        let shared = self.shared.lock().unwrap_or_else(|p| p.into_inner());
        shared.members.list()
    }

    pub fn agreements(&self) -> BTreeMap<String, Agreement> {
        let shared = self.shared.lock().unwrap_or_else(|p| p.into_inner());
        shared.agreements.snapshot()
    }

    pub fn agreement(&self, name: &str) -> Result<Agreement> {
        let shared = self.shared.lock().unwrap_or_else(|p| p.into_inner());
        shared
            .agreements
            .get(name)
            .cloned()
            .ok_or_else(|| TribeError::AgreementNotFound(name.to_string()))
    }

    pub fn add_agreement(&self, name: &str) -> Result<()> {
        let inserted = {
            let mut shared = self.shared.lock().unwrap_or_else(|p| p.into_inner());
            shared.agreements.insert(Agreement::new(name))
        };
        if !inserted {
            return Err(TribeError::AgreementExists(name.to_string()));
        }
        let peers = {
            let shared = self.shared.lock().unwrap_or_else(|p| p.into_inner());
            shared.members.alive_peers(&self.cfg.node_name)
        };
        for peer in peers {
            self.send(
                peer.addr,
                TribeMessage::AgreementAdded {
                    name: name.to_string(),
                },
            );
        }
        Ok(())
    }

    pub fn remove_agreement(&self, name: &str) -> Result<()> {
        let removed = {
            let mut shared = self.shared.lock().unwrap_or_else(|p| p.into_inner());
            shared.agreements.remove(name)
        };
        if removed.is_none() {
            return Err(TribeError::AgreementNotFound(name.to_string()));
        }
        let peers = {
            let shared = self.shared.lock().unwrap_or_else(|p| p.into_inner());
            shared.members.alive_peers(&self.cfg.node_name)
        };
        for peer in peers {
            self.send(
                peer.addr,
                TribeMessage::AgreementRemoved {
                    name: name.to_string(),
                },
            );
        }
        Ok(())
    }

    pub fn join_agreement(&self, agreement: &str, member: &str) -> Result<()> {
        {
            let shared = self.shared.lock().unwrap_or_else(|p| p.into_inner());
            if shared.agreements.get(agreement).is_none() {
                return Err(TribeError::AgreementNotFound(agreement.to_string()));
            }
            if shared.members.get(member).is_none() {
                return Err(TribeError::MemberNotFound(member.to_string()));
            }
        }
        let delta = Delta {
            agreement: agreement.to_string(),
            origin: self.cfg.node_name.clone(),
            clock: self.tick_clock(),
            change: Change::MemberJoined {
                name: member.to_string(),
            },
        };
        {
            let mut shared = self.shared.lock().unwrap_or_else(|p| p.into_inner());
            shared.agreements.apply(&delta, &self.cfg.node_name);
        }
        if member == self.cfg.node_name {
            self.catch_up(agreement);
        }
        self.broadcast_delta(delta);
        Ok(())
    }

    pub fn leave_agreement(&self, agreement: &str, member: &str) -> Result<()> {
        {
            let shared = self.shared.lock().unwrap_or_else(|p| p.into_inner());
            if shared.agreements.get(agreement).is_none() {
                return Err(TribeError::AgreementNotFound(agreement.to_string()));
            }
        }
        let delta = Delta {
            agreement: agreement.to_string(),
            origin: self.cfg.node_name.clone(),
            clock: self.tick_clock(),
            change: Change::MemberLeft {
                name: member.to_string(),
            },
        };
        {
            let mut shared = self.shared.lock().unwrap_or_else(|p| p.into_inner());
            shared.agreements.apply(&delta, &self.cfg.node_name);
        }
        self.broadcast_delta(delta);
        Ok(())
    }

    /// Leave the cluster and stop the loops. Peers learn of the departure
    /// through the final heartbeat.
    pub async fn shutdown(&self) {
        let (peers, members) = {
            let mut shared = self.shared.lock().unwrap_or_else(|p| p.into_inner());
            shared
                .members
                .set_status(&self.cfg.node_name, MemberStatus::Left);
            (
                shared.members.alive_peers(&self.cfg.node_name),
                shared.members.list(),
            )
        };
        for peer in peers {
            self.send(
                peer.addr,
                TribeMessage::Heartbeat {
                    from: self.cfg.node_name.clone(),
                    members: members.clone(),
                },
            );
        }
        // give the sender loop a moment to flush the goodbyes
        tokio::time::sleep(Duration::from_millis(50)).await;
        let loops: Vec<JoinHandle<()>> = {
            let mut guard = self.loops.lock().unwrap_or_else(|p| p.into_inner());
            guard.drain(..).collect()
        };
        for handle in loops {
            handle.abort();
        }
        tracing::info!(node = %self.cfg.node_name, "tribe stopped");
    }
}

/// Catalog and scheduler events re-broadcast into every agreement this
/// node belongs to. Handlers run on the publisher's thread, so this only
/// mutates local state and enqueues datagrams.
impl EventHandler for Tribe {
    fn handle_event(&self, event: &Event) {
        let change = match event {
            Event::PluginLoaded { id, .. } => Change::PluginAdded {
                id: id.clone(),
                origin_rest: self.cfg.rest_addr.clone(),
            },
            Event::PluginUnloaded { id } => Change::PluginRemoved { id: id.clone() },
            Event::TaskCreated { id, manifest } => Change::TaskAdded {
                id: *id,
                manifest: manifest.clone(),
                started: !manifest.no_start,
            },
            Event::TaskStarted { id } => Change::TaskStarted { id: *id },
            Event::TaskStopped { id } => Change::TaskStopped { id: *id },
            Event::TaskRemoved { id } => Change::TaskRemoved { id: *id },
        };

        let suppression_key = match &change {
            Change::PluginAdded { id, .. } | Change::PluginRemoved { id } => {
                format!("plugin:{}", crate::agreement::plugin_key(id))
            }
            Change::TaskAdded { id, .. }
            | Change::TaskRemoved { id }
            | Change::TaskStarted { id }
            | Change::TaskStopped { id } => format!("task:{id}"),
            Change::MemberJoined { .. } | Change::MemberLeft { .. } => return,
        };

        let agreements: Vec<String> = {
            let shared = self.shared.lock().unwrap_or_else(|p| p.into_inner());
            if shared.suppression.contains(&suppression_key) {
                // echo of a replicated side effect; do not re-broadcast
                return;
            }
            shared
                .agreements
                .all()
                .values()
                .filter(|a| a.is_member(&self.cfg.node_name))
                .map(|a| a.name.clone())
                .collect()
        };

        for agreement in agreements {
            let delta = Delta {
                agreement,
                origin: self.cfg.node_name.clone(),
                clock: self.tick_clock(),
                change: change.clone(),
            };
            {
                let mut shared = self.shared.lock().unwrap_or_else(|p| p.into_inner());
                shared.agreements.apply(&delta, &self.cfg.node_name);
            }
            self.broadcast_delta(delta);
        }
    }
}

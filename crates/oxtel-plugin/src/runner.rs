//! Launches a plugin binary as a subprocess, performs the stdout
//! handshake, and multiplexes typed RPC calls over the TCP channel the
//! plugin advertised.

use crate::codec::{self, WireCodec};
use crate::error::{PluginError, Result};
use crate::proto::{
    Handshake, RpcCall, RpcFault, RpcOutcome, RpcReply, RpcRequest, RpcResponse, FaultKind,
    TOKEN_ENV,
};
use oxtel_common::policy::{ConfigMap, ConfigPolicy};
use oxtel_common::types::{CollectRequest, Metric, MetricType, Payload, PluginId};
use rand::Rng;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// How long the plugin has to print its handshake line.
    pub handshake_timeout: Duration,
    /// Liveness probe cadence.
    pub ping_interval: Duration,
    /// Consecutive ping misses before the instance is declared unhealthy.
    pub ping_max_misses: u32,
    /// Per-ping reply deadline.
    pub ping_timeout: Duration,
    /// Deadline for metadata calls (config policy, metric types).
    pub meta_call_timeout: Duration,
    /// Grace between the Kill RPC and a hard process kill.
    pub kill_grace: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(3),
            ping_interval: Duration::from_secs(1),
            ping_max_misses: 3,
            ping_timeout: Duration::from_millis(500),
            meta_call_timeout: Duration::from_secs(10),
            kill_grace: Duration::from_secs(3),
        }
    }
}

/// What the plugin told us about itself, minus the shared token.
#[derive(Debug, Clone)]
pub struct PluginMeta {
    pub id: PluginId,
    pub listen_address: String,
    pub content_type: &'static str,
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<std::result::Result<RpcReply, RpcFault>>>>>;

/// A live plugin subprocess with its RPC channel. Calls from different
/// workers interleave freely; responses are matched by request id.
#[derive(Debug)]
pub struct PluginRunner {
    meta: PluginMeta,
    codec: WireCodec,
    cfg: RunnerConfig,
    child: Mutex<Option<Child>>,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    pending: Pending,
    next_id: AtomicU64,
    healthy: Arc<AtomicBool>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    ping_task: Mutex<Option<JoinHandle<()>>>,
}

impl PluginRunner {
    /// Spawn the binary with a port argument and the shared token, wait
    /// for the handshake, and connect the RPC channel. The child is
    /// killed on any failure along the way.
    pub async fn launch(path: &Path, cfg: RunnerConfig) -> Result<Arc<Self>> {
        let token: String = {
            let mut rng = rand::thread_rng();
            (0..16).map(|_| format!("{:02x}", rng.gen::<u8>())).collect()
        };

        let mut child = Command::new(path)
            .arg("0")
            .env(TOKEN_ENV, &token)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PluginError::Handshake("child stdout unavailable".to_string()))?;

        let mut lines = BufReader::new(stdout).lines();
        let line = match timeout(cfg.handshake_timeout, lines.next_line()).await {
            Ok(Ok(Some(line))) => line,
            Ok(Ok(None)) => {
                let _ = child.kill().await;
                return Err(PluginError::Handshake(
                    "plugin exited before handshake".to_string(),
                ));
            }
            Ok(Err(e)) => {
                let _ = child.kill().await;
                return Err(PluginError::Handshake(format!("reading handshake: {e}")));
            }
            Err(_) => {
                let _ = child.kill().await;
                return Err(PluginError::Handshake(format!(
                    "no handshake within {:?}",
                    cfg.handshake_timeout
                )));
            }
        };

        let handshake: Handshake = match serde_json::from_str(&line) {
            Ok(hs) => hs,
            Err(e) => {
                let _ = child.kill().await;
                return Err(PluginError::Handshake(format!(
                    "bad handshake line: {e}"
                )));
            }
        };

        if handshake.token != token {
            let _ = child.kill().await;
            return Err(PluginError::Handshake("token mismatch".to_string()));
        }
        if handshake.name.is_empty() || handshake.version == 0 {
            let _ = child.kill().await;
            return Err(PluginError::Handshake(format!(
                "invalid identity {}:{}",
                handshake.name, handshake.version
            )));
        }

        let wire = match codec::negotiate(&handshake.content_types) {
            Ok(c) => c,
            Err(e) => {
                let _ = child.kill().await;
                return Err(e);
            }
        };

        let stream = match timeout(
            cfg.handshake_timeout,
            TcpStream::connect(&handshake.listen_address),
        )
        .await
        {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => {
                let _ = child.kill().await;
                return Err(PluginError::Handshake(format!(
                    "connecting {}: {e}",
                    handshake.listen_address
                )));
            }
            Err(_) => {
                let _ = child.kill().await;
                return Err(PluginError::Handshake(format!(
                    "connect to {} timed out",
                    handshake.listen_address
                )));
            }
        };

        let (read_half, write_half) = stream.into_split();
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let healthy = Arc::new(AtomicBool::new(true));

        let meta = PluginMeta {
            id: PluginId::new(handshake.plugin_type, handshake.name.clone(), handshake.version),
            listen_address: handshake.listen_address.clone(),
            content_type: wire.content_type(),
        };

        let runner = Arc::new(Self {
            meta,
            codec: wire,
            cfg: cfg.clone(),
            child: Mutex::new(Some(child)),
            writer: tokio::sync::Mutex::new(write_half),
            pending: pending.clone(),
            next_id: AtomicU64::new(1),
            healthy: healthy.clone(),
            reader_task: Mutex::new(None),
            ping_task: Mutex::new(None),
        });

        let reader = tokio::spawn(Self::read_loop(read_half, wire, pending, healthy));
        *runner.reader_task.lock().unwrap_or_else(|p| p.into_inner()) = Some(reader);

        runner.spawn_ping_monitor();
        Ok(runner)
    }

    async fn read_loop(
        read_half: tokio::net::tcp::OwnedReadHalf,
        wire: WireCodec,
        pending: Pending,
        healthy: Arc<AtomicBool>,
    ) {
        let mut reader = read_half;
        loop {
            let frame = match codec::read_frame(&mut reader).await {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::debug!(error = %e, "plugin rpc channel closed");
                    break;
                }
            };
            let response: RpcResponse = match wire.decode(&frame) {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(error = %e, "undecodable frame from plugin");
                    break;
                }
            };
            let sender = {
                let mut guard = pending.lock().unwrap_or_else(|p| p.into_inner());
                guard.remove(&response.id)
            };
            match sender {
                Some(tx) => {
                    let result = match response.outcome {
                        RpcOutcome::Ok(reply) => Ok(reply),
                        RpcOutcome::Err(fault) => Err(fault),
                    };
                    let _ = tx.send(result);
                }
                None => {
                    tracing::debug!(id = response.id, "reply for unknown request id");
                }
            }
        }
        // Connection is gone; fail whatever is still waiting.
        healthy.store(false, Ordering::SeqCst);
        let mut guard = pending.lock().unwrap_or_else(|p| p.into_inner());
        guard.clear();
    }

    fn spawn_ping_monitor(self: &Arc<Self>) {
        let runner = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(runner.cfg.ping_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut misses = 0u32;
            loop {
                ticker.tick().await;
                if !runner.is_healthy() {
                    break;
                }
                match runner.ping().await {
                    Ok(()) => misses = 0,
                    Err(_) => {
                        misses += 1;
                        tracing::debug!(
                            plugin = %runner.meta.id,
                            misses,
                            "ping missed"
                        );
                        if misses >= runner.cfg.ping_max_misses {
                            tracing::warn!(
                                plugin = %runner.meta.id,
                                "plugin unresponsive, terminating"
                            );
                            runner.healthy.store(false, Ordering::SeqCst);
                            runner.terminate().await;
                            break;
                        }
                    }
                }
            }
        });
        *self.ping_task.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);
    }

    pub fn meta(&self) -> &PluginMeta {
        &self.meta
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    async fn call(&self, call: RpcCall, deadline: Duration) -> Result<RpcReply> {
        if !self.is_healthy() {
            return Err(PluginError::Transport("instance is unhealthy".to_string()));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut guard = self.pending.lock().unwrap_or_else(|p| p.into_inner());
            guard.insert(id, tx);
        }

        let frame = self.codec.encode(&RpcRequest { id, call })?;
        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = codec::write_frame(&mut *writer, &frame).await {
                let mut guard = self.pending.lock().unwrap_or_else(|p| p.into_inner());
                guard.remove(&id);
                self.healthy.store(false, Ordering::SeqCst);
                return Err(e);
            }
        }

        match timeout(deadline, rx).await {
            Ok(Ok(Ok(reply))) => Ok(reply),
            Ok(Ok(Err(fault))) => Err(match fault.kind {
                FaultKind::Policy => PluginError::Policy(fault.message),
                FaultKind::Plugin => PluginError::Plugin(fault.message),
            }),
            Ok(Err(_)) => Err(PluginError::Transport(
                "rpc channel closed mid-call".to_string(),
            )),
            Err(_) => {
                let mut guard = self.pending.lock().unwrap_or_else(|p| p.into_inner());
                guard.remove(&id);
                Err(PluginError::Timeout(deadline))
            }
        }
    }

    pub async fn ping(&self) -> Result<()> {
        match self.call(RpcCall::Ping, self.cfg.ping_timeout).await? {
            RpcReply::Pong => Ok(()),
            other => Err(PluginError::Transport(format!(
                "unexpected ping reply: {other:?}"
            ))),
        }
    }

    pub async fn get_config_policy(&self) -> Result<ConfigPolicy> {
        match self
            .call(RpcCall::GetConfigPolicy, self.cfg.meta_call_timeout)
            .await?
        {
            RpcReply::ConfigPolicy(policy) => Ok(policy),
            other => Err(PluginError::Transport(format!(
                "unexpected config policy reply: {other:?}"
            ))),
        }
    }

    pub async fn get_metric_types(&self, config: &ConfigMap) -> Result<Vec<MetricType>> {
        let call = RpcCall::GetMetricTypes {
            config: config.clone(),
        };
        match self.call(call, self.cfg.meta_call_timeout).await? {
            RpcReply::MetricTypes(types) => Ok(types),
            other => Err(PluginError::Transport(format!(
                "unexpected metric types reply: {other:?}"
            ))),
        }
    }

    pub async fn collect(
        &self,
        requests: &[CollectRequest],
        config: &ConfigMap,
        deadline: Duration,
    ) -> Result<Vec<Metric>> {
        let call = RpcCall::CollectMetrics {
            requests: requests.to_vec(),
            config: config.clone(),
        };
        match self.call(call, deadline).await? {
            RpcReply::Metrics(metrics) => Ok(metrics),
            other => Err(PluginError::Transport(format!(
                "unexpected collect reply: {other:?}"
            ))),
        }
    }

    pub async fn process(
        &self,
        payload: Payload,
        config: &ConfigMap,
        deadline: Duration,
    ) -> Result<Payload> {
        let call = RpcCall::Process {
            payload,
            config: config.clone(),
        };
        match self.call(call, deadline).await? {
            RpcReply::Processed(payload) => Ok(payload),
            other => Err(PluginError::Transport(format!(
                "unexpected process reply: {other:?}"
            ))),
        }
    }

    pub async fn publish(
        &self,
        payload: Payload,
        config: &ConfigMap,
        deadline: Duration,
    ) -> Result<()> {
        let call = RpcCall::Publish {
            payload,
            config: config.clone(),
        };
        match self.call(call, deadline).await? {
            RpcReply::Published => Ok(()),
            other => Err(PluginError::Transport(format!(
                "unexpected publish reply: {other:?}"
            ))),
        }
    }

    /// Ordered stop: Kill RPC, grace period, hard kill, reap. Safe to call
    /// more than once.
    pub async fn stop(&self) {
        let _ = self.call(RpcCall::Kill, Duration::from_secs(1)).await;
        self.healthy.store(false, Ordering::SeqCst);
        self.terminate().await;

        let handles: Vec<JoinHandle<()>> = {
            let mut reader = self.reader_task.lock().unwrap_or_else(|p| p.into_inner());
            let mut ping = self.ping_task.lock().unwrap_or_else(|p| p.into_inner());
            reader.take().into_iter().chain(ping.take()).collect()
        };
        for handle in handles {
            handle.abort();
        }
    }

    async fn terminate(&self) {
        let child = {
            let mut guard = self.child.lock().unwrap_or_else(|p| p.into_inner());
            guard.take()
        };
        let Some(mut child) = child else {
            return;
        };
        match timeout(self.cfg.kill_grace, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(plugin = %self.meta.id, %status, "plugin exited");
            }
            _ => {
                tracing::warn!(plugin = %self.meta.id, "plugin did not exit, killing");
                let _ = child.kill().await;
                let _ = child.wait().await;
            }
        }
    }
}

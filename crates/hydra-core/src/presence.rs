//! ---
//! hydra_section: "04-runtime-core"
//! hydra_subsection: "module"
//! hydra_type: "source"
//! hydra_scope: "code"
//! hydra_description: "Presence, dispatch, queueing and correlation runtime."
//! hydra_version: "v0.1.0"
//! hydra_owner: "tbd"
//! ---
//! Registration, presence, health and discovery.
//!
//! Liveness is a short-TTL key refreshed every tick. The directory hash keeps
//! one descriptive entry per instance without a TTL, so discovery always
//! starts from live keys and only then reads the directory.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use hydra_common::config::PresenceConfig;
use hydra_store::{KeySpace, Store};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value as JsonValue;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::HydraMetrics;
use crate::Result;

/// Who this instance is, as advertised to peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Name of the service this instance belongs to.
    pub service_name: String,
    /// Unique id of this instance.
    pub instance_id: String,
    /// Free-form service type.
    pub service_type: String,
    /// Free-form service description.
    pub description: String,
    /// Service version.
    pub version: String,
    /// Advertised address.
    pub ip: String,
    /// Advertised port, `0` when unset.
    pub port: u16,
    /// Host the process runs on.
    pub host_name: String,
    /// Operating system process id.
    pub process_id: u32,
}

impl Identity {
    /// Sender address stamped into `frm`: `{instance}@{service}:/`.
    pub fn route(&self) -> String {
        format!("{}@{}:/", self.instance_id, self.service_name)
    }
}

/// Peers have written the port as a number, a string, or not at all.
fn lenient_port<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<u16, D::Error> {
    Ok(match Option::<JsonValue>::deserialize(deserializer)? {
        Some(JsonValue::Number(n)) => n.as_u64().and_then(|n| u16::try_from(n).ok()).unwrap_or(0),
        Some(JsonValue::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    })
}

/// Written as a string, empty when unset, which is what every peer reads.
fn port_as_string<S: Serializer>(port: &u16, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    if *port == 0 {
        serializer.serialize_str("")
    } else {
        serializer.collect_str(port)
    }
}

/// Directory entry, one per instance, in `{prefix}:nodes`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    /// Service the instance belongs to.
    #[serde(default)]
    pub service_name: String,
    /// Service description.
    #[serde(default)]
    pub service_description: String,
    /// Service version.
    #[serde(default)]
    pub version: String,
    /// Unique instance id.
    #[serde(rename = "instanceID", alias = "instanceId", default)]
    pub instance_id: String,
    /// Operating system process id.
    #[serde(rename = "processID", alias = "processId", default)]
    pub process_id: u32,
    /// Advertised address.
    #[serde(default)]
    pub ip: String,
    /// Advertised port, `0` when unset.
    #[serde(default, serialize_with = "port_as_string", deserialize_with = "lenient_port")]
    pub port: u16,
    /// Host the instance runs on.
    #[serde(default)]
    pub host_name: String,
    /// Time of the last presence write.
    #[serde(default = "Utc::now")]
    pub updated_on: DateTime<Utc>,
    /// Seconds since `updated_on`; only computed by [`PresenceEngine::service_nodes`].
    #[serde(default)]
    pub elapsed: i64,
}

/// Process memory in bytes, under the field names health dashboards expect.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStats {
    /// Resident memory.
    #[serde(rename = "pagedMemorySize64", alias = "rss")]
    pub rss: u64,
    /// Virtual memory.
    #[serde(rename = "virtualPagedMemorySize64", alias = "virtual")]
    pub virtual_size: u64,
    /// Peak resident memory.
    #[serde(rename = "peekPagedMemorySize64", alias = "peak")]
    pub peak: u64,
}

impl MemoryStats {
    /// Resident, virtual and peak-resident bytes of this process. Zero where unsupported.
    pub fn sample() -> Self {
        let Ok(status) = std::fs::read_to_string("/proc/self/status") else {
            return Self::default();
        };
        let field = |name: &str| -> u64 {
            status
                .lines()
                .find_map(|line| line.strip_prefix(name))
                .and_then(|rest| rest.trim().trim_end_matches("kB").trim().parse::<u64>().ok())
                .map(|kib| kib * 1024)
                .unwrap_or(0)
        };
        Self {
            rss: field("VmRSS:"),
            virtual_size: field("VmSize:"),
            peak: field("VmHWM:"),
        }
    }
}

/// Health snapshot at `{prefix}:{service}:{instance}:health`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthEntry {
    /// Time of the write.
    pub updated_on: DateTime<Utc>,
    /// Service the instance belongs to.
    pub service_name: String,
    /// Unique instance id.
    #[serde(rename = "instanceID", alias = "instanceId")]
    pub instance_id: String,
    /// Host the instance runs on.
    pub host_name: String,
    /// Time the figures were sampled.
    pub sampled_on: DateTime<Utc>,
    /// Operating system process id.
    #[serde(rename = "processID", alias = "processId")]
    pub process_id: u32,
    /// CPU architecture.
    pub architecture: String,
    /// Runtime platform.
    pub platform: String,
    /// Runtime name and version.
    pub node_version: String,
    /// Process memory figures.
    pub memory: MemoryStats,
    /// Seconds since the presence engine started.
    pub uptime_seconds: f64,
}

/// Registration record at `{prefix}:{service}:service`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationEntry {
    /// Registered service.
    pub service_name: String,
    /// Service type from configuration.
    #[serde(rename = "type")]
    pub service_type: String,
    /// Time of registration.
    pub registered_on: DateTime<Utc>,
}

/// Writes this instance's registration, presence and health, and answers discovery queries.
pub struct PresenceEngine {
    store: Arc<dyn Store>,
    keys: KeySpace,
    identity: Identity,
    config: PresenceConfig,
    started: Instant,
    rng: Mutex<StdRng>,
}

impl PresenceEngine {
    /// Engine advertising `identity` through `store`.
    pub fn new(store: Arc<dyn Store>, keys: KeySpace, identity: Identity, config: PresenceConfig) -> Self {
        Self {
            store,
            keys,
            identity,
            config,
            started: Instant::now(),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Replace the discovery shuffle source, e.g. with a seeded generator.
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = Mutex::new(rng);
        self
    }

    /// Identity this engine advertises.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Write the registration record at `{prefix}:{service}:service`.
    pub async fn register_service(&self) -> Result<()> {
        let entry = RegistrationEntry {
            service_name: self.identity.service_name.clone(),
            service_type: self.identity.service_type.clone(),
            registered_on: Utc::now(),
        };
        self.store
            .set(
                &self.keys.service(&self.identity.service_name),
                &serde_json::to_vec(&entry)?,
                Some(self.config.key_ttl),
            )
            .await?;
        Ok(())
    }

    /// Directory entry describing this instance now.
    pub fn presence_entry(&self) -> PresenceEntry {
        PresenceEntry {
            service_name: self.identity.service_name.clone(),
            service_description: self.identity.description.clone(),
            version: self.identity.version.clone(),
            instance_id: self.identity.instance_id.clone(),
            process_id: self.identity.process_id,
            ip: self.identity.ip.clone(),
            port: self.identity.port,
            host_name: self.identity.host_name.clone(),
            updated_on: Utc::now(),
            elapsed: 0,
        }
    }

    /// Health snapshot of this process now.
    pub fn health_entry(&self) -> HealthEntry {
        let now = Utc::now();
        HealthEntry {
            updated_on: now,
            service_name: self.identity.service_name.clone(),
            instance_id: self.identity.instance_id.clone(),
            host_name: self.identity.host_name.clone(),
            sampled_on: now,
            process_id: self.identity.process_id,
            architecture: std::env::consts::ARCH.to_owned(),
            platform: "rust".to_owned(),
            node_version: format!("hydra-core/{}", env!("CARGO_PKG_VERSION")),
            memory: MemoryStats::sample(),
            uptime_seconds: self.started.elapsed().as_secs_f64(),
        }
    }

    /// Refresh the liveness key and upsert the directory entry.
    pub async fn write_presence(&self) -> Result<()> {
        let Identity {
            service_name,
            instance_id,
            ..
        } = &self.identity;
        self.store
            .set(
                &self.keys.presence(service_name, instance_id),
                instance_id.as_bytes(),
                Some(self.config.key_ttl),
            )
            .await?;
        let entry = serde_json::to_string(&self.presence_entry())?;
        self.store.hset(&self.keys.nodes(), instance_id, &entry).await?;
        Ok(())
    }

    /// Write the health snapshot with the liveness TTL.
    pub async fn write_health(&self) -> Result<()> {
        let key = self
            .keys
            .health(&self.identity.service_name, &self.identity.instance_id);
        let entry = serde_json::to_vec(&self.health_entry())?;
        self.store.set(&key, &entry, Some(self.config.key_ttl)).await?;
        Ok(())
    }

    /// Live instances of `service`, in random order.
    pub async fn discover(&self, service: &str) -> Result<Vec<PresenceEntry>> {
        let live_keys = self.store.scan(&self.keys.presence_pattern(service)).await?;
        let nodes = self.keys.nodes();
        let mut entries = Vec::with_capacity(live_keys.len());
        for key in &live_keys {
            let Some(instance) = self.keys.instance_from_presence(service, key) else {
                continue;
            };
            let Some(raw) = self.store.hget(&nodes, instance).await? else {
                debug!(service, instance, "live instance has no directory entry yet");
                continue;
            };
            match serde_json::from_str::<PresenceEntry>(&raw) {
                Ok(entry) => entries.push(entry),
                Err(err) => warn!(service, instance, error = %err, "skipping unreadable directory entry"),
            }
        }
        entries.shuffle(&mut *self.rng.lock());
        Ok(entries)
    }

    /// Every directory entry, live or stale, with `elapsed` filled in.
    pub async fn service_nodes(&self) -> Result<Vec<PresenceEntry>> {
        let now = Utc::now();
        let mut entries: Vec<PresenceEntry> = self
            .store
            .hgetall(&self.keys.nodes())
            .await?
            .into_iter()
            .filter_map(|(instance, raw)| match serde_json::from_str::<PresenceEntry>(&raw) {
                Ok(entry) => Some(entry),
                Err(err) => {
                    warn!(instance = %instance, error = %err, "skipping unreadable directory entry");
                    None
                }
            })
            .map(|mut entry| {
                entry.elapsed = (now - entry.updated_on).num_seconds();
                entry
            })
            .collect();
        entries.sort_by(|a, b| a.service_name.cmp(&b.service_name).then(a.instance_id.cmp(&b.instance_id)));
        Ok(entries)
    }

    /// Remove this instance's directory entry and liveness keys.
    pub async fn deregister(&self) -> Result<()> {
        let Identity {
            service_name,
            instance_id,
            ..
        } = &self.identity;
        self.store.hdel(&self.keys.nodes(), instance_id).await?;
        self.store.del(&self.keys.presence(service_name, instance_id)).await?;
        self.store.del(&self.keys.health(service_name, instance_id)).await?;
        info!(service = %service_name, instance = %instance_id, "deregistered");
        Ok(())
    }

    /// Tick presence every interval and health every Nth tick until cancelled.
    /// Failed ticks are logged and skipped.
    pub fn spawn(
        self: Arc<Self>,
        cancel: CancellationToken,
        metrics: Option<Arc<HydraMetrics>>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = self.config.tick_interval;
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let health_every = u64::from(self.config.health_every_ticks.max(1));
            let mut tick: u64 = 0;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(instance = %self.identity.instance_id, "presence loop shutdown");
                        break;
                    }
                    _ = interval.tick() => {
                        tick += 1;
                        if let Err(err) = self.write_presence().await {
                            warn!(instance = %self.identity.instance_id, error = %err, "presence tick failed");
                            if let Some(metrics) = &metrics {
                                metrics.observe_presence_failure();
                            }
                        }
                        if tick % health_every == 0 {
                            if let Err(err) = self.write_health().await {
                                warn!(instance = %self.identity.instance_id, error = %err, "health tick failed");
                                if let Some(metrics) = &metrics {
                                    metrics.observe_presence_failure();
                                }
                            }
                        }
                    }
                }
            }
        })
    }
}

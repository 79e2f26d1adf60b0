//! Provisioning scheduler
//!
//! Periodic control loop that turns announcements pointing at this host into
//! local bare repositories:
//! 1. Fetch recent announcements and keep the valid, newest ones whose clone
//!    URLs point at the configured domain
//! 2. For each, check local state and look for the owner's self-transfer
//! 3. Gate creation behind the access policy
//! 4. Create or refresh the repository
//!
//! Failures are isolated per announcement. Ticks never overlap.

use forgestr_git::{ProvisionOutcome, RepoManager};
use forgestr_relay::{
    unix_now, Event, EventSource, Filter, RepoCoordinate, UnsignedEvent, KIND_REPO_ANNOUNCEMENT,
};
use serde::Serialize;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::access::AccessPolicy;
use crate::auth::{transfer_template, validate_announcement, AuthError, OwnershipResolver};

pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_BATCH_LIMIT: usize = 200;

/// Shortest loop period; `tokio::time::interval` rejects zero
pub const MIN_TICK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("Event source error: {0}")]
    Source(#[from] forgestr_relay::Error),

    #[error("Repository error: {0}")]
    Repo(#[from] forgestr_git::Error),

    #[error(transparent)]
    Auth(#[from] AuthError),
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Host name clone URLs must point at (subdomains match too)
    pub domain: String,
    pub interval: Duration,
    pub batch_limit: usize,
}

impl SchedulerConfig {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            interval: DEFAULT_TICK_INTERVAL,
            batch_limit: DEFAULT_BATCH_LIMIT,
        }
    }
}

/// A hosted repository whose owner has not published a self-transfer yet.
///
/// `template` is what the owner needs to sign and publish. It is never
/// treated as evidence of ownership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingAttestation {
    pub coordinate: String,
    pub owner: String,
    pub template: UnsignedEvent,
    pub discovered_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvisionFailure {
    pub coordinate: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    /// Announcements returned by the source
    pub fetched: usize,
    /// Valid, newest-per-repo announcements pointing at this host
    pub relevant: usize,
    pub created: usize,
    pub refreshed: usize,
    /// Denied by the access policy
    pub skipped: usize,
    pub failed: Vec<ProvisionFailure>,
    /// Existing repositories still lacking a self-transfer
    pub pending_attestations: Vec<PendingAttestation>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Completed(TickReport),
    /// Another tick was still running
    Skipped,
}

enum Processed {
    Provisioned(ProvisionOutcome),
    Denied,
}

struct Inner {
    source: Arc<dyn EventSource>,
    repos: Arc<dyn RepoManager>,
    access: Arc<dyn AccessPolicy>,
    ownership: OwnershipResolver,
    config: SchedulerConfig,
    in_flight: AtomicBool,
    pending: RwLock<HashMap<String, PendingAttestation>>,
    last_report: RwLock<Option<TickReport>>,
}

/// Clears the single-flight flag when a tick ends, however it ends
struct FlightGuard<'a>(&'a AtomicBool);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct LoopHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct ProvisioningScheduler {
    inner: Arc<Inner>,
    running: Mutex<Option<LoopHandle>>,
}

impl ProvisioningScheduler {
    pub fn new(
        source: Arc<dyn EventSource>,
        repos: Arc<dyn RepoManager>,
        access: Arc<dyn AccessPolicy>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                ownership: OwnershipResolver::new(source.clone()),
                source,
                repos,
                access,
                config,
                in_flight: AtomicBool::new(false),
                pending: RwLock::new(HashMap::new()),
                last_report: RwLock::new(None),
            }),
            running: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Start the loop, replacing any loop already running. The first tick is immediate.
    pub fn start(&self) {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = running.take() {
            previous.stop();
        }

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let inner = self.inner.clone();
        let every = inner.config.interval.max(MIN_TICK_INTERVAL);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        inner.tick().await;
                    }
                }
            }
            debug!("Provisioning loop stopped");
        });

        info!(
            "Provisioning scheduler started for {} every {:?} (access: {})",
            self.inner.config.domain,
            every,
            self.inner.access.describe()
        );
        *running = Some(LoopHandle { shutdown, task });
    }

    /// Stop the loop; no-op when not running
    pub fn stop(&self) {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = running.take() {
            handle.stop();
            info!("Provisioning scheduler stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        let running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        running.as_ref().is_some_and(|h| !h.task.is_finished())
    }

    /// Run one tick now, unless one is already running
    pub async fn tick(&self) -> TickOutcome {
        self.inner.tick().await
    }

    /// Every repository currently waiting for its owner's self-transfer
    pub fn pending_attestations(&self) -> Vec<PendingAttestation> {
        let pending = self.inner.pending.read().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<PendingAttestation> = pending.values().cloned().collect();
        all.sort_by(|a, b| a.coordinate.cmp(&b.coordinate));
        all
    }

    pub fn last_report(&self) -> Option<TickReport> {
        self.inner
            .last_report
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl Drop for ProvisioningScheduler {
    fn drop(&mut self) {
        if let Some(handle) = self.running.get_mut().ok().and_then(|r| r.take()) {
            handle.stop();
        }
    }
}

impl LoopHandle {
    fn stop(self) {
        let _ = self.shutdown.send(true);
        self.task.abort();
    }
}

impl Inner {
    async fn tick(&self) -> TickOutcome {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Previous tick still running, skipping");
            return TickOutcome::Skipped;
        }
        let _guard = FlightGuard(&self.in_flight);

        let report = self.run_tick().await;
        *self.last_report.write().unwrap_or_else(|e| e.into_inner()) = Some(report.clone());
        TickOutcome::Completed(report)
    }

    async fn run_tick(&self) -> TickReport {
        let mut report = TickReport::default();

        let filter = Filter::new()
            .kind(KIND_REPO_ANNOUNCEMENT)
            .limit(self.config.batch_limit);
        let events = match self.source.fetch_events(&[filter]).await {
            Ok(events) => events,
            Err(e) => {
                warn!("Failed to fetch announcements: {}", e);
                return report;
            }
        };
        report.fetched = events.len();

        let relevant = relevant_announcements(events, &self.config.domain);
        report.relevant = relevant.len();
        let mut seen = HashSet::new();

        for announcement in relevant {
            let coordinate = match RepoCoordinate::from_announcement(&announcement) {
                Ok(c) => c,
                Err(e) => {
                    warn!("Skipping announcement {}: {}", announcement.id, e);
                    continue;
                }
            };
            seen.insert(coordinate.to_string());

            match self.process(&coordinate, &announcement, &mut report).await {
                Ok(Processed::Provisioned(ProvisionOutcome::Created)) => report.created += 1,
                Ok(Processed::Provisioned(ProvisionOutcome::Refreshed)) => report.refreshed += 1,
                Ok(Processed::Denied) => report.skipped += 1,
                Err(e) => {
                    warn!("Provisioning {} failed: {}", coordinate, e);
                    report.failed.push(ProvisionFailure {
                        coordinate: coordinate.to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }

        // repositories no longer announced for this host stop being pending
        self.pending_map_mut().retain(|coordinate, _| {
            let keep = seen.contains(coordinate);
            if !keep {
                debug!("Dropping pending attestation for {}", coordinate);
            }
            keep
        });

        info!(
            "Tick: {} fetched, {} relevant, {} created, {} refreshed, {} skipped, {} failed, {} pending attestation",
            report.fetched,
            report.relevant,
            report.created,
            report.refreshed,
            report.skipped,
            report.failed.len(),
            report.pending_attestations.len()
        );
        report
    }

    async fn process(
        &self,
        coordinate: &RepoCoordinate,
        announcement: &Event,
        report: &mut TickReport,
    ) -> Result<Processed, ProvisionError> {
        let exists = self.repos.repo_exists(coordinate).await?;
        let evidence = self.ownership.find_self_transfer(coordinate).await?;
        let key = coordinate.to_string();

        match (&evidence, exists) {
            (Some(_), _) => {
                if self.pending_map_mut().remove(&key).is_some() {
                    info!("Self-transfer found for {}", key);
                }
            }
            (None, true) => {
                let pending = self
                    .pending_map_mut()
                    .entry(key.clone())
                    .or_insert_with(|| PendingAttestation {
                        coordinate: key.clone(),
                        owner: coordinate.owner.clone(),
                        template: transfer_template(
                            coordinate,
                            &coordinate.owner,
                            &coordinate.owner,
                            unix_now(),
                        ),
                        discovered_at: unix_now(),
                    })
                    .clone();
                debug!("{} has no self-transfer yet", key);
                report.pending_attestations.push(pending);
            }
            (None, false) => {}
        }

        if !exists && !self.access.may_create_repo(&coordinate.owner).await {
            info!("Not creating {}: {} denied by access policy", key, coordinate.owner);
            return Ok(Processed::Denied);
        }

        let outcome = self
            .repos
            .provision_repo(announcement, evidence.as_ref(), exists)
            .await?;
        Ok(Processed::Provisioned(outcome))
    }

    fn pending_map_mut(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, PendingAttestation>> {
        self.pending.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// Valid announcements, newest per `(pubkey, d)`, with a clone URL on `domain`,
/// ordered by coordinate
pub fn relevant_announcements(events: Vec<Event>, domain: &str) -> Vec<Event> {
    let mut latest: HashMap<(String, String), Event> = HashMap::new();

    for event in events {
        if let Err(e) = validate_announcement(&event, None) {
            debug!("Ignoring announcement {}: {}", event.id, e);
            continue;
        }
        let Some(repo_id) = event.tag_value("d") else {
            continue;
        };
        let key = (event.pubkey.to_ascii_lowercase(), repo_id.to_string());
        match latest.get(&key) {
            Some(existing) if newest_first(existing, &event) != CmpOrdering::Less => {}
            _ => {
                latest.insert(key, event);
            }
        }
    }

    let mut relevant: Vec<((String, String), Event)> = latest
        .into_iter()
        .filter(|(_, event)| points_at(event, domain))
        .collect();
    relevant.sort_by(|a, b| a.0.cmp(&b.0));
    relevant.into_iter().map(|(_, event)| event).collect()
}

fn newest_first(a: &Event, b: &Event) -> CmpOrdering {
    a.created_at
        .cmp(&b.created_at)
        .then_with(|| a.id.cmp(&b.id))
}

/// Whether any clone URL of `announcement` is hosted on `domain` or a subdomain of it
pub fn points_at(announcement: &Event, domain: &str) -> bool {
    let domain = domain.trim().trim_end_matches('.').to_ascii_lowercase();
    if domain.is_empty() {
        return false;
    }
    announcement
        .tag_values("clone")
        .filter_map(clone_url_host)
        .any(|host| host == domain || host.ends_with(&format!(".{}", domain)))
}

/// Host part of an http(s), ssh, git or scp-style clone URL, lowercased
pub fn clone_url_host(url: &str) -> Option<String> {
    let url = url.trim();
    let rest = match url.split_once("://") {
        Some((_, rest)) => rest,
        None => url,
    };
    let authority = rest.split('/').next()?;
    let authority = authority.rsplit_once('@').map_or(authority, |(_, host)| host);

    let host = if let Some(bracketed) = authority.strip_prefix('[') {
        bracketed.split(']').next()?
    } else {
        authority.split(':').next()?
    };

    if host.is_empty() {
        None
    } else {
        Some(host.trim_end_matches('.').to_ascii_lowercase())
    }
}

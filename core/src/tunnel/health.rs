//! Per-group health checker: probes every mapping's public hostname on a fixed tick and
//! reports failures/recoveries to an observer. The standard wiring restarts a mapping's
//! cloudflared after sustained failure and pauses its probes while the restart settles.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Consecutive failures before the wiring restarts a mapping.
pub const FAILURE_THRESHOLD: u32 = 3;
/// How long a mapping's probes stay suppressed after a health-driven restart.
pub const RESTART_PAUSE: Duration = Duration::from_secs(60);

const INITIAL_DELAY: Duration = Duration::from_secs(5);
const TICK: Duration = Duration::from_secs(10);
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Source of probe targets for one tick. Implementations apply the group's global pause and
/// any per-mapping pauses before returning `(id, hostname)` pairs.
#[async_trait]
pub trait HealthTarget: Send + Sync {
    async fn probe_targets(&self) -> Vec<(String, String)>;
}

/// Receives probe outcomes: called with `healthy=false` and the running failure count on every
/// unhealthy tick, and once with `healthy=true` on an unhealthy→healthy transition.
#[async_trait]
pub trait HealthObserver: Send + Sync {
    async fn on_probe(&self, id: &str, hostname: &str, healthy: bool, consecutive_failures: u32);
}

/// Restart seam used by [`RestartOnThreshold`]; implemented by the tunnel group.
#[async_trait]
pub trait MappingRestarter: Send + Sync {
    async fn restart_mapping(&self, id: &str) -> Result<()>;
    /// Suppress probes for this mapping for the given duration.
    fn pause_mapping(&self, id: &str, pause: Duration);
}

/// Standard observer wiring: at exactly [`FAILURE_THRESHOLD`] consecutive failures, restart the
/// mapping and pause its probes for [`RESTART_PAUSE`]. The pause drops the failure counter, so
/// probing afterwards counts from zero again.
pub struct RestartOnThreshold<R: MappingRestarter> {
    restarter: Arc<R>,
}

impl<R: MappingRestarter> RestartOnThreshold<R> {
    pub fn new(restarter: Arc<R>) -> Self {
        Self { restarter }
    }
}

#[async_trait]
impl<R: MappingRestarter> HealthObserver for RestartOnThreshold<R> {
    async fn on_probe(&self, id: &str, hostname: &str, healthy: bool, consecutive_failures: u32) {
        if healthy {
            tracing::info!("mapping {} ({}) recovered", id, hostname);
            return;
        }
        tracing::warn!(
            "mapping {} ({}) unhealthy ({} consecutive)",
            id,
            hostname,
            consecutive_failures
        );
        if consecutive_failures == FAILURE_THRESHOLD {
            self.restarter.pause_mapping(id, RESTART_PAUSE);
            if let Err(e) = self.restarter.restart_mapping(id).await {
                tracing::warn!("restart of mapping {} failed: {:#}", id, e);
            }
        }
    }
}

#[async_trait]
trait Prober: Send + Sync {
    async fn probe(&self, hostname: &str) -> bool;
}

struct HttpsProber {
    client: reqwest::Client,
}

impl HttpsProber {
    fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }
}

#[async_trait]
impl Prober for HttpsProber {
    /// Two GETs in order, `/` then `/ping`; the hostname is healthy iff any response is
    /// below the server-error range.
    async fn probe(&self, hostname: &str) -> bool {
        for path in ["/", "/ping"] {
            let url = format!("https://{}{}", hostname, path);
            if let Ok(resp) = self.client.get(&url).send().await {
                if is_healthy_status(resp.status().as_u16()) {
                    return true;
                }
            }
        }
        false
    }
}

/// Status codes that count as healthy: anything the origin answered that is not a
/// server/edge error (includes auth redirects and 4xx).
pub fn is_healthy_status(code: u16) -> bool {
    (200..500).contains(&code)
}

#[derive(Default)]
struct MappingHealth {
    consecutive_failures: u32,
    failing: bool,
}

enum Transition {
    StillHealthy,
    Failure(u32),
    Recovered,
}

impl MappingHealth {
    fn record(&mut self, healthy: bool) -> Transition {
        if healthy {
            if !self.failing {
                return Transition::StillHealthy;
            }
            self.failing = false;
            self.consecutive_failures = 0;
            Transition::Recovered
        } else {
            self.failing = true;
            self.consecutive_failures += 1;
            Transition::Failure(self.consecutive_failures)
        }
    }
}

/// Handle to a running checker; `stop()` cancels the probe task.
pub struct HealthChecker {
    cancel: CancellationToken,
}

impl HealthChecker {
    /// Spawn the probe loop against the given target/observer pair.
    pub fn spawn(target: Arc<dyn HealthTarget>, observer: Arc<dyn HealthObserver>) -> Self {
        Self::spawn_with_prober(target, observer, Arc::new(HttpsProber::new()))
    }

    fn spawn_with_prober(
        target: Arc<dyn HealthTarget>,
        observer: Arc<dyn HealthObserver>,
        prober: Arc<dyn Prober>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        tokio::spawn(async move {
            run(target, observer, prober, token).await;
        });
        Self { cancel }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for HealthChecker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run(
    target: Arc<dyn HealthTarget>,
    observer: Arc<dyn HealthObserver>,
    prober: Arc<dyn Prober>,
    cancel: CancellationToken,
) {
    tokio::select! {
        _ = cancel.cancelled() => return,
        _ = tokio::time::sleep(INITIAL_DELAY) => {}
    }
    let mut ticker = tokio::time::interval(TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut states: HashMap<String, MappingHealth> = HashMap::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let targets = target.probe_targets().await;
        // Mappings not probed this tick (removed or paused) lose their state, so counting
        // resumes from zero when they come back.
        states.retain(|id, _| targets.iter().any(|(tid, _)| tid == id));
        for (id, hostname) in targets {
            let healthy = prober.probe(&hostname).await;
            let transition = states.entry(id.clone()).or_default().record(healthy);
            match transition {
                Transition::StillHealthy => {}
                Transition::Failure(n) => observer.on_probe(&id, &hostname, false, n).await,
                Transition::Recovered => observer.on_probe(&id, &hostname, true, 0).await,
            }
        }
    }
}

//! Process health plumbing.
//!
//! Two distinct things live here and should not be confused:
//!
//! - [`HealthRegistry`] answers "is this process alive?" for the k8s
//!   liveness probe. Components register and must keep reporting within
//!   their deadline or the probe fails.
//! - [`HealthFlag`] answers "is an external ML backend usable right now?".
//!   Stage gates read it before flushing a batch; a background
//!   [`monitor`] task keeps it current by polling the backend's probe.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComponentStatus {
    /// Registered but has not reported yet.
    Starting,
    /// Healthy until the deadline passes without another report.
    HealthyUntil(time::OffsetDateTime),
    Unhealthy,
}

#[derive(Default, Debug)]
pub struct HealthStatus {
    pub healthy: bool,
    pub components: HashMap<String, String>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let body = format!("{self:?}");
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

/// Handed to a component so it can keep reporting in. Reports must arrive
/// more often than the deadline the component registered with.
#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
}

impl HealthHandle {
    pub fn report_healthy(&self) {
        let until = time::OffsetDateTime::now_utc() + self.deadline;
        self.report(ComponentStatus::HealthyUntil(until));
    }

    pub fn report_unhealthy(&self) {
        self.report(ComponentStatus::Unhealthy);
    }

    fn report(&self, status: ComponentStatus) {
        match self.components.write() {
            Ok(mut map) => {
                map.insert(self.component.clone(), status);
            }
            // A poisoned registry fails the probe on the next read; the
            // process gets restarted rather than limping on.
            Err(_) => warn!(component = %self.component, "health registry poisoned"),
        }
    }
}

#[derive(Clone, Default)]
pub struct HealthRegistry {
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, component: &str, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component: component.to_string(),
            deadline,
            components: self.components.clone(),
        };
        handle.report(ComponentStatus::Starting);
        handle
    }

    /// Overall process status: healthy only when every registered component
    /// reported within its deadline. Usable directly as an axum handler.
    pub fn get_status(&self) -> HealthStatus {
        let Ok(components) = self.components.read() else {
            return HealthStatus::default();
        };

        let now = time::OffsetDateTime::now_utc();
        let mut status = HealthStatus {
            healthy: !components.is_empty(),
            components: HashMap::with_capacity(components.len()),
        };

        for (name, component) in components.iter() {
            let label = match component {
                ComponentStatus::HealthyUntil(until) if *until > now => "healthy",
                ComponentStatus::HealthyUntil(_) => {
                    status.healthy = false;
                    "stalled"
                }
                ComponentStatus::Starting => {
                    status.healthy = false;
                    "starting"
                }
                ComponentStatus::Unhealthy => {
                    status.healthy = false;
                    "unhealthy"
                }
            };
            status.components.insert(name.clone(), label.to_string());
        }

        if !status.healthy {
            warn!(components = ?status.components, "liveness check failed");
        }
        status
    }
}

/// Shared yes/no flag for an external backend, read by stage gates.
/// Starts healthy so a slow first probe does not stall the pipeline.
#[derive(Clone)]
pub struct HealthFlag {
    inner: Arc<AtomicBool>,
}

impl Default for HealthFlag {
    fn default() -> Self {
        HealthFlag::new()
    }
}

impl HealthFlag {
    pub fn new() -> Self {
        HealthFlag {
            inner: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn healthy(&self) -> bool {
        self.inner.load(Ordering::Relaxed)
    }

    pub fn set(&self, healthy: bool) {
        self.inner.store(healthy, Ordering::Relaxed);
    }
}

/// Polls `probe` on an interval and mirrors the answer into `flag` until
/// the token fires.
pub async fn monitor<F, Fut>(
    token: CancellationToken,
    flag: HealthFlag,
    backend: &str,
    interval: Duration,
    probe: F,
) where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                info!(backend, "stopping health monitor");
                return;
            }
            _ = ticker.tick() => {
                let healthy = probe().await;
                if !healthy {
                    warn!(backend, "backend reported unhealthy");
                }
                flag.set(healthy);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn registry_is_unhealthy_until_everyone_reports() {
        let registry = HealthRegistry::new();
        assert!(!registry.get_status().healthy);

        let first = registry.register("consumer", Duration::from_secs(30));
        let second = registry.register("producer", Duration::from_secs(30));
        assert!(!registry.get_status().healthy);

        first.report_healthy();
        assert!(!registry.get_status().healthy);

        second.report_healthy();
        assert!(registry.get_status().healthy);
    }

    #[test]
    fn stale_reports_fail_the_probe() {
        let registry = HealthRegistry::new();
        let handle = registry.register("consumer", Duration::from_secs(30));
        handle.report_healthy();
        assert!(registry.get_status().healthy);

        handle.report(ComponentStatus::HealthyUntil(
            time::OffsetDateTime::now_utc() - time::Duration::seconds(1),
        ));
        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(status.components.get("consumer").unwrap(), "stalled");
    }

    #[test]
    fn unhealthy_report_takes_the_process_down() {
        let registry = HealthRegistry::new();
        let handle = registry.register("consumer", Duration::from_secs(30));
        handle.report_healthy();
        handle.report_unhealthy();
        assert!(!registry.get_status().healthy);
    }

    #[tokio::test]
    async fn monitor_mirrors_the_probe_into_the_flag() {
        let token = CancellationToken::new();
        let flag = HealthFlag::new();
        let probes = Arc::new(AtomicU32::new(0));

        let task = {
            let token = token.clone();
            let flag = flag.clone();
            let probes = probes.clone();
            tokio::spawn(async move {
                monitor(token, flag, "analyzer", Duration::from_millis(20), move || {
                    let probes = probes.clone();
                    async move {
                        // First probe unhealthy, then recovered.
                        probes.fetch_add(1, Ordering::SeqCst) > 0
                    }
                })
                .await;
            })
        };

        // First tick fires immediately and reports unhealthy.
        while flag.healthy() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(probes.load(Ordering::SeqCst) >= 1);

        // Later ticks flip the flag back once the probe recovers.
        while !flag.healthy() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(probes.load(Ordering::SeqCst) >= 2);

        token.cancel();
        task.await.unwrap();
    }
}

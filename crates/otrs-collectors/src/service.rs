//! Service health — unit state from the service manager, optionally folded
//! with a self-check, reported as an ok/degraded/down gauge.

use std::future::Future;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, warn};

use otrs_core::{CollectionError, CollectorResult, Sample, ServiceConfig};

use crate::traits::Collector;

/// `ActiveState` as reported by systemd.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActiveState {
    Active,
    Activating,
    Reloading,
    Deactivating,
    Inactive,
    Failed,
    Unknown,
}

impl ActiveState {
    pub fn parse(s: &str) -> Self {
        match s.trim() {
            "active" => ActiveState::Active,
            "activating" => ActiveState::Activating,
            "reloading" => ActiveState::Reloading,
            "deactivating" => ActiveState::Deactivating,
            "inactive" => ActiveState::Inactive,
            "failed" => ActiveState::Failed,
            _ => ActiveState::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActiveState::Active => "active",
            ActiveState::Activating => "activating",
            ActiveState::Reloading => "reloading",
            ActiveState::Deactivating => "deactivating",
            ActiveState::Inactive => "inactive",
            ActiveState::Failed => "failed",
            ActiveState::Unknown => "unknown",
        }
    }
}

/// Unit state snapshot from the service manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitStatus {
    pub active_state: ActiveState,
    pub sub_state: String,
}

/// Tri-state health of one service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceHealth {
    Ok,
    Degraded,
    Down,
}

impl ServiceHealth {
    /// Gauge encoding: 2 ok, 1 degraded, 0 down.
    pub fn value(&self) -> f64 {
        match self {
            ServiceHealth::Ok => 2.0,
            ServiceHealth::Degraded => 1.0,
            ServiceHealth::Down => 0.0,
        }
    }

    /// Fold the unit state and the optional self-check result.
    pub fn from_status(state: &ActiveState, self_check: Option<bool>) -> Self {
        match state {
            ActiveState::Active => match self_check {
                Some(false) => ServiceHealth::Degraded,
                _ => ServiceHealth::Ok,
            },
            ActiveState::Activating | ActiveState::Reloading | ActiveState::Deactivating => {
                ServiceHealth::Degraded
            }
            ActiveState::Inactive | ActiveState::Failed | ActiveState::Unknown => {
                ServiceHealth::Down
            }
        }
    }
}

/// Access to the service manager.
pub trait ServiceManager: Send + Sync + 'static {
    /// Query the current state of `unit`.
    fn unit_status(
        &self,
        unit: &str,
    ) -> impl Future<Output = Result<UnitStatus, CollectionError>> + Send;

    /// Run a self-check command; `true` means the service answered healthy.
    fn self_check(
        &self,
        command: &[String],
    ) -> impl Future<Output = Result<bool, CollectionError>> + Send;
}

/// [`ServiceManager`] backed by the `systemctl` binary.
#[derive(Debug, Clone, Default)]
pub struct Systemctl;

impl ServiceManager for Systemctl {
    async fn unit_status(&self, unit: &str) -> Result<UnitStatus, CollectionError> {
        let output = Command::new("systemctl")
            .args(["show", unit, "--property=LoadState,ActiveState,SubState"])
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| CollectionError::ServiceUnavailable {
                service: unit.to_string(),
                reason: format!("failed to run systemctl: {e}"),
            })?;

        if !output.status.success() {
            return Err(CollectionError::ServiceUnavailable {
                service: unit.to_string(),
                reason: format!(
                    "systemctl exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        parse_show_output(&String::from_utf8_lossy(&output.stdout))
    }

    async fn self_check(&self, command: &[String]) -> Result<bool, CollectionError> {
        let Some((program, args)) = command.split_first() else {
            return Ok(false);
        };
        let status = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|e| CollectionError::ServiceUnavailable {
                service: program.clone(),
                reason: format!("failed to run self-check: {e}"),
            })?;
        Ok(status.success())
    }
}

/// Parse `systemctl show` `Key=Value` output.
fn parse_show_output(stdout: &str) -> Result<UnitStatus, CollectionError> {
    let mut load_state = None;
    let mut active_state = None;
    let mut sub_state = None;

    for line in stdout.lines() {
        match line.split_once('=') {
            Some(("LoadState", v)) => load_state = Some(v.trim()),
            Some(("ActiveState", v)) => active_state = Some(v.trim()),
            Some(("SubState", v)) => sub_state = Some(v.trim()),
            _ => {}
        }
    }

    let active_state = active_state
        .ok_or_else(|| CollectionError::Parse("systemctl output lacks ActiveState".to_string()))?;

    // systemd reports `inactive` for units it does not know at all.
    let active_state = if load_state == Some("not-found") {
        ActiveState::Unknown
    } else {
        ActiveState::parse(active_state)
    };

    Ok(UnitStatus {
        active_state,
        sub_state: sub_state.unwrap_or("unknown").to_string(),
    })
}

/// Reports the health of the configured services.
pub struct ServiceHealthCollector<M> {
    manager: M,
    services: Vec<ServiceConfig>,
    /// Bound for each service manager call and each self-check.
    call_timeout: Duration,
}

impl<M: ServiceManager> ServiceHealthCollector<M> {
    pub fn new(manager: M, services: Vec<ServiceConfig>, call_timeout: Duration) -> Self {
        Self {
            manager,
            services,
            call_timeout,
        }
    }

    async fn probe(&self, service: &ServiceConfig) -> Result<Vec<Sample>, CollectionError> {
        let unit = service.unit_name();
        let status = tokio::time::timeout(self.call_timeout, self.manager.unit_status(&unit))
            .await
            .map_err(|_| CollectionError::ServiceUnavailable {
                service: service.name.clone(),
                reason: format!("status query timed out after {:?}", self.call_timeout),
            })??;

        let self_check = match (&status.active_state, &service.self_check) {
            (ActiveState::Active, Some(cmd)) => {
                let passed = match tokio::time::timeout(self.call_timeout, self.manager.self_check(cmd)).await {
                    Ok(Ok(passed)) => passed,
                    Ok(Err(e)) => {
                        warn!(service = %service.name, error = %e, "self-check could not run");
                        false
                    }
                    Err(_) => {
                        warn!(service = %service.name, "self-check timed out");
                        false
                    }
                };
                Some(passed)
            }
            _ => None,
        };

        let health = ServiceHealth::from_status(&status.active_state, self_check);
        debug!(
            service = %service.name,
            %unit,
            state = status.active_state.as_str(),
            ?health,
            "service probed"
        );

        let up = if status.active_state == ActiveState::Active { 1.0 } else { 0.0 };
        Ok(vec![
            Sample::gauge("otrs_service_health", health.value())
                .with_label("service", service.name.as_str())
                .with_label("unit", unit.as_str())
                .with_label("active_state", status.active_state.as_str())
                .with_label("sub_state", status.sub_state.as_str()),
            Sample::gauge("otrs_service_up", up).with_label("service", service.name.as_str()),
        ])
    }
}

impl<M: ServiceManager> Collector for ServiceHealthCollector<M> {
    fn name(&self) -> &str {
        "service"
    }

    fn timeout(&self) -> Duration {
        // Status query plus self-check per service, plus slack.
        let calls = (self.services.len() as u32).max(1) * 2;
        self.call_timeout
            .saturating_mul(calls)
            .saturating_add(Duration::from_secs(1))
    }

    async fn collect(&mut self) -> CollectorResult {
        let mut samples = Vec::with_capacity(self.services.len() * 2);
        for service in &self.services {
            samples.extend(self.probe(service).await?);
        }
        Ok(samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Fake service manager with canned states.
    #[derive(Clone, Default)]
    struct FakeManager {
        states: HashMap<String, &'static str>,
        self_check_ok: bool,
        hang_on: Option<String>,
        self_checks: Arc<AtomicU32>,
    }

    impl ServiceManager for FakeManager {
        async fn unit_status(&self, unit: &str) -> Result<UnitStatus, CollectionError> {
            if self.hang_on.as_deref() == Some(unit) {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            match self.states.get(unit) {
                Some(state) => Ok(UnitStatus {
                    active_state: ActiveState::parse(state),
                    sub_state: "running".to_string(),
                }),
                None => Err(CollectionError::ServiceUnavailable {
                    service: unit.to_string(),
                    reason: "no such unit".to_string(),
                }),
            }
        }

        async fn self_check(&self, _command: &[String]) -> Result<bool, CollectionError> {
            self.self_checks.fetch_add(1, Ordering::SeqCst);
            Ok(self.self_check_ok)
        }
    }

    fn services() -> Vec<ServiceConfig> {
        vec![
            ServiceConfig {
                name: "web".to_string(),
                unit: Some("apache2.service".to_string()),
                self_check: None,
            },
            ServiceConfig {
                name: "daemon".to_string(),
                unit: None,
                self_check: Some(vec!["otrs.Daemon.pl".to_string(), "status".to_string()]),
            },
        ]
    }

    fn manager(web: &'static str, daemon: &'static str) -> FakeManager {
        let mut states = HashMap::new();
        states.insert("apache2.service".to_string(), web);
        states.insert("daemon.service".to_string(), daemon);
        FakeManager {
            states,
            self_check_ok: true,
            ..Default::default()
        }
    }

    fn health_of<'a>(samples: &'a [Sample], service: &str) -> &'a Sample {
        samples
            .iter()
            .find(|s| s.name() == "otrs_service_health" && s.labels()["service"] == service)
            .unwrap()
    }

    #[test]
    fn state_mapping() {
        assert_eq!(ServiceHealth::from_status(&ActiveState::Active, None), ServiceHealth::Ok);
        assert_eq!(ServiceHealth::from_status(&ActiveState::Active, Some(true)), ServiceHealth::Ok);
        assert_eq!(
            ServiceHealth::from_status(&ActiveState::Active, Some(false)),
            ServiceHealth::Degraded
        );
        assert_eq!(
            ServiceHealth::from_status(&ActiveState::Activating, None),
            ServiceHealth::Degraded
        );
        assert_eq!(ServiceHealth::from_status(&ActiveState::Failed, None), ServiceHealth::Down);
        assert_eq!(ServiceHealth::from_status(&ActiveState::Inactive, None), ServiceHealth::Down);
        assert_eq!(ServiceHealth::from_status(&ActiveState::Unknown, None), ServiceHealth::Down);
    }

    #[test]
    fn parse_systemctl_show() {
        let status =
            parse_show_output("LoadState=loaded\nActiveState=failed\nSubState=failed\n").unwrap();
        assert_eq!(status.active_state, ActiveState::Failed);
        assert_eq!(status.sub_state, "failed");

        let status =
            parse_show_output("LoadState=not-found\nActiveState=inactive\nSubState=dead\n").unwrap();
        assert_eq!(status.active_state, ActiveState::Unknown);

        assert!(parse_show_output("garbage").is_err());
    }

    #[tokio::test]
    async fn healthy_services() {
        let mut collector =
            ServiceHealthCollector::new(manager("active", "active"), services(), Duration::from_secs(2));
        let samples = collector.collect().await.unwrap();

        assert_eq!(samples.len(), 4);
        let web = health_of(&samples, "web");
        assert_eq!(web.value(), 2.0);
        assert_eq!(web.labels()["active_state"], "active");
        assert_eq!(web.labels()["unit"], "apache2.service");
        assert_eq!(health_of(&samples, "daemon").labels()["unit"], "daemon.service");
        assert!(otrs_core::find_duplicate(&samples).is_none());
    }

    #[tokio::test]
    async fn failing_self_check_degrades_active_service() {
        let mut fake = manager("active", "active");
        fake.self_check_ok = false;
        let checks = Arc::clone(&fake.self_checks);
        let mut collector = ServiceHealthCollector::new(fake, services(), Duration::from_secs(2));

        let samples = collector.collect().await.unwrap();
        assert_eq!(health_of(&samples, "daemon").value(), 1.0);
        assert_eq!(health_of(&samples, "web").value(), 2.0);
        assert_eq!(checks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn self_check_skipped_when_not_active() {
        let fake = manager("active", "failed");
        let checks = Arc::clone(&fake.self_checks);
        let mut collector = ServiceHealthCollector::new(fake, services(), Duration::from_secs(2));

        let samples = collector.collect().await.unwrap();
        assert_eq!(health_of(&samples, "daemon").value(), 0.0);
        let up = samples
            .iter()
            .find(|s| s.name() == "otrs_service_up" && s.labels()["service"] == "daemon")
            .unwrap();
        assert_eq!(up.value(), 0.0);
        assert_eq!(checks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unreachable_manager_fails_cycle() {
        let fake = FakeManager::default();
        let mut collector = ServiceHealthCollector::new(fake, services(), Duration::from_secs(2));
        let err = collector.collect().await.unwrap_err();
        assert!(matches!(err, CollectionError::ServiceUnavailable { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn hung_status_query_times_out() {
        let mut fake = manager("active", "active");
        fake.hang_on = Some("apache2.service".to_string());
        let mut collector = ServiceHealthCollector::new(fake, services(), Duration::from_secs(2));

        let err = collector.collect().await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}

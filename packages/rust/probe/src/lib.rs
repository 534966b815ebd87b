//! Service-readiness probing.
//!
//! Before a pipeline with declared dependencies may run, every dependent
//! service must report healthy. [`ReadinessProber::check_all`] probes all
//! targets concurrently each cycle (bounding wall-clock latency by the
//! slowest single probe, not the sum), repeats on a fixed interval, and
//! returns as soon as every target is healthy within the same cycle or the
//! overall deadline elapses.
//!
//! There is no partial credit: a target that was healthy in an earlier cycle
//! but not the current one does not count, so transient flapping is never
//! masked by stale success.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use reqwest::Client;
use tracing::{debug, info, instrument};

use pipehub_shared::{PipehubError, ReadinessVerdict, Result, ServiceStatus, ServiceTarget};

/// User-Agent string for probe requests.
const USER_AGENT: &str = concat!("pipehub/", env!("CARGO_PKG_VERSION"));

/// Default interval between probe cycles.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// ReadinessProber
// ---------------------------------------------------------------------------

/// Polls service liveness endpoints until all are healthy or a deadline
/// elapses.
#[derive(Debug, Clone)]
pub struct ReadinessProber {
    client: Client,
    poll_interval: Duration,
}

impl ReadinessProber {
    /// Create a prober with the default 1s poll interval.
    pub fn new() -> Result<Self> {
        Self::with_poll_interval(DEFAULT_POLL_INTERVAL)
    }

    /// Create a prober with a custom poll interval.
    pub fn with_poll_interval(poll_interval: Duration) -> Result<Self> {
        // Redirects are not followed: a 3xx response is itself a success
        // signal (200–399), not something to chase.
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| {
                PipehubError::validation(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self {
            client,
            poll_interval,
        })
    }

    /// Probe all targets until every one is healthy in the same cycle, or
    /// `overall_deadline` elapses.
    ///
    /// An empty target list returns an immediately healthy verdict — a
    /// pipeline with no dependencies never blocks on readiness. Targets the
    /// deadline cut off before their first probe completed are reported as
    /// [`ServiceStatus::Unknown`].
    #[instrument(skip_all, fields(targets = targets.len(), deadline_ms = overall_deadline.as_millis() as u64))]
    pub async fn check_all(
        &self,
        targets: &[ServiceTarget],
        overall_deadline: Duration,
    ) -> ReadinessVerdict {
        if targets.is_empty() {
            return ReadinessVerdict::trivially_healthy();
        }

        let start = Instant::now();
        let hard_deadline = tokio::time::Instant::now() + overall_deadline;
        let mut services: BTreeMap<String, ServiceStatus> = targets
            .iter()
            .map(|t| (t.name.clone(), ServiceStatus::Unknown))
            .collect();

        let mut cycle: u32 = 0;
        loop {
            cycle += 1;
            let completed = self
                .run_cycle(targets, &mut services, hard_deadline)
                .await;

            let all_healthy =
                completed && services.values().all(|s| *s == ServiceStatus::Healthy);
            if all_healthy {
                let elapsed = start.elapsed();
                info!(cycles = cycle, elapsed_ms = elapsed.as_millis() as u64, "all services healthy");
                return ReadinessVerdict {
                    services,
                    healthy: true,
                    elapsed,
                };
            }

            let elapsed = start.elapsed();
            if elapsed >= overall_deadline {
                debug!(cycles = cycle, ?services, "readiness deadline elapsed");
                return ReadinessVerdict {
                    services,
                    healthy: false,
                    elapsed,
                };
            }

            let remaining = overall_deadline - elapsed;
            tokio::time::sleep(self.poll_interval.min(remaining)).await;

            if start.elapsed() >= overall_deadline {
                return ReadinessVerdict {
                    services,
                    healthy: false,
                    elapsed: start.elapsed(),
                };
            }
        }
    }

    /// Run one concurrent probe cycle, updating `services` with each probe
    /// that completes before `hard_deadline`. Returns whether the full cycle
    /// completed.
    async fn run_cycle(
        &self,
        targets: &[ServiceTarget],
        services: &mut BTreeMap<String, ServiceStatus>,
        hard_deadline: tokio::time::Instant,
    ) -> bool {
        let (tx, mut rx) = tokio::sync::mpsc::channel(targets.len());

        for target in targets {
            let client = self.client.clone();
            let target = target.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let status = probe_once(&client, &target).await;
                let _ = tx.send((target.name, status)).await;
            });
        }
        drop(tx);

        loop {
            match tokio::time::timeout_at(hard_deadline, rx.recv()).await {
                Ok(Some((name, status))) => {
                    services.insert(name, status);
                }
                // Channel closed: every probe in this cycle reported.
                Ok(None) => return true,
                // Deadline cut the cycle short; unreached targets keep their
                // previous status (Unknown on the first cycle).
                Err(_) => return false,
            }
        }
    }
}

/// Issue a single liveness GET. Any response in 200–399 is healthy; error
/// statuses, timeouts, connection refusal, and DNS failures are unhealthy.
async fn probe_once(client: &Client, target: &ServiceTarget) -> ServiceStatus {
    let response = client
        .get(target.url.clone())
        .timeout(target.probe_timeout)
        .send()
        .await;

    match response {
        Ok(resp) => {
            let status = resp.status();
            if status.is_success() || status.is_redirection() {
                ServiceStatus::Healthy
            } else {
                debug!(service = %target.name, %status, "probe returned error status");
                ServiceStatus::Unhealthy
            }
        }
        Err(e) => {
            debug!(service = %target.name, error = %e, "probe failed");
            ServiceStatus::Unhealthy
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn target(name: &str, base: &str) -> ServiceTarget {
        let url = Url::parse(&format!("{base}/health")).unwrap();
        ServiceTarget::new(
            name,
            url,
            Duration::from_millis(500),
            Duration::from_secs(30),
        )
        .unwrap()
    }

    fn fast_prober() -> ReadinessProber {
        ReadinessProber::with_poll_interval(Duration::from_millis(25)).unwrap()
    }

    #[tokio::test]
    async fn empty_target_list_is_immediately_healthy() {
        let prober = fast_prober();
        let verdict = prober.check_all(&[], Duration::from_secs(60)).await;
        assert!(verdict.healthy);
        assert!(verdict.services.is_empty());
        assert!(verdict.elapsed < Duration::from_millis(10));
    }

    #[tokio::test]
    async fn healthy_services_return_within_first_cycle() {
        let search = MockServer::start().await;
        let ui = MockServer::start().await;
        for server in [&search, &ui] {
            Mock::given(method("GET"))
                .and(path("/health"))
                .respond_with(ResponseTemplate::new(200))
                .mount(server)
                .await;
        }

        let targets = vec![
            target("search-index", &search.uri()),
            target("web-ui", &ui.uri()),
        ];

        let prober = fast_prober();
        let deadline = Duration::from_secs(30);
        let verdict = prober.check_all(&targets, deadline).await;

        assert!(verdict.healthy);
        assert_eq!(verdict.services["search-index"], ServiceStatus::Healthy);
        assert_eq!(verdict.services["web-ui"], ServiceStatus::Healthy);
        // Returned after one round-trip, not the full deadline.
        assert!(verdict.elapsed < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn redirect_status_counts_as_healthy() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(302).insert_header("location", "/elsewhere"))
            .mount(&server)
            .await;

        let prober = fast_prober();
        let verdict = prober
            .check_all(&[target("web-ui", &server.uri())], Duration::from_secs(5))
            .await;
        assert!(verdict.healthy);
    }

    #[tokio::test]
    async fn unhealthy_service_fails_at_deadline() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let prober = fast_prober();
        let verdict = prober
            .check_all(
                &[target("search-index", &server.uri())],
                Duration::from_millis(200),
            )
            .await;

        assert!(!verdict.healthy);
        assert_eq!(verdict.services["search-index"], ServiceStatus::Unhealthy);
        assert!(verdict.elapsed >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn mixed_health_is_overall_unhealthy() {
        let healthy = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&healthy)
            .await;

        let broken = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&broken)
            .await;

        let prober = fast_prober();
        let verdict = prober
            .check_all(
                &[
                    target("web-ui", &healthy.uri()),
                    target("search-index", &broken.uri()),
                ],
                Duration::from_millis(200),
            )
            .await;

        assert!(!verdict.healthy);
        assert_eq!(verdict.services["web-ui"], ServiceStatus::Healthy);
        assert_eq!(verdict.services["search-index"], ServiceStatus::Unhealthy);
    }

    #[tokio::test]
    async fn connection_refused_is_unhealthy() {
        // Port 1 is never listening.
        let url = Url::parse("http://127.0.0.1:1/health").unwrap();
        let refused = ServiceTarget::new(
            "search-index",
            url,
            Duration::from_millis(200),
            Duration::from_secs(5),
        )
        .unwrap();

        let prober = fast_prober();
        let verdict = prober
            .check_all(&[refused], Duration::from_millis(300))
            .await;
        assert!(!verdict.healthy);
        assert_eq!(verdict.services["search-index"], ServiceStatus::Unhealthy);
    }

    #[tokio::test]
    async fn target_never_probed_before_deadline_reports_unknown() {
        // The endpoint answers eventually, but well after the overall
        // deadline; the probe itself would allow the wait.
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/health", server.uri())).unwrap();
        let slow = ServiceTarget::new(
            "search-index",
            url,
            Duration::from_secs(5),
            Duration::from_secs(30),
        )
        .unwrap();

        let prober = fast_prober();
        let verdict = prober.check_all(&[slow], Duration::from_millis(150)).await;
        assert!(!verdict.healthy);
        assert_eq!(verdict.services["search-index"], ServiceStatus::Unknown);
    }

    #[tokio::test]
    async fn transient_success_does_not_mask_flapping() {
        // Service A: healthy on the first probe only, then broken.
        let a = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .up_to_n_times(1)
            .mount(&a)
            .await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&a)
            .await;

        // Service B: broken on the first probe, healthy afterwards.
        let b = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&b)
            .await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&b)
            .await;

        // Each service is healthy in *some* cycle but never both in the same
        // one, so the verdict must be unhealthy.
        let prober = fast_prober();
        let verdict = prober
            .check_all(
                &[target("a", &a.uri()), target("b", &b.uri())],
                Duration::from_millis(300),
            )
            .await;
        assert!(!verdict.healthy);
    }
}

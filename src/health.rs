use std::time::{Duration, Instant};

use tracing::debug;

/// Attempts spent on each candidate by `find_responsive_url`.
const ATTEMPTS_PER_CANDIDATE: u32 = 3;

const BACKOFF_FACTOR: f64 = 1.5;

#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub responsive: bool,
    pub status_code: Option<u16>,
    pub response_time: Duration,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct WaitOptions {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Per-request timeout.
    pub timeout: Duration,
    pub accepted_status_codes: Vec<u16>,
}

impl Default for WaitOptions {
    fn default() -> Self {
        // A dev server answering 404 on `/` is still up.
        let mut accepted: Vec<u16> = (200..=399).collect();
        accepted.push(404);
        Self {
            max_attempts: 30,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            timeout: Duration::from_secs(3),
            accepted_status_codes: accepted,
        }
    }
}

impl WaitOptions {
    pub fn from_config(config: &crate::config::HealthConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_delay: config.initial_delay(),
            max_delay: config.max_delay(),
            timeout: config.timeout(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct WaitOutcome {
    pub success: bool,
    pub attempts: u32,
    pub health: Option<HealthCheck>,
    pub error: Option<String>,
}

/// Polls HTTP endpoints until they answer with an accepted status.
#[derive(Clone, Default)]
pub struct HealthChecker {
    client: reqwest::Client,
}

impl HealthChecker {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_default();
        Self { client }
    }

    /// Single probe with default accepted codes. Never fails; problems are
    /// reported in the result.
    pub async fn check_health(&self, url: &str, timeout: Duration) -> HealthCheck {
        self.probe(url, timeout, &WaitOptions::default().accepted_status_codes)
            .await
    }

    async fn probe(&self, url: &str, timeout: Duration, accepted: &[u16]) -> HealthCheck {
        let started = Instant::now();
        match self.client.get(url).timeout(timeout).send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                let responsive = accepted.contains(&status);
                HealthCheck {
                    responsive,
                    status_code: Some(status),
                    response_time: started.elapsed(),
                    error: (!responsive).then(|| format!("unexpected status {}", status)),
                }
            }
            Err(e) => HealthCheck {
                responsive: false,
                status_code: None,
                response_time: started.elapsed(),
                error: Some(if e.is_timeout() {
                    format!("timed out after {}ms", timeout.as_millis())
                } else {
                    e.to_string()
                }),
            },
        }
    }

    /// Probe `url` until it is responsive or attempts run out. The delay
    /// between attempts grows by 1.5x up to `max_delay`.
    pub async fn wait_for_server(&self, url: &str, options: &WaitOptions) -> WaitOutcome {
        let max_attempts = options.max_attempts.max(1);
        let mut delay = options.initial_delay;
        let mut last = None;

        for attempt in 1..=max_attempts {
            let health = self
                .probe(url, options.timeout, &options.accepted_status_codes)
                .await;
            if health.responsive {
                debug!(url, attempt, "server responsive");
                return WaitOutcome {
                    success: true,
                    attempts: attempt,
                    health: Some(health),
                    error: None,
                };
            }
            debug!(url, attempt, error = ?health.error, "server not ready");
            last = Some(health);
            if attempt < max_attempts {
                tokio::time::sleep(delay).await;
                delay = delay.mul_f64(BACKOFF_FACTOR).min(options.max_delay);
            }
        }

        WaitOutcome {
            success: false,
            attempts: max_attempts,
            error: Some(format!(
                "{} not responsive after {} attempts{}",
                url,
                max_attempts,
                last.as_ref()
                    .and_then(|h| h.error.as_deref())
                    .map(|e| format!(": {}", e))
                    .unwrap_or_default()
            )),
            health: last,
        }
    }

    /// First candidate that becomes responsive, each tried at most three
    /// times.
    pub async fn find_responsive_url(
        &self,
        urls: &[String],
        options: &WaitOptions,
    ) -> Option<(String, WaitOutcome)> {
        let per_candidate = WaitOptions {
            max_attempts: options.max_attempts.clamp(1, ATTEMPTS_PER_CANDIDATE),
            ..options.clone()
        };
        for url in urls {
            let outcome = self.wait_for_server(url, &per_candidate).await;
            if outcome.success {
                return Some((url.clone(), outcome));
            }
        }
        None
    }
}

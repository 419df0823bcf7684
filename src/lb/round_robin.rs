use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::Result;
use crate::error::Error;
use crate::lb::LoadBalancer;
use crate::lb::health::BreakerState;
use crate::lb::host::Host;
use crate::util::lock_unpoisoned;

struct LbState {
    hosts: Vec<Arc<Host>>,
    same_weight: bool,
    cursor: usize,
    probe_interval: Duration,
}

struct WrrInner {
    state: Mutex<LbState>,
    ticker: Mutex<Option<CancellationToken>>,
}

/// How a host looks to the selection pass.
enum Eligibility {
    /// Breaker not open, or a permit just moved it to half-open.
    Selectable,
    /// Open and permit denied, but the last error does not classify as an
    /// outage; usable as a fallback.
    Fallback,
    /// Open, permit denied, and the last status classifies as an outage.
    Skip,
}

fn classify(host: &Host) -> Eligibility {
    let Some(policy) = host.health_policy() else {
        return Eligibility::Selectable;
    };
    if policy.state() != BreakerState::Open {
        return Eligibility::Selectable;
    }
    if policy.try_acquire_permit() {
        return Eligibility::Selectable;
    }
    let (_, is_outage) = host.last_http_error_status();
    if is_outage {
        Eligibility::Skip
    } else {
        Eligibility::Fallback
    }
}

/// Weighted round-robin load balancer with circuit-breaker gating.
///
/// Falls back to plain round-robin when all weights are equal, and to
/// smooth weighted round-robin otherwise. When every host is gated off,
/// the balancer still returns one (a fallback candidate, or the first
/// host) rather than failing the request outright; `NoActiveHost` is only
/// produced for an empty host set.
#[derive(Clone)]
pub struct WeightedRoundRobin {
    inner: Arc<WrrInner>,
}

impl WeightedRoundRobin {
    pub fn new(hosts: Vec<Arc<Host>>) -> Self {
        let balancer = Self {
            inner: Arc::new(WrrInner {
                state: Mutex::new(LbState {
                    hosts: Vec::new(),
                    same_weight: true,
                    cursor: 0,
                    probe_interval: Duration::ZERO,
                }),
                ticker: Mutex::new(None),
            }),
        };
        balancer.refresh(hosts);
        balancer
    }

    fn next_round_robin(state: &mut LbState) -> Arc<Host> {
        let total = state.hosts.len();
        let mut fallback: Option<Arc<Host>> = None;

        for step in 0..total {
            let index = (state.cursor + step) % total;
            let host = &state.hosts[index];
            match classify(host) {
                Eligibility::Selectable => {
                    state.cursor = (index + 1) % total;
                    return host.clone();
                }
                Eligibility::Fallback => {
                    if fallback.is_none() {
                        fallback = Some(host.clone());
                    }
                }
                Eligibility::Skip => {}
            }
        }

        // Everything is gated off; keep traffic flowing through the least
        // suspicious host rather than failing the request outright.
        state.cursor = (state.cursor + 1) % total;
        fallback.unwrap_or_else(|| state.hosts[0].clone())
    }

    fn next_weighted(state: &mut LbState) -> Arc<Host> {
        let mut best: Option<Arc<Host>> = None;
        let mut eligible_total = 0_i64;
        let mut fallback: Option<Arc<Host>> = None;

        for host in &state.hosts {
            match classify(host) {
                Eligibility::Selectable => {
                    host.add_current_weight();
                    eligible_total += host.weight();
                    let is_better = best
                        .as_ref()
                        .is_none_or(|current| host.current_weight() > current.current_weight());
                    if is_better {
                        best = Some(host.clone());
                    }
                }
                Eligibility::Fallback => {
                    if fallback.is_none() {
                        fallback = Some(host.clone());
                    }
                }
                Eligibility::Skip => {}
            }
        }

        match best {
            Some(winner) => {
                winner.reset_current_weight(eligible_total);
                winner
            }
            None => fallback.unwrap_or_else(|| state.hosts[0].clone()),
        }
    }
}

impl LoadBalancer for WeightedRoundRobin {
    fn next(&self) -> Result<Arc<Host>> {
        let mut state = lock_unpoisoned(&self.inner.state);
        if state.hosts.is_empty() {
            return Err(Error::NoActiveHost);
        }
        if state.hosts.len() == 1 {
            return Ok(state.hosts[0].clone());
        }
        if state.same_weight {
            Ok(Self::next_round_robin(&mut state))
        } else {
            Ok(Self::next_weighted(&mut state))
        }
    }

    /// Atomically replace the host set, re-deriving the equal-weights flag,
    /// the total weight, and the minimum probe interval; resets traversal
    /// state.
    fn refresh(&self, hosts: Vec<Arc<Host>>) {
        let mut state = lock_unpoisoned(&self.inner.state);

        let mut same_weight = true;
        let mut last_weight = 0_i64;
        let mut min_interval = Duration::ZERO;

        for (index, host) in hosts.iter().enumerate() {
            let weight = host.weight();
            if index == 0 {
                last_weight = weight;
            } else if same_weight && last_weight != weight {
                same_weight = false;
            }

            host.zero_current_weight();

            if let Some(policy) = host.health_policy() {
                let interval = policy.interval();
                if !interval.is_zero() && (min_interval.is_zero() || min_interval > interval) {
                    min_interval = interval;
                }
            }
        }

        state.hosts = hosts;
        state.same_weight = same_weight;
        state.cursor = 0;
        state.probe_interval = min_interval;
    }

    fn hosts(&self) -> Vec<Arc<Host>> {
        lock_unpoisoned(&self.inner.state).hosts.clone()
    }

    /// Spawn the probe ticker, supervised by `token`. A second invocation
    /// replaces the prior ticker. Probing is disabled when no host carries
    /// a positive interval.
    fn start_health_check(&self, token: &CancellationToken) {
        let interval = lock_unpoisoned(&self.inner.state).probe_interval;
        if interval.is_zero() {
            return;
        }

        let ticker_token = token.child_token();
        {
            let mut ticker = lock_unpoisoned(&self.inner.ticker);
            if let Some(previous) = ticker.replace(ticker_token.clone()) {
                previous.cancel();
            }
        }

        let balancer = self.clone();
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            loop {
                tokio::select! {
                    () = ticker_token.cancelled() => {
                        balancer.close();
                        return;
                    }
                    _ = ticker.tick() => {
                        let hosts = balancer.hosts();
                        debug!(hosts = hosts.len(), "running health checks");
                        for host in hosts {
                            host.check_health().await;
                        }
                    }
                }
            }
        });
    }

    /// Stop the ticker. Hosts stay selectable; their pooled connections
    /// close when the last reference drops.
    fn close(&self) {
        let mut ticker = lock_unpoisoned(&self.inner.ticker);
        if let Some(token) = ticker.take() {
            token.cancel();
        }
    }
}

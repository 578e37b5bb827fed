//! Cost aggregation cycles.
//!
//! A cycle walks `Idle -> Fetching -> Merging -> Idle`, or aborts back to
//! `Idle` once its retry budget is spent. One cycle runs at a time: a timer
//! fire that lands while a cycle is in flight is skipped, not queued.
//!
//! The report window is `[checkpoint, now)`. The checkpoint only advances
//! inside the merge transaction, so an abort — or a crash anywhere between
//! fetch and merge — leaves it untouched and the next cycle re-fetches the
//! same window. Re-merging is safe because samples dedup on
//! `(credential, bucket_start, description)`.
//!
//! The pagination cursor lives only on the stack of a single cycle; it is
//! never persisted.

use crate::billing::{BillingApi, CostReportRow};
use crate::config::AggregationConfig;
use crate::error::BillingError;
use crate::registry::Registry;
use crate::store::{CostSample, StateStore};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Where the current (or last) cycle is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    Idle,
    Fetching,
    Merging,
}

/// What a finished cycle did.
#[derive(Debug)]
pub enum CycleOutcome {
    Completed(CycleReport),
    /// A cycle was already in flight; this trigger did nothing.
    SkippedOverlap,
    /// No active or retired credentials exist; nothing was fetched and the
    /// checkpoint did not move.
    NothingToQuery,
    /// The fetch failed past the attempt cap (or hit a non-retriable
    /// error). The checkpoint is unchanged.
    Failed { attempts: u32, reason: String },
}

#[derive(Debug, Clone)]
pub struct CycleReport {
    pub window_start: i64,
    pub window_end: i64,
    /// Attributed rows returned by the billing API.
    pub fetched: usize,
    /// Rows actually inserted (duplicates from window overlap excluded).
    pub merged: usize,
    /// Rows referencing a credential this process does not manage.
    pub skipped_unknown: usize,
}

/// Result of a manual refresh request.
#[derive(Debug)]
pub enum RefreshOutcome {
    Ran(CycleOutcome),
    /// A cycle completed too recently; wait before triggering another.
    Throttled { seconds_since_last: i64 },
}

/// Timer-driven cost aggregation over the active ∪ retired credential set.
pub struct CostAggregator {
    registry: Arc<Registry>,
    store: Arc<StateStore>,
    billing: Arc<dyn BillingApi>,
    cfg: AggregationConfig,
    phase: Mutex<CyclePhase>,
    /// Cycles that ended `Failed` since the last success. Non-zero means
    /// cost data shown to operators is stale.
    consecutive_failures: AtomicU32,
    last_success: Mutex<Option<i64>>,
}

impl CostAggregator {
    pub fn new(
        registry: Arc<Registry>,
        store: Arc<StateStore>,
        billing: Arc<dyn BillingApi>,
        cfg: AggregationConfig,
    ) -> Self {
        Self {
            registry,
            store,
            billing,
            cfg,
            phase: Mutex::new(CyclePhase::Idle),
            consecutive_failures: AtomicU32::new(0),
            last_success: Mutex::new(None),
        }
    }

    /// True when the last cycle aborted past its retry budget and no
    /// success has happened since.
    pub fn is_stale(&self) -> bool {
        self.consecutive_failures.load(Ordering::Relaxed) > 0
    }

    /// Epoch seconds of the last completed cycle, if any this process life.
    pub fn last_success(&self) -> Option<i64> {
        *self.last_success.lock()
    }

    pub fn phase(&self) -> CyclePhase {
        *self.phase.lock()
    }

    /// Run one aggregation cycle at logical time `now`.
    pub async fn run_cycle(&self, now: i64) -> CycleOutcome {
        {
            let mut phase = self.phase.lock();
            if *phase != CyclePhase::Idle {
                return CycleOutcome::SkippedOverlap;
            }
            *phase = CyclePhase::Fetching;
        }

        let outcome = self.cycle_inner(now).await;
        *self.phase.lock() = CyclePhase::Idle;

        match &outcome {
            CycleOutcome::Completed(report) => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
                *self.last_success.lock() = Some(now);
                tracing::info!(
                    merged = report.merged,
                    fetched = report.fetched,
                    skipped = report.skipped_unknown,
                    window_end = report.window_end,
                    "aggregation cycle completed"
                );
            }
            CycleOutcome::Failed { attempts, reason } => {
                self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(attempts = *attempts, reason = %reason, "aggregation cycle aborted");
            }
            CycleOutcome::NothingToQuery => {
                tracing::debug!("no credentials to query; cycle skipped");
            }
            CycleOutcome::SkippedOverlap => {}
        }
        outcome
    }

    /// Manual trigger with a cool-down so operators cannot hammer the
    /// billing API between scheduled cycles.
    pub async fn manual_refresh(&self, now: i64) -> RefreshOutcome {
        if let Some(last) = self.last_success() {
            let elapsed = now - last;
            if elapsed < self.cfg.refresh_cooldown_secs as i64 {
                return RefreshOutcome::Throttled {
                    seconds_since_last: elapsed,
                };
            }
        }
        RefreshOutcome::Ran(self.run_cycle(now).await)
    }

    /// Scheduled loop. Runs until the task is aborted at shutdown; an
    /// abandoned in-flight cycle persists nothing because the checkpoint
    /// moves only inside the merge transaction.
    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.cfg.interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            self.run_cycle(Utc::now().timestamp()).await;
        }
    }

    async fn cycle_inner(&self, now: i64) -> CycleOutcome {
        let window_start = match self.store.checkpoint() {
            Ok(Some(checkpoint)) => checkpoint,
            Ok(None) => now - self.cfg.initial_lookback_secs as i64,
            Err(e) => {
                return CycleOutcome::Failed {
                    attempts: 0,
                    reason: format!("checkpoint read failed: {e}"),
                }
            }
        };
        if window_start >= now {
            return CycleOutcome::Completed(CycleReport {
                window_start,
                window_end: window_start,
                fetched: 0,
                merged: 0,
                skipped_unknown: 0,
            });
        }

        let queryable = self.registry.queryable_credentials();
        if queryable.is_empty() {
            return CycleOutcome::NothingToQuery;
        }

        // Fetching, with bounded exponential backoff between attempts.
        let mut attempt = 0u32;
        let rows = loop {
            attempt += 1;
            match self.fetch_window(window_start, now).await {
                Ok(rows) => break rows,
                Err(e) if e.is_retriable() && attempt < self.cfg.max_attempts => {
                    let delay = self.backoff_delay(attempt);
                    tracing::warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "cost report fetch failed; backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return CycleOutcome::Failed {
                        attempts: attempt,
                        reason: e.to_string(),
                    }
                }
            }
        };

        *self.phase.lock() = CyclePhase::Merging;

        // Attribute remote rows to local credentials: by billing-side id
        // when the operator recorded one, or by the value itself.
        let mut by_id: HashMap<String, String> = HashMap::new();
        for view in self.registry.list_credentials() {
            if let Some(remote_id) = &view.remote_id {
                by_id.insert(remote_id.clone(), view.value.clone());
            }
            by_id.insert(view.value.clone(), view.value.clone());
        }

        let mut samples = Vec::new();
        let mut skipped_unknown = 0usize;
        let fetched = rows.len();
        for row in rows {
            if row.amount == 0.0 {
                continue;
            }
            let Some(credential) = by_id.get(&row.credential_id) else {
                skipped_unknown += 1;
                continue;
            };
            samples.push(CostSample {
                credential: credential.clone(),
                bucket_start: row.bucket_start,
                bucket_end: row.bucket_end,
                amount: row.amount,
                currency: row.currency,
                description: row.description,
            });
        }

        let merged = match self.store.merge_samples(&samples, now) {
            Ok(n) => n,
            Err(e) => {
                return CycleOutcome::Failed {
                    attempts: attempt,
                    reason: format!("merge failed: {e}"),
                }
            }
        };

        CycleOutcome::Completed(CycleReport {
            window_start,
            window_end: now,
            fetched,
            merged,
            skipped_unknown,
        })
    }

    /// Fetch every page of the window. The cursor is cycle-local.
    async fn fetch_window(&self, since: i64, until: i64) -> Result<Vec<CostReportRow>, BillingError> {
        let mut rows = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self
                .billing
                .fetch_cost_report(since, until, cursor.as_deref())
                .await?;
            rows.extend(page.rows);
            match page.next_page {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(rows)
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self
            .cfg
            .backoff_base_ms
            .saturating_mul(1u64 << (attempt - 1).min(16));
        Duration::from_millis(exp.min(self.cfg.backoff_cap_ms))
    }

    #[cfg(test)]
    fn force_phase(&self, phase: CyclePhase) {
        *self.phase.lock() = phase;
    }
}

//! Observing session: schedule, execute, reschedule

use crate::artifacts::PlanArtifacts;
use crate::clock::{self, SharedClock};
use crate::executor::{CancelToken, PassExecutor, PassReport, PassState};
use crate::scheduler::PassScheduler;
use crate::{CatalogEntry, PassPlan};
use chrono::{DateTime, Utc};
use tokio::sync::watch;

/// Runs every pass of a plan in order, then plans the next window
pub struct PassSession {
    scheduler: PassScheduler,
    executor: PassExecutor,
    clock: SharedClock,
    artifacts: Option<PlanArtifacts>,
    plan: watch::Sender<PassPlan>,
}

impl PassSession {
    pub fn new(scheduler: PassScheduler, executor: PassExecutor, clock: SharedClock) -> Self {
        let now = clock.now();
        let (plan, _) = watch::channel(PassPlan::empty(now, now));
        Self {
            scheduler,
            executor,
            clock,
            artifacts: None,
            plan,
        }
    }

    /// Save every new plan to these files
    pub fn with_artifacts(mut self, artifacts: PlanArtifacts) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    pub fn executor(&self) -> &PassExecutor {
        &self.executor
    }

    /// The plan currently being executed
    pub fn plan_watch(&self) -> watch::Receiver<PassPlan> {
        self.plan.subscribe()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.executor.cancel_token()
    }

    /// Schedule and execute windows until cancelled
    pub async fn run(&self, catalog: &[CatalogEntry]) {
        let cancel = self.executor.cancel_token();
        while !cancel.is_cancelled() {
            let plan = self.scheduler.build_plan(catalog, self.clock.now()).await;
            self.plan.send_replace(plan.clone());

            if let Some(artifacts) = &self.artifacts {
                if let Err(e) = artifacts.save(&plan).await {
                    tracing::warn!("Could not save plan artifacts: {}", e);
                }
            }

            if plan.is_empty() {
                tracing::info!("No passes before {}", plan.window_end);
            } else {
                let reports = self.run_plan(&plan).await;
                log_summary(&reports);
            }

            tracing::info!("Waiting for the next observing window at {}", plan.window_end);
            if !self.wait_until(plan.window_end, &cancel).await {
                break;
            }
        }
        tracing::info!("Session stopped");
    }

    /// Execute the passes of `plan` in start order
    ///
    /// A pass that has already ended is skipped. An aborted pass never delays the next one,
    /// which still begins pre-positioning at its own lead time.
    pub async fn run_plan(&self, plan: &PassPlan) -> Vec<PassReport> {
        let cancel = self.executor.cancel_token();
        let lead = self.executor.config().lead_time();
        let mut reports = Vec::new();

        for pass in plan.iter() {
            if cancel.is_cancelled() {
                break;
            }
            if self.clock.now() >= pass.end {
                tracing::warn!("Skipping pass {}: already over", pass.id());
                continue;
            }
            tracing::info!(
                "Next pass {} ({}) at {}, max elevation {:.1}°",
                pass.object.name,
                pass.id(),
                pass.start,
                pass.max_elevation_deg
            );
            if !self.wait_until(pass.pre_position_at(lead), &cancel).await {
                break;
            }
            reports.push(self.executor.execute(pass).await);
        }
        reports
    }

    /// Sleep until `at`; false if cancelled first
    async fn wait_until(&self, at: DateTime<Utc>, cancel: &CancelToken) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(clock::until(&*self.clock, at)) => true,
            _ = cancel.cancelled() => false,
        }
    }
}

fn log_summary(reports: &[PassReport]) {
    let completed = reports.iter().filter(|r| r.state == PassState::Completed).count();
    let images: u64 = reports.iter().map(|r| r.images_saved).sum();
    tracing::info!(
        "Plan finished: {}/{} passes completed, {} images saved",
        completed,
        reports.len(),
        images
    );
    for report in reports.iter().filter(|r| r.state == PassState::Aborted) {
        tracing::warn!(
            "Pass {} aborted: {}",
            report.pass_id,
            report.abort_reason.as_deref().unwrap_or("unknown")
        );
    }
}

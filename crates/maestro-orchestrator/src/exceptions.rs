use crate::collaboration::CollaborationBus;
use crate::config::EngineConfig;
use crate::scheduler::{FailureReport, Scheduler};
use crate::store::TaskStore;
use chrono::Utc;
use maestro_agent::WorkerPool;
use maestro_core::event::now_ms;
use maestro_core::{
    EngineEvent, ExceptionEvent, ExceptionKind, ExceptionRecord, ExceptionStatus, HumanDecision,
    InterventionTicket, MaestroError, MaestroResult, MessageKind, Resolution, Severity,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

/// Per-kind, per-severity, and per-status counts for observability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExceptionStats {
    /// Total records ever created.
    pub total: usize,
    /// Counts keyed by exception kind.
    pub by_kind: HashMap<String, usize>,
    /// Counts keyed by severity.
    pub by_severity: HashMap<String, usize>,
    /// Counts keyed by lifecycle status.
    pub by_status: HashMap<String, usize>,
}

/// Classifies failures and applies remediation.
///
/// The single authority deciding retry vs. skip vs. reassign vs. abort vs.
/// escalate vs. await-human. Records are append-only; they are never deleted,
/// preserving the audit trail.
pub struct ExceptionHandler {
    config: EngineConfig,
    store: Arc<RwLock<TaskStore>>,
    pool: Arc<WorkerPool>,
    scheduler: Arc<Scheduler>,
    collab: Arc<CollaborationBus>,
    records: RwLock<Vec<ExceptionRecord>>,
    auto_retries: Mutex<HashMap<(Uuid, Uuid), u32>>,
    event_tx: mpsc::UnboundedSender<EngineEvent>,
}

impl ExceptionHandler {
    /// Create a handler wired to the scheduler and collaboration bus.
    pub fn new(
        config: EngineConfig,
        store: Arc<RwLock<TaskStore>>,
        pool: Arc<WorkerPool>,
        scheduler: Arc<Scheduler>,
        collab: Arc<CollaborationBus>,
        event_tx: mpsc::UnboundedSender<EngineEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            pool,
            scheduler,
            collab,
            records: RwLock::new(Vec::new()),
            auto_retries: Mutex::new(HashMap::new()),
            event_tx,
        })
    }

    /// Record a failure and apply the remediation policy.
    ///
    /// Returns the id of the new exception record.
    pub async fn handle_failure(self: &Arc<Self>, report: FailureReport) -> Uuid {
        let record = ExceptionRecord::new(
            report.kind,
            report.severity,
            report.task_id,
            report.sub_task_id,
            report.worker_id,
            report.message.clone(),
        );
        let record_id = record.id;

        warn!(
            exception_id = %record_id,
            kind = %report.kind,
            severity = %report.severity,
            sub_task_id = %report.sub_task_id,
            "Exception recorded"
        );
        self.records.write().await.push(record);
        self.emit(ExceptionEvent::ExceptionOccurred {
            timestamp: now_ms(),
            exception_id: record_id,
            kind: report.kind,
            severity: report.severity,
            task_id: report.task_id,
            sub_task_id: report.sub_task_id,
        });

        if self.requires_human(report.kind, report.severity) {
            self.request_intervention(record_id, &report, None).await;
        } else {
            self.auto_resolve(record_id, report).await;
        }
        record_id
    }

    /// Whether a failure must go to a human: always for critical, at or
    /// above the configured threshold, and unconditionally for validation
    /// and resource-unavailable failures regardless of severity.
    fn requires_human(&self, kind: ExceptionKind, severity: Severity) -> bool {
        severity == Severity::Critical
            || severity >= self.config.escalation_threshold
            || matches!(
                kind,
                ExceptionKind::ValidationError | ExceptionKind::ResourceUnavailable
            )
    }

    /// Automatic strategy selection, evaluated in order: auto-retry while
    /// below the ceiling, then a severity branch (skip / reassign /
    /// escalate).
    async fn auto_resolve(self: &Arc<Self>, record_id: Uuid, report: FailureReport) {
        self.set_status(record_id, ExceptionStatus::Resolving).await;

        let key = (report.task_id, report.sub_task_id);
        let count = *self.auto_retries.lock().await.get(&key).unwrap_or(&0);
        let retryable_kind = matches!(
            report.kind,
            ExceptionKind::TaskFailure | ExceptionKind::AgentError
        ) || (report.kind == ExceptionKind::TaskTimeout
            && self.config.auto_retry_on_timeout);

        if retryable_kind && count < self.config.max_auto_retries {
            *self.auto_retries.lock().await.entry(key).or_insert(0) += 1;
            let delay_ms = self.config.auto_retry_delay_ms * u64::from(count + 1);
            info!(
                exception_id = %record_id,
                sub_task_id = %report.sub_task_id,
                attempt = count + 1,
                delay_ms,
                "Auto-retry scheduled"
            );
            self.resolve(record_id, "auto_retry", "auto", None).await;

            // Keep the original assignment so the same worker tries first;
            // the score bump de-prioritizes repeat offenders.
            let scheduler = Arc::clone(&self.scheduler);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                if let Err(e) = scheduler
                    .resubmit(
                        report.task_id,
                        report.sub_task_id,
                        report.worker_id,
                        (report.retry_count + 1) as i32,
                        false,
                    )
                    .await
                {
                    warn!(error = %e, "Auto-retry resubmission failed");
                }
            });
            return;
        }

        match report.severity {
            Severity::Low => {
                info!(exception_id = %record_id, "Skipping failed sub-task");
                if let Err(e) = self
                    .scheduler
                    .mark_failed_terminal(report.task_id, report.sub_task_id, &report.message)
                    .await
                {
                    warn!(error = %e, "Skip failed");
                }
                self.resolve(record_id, "skip", "auto", None).await;
            }
            Severity::Medium => {
                // One reassignment after the retry budget; a sub-task that
                // keeps failing across workers goes to a human instead of
                // bouncing between them forever.
                if count > self.config.max_auto_retries {
                    self.request_intervention(
                        record_id,
                        &report,
                        Some("automatic remediation exhausted"),
                    )
                    .await;
                    return;
                }
                let exclude: Vec<Uuid> = report.worker_id.into_iter().collect();
                let required = {
                    let store = self.store.read().await;
                    store
                        .sub_task(report.sub_task_id)
                        .map(|s| s.required_skills.clone())
                        .unwrap_or_default()
                };
                match self.pool.pick_idle(&required, &exclude).await {
                    Some(worker_id) => {
                        *self.auto_retries.lock().await.entry(key).or_insert(0) += 1;
                        info!(
                            exception_id = %record_id,
                            worker_id = %worker_id,
                            "Reassigning failed sub-task"
                        );
                        if let Err(e) = self
                            .scheduler
                            .resubmit(
                                report.task_id,
                                report.sub_task_id,
                                Some(worker_id),
                                (report.retry_count + 1) as i32,
                                false,
                            )
                            .await
                        {
                            warn!(error = %e, "Reassignment failed");
                        }
                        self.resolve(
                            record_id,
                            "reassign",
                            "auto",
                            Some(format!("reassigned to worker {worker_id}")),
                        )
                        .await;
                    }
                    None => {
                        self.request_intervention(
                            record_id,
                            &report,
                            Some("no idle worker available for reassignment"),
                        )
                        .await;
                    }
                }
            }
            Severity::High | Severity::Critical => {
                if self.config.auto_escalate {
                    self.set_status(record_id, ExceptionStatus::Escalated).await;
                    self.open_ticket(record_id).await;
                    self.emit(ExceptionEvent::HumanInterventionRequired {
                        timestamp: now_ms(),
                        exception_id: record_id,
                        severity: report.severity,
                    });
                    warn!(exception_id = %record_id, "Exception escalated");
                } else {
                    self.request_intervention(record_id, &report, None).await;
                }
            }
        }
    }

    /// Open a human-intervention ticket: pause the owning task when
    /// configured for critical severity, and notify up to two other workers
    /// over the collaboration bus.
    async fn request_intervention(
        self: &Arc<Self>,
        record_id: Uuid,
        report: &FailureReport,
        note: Option<&str>,
    ) {
        self.open_ticket(record_id).await;

        if self.config.pause_on_critical && report.severity == Severity::Critical {
            if let Err(e) = self
                .scheduler
                .pause(
                    report.task_id,
                    format!("critical exception: {}", report.message),
                    true,
                )
                .await
            {
                warn!(error = %e, "Pause on critical failed");
            }
        }

        if let Some(from) = report.worker_id {
            let others: Vec<Uuid> = self
                .pool
                .snapshot()
                .await
                .iter()
                .map(|w| w.id)
                .filter(|id| *id != from)
                .take(2)
                .collect();
            if !others.is_empty() {
                let mut content = format!(
                    "A sub-task hit a {} {}: {}. An operator decision is needed.",
                    report.severity, report.kind, report.message
                );
                if let Some(note) = note {
                    content.push_str(&format!(" ({note})"));
                }
                let (_, errors) = self
                    .collab
                    .broadcast(
                        from,
                        &others,
                        MessageKind::Notification,
                        &content,
                        Some(report.task_id),
                    )
                    .await;
                for e in errors {
                    warn!(error = %e, "Intervention notification failed");
                }
            }
        }

        self.emit(ExceptionEvent::HumanInterventionRequired {
            timestamp: now_ms(),
            exception_id: record_id,
            severity: report.severity,
        });
        warn!(
            exception_id = %record_id,
            sub_task_id = %report.sub_task_id,
            "Human intervention required"
        );
    }

    /// Apply a human decision to an exception awaiting intervention.
    ///
    /// A manual retry resets the automatic retry counter before
    /// resubmitting.
    pub async fn respond(
        self: &Arc<Self>,
        exception_id: Uuid,
        decision: HumanDecision,
        responded_by: &str,
        notes: Option<String>,
    ) -> MaestroResult<()> {
        let (task_id, sub_task_id, worker_id, message) = {
            let mut records = self.records.write().await;
            let record = records
                .iter_mut()
                .find(|r| r.id == exception_id)
                .ok_or_else(|| {
                    MaestroError::Exception(format!("unknown exception {exception_id}"))
                })?;
            if record.status == ExceptionStatus::Resolved {
                return Err(MaestroError::Exception(format!(
                    "exception {exception_id} is already resolved"
                )));
            }
            let ticket = record.intervention.as_mut().ok_or_else(|| {
                MaestroError::Exception(format!(
                    "exception {exception_id} does not await intervention"
                ))
            })?;
            if ticket.decision.is_some() {
                return Err(MaestroError::Exception(format!(
                    "exception {exception_id} already has a decision"
                )));
            }
            ticket.decision = Some(decision);
            ticket.responded_by = Some(responded_by.to_string());
            ticket.notes = notes.clone();
            ticket.responded_at = Some(Utc::now());
            record.status = ExceptionStatus::Resolving;
            (
                record.task_id,
                record.sub_task_id,
                record.worker_id,
                record.message.clone(),
            )
        };

        self.emit(ExceptionEvent::HumanInterventionResponded {
            timestamp: now_ms(),
            exception_id,
            decision,
            responded_by: responded_by.to_string(),
        });
        info!(
            exception_id = %exception_id,
            decision = %decision,
            responded_by,
            "Human intervention response"
        );

        match decision {
            HumanDecision::Retry => {
                self.auto_retries
                    .lock()
                    .await
                    .remove(&(task_id, sub_task_id));
                self.scheduler
                    .resubmit(task_id, sub_task_id, None, 0, true)
                    .await?;
            }
            HumanDecision::Skip => {
                self.scheduler
                    .mark_failed_terminal(task_id, sub_task_id, &message)
                    .await?;
            }
            HumanDecision::Abort => {
                if !self.scheduler.abort_running(sub_task_id).await {
                    self.scheduler
                        .mark_failed_terminal(task_id, sub_task_id, "aborted by operator")
                        .await?;
                }
            }
            HumanDecision::Reassign => {
                let exclude: Vec<Uuid> = worker_id.into_iter().collect();
                let required = {
                    let store = self.store.read().await;
                    store
                        .sub_task(sub_task_id)
                        .map(|s| s.required_skills.clone())
                        .unwrap_or_default()
                };
                let worker = self.pool.pick_idle(&required, &exclude).await.ok_or_else(|| {
                    MaestroError::Exception("no idle worker available for reassignment".into())
                })?;
                self.scheduler
                    .resubmit(task_id, sub_task_id, Some(worker), 1, false)
                    .await?;
            }
        }

        self.resolve(exception_id, &decision.to_string(), responded_by, notes)
            .await;
        Ok(())
    }

    /// Move a pending record to acknowledged.
    pub async fn acknowledge(&self, exception_id: Uuid) -> MaestroResult<()> {
        {
            let mut records = self.records.write().await;
            let record = records
                .iter_mut()
                .find(|r| r.id == exception_id)
                .ok_or_else(|| {
                    MaestroError::Exception(format!("unknown exception {exception_id}"))
                })?;
            if record.status != ExceptionStatus::Pending {
                return Err(MaestroError::Exception(format!(
                    "exception {exception_id} is not pending"
                )));
            }
            record.status = ExceptionStatus::Acknowledged;
        }
        self.emit(ExceptionEvent::ExceptionAcknowledged {
            timestamp: now_ms(),
            exception_id,
        });
        Ok(())
    }

    /// Stop dispatching new work for a task, recording the reason.
    pub async fn pause_task(&self, task_id: Uuid, reason: impl Into<String>) -> MaestroResult<()> {
        self.scheduler.pause(task_id, reason, true).await
    }

    /// Clear a pause and trigger a fresh dispatch pass.
    pub async fn resume_task(&self, task_id: Uuid) -> MaestroResult<()> {
        self.scheduler.resume(task_id).await
    }

    /// Unresolved pending records, most severe first.
    pub async fn pending(&self) -> Vec<ExceptionRecord> {
        let records = self.records.read().await;
        let mut pending: Vec<ExceptionRecord> = records
            .iter()
            .filter(|r| {
                matches!(
                    r.status,
                    ExceptionStatus::Pending | ExceptionStatus::Acknowledged
                )
            })
            .cloned()
            .collect();
        pending.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then(a.created_at.cmp(&b.created_at))
        });
        pending
    }

    /// Records still waiting for a human decision.
    pub async fn interventions(&self) -> Vec<ExceptionRecord> {
        let records = self.records.read().await;
        records.iter().filter(|r| r.awaiting_human()).cloned().collect()
    }

    /// A single record by id.
    pub async fn get(&self, exception_id: Uuid) -> Option<ExceptionRecord> {
        let records = self.records.read().await;
        records.iter().find(|r| r.id == exception_id).cloned()
    }

    /// Every record, in creation order.
    pub async fn all(&self) -> Vec<ExceptionRecord> {
        self.records.read().await.clone()
    }

    /// Per-kind/severity/status counts.
    pub async fn stats(&self) -> ExceptionStats {
        let records = self.records.read().await;
        let mut by_kind: HashMap<String, usize> = HashMap::new();
        let mut by_severity: HashMap<String, usize> = HashMap::new();
        let mut by_status: HashMap<String, usize> = HashMap::new();
        for record in records.iter() {
            *by_kind.entry(record.kind.to_string()).or_insert(0) += 1;
            *by_severity.entry(record.severity.to_string()).or_insert(0) += 1;
            let status = match record.status {
                ExceptionStatus::Pending => "pending",
                ExceptionStatus::Acknowledged => "acknowledged",
                ExceptionStatus::Resolving => "resolving",
                ExceptionStatus::Resolved => "resolved",
                ExceptionStatus::Escalated => "escalated",
            };
            *by_status.entry(status.to_string()).or_insert(0) += 1;
        }
        ExceptionStats {
            total: records.len(),
            by_kind,
            by_severity,
            by_status,
        }
    }

    async fn set_status(&self, exception_id: Uuid, status: ExceptionStatus) {
        let mut records = self.records.write().await;
        if let Some(record) = records.iter_mut().find(|r| r.id == exception_id) {
            record.status = status;
        }
    }

    async fn open_ticket(&self, exception_id: Uuid) {
        let mut records = self.records.write().await;
        if let Some(record) = records.iter_mut().find(|r| r.id == exception_id) {
            if record.intervention.is_none() {
                record.intervention = Some(InterventionTicket::open());
            }
            // A record that fell back from automatic resolution waits as
            // pending, not resolving.
            if record.status == ExceptionStatus::Resolving {
                record.status = ExceptionStatus::Pending;
            }
        }
    }

    async fn resolve(&self, exception_id: Uuid, action: &str, by: &str, notes: Option<String>) {
        {
            let mut records = self.records.write().await;
            if let Some(record) = records.iter_mut().find(|r| r.id == exception_id) {
                record.status = ExceptionStatus::Resolved;
                record.resolution = Some(Resolution {
                    action: action.to_string(),
                    resolved_by: by.to_string(),
                    notes,
                    resolved_at: Utc::now(),
                });
            }
        }
        self.emit(ExceptionEvent::ExceptionResolved {
            timestamp: now_ms(),
            exception_id,
            action: action.to_string(),
        });
    }

    fn emit(&self, event: ExceptionEvent) {
        let _ = self.event_tx.send(EngineEvent::Exception(event));
    }
}

use crate::store::TaskStore;
use chrono::{DateTime, Utc};
use maestro_agent::{WorkerBackend, WorkerPool};
use maestro_core::{MaestroError, MaestroResult, Message, SubTaskStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

/// Export encodings of an aggregated report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    /// The canonical Markdown report.
    Markdown,
    /// An HTML rendering derived from the Markdown.
    Html,
    /// The full result as pretty-printed JSON.
    Json,
}

/// Overall outcome of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    /// Every sub-task completed.
    Completed,
    /// A mix of completed and failed sub-tasks.
    Partial,
    /// Every sub-task failed.
    Failed,
}

/// Outcome counts and durations for one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMetrics {
    /// Total sub-tasks in the plan.
    pub total_sub_tasks: usize,
    /// Sub-tasks that completed.
    pub completed_sub_tasks: usize,
    /// Sub-tasks that failed.
    pub failed_sub_tasks: usize,
    /// `round(completed / total * 100)`.
    pub success_rate: u8,
    /// Sum of sub-task wall-clock durations, in milliseconds.
    pub total_duration_ms: i64,
    /// Average duration across sub-tasks that ran, in milliseconds.
    pub avg_duration_ms: i64,
}

/// Per-sub-task outcome in the report breakdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubTaskReport {
    /// The sub-task.
    pub id: Uuid,
    /// Its title.
    pub title: String,
    /// Terminal status.
    pub status: SubTaskStatus,
    /// Display name of the assigned worker, when resolvable.
    pub worker_name: Option<String>,
    /// Wall-clock duration, when the sub-task ran.
    pub duration_ms: Option<i64>,
    /// Result text (or the human-readable error left on failure).
    pub result: Option<String>,
    /// Error message, on failure.
    pub error: Option<String>,
    /// Times the sub-task was resubmitted.
    pub retry_count: u32,
}

/// The compiled outcome of a terminal task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedResult {
    /// The aggregated task.
    pub task_id: Uuid,
    /// Overall outcome.
    pub status: OverallStatus,
    /// Short natural-language summary.
    pub summary: String,
    /// The full Markdown report.
    pub report: String,
    /// Per-sub-task breakdown, in plan order.
    pub sub_tasks: Vec<SubTaskReport>,
    /// Outcome metrics.
    pub metrics: TaskMetrics,
    /// When the task was submitted.
    pub created_at: DateTime<Utc>,
    /// When the task settled.
    pub completed_at: Option<DateTime<Utc>>,
}

struct CachedReport {
    result: AggregatedResult,
    html: String,
    json: String,
}

/// Compiles sub-task outcomes into metrics and a structured report.
///
/// Aggregation runs once a task is terminal; re-running regenerates and
/// overwrites the cached result. All three exports are produced together so
/// callers can request any format without recomputation.
pub struct ResultAggregator {
    store: Arc<RwLock<TaskStore>>,
    pool: Arc<WorkerPool>,
    cache: RwLock<HashMap<Uuid, CachedReport>>,
    summarizer: Option<Arc<dyn WorkerBackend>>,
}

impl ResultAggregator {
    /// Create an aggregator over the shared store and pool.
    pub fn new(store: Arc<RwLock<TaskStore>>, pool: Arc<WorkerPool>) -> Self {
        Self {
            store,
            pool,
            cache: RwLock::new(HashMap::new()),
            summarizer: None,
        }
    }

    /// Use a worker backend to phrase the summary; the deterministic
    /// template remains the fallback on any backend error.
    pub fn with_summarizer(mut self, backend: Arc<dyn WorkerBackend>) -> Self {
        self.summarizer = Some(backend);
        self
    }

    /// Build (or rebuild) the aggregated result for a terminal task.
    pub async fn aggregate(&self, task_id: Uuid) -> MaestroResult<AggregatedResult> {
        let (description, created_at, completed_at, breakdown) = {
            let store = self.store.read().await;
            let task = store.task(task_id).ok_or_else(|| {
                MaestroError::Aggregation(format!("unknown task {task_id}"))
            })?;
            if !task.status.is_terminal() {
                return Err(MaestroError::Aggregation(format!(
                    "task {task_id} has not reached a terminal state"
                )));
            }

            let mut breakdown = Vec::new();
            for sub in store.sub_tasks_of(task_id) {
                let worker_name = match sub.assigned_worker {
                    Some(worker_id) => self.pool.get(worker_id).await.map(|w| w.name),
                    None => None,
                };
                breakdown.push(SubTaskReport {
                    id: sub.id,
                    title: sub.title.clone(),
                    status: sub.status,
                    worker_name,
                    duration_ms: sub.duration_ms(),
                    result: sub.result.clone(),
                    error: sub.error.clone(),
                    retry_count: sub.retry_count,
                });
            }
            (
                task.description.clone(),
                task.created_at,
                task.completed_at,
                breakdown,
            )
        };

        let metrics = compute_metrics(&breakdown);
        let status = if metrics.completed_sub_tasks == metrics.total_sub_tasks {
            OverallStatus::Completed
        } else if metrics.failed_sub_tasks == metrics.total_sub_tasks {
            OverallStatus::Failed
        } else {
            OverallStatus::Partial
        };

        let template_summary = template_summary(&description, &metrics);
        let summary = match &self.summarizer {
            Some(backend) => {
                let prompt = format!(
                    "Rephrase this task outcome as one short sentence:\n{template_summary}"
                );
                match backend.chat(&[Message::user(prompt)]).await {
                    Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
                    Ok(_) => template_summary.clone(),
                    Err(e) => {
                        warn!(error = %e, "Summarizer failed, using template summary");
                        template_summary.clone()
                    }
                }
            }
            None => template_summary.clone(),
        };

        let report = render_markdown(
            task_id,
            &description,
            created_at,
            completed_at,
            status,
            &summary,
            &metrics,
            &breakdown,
        );

        let result = AggregatedResult {
            task_id,
            status,
            summary,
            report: report.clone(),
            sub_tasks: breakdown,
            metrics,
            created_at,
            completed_at,
        };

        let html = markdown_to_html(&report);
        let json = serde_json::to_string_pretty(&result)?;
        self.cache.write().await.insert(
            task_id,
            CachedReport {
                result: result.clone(),
                html,
                json,
            },
        );
        info!(task_id = %task_id, status = ?status, "Result aggregated");
        Ok(result)
    }

    /// Export a cached report, or `None` if aggregation has not run yet.
    pub async fn export(&self, task_id: Uuid, format: ReportFormat) -> Option<String> {
        let cache = self.cache.read().await;
        let cached = cache.get(&task_id)?;
        Some(match format {
            ReportFormat::Markdown => cached.result.report.clone(),
            ReportFormat::Html => cached.html.clone(),
            ReportFormat::Json => cached.json.clone(),
        })
    }

    /// The cached result, if aggregation has run.
    pub async fn cached(&self, task_id: Uuid) -> Option<AggregatedResult> {
        let cache = self.cache.read().await;
        cache.get(&task_id).map(|c| c.result.clone())
    }
}

fn compute_metrics(breakdown: &[SubTaskReport]) -> TaskMetrics {
    let total = breakdown.len();
    let completed = breakdown
        .iter()
        .filter(|s| s.status == SubTaskStatus::Completed)
        .count();
    let failed = breakdown
        .iter()
        .filter(|s| s.status == SubTaskStatus::Failed)
        .count();
    let success_rate = if total == 0 {
        0
    } else {
        ((completed as f64 / total as f64) * 100.0).round() as u8
    };
    let durations: Vec<i64> = breakdown.iter().filter_map(|s| s.duration_ms).collect();
    let total_duration_ms: i64 = durations.iter().sum();
    let avg_duration_ms = if durations.is_empty() {
        0
    } else {
        total_duration_ms / durations.len() as i64
    };
    TaskMetrics {
        total_sub_tasks: total,
        completed_sub_tasks: completed,
        failed_sub_tasks: failed,
        success_rate,
        total_duration_ms,
        avg_duration_ms,
    }
}

fn template_summary(description: &str, metrics: &TaskMetrics) -> String {
    let (completed, total) = (metrics.completed_sub_tasks, metrics.total_sub_tasks);
    match metrics.success_rate {
        100 => format!("'{description}': all {total} sub-tasks completed successfully."),
        80..=99 => format!(
            "'{description}': mostly successful, {completed} of {total} sub-tasks completed."
        ),
        50..=79 => format!(
            "'{description}': partially successful, {completed} of {total} sub-tasks completed."
        ),
        _ => format!(
            "'{description}': largely unsuccessful, only {completed} of {total} sub-tasks completed."
        ),
    }
}

fn conclusion(metrics: &TaskMetrics) -> &'static str {
    match metrics.success_rate {
        100 => "Every sub-task finished cleanly; the task is complete.",
        80..=99 => "The task is substantially complete; review the failed items below.",
        50..=79 => "The task partially succeeded; significant follow-up is required.",
        _ => "The task largely failed; a rerun with revised planning is recommended.",
    }
}

#[allow(clippy::too_many_arguments)]
fn render_markdown(
    task_id: Uuid,
    description: &str,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    status: OverallStatus,
    summary: &str,
    metrics: &TaskMetrics,
    breakdown: &[SubTaskReport],
) -> String {
    let mut out = String::new();
    out.push_str(&format!("# Task Report: {description}\n\n"));
    out.push_str(&format!("- Task id: `{task_id}`\n"));
    out.push_str(&format!("- Status: {status:?}\n"));
    out.push_str(&format!("- Created: {}\n", created_at.to_rfc3339()));
    if let Some(completed_at) = completed_at {
        out.push_str(&format!("- Finished: {}\n", completed_at.to_rfc3339()));
    }
    out.push('\n');

    out.push_str("## Summary\n\n");
    out.push_str(summary);
    out.push_str("\n\n");

    out.push_str("## Metrics\n\n");
    out.push_str("| Metric | Value |\n");
    out.push_str("| --- | --- |\n");
    out.push_str(&format!("| Sub-tasks | {} |\n", metrics.total_sub_tasks));
    out.push_str(&format!("| Completed | {} |\n", metrics.completed_sub_tasks));
    out.push_str(&format!("| Failed | {} |\n", metrics.failed_sub_tasks));
    out.push_str(&format!("| Success rate | {}% |\n", metrics.success_rate));
    out.push_str(&format!(
        "| Total duration | {} ms |\n",
        metrics.total_duration_ms
    ));
    out.push_str(&format!(
        "| Average duration | {} ms |\n",
        metrics.avg_duration_ms
    ));
    out.push('\n');

    out.push_str("## Sub-tasks\n\n");
    for sub in breakdown {
        out.push_str(&format!("### {}\n\n", sub.title));
        out.push_str(&format!("- Status: {:?}\n", sub.status));
        if let Some(name) = &sub.worker_name {
            out.push_str(&format!("- Worker: {name}\n"));
        }
        if let Some(duration) = sub.duration_ms {
            out.push_str(&format!("- Duration: {duration} ms\n"));
        }
        if sub.retry_count > 0 {
            out.push_str(&format!("- Retries: {}\n", sub.retry_count));
        }
        match (&sub.result, &sub.error) {
            (Some(result), _) if sub.status == SubTaskStatus::Completed => {
                out.push_str(&format!("\n{result}\n"));
            }
            (Some(result), _) => {
                out.push_str(&format!("\nOutcome: {result}\n"));
            }
            (None, Some(error)) => {
                out.push_str(&format!("\nError: {error}\n"));
            }
            (None, None) => {}
        }
        out.push('\n');
    }

    out.push_str("## Conclusion\n\n");
    out.push_str(conclusion(metrics));
    out.push('\n');
    out
}

fn escape_html(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Minimal Markdown-to-HTML rendering covering the constructs the report
/// uses: headings, bullet lists, tables, and paragraphs.
fn markdown_to_html(markdown: &str) -> String {
    let mut out = String::from("<!doctype html>\n<html><body>\n");
    let mut in_table = false;
    let mut in_list = false;

    for line in markdown.lines() {
        let trimmed = line.trim_end();

        if in_table && !trimmed.starts_with('|') {
            out.push_str("</table>\n");
            in_table = false;
        }
        if in_list && !trimmed.starts_with("- ") {
            out.push_str("</ul>\n");
            in_list = false;
        }

        if let Some(rest) = trimmed.strip_prefix("### ") {
            out.push_str(&format!("<h3>{}</h3>\n", escape_html(rest)));
        } else if let Some(rest) = trimmed.strip_prefix("## ") {
            out.push_str(&format!("<h2>{}</h2>\n", escape_html(rest)));
        } else if let Some(rest) = trimmed.strip_prefix("# ") {
            out.push_str(&format!("<h1>{}</h1>\n", escape_html(rest)));
        } else if let Some(rest) = trimmed.strip_prefix("- ") {
            if !in_list {
                out.push_str("<ul>\n");
                in_list = true;
            }
            out.push_str(&format!("<li>{}</li>\n", escape_html(rest)));
        } else if trimmed.starts_with('|') {
            // Skip the |---| separator row.
            if trimmed.chars().all(|c| matches!(c, '|' | '-' | ' ')) {
                continue;
            }
            if !in_table {
                out.push_str("<table>\n");
                in_table = true;
            }
            let cells: Vec<&str> = trimmed
                .trim_matches('|')
                .split('|')
                .map(str::trim)
                .collect();
            out.push_str("<tr>");
            for cell in cells {
                out.push_str(&format!("<td>{}</td>", escape_html(cell)));
            }
            out.push_str("</tr>\n");
        } else if !trimmed.is_empty() {
            out.push_str(&format!("<p>{}</p>\n", escape_html(trimmed)));
        }
    }
    if in_table {
        out.push_str("</table>\n");
    }
    if in_list {
        out.push_str("</ul>\n");
    }
    out.push_str("</body></html>\n");
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::Duration;
    use maestro_core::{SubTask, Task, TaskStatus, Worker};

    async fn terminal_task(
        outcomes: &[(SubTaskStatus, Option<&str>, Option<&str>)],
    ) -> (ResultAggregator, Uuid) {
        let store = Arc::new(RwLock::new(TaskStore::new()));
        let pool = Arc::new(WorkerPool::new());
        let worker = Worker::new("Ada", "dev");
        let worker_id = worker.id;
        pool.register(
            worker,
            Arc::new(maestro_agent::ScriptedBackend::new("unused")),
        )
        .await;

        let mut task = Task::new("ship the feature");
        let task_id = task.id;
        task.status = TaskStatus::Completed;
        let start = task.created_at;
        task.completed_at = Some(start + Duration::seconds(10));

        let mut subs = Vec::new();
        for (i, (status, result, error)) in outcomes.iter().enumerate() {
            let mut sub = SubTask::new(task_id, format!("step {i}"), "work");
            sub.status = *status;
            sub.result = result.map(str::to_string);
            sub.error = error.map(str::to_string);
            sub.assigned_worker = Some(worker_id);
            sub.started_at = Some(start);
            sub.finished_at = Some(start + Duration::milliseconds(1000 * (i as i64 + 1)));
            subs.push(sub);
        }
        store.write().await.insert(task, subs);

        (ResultAggregator::new(store, pool), task_id)
    }

    #[tokio::test]
    async fn test_aggregate_all_completed() {
        let (aggregator, task_id) = terminal_task(&[
            (SubTaskStatus::Completed, Some("done a"), None),
            (SubTaskStatus::Completed, Some("done b"), None),
        ])
        .await;

        let result = aggregator.aggregate(task_id).await.unwrap();
        assert_eq!(result.status, OverallStatus::Completed);
        assert_eq!(result.metrics.success_rate, 100);
        assert_eq!(result.metrics.total_duration_ms, 3000);
        assert_eq!(result.metrics.avg_duration_ms, 1500);
        assert!(result.summary.contains("all 2 sub-tasks"));
        assert!(result.report.contains("# Task Report: ship the feature"));
        assert!(result.report.contains("done a"));
        assert!(result
            .report
            .contains("Every sub-task finished cleanly"));
    }

    #[tokio::test]
    async fn test_aggregate_partial_and_failed() {
        let (aggregator, task_id) = terminal_task(&[
            (SubTaskStatus::Completed, Some("ok"), None),
            (SubTaskStatus::Failed, Some("gave up"), Some("boom")),
        ])
        .await;

        let result = aggregator.aggregate(task_id).await.unwrap();
        assert_eq!(result.status, OverallStatus::Partial);
        assert_eq!(result.metrics.completed_sub_tasks, 1);
        assert_eq!(result.metrics.failed_sub_tasks, 1);
        assert_eq!(result.metrics.success_rate, 50);
        assert_eq!(
            result.metrics.completed_sub_tasks + result.metrics.failed_sub_tasks,
            result.metrics.total_sub_tasks
        );
        // The failed sub-task still contributes a coherent outcome line.
        assert!(result.report.contains("Outcome: gave up"));

        let (aggregator, task_id) = terminal_task(&[
            (SubTaskStatus::Failed, Some("err"), Some("err")),
        ])
        .await;
        let result = aggregator.aggregate(task_id).await.unwrap();
        assert_eq!(result.status, OverallStatus::Failed);
    }

    #[tokio::test]
    async fn test_aggregate_requires_terminal_task() {
        let store = Arc::new(RwLock::new(TaskStore::new()));
        let pool = Arc::new(WorkerPool::new());
        let task = Task::new("in flight");
        let task_id = task.id;
        let sub = SubTask::new(task_id, "step", "w");
        store.write().await.insert(task, vec![sub]);

        let aggregator = ResultAggregator::new(store, pool);
        let err = aggregator.aggregate(task_id).await.unwrap_err();
        assert!(err.to_string().contains("terminal"));
        assert!(aggregator.export(task_id, ReportFormat::Markdown).await.is_none());
    }

    #[tokio::test]
    async fn test_aggregate_is_idempotent() {
        let (aggregator, task_id) = terminal_task(&[
            (SubTaskStatus::Completed, Some("ok"), None),
            (SubTaskStatus::Failed, Some("skipped"), Some("skipped")),
        ])
        .await;

        aggregator.aggregate(task_id).await.unwrap();
        let md1 = aggregator.export(task_id, ReportFormat::Markdown).await.unwrap();
        let html1 = aggregator.export(task_id, ReportFormat::Html).await.unwrap();
        let json1 = aggregator.export(task_id, ReportFormat::Json).await.unwrap();

        aggregator.aggregate(task_id).await.unwrap();
        assert_eq!(
            aggregator.export(task_id, ReportFormat::Markdown).await.unwrap(),
            md1
        );
        assert_eq!(
            aggregator.export(task_id, ReportFormat::Html).await.unwrap(),
            html1
        );
        assert_eq!(
            aggregator.export(task_id, ReportFormat::Json).await.unwrap(),
            json1
        );
    }

    #[tokio::test]
    async fn test_html_export_renders_structure() {
        let (aggregator, task_id) =
            terminal_task(&[(SubTaskStatus::Completed, Some("x < y"), None)]).await;
        aggregator.aggregate(task_id).await.unwrap();

        let html = aggregator.export(task_id, ReportFormat::Html).await.unwrap();
        assert!(html.contains("<h1>Task Report: ship the feature</h1>"));
        assert!(html.contains("<table>"));
        assert!(html.contains("<td>Success rate</td>"));
        // Content is escaped.
        assert!(html.contains("x &lt; y"));
    }

    #[tokio::test]
    async fn test_json_export_round_trips() {
        let (aggregator, task_id) =
            terminal_task(&[(SubTaskStatus::Completed, Some("ok"), None)]).await;
        aggregator.aggregate(task_id).await.unwrap();

        let json = aggregator.export(task_id, ReportFormat::Json).await.unwrap();
        let parsed: AggregatedResult = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.task_id, task_id);
        assert_eq!(parsed.metrics.total_sub_tasks, 1);
    }

    #[tokio::test]
    async fn test_summarizer_output_used() {
        let (aggregator, task_id) =
            terminal_task(&[(SubTaskStatus::Completed, Some("ok"), None)]).await;
        let aggregator = aggregator
            .with_summarizer(Arc::new(maestro_agent::ScriptedBackend::new("Crisp summary.")));

        let result = aggregator.aggregate(task_id).await.unwrap();
        assert_eq!(result.summary, "Crisp summary.");
        // The report embeds the summarizer text.
        assert!(result.report.contains("Crisp summary."));
    }

    #[test]
    fn test_success_rate_rounding() {
        let breakdown: Vec<SubTaskReport> = (0..3)
            .map(|i| SubTaskReport {
                id: Uuid::new_v4(),
                title: format!("s{i}"),
                status: if i < 2 {
                    SubTaskStatus::Completed
                } else {
                    SubTaskStatus::Failed
                },
                worker_name: None,
                duration_ms: None,
                result: None,
                error: None,
                retry_count: 0,
            })
            .collect();
        let metrics = compute_metrics(&breakdown);
        // 2/3 rounds to 67.
        assert_eq!(metrics.success_rate, 67);
    }
}

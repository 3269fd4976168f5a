use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use colored::Colorize;
use dashmap::DashMap;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::debug;

/// Status of a task during execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed(String),
    Skipped(String),
}

/// Progress wording for a task, e.g. `("Creating", "Creation")`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verb {
    pub progress: &'static str,
    pub past: &'static str,
}

impl Verb {
    pub const CREATE: Verb = Verb { progress: "Creating", past: "Creation" };
    pub const UPDATE: Verb = Verb { progress: "Modifying", past: "Modifications" };
    pub const DELETE: Verb = Verb { progress: "Destroying", past: "Destruction" };
}

/// One unit of work. `depends_on` holds indices of tasks that must succeed first.
#[derive(Debug, Clone)]
pub struct WalkTask {
    pub label: String,
    pub verb: Verb,
    pub depends_on: Vec<usize>,
}

/// Result of executing a single task.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub index: usize,
    pub label: String,
    pub status: TaskStatus,
    /// Short detail printed on success, e.g. the provider ID.
    pub detail: Option<String>,
    pub elapsed: Duration,
}

/// Callback signature for task execution.
pub type TaskExecutor = Box<
    dyn Fn(usize) -> futures::future::BoxFuture<'static, Result<Option<String>>> + Send + Sync,
>;

/// Message sent back from worker tasks to the walker.
enum WalkerMessage {
    TaskCompleted {
        index: usize,
        status: TaskStatus,
        detail: Option<String>,
    },
}

const CANCELLED: &str = "cancelled";

/// Event-driven walker that executes tasks as their dependencies are satisfied.
pub struct DagWalker {
    max_parallelism: usize,
    progress: bool,
    cancel: Option<watch::Receiver<bool>>,
}

impl DagWalker {
    pub fn new(max_parallelism: usize) -> Self {
        Self {
            max_parallelism: max_parallelism.max(1),
            progress: false,
            cancel: None,
        }
    }

    /// Print per-task progress lines to stdout.
    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    /// Stop scheduling new tasks once the flag turns true.
    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().map(|c| *c.borrow()).unwrap_or(false)
    }

    /// Walk the tasks, executing each via `executor` once everything it
    /// depends on has succeeded. Results come back in task order.
    ///
    /// A failed task skips its transitive dependents; independent tasks keep
    /// running. After cancellation, in-flight tasks finish and the rest are
    /// skipped.
    pub async fn walk(&self, tasks: &[WalkTask], executor: Arc<TaskExecutor>) -> Vec<TaskResult> {
        let task_count = tasks.len();
        if task_count == 0 {
            return Vec::new();
        }

        let semaphore = Arc::new(Semaphore::new(self.max_parallelism));
        let (tx, mut rx) = mpsc::channel::<WalkerMessage>(task_count);

        let mut statuses: Vec<TaskStatus> = vec![TaskStatus::Pending; task_count];
        let mut details: Vec<Option<String>> = vec![None; task_count];
        let mut elapsed: Vec<Duration> = vec![Duration::ZERO; task_count];
        let start_times: Arc<DashMap<usize, Instant>> = Arc::new(DashMap::new());

        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); task_count];
        for (idx, task) in tasks.iter().enumerate() {
            for &dep in &task.depends_on {
                if dep < task_count && !dependents[dep].contains(&idx) {
                    dependents[dep].push(idx);
                }
            }
        }
        for list in &mut dependents {
            list.sort_unstable();
        }

        let all_done = Arc::new(AtomicBool::new(false));
        let heartbeat_handle = self.progress.then(|| {
            spawn_heartbeat(tasks, Arc::clone(&start_times), Arc::clone(&all_done))
        });

        let mut running = 0usize;
        let mut completed = 0usize;

        // Spawn initially ready tasks in task order
        for idx in 0..task_count {
            if tasks[idx].depends_on.iter().all(|&d| d >= task_count) {
                if self.is_cancelled() {
                    break;
                }
                self.spawn_task(idx, tasks, &executor, &semaphore, &tx, &start_times);
                statuses[idx] = TaskStatus::Running;
                running += 1;
            }
        }

        // Process completions until nothing is running
        while running > 0 {
            let Some(WalkerMessage::TaskCompleted { index, status, detail }) = rx.recv().await
            else {
                break;
            };
            running -= 1;
            completed += 1;

            let took = start_times
                .remove(&index)
                .map(|(_, t)| t.elapsed())
                .unwrap_or_default();
            elapsed[index] = took;
            details[index] = detail;
            statuses[index] = status.clone();

            self.report(&tasks[index], &status, details[index].as_deref(), took, completed, task_count);
            debug!(
                task = %tasks[index].label,
                status = ?status,
                elapsed_ms = took.as_millis() as u64,
                progress = format!("{}/{}", completed, task_count),
                "Task completed"
            );

            match status {
                TaskStatus::Succeeded => {
                    for &next in &dependents[index] {
                        if statuses[next] != TaskStatus::Pending {
                            continue;
                        }
                        let ready = tasks[next]
                            .depends_on
                            .iter()
                            .all(|&d| d >= task_count || statuses[d] == TaskStatus::Succeeded);
                        if ready && !self.is_cancelled() {
                            self.spawn_task(next, tasks, &executor, &semaphore, &tx, &start_times);
                            statuses[next] = TaskStatus::Running;
                            running += 1;
                        }
                    }
                }
                TaskStatus::Failed(_) | TaskStatus::Skipped(_) => {
                    let reason = match status {
                        TaskStatus::Skipped(ref r) if r == CANCELLED => CANCELLED.to_string(),
                        _ => format!("dependency '{}' did not complete", tasks[index].label),
                    };
                    for skip in collect_transitive_dependents(index, &dependents) {
                        if statuses[skip] == TaskStatus::Pending {
                            statuses[skip] = TaskStatus::Skipped(reason.clone());
                            completed += 1;
                            self.report_skip(&tasks[skip], &reason);
                        }
                    }
                }
                TaskStatus::Pending | TaskStatus::Running => {}
            }
        }

        // Whatever was never scheduled was cut off by cancellation
        for (idx, status) in statuses.iter_mut().enumerate() {
            if *status == TaskStatus::Pending {
                *status = TaskStatus::Skipped(CANCELLED.to_string());
                self.report_skip(&tasks[idx], CANCELLED);
            }
        }

        all_done.store(true, Ordering::Relaxed);
        if let Some(handle) = heartbeat_handle {
            handle.abort();
        }

        statuses
            .into_iter()
            .enumerate()
            .map(|(index, status)| TaskResult {
                index,
                label: tasks[index].label.clone(),
                status,
                detail: details[index].take(),
                elapsed: elapsed[index],
            })
            .collect()
    }

    /// Spawn execution of a single task.
    fn spawn_task(
        &self,
        idx: usize,
        tasks: &[WalkTask],
        executor: &Arc<TaskExecutor>,
        semaphore: &Arc<Semaphore>,
        tx: &mpsc::Sender<WalkerMessage>,
        start_times: &Arc<DashMap<usize, Instant>>,
    ) {
        let executor = Arc::clone(executor);
        let semaphore = Arc::clone(semaphore);
        let start_times = Arc::clone(start_times);
        let cancel = self.cancel.clone();
        let tx = tx.clone();
        let task = tasks[idx].clone();
        let progress = self.progress;

        tokio::spawn(async move {
            let (status, detail) = match semaphore.acquire_owned().await {
                Err(_) => (TaskStatus::Failed("worker pool closed".to_string()), None),
                Ok(_permit) => {
                    if cancel.as_ref().map(|c| *c.borrow()).unwrap_or(false) {
                        (TaskStatus::Skipped(CANCELLED.to_string()), None)
                    } else {
                        start_times.insert(idx, Instant::now());
                        if progress {
                            println!("{}: {}...", task.label, task.verb.progress.cyan());
                        }
                        // Run on its own task so a panic is reported, not lost
                        match tokio::spawn(executor(idx)).await {
                            Ok(Ok(detail)) => (TaskStatus::Succeeded, detail),
                            Ok(Err(e)) => (TaskStatus::Failed(format!("{:#}", e)), None),
                            Err(e) => (TaskStatus::Failed(format!("task panicked: {}", e)), None),
                        }
                    }
                }
            };

            let _ = tx
                .send(WalkerMessage::TaskCompleted { index: idx, status, detail })
                .await;
        });
    }

    fn report(
        &self,
        task: &WalkTask,
        status: &TaskStatus,
        detail: Option<&str>,
        took: Duration,
        completed: usize,
        total: usize,
    ) {
        if !self.progress {
            return;
        }
        match status {
            TaskStatus::Succeeded => {
                let suffix = detail.map(|d| format!(" [id={}]", d)).unwrap_or_default();
                println!(
                    "{}: {} after {} [{}/{}]{}",
                    task.label,
                    format!("{} complete", task.verb.past).green().bold(),
                    format_duration(took.as_secs()).bold(),
                    completed,
                    total,
                    suffix,
                );
            }
            TaskStatus::Failed(err) => {
                println!(
                    "{}: {} after {}: {}",
                    task.label.bold(),
                    "FAILED".red().bold(),
                    format_duration(took.as_secs()),
                    err.red(),
                );
            }
            TaskStatus::Skipped(reason) => self.report_skip(task, reason),
            TaskStatus::Pending | TaskStatus::Running => {}
        }
    }

    fn report_skip(&self, task: &WalkTask, reason: &str) {
        if self.progress {
            println!("{}: {} ({})", task.label.bold(), "Skipped".yellow(), reason.dimmed());
        }
    }
}

/// Prints "Still creating... [10s elapsed]" for long-running tasks every 10s.
fn spawn_heartbeat(
    tasks: &[WalkTask],
    start_times: Arc<DashMap<usize, Instant>>,
    done: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<()> {
    let labels: Vec<(String, &'static str)> = tasks
        .iter()
        .map(|t| (t.label.clone(), t.verb.progress))
        .collect();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(10)).await;
            if done.load(Ordering::Relaxed) {
                break;
            }
            for entry in start_times.iter() {
                let elapsed = entry.value().elapsed().as_secs();
                if elapsed >= 10 {
                    let (label, verb) = &labels[*entry.key()];
                    println!(
                        "{}: Still {}... [{} elapsed]",
                        label,
                        verb.to_lowercase().cyan(),
                        format_duration(elapsed).bold(),
                    );
                }
            }
        }
    })
}

/// Format seconds into a human-readable duration string.
pub fn format_duration(secs: u64) -> String {
    if secs < 60 {
        format!("{}s", secs)
    } else {
        let mins = secs / 60;
        let remaining = secs % 60;
        if remaining == 0 {
            format!("{}m", mins)
        } else {
            format!("{}m{}s", mins, remaining)
        }
    }
}

/// Collect all transitive dependents of a task (for cascade skip on failure).
fn collect_transitive_dependents(start: usize, dependents: &[Vec<usize>]) -> BTreeSet<usize> {
    let mut visited = BTreeSet::new();
    let mut stack = vec![start];

    while let Some(node) = stack.pop() {
        for &dep in &dependents[node] {
            if visited.insert(dep) {
                stack.push(dep);
            }
        }
    }

    visited
}

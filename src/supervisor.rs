use crate::context::AppContext;
use log::{error, info, warn};
use rand::Rng;
use std::pin::Pin;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

pub type TaskFuture = Pin<Box<dyn Future<Output = miette::Result<()>> + Send>>;
pub type TaskFactory = Box<dyn Fn(AppContext, CancellationToken) -> TaskFuture + Send + Sync>;

pub struct TaskConfig {
    pub name: &'static str,
    pub factory: TaskFactory,
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
}

impl TaskConfig {
    /// Sensible defaults for a long-running task: generous retry budget,
    /// one-second initial backoff doubling up to a minute.
    pub fn new(name: &'static str, factory: TaskFactory) -> Self {
        TaskConfig {
            name,
            factory,
            max_retries: 20,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Starting,
    Running,
    BackingOff,
    Failed,
}

impl TaskState {
    fn gauge_value(self) -> f64 {
        match self {
            TaskState::Starting => 0.0,
            TaskState::Running => 1.0,
            TaskState::BackingOff => 2.0,
            TaskState::Failed => 3.0,
        }
    }
}

fn set_task_state(name: &'static str, state: TaskState) {
    metrics::gauge!("supervisor_task_state", "task" => name).set(state.gauge_value());
}

/// Computes the nth backoff with jitter. Exposed for tests.
pub fn backoff_for_attempt(config: &TaskConfig, attempt: u32) -> Duration {
    let base = config.initial_backoff.as_secs_f64()
        * config.backoff_multiplier.powi(attempt.min(30) as i32);
    let capped = base.min(config.max_backoff.as_secs_f64());
    // Up to 20% jitter so restarting tasks don't thundering-herd shared
    // dependencies.
    let jitter = rand::thread_rng().gen_range(0.0..capped * 0.2);
    Duration::from_secs_f64(capped + jitter)
}

/// Owns every background task in the process. Each registered task runs
/// until completion or error; errors restart it with capped exponential
/// backoff until the retry budget runs out. Cancellation is cooperative:
/// tasks drain their in-flight batch, flush acks, and return Ok.
pub struct Supervisor {
    ctx: AppContext,
    tasks: Vec<TaskConfig>,
    shutdown: CancellationToken,
}

impl Supervisor {
    pub fn new(ctx: AppContext, shutdown: CancellationToken) -> Self {
        Supervisor {
            ctx,
            tasks: Vec::new(),
            shutdown,
        }
    }

    pub fn register(&mut self, task: TaskConfig) {
        info!("Registered supervised task {}", task.name);
        self.tasks.push(task);
    }

    /// Runs every registered task to completion. Returns once all tasks
    /// have exited, which normally only happens after `shutdown` fires.
    pub async fn run(self) -> miette::Result<()> {
        let mut join_set = JoinSet::new();

        for task in self.tasks {
            let ctx = self.ctx.clone();
            let shutdown = self.shutdown.clone();
            join_set.spawn(supervise_one(task, ctx, shutdown));
        }

        // Individual task failures are contained by supervise_one; a join
        // error here means a panic escaped, which is the Fatal class and
        // worth surfacing loudly.
        while let Some(result) = join_set.join_next().await {
            if let Err(join_err) = result {
                error!("Supervised task panicked: {join_err}");
            }
        }

        info!("All supervised tasks have exited");
        Ok(())
    }
}

async fn supervise_one(task: TaskConfig, ctx: AppContext, shutdown: CancellationToken) {
    let mut attempt: u32 = 0;

    loop {
        set_task_state(task.name, TaskState::Starting);
        info!("Starting task {} (attempt {attempt})", task.name);

        let future = (task.factory)(ctx.clone(), shutdown.clone());
        set_task_state(task.name, TaskState::Running);

        match future.await {
            Ok(()) => {
                info!("Task {} finished cleanly", task.name);
                return;
            }
            Err(err) => {
                if shutdown.is_cancelled() {
                    // Errors during shutdown are usually just torn-down
                    // connections; don't burn retries on them.
                    warn!("Task {} errored during shutdown: {err:?}", task.name);
                    return;
                }

                attempt += 1;
                metrics::counter!("supervisor_task_restarts_total", "task" => task.name)
                    .increment(1);

                if attempt > task.max_retries {
                    error!(
                        "Task {} exceeded its retry budget ({}); giving up: {err:?}",
                        task.name, task.max_retries
                    );
                    set_task_state(task.name, TaskState::Failed);
                    return;
                }

                let backoff = backoff_for_attempt(&task, attempt - 1);
                warn!(
                    "Task {} exited with error (attempt {attempt}/{}), restarting in {:.1}s: {err:?}",
                    task.name,
                    task.max_retries,
                    backoff.as_secs_f64(),
                );
                set_task_state(task.name, TaskState::BackingOff);

                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = shutdown.cancelled() => {
                        info!("Task {} shutdown requested during backoff", task.name);
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> TaskConfig {
        TaskConfig {
            name: "test",
            factory: Box::new(|_, _| Box::pin(async { Ok(()) })),
            max_retries: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }

    #[test]
    fn backoff_grows_exponentially_and_caps() {
        let config = test_config();

        let first = backoff_for_attempt(&config, 0);
        assert!(first >= Duration::from_secs(1));
        assert!(first <= Duration::from_millis(1200));

        let third = backoff_for_attempt(&config, 2);
        assert!(third >= Duration::from_secs(4));
        assert!(third <= Duration::from_millis(4800));

        // Attempt 10 would be 1024s uncapped; must respect max_backoff
        // plus at most 20% jitter.
        let big = backoff_for_attempt(&config, 10);
        assert!(big >= Duration::from_secs(60));
        assert!(big <= Duration::from_secs(72));
    }
}

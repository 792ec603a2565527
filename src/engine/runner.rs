use std::sync::LazyLock;
use std::sync::mpsc::channel;

use indicatif::ProgressStyle;
use tracing::{Level, Span, info, warn};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::engine::{BuildReport, Outcome, Task, TaskContext, Taskmaster};

static PROGRESS_STYLE: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .expect("Error setting progress bar template")
        .progress_chars("=>-")
});

static TASK_STYLE: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::default_spinner()
        .template("{spinner:.blue} {msg}")
        .expect("Error setting progress bar template")
});

/// Runs the build to completion and returns its report.
///
/// With `jobs == 1` every task runs on the calling thread, in the order the
/// taskmaster hands them out. Otherwise tasks run on a thread pool with
/// `jobs` threads while the calling thread owns the taskmaster:
/// 1. ready tasks are spawned until `jobs` of them are in flight,
/// 2. the calling thread waits for any of them to finish,
/// 3. the outcome goes back to the taskmaster, which may unblock new tasks.
///
/// After the first failure without `keep_going`, the tasks already in flight
/// are waited for and nothing new is started.
pub fn run(tm: &mut Taskmaster) -> BuildReport {
    let jobs = tm.config().jobs.max(1);

    let root_span = tracing::span!(Level::INFO, "building");
    root_span.pb_set_style(&PROGRESS_STYLE);
    root_span.pb_set_message("Building...");
    let _enter = root_span.enter();

    if jobs == 1 {
        run_serial(tm, &root_span);
    } else {
        match rayon::ThreadPoolBuilder::new().num_threads(jobs).build() {
            Ok(pool) => run_parallel(tm, &pool, jobs, &root_span),
            Err(e) => {
                warn!("Couldn't start {jobs} worker threads, building serially: {e}");
                run_serial(tm, &root_span);
            }
        }
    }

    let report = tm.finish();
    info!("Build complete: {}", report.summary());
    report
}

fn run_serial(tm: &mut Taskmaster, progress: &Span) {
    let ctx = tm.context();
    let mut dispatched = 0;

    while let Some(mut task) = tm.next_task() {
        dispatched += 1;
        progress.pb_set_length(dispatched);

        let outcome = run_task(&mut task, &ctx);
        tm.mark_done(task, outcome);
        progress.pb_inc(1);
    }
}

fn run_parallel(tm: &mut Taskmaster, pool: &rayon::ThreadPool, jobs: usize, progress: &Span) {
    let ctx = tm.context();
    let mut dispatched = 0;

    pool.in_place_scope(|s| {
        let (sender, receiver) = channel::<(Task, Outcome)>();
        let mut running = 0;

        loop {
            while running < jobs
                && let Some(mut task) = tm.next_task()
            {
                dispatched += 1;
                progress.pb_set_length(dispatched);

                let sender = sender.clone();
                let ctx = ctx.clone();
                s.spawn(move |_| {
                    let outcome = run_task(&mut task, &ctx);
                    // The receiver outlives the scope.
                    let _ = sender.send((task, outcome));
                });
                running += 1;
            }

            if running == 0 {
                break;
            }

            let Ok((task, outcome)) = receiver.recv() else {
                break;
            };
            running -= 1;
            tm.mark_done(task, outcome);
            progress.pb_inc(1);
        }
    });
}

fn run_task(task: &mut Task, ctx: &TaskContext) -> Outcome {
    let name = task.targets().next().unwrap_or_default().to_string();
    let span = tracing::span!(Level::INFO, "task", name = %name);
    span.pb_set_style(&TASK_STYLE);
    span.pb_set_message(&format!("Building {name}"));
    let _enter = span.enter();

    task.run(ctx)
}

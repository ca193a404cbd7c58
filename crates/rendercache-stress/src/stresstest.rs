use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use sentry::SentryFutureExt;
use sketches_ddsketch::DDSketch;
use tokio::sync::{Semaphore, mpsc};

use rendercache_service::config::Config as RenderCacheConfig;
use rendercache_service::services::SharedServices;

use crate::workloads::{WorkloadsConfig, prepare_workload, process_workload, warmup_workload};

pub async fn perform_stresstest(
    service_config: RenderCacheConfig,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    // start the rendering services
    let runtime = tokio::runtime::Handle::current();
    let shared_services = SharedServices::new(service_config, runtime);
    let executor = Arc::new(shared_services.executor.clone());

    let (invalidations, events) = mpsc::channel(1024);
    let listener = tokio::spawn(shared_services.invalidation.clone().listen(events));

    // initialize workloads
    let workloads: Vec<_> = workloads
        .workloads
        .iter()
        .enumerate()
        .map(|(i, workload)| (workload.concurrency, Arc::new(prepare_workload(i, workload))))
        .collect();

    // warmup: render each identity once to make sure caches are warm
    {
        let start = Instant::now();

        let futures = workloads.iter().map(|(_, workload)| {
            let executor = Arc::clone(&executor);
            let workload = Arc::clone(workload);
            tokio::spawn(async move { warmup_workload(&executor, &workload).await })
        });

        for result in futures::future::join_all(futures).await {
            result
                .context("warmup task panicked")?
                .context("failed to warm up workload")?;
        }

        println!("Warmup: {:?}", start.elapsed());
    };
    println!();

    // run the workloads concurrently
    let mut tasks = Vec::with_capacity(workloads.len());
    for (concurrency, workload) in workloads.into_iter() {
        let start = Instant::now();
        let deadline = tokio::time::Instant::from_std(start + duration);
        let executor = Arc::clone(&executor);
        let invalidations = invalidations.clone();

        let task = tokio::spawn(async move {
            let task_durations = Arc::new(Mutex::new(DDSketch::default()));
            let failures = Arc::new(AtomicUsize::new(0));
            let semaphore = Arc::new(Semaphore::new(concurrency));
            let mut started = 0usize;

            // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
            let sleep = tokio::time::sleep_until(deadline);
            tokio::pin!(sleep);

            loop {
                if deadline.elapsed() > Duration::ZERO {
                    break;
                }
                tokio::select! {
                    permit = semaphore.clone().acquire_owned() => {
                        started += 1;
                        if let Some(every) = workload.invalidate_every() {
                            if started % every == 0 {
                                // the listener only stops once all senders are gone
                                let _ = invalidations.send(workload.random_invalidation()).await;
                            }
                        }

                        let workload = Arc::clone(&workload);
                        let executor = Arc::clone(&executor);
                        let task_durations = Arc::clone(&task_durations);
                        let failures = Arc::clone(&failures);
                        let task_start = Instant::now();

                        let hub = sentry::Hub::new_from_top(sentry::Hub::current());
                        let ctx = sentry::TransactionContext::new("stresstest", "stresstest");
                        let transaction = hub.start_transaction(ctx);

                        let future = async move {
                            if process_workload(&executor, &workload).await.is_err() {
                                failures.fetch_add(1, Ordering::Relaxed);
                            }

                            transaction.finish();

                            if let Ok(mut task_durations) = task_durations.lock() {
                                task_durations.add(task_start.elapsed().as_secs_f64());
                            }

                            drop(permit);
                        };
                        let future = future.bind_hub(hub);

                        tokio::spawn(future);
                    }
                    _ = &mut sleep => {
                        break;
                    }
                }
            }

            // by acquiring *all* the semaphores, we essentially wait for all outstanding tasks to finish
            let _permits = semaphore.acquire_many(concurrency as u32).await;

            let task_durations: DDSketch = match task_durations.lock() {
                Ok(mut task_durations) => std::mem::take(&mut *task_durations),
                Err(_) => DDSketch::default(),
            };

            (concurrency, task_durations, failures.load(Ordering::Relaxed))
        });
        tasks.push(task);
    }
    drop(invalidations);

    let finished_tasks = futures::future::join_all(tasks).await;

    for (i, task) in finished_tasks.into_iter().enumerate() {
        let (concurrency, task_durations, failures) = task.context("workload task panicked")?;

        let ops = task_durations.count();
        let ops_ps = ops as f32 / duration.as_secs_f32();
        println!(
            "Workload {i} (concurrency: {concurrency}): {ops} operations, {ops_ps:.2} ops/s, {failures} failures"
        );
        if ops == 0 {
            continue;
        }

        let quantile = |q| {
            let secs = task_durations.quantile(q).ok().flatten().unwrap_or_default();
            Duration::from_secs_f64(secs)
        };
        let avg = Duration::from_secs_f64(task_durations.sum().unwrap_or_default() / ops as f64);
        let (p50, p90, p99) = (quantile(0.5), quantile(0.9), quantile(0.99));
        println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
    }

    println!();
    println!(
        "Cache: {} outcomes, {} dependency tokens",
        shared_services.cache.len(),
        shared_services.cache.dependencies().len()
    );

    listener.await.context("invalidation listener panicked")?;
    shared_services.runner.shutdown();

    Ok(())
}

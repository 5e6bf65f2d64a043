//! Two instances sharing one store compete for a `daily-report` job.
//!
//! Both runners tick the same interval schedule; on every fire time only
//! one of them takes the lease and runs the handler. A flaky `mailer`
//! dependency is retried behind a circuit breaker and exhausted runs end
//! up in the dead letter queue.
//!
//! Run with `RUST_LOG=warden=debug cargo run --example daily_report`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tracing_subscriber::EnvFilter;
use warden::*;

fn report_handler(calls: Arc<AtomicU32>) -> Arc<dyn JobHandler> {
    handler_fn(move |ctx: JobContext| {
        let calls = calls.clone();
        async move {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            tracing::info!(
                attempt = ctx.attempt,
                fencing_token = ctx.fencing_token.value(),
                "building daily report"
            );
            tokio::time::sleep(Duration::from_millis(200)).await;

            if !ctx.is_fence_current().await {
                anyhow::bail!("lease superseded; discarding report");
            }
            // Every third delivery fails to reach the mailer.
            if call % 3 == 2 {
                anyhow::bail!("mailer returned 503");
            }
            Ok(())
        }
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = WardenConfig::load(None)?;
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let bus = Arc::new(InProcEventBus::new(config.runner.event_capacity));
    let calls = Arc::new(AtomicU32::new(0));

    let job = JobDefinition::new("daily-report", IntervalSchedule::every_ms(1_000), report_handler(calls.clone()))
        .with_breaker("mailer")
        .with_retry(
            RetryConfig::default()
                .with_max_retries(2)
                .with_strategy(BackoffKind::Exponential, 100),
        )
        .with_payload(serde_json::json!({ "recipients": ["ops@example.com"] }));

    let runners = ["instance-a", "instance-b"]
        .into_iter()
        .map(|name| {
            JobRunnerBuilder::from_config(config.clone())
                .with_store(store.clone())
                .with_instance_id(InstanceId::new(name))
                .with_events(bus.clone())
                .with_runner_config(RunnerConfig {
                    tick_interval_ms: 100,
                    ..config.runner.clone()
                })
                .with_job(job.clone())
                .build()
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let mut events = bus.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match &event.payload {
                EventPayload::JobStarted { fencing_token, .. } => {
                    println!("[{}] started with token {fencing_token}", event.meta.instance_id)
                }
                EventPayload::JobSkipped { .. } => {
                    println!("[{}] skipped; lease held elsewhere", event.meta.instance_id)
                }
                EventPayload::JobDeadLettered { entry_id, .. } => {
                    println!("[{}] dead-lettered as {entry_id}", event.meta.instance_id)
                }
                _ => {}
            }
        }
    });

    for runner in &runners {
        runner.start()?;
    }
    tokio::time::sleep(Duration::from_secs(5)).await;
    for runner in &runners {
        runner.shutdown().await?;
    }
    printer.abort();

    for runner in &runners {
        let stats = runner.stats();
        println!(
            "{}: {} succeeded, {} failed, {} skipped",
            runner.instance_id(),
            stats.totals.succeeded,
            stats.totals.failed,
            stats.totals.skipped
        );
    }

    let dead_letters = runners[0].dead_letters().stats().await?;
    println!("dead letters: {}", dead_letters.total);
    println!("handler calls: {}", calls.load(Ordering::SeqCst));
    Ok(())
}

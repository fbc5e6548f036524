//! ETL Pipeline: split a CSV line, enrich it in parallel, branch on size.
//!
//! This demo shows:
//! 1. Function steps added with `add_func`
//! 2. A parallel fan-out whose sub-step outputs are merged by ID
//! 3. A conditional branch chosen from the running data
//! 4. Watching the event stream while the executor runs
//!
//! ```text
//! cargo run --example etl_pipeline -- "apple, banana, cherry, date"
//! ```

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use taskweave::prelude::*;

fn words(data: &Value) -> Vec<String> {
    data.as_array()
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect()
}

fn build_pipeline() -> Result<Workflow, WorkflowError> {
    let small = BaseStep::new("report_small", "Report small batch", |_ctx, input| async move {
        Ok(StepOutput::new(json!({ "batch": "small", "summary": input.data })))
    });
    let large = BaseStep::new("report_large", "Report large batch", |ctx, input| async move {
        // large batches are handed to a slower sink
        ctx.sleep(Duration::from_millis(100)).await?;
        Ok(StepOutput::new(json!({ "batch": "large", "summary": input.data })))
    });

    Workflow::builder("ETL pipeline")
        .description("Split, enrich and report a comma separated list")
        .retry_policy(RetryPolicy::fixed(2, Duration::from_millis(50)))
        .timeout(Duration::from_secs(10))
        .add_func("Extract", |_ctx, input| async move {
            let items: Vec<String> = input
                .data
                .as_str()
                .unwrap_or_default()
                .split(',')
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty())
                .collect();
            if items.is_empty() {
                return Err(WorkflowError::step("nothing to extract"));
            }
            Ok(StepOutput::new(items))
        })
        .parallel_funcs(
            "Enrich",
            [
                (
                    "Uppercase",
                    step_fn(|_ctx, input| async move {
                        let upper: Vec<String> =
                            words(&input.data).iter().map(|w| w.to_uppercase()).collect();
                        Ok(StepOutput::new(upper))
                    }),
                ),
                (
                    "Count",
                    step_fn(|_ctx, input| async move {
                        let count = words(&input.data).len();
                        Ok(StepOutput::new(count).with_variable("count", count))
                    }),
                ),
            ],
        )
        .conditional(
            "Route",
            |input: &StepInput| {
                let count = input.variable("count").and_then(Value::as_u64).unwrap_or(0);
                let branch = if count > 3 { "large" } else { "small" };
                branch.to_string()
            },
            [
                ("small", Arc::new(small) as Arc<dyn Step>),
                ("large", Arc::new(large) as Arc<dyn Step>),
            ],
        )
        .build()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let line = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "apple, banana, cherry, date".to_string());

    let executor = Executor::builder()
        .store(Arc::new(MemoryStore::new()))
        .event_handler(LoggingEventHandler)
        .build();

    let mut events = executor.subscribe();
    let watcher = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            let step = event.step_id.as_deref().unwrap_or("-");
            println!("[event] {:<20} {}", event.event_type.to_string(), step);
            if matches!(
                event.event_type,
                EventType::WorkflowCompleted | EventType::WorkflowFailed | EventType::WorkflowCancelled
            ) {
                break;
            }
        }
    });

    let workflow = Arc::new(build_pipeline()?);
    match executor.run(workflow, WorkflowInput::new(line)).await {
        Ok(output) => {
            println!("Workflow completed in {:?}", output.duration);
            println!("{}", serde_json::to_string_pretty(&output.data)?);
        }
        Err(error) => println!("Workflow failed: {}", error),
    }

    watcher.await?;
    Ok(())
}

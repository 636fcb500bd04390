//! Monthly taxi pipeline wired with in-memory collaborators.
//!
//! cargo run --example monthly_pipeline -- 2024-03

use std::sync::Arc;
use std::time::Duration;

use periodag::{
    BoxTask, FnTask, Graph, LogNotifier, MemoryObjectStore, ObjectStore, ParamRules, Period,
    RetryPolicy, Scheduler, SchedulerConfig, TaskError, UploadTask,
};

const BUCKET: &str = "lakehouse";

/// Stand-in for a Spark job writing one partition keyed by the period.
fn spark_job(store: &Arc<dyn ObjectStore>, id: &str, deps: &[&str], table: &'static str) -> BoxTask {
    let store = store.clone();
    Arc::new(
        FnTask::new(id, move |ctx| {
            let store = store.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                let key = ctx.render(&format!("{table}/year={{year}}/month={{month_unpadded}}"))?;
                store.put_object(BUCKET, &key, Vec::new()).await
            }
        })
        .depends_on(deps.iter().copied())
        .with_policy(RetryPolicy::fixed(1, Duration::from_millis(500))),
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_target(false).init();

    let period: Period = match std::env::args().nth(1) {
        Some(arg) => arg.parse()?,
        None => Period::new(2024, 3)?,
    };

    let store: Arc<dyn ObjectStore> = Arc::new(MemoryObjectStore::new());

    let download: BoxTask = Arc::new(FnTask::new("download_dataset_task", |ctx| async move {
        let file = ctx.require("dataset_file")?;
        if file.is_empty() {
            return Err(TaskError::permanent("empty dataset name"));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(())
    }));

    let tasks: Vec<BoxTask> = vec![
        download,
        Arc::new(UploadTask::from_bytes(
            "load_csv_to_minio_task",
            store.clone(),
            b"LocationID,Borough,Zone".to_vec(),
            BUCKET,
            "raw/taxi_zone_lookup.csv",
        )),
        Arc::new(
            UploadTask::from_bytes("load_to_minio_task", store.clone(), b"PAR1".to_vec(), BUCKET, "{object_name}")
                .depends_on(["download_dataset_task", "load_csv_to_minio_task"]),
        ),
        spark_job(&store, "bronze_to_silver_task", &["load_to_minio_task"], "silver/green_trips"),
        spark_job(&store, "validate_silver_task", &["bronze_to_silver_task"], "silver/_validated"),
        spark_job(&store, "fact_trip_task", &["validate_silver_task"], "gold/fact_trip"),
        spark_job(&store, "dim_weekday_task", &["fact_trip_task"], "gold/dim_weekday"),
        spark_job(&store, "dim_paymenttype_task", &["fact_trip_task"], "gold/dim_paymenttype"),
        spark_job(&store, "dim_location_task", &["fact_trip_task"], "gold/dim_location"),
        Arc::new(
            FnTask::new("sending_slack_notification", |_| async { Ok(()) }).depends_on([
                "fact_trip_task",
                "dim_weekday_task",
                "dim_paymenttype_task",
                "dim_location_task",
            ]),
        ),
    ];

    let rules = ParamRules::new([
        ("dataset_file", "green_tripdata_%Y-%m.parquet"),
        ("object_name", "raw/%Y/%m/green_tripdata_%Y-%m.parquet"),
    ])?;
    let scheduler = Scheduler::new(Graph::new(tasks)?, rules, SchedulerConfig { workers: 3 })
        .with_notifier(Arc::new(LogNotifier::new("nyc_taxi")));

    println!("=== graph ===\n{}", scheduler.graph().render_tree());

    let report = scheduler.submit(period).await;
    println!("=== report ===\n{}", report.to_json()?);
    println!("{}", report.summary());
    Ok(())
}

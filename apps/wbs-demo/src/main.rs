use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use wbs_stream::{
    CounterStore, Entity, InMemoryRepository, InMemoryStreamStore, Pipeline, StreamStore,
    SyncResult, WbsConfig, WriteBehindProducer,
};

/// Run time when Ctrl-C is not pressed first.
const RUN_FOR: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Employer {
    id: i64,
    email: String,
}

impl Entity for Employer {
    const ENTITY_TYPE: &'static str = "Employer";
}

#[tokio::main]
async fn main() {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,wbs_stream=debug")),
        )
        .init();

    // Load configuration
    let config = WbsConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Configuration error: {e}");
        std::process::exit(1);
    });

    tracing::info!(
        stream_prefix = %config.stream_prefix,
        max_attempts = config.reconciler.max_attempts,
        "starting write-behind demo"
    );

    #[cfg(feature = "redis")]
    if let Ok(url) = std::env::var("WBS_REDIS_URL") {
        let store = wbs_stream::RedisStreamStore::connect(&url)
            .await
            .unwrap_or_else(|e| {
                eprintln!("Redis connection error: {e}");
                std::process::exit(1);
            });
        exit_on_error(run(config, Arc::new(store)).await);
        return;
    }

    exit_on_error(run(config, Arc::new(InMemoryStreamStore::new())).await);
}

fn exit_on_error(result: SyncResult<()>) {
    if let Err(e) = result {
        eprintln!("Demo error: {e}");
        std::process::exit(1);
    }
}

async fn run<S>(config: WbsConfig, store: Arc<S>) -> SyncResult<()>
where
    S: StreamStore + CounterStore + 'static,
{
    let jpa = Arc::new(InMemoryRepository::new(|e: &Employer| e.id));
    let cache = Arc::new(InMemoryRepository::new(|e: &Employer| e.id));

    let jpa_pipeline = Pipeline::builder::<Employer>("jpa")
        .config(config.clone())
        .store(store.clone())
        .repository("employer-jpa", jpa.clone())
        .build()
        .await?;
    let redis_pipeline = Pipeline::builder::<Employer>("redis")
        .config(config.clone())
        .store(store.clone())
        .repository("employer-redis", cache.clone())
        .build()
        .await?;

    let jpa_handle = jpa_pipeline.start().await?;
    let redis_handle = redis_pipeline.start().await?;

    let producer = WriteBehindProducer::<Employer>::new(store, &config.stream_prefix);
    for (id, email) in [(1, "ada@example.com"), (2, "grace@example.com"), (3, "linus@example.com")] {
        producer
            .save(&Employer {
                id,
                email: email.to_string(),
            })
            .await?;
    }
    producer.delete(2).await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("Ctrl-C received"),
        () = tokio::time::sleep(RUN_FOR) => {}
    }

    jpa_handle.shutdown().await;
    redis_handle.shutdown().await;

    for (name, repository) in [("jpa", &jpa), ("redis", &cache)] {
        let mut ids: Vec<i64> = repository.all().await.iter().map(|e| e.id).collect();
        ids.sort_unstable();
        tracing::info!(repository = name, ids = ?ids, "repository contents");
    }

    Ok(())
}

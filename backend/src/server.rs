use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tracing::{info, warn};

use backend::api::{router, AppState};
use backend::config::Args;
use backend::sentiment::{FeedbackProcessor, JsonlIndex, LexiconAnalyzer};
use backend::{BucketSampler, ConfigError, PartitionedStore, ReviewTable};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,hyper=warn".into()),
        )
        .init();

    let args = Args::parse();

    // Missing table settings are reported per request, not at startup
    let tables = args.table_settings();
    let review_table: Result<Arc<ReviewTable>, ConfigError> = match &tables {
        Ok(settings) => Ok(Arc::new(
            ReviewTable::open(
                &args.data_dir,
                &settings.table_name,
                &settings.index_name,
                args.page_size,
            )
            .await
            .with_context(|| format!("opening table {}", settings.table_name))?,
        )),
        Err(e) => {
            warn!(error = %e, "sampling disabled until table settings are provided");
            Err(e.clone())
        }
    };

    let sampler = review_table.clone().map(|table| {
        Arc::new(BucketSampler::new(
            table as Arc<dyn PartitionedStore>,
            args.sampler_config(),
        ))
    });

    let feedback = match args.feedback_table() {
        Ok(name) => {
            let store: Arc<dyn PartitionedStore> = match (&review_table, &tables) {
                (Ok(table), Ok(settings)) if settings.table_name == name => {
                    table.clone() as Arc<dyn PartitionedStore>
                }
                _ => {
                    let index_name = tables
                        .as_ref()
                        .map(|s| s.index_name.clone())
                        .unwrap_or_else(|_| "RandomAccessIndex".to_string());
                    let table =
                        ReviewTable::open(&args.data_dir, &name, &index_name, args.page_size)
                            .await
                            .with_context(|| format!("opening feedback table {name}"))?;
                    Arc::new(table) as Arc<dyn PartitionedStore>
                }
            };
            let index = JsonlIndex::open(args.search_index_path())
                .context("opening search index")?;
            Ok(Arc::new(FeedbackProcessor::new(
                Arc::new(LexiconAnalyzer::new()),
                store,
                Arc::new(index),
            )))
        }
        Err(e) => {
            warn!(error = %e, "feedback enrichment disabled");
            Err(e)
        }
    };

    let state = Arc::new(AppState {
        sampler,
        feedback,
        request_deadline: args.request_deadline(),
    });
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("binding {}", args.bind))?;

    info!(
        bind = %args.bind,
        data_dir = %args.data_dir.display(),
        strategy = args.strategy().name(),
        "review sampler listening"
    );
    axum::serve(listener, app).await?;

    Ok(())
}

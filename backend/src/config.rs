use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::error::ConfigError;
use crate::sampler::{SamplerConfig, Strategy};
use crate::store::DEFAULT_PAGE_SIZE;
use crate::BUCKET_COUNT;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum StrategyKind {
    EvenSplit,
    Oversample,
    RatioBalanced,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "server", about = "Random review sampling and feedback enrichment service")]
pub struct Args {
    #[arg(long, env = "BIND_ADDR", default_value = "127.0.0.1:8000")]
    pub bind: String,

    /// Directory holding the table and index files.
    #[arg(long, env = "DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    /// Review table sampled by `/reviews`. Required.
    #[arg(long, env = "TABLE_NAME")]
    pub table_name: Option<String>,

    /// Name of the bucket index on the review table. Required.
    #[arg(long = "table-index", env = "TABLE_GSI")]
    pub table_index: Option<String>,

    /// Table that `/feedback` writes enriched reviews into; defaults to the review table.
    #[arg(long, env = "FEEDBACK_TABLE")]
    pub feedback_table: Option<String>,

    /// JSON lines file standing in for the search index.
    #[arg(long, env = "SEARCH_INDEX_PATH")]
    pub search_index: Option<PathBuf>,

    #[arg(long, env = "SAMPLING_STRATEGY", value_enum, default_value_t = StrategyKind::Oversample)]
    pub strategy: StrategyKind,

    /// Share of a ratio-balanced batch drawn from positive reviews.
    #[arg(long, env = "POSITIVE_RATIO", default_value_t = 0.5)]
    pub positive_ratio: f64,

    /// Rows returned by one store call at most.
    #[arg(long, env = "STORE_PAGE_SIZE", default_value_t = DEFAULT_PAGE_SIZE)]
    pub page_size: usize,

    #[arg(long, env = "MAX_SKIP_PAGES", default_value_t = 64)]
    pub max_skip_pages: usize,

    #[arg(long, env = "REQUEST_DEADLINE_MS", default_value_t = 5_000)]
    pub request_deadline_ms: u64,

    #[arg(long, env = "MIN_BUCKET_BUDGET_MS", default_value_t = 50)]
    pub min_bucket_budget_ms: u64,
}

/// Names that must be present before any sampling query is issued.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableSettings {
    pub table_name: String,
    pub index_name: String,
}

fn present(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

impl Args {
    pub fn table_settings(&self) -> Result<TableSettings, ConfigError> {
        let table_name = present(&self.table_name);
        let index_name = present(&self.table_index);
        match (table_name, index_name) {
            (Some(table_name), Some(index_name)) => Ok(TableSettings {
                table_name,
                index_name,
            }),
            (table_name, index_name) => {
                let mut missing = Vec::new();
                if table_name.is_none() {
                    missing.push("TABLE_NAME");
                }
                if index_name.is_none() {
                    missing.push("TABLE_GSI");
                }
                Err(ConfigError::Missing(missing))
            }
        }
    }

    /// Feedback table name, falling back to the review table.
    pub fn feedback_table(&self) -> Result<String, ConfigError> {
        present(&self.feedback_table)
            .or_else(|| present(&self.table_name))
            .ok_or_else(|| ConfigError::Missing(vec!["FEEDBACK_TABLE"]))
    }

    pub fn search_index_path(&self) -> PathBuf {
        self.search_index
            .clone()
            .unwrap_or_else(|| self.data_dir.join("search-index.jsonl"))
    }

    pub fn strategy(&self) -> Strategy {
        match self.strategy {
            StrategyKind::EvenSplit => Strategy::EvenSplit,
            StrategyKind::Oversample => Strategy::Oversample,
            StrategyKind::RatioBalanced => Strategy::RatioBalanced {
                positive_ratio: self.positive_ratio,
            },
        }
    }

    pub fn sampler_config(&self) -> SamplerConfig {
        SamplerConfig {
            strategy: self.strategy(),
            bucket_count: BUCKET_COUNT,
            max_skip_pages: self.max_skip_pages.max(1),
            min_bucket_budget: Duration::from_millis(self.min_bucket_budget_ms),
        }
    }

    pub fn request_deadline(&self) -> Duration {
        Duration::from_millis(self.request_deadline_ms)
    }
}

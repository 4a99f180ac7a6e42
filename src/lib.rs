pub mod cancellation;
pub mod commands;
pub mod completion;
pub mod config;
pub mod db;
pub mod llm;

use cancellation::CancellationRegistry;
use completion::{CompletionDriver, GenerationDispatcher};
use config::AppConfig;
use db::{Database, DbError};
use llm::openai::OpenAiClient;
use llm::{CompletionProvider, LlmError};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("failed to open database: {0}")]
    Database(#[from] DbError),
    #[error("failed to build provider client: {0}")]
    Provider(#[from] LlmError),
}

/// Everything the commands need, shared for the lifetime of the app.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub registry: CancellationRegistry,
    pub dispatcher: GenerationDispatcher,
    pub config: AppConfig,
}

impl AppState {
    pub fn open(config: AppConfig) -> Result<Self, InitError> {
        let database = Database::new(&config.data_dir)?;
        let provider = OpenAiClient::new(config.provider())?;
        Ok(Self::assemble(Arc::new(database), Arc::new(provider), config))
    }

    pub fn assemble(
        db: Arc<Database>,
        provider: Arc<dyn CompletionProvider>,
        config: AppConfig,
    ) -> Self {
        let registry = CancellationRegistry::new(db.clone());
        let driver = CompletionDriver::new(db.clone(), registry.clone(), provider, config.driver());
        let dispatcher = GenerationDispatcher::new(Arc::new(driver), registry.clone());
        Self {
            db,
            registry,
            dispatcher,
            config,
        }
    }
}

/// Installs the global subscriber. `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("ai_box=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

//! Application state wiring the engine to its SQLite store.
//!
//! The engine is generic over its repositories; `AppState` pins it to the
//! concrete infra implementations and holds everything commands share.

use std::path::PathBuf;
use std::sync::Arc;

use flowkeep_core::flow::{FlowRegistry, StateMachine};
use flowkeep_core::identity::Signer;
use flowkeep_core::oracle::{OracleService, RatesFixFlow, TransactionHook};
use flowkeep_infra::config::{load_engine_config, resolve_data_dir};
use flowkeep_infra::crypto::ed25519::{Ed25519Identity, Ed25519Verifier, IDENTITY_FILE};
use flowkeep_infra::sqlite::checkpoint::SqliteCheckpointStore;
use flowkeep_infra::sqlite::hospital::SqliteHospitalRepository;
use flowkeep_infra::sqlite::pool::{DatabasePool, database_url};
use flowkeep_types::config::EngineConfig;
use flowkeep_types::oracle::Fix;
use flowkeep_types::session::PartyId;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cli::demo::FixedRateOutput;

/// Party the CLI's own flows speak as.
pub const BANK: &str = "bank";

/// Party the in-process oracle answers for.
pub const ORACLE: &str = "oracle";

/// The state machine pinned to the SQLite repositories.
pub type Engine = StateMachine<Arc<SqliteCheckpointStore>, Arc<SqliteHospitalRepository>>;

/// Shared state for every command.
pub struct AppState {
    pub data_dir: PathBuf,
    pub config: EngineConfig,
    pub db_pool: DatabasePool,
    pub checkpoints: Arc<SqliteCheckpointStore>,
    pub cases: Arc<SqliteHospitalRepository>,
    /// Key of this node; the demo oracle signs with it.
    pub identity: Arc<Ed25519Identity>,
}

impl AppState {
    /// Create the data directory if needed, open the database and load the
    /// node identity and engine configuration.
    pub async fn init() -> anyhow::Result<Self> {
        let data_dir = resolve_data_dir();
        tokio::fs::create_dir_all(&data_dir).await?;

        let db_pool = DatabasePool::new(&database_url(&data_dir)).await?;
        let identity = Ed25519Identity::load_or_generate(&data_dir.join(IDENTITY_FILE)).await?;
        let config = load_engine_config(&data_dir).await;

        tracing::debug!(
            data_dir = %data_dir.display(),
            key = identity.public_key().short(),
            "application state ready"
        );

        Ok(Self {
            checkpoints: Arc::new(SqliteCheckpointStore::new(db_pool.clone())),
            cases: Arc::new(SqliteHospitalRepository::new(db_pool.clone())),
            identity: Arc::new(identity),
            data_dir,
            config,
            db_pool,
        })
    }

    /// Build an engine with every flow the CLI knows how to restore.
    pub fn engine(&self, config: EngineConfig) -> Engine {
        let mut registry = FlowRegistry::new();
        RatesFixFlow::register(
            &mut registry,
            Some(Arc::new(FixedRateOutput) as Arc<dyn TransactionHook>),
        );

        StateMachine::builder(self.checkpoints.clone(), self.cases.clone())
            .config(config)
            .party(PartyId::new(BANK))
            .registry(registry)
            .verifier(Arc::new(Ed25519Verifier))
            .build()
    }

    /// Serve `fix` as the oracle party on the engine's session hub until
    /// `cancel` fires.
    pub fn serve_oracle(&self, engine: &Engine, fix: Fix, cancel: CancellationToken) -> JoinHandle<()> {
        let oracle = OracleService::new(
            PartyId::new(ORACLE),
            self.identity.clone(),
            engine.session_hub().clone(),
        )
        .with_fix(fix);
        Arc::new(oracle).spawn(cancel)
    }
}

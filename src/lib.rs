pub mod config;
pub mod document;
pub mod error;
pub mod importer;
pub mod merge;
pub mod retry;
pub mod state;
pub mod store;

pub use config::{ImportJob, ImportMode, PartitionClass};
pub use document::Document;
pub use error::ImportError;
pub use importer::{ImportOrchestrator, RunSummary};
pub use merge::MergePlanner;
pub use state::StateTracker;
pub use store::DocumentStore;

use env_logger::Env;
use std::sync::Once;

static LOGGER: Once = Once::new();

pub fn init_logger() {
    LOGGER.call_once(|| {
        env_logger::Builder::from_env(Env::default().default_filter_or("info,sqlx=warn")).init();
    });
}

#[cfg_attr(not(test), allow(dead_code))]
pub mod test_support {
    use crate::config::{ImportJob, ImportMode, PartitionClass};
    use serde_json::Value;
    use std::fs;
    use std::io;
    use std::path::{Path, PathBuf};

    pub use database::{TestDatabase, TestDatabaseError};

    /// Data root laid out the way the exporter writes it.
    pub struct SourceTree {
        root: PathBuf,
        user: String,
    }

    impl SourceTree {
        pub fn new(root: &Path) -> Self {
            Self {
                root: root.to_path_buf(),
                user: "u1".to_string(),
            }
        }

        pub fn root(&self) -> &Path {
            &self.root
        }

        pub fn month_dir(&self, class: PartitionClass, month: &str) -> PathBuf {
            self.root
                .join(format!("{}_{}_all_{}_alphas", self.user, month, class.as_str()))
        }

        /// Write `body` as `<name>.json` into the month directory, returning its path.
        pub fn write(
            &self,
            class: PartitionClass,
            month: &str,
            name: &str,
            body: &Value,
        ) -> io::Result<PathBuf> {
            let dir = self.month_dir(class, month);
            fs::create_dir_all(&dir)?;
            let path = dir.join(format!("{}.json", name));
            fs::write(&path, serde_json::to_vec_pretty(body)?)?;
            Ok(path)
        }

        /// Unit id the scanner assigns to `<name>.json` in that month directory.
        pub fn unit_id(&self, class: PartitionClass, month: &str, name: &str) -> String {
            format!("{}_{}_all_{}_alphas/{}.json", self.user, month, class.as_str(), name)
        }
    }

    /// Job with small, deterministic settings for tests.
    pub fn test_job(data_root: &Path, state_db: &Path, mode: ImportMode) -> ImportJob {
        ImportJob {
            mode,
            workers: 2,
            batch_size: 2,
            data_root: data_root.to_path_buf(),
            state_db: state_db.to_path_buf(),
            regular_collection: "regular_alphas".to_string(),
            super_collection: "super_alphas".to_string(),
            classes: PartitionClass::ORDERED.to_vec(),
            months: Vec::new(),
            key_field: "id".to_string(),
            validate: false,
            recent_months: None,
            since: None,
            until: None,
            write_retries: 2,
            tracker_retries: 2,
            retry_backoff_ms: 1,
            ..ImportJob::from_env()
        }
    }

    pub mod database {
        use crate::store::PgDocumentStore;
        use log::LevelFilter;
        use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
        use sqlx::{ConnectOptions, PgPool};
        use testcontainers::{ContainerAsync, core::error::TestcontainersError, runners::AsyncRunner};
        use testcontainers_modules::postgres::Postgres;
        use thiserror::Error;

        #[derive(Debug, Error)]
        pub enum TestDatabaseError {
            #[error("database error: {0}")]
            Sqlx(#[from] sqlx::Error),
            #[error("store error: {0}")]
            Store(#[from] crate::error::StoreError),
            #[error("container error: {0}")]
            Container(#[from] TestcontainersError),
        }

        /// Disposable Postgres with the document store schema applied.
        pub struct TestDatabase {
            pool: PgPool,
            _container: ContainerAsync<Postgres>,
        }

        impl TestDatabase {
            /// Launch a Postgres container. Fails with `Container` when no container
            /// runtime is available.
            pub async fn new() -> Result<Self, TestDatabaseError> {
                let container = Postgres::default().start().await?;

                let host = container.get_host().await?.to_string();
                let port = container.get_host_port_ipv4(5432).await?;
                let url = format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

                let options: PgConnectOptions = url.parse()?;
                let pool = PgPoolOptions::new()
                    .max_connections(5)
                    .connect_with(options.log_statements(LevelFilter::Off))
                    .await?;

                let store = PgDocumentStore::from_pool(pool.clone());
                store.migrate().await?;

                Ok(Self {
                    pool,
                    _container: container,
                })
            }

            pub fn pool(&self) -> &PgPool {
                &self.pool
            }

            pub fn store(&self) -> PgDocumentStore {
                PgDocumentStore::from_pool(self.pool.clone())
            }
        }
    }
}

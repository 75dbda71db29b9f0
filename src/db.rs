//! Database connection management
//!
//! Builds the connection pool the introspector and executor share, with
//! optional rustls transport, and sends cancel requests over the same TLS
//! setting the pool uses.

use crate::config::DatabaseConfig;
use crate::error::{introspection_error, sanitize_db_error, ReconcileError, ReconcileResult};
use deadpool_postgres::{Config, ManagerConfig, Pool, RecyclingMethod, Runtime};
use tokio_postgres::{CancelToken, NoTls};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{debug, info, warn};

/// Pooled access to the target database
#[derive(Clone)]
pub struct Database {
    pool: Pool,
    tls: Option<MakeRustlsConnect>,
}

impl Database {
    /// Create the pool and check that the database answers
    pub async fn connect(config: &DatabaseConfig) -> ReconcileResult<Self> {
        let tls = config.require_tls.then(Self::tls_connector);
        let pool = Self::create_pool(config, tls.clone())?;
        let database = Self { pool, tls };
        database.verify().await?;

        info!(
            "✅ Database connection successful ({}:{}/{}, TLS: {})",
            config.host, config.port, config.database, config.require_tls
        );
        Ok(database)
    }

    /// Wrap an existing plain-TCP pool
    pub fn from_pool(pool: Pool) -> Self {
        Self { pool, tls: None }
    }

    fn create_pool(config: &DatabaseConfig, tls: Option<MakeRustlsConnect>) -> ReconcileResult<Pool> {
        let mut cfg = Config::new();
        cfg.host = Some(config.host.clone());
        cfg.port = Some(config.port);
        cfg.user = Some(config.user.clone());
        cfg.password = Some(config.password.clone());
        cfg.dbname = Some(config.database.clone());
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        cfg.pool = Some(deadpool_postgres::PoolConfig::new(config.max_pool_size));

        let pool = match tls {
            Some(tls) => cfg.create_pool(Some(Runtime::Tokio1), tls),
            None => cfg.create_pool(Some(Runtime::Tokio1), NoTls),
        };
        pool.map_err(|e| ReconcileError::Pool(format!("Failed to create pool: {}", e)))
    }

    /// TLS connector trusting the platform's root certificates
    fn tls_connector() -> MakeRustlsConnect {
        let certs = rustls_native_certs::load_native_certs();
        for error in &certs.errors {
            warn!("⚠️  Skipping unreadable native certificate: {}", error);
        }
        let mut root_store = rustls::RootCertStore::empty();
        for cert in certs.certs {
            root_store.add(cert).ok();
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        MakeRustlsConnect::new(tls_config)
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Run a trivial query through the pool; an unreachable server is an introspection failure
    pub async fn verify(&self) -> ReconcileResult<()> {
        let client = self.pool.get().await.map_err(|e| {
            introspection_error(format!("Failed to connect to the database: {}", sanitize_db_error(&e)))
        })?;
        client.query_one("SELECT 1", &[]).await.map_err(|e| {
            introspection_error(format!("Failed to verify database connection: {}", sanitize_db_error(&e)))
        })?;
        Ok(())
    }

    /// Ask the server to cancel whatever the token's connection is running
    pub async fn cancel(&self, token: CancelToken) {
        let result = match &self.tls {
            Some(tls) => token.cancel_query(tls.clone()).await,
            None => token.cancel_query(NoTls).await,
        };
        match result {
            Ok(()) => debug!("Cancel request delivered"),
            Err(e) => warn!("⚠️  Cancel request failed: {}", sanitize_db_error(&e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_config() -> DatabaseConfig {
        // Nothing listens on port 1
        DatabaseConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            ..DatabaseConfig::default()
        }
    }

    #[test]
    fn test_unreachable_server_is_introspection_error() {
        let err = match tokio_test::block_on(Database::connect(&unreachable_config())) {
            Ok(_) => panic!("connected to a closed port"),
            Err(e) => e,
        };
        match err {
            ReconcileError::Introspection { message } => {
                assert!(message.starts_with("Failed to connect to the database"), "{}", message)
            }
            other => panic!("expected introspection error, got {:?}", other),
        }
    }

    #[test]
    fn test_pool_creation_does_not_connect() {
        let pool = Database::create_pool(&unreachable_config(), None);
        assert!(pool.is_ok());
    }
}

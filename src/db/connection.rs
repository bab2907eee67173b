use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use surrealdb::engine::any::Any;
use surrealdb::opt::auth::Root;
use surrealdb::Surreal;

pub type Db = Surreal<Any>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub namespace: String,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: env::var("SURREALDB_URL")
                .unwrap_or_else(|_| "memory".to_string()),
            namespace: env::var("SURREALDB_NAMESPACE")
                .unwrap_or_else(|_| "plugins".to_string()),
            database: env::var("SURREALDB_DATABASE")
                .unwrap_or_else(|_| "scheduler".to_string()),
            username: env::var("SURREALDB_USERNAME").ok(),
            password: env::var("SURREALDB_PASSWORD").ok(),
        }
    }
}

/// Open a store handle.
///
/// Every scheduler component receives a clone of this handle per call; there
/// is no process-wide session. With `"memory"` each call to this function
/// yields an independent store, so racing processes must share one handle (or
/// point at a shared server URL).
pub async fn create_connection(config: DatabaseConfig) -> Result<Db> {
    let db = surrealdb::engine::any::connect(config.url).await?;

    // Sign in if credentials are provided
    if let (Some(username), Some(password)) = (config.username, config.password) {
        db.signin(Root {
            username: &username,
            password: &password,
        })
        .await?;
    }

    db.use_ns(config.namespace).use_db(config.database).await?;

    Ok(db)
}

pub async fn ensure_schema(db: &Db) -> Result<()> {
    let schema_queries = vec![
        // Recurring job definitions
        "DEFINE TABLE IF NOT EXISTS schedule SCHEMALESS;
         DEFINE FIELD IF NOT EXISTS plugin_name ON TABLE schedule TYPE string;
         DEFINE FIELD IF NOT EXISTS interval_seconds ON TABLE schedule TYPE int ASSERT $value > 0;
         DEFINE FIELD IF NOT EXISTS enabled ON TABLE schedule TYPE bool;
         DEFINE FIELD IF NOT EXISTS owner_user_id ON TABLE schedule TYPE option<string>;
         DEFINE FIELD IF NOT EXISTS next_run_at ON TABLE schedule TYPE option<datetime>;
         DEFINE FIELD IF NOT EXISTS last_run_at ON TABLE schedule TYPE option<datetime>;
         DEFINE FIELD IF NOT EXISTS claimed_until ON TABLE schedule TYPE option<datetime>;
         DEFINE FIELD IF NOT EXISTS claim_token ON TABLE schedule TYPE option<string>;
         DEFINE FIELD IF NOT EXISTS version ON TABLE schedule TYPE int;",

        // Individual tracked invocations
        "DEFINE TABLE IF NOT EXISTS execution SCHEMALESS;
         DEFINE FIELD IF NOT EXISTS schedule_id ON TABLE execution TYPE option<record<schedule>>;
         DEFINE FIELD IF NOT EXISTS plugin_name ON TABLE execution TYPE string;
         DEFINE FIELD IF NOT EXISTS user_id ON TABLE execution TYPE string;
         DEFINE FIELD IF NOT EXISTS status ON TABLE execution TYPE string
            ASSERT $value IN ['PENDING', 'RUNNING', 'COMPLETED', 'FAILED'];
         DEFINE FIELD IF NOT EXISTS error ON TABLE execution TYPE option<string>;
         DEFINE FIELD IF NOT EXISTS started_at ON TABLE execution TYPE option<datetime>;
         DEFINE FIELD IF NOT EXISTS completed_at ON TABLE execution TYPE option<datetime>;
         DEFINE FIELD IF NOT EXISTS version ON TABLE execution TYPE int;",

        // Indexes for the claim queries
        "DEFINE INDEX IF NOT EXISTS schedule_next_run ON TABLE schedule COLUMNS enabled, next_run_at;
         DEFINE INDEX IF NOT EXISTS execution_schedule ON TABLE execution COLUMNS schedule_id, status;
         DEFINE INDEX IF NOT EXISTS execution_status ON TABLE execution COLUMNS status;",
    ];

    for query in schema_queries {
        db.query(query).await?.check()?;
    }

    Ok(())
}

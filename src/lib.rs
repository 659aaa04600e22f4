//! Process-scoped core (spec.md §9): loads the schema and configuration,
//! wires the Connection Manager, Notification Engine, and HTTP Front Door
//! together, and serves. Nothing here is global state — a test can build
//! as many `Core`s as it likes.

pub mod audit;
pub mod auth;
pub mod cm;
pub mod config;
pub mod error;
pub mod idl;
pub mod notify;
pub mod read_engine;
pub mod routes;
pub mod schema;
#[cfg(test)]
mod testutil;
pub mod uri;
pub mod validator;
pub mod value;
pub mod write_engine;
pub mod ws;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use crate::auth::{AllowAll, PermissionCheck, SessionKeys};
use crate::cm::{ConnectionManager, ConnectionManagerConfig};
use crate::config::Config;
use crate::notify::NotificationEngine;
use crate::routes::account::AccountStore;
use crate::routes::AppState;
use crate::schema::{RawSchema, Schema};

/// A running gateway: the Connection Manager's background tick loop plus
/// the HTTP Front Door. Built once from `Config` at process start.
pub struct Core {
    pub state: Arc<AppState>,
    pub bind_addr: SocketAddr,
}

impl Core {
    pub async fn bootstrap(config: Config) -> anyhow::Result<Self> {
        let schema = Arc::new(load_schema(&config.schema_path)?);
        let idl = Arc::new(idl::MemoryIdl::new());

        let cm_config = ConnectionManagerConfig {
            tick_interval: Duration::from_millis(config.connection_manager_tick_ms),
            ..ConnectionManagerConfig::default()
        };
        let cm = ConnectionManager::new(schema.clone(), idl.clone(), cm_config);

        let notify = Arc::new(NotificationEngine::new(schema.clone(), idl.clone()));
        {
            let notify = notify.clone();
            cm.on_changes(Box::new(move |_schema: &Schema, _idl: &idl::MemoryIdl| notify.tick()));
        }

        tokio::spawn(cm.clone().run());

        let validators = Arc::new(validator::default_registry());
        let session_keys = Arc::new(SessionKeys::generate());
        let permissions: Arc<dyn PermissionCheck> = Arc::new(AllowAll);
        let account = Arc::new(load_account_store(&config.account_schema_path)?);

        let state = AppState::new(cm, notify, validators, session_keys, permissions, account, &config);

        Ok(Self { state, bind_addr: config.bind_addr })
    }

    pub async fn serve(self) -> anyhow::Result<()> {
        let router = routes::build_router(self.state);
        let listener = TcpListener::bind(self.bind_addr).await?;
        tracing::info!(addr = %self.bind_addr, "listening");
        axum::serve(listener, router).await?;
        Ok(())
    }
}

fn load_schema(path: &std::path::Path) -> anyhow::Result<Schema> {
    let raw = std::fs::read_to_string(path)?;
    let raw: RawSchema = serde_json::from_str(&raw)?;
    Ok(Schema::load(raw)?)
}

fn load_account_store(path: &std::path::Path) -> anyhow::Result<AccountStore> {
    let raw = std::fs::read_to_string(path)?;
    let schema_json: serde_json::Value = serde_json::from_str(&raw)?;
    // Validate once at startup that the schema itself compiles; `AccountStore`
    // recompiles it per write (see its doc comment).
    jsonschema::JSONSchema::compile(&schema_json).map_err(|e| anyhow::anyhow!(e.to_string()))?;
    Ok(AccountStore::new(schema_json, serde_json::json!({})))
}

use std::sync::Arc;

use canvas_collab::config::CollabConfig;
use canvas_collab::db;
use canvas_collab::presence::{PgPresenceStore, PresenceEngine, StaticIdentity};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();

    let config = CollabConfig::from_env().expect("invalid collaboration config");
    let document_id = config.document_id;

    let pool = db::init_pool(&config.database_url, config.db_max_connections)
        .await
        .expect("database init failed");
    let store = Arc::new(PgPresenceStore::new(pool));
    let identity = Arc::new(match config.user_id {
        Some(user_id) => StaticIdentity::signed_in(user_id),
        None => StaticIdentity::anonymous(),
    });

    let engine = PresenceEngine::builder(store, identity)
        .freshness(config.presence.freshness)
        .build();
    let mut views = engine.watch();

    let phase = engine.subscribe(document_id).await;
    engine.join(document_id).await;
    engine.spawn_heartbeat(document_id, config.presence.heartbeat);
    tracing::info!(%document_id, ?phase, user_id = ?config.user_id, "presence monitor started");

    loop {
        tokio::select! {
            changed = views.changed() => {
                if changed.is_err() {
                    break;
                }
                let collaborators = views.borrow_and_update().collaborators();
                let users: Vec<String> = collaborators.iter().map(|c| c.user_id.to_string()).collect();
                tracing::info!(%document_id, count = users.len(), users = ?users, "collaborators");
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    engine.leave(document_id).await;
    engine.teardown().await;
    tracing::info!(%document_id, "presence monitor stopped");
}

mod db;
mod envelope;
mod routes;
mod services;
mod state;

use std::sync::Arc;

use services::conversation::{ConversationStore, PgStore};
use services::memory::MemoryStore;
use services::token::TokenVerifier;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();

    let port: u16 = std::env::var("PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()
        .expect("invalid PORT");
    let verifier = TokenVerifier::from_env().expect("JWT_SECRET required");

    let store: Arc<dyn ConversationStore> = match std::env::var("DATABASE_URL") {
        Ok(database_url) => {
            let pool = db::init_pool(&database_url)
                .await
                .expect("database init failed");
            Arc::new(PgStore::new(pool))
        }
        Err(_) => {
            tracing::warn!("DATABASE_URL not set, conversations are in-memory only");
            Arc::new(MemoryStore::new())
        }
    };

    let state = state::AppState::new(store, verifier);

    let app = routes::app(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .expect("failed to bind");

    tracing::info!(%port, "chatrelay listening");
    axum::serve(listener, app).await.expect("server failed");
}

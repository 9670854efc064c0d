use axum::{
    Router,
    middleware::from_fn as middleware_from_fn,
    routing::{get, post},
};
use dotenv::dotenv;
use std::{error::Error, sync::Arc};
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

mod apex;
mod auth;
mod chat;

use apex::{
    config::{ConfigError, Settings, StorageBackend},
    endpoints::*,
    state::AppState,
};
use auth::endpoints::*;
use chat::{
    delegates::MessagingService,
    endpoints::*,
    index::{ConversationIndex, MemoryConversationIndex},
    mongo::{MongoConversationIndex, MongoMessageStore, connect},
    store::{MemoryMessageStore, MessageStore},
};

async fn build_state(settings: &Settings) -> Result<AppState, Box<dyn Error>> {
    let (store, index): (Arc<dyn MessageStore>, Arc<dyn ConversationIndex>) =
        match settings.storage {
            StorageBackend::Memory => (
                Arc::new(MemoryMessageStore::new()) as Arc<dyn MessageStore>,
                Arc::new(MemoryConversationIndex::new()) as Arc<dyn ConversationIndex>,
            ),
            StorageBackend::MongoDb => {
                let uri = settings
                    .mongodb_uri
                    .as_deref()
                    .ok_or(ConfigError::Missing("MONGODB_URI"))?;
                let database = connect(uri, &settings.mongodb_database).await?;

                let store = MongoMessageStore::new(&database);
                store.ensure_indexes().await?;
                let index = MongoConversationIndex::new(&database);
                index.ensure_indexes().await?;

                (
                    Arc::new(store) as Arc<dyn MessageStore>,
                    Arc::new(index) as Arc<dyn ConversationIndex>,
                )
            }
        };

    Ok(AppState {
        messaging: Arc::new(MessagingService::new(
            store,
            index,
            settings.service.clone(),
        )),
        storage: settings.storage,
    })
}

fn build_router(state: AppState) -> Router {
    let protected_routes = Router::new()
        .route("/auth/user", get(get_user))
        .route("/messages", post(send_message_endpoint))
        .route("/conversations", post(start_conversation_endpoint))
        .route(
            "/users/{user_id}/conversations",
            get(get_conversations_endpoint),
        )
        .route("/users/{user_id}/unread", get(get_unread_endpoint))
        .route(
            "/conversations/{conversation_id}",
            get(get_conversation_endpoint),
        )
        .route(
            "/conversations/{conversation_id}/messages",
            get(get_messages_endpoint),
        )
        .route(
            "/conversations/{conversation_id}/messages/days",
            get(get_message_days_endpoint),
        )
        .route(
            "/conversations/{conversation_id}/read",
            post(mark_as_read_endpoint),
        )
        .layer(middleware_from_fn(header_auth));

    Router::new()
        .merge(protected_routes)
        .route("/", get(root_endpoint))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "petmatch=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Settings::from_env()?;
    let state = build_state(&settings).await?;

    let addr = settings.socket_addr();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, storage = settings.storage.as_str(), "Listening");

    axum::serve(listener, build_router(state)).await?;
    Ok(())
}

use axum::{Json, extract::State};
use serde_json::json;

use super::state::AppState;

pub async fn root_endpoint(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "message": "ok",
        "storage": state.storage.as_str()
    }))
}

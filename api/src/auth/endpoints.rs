use axum::{
    Extension, Json,
    body::Body,
    http::{HeaderMap, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::debug;

use super::schemas::{
    PARTICIPANT_ID_HEADER, PARTICIPANT_NAME_HEADER, PARTICIPANT_ROLE_HEADER, Participant, Role,
    is_valid_display_name, is_valid_identifier,
};
use crate::apex::utils::VerboseHTTPError;

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
}

/// Reads the identity the gateway forwards in front of this service.
pub fn participant_from_headers(headers: &HeaderMap) -> Option<Participant> {
    let id = header(headers, PARTICIPANT_ID_HEADER).filter(|id| is_valid_identifier(id))?;
    let display_name =
        header(headers, PARTICIPANT_NAME_HEADER).filter(|name| is_valid_display_name(name))?;
    let role = header(headers, PARTICIPANT_ROLE_HEADER)?
        .parse::<Role>()
        .ok()?;

    Some(Participant::new(id, display_name, role))
}

pub async fn header_auth(mut req: Request<Body>, next: Next) -> Result<Response, VerboseHTTPError> {
    let Some(participant) = participant_from_headers(req.headers()) else {
        debug!(path = %req.uri().path(), "Rejected request without participant identity");
        return Err(VerboseHTTPError::Standard(
            StatusCode::UNAUTHORIZED,
            "Unauthorized".to_string(),
        ));
    };

    req.extensions_mut().insert(participant);
    Ok(next.run(req).await)
}

pub(crate) async fn get_user(Extension(participant): Extension<Participant>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "participant": participant
    }))
}

use std::time::SystemTime;

use axum::{Router, middleware};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::{auth::require_collaborator, state::AppState};

pub mod agents;
pub mod channel;
pub mod tasks;

pub fn router(state: AppState) -> Router {
    let collaborator = Router::new()
        .merge(tasks::router())
        .merge(agents::collaborator_router())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_collaborator,
        ));

    Router::new()
        .merge(collaborator)
        .merge(agents::agent_router())
        .with_state(state)
}

pub(crate) fn rfc3339(value: SystemTime) -> Option<String> {
    OffsetDateTime::from(value).format(&Rfc3339).ok()
}

use actix_web::{web, HttpResponse};
use serde::Serialize;
use tracing::error;

use crate::message::Message;
use crate::{AppError, AppState};

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub messages: Vec<Message>,
}

/// Recent messages for a client that is about to connect.
pub async fn last_messages(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let count = state.relay.config().history_size;
    match state.relay.history(count).await {
        Ok(messages) => Ok(HttpResponse::Ok().json(HistoryResponse { messages })),
        Err(e) => {
            error!("Failed to read message history: {}", e);
            Err(e.into())
        }
    }
}

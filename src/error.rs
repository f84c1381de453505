use thiserror::Error;
use actix_web::{ResponseError, HttpResponse, http::StatusCode};
use serde_json::json;

use crate::message::ClientId;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Message error: {0}")]
    MessageError(#[from] MessageError),

    #[error("Registry error: {0}")]
    RegistryError(#[from] RegistryError),

    #[error("Relay error: {0}")]
    RelayError(#[from] RelayError),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Internal server error: {0}")]
    InternalError(String),
}

// Implement conversion from config::ConfigError
impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::InternalError(err.to_string())
    }
}

impl From<redis::RedisError> for AppError {
    fn from(err: redis::RedisError) -> Self {
        AppError::RelayError(err.into())
    }
}

// Implement actix_web::ResponseError for AppError
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        let message = self.to_string();
        let response = json!({
            "error": {
                "status": status.as_u16(),
                "message": message
            }
        });
        HttpResponse::build(status).json(response)
    }

    fn status_code(&self) -> StatusCode {
        match self {
            AppError::MessageError(_) => StatusCode::BAD_REQUEST,
            AppError::RegistryError(RegistryError::UnknownLocalClient(_)) => StatusCode::NOT_FOUND,
            AppError::RegistryError(RegistryError::DuplicateClient(_)) => StatusCode::CONFLICT,
            AppError::RelayError(RelayError::Broker(_) | RelayError::Redis(_)) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            AppError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("Malformed message: {0}")]
    Malformed(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Client {0} is not connected to this process")]
    UnknownLocalClient(ClientId),

    #[error("Client {0} is already connected")]
    DuplicateClient(ClientId),

    #[error("Failed to send to client {0}")]
    SendFailed(ClientId),
}

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Broker unavailable: {0}")]
    Broker(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Client {0} is already subscribed")]
    AlreadySubscribed(ClientId),

    #[error("Client {0} is not subscribed")]
    NotSubscribed(ClientId),

    #[error("Serialization failed: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::Serialization(err.to_string())
    }
}

use shared::{
    domain::{CardId, ListId},
    error::ApiError,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid server url: {0}")]
    Url(#[from] url::ParseError),
    #[error("http transport failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server rejected request ({status}): {error}")]
    Api { status: u16, error: ApiError },
    #[error("no board is open")]
    NoBoardOpen,
    #[error("card {0} is not on the open board")]
    UnknownCard(CardId),
    #[error("list {0} is not on the open board")]
    UnknownList(ListId),
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl ClientError {
    /// The server's error body, when the failure came from the server.
    pub fn api_error(&self) -> Option<&ApiError> {
        match self {
            ClientError::Api { error, .. } => Some(error),
            _ => None,
        }
    }
}

pub type ClientResult<T> = Result<T, ClientError>;

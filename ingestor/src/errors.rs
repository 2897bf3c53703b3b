use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(#[source] sqlx::Error),

    #[error("query deadline exceeded")]
    QueryTimeout,

    #[error("time-series query failed: {0}")]
    TimeSeries(#[source] reqwest::Error),

    #[error("subscriber on topic '{topic}' is gone")]
    Subscriber { topic: String },

    #[error("{0} not found")]
    NotFound(String),

    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::StoreUnavailable(err)
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::QueryTimeout
        } else {
            Error::TimeSeries(err)
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

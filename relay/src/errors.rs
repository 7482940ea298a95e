use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[error("MQTT transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database unavailable after {attempts} attempts: {source}")]
    StoreUnavailable {
        attempts: u32,
        #[source]
        source: sqlx::Error,
    },

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Malformed message on {topic}: {reason}")]
    Malformed { topic: String, reason: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Channel send error")]
    ChannelSend,
}

impl Error {
    pub fn malformed(topic: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Malformed {
            topic: topic.into(),
            reason: reason.into(),
        }
    }

    /// Whether a caller may reasonably retry the same request later.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::TransportUnavailable(_) | Error::StoreUnavailable { .. } | Error::ChannelSend => {
                true
            }
            Error::Mqtt(_) => true,

            Error::Validation(_) => false,
            Error::Malformed { .. } => false,
            Error::NotFound(_) => false,
            Error::Database(_) => false,
            Error::Migration(_) => false,
            Error::Json(_) => false,
            Error::Io(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgmaiError {
    #[error("LLM API error: {0}")]
    LlmApi(String),

    #[error("Image API error: {0}")]
    ImageApi(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Insufficient balance: required {required} AGMcoin, available {available}")]
    InsufficientBalance { required: i64, available: i64 },

    #[error("Internal error: {0}")]
    Internal(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        let e = AgmaiError::LlmApi("bad request".into());
        assert_eq!(e.to_string(), "LLM API error: bad request");

        let e = AgmaiError::Config("missing key".into());
        assert_eq!(e.to_string(), "Config error: missing key");

        let e = AgmaiError::InsufficientBalance {
            required: 40,
            available: 12,
        };
        assert_eq!(
            e.to_string(),
            "Insufficient balance: required 40 AGMcoin, available 12"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "not found");
        let e: AgmaiError = io_err.into();
        assert!(e.to_string().contains("not found"));
    }

    #[test]
    fn test_error_from_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("{{invalid").unwrap_err();
        let e: AgmaiError = json_err.into();
        assert!(e.to_string().contains("JSON error"));
    }
}

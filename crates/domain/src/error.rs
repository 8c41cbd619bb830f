/// Shared error type used across all Tessera crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("provider {provider}: {message}")]
    Provider { provider: String, message: String },

    #[error("protocol: {0}")]
    Protocol(String),

    /// The LM returned a plan (or action) that could not be parsed.
    #[error("plan parse: {0}")]
    PlanParse(String),

    /// A tool error matched the definitive-error table. The `friendly`
    /// message is shown to the user verbatim; `raw` is the tool's text.
    #[error("{friendly}")]
    DefinitiveTool { friendly: String, raw: String },

    /// The same tactical action repeated, or the retry budget ran out.
    #[error("phase stalled: {0}")]
    PhaseStall(String),

    #[error("argument mismatch: {0}")]
    ArgumentMismatch(String),

    #[error("quota: {0}")]
    Quota(String),

    #[error("cancelled")]
    Cancelled,

    #[error("session: {0}")]
    Session(String),

    #[error("config: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for errors that must propagate to the caller unchanged
    /// (after partial-turn persistence).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Error::Cancelled | Error::Quota(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn definitive_error_displays_friendly_message() {
        let err = Error::DefinitiveTool {
            friendly: "The generated query was invalid.".into(),
            raw: "Invalid query: syntax error near FROM".into(),
        };
        assert_eq!(err.to_string(), "The generated query was invalid.");
    }

    #[test]
    fn cancelled_is_terminal() {
        assert!(Error::Cancelled.is_terminal());
        assert!(Error::Quota("daily tokens".into()).is_terminal());
        assert!(!Error::PhaseStall("loop".into()).is_terminal());
    }
}

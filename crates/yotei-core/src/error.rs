use std::fmt;

#[derive(Debug)]
pub enum AgentError {
    Llm { provider: String, message: String },
    Http { status: u16, body: String },
    Database(String),
    Config(String),
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Llm { provider, message } => write!(f, "llm error ({provider}): {message}"),
            Self::Http { status, body } => write!(f, "http error ({status}): {body}"),
            Self::Database(msg) => write!(f, "database error: {msg}"),
            Self::Config(msg) => write!(f, "config error: {msg}"),
        }
    }
}

impl std::error::Error for AgentError {}

pub type Result<T> = std::result::Result<T, AgentError>;

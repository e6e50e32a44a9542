#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("config error: {0}")]
    Config(String),

    #[error("event error: {0}")]
    Event(String),

    #[error("dvr error: {0}")]
    Dvr(#[from] dvr::DvrError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type AgentResult<T> = Result<T, AgentError>;

#[derive(Debug, thiserror::Error)]
pub enum DvrError {
    #[error("command failed: {0}")]
    Command(String),

    #[error("firewall apply failed: {0}")]
    Firewall(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("link-local pool {0} exhausted")]
    LinkLocalExhausted(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("backend not available: {0}")]
    BackendNotAvailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DvrError>;

use thiserror::Error;

/// Configuration-related errors with structured variants.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("failed to read config file: {0}")]
    ReadFile(#[source] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[source] toml::de::Error),
}

/// Instance-creation validation errors.
///
/// These are rejected synchronously; the instance is never created.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("unknown strategy type: {name}")]
    UnknownStrategy { name: String },

    #[error("invalid strategy config: {reason}")]
    InvalidConfig { reason: String },
}

/// Risk-check denials.
///
/// A denial is not a failure: the order is silently not submitted and the
/// caller receives a null result, never an exception.
#[derive(Error, Debug, Clone)]
pub enum RiskError {
    #[error("order size {size} exceeds limit {limit}")]
    OrderSizeExceeded {
        size: rust_decimal::Decimal,
        limit: rust_decimal::Decimal,
    },

    #[error("position size {total} exceeds limit {limit} for {symbol}")]
    PositionLimitExceeded {
        symbol: String,
        total: rust_decimal::Decimal,
        limit: rust_decimal::Decimal,
    },

    #[error("daily loss {loss} exceeds limit {limit}")]
    DailyLossExceeded {
        loss: rust_decimal::Decimal,
        limit: rust_decimal::Decimal,
    },
}

/// Failures reported by an exchange connector.
///
/// Every connector failure is treated as "no effect occurred": the engine
/// never assumes partial success and never retries automatically.
#[derive(Error, Debug)]
pub enum ConnectorError {
    #[error("order rejected: {0}")]
    OrderRejected(String),

    #[error("unknown order id: {0}")]
    UnknownOrder(String),

    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),

    #[error("connector unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Risk(#[from] RiskError),

    #[error(transparent)]
    Connector(#[from] ConnectorError),

    #[error("event handler error: {0}")]
    Handler(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

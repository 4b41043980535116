use outbus_core::broker::ConsumptionType;
use outbus_core::error::MessagingError;

#[non_exhaustive]
#[derive(thiserror::Error, Debug)]
pub enum BusError {
    #[error("messaging: {0}")]
    Messaging(#[from] MessagingError),

    #[error(
        "conflicting consumption type: topic={topic}, existing={existing}, requested={requested}"
    )]
    ConflictingConsumption {
        topic: String,
        existing: ConsumptionType,
        requested: ConsumptionType,
    },

    #[error("handler already registered: topic={topic}, type={type_name}, handler={handler}")]
    DuplicateHandler {
        topic: String,
        type_name: &'static str,
        handler: String,
    },

    #[error("handler failed: handler={handler}, type={type_name}: {source}")]
    Handler {
        handler: String,
        type_name: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

pub type BusResult<T> = Result<T, BusError>;

impl BusError {
    /// 是否为注册/构造期的配置错误
    pub fn is_configuration(&self) -> bool {
        match self {
            BusError::Messaging(err) => err.is_configuration(),
            BusError::ConflictingConsumption { .. } | BusError::DuplicateHandler { .. } => true,
            BusError::Handler { .. } => false,
        }
    }
}

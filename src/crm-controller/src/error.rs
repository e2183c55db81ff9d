use thiserror::Error;

/// Error kinds surfaced by the core.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CrmError {
    #[error("manager is not running the master role")]
    ManagerNotRunning,

    #[error("resource {0} is already initialised")]
    ResourceAlreadyInit(String),

    #[error("resource {0} does not exist")]
    ResourceNoExist(String),

    #[error("application for resource {0} is already launched")]
    ApplicationAlreadyLaunched(String),

    #[error("resource {0} is not running")]
    ResourceNotRunning(String),

    #[error("resource {0} is already released")]
    ResourceAlreadyReleased(String),

    #[error("not enough resources available for block {0}")]
    NotEnoughResources(String),

    #[error("no broker resources available")]
    BrokerNotEnoughResources,

    #[error("broker is under its cooling-down period")]
    BrokeringUnderCoolingTime,

    #[error("operator backend error: {0}")]
    Operator(String),

    #[error("resource store error: {0}")]
    Store(String),
}

impl From<crm_operator::OperatorError> for CrmError {
    fn from(e: crm_operator::OperatorError) -> Self {
        match e {
            crm_operator::OperatorError::NotFound => CrmError::Operator("not found".into()),
            crm_operator::OperatorError::Backend(msg) => CrmError::Operator(msg),
        }
    }
}

impl From<crm_stash::StashError> for CrmError {
    fn from(e: crm_stash::StashError) -> Self {
        CrmError::Store(e.to_string())
    }
}

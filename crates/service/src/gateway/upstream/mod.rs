pub(crate) mod channel_health;
pub(crate) mod deadline;
pub(crate) mod executor;
pub(crate) mod orchestrator;
pub(crate) mod outcome;
pub(crate) mod protocol;
pub(crate) mod transport;

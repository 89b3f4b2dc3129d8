pub(crate) mod router;
pub(crate) mod server;
pub(crate) mod worker_pool;

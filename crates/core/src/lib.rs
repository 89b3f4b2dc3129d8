pub mod relay;
pub mod storage;

pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

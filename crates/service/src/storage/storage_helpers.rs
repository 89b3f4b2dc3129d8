use channelrelay_core::storage::Storage;
use std::path::Path;

use crate::process_env::ENV_DB_PATH;

fn db_path() -> Result<String, String> {
    std::env::var(ENV_DB_PATH).map_err(|_| format!("{ENV_DB_PATH} not set"))
}

pub(crate) fn open_storage() -> Result<Storage, String> {
    let path = db_path()?;
    Storage::open(&path).map_err(|err| format!("open storage failed: {} ({})", path, err))
}

pub(crate) fn initialize_storage() -> Result<(), String> {
    let path = db_path()?;
    if !Path::new(&path).exists() {
        log::info!("event=storage_create path={}", path);
    }
    let storage = Storage::open(&path)
        .map_err(|err| format!("open storage failed: {} ({})", path, err))?;
    storage
        .init()
        .map_err(|err| format!("storage init failed: {} ({})", path, err))
}

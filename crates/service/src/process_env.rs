use std::fs;
use std::path::{Path, PathBuf};

const ENV_CANDIDATES: [&str; 2] = ["channelrelay.env", ".env"];
const DEFAULT_DB_FILENAME: &str = "channelrelay.db";

pub(crate) const ENV_DB_PATH: &str = "CHANNELRELAY_DB_PATH";

pub(crate) fn exe_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|p| p.to_path_buf()))
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Parses one `KEY=value` dotenv line. Supports `export`, quotes and ` #` comments.
fn parse_dotenv_line(line: &str) -> Option<(String, String)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
        return None;
    }
    let line = line.strip_prefix("export ").map(str::trim).unwrap_or(line);
    let (key, raw_value) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    let raw_value = raw_value.trim();
    let quoted = raw_value.len() >= 2
        && ((raw_value.starts_with('"') && raw_value.ends_with('"'))
            || (raw_value.starts_with('\'') && raw_value.ends_with('\'')));
    let value = if quoted {
        &raw_value[1..raw_value.len() - 1]
    } else {
        match raw_value.find(" #") {
            Some(pos) => raw_value[..pos].trim_end(),
            None => raw_value,
        }
    };
    Some((key.to_string(), value.to_string()))
}

fn load_env_file(path: &Path) -> usize {
    let Ok(text) = fs::read_to_string(path) else {
        return 0;
    };
    let mut applied = 0usize;
    for (key, value) in text.lines().filter_map(parse_dotenv_line) {
        // 中文注释：进程环境优先，env 文件只补缺省值。
        if std::env::var_os(&key).is_some() {
            continue;
        }
        std::env::set_var(key, value);
        applied += 1;
    }
    applied
}

pub(crate) fn load_env_from_exe_dir() {
    let dir = exe_dir();
    let Some(path) = ENV_CANDIDATES
        .iter()
        .map(|name| dir.join(name))
        .find(|candidate| candidate.is_file())
    else {
        return;
    };
    let applied = load_env_file(&path);
    if applied > 0 {
        log::info!("event=env_file_loaded vars={} path={}", applied, path.display());
    }
}

fn resolve_path_with_base(raw: &str, base_dir: &Path) -> PathBuf {
    let path = PathBuf::from(raw.trim());
    if path.is_absolute() {
        return path;
    }
    base_dir.join(path)
}

pub(crate) fn ensure_default_db_path() -> PathBuf {
    let dir = exe_dir();
    let resolved = match std::env::var(ENV_DB_PATH) {
        Ok(raw) if !raw.trim().is_empty() => resolve_path_with_base(&raw, &dir),
        _ => dir.join(DEFAULT_DB_FILENAME),
    };
    std::env::set_var(ENV_DB_PATH, resolved.to_string_lossy().as_ref());
    resolved
}

pub(crate) fn db_dir() -> PathBuf {
    ensure_default_db_path()
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(exe_dir)
}

use super::Storage;
use std::fs;
use std::path::PathBuf;
use std::process;
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_db_path(name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    std::env::temp_dir().join(format!("channelrelay-{name}-{}-{nanos}.db", process::id()))
}

fn applied(storage: &Storage, version: &str) -> i64 {
    storage
        .conn
        .query_row(
            "SELECT COUNT(1) FROM schema_migrations WHERE version = ?1",
            [version],
            |row| row.get(0),
        )
        .expect("count migration")
}

#[test]
fn init_tracks_schema_migrations_and_is_idempotent() {
    let storage = Storage::open_in_memory().expect("open in memory");
    storage.init().expect("first init");
    storage.init().expect("second init");

    assert_eq!(applied(&storage, "001_channels"), 1);
    assert_eq!(applied(&storage, "002_abilities"), 1);
    assert_eq!(applied(&storage, "003_abilities_lookup_index"), 1);

    let index_count: i64 = storage
        .conn
        .query_row(
            "SELECT COUNT(1) FROM sqlite_master WHERE type = 'index' AND name = 'idx_abilities_lookup'",
            [],
            |row| row.get(0),
        )
        .expect("count lookup index");
    assert_eq!(index_count, 1);
}

#[test]
fn file_open_enables_wal_and_normal_synchronous() {
    let path = temp_db_path("sqlite-pragmas");
    let storage = Storage::open(&path).expect("open file storage");

    let journal_mode: String = storage
        .conn
        .query_row("PRAGMA journal_mode", [], |row| row.get(0))
        .expect("read journal mode");
    assert_eq!(journal_mode.to_ascii_lowercase(), "wal");

    let synchronous: i64 = storage
        .conn
        .query_row("PRAGMA synchronous", [], |row| row.get(0))
        .expect("read synchronous mode");
    assert_eq!(synchronous, 1);

    drop(storage);
    let _ = fs::remove_file(&path);
    let _ = fs::remove_file(path.with_extension("db-wal"));
    let _ = fs::remove_file(path.with_extension("db-shm"));
}

use channelrelay_core::storage::{Ability, Channel, Storage};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

use crate::lock_utils::{read_recover, write_recover};

static SHARED_DIRECTORY: OnceLock<Arc<SnapshotDirectory>> = OnceLock::new();

/// Read side of the ability index. Callers take one snapshot per selection so the
/// ability rows and the channel records they resolve against always agree.
pub(crate) trait AbilityDirectory: Send + Sync {
    fn snapshot(&self) -> Arc<DirectorySnapshot>;

    fn channel(&self, channel_id: i64) -> Option<Arc<Channel>> {
        self.snapshot().channel(channel_id)
    }
}

/// Immutable index of enabled abilities keyed by (group, model), plus every known channel.
#[derive(Debug, Default)]
pub(crate) struct DirectorySnapshot {
    generation: u64,
    abilities: HashMap<(String, String), Vec<Ability>>,
    channels: HashMap<i64, Arc<Channel>>,
    group_models: HashMap<String, BTreeSet<String>>,
}

impl DirectorySnapshot {
    pub(crate) fn build(generation: u64, abilities: Vec<Ability>, channels: Vec<Channel>) -> Self {
        let mut index: HashMap<(String, String), Vec<Ability>> = HashMap::new();
        let mut group_models: HashMap<String, BTreeSet<String>> = HashMap::new();
        for ability in abilities.into_iter().filter(|ability| ability.enabled) {
            group_models
                .entry(ability.group.clone())
                .or_default()
                .insert(ability.model.clone());
            index
                .entry((ability.group.clone(), ability.model.clone()))
                .or_default()
                .push(ability);
        }
        for rows in index.values_mut() {
            rows.sort_by(|left, right| {
                right
                    .priority
                    .cmp(&left.priority)
                    .then(right.weight.cmp(&left.weight))
                    .then(left.channel_id.cmp(&right.channel_id))
            });
        }
        let channels = channels
            .into_iter()
            .map(|channel| (channel.id, Arc::new(channel)))
            .collect();
        Self {
            generation,
            abilities: index,
            channels,
            group_models,
        }
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// Enabled abilities for the pair, ordered by priority desc, weight desc, channel id.
    pub(crate) fn lookup(&self, group: &str, model: &str) -> &[Ability] {
        self.abilities
            .get(&(group.to_string(), model.to_string()))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub(crate) fn channel(&self, channel_id: i64) -> Option<Arc<Channel>> {
        self.channels.get(&channel_id).cloned()
    }

    pub(crate) fn group_models(&self, group: &str) -> Vec<String> {
        self.group_models
            .get(group)
            .map(|models| models.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn ability_count(&self) -> usize {
        self.abilities.values().map(Vec::len).sum()
    }

    pub(crate) fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

/// Directory whose snapshot is replaced wholesale on reload.
#[derive(Debug, Default)]
pub(crate) struct SnapshotDirectory {
    current: RwLock<Arc<DirectorySnapshot>>,
    generation: AtomicU64,
}

impl SnapshotDirectory {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub(crate) fn from_parts(abilities: Vec<Ability>, channels: Vec<Channel>) -> Self {
        let directory = Self::new();
        directory.install(abilities, channels);
        directory
    }

    /// Builds the next snapshot outside the lock, then swaps it in.
    pub(crate) fn install(&self, abilities: Vec<Ability>, channels: Vec<Channel>) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let next = Arc::new(DirectorySnapshot::build(generation, abilities, channels));
        *write_recover(&self.current, "ability_directory") = next;
        generation
    }

    pub(crate) fn reload(&self, storage: &Storage) -> Result<(), String> {
        let rows = storage
            .load_directory_rows()
            .map_err(|err| format!("load directory rows failed: {err}"))?;
        self.install(rows.abilities, rows.channels);
        let snapshot = self.snapshot();
        log::debug!(
            "event=directory_reload generation={} abilities={} channels={}",
            snapshot.generation(),
            snapshot.ability_count(),
            snapshot.channel_count()
        );
        Ok(())
    }
}

impl AbilityDirectory for SnapshotDirectory {
    fn snapshot(&self) -> Arc<DirectorySnapshot> {
        read_recover(&self.current, "ability_directory").clone()
    }
}

pub(crate) fn shared_directory() -> Arc<SnapshotDirectory> {
    SHARED_DIRECTORY
        .get_or_init(|| Arc::new(SnapshotDirectory::new()))
        .clone()
}

pub(crate) fn reload_shared_directory() -> Result<(), String> {
    let storage = crate::storage_helpers::open_storage()?;
    shared_directory().reload(&storage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::thread;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_db_path(name: &str) -> std::path::PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|value| value.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!(
            "channelrelay-{name}-{}-{nanos}.db",
            std::process::id()
        ))
    }

    fn ability(group: &str, model: &str, channel_id: i64, priority: i64, weight: i64) -> Ability {
        Ability {
            group: group.to_string(),
            model: model.to_string(),
            channel_id,
            enabled: true,
            priority,
            weight,
            supports_image: true,
            supports_stream: true,
            supports_system_prompt: true,
            supports_non_deterministic: true,
            supports_function_call: true,
            max_input_tokens: 0,
        }
    }

    fn channel(id: i64) -> Channel {
        Channel {
            id,
            models: "gpt-4".to_string(),
            ..Channel::default()
        }
    }

    #[test]
    fn lookup_orders_rows_and_skips_disabled() {
        let mut disabled = ability("default", "gpt-4", 9, 99, 99);
        disabled.enabled = false;
        let directory = SnapshotDirectory::from_parts(
            vec![
                ability("default", "gpt-4", 3, 5, 1),
                ability("default", "gpt-4", 1, 10, 0),
                ability("default", "gpt-4", 2, 10, 7),
                disabled,
                ability("vip", "gpt-4", 4, 0, 0),
            ],
            vec![channel(1), channel(2), channel(3), channel(4)],
        );

        let snapshot = directory.snapshot();
        let ids: Vec<i64> = snapshot
            .lookup("default", "gpt-4")
            .iter()
            .map(|row| row.channel_id)
            .collect();
        assert_eq!(ids, vec![2, 1, 3]);
        assert!(snapshot.lookup("default", "gpt-3.5").is_empty());
        assert_eq!(snapshot.ability_count(), 4);
    }

    #[test]
    fn group_models_lists_distinct_models() {
        let directory = SnapshotDirectory::from_parts(
            vec![
                ability("default", "gpt-4", 1, 0, 0),
                ability("default", "gpt-4", 2, 0, 0),
                ability("default", "gpt-3.5-turbo", 1, 0, 0),
                ability("vip", "o1", 3, 0, 0),
            ],
            vec![channel(1), channel(2), channel(3)],
        );
        let snapshot = directory.snapshot();
        assert_eq!(
            snapshot.group_models("default"),
            vec!["gpt-3.5-turbo".to_string(), "gpt-4".to_string()]
        );
        assert!(snapshot.group_models("missing").is_empty());
    }

    #[test]
    fn held_snapshot_survives_reload() {
        let directory =
            SnapshotDirectory::from_parts(vec![ability("default", "gpt-4", 1, 0, 0)], vec![channel(1)]);
        let before = directory.snapshot();
        directory.install(vec![ability("default", "gpt-4", 2, 0, 0)], vec![channel(2)]);

        assert_eq!(before.lookup("default", "gpt-4")[0].channel_id, 1);
        assert!(before.channel(1).is_some());
        let after = directory.snapshot();
        assert!(after.generation() > before.generation());
        assert!(after.channel(1).is_none());
        assert_eq!(after.lookup("default", "gpt-4")[0].channel_id, 2);
    }

    #[test]
    fn reload_reads_enabled_rows_from_storage() {
        let storage = Storage::open_in_memory().expect("open");
        storage.init().expect("init");
        let id = storage
            .insert_channel(&Channel {
                models: "gpt-4,gpt-4o".to_string(),
                groups: "default,vip".to_string(),
                priority: 3,
                ..Channel::default()
            })
            .expect("insert");
        storage
            .insert_channel(&Channel {
                models: "gpt-4".to_string(),
                status: channelrelay_core::storage::CHANNEL_STATUS_MANUALLY_DISABLED,
                ..Channel::default()
            })
            .expect("insert disabled");

        let directory = SnapshotDirectory::new();
        directory.reload(&storage).expect("reload");
        let snapshot = directory.snapshot();

        let rows = snapshot.lookup("vip", "gpt-4o");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].channel_id, id);
        assert_eq!(rows[0].priority, 3);
        assert_eq!(snapshot.lookup("default", "gpt-4").len(), 1);
        assert_eq!(snapshot.channel_count(), 2);
    }

    #[test]
    fn reload_during_channel_churn_never_leaves_orphan_abilities() {
        let path = temp_db_path("directory-churn");
        let storage = Storage::open(&path).expect("open");
        storage.init().expect("init");
        let stable = storage
            .insert_channel(&Channel {
                name: "stable".to_string(),
                models: "gpt-4".to_string(),
                groups: "default".to_string(),
                ..Channel::default()
            })
            .expect("insert stable");

        let done = Arc::new(AtomicBool::new(false));
        let writer = {
            let path = path.clone();
            let done = done.clone();
            thread::spawn(move || {
                let storage = Storage::open(&path).expect("open writer");
                for round in 0..300 {
                    let id = storage
                        .insert_channel(&Channel {
                            name: format!("churn-{round}"),
                            models: "gpt-4".to_string(),
                            groups: "default".to_string(),
                            ..Channel::default()
                        })
                        .expect("insert churn");
                    storage.delete_channel(id).expect("delete churn");
                }
                done.store(true, Ordering::SeqCst);
            })
        };

        let directory = SnapshotDirectory::new();
        let mut reloads = 0;
        let mut orphans = 0;
        while !done.load(Ordering::SeqCst) || reloads < 50 {
            directory.reload(&storage).expect("reload");
            reloads += 1;
            let snapshot = directory.snapshot();
            orphans += snapshot
                .lookup("default", "gpt-4")
                .iter()
                .filter(|row| snapshot.channel(row.channel_id).is_none())
                .count();
            assert!(snapshot.channel(stable).is_some());
        }
        writer.join().expect("writer thread");

        assert_eq!(orphans, 0, "orphan ability rows across {reloads} reloads");
        drop(storage);
        let _ = std::fs::remove_file(&path);
        let _ = std::fs::remove_file(path.with_extension("db-wal"));
        let _ = std::fs::remove_file(path.with_extension("db-shm"));
    }
}

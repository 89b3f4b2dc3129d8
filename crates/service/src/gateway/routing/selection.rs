use channelrelay_core::storage::{Ability, Channel};
use rand::Rng;
use std::sync::Arc;

use super::capability::Fingerprint;
use super::directory::AbilityDirectory;
use super::error::RelayError;

/// Additive term that keeps zero-weight channels selectable.
const WEIGHT_SMOOTHING: i64 = 10;

#[derive(Debug, Clone)]
pub(crate) struct SelectedChannel {
    pub(crate) channel: Arc<Channel>,
    pub(crate) priority: i64,
}

pub(crate) fn ability_satisfies(ability: &Ability, fingerprint: &Fingerprint) -> bool {
    if fingerprint.needs_image && !ability.supports_image {
        return false;
    }
    if fingerprint.needs_stream && !ability.supports_stream {
        return false;
    }
    if fingerprint.has_system_prompt && !ability.supports_system_prompt {
        return false;
    }
    if fingerprint.needs_non_deterministic && !ability.supports_non_deterministic {
        return false;
    }
    if fingerprint.needs_function_call && !ability.supports_function_call {
        return false;
    }
    ability.max_input_tokens <= 0 || fingerprint.estimated_input_tokens <= ability.max_input_tokens as usize
}

/// Distinct priorities, highest first. Attempt `n` maps to the n-th entry,
/// clamped to the lowest tier once the list is exhausted.
fn tier_priority(candidates: &[&Ability], attempt: usize) -> Option<i64> {
    let mut priorities: Vec<i64> = candidates.iter().map(|ability| ability.priority).collect();
    priorities.sort_unstable_by(|left, right| right.cmp(left));
    priorities.dedup();
    let index = attempt.min(priorities.len().checked_sub(1)?);
    priorities.get(index).copied()
}

fn weighted_pick<'a, R: Rng + ?Sized>(tier: &[&'a Ability], rng: &mut R) -> Option<&'a Ability> {
    let total: i64 = tier
        .iter()
        .map(|ability| ability.weight.max(0) + WEIGHT_SMOOTHING)
        .sum();
    if total <= 0 {
        return None;
    }
    // 中文注释：从 [1, total] 取值后逐个扣减，余数首次 <= 0 时命中，各候选概率恰为 (w+10)/Σ。
    let mut remainder = rng.gen_range(0..total) + 1;
    for ability in tier {
        remainder -= ability.weight.max(0) + WEIGHT_SMOOTHING;
        if remainder <= 0 {
            return Some(ability);
        }
    }
    tier.last().copied()
}

/// Picks one channel for `attempt` (0-based) from a single directory snapshot.
pub(crate) fn select_channel<R: Rng + ?Sized>(
    directory: &dyn AbilityDirectory,
    fingerprint: &Fingerprint,
    attempt: usize,
    rng: &mut R,
) -> Result<SelectedChannel, RelayError> {
    let snapshot = directory.snapshot();
    let rows = snapshot.lookup(&fingerprint.group, &fingerprint.model);
    let eligible: Vec<&Ability> = rows
        .iter()
        .filter(|ability| ability_satisfies(ability, fingerprint))
        .collect();
    let no_candidate = || RelayError::NoCandidate {
        group: fingerprint.group.clone(),
        model: fingerprint.model.clone(),
    };
    let Some(priority) = tier_priority(&eligible, attempt) else {
        log::warn!(
            "event=gateway_no_candidate group={} model={} enabled={} eligible=0",
            fingerprint.group,
            fingerprint.model,
            rows.len()
        );
        return Err(no_candidate());
    };

    let mut tier: Vec<&Ability> = eligible
        .into_iter()
        .filter(|ability| ability.priority == priority)
        .collect();
    tier.sort_by(|left, right| {
        right
            .weight
            .max(0)
            .cmp(&left.weight.max(0))
            .then(left.channel_id.cmp(&right.channel_id))
    });
    let picked = weighted_pick(&tier, rng).ok_or_else(no_candidate)?;
    let channel = snapshot
        .channel(picked.channel_id)
        .ok_or(RelayError::DirectoryInconsistent {
            channel_id: picked.channel_id,
        })?;
    Ok(SelectedChannel {
        channel,
        priority: picked.priority,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::directory::{DirectorySnapshot, SnapshotDirectory};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    fn ability(channel_id: i64, priority: i64, weight: i64) -> Ability {
        Ability {
            group: "default".to_string(),
            model: "gpt-4".to_string(),
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

    fn fingerprint() -> Fingerprint {
        Fingerprint {
            model: "gpt-4".to_string(),
            group: "default".to_string(),
            ..Fingerprint::default()
        }
    }

    fn directory(rows: Vec<Ability>) -> SnapshotDirectory {
        let channels = rows.iter().map(|row| channel(row.channel_id)).collect();
        SnapshotDirectory::from_parts(rows, channels)
    }

    /// Directory that serves a fixed snapshot which may reference missing channels.
    struct FixedDirectory(Arc<DirectorySnapshot>);

    impl AbilityDirectory for FixedDirectory {
        fn snapshot(&self) -> Arc<DirectorySnapshot> {
            self.0.clone()
        }
    }

    #[test]
    fn attempt_index_walks_tiers_and_clamps_to_lowest() {
        let directory = directory(vec![ability(1, 10, 5), ability(2, 5, 5), ability(3, 1, 5)]);
        let mut rng = StdRng::seed_from_u64(7);
        let picked: Vec<i64> = (0..5)
            .map(|attempt| {
                select_channel(&directory, &fingerprint(), attempt, &mut rng)
                    .expect("select")
                    .channel
                    .id
            })
            .collect();
        assert_eq!(picked, vec![1, 2, 3, 3, 3]);
    }

    #[test]
    fn weighted_frequencies_converge() {
        let directory = directory(vec![ability(1, 0, 0), ability(2, 0, 10), ability(3, 0, 30)]);
        let mut rng = StdRng::seed_from_u64(42);
        let draws = 60_000usize;
        let mut counts: HashMap<i64, usize> = HashMap::new();
        for _ in 0..draws {
            let selected = select_channel(&directory, &fingerprint(), 0, &mut rng).expect("select");
            *counts.entry(selected.channel.id).or_default() += 1;
        }
        // 权重 +10 平滑后为 10 / 20 / 40
        for (id, expected) in [(1, 10.0 / 70.0), (2, 20.0 / 70.0), (3, 40.0 / 70.0)] {
            let observed = counts.get(&id).copied().unwrap_or(0) as f64 / draws as f64;
            assert!(
                (observed - expected).abs() < 0.01,
                "channel {id}: observed {observed}, expected {expected}"
            );
        }
    }

    #[test]
    fn zero_weight_channel_is_still_selected() {
        let directory = directory(vec![ability(1, 0, 0), ability(2, 0, 1000)]);
        let mut rng = StdRng::seed_from_u64(1);
        let hit = (0..5_000).any(|_| {
            select_channel(&directory, &fingerprint(), 0, &mut rng)
                .expect("select")
                .channel
                .id
                == 1
        });
        assert!(hit);
    }

    #[test]
    fn capability_filter_is_one_directional() {
        let mut plain = ability(1, 0, 0);
        plain.supports_image = false;
        plain.supports_function_call = false;
        let directory = directory(vec![plain]);
        let mut rng = StdRng::seed_from_u64(3);

        let mut needs_image = fingerprint();
        needs_image.needs_image = true;
        let err = select_channel(&directory, &needs_image, 0, &mut rng).unwrap_err();
        assert!(matches!(err, RelayError::NoCandidate { .. }));

        // 中文注释：请求未声明的能力不应排除候选。
        assert_eq!(
            select_channel(&directory, &fingerprint(), 0, &mut rng)
                .expect("select")
                .channel
                .id,
            1
        );
    }

    #[test]
    fn capable_lower_tier_wins_when_higher_tier_lacks_capability() {
        let mut top = ability(1, 10, 0);
        top.supports_stream = false;
        let directory = directory(vec![top, ability(2, 1, 0)]);
        let mut needs_stream = fingerprint();
        needs_stream.needs_stream = true;
        let mut rng = StdRng::seed_from_u64(5);
        let selected = select_channel(&directory, &needs_stream, 0, &mut rng).expect("select");
        assert_eq!(selected.channel.id, 2);
        assert_eq!(selected.priority, 1);
    }

    #[test]
    fn max_input_tokens_excludes_oversized_requests() {
        let mut small = ability(1, 10, 0);
        small.max_input_tokens = 100;
        let directory = directory(vec![small, ability(2, 0, 0)]);
        let mut big = fingerprint();
        big.estimated_input_tokens = 101;
        let mut rng = StdRng::seed_from_u64(9);
        assert_eq!(
            select_channel(&directory, &big, 0, &mut rng).expect("select").channel.id,
            2
        );
        big.estimated_input_tokens = 100;
        assert_eq!(
            select_channel(&directory, &big, 0, &mut rng).expect("select").channel.id,
            1
        );
    }

    #[test]
    fn missing_pair_yields_no_candidate() {
        let directory = directory(vec![ability(1, 0, 0)]);
        let mut other = fingerprint();
        other.model = "gpt-5".to_string();
        let mut rng = StdRng::seed_from_u64(0);
        match select_channel(&directory, &other, 0, &mut rng) {
            Err(RelayError::NoCandidate { group, model }) => {
                assert_eq!(group, "default");
                assert_eq!(model, "gpt-5");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn ability_without_channel_is_inconsistent() {
        let snapshot = DirectorySnapshot::build(1, vec![ability(77, 0, 0)], Vec::new());
        let directory = FixedDirectory(Arc::new(snapshot));
        let mut rng = StdRng::seed_from_u64(0);
        let err = select_channel(&directory, &fingerprint(), 0, &mut rng).unwrap_err();
        assert!(matches!(err, RelayError::DirectoryInconsistent { channel_id: 77 }));
    }

    #[test]
    fn concurrent_reload_never_exposes_partial_snapshot() {
        let directory = Arc::new(directory(vec![ability(1, 0, 0)]));
        let stop = Arc::new(AtomicBool::new(false));

        let writer = {
            let directory = directory.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                let mut next = 2i64;
                while !stop.load(Ordering::Relaxed) {
                    // 中文注释：每轮换一个渠道 id，旧渠道从快照中消失。
                    directory.install(vec![ability(next, 0, 0)], vec![channel(next)]);
                    next += 1;
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|seed| {
                let directory = directory.clone();
                thread::spawn(move || {
                    let mut rng = StdRng::seed_from_u64(seed);
                    for _ in 0..2_000 {
                        match select_channel(directory.as_ref(), &fingerprint(), 0, &mut rng) {
                            Ok(_) => {}
                            Err(err) => panic!("unexpected selection error: {err:?}"),
                        }
                    }
                })
            })
            .collect();

        for reader in readers {
            reader.join().expect("reader");
        }
        stop.store(true, Ordering::Relaxed);
        writer.join().expect("writer");
    }
}

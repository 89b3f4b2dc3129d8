use rusqlite::{Connection, Result, Row};

use super::{Ability, Channel, Storage, CHANNEL_STATUS_ENABLED};

const ABILITY_SELECT_SQL: &str = "SELECT
    group_name,
    model,
    channel_id,
    enabled,
    priority,
    weight,
    supports_image,
    supports_stream,
    supports_system_prompt,
    supports_non_deterministic,
    supports_function_call,
    max_input_tokens
 FROM abilities";

/// Enabled abilities plus every channel, taken from the same committed state.
#[derive(Debug, Clone, Default)]
pub struct DirectoryRows {
    pub abilities: Vec<Ability>,
    pub channels: Vec<Channel>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FixAbilitiesReport {
    pub removed_orphans: usize,
    pub rebuilt_channels: usize,
}

/// Deletes and recreates the ability rows of one channel. Callers run this
/// inside the transaction that wrote the channel, so readers never see the
/// empty intermediate state.
pub(super) fn write_channel_abilities(
    conn: &Connection,
    channel: &Channel,
    channel_id: i64,
) -> Result<()> {
    conn.execute("DELETE FROM abilities WHERE channel_id = ?1", [channel_id])?;
    let mut stmt = conn.prepare(
        "INSERT OR REPLACE INTO abilities (
            group_name, model, channel_id, enabled, priority, weight,
            supports_image, supports_stream, supports_system_prompt,
            supports_non_deterministic, supports_function_call, max_input_tokens
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
    )?;
    let enabled = channel.status == CHANNEL_STATUS_ENABLED;
    let groups = channel.group_list();
    for model in channel.model_list() {
        for group in &groups {
            stmt.execute(rusqlite::params![
                group,
                &model,
                channel_id,
                enabled,
                channel.priority,
                channel.effective_weight(),
                channel.supports_image,
                channel.supports_stream,
                channel.supports_system_prompt,
                channel.supports_non_deterministic,
                channel.supports_function_call,
                channel.max_input_tokens,
            ])?;
        }
    }
    Ok(())
}

impl Storage {
    pub fn replace_channel_abilities(&self, channel: &Channel) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        write_channel_abilities(&tx, channel, channel.id)?;
        tx.commit()
    }

    pub fn update_ability_status(&self, channel_id: i64, enabled: bool) -> Result<usize> {
        self.conn.execute(
            "UPDATE abilities SET enabled = ?2 WHERE channel_id = ?1",
            (channel_id, enabled),
        )
    }

    /// Drops abilities that point at deleted channels and rebuilds abilities
    /// for channels that have none.
    pub fn fix_abilities(&self) -> Result<FixAbilitiesReport> {
        let tx = self.conn.unchecked_transaction()?;
        let removed_orphans = tx.execute(
            "DELETE FROM abilities WHERE channel_id NOT IN (SELECT id FROM channels)",
            [],
        )?;
        let bare_channels = {
            let mut stmt = tx.prepare(
                "SELECT id FROM channels
                 WHERE id NOT IN (SELECT DISTINCT channel_id FROM abilities)
                 ORDER BY id ASC",
            )?;
            let ids = stmt
                .query_map([], |row| row.get::<_, i64>(0))?
                .collect::<Result<Vec<_>>>()?;
            ids
        };
        let mut rebuilt_channels = 0;
        for channel_id in bare_channels {
            let Some(channel) = self.find_channel_by_id(channel_id)? else {
                continue;
            };
            write_channel_abilities(&tx, &channel, channel.id)?;
            rebuilt_channels += 1;
        }
        tx.commit()?;
        Ok(FixAbilitiesReport {
            removed_orphans,
            rebuilt_channels,
        })
    }

    pub fn list_enabled_abilities(&self) -> Result<Vec<Ability>> {
        self.query_abilities(
            &format!("{ABILITY_SELECT_SQL} WHERE enabled = 1 ORDER BY group_name, model, priority DESC, weight DESC, channel_id"),
            [],
        )
    }

    /// Reads abilities and channels inside one transaction so a channel write
    /// committed between the two SELECTs cannot leave rows pointing at nothing.
    pub fn load_directory_rows(&self) -> Result<DirectoryRows> {
        // 中文注释：WAL 下同一读事务共享一个快照，两次查询看到同一版本。
        let tx = self.conn.unchecked_transaction()?;
        let abilities = self.list_enabled_abilities()?;
        let channels = self.list_channels()?;
        tx.commit()?;
        Ok(DirectoryRows {
            abilities,
            channels,
        })
    }

    /// Enabled abilities for one (group, model) pair, highest priority first.
    pub fn list_abilities(&self, group: &str, model: &str) -> Result<Vec<Ability>> {
        self.query_abilities(
            &format!("{ABILITY_SELECT_SQL} WHERE group_name = ?1 AND model = ?2 AND enabled = 1 ORDER BY priority DESC, weight DESC, channel_id"),
            [group, model],
        )
    }

    pub fn list_channel_abilities(&self, channel_id: i64) -> Result<Vec<Ability>> {
        self.query_abilities(
            &format!("{ABILITY_SELECT_SQL} WHERE channel_id = ?1 ORDER BY group_name, model"),
            [channel_id],
        )
    }

    pub fn group_models(&self, group: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT model FROM abilities WHERE group_name = ?1 AND enabled = 1 ORDER BY model",
        )?;
        let models = stmt
            .query_map([group], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>>>()?;
        Ok(models)
    }

    pub fn enabled_models(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT model FROM abilities WHERE enabled = 1 ORDER BY model")?;
        let models = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>>>()?;
        Ok(models)
    }

    fn query_abilities<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<Ability>> {
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = stmt.query(params)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(map_ability_row(row)?);
        }
        Ok(out)
    }
}

fn map_ability_row(row: &Row<'_>) -> Result<Ability> {
    Ok(Ability {
        group: row.get(0)?,
        model: row.get(1)?,
        channel_id: row.get(2)?,
        enabled: row.get(3)?,
        priority: row.get(4)?,
        weight: row.get(5)?,
        supports_image: row.get(6)?,
        supports_stream: row.get(7)?,
        supports_system_prompt: row.get(8)?,
        supports_non_deterministic: row.get(9)?,
        supports_function_call: row.get(10)?,
        max_input_tokens: row.get(11)?,
    })
}

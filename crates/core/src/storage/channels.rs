use rusqlite::{OptionalExtension, Result, Row};

use super::{abilities::write_channel_abilities, now_ts, Channel, Storage};

const CHANNEL_SELECT_SQL: &str = "SELECT
    id,
    name,
    channel_type,
    status,
    priority,
    weight,
    base_url,
    api_key,
    other,
    models,
    groups,
    model_mapping,
    status_code_mapping,
    supports_image,
    supports_stream,
    supports_system_prompt,
    supports_non_deterministic,
    supports_function_call,
    max_input_tokens,
    auto_ban,
    created_at,
    updated_at
 FROM channels";

impl Storage {
    /// Inserts the channel and its ability rows in one transaction. A channel
    /// with `id <= 0` gets a fresh id; the stored id is returned.
    pub fn insert_channel(&self, channel: &Channel) -> Result<i64> {
        let tx = self.conn.unchecked_transaction()?;
        let requested_id = (channel.id > 0).then_some(channel.id);
        tx.execute(
            "INSERT INTO channels (
                id, name, channel_type, status, priority, weight, base_url, api_key, other,
                models, groups, model_mapping, status_code_mapping,
                supports_image, supports_stream, supports_system_prompt,
                supports_non_deterministic, supports_function_call,
                max_input_tokens, auto_ban, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22)",
            rusqlite::params![
                requested_id,
                &channel.name,
                channel.channel_type,
                channel.status,
                channel.priority,
                channel.weight,
                &channel.base_url,
                &channel.key,
                &channel.other,
                &channel.models,
                &channel.groups,
                &channel.model_mapping,
                &channel.status_code_mapping,
                channel.supports_image,
                channel.supports_stream,
                channel.supports_system_prompt,
                channel.supports_non_deterministic,
                channel.supports_function_call,
                channel.max_input_tokens,
                channel.auto_ban,
                channel.created_at,
                channel.updated_at,
            ],
        )?;
        let id = tx.last_insert_rowid();
        write_channel_abilities(&tx, channel, id)?;
        tx.commit()?;
        Ok(id)
    }

    /// Rewrites the channel row and replaces its abilities atomically.
    pub fn update_channel(&self, channel: &Channel) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "UPDATE channels SET
                name = ?2,
                channel_type = ?3,
                status = ?4,
                priority = ?5,
                weight = ?6,
                base_url = ?7,
                api_key = ?8,
                other = ?9,
                models = ?10,
                groups = ?11,
                model_mapping = ?12,
                status_code_mapping = ?13,
                supports_image = ?14,
                supports_stream = ?15,
                supports_system_prompt = ?16,
                supports_non_deterministic = ?17,
                supports_function_call = ?18,
                max_input_tokens = ?19,
                auto_ban = ?20,
                updated_at = ?21
             WHERE id = ?1",
            rusqlite::params![
                channel.id,
                &channel.name,
                channel.channel_type,
                channel.status,
                channel.priority,
                channel.weight,
                &channel.base_url,
                &channel.key,
                &channel.other,
                &channel.models,
                &channel.groups,
                &channel.model_mapping,
                &channel.status_code_mapping,
                channel.supports_image,
                channel.supports_stream,
                channel.supports_system_prompt,
                channel.supports_non_deterministic,
                channel.supports_function_call,
                channel.max_input_tokens,
                channel.auto_ban,
                now_ts(),
            ],
        )?;
        write_channel_abilities(&tx, channel, channel.id)?;
        tx.commit()
    }

    /// Changes the channel status and flips its abilities in the same transaction.
    pub fn update_channel_status(&self, channel_id: i64, status: i64) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "UPDATE channels SET status = ?2, updated_at = ?3 WHERE id = ?1",
            (channel_id, status, now_ts()),
        )?;
        tx.execute(
            "UPDATE abilities SET enabled = ?2 WHERE channel_id = ?1",
            (channel_id, status == super::CHANNEL_STATUS_ENABLED),
        )?;
        tx.commit()
    }

    pub fn find_channel_by_id(&self, channel_id: i64) -> Result<Option<Channel>> {
        self.conn
            .query_row(
                &format!("{CHANNEL_SELECT_SQL} WHERE id = ?1"),
                [channel_id],
                map_channel_row,
            )
            .optional()
    }

    pub fn list_channels(&self) -> Result<Vec<Channel>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{CHANNEL_SELECT_SQL} ORDER BY id ASC"))?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(map_channel_row(row)?);
        }
        Ok(out)
    }

    pub fn channel_count(&self) -> Result<i64> {
        self.conn
            .query_row("SELECT COUNT(1) FROM channels", [], |row| row.get(0))
    }

    pub fn delete_channel(&self, channel_id: i64) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM abilities WHERE channel_id = ?1", [channel_id])?;
        tx.execute("DELETE FROM channels WHERE id = ?1", [channel_id])?;
        tx.commit()
    }
}

fn map_channel_row(row: &Row<'_>) -> Result<Channel> {
    Ok(Channel {
        id: row.get(0)?,
        name: row.get(1)?,
        channel_type: row.get(2)?,
        status: row.get(3)?,
        priority: row.get(4)?,
        weight: row.get(5)?,
        base_url: row.get(6)?,
        key: row.get(7)?,
        other: row.get(8)?,
        models: row.get(9)?,
        groups: row.get(10)?,
        model_mapping: row.get(11)?,
        status_code_mapping: row.get(12)?,
        supports_image: row.get(13)?,
        supports_stream: row.get(14)?,
        supports_system_prompt: row.get(15)?,
        supports_non_deterministic: row.get(16)?,
        supports_function_call: row.get(17)?,
        max_input_tokens: row.get(18)?,
        auto_ban: row.get(19)?,
        created_at: row.get(20)?,
        updated_at: row.get(21)?,
    })
}

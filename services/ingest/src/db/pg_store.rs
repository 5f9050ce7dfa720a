//! Postgres-backed [`EventStore`].

use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quorum_events::{
    Event, EventReceiver, EventReceiverGroup, NewEvent, NewEventReceiver, NewEventReceiverGroup,
};
use quorum_id::{EventId, EventReceiverGroupId, EventReceiverId};
use sqlx::{postgres::PgPool, postgres::PgRow, Row};
use tracing::debug;

use super::DbError;
use crate::store::{EventStore, StoreError, StoreResult};

const EVENT_COLUMNS: &str = "id, name, version, release, platform_id, package, description, \
                             payload, success, event_receiver_id, created_at";

const RECEIVER_COLUMNS: &str =
    "id, name, type, version, description, schema, fingerprint, enabled, created_at";

const GROUP_COLUMNS: &str =
    "g.id, g.name, g.type, g.version, g.description, g.enabled, g.created_at, g.updated_at";

fn parse_id<T>(entity: &'static str, raw: String) -> StoreResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse().map_err(|e: T::Err| StoreError::Corrupt {
        entity,
        reason: format!("{raw}: {e}"),
    })
}

fn event_id(raw: String) -> StoreResult<EventId> {
    parse_id("event", raw)
}

fn receiver_id(raw: String) -> StoreResult<EventReceiverId> {
    parse_id("event receiver", raw)
}

fn group_id(raw: String) -> StoreResult<EventReceiverGroupId> {
    parse_id("event receiver group", raw)
}

fn query_err(e: sqlx::Error) -> StoreError {
    StoreError::Db(DbError::Query(e))
}

fn event_from_row(row: &PgRow) -> StoreResult<Event> {
    Ok(Event {
        id: event_id(row.try_get("id").map_err(query_err)?)?,
        name: row.try_get("name").map_err(query_err)?,
        version: row.try_get("version").map_err(query_err)?,
        release: row.try_get("release").map_err(query_err)?,
        platform_id: row.try_get("platform_id").map_err(query_err)?,
        package: row.try_get("package").map_err(query_err)?,
        description: row.try_get("description").map_err(query_err)?,
        payload: row.try_get("payload").map_err(query_err)?,
        success: row.try_get("success").map_err(query_err)?,
        event_receiver_id: receiver_id(row.try_get("event_receiver_id").map_err(query_err)?)?,
        created_at: row.try_get("created_at").map_err(query_err)?,
    })
}

fn receiver_from_row(row: &PgRow) -> StoreResult<EventReceiver> {
    Ok(EventReceiver {
        id: receiver_id(row.try_get("id").map_err(query_err)?)?,
        name: row.try_get("name").map_err(query_err)?,
        kind: row.try_get("type").map_err(query_err)?,
        version: row.try_get("version").map_err(query_err)?,
        description: row.try_get("description").map_err(query_err)?,
        schema: row.try_get("schema").map_err(query_err)?,
        fingerprint: row.try_get("fingerprint").map_err(query_err)?,
        enabled: row.try_get("enabled").map_err(query_err)?,
        created_at: row.try_get("created_at").map_err(query_err)?,
    })
}

/// Group row without members; members are loaded separately.
fn group_from_row(row: &PgRow) -> StoreResult<EventReceiverGroup> {
    Ok(EventReceiverGroup {
        id: group_id(row.try_get("id").map_err(query_err)?)?,
        name: row.try_get("name").map_err(query_err)?,
        kind: row.try_get("type").map_err(query_err)?,
        version: row.try_get("version").map_err(query_err)?,
        description: row.try_get("description").map_err(query_err)?,
        enabled: row.try_get("enabled").map_err(query_err)?,
        event_receiver_ids: Vec::new(),
        created_at: row.try_get("created_at").map_err(query_err)?,
        updated_at: row.try_get("updated_at").map_err(query_err)?,
    })
}

/// Postgres implementation of [`EventStore`].
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Fills in `event_receiver_ids` for every group, in membership order.
    async fn attach_members(&self, groups: &mut [EventReceiverGroup]) -> StoreResult<()> {
        if groups.is_empty() {
            return Ok(());
        }

        let ids: Vec<String> = groups.iter().map(|g| g.id.to_string()).collect();
        let rows = sqlx::query(
            r#"
            SELECT event_receiver_group_id, event_receiver_id
            FROM event_receiver_group_members
            WHERE event_receiver_group_id = ANY($1)
            ORDER BY event_receiver_group_id, position
            "#,
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await
        .map_err(query_err)?;

        let mut members: HashMap<EventReceiverGroupId, Vec<EventReceiverId>> = HashMap::new();
        for row in &rows {
            let group = group_id(row.try_get("event_receiver_group_id").map_err(query_err)?)?;
            let member = receiver_id(row.try_get("event_receiver_id").map_err(query_err)?)?;
            members.entry(group).or_default().push(member);
        }

        for group in groups.iter_mut() {
            group.event_receiver_ids = members.remove(&group.id).unwrap_or_default();
        }
        Ok(())
    }
}

#[async_trait]
impl EventStore for PgStore {
    async fn create_event(&self, event: NewEvent) -> StoreResult<Event> {
        let id = EventId::new();
        let receiver_id = event.event_receiver_id;

        let row = sqlx::query(
            r#"
            INSERT INTO events (
                id,
                name,
                version,
                release,
                platform_id,
                package,
                description,
                payload,
                success,
                event_receiver_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING created_at
            "#,
        )
        .bind(id.to_string())
        .bind(&event.name)
        .bind(&event.version)
        .bind(&event.release)
        .bind(&event.platform_id)
        .bind(&event.package)
        .bind(&event.description)
        .bind(&event.payload)
        .bind(event.success)
        .bind(receiver_id.to_string())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            let err = DbError::Query(e);
            if err.is_foreign_key_violation() {
                return StoreError::unknown_receiver(&receiver_id);
            }
            StoreError::Db(err)
        })?;

        let created_at: DateTime<Utc> = row.try_get("created_at").map_err(query_err)?;
        debug!(event_id = %id, receiver_id = %receiver_id, "Event stored");
        Ok(event.into_event(id, created_at))
    }

    async fn create_event_receiver(&self, receiver: NewEventReceiver) -> StoreResult<EventReceiver> {
        let id = EventReceiverId::new();
        // Fingerprint is computed from the definition before insert.
        let draft = receiver.into_receiver(id, Utc::now());

        let row = sqlx::query(
            r#"
            INSERT INTO event_receivers (
                id,
                name,
                type,
                version,
                description,
                schema,
                fingerprint,
                enabled
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING created_at
            "#,
        )
        .bind(id.to_string())
        .bind(&draft.name)
        .bind(&draft.kind)
        .bind(&draft.version)
        .bind(&draft.description)
        .bind(&draft.schema)
        .bind(&draft.fingerprint)
        .bind(draft.enabled)
        .fetch_one(&self.pool)
        .await
        .map_err(query_err)?;

        let created_at: DateTime<Utc> = row.try_get("created_at").map_err(query_err)?;
        debug!(receiver_id = %id, fingerprint = %draft.fingerprint, "Event receiver stored");
        Ok(EventReceiver {
            created_at,
            ..draft
        })
    }

    async fn create_event_receiver_group(
        &self,
        group: NewEventReceiverGroup,
    ) -> StoreResult<EventReceiverGroup> {
        let members = group.members();
        if members.is_empty() {
            return Err(StoreError::EmptyGroup);
        }

        let id = EventReceiverGroupId::new();
        let mut tx = self.pool.begin().await.map_err(query_err)?;

        let row = sqlx::query(
            r#"
            INSERT INTO event_receiver_groups (id, name, type, version, description, enabled)
            VALUES ($1, $2, $3, $4, $5, TRUE)
            RETURNING created_at
            "#,
        )
        .bind(id.to_string())
        .bind(&group.name)
        .bind(&group.kind)
        .bind(&group.version)
        .bind(&group.description)
        .fetch_one(&mut *tx)
        .await
        .map_err(query_err)?;
        let created_at: DateTime<Utc> = row.try_get("created_at").map_err(query_err)?;

        for (position, receiver_id) in members.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO event_receiver_group_members (
                    event_receiver_group_id,
                    event_receiver_id,
                    position
                )
                VALUES ($1, $2, $3)
                "#,
            )
            .bind(id.to_string())
            .bind(receiver_id.to_string())
            .bind(position as i32)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                let err = DbError::Query(e);
                if err.is_foreign_key_violation() {
                    return StoreError::unknown_receiver(receiver_id);
                }
                StoreError::Db(err)
            })?;
        }

        tx.commit().await.map_err(query_err)?;
        debug!(group_id = %id, members = members.len(), "Event receiver group stored");
        Ok(group.into_group(id, created_at))
    }

    async fn find_event(&self, id: &EventId) -> StoreResult<Option<Event>> {
        let row = sqlx::query(&format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = $1"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(query_err)?;
        row.as_ref().map(event_from_row).transpose()
    }

    async fn find_event_receiver(
        &self,
        id: &EventReceiverId,
    ) -> StoreResult<Option<EventReceiver>> {
        let row = sqlx::query(&format!(
            "SELECT {RECEIVER_COLUMNS} FROM event_receivers WHERE id = $1"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(query_err)?;
        row.as_ref().map(receiver_from_row).transpose()
    }

    async fn find_event_receiver_group(
        &self,
        id: &EventReceiverGroupId,
    ) -> StoreResult<Option<EventReceiverGroup>> {
        let row = sqlx::query(&format!(
            "SELECT {GROUP_COLUMNS} FROM event_receiver_groups g WHERE g.id = $1"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(query_err)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut groups = vec![group_from_row(&row)?];
        self.attach_members(&mut groups).await?;
        Ok(groups.pop())
    }

    async fn find_triggered_event_receiver_groups(
        &self,
        event: &Event,
    ) -> StoreResult<Vec<EventReceiverGroup>> {
        // A group qualifies when it has the event's receiver as a member and
        // no member lacks a successful event.
        let rows = sqlx::query(&format!(
            r#"
            SELECT {GROUP_COLUMNS}
            FROM event_receiver_groups g
            WHERE EXISTS (
                SELECT 1
                FROM event_receiver_group_members m
                WHERE m.event_receiver_group_id = g.id
                  AND m.event_receiver_id = $1
            )
            AND NOT EXISTS (
                SELECT 1
                FROM event_receiver_group_members m
                WHERE m.event_receiver_group_id = g.id
                  AND NOT EXISTS (
                      SELECT 1
                      FROM events e
                      WHERE e.event_receiver_id = m.event_receiver_id
                        AND e.success
                  )
            )
            ORDER BY g.created_at, g.id
            "#
        ))
        .bind(event.event_receiver_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(query_err)?;

        let mut groups = rows
            .iter()
            .map(group_from_row)
            .collect::<StoreResult<Vec<_>>>()?;
        self.attach_members(&mut groups).await?;
        Ok(groups)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn corrupt_entity(err: StoreError) -> &'static str {
        match err {
            StoreError::Corrupt { entity, .. } => entity,
            other => panic!("expected corrupt row error, got {other}"),
        }
    }

    #[test]
    fn test_ids_parse_from_text_columns() {
        let id = EventReceiverId::new();
        assert_eq!(receiver_id(id.to_string()).unwrap(), id);
    }

    #[rstest]
    #[case::event(event_id(EventReceiverId::new().to_string()).map(|_| ()), "event")]
    #[case::receiver(receiver_id(EventId::new().to_string()).map(|_| ()), "event receiver")]
    #[case::group(group_id(EventReceiverId::new().to_string()).map(|_| ()), "event receiver group")]
    fn test_corrupt_ids_name_their_entity(
        #[case] parsed: StoreResult<()>,
        #[case] expected: &str,
    ) {
        assert_eq!(corrupt_entity(parsed.unwrap_err()), expected);
    }
}

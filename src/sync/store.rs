//! The remote store seam: a typed async query/upsert interface plus an
//! in-memory backend used by tests and local development.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use super::records::{
    AwardRecord, GameRecord, LinkRecord, ParticipantRecord, PlayerRecord, VersionDescriptor,
};

#[derive(Debug, Error)]
pub enum StoreError {
    /// The batch exceeds the store's write ceiling; callers split and retry.
    #[error("batch of {size} bytes exceeds the {limit} byte limit")]
    BatchTooLarge { size: usize, limit: usize },
    /// Stale record version: someone else wrote since we read.
    #[error("write conflict on record {id}")]
    Conflict { id: Uuid },
    #[error("query failed: {0}")]
    Query(String),
    #[error("write failed: {0}")]
    Write(String),
}

/// Opaque pagination token; valid only against the query that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor(pub(crate) usize);

#[derive(Debug)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next: Option<Cursor>,
}

/// One element of an atomic batch write.
#[derive(Debug, Clone, serde::Serialize)]
pub enum RecordOp {
    UpsertPlayer(PlayerRecord),
    DeletePlayer(Uuid),
    UpsertGame(GameRecord),
    UpsertParticipant(ParticipantRecord),
    UpsertAward(AwardRecord),
    UpsertLink(LinkRecord),
}

/// The remote durable store. Queries are incremental (`since` filters on
/// `sync_date`) and cursor-paginated; writes are atomic per batch.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn fetch_version(&self) -> Result<VersionDescriptor, StoreError>;

    async fn query_players(
        &self,
        since: Option<DateTime<Utc>>,
        cursor: Option<Cursor>,
    ) -> Result<Page<PlayerRecord>, StoreError>;

    async fn lookup_player_by_email(
        &self,
        email: &str,
    ) -> Result<Option<PlayerRecord>, StoreError>;

    async fn query_games(
        &self,
        game_uuids: &[Uuid],
        since: Option<DateTime<Utc>>,
        cursor: Option<Cursor>,
    ) -> Result<Page<GameRecord>, StoreError>;

    async fn query_participants(
        &self,
        player_uuids: &[Uuid],
        since: Option<DateTime<Utc>>,
        cursor: Option<Cursor>,
    ) -> Result<Page<ParticipantRecord>, StoreError>;

    async fn query_awards(&self, player_uuid: Uuid) -> Result<Vec<AwardRecord>, StoreError>;

    /// Applies every op or none. Player upserts are version-checked: a
    /// mismatched `record_version` fails the whole batch with `Conflict`.
    async fn upsert_batch(&self, ops: &[RecordOp]) -> Result<(), StoreError>;
}

/// Applies `ops` through `store.upsert_batch`, halving on `BatchTooLarge`
/// until every chunk lands. Returns the number of applied ops, which equals
/// `ops.len()` on success.
pub async fn update_with_split(
    store: &dyn RemoteStore,
    ops: &[RecordOp],
) -> Result<usize, StoreError> {
    if ops.is_empty() {
        return Ok(0);
    }
    match store.upsert_batch(ops).await {
        Ok(()) => Ok(ops.len()),
        Err(StoreError::BatchTooLarge { .. }) if ops.len() > 1 => {
            let mid = ops.len() / 2;
            let applied = Box::pin(update_with_split(store, &ops[..mid])).await?;
            Ok(applied + Box::pin(update_with_split(store, &ops[mid..])).await?)
        }
        Err(err) => Err(err),
    }
}

#[derive(Default)]
struct Tables {
    players: HashMap<Uuid, PlayerRecord>,
    games: HashMap<Uuid, GameRecord>,
    participants: HashMap<Uuid, ParticipantRecord>,
    awards: HashMap<(Uuid, String), AwardRecord>,
    links: Vec<LinkRecord>,
}

/// In-memory `RemoteStore` with a configurable page size and batch byte
/// ceiling, plus one-shot fault injection for conflict paths.
pub struct InMemoryRemoteStore {
    tables: Mutex<Tables>,
    version: VersionDescriptor,
    page_size: usize,
    batch_limit: usize,
    batches_applied: Mutex<usize>,
    inject_conflict: Mutex<Option<Uuid>>,
}

impl InMemoryRemoteStore {
    pub fn new(version: VersionDescriptor) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            version,
            page_size: 100,
            batch_limit: usize::MAX,
            batches_applied: Mutex::new(0),
            inject_conflict: Mutex::new(None),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Batches serializing above `limit` bytes fail with `BatchTooLarge`.
    pub fn with_batch_limit(mut self, limit: usize) -> Self {
        self.batch_limit = limit;
        self
    }

    /// The next batch touching `id` fails once with `Conflict`.
    pub fn inject_conflict(&self, id: Uuid) {
        *self.inject_conflict.lock().expect("remote store poisoned") = Some(id);
    }

    pub fn batches_applied(&self) -> usize {
        *self.batches_applied.lock().expect("remote store poisoned")
    }

    pub fn seed_player(&self, player: PlayerRecord) {
        let mut tables = self.tables.lock().expect("remote store poisoned");
        tables.players.insert(player.player_uuid, player);
    }

    pub fn seed_game(&self, game: GameRecord) {
        let mut tables = self.tables.lock().expect("remote store poisoned");
        tables.games.insert(game.game_uuid, game);
    }

    pub fn seed_participant(&self, participant: ParticipantRecord) {
        let mut tables = self.tables.lock().expect("remote store poisoned");
        tables
            .participants
            .insert(participant.participant_uuid, participant);
    }

    pub fn seed_award(&self, award: AwardRecord) {
        let mut tables = self.tables.lock().expect("remote store poisoned");
        tables
            .awards
            .insert((award.player_uuid, award.kind.clone()), award);
    }

    pub fn player(&self, id: Uuid) -> Option<PlayerRecord> {
        let tables = self.tables.lock().expect("remote store poisoned");
        tables.players.get(&id).cloned()
    }

    pub fn game(&self, id: Uuid) -> Option<GameRecord> {
        let tables = self.tables.lock().expect("remote store poisoned");
        tables.games.get(&id).cloned()
    }

    pub fn participant(&self, id: Uuid) -> Option<ParticipantRecord> {
        let tables = self.tables.lock().expect("remote store poisoned");
        tables.participants.get(&id).cloned()
    }

    pub fn award(&self, player: Uuid, kind: &str) -> Option<AwardRecord> {
        let tables = self.tables.lock().expect("remote store poisoned");
        tables.awards.get(&(player, kind.to_string())).cloned()
    }

    pub fn links(&self) -> Vec<LinkRecord> {
        let tables = self.tables.lock().expect("remote store poisoned");
        tables.links.clone()
    }

    fn paginate<T: Clone>(&self, mut items: Vec<T>, cursor: Option<Cursor>) -> Page<T> {
        let start = cursor.map(|c| c.0).unwrap_or(0).min(items.len());
        let end = (start + self.page_size).min(items.len());
        let next = (end < items.len()).then_some(Cursor(end));
        items.drain(..start);
        items.truncate(end - start);
        Page { items, next }
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemoteStore {
    async fn fetch_version(&self) -> Result<VersionDescriptor, StoreError> {
        Ok(self.version.clone())
    }

    async fn query_players(
        &self,
        since: Option<DateTime<Utc>>,
        cursor: Option<Cursor>,
    ) -> Result<Page<PlayerRecord>, StoreError> {
        let tables = self.tables.lock().expect("remote store poisoned");
        let mut players: Vec<PlayerRecord> = tables
            .players
            .values()
            .filter(|p| since.map(|s| p.sync_date > s).unwrap_or(true))
            .cloned()
            .collect();
        drop(tables);
        players.sort_by_key(|p| (p.sync_date, p.player_uuid));
        Ok(self.paginate(players, cursor))
    }

    async fn lookup_player_by_email(
        &self,
        email: &str,
    ) -> Result<Option<PlayerRecord>, StoreError> {
        let tables = self.tables.lock().expect("remote store poisoned");
        Ok(tables
            .players
            .values()
            .find(|p| p.email.as_deref() == Some(email))
            .cloned())
    }

    async fn query_games(
        &self,
        game_uuids: &[Uuid],
        since: Option<DateTime<Utc>>,
        cursor: Option<Cursor>,
    ) -> Result<Page<GameRecord>, StoreError> {
        let tables = self.tables.lock().expect("remote store poisoned");
        let mut games: Vec<GameRecord> = tables
            .games
            .values()
            .filter(|g| game_uuids.is_empty() || game_uuids.contains(&g.game_uuid))
            .filter(|g| since.map(|s| g.sync_date > s).unwrap_or(true))
            .cloned()
            .collect();
        drop(tables);
        games.sort_by_key(|g| (g.sync_date, g.game_uuid));
        Ok(self.paginate(games, cursor))
    }

    async fn query_participants(
        &self,
        player_uuids: &[Uuid],
        since: Option<DateTime<Utc>>,
        cursor: Option<Cursor>,
    ) -> Result<Page<ParticipantRecord>, StoreError> {
        let tables = self.tables.lock().expect("remote store poisoned");
        let mut participants: Vec<ParticipantRecord> = tables
            .participants
            .values()
            .filter(|p| player_uuids.is_empty() || player_uuids.contains(&p.player_uuid))
            .filter(|p| since.map(|s| p.sync_date > s).unwrap_or(true))
            .cloned()
            .collect();
        drop(tables);
        participants.sort_by_key(|p| (p.sync_date, p.participant_uuid));
        Ok(self.paginate(participants, cursor))
    }

    async fn query_awards(&self, player_uuid: Uuid) -> Result<Vec<AwardRecord>, StoreError> {
        let tables = self.tables.lock().expect("remote store poisoned");
        Ok(tables
            .awards
            .values()
            .filter(|a| a.player_uuid == player_uuid)
            .cloned()
            .collect())
    }

    async fn upsert_batch(&self, ops: &[RecordOp]) -> Result<(), StoreError> {
        let size = serde_json::to_vec(ops)
            .map_err(|err| StoreError::Write(err.to_string()))?
            .len();
        if size > self.batch_limit {
            return Err(StoreError::BatchTooLarge {
                size,
                limit: self.batch_limit,
            });
        }

        let mut tables = self.tables.lock().expect("remote store poisoned");

        let injected = self.inject_conflict.lock().expect("remote store poisoned").take();
        if let Some(id) = injected {
            let touches = ops.iter().any(|op| match op {
                RecordOp::UpsertPlayer(p) => p.player_uuid == id,
                RecordOp::DeletePlayer(uuid) => *uuid == id,
                RecordOp::UpsertGame(g) => g.game_uuid == id,
                RecordOp::UpsertParticipant(p) => p.participant_uuid == id,
                RecordOp::UpsertAward(a) => a.player_uuid == id,
                RecordOp::UpsertLink(_) => false,
            });
            if touches {
                return Err(StoreError::Conflict { id });
            }
        }

        // Version pre-check before any mutation keeps the batch atomic.
        for op in ops {
            if let RecordOp::UpsertPlayer(player) = op {
                if let Some(existing) = tables.players.get(&player.player_uuid) {
                    if existing.record_version != player.record_version {
                        return Err(StoreError::Conflict {
                            id: player.player_uuid,
                        });
                    }
                }
            }
        }

        for op in ops {
            match op {
                RecordOp::UpsertPlayer(player) => {
                    let mut stored = player.clone();
                    stored.record_version += 1;
                    tables.players.insert(stored.player_uuid, stored);
                }
                RecordOp::DeletePlayer(id) => {
                    tables.players.remove(id);
                }
                RecordOp::UpsertGame(game) => {
                    let mut stored = game.clone();
                    stored.confirmed = true;
                    tables.games.insert(stored.game_uuid, stored);
                }
                RecordOp::UpsertParticipant(participant) => {
                    let mut stored = participant.clone();
                    stored.confirmed = true;
                    tables.participants.insert(stored.participant_uuid, stored);
                }
                RecordOp::UpsertAward(award) => {
                    tables
                        .awards
                        .insert((award.player_uuid, award.kind.clone()), award.clone());
                }
                RecordOp::UpsertLink(link) => {
                    tables.links.push(link.clone());
                }
            }
        }
        *self.batches_applied.lock().expect("remote store poisoned") += 1;
        Ok(())
    }
}

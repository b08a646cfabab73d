//! Cloud synchronization between the device-local store and the remote
//! durable store.
//!
//! A run executes an ordered phase list for its mode, one phase at a time,
//! each under a timeout. Exactly one run executes process-wide: a second
//! caller either queues behind the run token (`wait_finish`) or gets
//! `SyncError::Busy`. Any phase error aborts the remaining phases and is
//! reported through the run outcome.

pub mod records;
pub mod store;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use std::sync::Mutex as StdMutex;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use records::{
    AwardRecord, GameRecord, LinkRecord, ParticipantRecord, PlayerRecord, VersionInfo,
};
use store::{update_with_split, RecordOp, RemoteStore, StoreError};

const LOG_TARGET: &str = "whist_core::sync";

/// Stale-write restarts tolerated by temp-id reconciliation before the
/// phase gives up.
const MAX_PHASE_RESTARTS: usize = 3;

#[derive(Debug, Clone, PartialEq)]
pub enum SyncMode {
    /// Everything: players, games, participants, unconfirmed uploads, awards.
    Full,
    /// The pre-game subset: identity reconciliation and the player roster.
    PreGame,
    /// Download/merge the named players only.
    GetPlayers { specific_player_uuids: Vec<Uuid> },
    /// Push locally changed player records up.
    UpdatePlayers,
    /// Version gate check only.
    GetVersion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Version,
    TempIds,
    Players,
    SpecificPlayers,
    GamesParticipants,
    UploadUnconfirmed,
    Awards,
    PushPlayers,
}

impl Phase {
    fn name(self) -> &'static str {
        match self {
            Phase::Version => "version",
            Phase::TempIds => "tempIds",
            Phase::Players | Phase::SpecificPlayers => "players",
            Phase::GamesParticipants => "gamesParticipants",
            Phase::UploadUnconfirmed => "uploadUnconfirmed",
            Phase::Awards => "awards",
            Phase::PushPlayers => "pushPlayers",
        }
    }
}

impl SyncMode {
    fn phases(&self) -> Vec<Phase> {
        match self {
            SyncMode::Full => vec![
                Phase::Version,
                Phase::TempIds,
                Phase::Players,
                Phase::GamesParticipants,
                Phase::UploadUnconfirmed,
                Phase::Awards,
            ],
            SyncMode::PreGame => vec![
                Phase::Version,
                Phase::TempIds,
                Phase::Players,
                Phase::UploadUnconfirmed,
            ],
            SyncMode::GetPlayers { .. } => vec![Phase::Version, Phase::SpecificPlayers],
            SyncMode::UpdatePlayers => vec![Phase::Version, Phase::PushPlayers],
            SyncMode::GetVersion => vec![Phase::Version],
        }
    }

    fn specific_players(&self) -> Option<&[Uuid]> {
        match self {
            SyncMode::GetPlayers {
                specific_player_uuids,
            } => Some(specific_player_uuids),
            _ => None,
        }
    }
}

/// Why a run stopped without syncing. Blocks are user-facing conditions,
/// not errors: the store is healthy, this client is not allowed in.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockReason {
    AccessBlocked { required: u32 },
    SyncBlocked { required: u32 },
    DatabaseMismatch { local: String, remote: String },
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("a sync run is already in progress")]
    Busy,
    #[error("sync phase `{phase}` timed out")]
    Timeout { phase: &'static str },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("local store: {0}")]
    Local(#[from] anyhow::Error),
}

/// Result of one run. `errors` counts phase failures (a failing phase aborts
/// the rest, so the count is 0 or 1); `block` is set when the version gate
/// refused the run.
#[derive(Debug, Default)]
pub struct SyncOutcome {
    pub errors: usize,
    pub block: Option<BlockReason>,
    pub last_error: Option<String>,
}

impl SyncOutcome {
    pub fn clean(&self) -> bool {
        self.errors == 0 && self.block.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub client: VersionInfo,
    pub phase_timeout: Duration,
    /// Incremental queries reach back this far before the recorded last
    /// sync to absorb clock skew between devices.
    pub overlap: TimeDelta,
    pub participant_chunk: usize,
    pub game_chunk: usize,
}

impl SyncConfig {
    pub fn new(client: VersionInfo) -> Self {
        Self {
            client,
            phase_timeout: Duration::from_secs(30),
            overlap: TimeDelta::hours(1),
            participant_chunk: 30,
            game_chunk: 50,
        }
    }
}

/// The device-local durable store. Kept opaque so callers can back it with
/// whatever persistence they have; all methods are infallible in-memory.
#[async_trait::async_trait]
pub trait LocalStore: Send + Sync {
    async fn players(&self) -> anyhow::Result<Vec<PlayerRecord>>;
    async fn player(&self, id: Uuid) -> anyhow::Result<Option<PlayerRecord>>;
    async fn put_player(&self, player: PlayerRecord) -> anyhow::Result<()>;
    async fn remove_player(&self, id: Uuid) -> anyhow::Result<()>;

    async fn games(&self) -> anyhow::Result<Vec<GameRecord>>;
    async fn put_game(&self, game: GameRecord) -> anyhow::Result<()>;

    async fn participants(&self) -> anyhow::Result<Vec<ParticipantRecord>>;
    async fn put_participant(&self, participant: ParticipantRecord) -> anyhow::Result<()>;

    async fn awards(&self) -> anyhow::Result<Vec<AwardRecord>>;
    async fn put_award(&self, award: AwardRecord) -> anyhow::Result<()>;

    async fn last_sync(&self) -> anyhow::Result<Option<DateTime<Utc>>>;
    async fn set_last_sync(&self, at: DateTime<Utc>) -> anyhow::Result<()>;

    /// Rewrites every reference to `from` (participants, game rosters,
    /// awards) to point at `to`. The player record itself is the engine's
    /// responsibility.
    async fn remap_player(&self, from: Uuid, to: Uuid) -> anyhow::Result<()>;
}

#[derive(Default)]
pub struct InMemoryLocalStore {
    players: DashMap<Uuid, PlayerRecord>,
    games: DashMap<Uuid, GameRecord>,
    participants: DashMap<Uuid, ParticipantRecord>,
    awards: DashMap<(Uuid, String), AwardRecord>,
    last_sync: StdMutex<Option<DateTime<Utc>>>,
}

#[async_trait::async_trait]
impl LocalStore for InMemoryLocalStore {
    async fn players(&self) -> anyhow::Result<Vec<PlayerRecord>> {
        Ok(self.players.iter().map(|entry| entry.value().clone()).collect())
    }

    async fn player(&self, id: Uuid) -> anyhow::Result<Option<PlayerRecord>> {
        Ok(self.players.get(&id).map(|entry| entry.value().clone()))
    }

    async fn put_player(&self, player: PlayerRecord) -> anyhow::Result<()> {
        self.players.insert(player.player_uuid, player);
        Ok(())
    }

    async fn remove_player(&self, id: Uuid) -> anyhow::Result<()> {
        self.players.remove(&id);
        Ok(())
    }

    async fn games(&self) -> anyhow::Result<Vec<GameRecord>> {
        Ok(self.games.iter().map(|entry| entry.value().clone()).collect())
    }

    async fn put_game(&self, game: GameRecord) -> anyhow::Result<()> {
        self.games.insert(game.game_uuid, game);
        Ok(())
    }

    async fn participants(&self) -> anyhow::Result<Vec<ParticipantRecord>> {
        Ok(self
            .participants
            .iter()
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn put_participant(&self, participant: ParticipantRecord) -> anyhow::Result<()> {
        self.participants
            .insert(participant.participant_uuid, participant);
        Ok(())
    }

    async fn awards(&self) -> anyhow::Result<Vec<AwardRecord>> {
        Ok(self.awards.iter().map(|entry| entry.value().clone()).collect())
    }

    async fn put_award(&self, award: AwardRecord) -> anyhow::Result<()> {
        self.awards
            .insert((award.player_uuid, award.kind.clone()), award);
        Ok(())
    }

    async fn last_sync(&self) -> anyhow::Result<Option<DateTime<Utc>>> {
        Ok(*self.last_sync.lock().expect("local store poisoned"))
    }

    async fn set_last_sync(&self, at: DateTime<Utc>) -> anyhow::Result<()> {
        *self.last_sync.lock().expect("local store poisoned") = Some(at);
        Ok(())
    }

    async fn remap_player(&self, from: Uuid, to: Uuid) -> anyhow::Result<()> {
        for mut entry in self.participants.iter_mut() {
            if entry.player_uuid == from {
                entry.player_uuid = to;
            }
        }
        for mut entry in self.games.iter_mut() {
            for uuid in entry.player_uuids.iter_mut() {
                if *uuid == from {
                    *uuid = to;
                }
            }
        }
        let keys: Vec<(Uuid, String)> = self
            .awards
            .iter()
            .filter(|entry| entry.key().0 == from)
            .map(|entry| entry.key().clone())
            .collect();
        for key in keys {
            if let Some((_, mut award)) = self.awards.remove(&key) {
                award.player_uuid = to;
                self.awards.insert((to, key.1), award);
            }
        }
        Ok(())
    }
}

pub struct SyncEngine {
    remote: Arc<dyn RemoteStore>,
    local: Arc<dyn LocalStore>,
    cfg: SyncConfig,
    run_token: Mutex<()>,
}

impl SyncEngine {
    pub fn new(remote: Arc<dyn RemoteStore>, local: Arc<dyn LocalStore>, cfg: SyncConfig) -> Self {
        Self {
            remote,
            local,
            cfg,
            run_token: Mutex::new(()),
        }
    }

    /// Runs one sync pass. With `wait_finish` the call queues behind any run
    /// already in flight; otherwise it fails fast with `SyncError::Busy`.
    pub async fn run(&self, mode: SyncMode, wait_finish: bool) -> Result<SyncOutcome, SyncError> {
        let _token = if wait_finish {
            self.run_token.lock().await
        } else {
            self.run_token.try_lock().map_err(|_| SyncError::Busy)?
        };

        let started_at = Utc::now();
        info!(target: LOG_TARGET, mode = ?mode, "sync run starting");
        let mut outcome = SyncOutcome::default();

        for phase in mode.phases() {
            let result = self.run_phase(phase, &mode, &mut outcome).await;
            if let Err(err) = result {
                warn!(target: LOG_TARGET, phase = phase.name(), error = %err, "sync phase failed");
                outcome.errors += 1;
                outcome.last_error = Some(err.to_string());
                break;
            }
            if outcome.block.is_some() {
                info!(target: LOG_TARGET, block = ?outcome.block, "sync run blocked");
                break;
            }
        }

        if outcome.clean() && matches!(mode, SyncMode::Full | SyncMode::PreGame) {
            self.local.set_last_sync(started_at).await?;
        }
        info!(
            target: LOG_TARGET,
            errors = outcome.errors,
            blocked = outcome.block.is_some(),
            "sync run finished"
        );
        Ok(outcome)
    }

    async fn run_phase(
        &self,
        phase: Phase,
        mode: &SyncMode,
        outcome: &mut SyncOutcome,
    ) -> Result<(), SyncError> {
        let timeout = self.cfg.phase_timeout;
        let fut = async {
            match phase {
                Phase::Version => {
                    outcome.block = self.phase_version().await?;
                    Ok(())
                }
                Phase::TempIds => self.phase_temp_ids().await,
                Phase::Players => self.phase_players(None).await,
                Phase::SpecificPlayers => {
                    self.phase_players(mode.specific_players()).await
                }
                Phase::GamesParticipants => self.phase_games_participants().await,
                Phase::UploadUnconfirmed => self.phase_upload_unconfirmed().await,
                Phase::Awards => self.phase_awards().await,
                Phase::PushPlayers => self.phase_push_players().await,
            }
        };
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout {
                phase: phase.name(),
            }),
        }
    }

    async fn phase_version(&self) -> Result<Option<BlockReason>, SyncError> {
        let descriptor = self.remote.fetch_version().await?;
        let client = &self.cfg.client;
        if client.client_version < descriptor.access_floor {
            return Ok(Some(BlockReason::AccessBlocked {
                required: descriptor.access_floor,
            }));
        }
        if client.client_version < descriptor.sync_floor {
            return Ok(Some(BlockReason::SyncBlocked {
                required: descriptor.sync_floor,
            }));
        }
        if client.database_tag != descriptor.database_tag {
            return Ok(Some(BlockReason::DatabaseMismatch {
                local: client.database_tag.clone(),
                remote: descriptor.database_tag,
            }));
        }
        Ok(None)
    }

    /// Resolves players created offline under provisional UUIDs against the
    /// authoritative records keyed by email. A stale-version conflict from
    /// the store restarts the whole phase.
    async fn phase_temp_ids(&self) -> Result<(), SyncError> {
        let mut restarts = 0;
        loop {
            match self.reconcile_temp_ids().await {
                Ok(()) => return Ok(()),
                Err(SyncError::Store(StoreError::Conflict { id }))
                    if restarts < MAX_PHASE_RESTARTS =>
                {
                    restarts += 1;
                    debug!(
                        target: LOG_TARGET,
                        %id,
                        restarts,
                        "temp-id write conflicted, restarting phase"
                    );
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn reconcile_temp_ids(&self) -> Result<(), SyncError> {
        let temporaries: Vec<PlayerRecord> = self
            .local
            .players()
            .await?
            .into_iter()
            .filter(|p| p.temporary)
            .collect();
        for local in temporaries {
            let remote_match = match &local.email {
                Some(email) => self.remote.lookup_player_by_email(email).await?,
                None => None,
            };
            match remote_match {
                Some(remote) => {
                    // Collision: fold the provisional record into the
                    // authoritative one and rewrite local references.
                    let provisional_id = local.player_uuid;
                    let mut merged = local.merge(&remote);
                    self.remote
                        .upsert_batch(&[RecordOp::UpsertPlayer(merged.clone())])
                        .await?;
                    merged.record_version += 1;
                    merged.baseline = merged.counters;
                    self.local
                        .remap_player(provisional_id, merged.player_uuid)
                        .await?;
                    if provisional_id != merged.player_uuid {
                        self.local.remove_player(provisional_id).await?;
                    }
                    self.local.put_player(merged).await?;
                }
                None => {
                    // No collision: this record becomes authoritative as-is.
                    let mut promoted = local;
                    promoted.temporary = false;
                    self.remote
                        .upsert_batch(&[RecordOp::UpsertPlayer(promoted.clone())])
                        .await?;
                    promoted.record_version += 1;
                    promoted.baseline = promoted.counters;
                    self.local.put_player(promoted).await?;
                }
            }
        }
        Ok(())
    }

    /// Downloads changed remote players, merges field-by-field, queues the
    /// changed merges back up, and writes the results locally. Baselines
    /// move only after the remote write is confirmed.
    async fn phase_players(&self, specific: Option<&[Uuid]>) -> Result<(), SyncError> {
        let since = match specific {
            Some(_) => None,
            None => self.since().await?,
        };
        let mut upserts: Vec<PlayerRecord> = Vec::new();
        let mut local_writes: Vec<PlayerRecord> = Vec::new();

        let mut cursor = None;
        loop {
            let page = self.remote.query_players(since, cursor).await?;
            for remote in page.items {
                if let Some(wanted) = specific {
                    if !wanted.contains(&remote.player_uuid) {
                        continue;
                    }
                }
                match self.local.player(remote.player_uuid).await? {
                    Some(local) => {
                        let merged = local.merge(&remote);
                        if merged.same_content(&remote) {
                            let mut settled = merged;
                            settled.baseline = settled.counters;
                            local_writes.push(settled);
                        } else {
                            upserts.push(merged);
                        }
                    }
                    None => {
                        let mut adopted = remote;
                        adopted.baseline = adopted.counters;
                        local_writes.push(adopted);
                    }
                }
            }
            match page.next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        if !upserts.is_empty() {
            let ops: Vec<RecordOp> = upserts
                .iter()
                .cloned()
                .map(RecordOp::UpsertPlayer)
                .collect();
            update_with_split(self.remote.as_ref(), &ops).await?;
            for mut merged in upserts {
                merged.record_version += 1;
                merged.baseline = merged.counters;
                local_writes.push(merged);
            }
        }
        for player in local_writes {
            self.local.put_player(player).await?;
        }
        Ok(())
    }

    /// Incremental game/participant download, chunked to the store's query
    /// limits, every cursor stitched before the phase completes. Whole-record
    /// merge: the newer `sync_date` wins.
    async fn phase_games_participants(&self) -> Result<(), SyncError> {
        let since = self.since().await?;

        let player_ids: Vec<Uuid> = self
            .local
            .players()
            .await?
            .iter()
            .map(|p| p.player_uuid)
            .collect();

        let mut game_ids: Vec<Uuid> =
            self.local.games().await?.iter().map(|g| g.game_uuid).collect();

        for chunk in player_ids.chunks(self.cfg.participant_chunk.max(1)) {
            let mut cursor = None;
            loop {
                let page = self.remote.query_participants(chunk, since, cursor).await?;
                for remote in page.items {
                    if !game_ids.contains(&remote.game_uuid) {
                        game_ids.push(remote.game_uuid);
                    }
                    let keep = match self
                        .local
                        .participants()
                        .await?
                        .into_iter()
                        .find(|p| p.participant_uuid == remote.participant_uuid)
                    {
                        Some(local) if local.sync_date > remote.sync_date => local,
                        _ => remote,
                    };
                    self.local.put_participant(keep).await?;
                }
                match page.next {
                    Some(next) => cursor = Some(next),
                    None => break,
                }
            }
        }

        let local_games = self.local.games().await?;
        for chunk in game_ids.chunks(self.cfg.game_chunk.max(1)) {
            let mut cursor = None;
            loop {
                let page = self.remote.query_games(chunk, since, cursor).await?;
                for remote in page.items {
                    let keep = match local_games
                        .iter()
                        .find(|g| g.game_uuid == remote.game_uuid)
                    {
                        Some(local) if local.sync_date > remote.sync_date => local.clone(),
                        _ => remote,
                    };
                    self.local.put_game(keep).await?;
                }
                match page.next {
                    Some(next) => cursor = Some(next),
                    None => break,
                }
            }
        }
        Ok(())
    }

    /// Uploads every never-confirmed local game and participant, plus the
    /// email links other devices need to resolve provisional players, as one
    /// batched write.
    async fn phase_upload_unconfirmed(&self) -> Result<(), SyncError> {
        let mut ops: Vec<RecordOp> = Vec::new();
        let games: Vec<GameRecord> = self
            .local
            .games()
            .await?
            .into_iter()
            .filter(|g| !g.confirmed)
            .collect();
        let participants: Vec<ParticipantRecord> = self
            .local
            .participants()
            .await?
            .into_iter()
            .filter(|p| !p.confirmed)
            .collect();
        if games.is_empty() && participants.is_empty() {
            return Ok(());
        }

        for player in self.local.players().await? {
            if let (Some(email), false) = (&player.email, player.temporary) {
                ops.push(RecordOp::UpsertLink(LinkRecord {
                    email: email.clone(),
                    player_uuid: player.player_uuid,
                    date: Utc::now(),
                }));
            }
        }
        ops.extend(games.iter().cloned().map(RecordOp::UpsertGame));
        ops.extend(
            participants
                .iter()
                .cloned()
                .map(RecordOp::UpsertParticipant),
        );

        update_with_split(self.remote.as_ref(), &ops).await?;

        for mut game in games {
            game.confirmed = true;
            self.local.put_game(game).await?;
        }
        for mut participant in participants {
            participant.confirmed = true;
            self.local.put_participant(participant).await?;
        }
        Ok(())
    }

    /// Additive-count, max-date award reconciliation.
    async fn phase_awards(&self) -> Result<(), SyncError> {
        let mut ops: Vec<RecordOp> = Vec::new();
        let mut merged_awards: Vec<AwardRecord> = Vec::new();

        for player in self.local.players().await? {
            let remote_awards = self.remote.query_awards(player.player_uuid).await?;
            let local_awards: Vec<AwardRecord> = self
                .local
                .awards()
                .await?
                .into_iter()
                .filter(|a| a.player_uuid == player.player_uuid)
                .collect();

            for local in &local_awards {
                let merged = match remote_awards.iter().find(|r| r.kind == local.kind) {
                    Some(remote) => local.merge(remote),
                    None => local.clone(),
                };
                ops.push(RecordOp::UpsertAward(merged.clone()));
                merged_awards.push(merged);
            }
            for remote in remote_awards {
                if !local_awards.iter().any(|l| l.kind == remote.kind) {
                    let mut adopted = remote;
                    adopted.baseline = adopted.count;
                    merged_awards.push(adopted);
                }
            }
        }

        if !ops.is_empty() {
            update_with_split(self.remote.as_ref(), &ops).await?;
        }
        for mut award in merged_awards {
            award.baseline = award.count;
            self.local.put_award(award).await?;
        }
        Ok(())
    }

    /// Pushes locally changed player records up without downloading.
    async fn phase_push_players(&self) -> Result<(), SyncError> {
        let last = self.local.last_sync().await?;
        let changed: Vec<PlayerRecord> = self
            .local
            .players()
            .await?
            .into_iter()
            .filter(|p| !p.temporary)
            .filter(|p| last.map(|at| p.sync_date > at).unwrap_or(true))
            .collect();
        if changed.is_empty() {
            return Ok(());
        }
        let ops: Vec<RecordOp> = changed
            .iter()
            .cloned()
            .map(RecordOp::UpsertPlayer)
            .collect();
        update_with_split(self.remote.as_ref(), &ops).await?;
        for mut player in changed {
            player.record_version += 1;
            player.baseline = player.counters;
            self.local.put_player(player).await?;
        }
        Ok(())
    }

    async fn since(&self) -> Result<Option<DateTime<Utc>>, SyncError> {
        Ok(self
            .local
            .last_sync()
            .await?
            .map(|at| at - self.cfg.overlap))
    }
}

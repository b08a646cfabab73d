//! The game-state dispatcher: interprets drained queue entries against the
//! current game state and tells the controller when a blocking flow starts.
//!
//! Dispatch always finishes a full state transition before returning, so
//! readers of the published snapshot never see a half-applied trick.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use super::messages::{
    AllScoresPayload, CutPayload, ScoresPayload, SeatedPlayer, SeatingPayload, ThumbnailPayload,
};
use super::state::RECOVERY_KEY_HAND;
use super::{
    GameMessage, GameSettings, HandState, PlayerNumber, RecoveryStore, RoundScore, Scorecard,
    TrickOutcome,
};
use crate::queue::{DispatchContext, MessageDispatcher, QueueEntry};
use crate::session::ProtocolError;

const LOG_TARGET: &str = "whist_core::game::dispatch";

/// Upward notifications for the embedding layer. The blocking variants
/// (`PlayHand`, `RoundSummary`, `GameSummary`) arrive with the controller's
/// busy flag already set; the embedder calls `handler_complete` when its
/// flow is dismissed.
#[derive(Debug, Clone)]
pub enum GameEvent {
    NewGame { game_uuid: Uuid, round: u32 },
    DealerChanged { dealer: PlayerNumber },
    PlayersSeated { count: usize },
    PlayHand,
    RoundSummary { round: u32 },
    GameSummary,
    StateResynced { round: u32 },
    ThumbnailReceived {
        player_uuid: Option<Uuid>,
        email: Option<String>,
        image: Vec<u8>,
        date: DateTime<Utc>,
    },
}

struct TableState {
    settings: Option<GameSettings>,
    current_round: u32,
    dealer: Option<PlayerNumber>,
    seats: Vec<Option<SeatedPlayer>>,
    scorecard: Scorecard,
}

pub struct GameStateDispatcher {
    table: Mutex<TableState>,
    // Hand snapshot is read by presentation code while dispatch mutates it;
    // every transition completes under the write lock before readers run.
    hand: RwLock<Option<HandState>>,
    recovery: Arc<dyn RecoveryStore>,
    events_tx: mpsc::UnboundedSender<GameEvent>,
    new_game: AtomicBool,
}

impl GameStateDispatcher {
    pub fn new(
        recovery: Arc<dyn RecoveryStore>,
    ) -> (Self, mpsc::UnboundedReceiver<GameEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                table: Mutex::new(TableState {
                    settings: None,
                    current_round: 0,
                    dealer: None,
                    seats: Vec::new(),
                    scorecard: Scorecard::default(),
                }),
                hand: RwLock::new(None),
                recovery,
                events_tx,
                new_game: AtomicBool::new(false),
            },
            events_rx,
        )
    }

    pub fn settings(&self) -> Option<GameSettings> {
        self.table.lock().expect("table state poisoned").settings.clone()
    }

    pub fn current_round(&self) -> u32 {
        self.table.lock().expect("table state poisoned").current_round
    }

    pub fn dealer(&self) -> Option<PlayerNumber> {
        self.table.lock().expect("table state poisoned").dealer
    }

    pub fn seated_players(&self) -> Vec<Option<SeatedPlayer>> {
        self.table.lock().expect("table state poisoned").seats.clone()
    }

    pub fn scorecard(&self) -> Scorecard {
        self.table
            .lock()
            .expect("table state poisoned")
            .scorecard
            .clone()
    }

    /// True once a `settings` message announced a game UUID we had not seen.
    pub fn is_new_game(&self) -> bool {
        self.new_game.load(Ordering::SeqCst)
    }

    /// Latest hand snapshot; may be mid-round stale relative to in-flight
    /// messages, never mid-transition.
    pub fn hand_snapshot(&self) -> Option<HandState> {
        self.hand.read().expect("hand state poisoned").clone()
    }

    /// Reloads a persisted hand after a restart, resuming recovery mode.
    pub fn resume_from_recovery(&self) -> anyhow::Result<bool> {
        match HandState::load(self.recovery.as_ref())? {
            Some(state) => {
                info!(target: LOG_TARGET, round = state.round, "resuming recovered hand");
                let mut table = self.table.lock().expect("table state poisoned");
                table.current_round = state.round;
                table.dealer = Some(state.dealer);
                drop(table);
                *self.hand.write().expect("hand state poisoned") = Some(state);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn emit(&self, event: GameEvent) {
        let _ = self.events_tx.send(event);
    }

    fn persist_hand(&self, hand: &HandState) {
        if let Err(err) = hand.save(self.recovery.as_ref()) {
            debug!(target: LOG_TARGET, error = %err, "hand state not persisted");
        }
    }

    fn on_settings(&self, settings: GameSettings) {
        let mut table = self.table.lock().expect("table state poisoned");
        let is_new = table
            .settings
            .as_ref()
            .map(|current| current.game_uuid != settings.game_uuid)
            .unwrap_or(true);
        if is_new {
            let players = table.seats.len().max(1);
            table
                .scorecard
                .reset(settings.rounds, players, settings.bonus2);
            self.new_game.store(true, Ordering::SeqCst);
            self.emit(GameEvent::NewGame {
                game_uuid: settings.game_uuid,
                round: settings.round,
            });
        }
        table.current_round = settings.round;
        table.settings = Some(settings);
    }

    fn on_seating(&self, seating: &SeatingPayload, starts_hand: bool, ctx: &mut DispatchContext) -> Result<(), ProtocolError> {
        let seats = seating.seats()?;
        let mut table = self.table.lock().expect("table state poisoned");
        let highest = seats.last().map(|(number, _)| *number).unwrap_or(0);
        table.seats = vec![None; highest];
        for (number, player) in seats {
            table.seats[number - 1] = Some(player);
        }
        let count = table.seats.iter().flatten().count();
        if let Some(settings) = &table.settings {
            let (rounds, bonus2) = (settings.rounds, settings.bonus2);
            let players = table.seats.len();
            table.scorecard.reset(rounds, players, bonus2);
        }
        drop(table);
        self.emit(GameEvent::PlayersSeated { count });
        if starts_hand {
            ctx.synthesize(QueueEntry::synthesized("playHand"));
        }
        Ok(())
    }

    fn on_cut(&self, cut: &CutPayload) {
        if let Some(dealer) = cut.dealer() {
            let mut table = self.table.lock().expect("table state poisoned");
            table.dealer = Some(dealer);
            drop(table);
            self.emit(GameEvent::DealerChanged { dealer });
        }
    }

    fn on_deal(&self, deal: &super::messages::DealPayload) -> Result<(), ProtocolError> {
        let (settings, dealer) = {
            let table = self.table.lock().expect("table state poisoned");
            let Some(settings) = table.settings.clone() else {
                return Err(ProtocolError::MalformedPayload {
                    descriptor: "deal".to_string(),
                    detail: "deal received before settings".to_string(),
                });
            };
            (settings, table.dealer.unwrap_or(deal.deal.len()))
        };
        let state = HandState::from_deal(&settings, dealer, deal).map_err(|err| {
            ProtocolError::MalformedPayload {
                descriptor: "deal".to_string(),
                detail: err.to_string(),
            }
        })?;
        {
            let mut table = self.table.lock().expect("table state poisoned");
            table.current_round = deal.round;
        }
        self.persist_hand(&state);
        *self.hand.write().expect("hand state poisoned") = Some(state);
        Ok(())
    }

    fn on_played(
        &self,
        played: &super::messages::PlayedPayload,
        ctx: &mut DispatchContext,
    ) -> Result<(), ProtocolError> {
        let trump = {
            let table = self.table.lock().expect("table state poisoned");
            table
                .settings
                .as_ref()
                .and_then(|settings| settings.trump_for_round(played.round))
        };
        let mut guard = self.hand.write().expect("hand state poisoned");
        let Some(hand) = guard.as_mut() else {
            debug!(target: LOG_TARGET, "played message with no hand in progress; dropping");
            return Ok(());
        };
        match hand.apply_played(played, trump) {
            Ok(outcome) => {
                self.persist_hand(hand);
                if let TrickOutcome::RoundComplete { .. } = outcome {
                    ctx.synthesize(QueueEntry::synthesized("roundSummary"));
                }
                Ok(())
            }
            Err(err) => {
                // An invalid play off the wire is dropped, not fatal.
                debug!(target: LOG_TARGET, error = %err, "dropping invalid played message");
                Ok(())
            }
        }
    }

    fn on_scores(&self, scores: &ScoresPayload, ctx: &mut DispatchContext) {
        let mut table = self.table.lock().expect("table state poisoned");
        for entry in &scores.scores {
            table.scorecard.enter(
                scores.round,
                entry.player,
                RoundScore {
                    bid: entry.bid,
                    made: Some(entry.made),
                    twos: Some(entry.twos),
                },
            );
        }
        let final_round = table
            .settings
            .as_ref()
            .map(|settings| settings.rounds)
            .unwrap_or(0);
        let game_over = scores.round >= final_round && table.scorecard.game_complete();
        drop(table);
        {
            // Bids ride on score entries; fold them into the live hand so a
            // recovered or resynced snapshot carries them too.
            let mut guard = self.hand.write().expect("hand state poisoned");
            if let Some(hand) = guard.as_mut().filter(|hand| hand.round == scores.round) {
                for entry in &scores.scores {
                    if let Some(bid) = entry.bid {
                        if let Err(err) = hand.record_bid(entry.player, bid) {
                            debug!(target: LOG_TARGET, error = %err, "bid not recorded");
                        }
                    }
                }
                self.persist_hand(hand);
            }
        }
        if game_over {
            ctx.synthesize(QueueEntry::synthesized("gameSummary"));
        }
    }

    fn on_all_scores(&self, all: &AllScoresPayload, ctx: &mut DispatchContext) {
        for round in &all.rounds {
            self.on_scores(round, ctx);
        }
    }

    fn on_thumbnail(&self, thumbnail: &ThumbnailPayload) -> Result<(), ProtocolError> {
        let image = thumbnail.decode_image()?;
        self.emit(GameEvent::ThumbnailReceived {
            player_uuid: thumbnail.player_uuid,
            email: thumbnail.email.clone(),
            image,
            date: thumbnail.date,
        });
        Ok(())
    }

    fn on_hand_state(&self, payload: &super::messages::HandStatePayload) -> Result<(), ProtocolError> {
        let state = HandState::from_resync(payload).map_err(|err| {
            ProtocolError::MalformedPayload {
                descriptor: "handState".to_string(),
                detail: err.to_string(),
            }
        })?;
        let round = state.round;
        {
            let mut table = self.table.lock().expect("table state poisoned");
            table.current_round = round;
            table.dealer = Some(state.dealer);
        }
        self.persist_hand(&state);
        *self.hand.write().expect("hand state poisoned") = Some(state);
        self.emit(GameEvent::StateResynced { round });
        Ok(())
    }
}

impl MessageDispatcher for GameStateDispatcher {
    fn dispatch(&self, entry: QueueEntry, ctx: &mut DispatchContext) -> Result<(), ProtocolError> {
        let message = GameMessage::decode(&entry.descriptor, &entry.payload)?;
        match &message {
            GameMessage::Settings(settings) => self.on_settings(settings.clone()),
            GameMessage::Dealer { dealer } => {
                let mut table = self.table.lock().expect("table state poisoned");
                table.dealer = Some(*dealer);
                drop(table);
                self.emit(GameEvent::DealerChanged { dealer: *dealer });
            }
            GameMessage::Players(seating) => self.on_seating(seating, false, ctx)?,
            GameMessage::Play(seating) => self.on_seating(seating, true, ctx)?,
            GameMessage::Cut(cut) => self.on_cut(cut),
            GameMessage::Scores(scores) => self.on_scores(scores, ctx),
            GameMessage::AllScores(all) => self.on_all_scores(all, ctx),
            GameMessage::Thumbnail(thumbnail) => self.on_thumbnail(thumbnail)?,
            GameMessage::Deal(deal) => self.on_deal(deal)?,
            GameMessage::Played(played) => self.on_played(played, ctx)?,
            GameMessage::HandState(payload) => self.on_hand_state(payload)?,
            GameMessage::PlayHand => {
                self.emit(GameEvent::PlayHand);
                ctx.set_busy();
            }
            GameMessage::RoundSummary => {
                let round = self.current_round();
                if let Err(err) = self.recovery.remove(RECOVERY_KEY_HAND) {
                    debug!(target: LOG_TARGET, error = %err, "recovery entry not cleared");
                }
                self.emit(GameEvent::RoundSummary { round });
                ctx.set_busy();
            }
            GameMessage::GameSummary => {
                self.emit(GameEvent::GameSummary);
                ctx.set_busy();
            }
        }
        Ok(())
    }
}

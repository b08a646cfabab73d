//! Per-round hand state and its recovery persistence.
//!
//! The snapshot is reset at the start of every round, mutated message by
//! message, and written to the recovery store after every meaningful
//! transition so a killed process can resume mid-hand.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use super::messages::{DealPayload, HandStatePayload, PlayedPayload};
use super::{Card, GameError, GameSettings, PlayerNumber, Suit};

/// Key the dispatcher persists the live hand under.
pub const RECOVERY_KEY_HAND: &str = "handState";

/// Opaque local key-value persistence; the mechanics behind it (files, a
/// database, user defaults) are somebody else's problem.
pub trait RecoveryStore: Send + Sync {
    fn set(&self, key: &str, value: &str) -> anyhow::Result<()>;
    fn get(&self, key: &str) -> anyhow::Result<Option<String>>;
    fn remove(&self, key: &str) -> anyhow::Result<()>;
}

#[derive(Default)]
pub struct InMemoryRecoveryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl RecoveryStore for InMemoryRecoveryStore {
    fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.entries
            .lock()
            .expect("recovery store poisoned")
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self
            .entries
            .lock()
            .expect("recovery store poisoned")
            .get(key)
            .cloned())
    }

    fn remove(&self, key: &str) -> anyhow::Result<()> {
        self.entries
            .lock()
            .expect("recovery store poisoned")
            .remove(key);
        Ok(())
    }
}

/// What applying one `played` message did to the trick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrickOutcome {
    TrickContinues,
    TrickComplete { winner: PlayerNumber },
    RoundComplete { winner: PlayerNumber },
}

/// Snapshot of the hand in progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandState {
    pub round: u32,
    pub dealer: PlayerNumber,
    pub trick: u32,
    /// Remaining cards per player, seat order.
    pub hands: Vec<Vec<Card>>,
    pub trick_cards: Vec<Card>,
    pub last_trick: Vec<Card>,
    pub made: Vec<u32>,
    pub twos: Vec<u32>,
    pub bids: Vec<Option<u32>>,
    pub to_lead: PlayerNumber,
    pub to_play: PlayerNumber,
    pub winner: Option<PlayerNumber>,
    pub finished: bool,
}

impl HandState {
    /// Starts a fresh round from a deal. The player left of the dealer leads
    /// the first trick.
    pub fn from_deal(
        settings: &GameSettings,
        dealer: PlayerNumber,
        deal: &DealPayload,
    ) -> Result<HandState, GameError> {
        let players = deal.deal.len();
        if players == 0 {
            return Err(GameError::NoPlayers);
        }
        if dealer == 0 || dealer > players {
            return Err(GameError::PlayerOutOfRange(dealer));
        }
        let expected = settings.cards_for_round(deal.round) as usize;
        for hand in &deal.deal {
            if hand.len() != expected {
                return Err(GameError::WrongDealSize {
                    got: hand.len(),
                    want: expected,
                });
            }
        }
        let to_lead = next_seat(dealer, players);
        Ok(HandState {
            round: deal.round,
            dealer,
            trick: 1,
            hands: deal.deal.clone(),
            trick_cards: Vec::new(),
            last_trick: Vec::new(),
            made: vec![0; players],
            twos: vec![0; players],
            bids: vec![None; players],
            to_lead,
            to_play: to_lead,
            winner: None,
            finished: false,
        })
    }

    /// Rebuilds the snapshot from a resync message. Seat pointers are
    /// 1-based; a payload that cannot index its own player list is rejected.
    pub fn from_resync(payload: &HandStatePayload) -> Result<HandState, GameError> {
        let players = payload.cards.len();
        if players == 0 {
            return Err(GameError::NoPlayers);
        }
        if payload.to_lead == 0 || payload.to_lead > players {
            return Err(GameError::PlayerOutOfRange(payload.to_lead));
        }
        if payload.dealer == 0 || payload.dealer > players {
            return Err(GameError::PlayerOutOfRange(payload.dealer));
        }
        Ok(HandState {
            round: payload.round,
            dealer: payload.dealer,
            trick: payload.trick,
            hands: payload.cards.clone(),
            trick_cards: payload.trick_cards.clone(),
            last_trick: payload.last_trick.clone(),
            made: payload.made.clone(),
            twos: payload.twos.clone(),
            bids: vec![None; players],
            to_lead: payload.to_lead,
            to_play: seat_after_plays(payload.to_lead, payload.trick_cards.len(), players),
            winner: None,
            finished: false,
        })
    }

    pub fn to_resync(&self) -> HandStatePayload {
        HandStatePayload {
            round: self.round,
            dealer: self.dealer,
            trick: self.trick,
            cards: self.hands.clone(),
            trick_cards: self.trick_cards.clone(),
            last_trick: self.last_trick.clone(),
            made: self.made.clone(),
            twos: self.twos.clone(),
            to_lead: self.to_lead,
        }
    }

    pub fn players(&self) -> usize {
        self.hands.len()
    }

    pub fn record_bid(&mut self, player: PlayerNumber, bid: u32) -> Result<(), GameError> {
        let slot = self
            .bids
            .get_mut(player.wrapping_sub(1))
            .ok_or(GameError::PlayerOutOfRange(player))?;
        *slot = Some(bid);
        Ok(())
    }

    /// Applies one card played, advancing trick and round bookkeeping.
    ///
    /// The twos tally counts every two in a completed trick against its
    /// winner; it only scores when the game's bonus is enabled, but the
    /// count is tracked regardless so resyncs agree.
    pub fn apply_played(
        &mut self,
        played: &PlayedPayload,
        trump: Option<Suit>,
    ) -> Result<TrickOutcome, GameError> {
        if self.finished {
            return Err(GameError::NoHand);
        }
        if played.round != self.round {
            return Err(GameError::WrongRound {
                got: played.round,
                want: self.round,
            });
        }
        if played.player != self.to_play {
            return Err(GameError::NotPlayersTurn {
                player: played.player,
                expected: self.to_play,
            });
        }
        let players = self.players();
        let hand = self
            .hands
            .get_mut(played.player - 1)
            .ok_or(GameError::PlayerOutOfRange(played.player))?;
        let position = hand
            .iter()
            .position(|&card| card == played.card)
            .ok_or(GameError::CardNotHeld {
                player: played.player,
                card: played.card,
            })?;
        hand.remove(position);
        self.trick_cards.push(played.card);

        if self.trick_cards.len() < players {
            self.to_play = next_seat(self.to_play, players);
            return Ok(TrickOutcome::TrickContinues);
        }

        let winner_offset = winning_offset(&self.trick_cards, trump);
        let winner = seat_after_plays(self.to_lead, winner_offset, players);
        self.made[winner - 1] += 1;
        let twos = self.trick_cards.iter().filter(|card| card.is_two()).count() as u32;
        self.twos[winner - 1] += twos;

        self.last_trick = std::mem::take(&mut self.trick_cards);
        self.to_lead = winner;
        self.to_play = winner;

        let tricks_this_round: u32 = self.made.iter().sum();
        let round_done = self.hands.iter().all(|hand| hand.is_empty());
        if round_done {
            self.finished = true;
            self.winner = best_seat(&self.made);
            Ok(TrickOutcome::RoundComplete { winner })
        } else {
            self.trick = tricks_this_round + 1;
            Ok(TrickOutcome::TrickComplete { winner })
        }
    }

    pub fn save(&self, store: &dyn RecoveryStore) -> anyhow::Result<()> {
        let encoded = serde_json::to_string(self)?;
        store.set(RECOVERY_KEY_HAND, &encoded)
    }

    pub fn load(store: &dyn RecoveryStore) -> anyhow::Result<Option<HandState>> {
        match store.get(RECOVERY_KEY_HAND)? {
            Some(encoded) => Ok(Some(serde_json::from_str(&encoded)?)),
            None => Ok(None),
        }
    }
}

fn next_seat(seat: PlayerNumber, players: usize) -> PlayerNumber {
    seat % players + 1
}

fn seat_after_plays(lead: PlayerNumber, plays: usize, players: usize) -> PlayerNumber {
    (lead - 1 + plays) % players + 1
}

/// Index within the trick of the winning card: highest trump if any trump
/// was played, otherwise highest card of the led suit.
fn winning_offset(trick: &[Card], trump: Option<Suit>) -> usize {
    let led = trick[0].suit;
    let ranked = |card: &Card| -> (u8, u8) {
        match trump {
            Some(trump_suit) if card.suit == trump_suit => (2, card.rank),
            _ if card.suit == led => (1, card.rank),
            _ => (0, 0),
        }
    };
    trick
        .iter()
        .enumerate()
        .max_by_key(|(_, card)| ranked(card))
        .map(|(index, _)| index)
        .unwrap_or(0)
}

fn best_seat(made: &[u32]) -> Option<PlayerNumber> {
    made.iter()
        .enumerate()
        .max_by_key(|(_, &count)| count)
        .map(|(index, _)| index + 1)
}

/// Deals `cards_per_player` cards to each of `players` from a shuffled pack.
pub fn deal_cards(players: usize, cards_per_player: u32, round: u32) -> DealPayload {
    use rand::seq::SliceRandom;

    let mut pack: Vec<Card> = (0..52).filter_map(Card::from_index).collect();
    pack.shuffle(&mut rand::thread_rng());
    let deal = (0..players)
        .map(|seat| {
            pack[seat * cards_per_player as usize..(seat + 1) * cards_per_player as usize].to_vec()
        })
        .collect();
    DealPayload { round, deal }
}

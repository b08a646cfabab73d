//! Game-rule types for a contract-whist style trick-taking game: bid each
//! round, win tricks, score made bids and twos bonuses.

pub mod dispatch;
pub mod messages;
pub mod state;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use dispatch::{GameEvent, GameStateDispatcher};
pub use messages::GameMessage;
pub use state::{HandState, InMemoryRecoveryStore, RecoveryStore, TrickOutcome};

/// 1-based seat number around the table.
pub type PlayerNumber = usize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Suit {
    Clubs,
    Diamonds,
    Hearts,
    Spades,
}

impl Suit {
    pub const ALL: [Suit; 4] = [Suit::Clubs, Suit::Diamonds, Suit::Hearts, Suit::Spades];

    pub fn code(self) -> &'static str {
        match self {
            Suit::Clubs => "C",
            Suit::Diamonds => "D",
            Suit::Hearts => "H",
            Suit::Spades => "S",
        }
    }

    pub fn from_code(code: &str) -> Option<Suit> {
        match code {
            "C" => Some(Suit::Clubs),
            "D" => Some(Suit::Diamonds),
            "H" => Some(Suit::Hearts),
            "S" => Some(Suit::Spades),
            _ => None,
        }
    }
}

/// One card, identified on the wire by its index in a 52-card pack:
/// `suit * 13 + (rank - 2)`, ranks 2..=14 with ace high.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Card {
    pub rank: u8,
    pub suit: Suit,
}

impl Card {
    pub fn from_index(index: u8) -> Option<Card> {
        if index >= 52 {
            return None;
        }
        let suit = Suit::ALL[(index / 13) as usize];
        Some(Card {
            rank: index % 13 + 2,
            suit,
        })
    }

    pub fn to_index(self) -> u8 {
        let suit = Suit::ALL
            .iter()
            .position(|&s| s == self.suit)
            .expect("suit is one of four") as u8;
        suit * 13 + (self.rank - 2)
    }

    pub fn is_two(self) -> bool {
        self.rank == 2
    }
}

impl Serialize for Card {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.to_index())
    }
}

impl<'de> Deserialize<'de> for Card {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let index = u8::deserialize(deserializer)?;
        Card::from_index(index)
            .ok_or_else(|| serde::de::Error::custom(format!("card index {index} out of range")))
    }
}

#[derive(Debug, Error)]
pub enum GameError {
    #[error("no hand in progress")]
    NoHand,
    #[error("hand has no players")]
    NoPlayers,
    #[error("player {0} is out of range")]
    PlayerOutOfRange(PlayerNumber),
    #[error("not player {player}'s turn (expected {expected})")]
    NotPlayersTurn {
        player: PlayerNumber,
        expected: PlayerNumber,
    },
    #[error("player {player} does not hold {card:?}")]
    CardNotHeld { player: PlayerNumber, card: Card },
    #[error("played message is for round {got}, hand is on round {want}")]
    WrongRound { got: u32, want: u32 },
    #[error("deal has {got} cards for round expecting {want}")]
    WrongDealSize { got: usize, want: usize },
}

/// Game rules established by the `settings` message and fixed for a game.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameSettings {
    pub rounds: u32,
    /// Cards-per-round envelope `[start, end]`; with `bounce` the count walks
    /// back up after reaching `end`.
    pub cards: Vec<u32>,
    pub bounce: bool,
    pub bonus2: bool,
    pub suits: Vec<Suit>,
    pub game_uuid: Uuid,
    pub round: u32,
}

impl GameSettings {
    /// Number of cards dealt to each player in `round` (1-based).
    pub fn cards_for_round(&self, round: u32) -> u32 {
        let start = self.cards.first().copied().unwrap_or(7);
        let end = self.cards.get(1).copied().unwrap_or(1);
        let span = start.abs_diff(end);
        let index = round.saturating_sub(1);
        let step = |from: u32, offset: u32| -> u32 {
            if start >= end {
                from - offset.min(from)
            } else {
                from + offset
            }
        };
        if index <= span {
            step(start, index)
        } else if self.bounce {
            let back = (index - span).min(span);
            if start >= end {
                end + back
            } else {
                end - back
            }
        } else {
            end
        }
    }

    /// Trump suit for `round`, rotating through the configured suit order.
    pub fn trump_for_round(&self, round: u32) -> Option<Suit> {
        if self.suits.is_empty() {
            return None;
        }
        let index = round.saturating_sub(1) as usize % self.suits.len();
        Some(self.suits[index])
    }
}

/// Per-round bid/made/twos cells for one player.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundScore {
    pub bid: Option<u32>,
    pub made: Option<u32>,
    pub twos: Option<u32>,
}

/// The scorecard for a whole game: one row per round, one column per player.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Scorecard {
    rounds: Vec<Vec<RoundScore>>,
    bonus2: bool,
}

impl Scorecard {
    pub fn reset(&mut self, rounds: u32, players: usize, bonus2: bool) {
        self.rounds = vec![vec![RoundScore::default(); players]; rounds as usize];
        self.bonus2 = bonus2;
    }

    pub fn enter(&mut self, round: u32, player: PlayerNumber, score: RoundScore) {
        let Some(row) = self.rounds.get_mut(round.saturating_sub(1) as usize) else {
            return;
        };
        if player == 0 {
            return;
        }
        if let Some(cell) = row.get_mut(player - 1) {
            *cell = score;
        }
    }

    pub fn cell(&self, round: u32, player: PlayerNumber) -> Option<RoundScore> {
        self.rounds
            .get(round.saturating_sub(1) as usize)
            .and_then(|row| row.get(player.checked_sub(1)?))
            .copied()
    }

    /// Round is complete once every player's made count is recorded.
    pub fn round_complete(&self, round: u32) -> bool {
        self.rounds
            .get(round.saturating_sub(1) as usize)
            .map(|row| !row.is_empty() && row.iter().all(|cell| cell.made.is_some()))
            .unwrap_or(false)
    }

    pub fn game_complete(&self) -> bool {
        !self.rounds.is_empty() && (1..=self.rounds.len() as u32).all(|r| self.round_complete(r))
    }

    /// Total score: tricks made, +10 for landing the bid exactly, +10 per two
    /// when the twos bonus is on.
    pub fn total(&self, player: PlayerNumber) -> i64 {
        let Some(column) = player.checked_sub(1) else {
            return 0;
        };
        self.rounds
            .iter()
            .filter_map(|row| row.get(column))
            .map(|cell| {
                let made = cell.made.unwrap_or(0) as i64;
                let mut score = made;
                if cell.bid == cell.made && cell.bid.is_some() {
                    score += 10;
                }
                if self.bonus2 {
                    score += cell.twos.unwrap_or(0) as i64 * 10;
                }
                score
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(cards: Vec<u32>, bounce: bool) -> GameSettings {
        GameSettings {
            rounds: 13,
            cards,
            bounce,
            bonus2: true,
            suits: vec![Suit::Spades, Suit::Hearts, Suit::Diamonds, Suit::Clubs],
            game_uuid: Uuid::new_v4(),
            round: 1,
        }
    }

    #[test]
    fn card_index_round_trip_covers_the_pack() {
        for index in 0..52u8 {
            let card = Card::from_index(index).unwrap();
            assert_eq!(card.to_index(), index);
        }
        assert!(Card::from_index(52).is_none());
    }

    #[test]
    fn cards_per_round_descend_then_bounce() {
        let plain = settings(vec![7, 1], false);
        let counts: Vec<u32> = (1..=7).map(|r| plain.cards_for_round(r)).collect();
        assert_eq!(counts, vec![7, 6, 5, 4, 3, 2, 1]);

        let bouncing = settings(vec![7, 1], true);
        let counts: Vec<u32> = (1..=13).map(|r| bouncing.cards_for_round(r)).collect();
        assert_eq!(counts, vec![7, 6, 5, 4, 3, 2, 1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn trump_rotates_through_the_suit_order() {
        let s = settings(vec![7, 1], false);
        assert_eq!(s.trump_for_round(1), Some(Suit::Spades));
        assert_eq!(s.trump_for_round(4), Some(Suit::Clubs));
        assert_eq!(s.trump_for_round(5), Some(Suit::Spades));
    }

    #[test]
    fn scorecard_totals_apply_bid_and_twos_bonuses() {
        let mut card = Scorecard::default();
        card.reset(2, 2, true);
        card.enter(
            1,
            1,
            RoundScore {
                bid: Some(3),
                made: Some(3),
                twos: Some(1),
            },
        );
        card.enter(
            2,
            1,
            RoundScore {
                bid: Some(2),
                made: Some(1),
                twos: Some(0),
            },
        );
        // round 1: 3 + 10 (bid made) + 10 (one two) = 23; round 2: 1.
        assert_eq!(card.total(1), 24);
        assert!(!card.round_complete(1)); // player 2 has no made entry yet
    }

    #[test]
    fn game_completes_when_every_round_is_scored() {
        let mut card = Scorecard::default();
        card.reset(1, 2, false);
        card.enter(
            1,
            1,
            RoundScore {
                bid: Some(0),
                made: Some(0),
                twos: None,
            },
        );
        assert!(!card.game_complete());
        card.enter(
            1,
            2,
            RoundScore {
                bid: Some(1),
                made: Some(1),
                twos: None,
            },
        );
        assert!(card.game_complete());
    }
}

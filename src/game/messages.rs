//! The application message set exchanged between queue controllers.
//!
//! One variant per descriptor tag; decoding failures are typed protocol
//! errors, never panics. `playHand`, `roundSummary` and `gameSummary` are
//! never sent on the wire; they are synthesized locally to force follow-up
//! processing ahead of further network entries.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use super::{Card, GameSettings, PlayerNumber};
use crate::session::ProtocolError;

/// Descriptor tags accepted off the wire or synthesized locally.
pub const DESCRIPTORS: &[&str] = &[
    "settings",
    "dealer",
    "players",
    "play",
    "cut",
    "scores",
    "allscores",
    "thumbnail",
    "deal",
    "played",
    "handState",
    "playHand",
    "roundSummary",
    "gameSummary",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "descriptor", content = "payload")]
pub enum GameMessage {
    #[serde(rename = "settings")]
    Settings(GameSettings),
    #[serde(rename = "dealer")]
    Dealer { dealer: PlayerNumber },
    #[serde(rename = "players")]
    Players(SeatingPayload),
    #[serde(rename = "play")]
    Play(SeatingPayload),
    #[serde(rename = "cut")]
    Cut(CutPayload),
    #[serde(rename = "scores")]
    Scores(ScoresPayload),
    #[serde(rename = "allscores")]
    AllScores(AllScoresPayload),
    #[serde(rename = "thumbnail")]
    Thumbnail(ThumbnailPayload),
    #[serde(rename = "deal")]
    Deal(DealPayload),
    #[serde(rename = "played")]
    Played(PlayedPayload),
    #[serde(rename = "handState")]
    HandState(HandStatePayload),
    #[serde(rename = "playHand")]
    PlayHand,
    #[serde(rename = "roundSummary")]
    RoundSummary,
    #[serde(rename = "gameSummary")]
    GameSummary,
}

impl GameMessage {
    pub fn descriptor(&self) -> &'static str {
        match self {
            GameMessage::Settings(_) => "settings",
            GameMessage::Dealer { .. } => "dealer",
            GameMessage::Players(_) => "players",
            GameMessage::Play(_) => "play",
            GameMessage::Cut(_) => "cut",
            GameMessage::Scores(_) => "scores",
            GameMessage::AllScores(_) => "allscores",
            GameMessage::Thumbnail(_) => "thumbnail",
            GameMessage::Deal(_) => "deal",
            GameMessage::Played(_) => "played",
            GameMessage::HandState(_) => "handState",
            GameMessage::PlayHand => "playHand",
            GameMessage::RoundSummary => "roundSummary",
            GameMessage::GameSummary => "gameSummary",
        }
    }

    /// Decodes a queue entry's descriptor + payload pair.
    pub fn decode(descriptor: &str, payload: &Value) -> Result<GameMessage, ProtocolError> {
        if !DESCRIPTORS.contains(&descriptor) {
            return Err(ProtocolError::UnknownDescriptor(descriptor.to_string()));
        }
        let tagged = json!({ "descriptor": descriptor, "payload": payload });
        serde_json::from_value(tagged).map_err(|err| ProtocolError::MalformedPayload {
            descriptor: descriptor.to_string(),
            detail: err.to_string(),
        })
    }

    /// Splits into the (descriptor, payload) pair carried by a data frame.
    pub fn encode(&self) -> (String, Value) {
        let value = serde_json::to_value(self).expect("game message is serializable");
        let payload = value.get("payload").cloned().unwrap_or(Value::Null);
        (self.descriptor().to_string(), payload)
    }
}

/// One seated player as announced by `players` / `play`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeatedPlayer {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player_uuid: Option<Uuid>,
}

/// Seat map keyed by player number rendered as a string ("1", "2", ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeatingPayload {
    pub players: BTreeMap<String, SeatedPlayer>,
}

impl SeatingPayload {
    pub fn seats(&self) -> Result<Vec<(PlayerNumber, SeatedPlayer)>, ProtocolError> {
        let mut seats = Vec::with_capacity(self.players.len());
        for (key, player) in &self.players {
            let number: PlayerNumber =
                key.parse()
                    .map_err(|_| ProtocolError::MalformedPayload {
                        descriptor: "players".to_string(),
                        detail: format!("seat key `{key}` is not a player number"),
                    })?;
            if number == 0 {
                return Err(ProtocolError::MalformedPayload {
                    descriptor: "players".to_string(),
                    detail: "player numbers are 1-based".to_string(),
                });
            }
            seats.push((number, player.clone()));
        }
        seats.sort_by_key(|(number, _)| *number);
        Ok(seats)
    }
}

/// Cut-for-dealer ritual: one card per name, highest card deals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CutPayload {
    pub cards: Vec<Card>,
    pub names: Vec<String>,
}

impl CutPayload {
    /// Seat of the cut winner (1-based). Ties break on the pack index, which
    /// is deterministic across devices.
    pub fn dealer(&self) -> Option<PlayerNumber> {
        self.cards
            .iter()
            .enumerate()
            .max_by_key(|(_, card)| (card.rank, card.to_index()))
            .map(|(index, _)| index + 1)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerScoreEntry {
    pub player: PlayerNumber,
    #[serde(default)]
    pub bid: Option<u32>,
    pub made: u32,
    pub twos: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoresPayload {
    pub round: u32,
    pub scores: Vec<PlayerScoreEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllScoresPayload {
    pub rounds: Vec<ScoresPayload>,
}

/// Async avatar delivery; `image` is base64-encoded bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThumbnailPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player_uuid: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub image: String,
    pub date: DateTime<Utc>,
}

impl ThumbnailPayload {
    pub fn decode_image(&self) -> Result<Vec<u8>, ProtocolError> {
        base64::decode(&self.image).map_err(|err| ProtocolError::MalformedPayload {
            descriptor: "thumbnail".to_string(),
            detail: format!("image is not valid base64: {err}"),
        })
    }
}

/// Per-player hands for one round; a partition of the 52-card pack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DealPayload {
    pub round: u32,
    pub deal: Vec<Vec<Card>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayedPayload {
    pub card: Card,
    pub player: PlayerNumber,
    pub trick: u32,
    pub round: u32,
}

/// Full resync snapshot sent after a reconnect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandStatePayload {
    pub round: u32,
    pub dealer: PlayerNumber,
    pub trick: u32,
    pub cards: Vec<Vec<Card>>,
    pub trick_cards: Vec<Card>,
    pub last_trick: Vec<Card>,
    pub made: Vec<u32>,
    pub twos: Vec<u32>,
    pub to_lead: PlayerNumber,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::Suit;

    #[test]
    fn settings_round_trips_with_camel_case_fields() {
        let payload = json!({
            "rounds": 7,
            "cards": [7, 1],
            "bounce": false,
            "bonus2": true,
            "suits": ["spades", "hearts", "diamonds", "clubs"],
            "gameUuid": "3fa3d23e-58a7-43a4-8f17-9e395fd56a4c",
            "round": 1
        });
        let message = GameMessage::decode("settings", &payload).unwrap();
        let GameMessage::Settings(settings) = &message else {
            panic!("expected settings");
        };
        assert_eq!(settings.rounds, 7);
        assert_eq!(settings.suits[0], Suit::Spades);

        let (descriptor, encoded) = message.encode();
        assert_eq!(descriptor, "settings");
        assert_eq!(encoded.get("gameUuid"), payload.get("gameUuid"));
    }

    #[test]
    fn unknown_descriptor_is_typed() {
        let err = GameMessage::decode("telemetry", &Value::Null).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownDescriptor(_)));
    }

    #[test]
    fn malformed_payload_is_typed() {
        let err = GameMessage::decode("dealer", &json!({ "dealer": "three" })).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedPayload { .. }));
    }

    #[test]
    fn synthesized_descriptors_decode_with_null_payload() {
        for descriptor in ["playHand", "roundSummary", "gameSummary"] {
            let message = GameMessage::decode(descriptor, &Value::Null).unwrap();
            assert_eq!(message.descriptor(), descriptor);
        }
    }

    #[test]
    fn seat_keys_parse_and_sort() {
        let payload = SeatingPayload {
            players: [
                (
                    "2".to_string(),
                    SeatedPlayer {
                        name: "Jo".into(),
                        email: None,
                        player_uuid: None,
                    },
                ),
                (
                    "1".to_string(),
                    SeatedPlayer {
                        name: "Marc".into(),
                        email: Some("marc@example.com".into()),
                        player_uuid: Some(Uuid::new_v4()),
                    },
                ),
            ]
            .into_iter()
            .collect(),
        };
        let seats = payload.seats().unwrap();
        assert_eq!(seats[0].0, 1);
        assert_eq!(seats[0].1.name, "Marc");
        assert_eq!(seats[1].0, 2);
    }

    #[test]
    fn bad_seat_key_is_a_protocol_error() {
        let payload = SeatingPayload {
            players: [(
                "north".to_string(),
                SeatedPlayer {
                    name: "Jo".into(),
                    email: None,
                    player_uuid: None,
                },
            )]
            .into_iter()
            .collect(),
        };
        assert!(payload.seats().is_err());
    }

    #[test]
    fn cut_picks_highest_card_for_dealer() {
        let cut = CutPayload {
            cards: vec![
                Card::from_index(5).unwrap(),  // 7C
                Card::from_index(51).unwrap(), // AS
                Card::from_index(20).unwrap(), // 9D
            ],
            names: vec!["Marc".into(), "Jo".into(), "Sam".into()],
        };
        assert_eq!(cut.dealer(), Some(2));
    }

    #[test]
    fn thumbnail_image_decodes_base64() {
        let payload = ThumbnailPayload {
            player_uuid: None,
            email: Some("marc@example.com".into()),
            image: base64::encode(b"png-bytes"),
            date: Utc::now(),
        };
        assert_eq!(payload.decode_image().unwrap(), b"png-bytes");

        let bad = ThumbnailPayload {
            image: "!!!".into(),
            ..payload
        };
        assert!(bad.decode_image().is_err());
    }

    #[test]
    fn played_cards_ride_as_pack_indices() {
        let message = GameMessage::Played(PlayedPayload {
            card: Card::from_index(12).unwrap(),
            player: 3,
            trick: 2,
            round: 1,
        });
        let (_, payload) = message.encode();
        assert_eq!(payload.get("card"), Some(&json!(12)));
        let decoded = GameMessage::decode("played", &payload).unwrap();
        assert_eq!(message, decoded);
    }
}

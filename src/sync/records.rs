//! Durable record types moved between the local store and the remote store,
//! and the field-by-field merge rules that reconcile them.
//!
//! Counters are additive across devices: each device tracks the baseline it
//! last confirmed remotely, and a merge applies only the local delta above
//! that baseline. Non-additive fields follow the newer `sync_date`. Best-of
//! fields take the pairwise maximum.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifetime play counters. Additive: merged as
/// `remote + (local - baseline)` per field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerCounters {
    pub games_played: u64,
    pub games_won: u64,
    pub hands_played: u64,
    pub hands_made: u64,
    pub twos_made: u64,
}

impl PlayerCounters {
    /// Per-field additive merge. `baseline` is the local view of the remote
    /// counters at the last confirmed write; only growth past it is applied.
    ///
    /// If another device writes between our read and our write, its delta is
    /// already in `remote` and ours is not, so the sum stays correct; the
    /// caller must update the baseline only after the write is confirmed.
    pub fn merge(local: &Self, baseline: &Self, remote: &Self) -> Self {
        let add = |remote: u64, local: u64, base: u64| remote + local.saturating_sub(base);
        Self {
            games_played: add(remote.games_played, local.games_played, baseline.games_played),
            games_won: add(remote.games_won, local.games_won, baseline.games_won),
            hands_played: add(remote.hands_played, local.hands_played, baseline.hands_played),
            hands_made: add(remote.hands_made, local.hands_made, baseline.hands_made),
            twos_made: add(remote.twos_made, local.twos_made, baseline.twos_made),
        }
    }
}

/// A record-setting result: the value, the ordinal of the split (game or
/// round) it was set in, and when. Merged as the pairwise maximum with
/// (value, split, date) as the tie-break order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BestOf {
    pub value: i64,
    pub split: u32,
    pub date: Option<DateTime<Utc>>,
}

impl BestOf {
    pub fn max_merge(a: Self, b: Self) -> Self {
        if (b.value, b.split, b.date) > (a.value, a.split, a.date) {
            b
        } else {
            a
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerBests {
    pub high_score: BestOf,
    pub most_made: BestOf,
    pub most_twos: BestOf,
    pub win_streak: BestOf,
}

impl PlayerBests {
    pub fn max_merge(a: &Self, b: &Self) -> Self {
        Self {
            high_score: BestOf::max_merge(a.high_score, b.high_score),
            most_made: BestOf::max_merge(a.most_made, b.most_made),
            most_twos: BestOf::max_merge(a.most_twos, b.most_twos),
            win_streak: BestOf::max_merge(a.win_streak, b.win_streak),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thumbnail {
    /// Base64-encoded image bytes.
    pub image: String,
    pub date: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerRecord {
    pub player_uuid: Uuid,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Created offline under a provisional UUID, pending reconciliation
    /// against the authoritative record keyed by email.
    #[serde(default)]
    pub temporary: bool,
    pub sync_date: DateTime<Utc>,
    pub counters: PlayerCounters,
    /// Remote counters at the last confirmed write from this device.
    #[serde(default)]
    pub baseline: PlayerCounters,
    pub bests: PlayerBests,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<Thumbnail>,
    /// Remote write-conflict detection token.
    #[serde(default)]
    pub record_version: u64,
}

impl PlayerRecord {
    /// Reconciles the local record against the remote one.
    ///
    /// Non-additive fields (name, email) follow the newer `sync_date`;
    /// counters merge additively over the local baseline; bests take the
    /// pairwise max; the thumbnail with the newer date survives. The result
    /// carries the remote record version and the later of the two sync dates.
    pub fn merge(&self, remote: &Self) -> Self {
        let local_newer = self.sync_date > remote.sync_date;
        let (name, email) = if local_newer {
            (self.name.clone(), self.email.clone())
        } else {
            (remote.name.clone(), remote.email.clone())
        };
        let thumbnail = match (&self.thumbnail, &remote.thumbnail) {
            (Some(ours), Some(theirs)) => {
                if ours.date > theirs.date {
                    Some(ours.clone())
                } else {
                    Some(theirs.clone())
                }
            }
            (Some(ours), None) => Some(ours.clone()),
            (None, theirs) => theirs.clone(),
        };
        Self {
            player_uuid: remote.player_uuid,
            name,
            email,
            temporary: false,
            sync_date: self.sync_date.max(remote.sync_date),
            counters: PlayerCounters::merge(&self.counters, &self.baseline, &remote.counters),
            baseline: self.baseline,
            bests: PlayerBests::max_merge(&self.bests, &remote.bests),
            thumbnail,
            record_version: remote.record_version,
        }
    }

    /// True when a merge would change nothing on either side.
    pub fn same_content(&self, other: &Self) -> bool {
        self.name == other.name
            && self.email == other.email
            && self.counters == other.counters
            && self.bests == other.bests
            && self.thumbnail == other.thumbnail
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameRecord {
    pub game_uuid: Uuid,
    pub started: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended: Option<DateTime<Utc>>,
    pub rounds: u32,
    pub player_uuids: Vec<Uuid>,
    /// Set once the remote store has acknowledged this record.
    #[serde(default)]
    pub confirmed: bool,
    pub sync_date: DateTime<Utc>,
    #[serde(default)]
    pub record_version: u64,
}

/// One player's totals within one game.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantRecord {
    pub participant_uuid: Uuid,
    pub game_uuid: Uuid,
    pub player_uuid: Uuid,
    pub score: i64,
    pub made: u32,
    pub twos: u32,
    pub bids_landed: u32,
    /// Finishing position, 1 = winner.
    pub position: u32,
    #[serde(default)]
    pub confirmed: bool,
    pub sync_date: DateTime<Utc>,
    #[serde(default)]
    pub record_version: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwardRecord {
    pub player_uuid: Uuid,
    pub kind: String,
    pub count: u64,
    /// Remote count at the last confirmed write from this device.
    #[serde(default)]
    pub baseline: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<DateTime<Utc>>,
    pub sync_date: DateTime<Utc>,
}

impl AwardRecord {
    /// Additive count over the local baseline, latest date.
    pub fn merge(&self, remote: &Self) -> Self {
        Self {
            player_uuid: remote.player_uuid,
            kind: remote.kind.clone(),
            count: remote.count + self.count.saturating_sub(self.baseline),
            baseline: self.baseline,
            date: self.date.max(remote.date),
            sync_date: self.sync_date.max(remote.sync_date),
        }
    }
}

/// Email-to-player link uploaded alongside unconfirmed records so other
/// devices can resolve provisional UUIDs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkRecord {
    pub email: String,
    pub player_uuid: Uuid,
    pub date: DateTime<Utc>,
}

/// Remote schema/version descriptor fetched at the start of every run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionDescriptor {
    /// Minimum client version allowed to read at all.
    pub access_floor: u32,
    /// Minimum client version allowed to write/sync.
    pub sync_floor: u32,
    pub database_tag: String,
}

/// What this client presents against the remote descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    pub client_version: u32,
    pub database_tag: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn counters(games: u64, won: u64) -> PlayerCounters {
        PlayerCounters {
            games_played: games,
            games_won: won,
            hands_played: games * 7,
            hands_made: games * 4,
            twos_made: won,
        }
    }

    fn player(sync_date: DateTime<Utc>) -> PlayerRecord {
        PlayerRecord {
            player_uuid: Uuid::new_v4(),
            name: "Marc".into(),
            email: Some("marc@example.com".into()),
            temporary: false,
            sync_date,
            counters: PlayerCounters::default(),
            baseline: PlayerCounters::default(),
            bests: PlayerBests::default(),
            thumbnail: None,
            record_version: 1,
        }
    }

    #[test]
    fn counters_merge_applies_only_the_delta_above_baseline() {
        // Device played 2 games since it last confirmed 10; another device
        // pushed the remote to 13 meanwhile. Both deltas must survive.
        let local = counters(12, 5);
        let baseline = counters(10, 4);
        let remote = counters(13, 6);
        let merged = PlayerCounters::merge(&local, &baseline, &remote);
        assert_eq!(merged.games_played, 15);
        assert_eq!(merged.games_won, 7);
    }

    #[test]
    fn counters_merge_is_idempotent_once_baseline_catches_up() {
        let local = counters(12, 5);
        let baseline = counters(10, 4);
        let remote = counters(13, 6);
        let merged = PlayerCounters::merge(&local, &baseline, &remote);
        // After a confirmed write: local == remote == merged, baseline == merged.
        let again = PlayerCounters::merge(&merged, &merged, &merged);
        assert_eq!(again, merged);
    }

    #[test]
    fn best_of_prefers_value_then_split_then_date() {
        let earlier = Some(Utc::now() - TimeDelta::hours(2));
        let later = Some(Utc::now());
        let a = BestOf { value: 80, split: 3, date: later };
        let b = BestOf { value: 80, split: 5, date: earlier };
        assert_eq!(BestOf::max_merge(a, b), b);

        let c = BestOf { value: 81, split: 1, date: earlier };
        assert_eq!(BestOf::max_merge(a, c), c);

        let d = BestOf { value: 80, split: 3, date: earlier };
        assert_eq!(BestOf::max_merge(a, d), a);
    }

    #[test]
    fn older_remote_sync_date_keeps_local_identity_fields() {
        let now = Utc::now();
        let mut local = player(now);
        local.name = "Marc (new)".into();
        local.counters = counters(3, 1);
        let mut remote = player(now - TimeDelta::days(1));
        remote.player_uuid = local.player_uuid;
        remote.name = "Marc".into();
        remote.counters = counters(5, 2);
        remote.record_version = 7;

        let merged = local.merge(&remote);
        // Local is newer: non-additive fields stay local, counters still add.
        assert_eq!(merged.name, "Marc (new)");
        assert_eq!(merged.counters.games_played, 8);
        assert_eq!(merged.sync_date, now);
        assert_eq!(merged.record_version, 7);
    }

    #[test]
    fn newer_thumbnail_date_wins() {
        let now = Utc::now();
        let mut local = player(now);
        local.thumbnail = Some(Thumbnail {
            image: "bG9jYWw=".into(),
            date: now,
        });
        let mut remote = player(now);
        remote.player_uuid = local.player_uuid;
        remote.thumbnail = Some(Thumbnail {
            image: "cmVtb3Rl".into(),
            date: now - TimeDelta::hours(1),
        });
        assert_eq!(local.merge(&remote).thumbnail, local.thumbnail);
        assert_eq!(remote.merge(&local).thumbnail, local.thumbnail);
    }

    #[test]
    fn award_merge_is_additive_with_latest_date() {
        let now = Utc::now();
        let local = AwardRecord {
            player_uuid: Uuid::new_v4(),
            kind: "slam".into(),
            count: 4,
            baseline: 2,
            date: Some(now),
            sync_date: now,
        };
        let mut remote = local.clone();
        remote.count = 3;
        remote.date = Some(now - TimeDelta::days(2));
        let merged = local.merge(&remote);
        assert_eq!(merged.count, 5);
        assert_eq!(merged.date, Some(now));
    }
}

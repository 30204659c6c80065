//! Atomic scripts over SlateDB.
//!
//! Every mutating queue operation runs as one serializable transaction. The
//! transaction exposes hash, ordered-set and expiring-string primitives laid
//! out as plain keys:
//!
//! - `h/{hash}/{field}` holds a JSON value
//! - `z/{set}/m/{member}` holds the member's score
//! - `z/{set}/s/{score}/{member}` orders members by score (empty value)
//! - `z/{set}/n` holds the set's cardinality
//! - `s/{name}` holds an expiring string
//!
//! Reads inside a script observe the script's own uncommitted writes.

use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use slatedb::{Db, DbIterator, DbTransaction, ErrorKind as SlateErrorKind, IsolationLevel};
use tracing::debug;

use crate::queue_shard::QueueError;

/// Attempts made for a script before giving up on write conflicts.
pub const MAX_SCRIPT_ATTEMPTS: usize = 5;
/// Pause between conflicting attempts.
pub const SCRIPT_RETRY_BACKOFF_MS: u64 = 100;

/// Score bounds used for unbounded ranges.
pub const MIN_SCORE: i64 = i64::MIN;
pub const MAX_SCORE: i64 = i64::MAX;

/// Encode a score so that lexicographic key order equals numeric order.
pub(crate) fn encode_score(score: i64) -> String {
    format!("{:020}", (score as u64) ^ (1u64 << 63))
}

fn hash_key(hash: &str, field: &str) -> String {
    format!("h/{}/{}", hash, field)
}

fn hash_prefix(hash: &str) -> String {
    format!("h/{}/", hash)
}

fn member_key(set: &str, member: &str) -> String {
    format!("z/{}/m/{}", set, member)
}

fn order_prefix(set: &str) -> String {
    format!("z/{}/s/", set)
}

fn order_key(set: &str, score: i64, member: &str) -> String {
    format!("{}{}/{}", order_prefix(set), encode_score(score), member)
}

fn card_key(set: &str) -> String {
    format!("z/{}/n", set)
}

fn string_key(name: &str) -> String {
    format!("s/{}", name)
}

fn decode_i64(raw: &[u8]) -> i64 {
    let mut buf = [0u8; 8];
    let len = raw.len().min(8);
    buf[..len].copy_from_slice(&raw[..len]);
    i64::from_be_bytes(buf)
}

/// Parse `{score}/{member}` after the ordering prefix.
fn parse_order_suffix(suffix: &str) -> Option<(String, i64)> {
    let (enc, member) = suffix.split_at_checked(20)?;
    let member = member.strip_prefix('/')?;
    let raw: u64 = enc.parse().ok()?;
    Some((member.to_string(), (raw ^ (1u64 << 63)) as i64))
}

/// Value stored for an expiring string.
#[derive(Debug, Serialize, Deserialize)]
struct ExpiringValue {
    value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at_ms: Option<i64>,
}

/// Score window for range reads. Both ends are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoreRange {
    pub min: i64,
    pub max: i64,
}

impl ScoreRange {
    pub fn all() -> Self {
        Self {
            min: MIN_SCORE,
            max: MAX_SCORE,
        }
    }

    pub fn up_to(max: i64) -> Self {
        Self {
            min: MIN_SCORE,
            max,
        }
    }

    pub fn between(min: i64, max: i64) -> Self {
        Self { min, max }
    }
}

/// One store transaction.
pub(crate) struct Script {
    txn: DbTransaction,
}

impl Script {
    /// Start a read-write script with conflict detection.
    pub(crate) async fn begin(db: &Db) -> Result<Self, QueueError> {
        let txn = db.begin(IsolationLevel::SerializableSnapshot).await?;
        Ok(Self { txn })
    }

    /// Start a read-only view. Never committed.
    pub(crate) async fn snapshot(db: &Db) -> Result<Self, QueueError> {
        let txn = db.begin(IsolationLevel::Snapshot).await?;
        Ok(Self { txn })
    }

    pub(crate) async fn commit(self) -> Result<(), QueueError> {
        self.txn.commit().await?;
        Ok(())
    }

    async fn get_raw(&self, key: &str) -> Result<Option<Bytes>, QueueError> {
        Ok(self.txn.get(key.as_bytes()).await?)
    }

    async fn scan_prefix_raw(
        &self,
        start: Vec<u8>,
        end: Vec<u8>,
    ) -> Result<DbIterator, QueueError> {
        Ok(self.txn.scan::<Vec<u8>, _>(start..=end).await?)
    }

    // hashes

    pub(crate) async fn hget<T: DeserializeOwned>(
        &self,
        hash: &str,
        field: &str,
    ) -> Result<Option<T>, QueueError> {
        match self.get_raw(&hash_key(hash, field)).await? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// Raw JSON of a hash field, for callers that decode off the critical path.
    pub(crate) async fn hget_raw(&self, hash: &str, field: &str) -> Result<Option<Bytes>, QueueError> {
        self.get_raw(&hash_key(hash, field)).await
    }

    pub(crate) async fn hexists(&self, hash: &str, field: &str) -> Result<bool, QueueError> {
        Ok(self.get_raw(&hash_key(hash, field)).await?.is_some())
    }

    pub(crate) fn hset<T: Serialize>(
        &self,
        hash: &str,
        field: &str,
        value: &T,
    ) -> Result<(), QueueError> {
        let encoded = serde_json::to_vec(value)?;
        self.txn.put(hash_key(hash, field).as_bytes(), &encoded)?;
        Ok(())
    }

    pub(crate) fn hdel(&self, hash: &str, field: &str) -> Result<(), QueueError> {
        self.txn.delete(hash_key(hash, field).as_bytes())?;
        Ok(())
    }

    /// Every field of a hash with its raw value.
    pub(crate) async fn hgetall_raw(&self, hash: &str) -> Result<Vec<(String, Bytes)>, QueueError> {
        let prefix = hash_prefix(hash);
        let start = prefix.as_bytes().to_vec();
        let mut end = start.clone();
        end.push(0xFF);
        let mut iter = self.scan_prefix_raw(start, end).await?;
        let mut out = Vec::new();
        while let Some(kv) = iter.next().await? {
            let key = String::from_utf8_lossy(&kv.key);
            if let Some(field) = key.strip_prefix(prefix.as_str()) {
                out.push((field.to_string(), kv.value));
            }
        }
        Ok(out)
    }

    // ordered sets

    pub(crate) async fn zscore(&self, set: &str, member: &str) -> Result<Option<i64>, QueueError> {
        Ok(self
            .get_raw(&member_key(set, member))
            .await?
            .map(|raw| decode_i64(&raw)))
    }

    pub(crate) async fn zcard(&self, set: &str) -> Result<i64, QueueError> {
        Ok(self
            .get_raw(&card_key(set))
            .await?
            .map(|raw| decode_i64(&raw))
            .unwrap_or(0))
    }

    fn set_card(&self, set: &str, card: i64) -> Result<(), QueueError> {
        if card <= 0 {
            self.txn.delete(card_key(set).as_bytes())?;
        } else {
            self.txn.put(card_key(set).as_bytes(), card.to_be_bytes())?;
        }
        Ok(())
    }

    /// Insert or re-score a member. Returns true when the member is new.
    pub(crate) async fn zadd(&self, set: &str, member: &str, score: i64) -> Result<bool, QueueError> {
        let existing = self.zscore(set, member).await?;
        if let Some(old) = existing {
            if old == score {
                return Ok(false);
            }
            self.txn.delete(order_key(set, old, member).as_bytes())?;
        }
        self.txn
            .put(member_key(set, member).as_bytes(), score.to_be_bytes())?;
        self.txn.put(order_key(set, score, member).as_bytes(), b"")?;
        if existing.is_none() {
            let card = self.zcard(set).await?;
            self.set_card(set, card + 1)?;
        }
        Ok(existing.is_none())
    }

    /// Add a member only if it is absent or its current score is higher.
    pub(crate) async fn zadd_lower(
        &self,
        set: &str,
        member: &str,
        score: i64,
    ) -> Result<(), QueueError> {
        match self.zscore(set, member).await? {
            Some(current) if current <= score => Ok(()),
            _ => self.zadd(set, member, score).await.map(|_| ()),
        }
    }

    /// Remove a member. Returns true when it was present.
    pub(crate) async fn zrem(&self, set: &str, member: &str) -> Result<bool, QueueError> {
        let Some(old) = self.zscore(set, member).await? else {
            return Ok(false);
        };
        self.txn.delete(member_key(set, member).as_bytes())?;
        self.txn.delete(order_key(set, old, member).as_bytes())?;
        let card = self.zcard(set).await?;
        self.set_card(set, card - 1)?;
        Ok(true)
    }

    /// Members with scores inside `range`, lowest first, skipping `offset`.
    pub(crate) async fn zrange_by_score(
        &self,
        set: &str,
        range: ScoreRange,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<(String, i64)>, QueueError> {
        if limit == 0 || range.min > range.max {
            return Ok(Vec::new());
        }
        let prefix = order_prefix(set);
        let start = format!("{}{}/", prefix, encode_score(range.min)).into_bytes();
        let mut end = format!("{}{}/", prefix, encode_score(range.max)).into_bytes();
        end.push(0xFF);

        let mut iter = self.scan_prefix_raw(start, end).await?;
        let mut out = Vec::new();
        let mut skipped = 0usize;
        while let Some(kv) = iter.next().await? {
            let key = String::from_utf8_lossy(&kv.key);
            let Some(entry) = key
                .strip_prefix(prefix.as_str())
                .and_then(parse_order_suffix)
            else {
                continue;
            };
            if skipped < offset {
                skipped += 1;
                continue;
            }
            out.push(entry);
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    /// Number of members with scores inside `range`.
    pub(crate) async fn zcount(&self, set: &str, range: ScoreRange) -> Result<usize, QueueError> {
        if range == ScoreRange::all() {
            return Ok(self.zcard(set).await?.max(0) as usize);
        }
        let prefix = order_prefix(set);
        let start = format!("{}{}/", prefix, encode_score(range.min)).into_bytes();
        let mut end = format!("{}{}/", prefix, encode_score(range.max)).into_bytes();
        end.push(0xFF);
        let mut iter = self.scan_prefix_raw(start, end).await?;
        let mut count = 0usize;
        while iter.next().await?.is_some() {
            count += 1;
        }
        Ok(count)
    }

    /// Lowest-scored member.
    pub(crate) async fn zmin(&self, set: &str) -> Result<Option<(String, i64)>, QueueError> {
        Ok(self
            .zrange_by_score(set, ScoreRange::all(), 0, 1)
            .await?
            .into_iter()
            .next())
    }

    /// Remove every member of a set.
    pub(crate) async fn zclear(&self, set: &str) -> Result<(), QueueError> {
        let members = self
            .zrange_by_score(set, ScoreRange::all(), 0, usize::MAX)
            .await?;
        for (member, score) in members {
            self.txn.delete(member_key(set, &member).as_bytes())?;
            self.txn.delete(order_key(set, score, &member).as_bytes())?;
        }
        self.set_card(set, 0)
    }

    // expiring strings

    /// Value of an unexpired string.
    pub(crate) async fn get_string(&self, name: &str, now_ms: i64) -> Result<Option<String>, QueueError> {
        let Some(raw) = self.get_raw(&string_key(name)).await? else {
            return Ok(None);
        };
        let stored: ExpiringValue = serde_json::from_slice(&raw)?;
        match stored.expires_at_ms {
            Some(exp) if exp <= now_ms => Ok(None),
            _ => Ok(Some(stored.value)),
        }
    }

    pub(crate) fn set_string(
        &self,
        name: &str,
        value: &str,
        expires_at_ms: Option<i64>,
    ) -> Result<(), QueueError> {
        let stored = ExpiringValue {
            value: value.to_string(),
            expires_at_ms,
        };
        self.txn
            .put(string_key(name).as_bytes(), &serde_json::to_vec(&stored)?)?;
        Ok(())
    }

    pub(crate) fn del_string(&self, name: &str) -> Result<(), QueueError> {
        self.txn.delete(string_key(name).as_bytes())?;
        Ok(())
    }
}

/// Run a script, retrying from scratch when its commit conflicts with
/// a concurrent script.
pub(crate) async fn retry_on_txn_conflict<T, F, Fut>(
    script_name: &str,
    mut f: F,
) -> Result<T, QueueError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, QueueError>>,
{
    for attempt in 0..MAX_SCRIPT_ATTEMPTS {
        match f().await {
            Err(QueueError::Slate(ref e)) if e.kind() == SlateErrorKind::Transaction => {
                if attempt + 1 < MAX_SCRIPT_ATTEMPTS {
                    debug!(
                        script = script_name,
                        attempt = attempt + 1,
                        "script transaction conflict, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(SCRIPT_RETRY_BACKOFF_MS)).await;
                    continue;
                }
            }
            other => return other,
        }
    }
    Err(QueueError::TransactionConflict(script_name.to_string()))
}

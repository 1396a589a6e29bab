//! Domain identifiers（強い型付けの ID）
//!
//! ID は phantom 型付きの `Id<T>` で包んだ ULID:
//! - 生成時刻でソート可能（上位 48 bit がタイムスタンプ）
//! - worker プロセス間の調整なしに生成できる
//! - `TaskId` と `DeadLetterId` はコンパイル時に取り違えられない
//!
//! # 学習ポイント
//! - PhantomData による型レベルの区別

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use ulid::Ulid;

/// Marker trait for each ID kind. Provides the display prefix.
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// Generic ULID-backed identifier.
///
/// `T` only exists at compile time; `size_of::<Id<T>>() == size_of::<Ulid>()`.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }

    /// Smallest possible id. Used as a lower bound when seeking index ranges.
    pub fn nil() -> Self {
        Self::from_ulid(Ulid::nil())
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid {kind} id '{input}'")]
pub struct ParseIdError {
    kind: &'static str,
    input: String,
}

/// Accepts both the prefixed form (`task-01H...`) and a bare ULID.
impl<T: IdMarker> FromStr for Id<T> {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix(T::prefix()).unwrap_or(s);
        Ulid::from_string(raw)
            .map(Self::from_ulid)
            .map_err(|_| ParseIdError {
                kind: T::prefix().trim_end_matches('-'),
                input: s.to_string(),
            })
    }
}

// ========================================
// Marker types
// ========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Task {}

impl IdMarker for Task {
    fn prefix() -> &'static str {
        "task-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeadLetter {}

impl IdMarker for DeadLetter {
    fn prefix() -> &'static str {
        "dlq-"
    }
}

/// Identifier of a task in the task store.
pub type TaskId = Id<Task>;

/// Identifier of a dead-letter entry. Never equal to the original task id.
pub type DeadLetterId = Id<DeadLetter>;

/// Identity of one worker process instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// `<prefix>-<ULID>`, unique per process start.
    pub fn generate(prefix: &str) -> Self {
        Self(format!("{prefix}-{}", Ulid::new()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

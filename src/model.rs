//! 盒子、文件与卡片的数据模型，以及上传失败码。

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path};

pub const MAX_FILENAME_CHARS: usize = 250;
pub const CARD_MAX_AGE_SECS: i64 = 365 * 24 * 60 * 60;

/// Lifecycle state shared by boxes and their files.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Status {
    Waiting,
    Complete,
}

impl From<Status> for u8 {
    fn from(status: Status) -> Self {
        match status {
            Status::Waiting => 1,
            Status::Complete => 2,
        }
    }
}

impl TryFrom<u8> for Status {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Status::Waiting),
            2 => Ok(Status::Complete),
            other => Err(format!("unknown status {other}")),
        }
    }
}

/// 配额等级：访客或持卡用户。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Level {
    Visitor,
    Red,
}

impl From<Level> for u8 {
    fn from(level: Level) -> Self {
        match level {
            Level::Visitor => 1,
            Level::Red => 2,
        }
    }
}

impl TryFrom<u8> for Level {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Level::Visitor),
            2 => Ok(Level::Red),
            other => Err(format!("unknown level {other}")),
        }
    }
}

/// Per-box ceilings granted by a tier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Quota {
    pub max_files: usize,
    pub max_bytes: u64,
}

impl Level {
    pub fn quota(self) -> Quota {
        match self {
            Level::Visitor => Quota {
                max_files: 5,
                max_bytes: 100 * 1024 * 1024,
            },
            Level::Red => Quota {
                max_files: 5,
                max_bytes: 1024 * 1024 * 1024,
            },
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoxFile {
    pub status: Status,
    pub filename: String,
    pub size: u64,
}

/// 一批声明的文件，按 code 寻址。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileBox {
    pub code: String,
    pub status: Status,
    pub level: Level,
    pub created: i64,
    pub files: BTreeMap<String, BoxFile>,
}

impl FileBox {
    pub fn all_files_complete(&self) -> bool {
        self.files
            .values()
            .all(|file| file.status == Status::Complete)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Card {
    pub code: String,
    pub level: Level,
    pub count: u32,
    pub created: i64,
}

impl Card {
    /// 次数耗尽，或（created > 0 时）超过一年即失效。
    pub fn is_expired(&self, now: i64) -> bool {
        if self.count == 0 {
            return true;
        }
        self.created > 0 && now - self.created >= CARD_MAX_AGE_SECS
    }
}

/// A file declared by the client when creating a box.
#[derive(Clone, Debug, Deserialize)]
pub struct FileSpec {
    pub name: String,
    pub size: u64,
}

/// Closed enumeration of client-visible failure codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploadFail {
    EmptyFile,
    TooMuchFile,
    BigFile,
    TooMuchError,
    TooFast,
    InvalidName,
    InvalidFile,
}

impl UploadFail {
    pub fn code(self) -> u32 {
        match self {
            UploadFail::EmptyFile => 40001,
            UploadFail::TooMuchFile => 40002,
            UploadFail::BigFile => 40003,
            UploadFail::TooMuchError => 40004,
            UploadFail::TooFast => 40005,
            UploadFail::InvalidName => 40006,
            UploadFail::InvalidFile => 40007,
        }
    }
}

impl fmt::Display for UploadFail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// 文件名必须是单个普通路径分量，不能包含分隔符或 `.`/`..`。
pub fn is_safe_filename(name: &str) -> bool {
    if name.is_empty() || name.contains(['/', '\\', '\0']) {
        return false;
    }
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

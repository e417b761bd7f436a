use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// Post visibility. Moves forward only: PRIVATE -> NEEDS_REVIEW -> PUBLIC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PostStatus {
    Private,
    NeedsReview,
    Public,
}

impl PostStatus {
    fn rank(self) -> u8 {
        match self {
            PostStatus::Private => 0,
            PostStatus::NeedsReview => 1,
            PostStatus::Public => 2,
        }
    }

    pub fn can_advance_to(self, next: PostStatus) -> bool {
        next.rank() > self.rank()
    }

    /// Whether the post has already reached (or passed) `other`
    pub fn is_at_least(self, other: PostStatus) -> bool {
        self.rank() >= other.rank()
    }

    /// Checked forward transition
    pub fn advance(self, next: PostStatus) -> Result<PostStatus> {
        if self.can_advance_to(next) {
            Ok(next)
        } else {
            Err(Error::InvalidTransition { from: self.to_string(), to: next.to_string() })
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PostStatus::Private => "PRIVATE",
            PostStatus::NeedsReview => "NEEDS_REVIEW",
            PostStatus::Public => "PUBLIC",
        }
    }
}

impl Default for PostStatus {
    fn default() -> Self {
        PostStatus::Private
    }
}

impl fmt::Display for PostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PostStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PRIVATE" => Ok(PostStatus::Private),
            "NEEDS_REVIEW" => Ok(PostStatus::NeedsReview),
            "PUBLIC" => Ok(PostStatus::Public),
            other => Err(Error::Validation(format!(
                "Invalid status value '{}'. Must be one of: PRIVATE, NEEDS_REVIEW, PUBLIC",
                other
            ))),
        }
    }
}

// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of fanline.
//
// fanline is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// fanline is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with fanline.  If not,
// see <http://www.gnu.org/licenses/>.

//! # fanline models
//!
//! ## Introduction
//!
//! I hate these sort of "catch-all" modules named "models" or "entities", but these types are
//! truly foundational: everything else in the crate consumes them.

use std::{fmt::Display, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snafu::{prelude::*, Backtrace};
use tap::Pipe;
use uuid::Uuid;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("A post body must be between 1 and {MAX_BODY_CHARS} characters; got {len}"))]
    BadBodyLength { len: usize, backtrace: Backtrace },
    #[snafu(display("{text} is not a recognized activity kind"))]
    BadActivityKind { text: String, backtrace: Backtrace },
    #[snafu(display("{text} could not be parsed as an identifier: {source}"))]
    BadId {
        text: String,
        source: uuid::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("A post may carry at most {MAX_IMAGE_REFS} images; got {count}"))]
    TooManyImages { count: usize, backtrace: Backtrace },
}

type Result<T> = std::result::Result<T, Error>;

type StdResult<T, E> = std::result::Result<T, E>;

/// Upper bound on the character count of a post body
pub const MAX_BODY_CHARS: usize = 1000;

/// Upper bound on the number of image references a post may carry
pub const MAX_IMAGE_REFS: usize = 9;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          Identifiers                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// identifier!
///
/// Use this to declare a type intended to be used as an opaque identifier for some other sort of
/// entity. In a NoSQL world we can't count on an auto-increment column to hand out ids, so the
/// application assigns its own; by far the most common approach is a UUID. I could have used a bare
/// [Uuid] everywhere, but I just couldn't bring myself to use the same type to represent
/// identifiers for users, posts and comments all at the same time.
///
/// The macro defines a newtype struct wrapping [Uuid] implementing [Display] (formatting the uuid
/// as an URN with the given namespace identifier), along with textual round-tripping for wire &
/// store use.
macro_rules! define_id {
    ($type_name:ident, $nid:expr) => {
        #[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
        #[serde(transparent)]
        pub struct $type_name(Uuid);
        impl $type_name {
            pub fn new() -> $type_name {
                $type_name(Uuid::new_v4())
            }
            pub fn from_raw_string(s: &str) -> Result<$type_name> {
                Uuid::parse_str(s)
                    .context(BadIdSnafu { text: s.to_owned() })
                    .map($type_name)
            }
            pub fn to_raw_string(&self) -> String {
                format!("{}", self.0.as_simple())
            }
        }
        impl Default for $type_name {
            fn default() -> Self {
                Self::new()
            }
        }
        impl Display for $type_name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "urn:{}:{}", $nid, self.0.as_simple())
            }
        }
        impl FromStr for $type_name {
            type Err = Error;
            fn from_str(s: &str) -> StdResult<Self, Self::Err> {
                $type_name::from_raw_string(s)
            }
        }
    };
}

define_id!(UserId, "userid");
define_id!(PostId, "postid");
define_id!(CommentId, "commentid");

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           PostBody                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A refined type representing the textual body of a post
///
/// fanline post bodies are arbitrary UTF-8 text of between 1 and [MAX_BODY_CHARS] characters
/// (characters, not bytes-- a body of a thousand CJK glyphs is fine).
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(transparent)]
pub struct PostBody(String);

impl PostBody {
    pub fn new(text: &str) -> Result<PostBody> {
        let len = text.chars().count();
        ensure!((1..=MAX_BODY_CHARS).contains(&len), BadBodyLengthSnafu { len });
        PostBody(text.to_owned()).pipe(Ok)
    }
}

impl AsRef<str> for PostBody {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Display for PostBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                              Post                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A single post, as held by the post store
///
/// The post store is the authoritative source of truth for these; everyone else holds a [PostId]
/// and hydrates on demand. Posts are never physically deleted: `is_deleted` is a tombstone hiding
/// the post from reads while its row lives on.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Post {
    pub id: PostId,
    pub author_id: UserId,
    pub body: PostBody,
    pub image_refs: Vec<String>,
    pub like_count: i64,
    pub comment_count: i64,
    pub share_count: i64,
    /// Ranking score, recomputed on publish & by the periodic rescan. Carried for future
    /// re-ranking; timelines order by `created_at`, *not* by this.
    pub score: f64,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Post {
    /// Construct a new post, validating the content bounds. Counters start at zero; the caller is
    /// expected to compute `score` before persisting.
    pub fn new(
        author_id: UserId,
        body: &str,
        image_refs: Vec<String>,
        now: DateTime<Utc>,
    ) -> Result<Post> {
        ensure!(
            image_refs.len() <= MAX_IMAGE_REFS,
            TooManyImagesSnafu {
                count: image_refs.len()
            }
        );
        Ok(Post {
            id: PostId::new(),
            author_id,
            body: PostBody::new(body)?,
            image_refs,
            like_count: 0,
            comment_count: 0,
            share_count: 0,
            score: 0.0,
            is_deleted: false,
            created_at: now,
            updated_at: now,
        })
    }
    /// `created_at` expressed as an integer epoch-- the score under which this post is filed in
    /// every timeline that holds it
    pub fn created_epoch(&self) -> i64 {
        self.created_at.timestamp()
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                              User                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A fanline user, as held by the user store
///
/// `follower_count` & `following_count` are denormalized counters maintained on follow/unfollow.
/// `activity_score` and `last_active_at` belong to the activity tracker; they live here because
/// the user row is where they're persisted. `is_online` is a convenience snapshot-- the truth is
/// a TTL'd flag in the tracker.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct User {
    pub id: UserId,
    pub follower_count: i64,
    pub following_count: i64,
    pub last_active_at: Option<DateTime<Utc>>,
    pub activity_score: f64,
    pub is_online: bool,
}

impl User {
    pub fn new(id: UserId) -> User {
        User {
            id,
            follower_count: 0,
            following_count: 0,
            last_active_at: None,
            activity_score: 0.0,
            is_online: false,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           FollowEdge                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A directed edge in the follow graph: `follower` follows `followee`
///
/// The pair `(follower, followee)` is unique in the follow store.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct FollowEdge {
    pub follower: UserId,
    pub followee: UserId,
    pub created_at: DateTime<Utc>,
    pub is_active: bool,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          ActivityKind                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The sorts of observable user action the activity tracker is told about
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Login,
    Publish,
    Comment,
    Share,
    Like,
    ViewFeed,
}

impl ActivityKind {
    /// The kind-specific increment applied to the user's activity score
    pub fn increment(&self) -> f64 {
        match self {
            ActivityKind::Login => 5.0,
            ActivityKind::Publish => 15.0,
            ActivityKind::Comment => 8.0,
            ActivityKind::Share => 10.0,
            ActivityKind::Like => 2.0,
            ActivityKind::ViewFeed => 1.0,
        }
    }
}

impl Display for ActivityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                ActivityKind::Login => "login",
                ActivityKind::Publish => "publish",
                ActivityKind::Comment => "comment",
                ActivityKind::Share => "share",
                ActivityKind::Like => "like",
                ActivityKind::ViewFeed => "view_feed",
            }
        )
    }
}

impl FromStr for ActivityKind {
    type Err = Error;
    fn from_str(s: &str) -> StdResult<Self, Self::Err> {
        match s {
            "login" => Ok(ActivityKind::Login),
            "publish" | "post" => Ok(ActivityKind::Publish),
            "comment" => Ok(ActivityKind::Comment),
            "share" => Ok(ActivityKind::Share),
            "like" => Ok(ActivityKind::Like),
            "view_feed" => Ok(ActivityKind::ViewFeed),
            text => BadActivityKindSnafu { text }.fail(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ids_round_trip() {
        let id = PostId::new();
        let text = id.to_raw_string();
        assert_eq!(id, PostId::from_raw_string(&text).unwrap());
        assert!(format!("{}", id).starts_with("urn:postid:"));
        assert!(UserId::from_raw_string("not-a-uuid").is_err());
    }

    #[test]
    fn post_bounds() {
        let author = UserId::new();
        let now = Utc::now();
        assert!(Post::new(author, "hi", vec![], now).is_ok());
        assert!(Post::new(author, "", vec![], now).is_err());
        assert!(Post::new(author, &"x".repeat(1001), vec![], now).is_err());
        // A thousand multi-byte characters is still within bounds
        assert!(Post::new(author, &"漢".repeat(1000), vec![], now).is_ok());
        assert!(Post::new(author, "hi", vec!["i".to_owned(); 10], now).is_err());
    }

    #[test]
    fn activity_kinds() {
        assert_eq!("view_feed".parse::<ActivityKind>().unwrap(), ActivityKind::ViewFeed);
        assert_eq!(ActivityKind::Publish.increment(), 15.0);
        assert_eq!(format!("{}", ActivityKind::ViewFeed), "view_feed");
        assert!("dance".parse::<ActivityKind>().is_err());
    }
}

use bincode::{Decode, Encode};
use pulse_core::{PostId, Timestamp, UserId};
use serde::Serialize;

macro_rules! def_table {
    ($(#[$outer:meta])*
        $name:ident : $k:ty => $v:ty) => {
        #[allow(unused)]
        $(#[$outer])*
        pub mod $name {
            use super::*;
            pub type Key = $k;
            pub type Value = $v;
            pub type Definition<'a> = redb_bincode::TableDefinition<'a, Key, Value>;
            pub trait ReadableTable: redb_bincode::ReadableTable<Key, Value> {}
            impl<RT> ReadableTable for RT where RT: redb_bincode::ReadableTable<Key, Value> {}
            pub type Table<'a> = redb_bincode::Table<'a, Key, Value>;
            pub const TABLE: Definition = redb_bincode::TableDefinition::new(stringify!($name));
        }
    };
}

def_table! {
    /// Tracks database/schema version
    db_version: () => u64
}

def_table! {
    /// Id allocation state; user and post ids are never reused, even after
    /// a post is deleted
    sequences: () => SequencesRecord
}

def_table!(users: UserId => UserRecord);
def_table!(users_by_name: String => UserId);
def_table!(users_by_email: String => UserId);
def_table!(posts: PostId => PostRecord);
def_table! {
    /// Per-author time index over posts, scanned backwards for the
    /// celebrity pull and the cache-miss fallback
    posts_by_author: (UserId, Timestamp, PostId) => ()
}
def_table!(follows: (UserId, UserId) => FollowRecord);
def_table! {
    /// Reverse follow index, keyed (followee, follower); drives fan-out
    followers: (UserId, UserId) => ()
}
def_table! {
    /// Denormalized totals, maintained in the same transactions that
    /// change them
    stats: () => StatsRecord
}

#[derive(Debug, Encode, Decode, Clone)]
pub struct SequencesRecord {
    pub next_user: UserId,
    pub next_post: PostId,
    pub last_post_at: Timestamp,
}

impl Default for SequencesRecord {
    fn default() -> Self {
        Self {
            next_user: UserId(1),
            next_post: PostId(1),
            last_post_at: Timestamp::ZERO,
        }
    }
}

#[derive(Debug, Encode, Decode, Clone)]
pub struct UserRecord {
    pub username: String,
    pub email: String,
    pub created_at: Timestamp,
    pub follower_count: u64,
    pub following_count: u64,
    pub is_celebrity: bool,
}

#[derive(Debug, Encode, Decode, Clone)]
pub struct PostRecord {
    pub author: UserId,
    pub content: String,
    pub created_at: Timestamp,
}

#[derive(Debug, Encode, Decode, Clone)]
pub struct FollowRecord {
    pub created_at: Timestamp,
}

#[derive(Debug, Encode, Decode, Clone, Copy, Default, Serialize)]
pub struct StatsRecord {
    pub users: u64,
    pub posts: u64,
    pub follows: u64,
    pub celebrities: u64,
}

/// A user record together with its id, as handed to callers.
#[derive(Debug, Clone)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub email: String,
    pub created_at: Timestamp,
    pub follower_count: u64,
    pub following_count: u64,
    pub is_celebrity: bool,
}

impl User {
    pub(crate) fn from_record(id: UserId, record: UserRecord) -> Self {
        Self {
            id,
            username: record.username,
            email: record.email,
            created_at: record.created_at,
            follower_count: record.follower_count,
            following_count: record.following_count,
            is_celebrity: record.is_celebrity,
        }
    }
}

/// A post record together with its id.
#[derive(Debug, Clone)]
pub struct Post {
    pub id: PostId,
    pub author: UserId,
    pub content: String,
    pub created_at: Timestamp,
}

impl Post {
    pub(crate) fn from_record(id: PostId, record: PostRecord) -> Self {
        Self {
            id,
            author: record.author,
            content: record.content,
            created_at: record.created_at,
        }
    }
}

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

/// Upper bound on post content length, in Unicode codepoints after trimming.
pub const MAX_POST_CONTENT_CHARS: usize = 5000;

macro_rules! id_type_define {
    (
        $(#[$outer:meta])*
        struct $t:tt
    ) => {
        $(#[$outer])*
        #[derive(
            Encode, Decode, Serialize, Deserialize, Copy, Clone, Debug, Hash, PartialEq, Eq,
            PartialOrd, Ord,
        )]
        #[serde(transparent)]
        pub struct $t(pub u64);

        impl $t {
            pub const ZERO: Self = Self(0);
            pub const MAX: Self = Self(u64::MAX);

            pub fn next(self) -> Self {
                Self(self.0 + 1)
            }
        }

        impl From<u64> for $t {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }

        impl From<$t> for u64 {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl fmt::Display for $t {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $t {
            type Err = <u64 as FromStr>::Err;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(u64::from_str(s)?))
            }
        }
    };
}

id_type_define!(
    /// Stable, non-reusable user identifier, assigned sequentially by the store.
    struct UserId
);

id_type_define!(
    /// Post identifier; higher ids carry equal-or-later [`Timestamp`]s.
    struct PostId
);

/// Wall-clock timestamp in integer milliseconds since the Unix epoch.
///
/// Used both as the stored `created_at` of users, posts and follow edges, and
/// as the ordering score of cached timeline entries.
#[derive(
    Encode, Decode, Serialize, Deserialize, Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd,
    Ord,
)]
#[serde(transparent)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub const ZERO: Self = Self(0);
    pub const MAX: Self = Self(u64::MAX);

    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_millis();
        Self(u64::try_from(millis).unwrap_or(u64::MAX))
    }

    pub fn saturating_sub(self, d: Duration) -> Self {
        Self(
            self.0
                .saturating_sub(u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
        )
    }

    pub fn as_millis(self) -> u64 {
        self.0
    }
}

impl From<u64> for Timestamp {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Timestamp> for u64 {
    fn from(value: Timestamp) -> Self {
        value.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for Timestamp {
    type Err = <u64 as FromStr>::Err;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(u64::from_str(s)?))
    }
}

/// Messages carried by the event bus, JSON-encoded on the wire.
///
/// `is_celebrity` records the author's classification at emit time; consumers
/// re-check it against the store before acting, since it may have flipped
/// while the message sat in the queue.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum FeedEvent {
    PostCreated {
        post_id: PostId,
        author_id: UserId,
        is_celebrity: bool,
        timestamp: Timestamp,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_event_wire_format() {
        let event = FeedEvent::PostCreated {
            post_id: PostId(7),
            author_id: UserId(3),
            is_celebrity: false,
            timestamp: Timestamp(1_700_000_000_000),
        };

        let json = serde_json::to_value(&event).expect("serializes");
        assert_eq!(json["event_type"], "post_created");
        assert_eq!(json["post_id"], 7);
        assert_eq!(json["author_id"], 3);
        assert_eq!(json["is_celebrity"], false);
        assert_eq!(json["timestamp"], 1_700_000_000_000u64);

        let back: FeedEvent = serde_json::from_value(json).expect("deserializes");
        assert_eq!(back, event);
    }

    #[test]
    fn timestamp_lookback_saturates() {
        assert_eq!(
            Timestamp(1000).saturating_sub(Duration::from_secs(2)),
            Timestamp::ZERO
        );
        assert_eq!(
            Timestamp(10_000).saturating_sub(Duration::from_secs(2)),
            Timestamp(8_000)
        );
    }
}

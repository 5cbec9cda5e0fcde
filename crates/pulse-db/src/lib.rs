mod tables;
mod tx_ops;

use std::collections::HashMap;
use std::path::PathBuf;

use pulse_core::{PostId, Timestamp, UserId};
use redb_bincode::ReadableTable as _;
use snafu::{Location, ResultExt as _, Snafu};
use tokio::task::JoinError;
use tracing::debug;

pub use self::tables::*;

const LOG_TARGET: &str = "pulse::db";

/// Schema version written into fresh databases.
const DB_VERSION: u64 = 0;

#[derive(Debug, Snafu)]
pub enum DbError {
    Database {
        source: redb::DatabaseError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(transparent)]
    Table {
        source: redb::TableError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(transparent)]
    Storage {
        source: redb::StorageError,
        #[snafu(implicit)]
        location: Location,
    },
    Transaction {
        source: redb::TransactionError,
        #[snafu(implicit)]
        location: Location,
    },
    Commit {
        source: redb::CommitError,
        #[snafu(implicit)]
        location: Location,
    },
    DbVersionTooHigh {
        db_ver: u64,
        code_ver: u64,
        #[snafu(implicit)]
        location: Location,
    },
    Join {
        source: JoinError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("User {user_id} not found"))]
    UserNotFound { user_id: UserId },
    #[snafu(display("Username {username} already taken"))]
    UsernameTaken { username: String },
    #[snafu(display("Email {email} already registered"))]
    EmailTaken { email: String },
    #[snafu(display("Post {post_id} not found"))]
    PostNotFound { post_id: PostId },
    #[snafu(display("Post {post_id} belongs to another user"))]
    NotPostAuthor { post_id: PostId },
    #[snafu(display("Users can not follow themselves"))]
    SelfFollow,
    #[snafu(display("Already following user {following}"))]
    DuplicateFollow { following: UserId },
    #[snafu(display("Not following user {following}"))]
    FollowNotFound { following: UserId },
}
pub type DbResult<T> = std::result::Result<T, DbError>;

/// The system of record: users, posts, follow edges, denormalized counters.
///
/// One handle is shared by every component (wrapped in an `Arc` by the
/// caller); transactions run on the blocking pool so the async runtime is
/// never stalled by storage I/O. Write transactions serialize, which is what
/// makes id allocation and counter updates race-free.
#[derive(Debug)]
pub struct Database {
    inner: redb_bincode::Database,
    celebrity_threshold: u64,
}

impl Database {
    pub async fn open(
        path: impl Into<PathBuf>,
        celebrity_threshold: u64,
    ) -> DbResult<Database> {
        let path = path.into();
        debug!(target: LOG_TARGET, path = %path.display(), "Opening database");
        let inner = tokio::task::spawn_blocking(move || redb_bincode::Database::create(path))
            .await
            .context(JoinSnafu)?
            .context(DatabaseSnafu)?;

        let s = Self {
            inner,
            celebrity_threshold,
        };

        s.write_with(|tx| {
            Self::init_tables_tx(tx)?;
            Self::verify_db_version_tx(&mut tx.open_table(&db_version::TABLE)?)
        })
        .await?;

        Ok(s)
    }

    pub fn celebrity_threshold(&self) -> u64 {
        self.celebrity_threshold
    }

    /// Cheap liveness probe used by the health endpoint.
    pub async fn probe(&self) -> DbResult<()> {
        self.read_with(|tx| {
            let _ = tx.open_table(&stats::TABLE)?;
            Ok(())
        })
        .await
    }

    pub async fn create_user(&self, username: &str, email: &str) -> DbResult<User> {
        let username = username.to_owned();
        let email = email.to_owned();
        self.write_with(|tx| {
            Self::create_user_tx(
                &username,
                &email,
                Timestamp::now(),
                &mut tx.open_table(&users::TABLE)?,
                &mut tx.open_table(&users_by_name::TABLE)?,
                &mut tx.open_table(&users_by_email::TABLE)?,
                &mut tx.open_table(&sequences::TABLE)?,
                &mut tx.open_table(&stats::TABLE)?,
            )
        })
        .await
    }

    pub async fn get_user(&self, user_id: UserId) -> DbResult<Option<User>> {
        self.read_with(|tx| {
            let users_table = tx.open_table(&users::TABLE)?;
            Ok(Self::get_user_tx(user_id, &users_table)?
                .map(|record| User::from_record(user_id, record)))
        })
        .await
    }

    pub async fn get_user_by_username(&self, username: &str) -> DbResult<Option<User>> {
        let username = username.to_owned();
        self.read_with(|tx| {
            let users_table = tx.open_table(&users::TABLE)?;
            let users_by_name_table = tx.open_table(&users_by_name::TABLE)?;

            let Some(user_id) = users_by_name_table.get(&username)?.map(|g| g.value()) else {
                return Ok(None);
            };
            Ok(Self::get_user_tx(user_id, &users_table)?
                .map(|record| User::from_record(user_id, record)))
        })
        .await
    }

    pub async fn get_user_by_email(&self, email: &str) -> DbResult<Option<User>> {
        let email = email.to_owned();
        self.read_with(|tx| {
            let users_table = tx.open_table(&users::TABLE)?;
            let users_by_email_table = tx.open_table(&users_by_email::TABLE)?;

            let Some(user_id) = users_by_email_table.get(&email)?.map(|g| g.value()) else {
                return Ok(None);
            };
            Ok(Self::get_user_tx(user_id, &users_table)?
                .map(|record| User::from_record(user_id, record)))
        })
        .await
    }

    pub async fn get_users_by_ids(
        &self,
        user_ids: impl IntoIterator<Item = UserId>,
    ) -> DbResult<HashMap<UserId, User>> {
        let user_ids: Vec<UserId> = user_ids.into_iter().collect();
        self.read_with(|tx| {
            let users_table = tx.open_table(&users::TABLE)?;

            let mut ret = HashMap::new();
            for user_id in user_ids {
                if let Some(record) = Self::get_user_tx(user_id, &users_table)? {
                    ret.insert(user_id, User::from_record(user_id, record));
                }
            }
            Ok(ret)
        })
        .await
    }

    /// Insert a post, assigning its id and `created_at` atomically.
    ///
    /// `created_at` is clamped to be non-decreasing across consecutive posts
    /// so higher ids never carry earlier timestamps.
    pub async fn create_post(&self, author: UserId, content: &str) -> DbResult<Post> {
        let content = content.to_owned();
        self.write_with(|tx| {
            Self::create_post_tx(
                author,
                &content,
                Timestamp::now(),
                &tx.open_table(&users::TABLE)?,
                &mut tx.open_table(&posts::TABLE)?,
                &mut tx.open_table(&posts_by_author::TABLE)?,
                &mut tx.open_table(&sequences::TABLE)?,
                &mut tx.open_table(&stats::TABLE)?,
            )
        })
        .await
    }

    pub async fn get_post(&self, post_id: PostId) -> DbResult<Option<Post>> {
        self.read_with(|tx| {
            let posts_table = tx.open_table(&posts::TABLE)?;
            let result = posts_table
                .get(&post_id)?
                .map(|g| Post::from_record(post_id, g.value()));
            Ok(result)
        })
        .await
    }

    pub async fn get_posts_by_ids(
        &self,
        post_ids: impl IntoIterator<Item = PostId>,
    ) -> DbResult<HashMap<PostId, Post>> {
        let post_ids: Vec<PostId> = post_ids.into_iter().collect();
        self.read_with(|tx| {
            let posts_table = tx.open_table(&posts::TABLE)?;

            let mut ret = HashMap::new();
            for post_id in post_ids {
                if let Some(record) = posts_table.get(&post_id)?.map(|g| g.value()) {
                    ret.insert(post_id, Post::from_record(post_id, record));
                }
            }
            Ok(ret)
        })
        .await
    }

    /// Remove a post; only its author may do so. The caller is responsible
    /// for any cache-side cleanup.
    pub async fn delete_post(&self, post_id: PostId, author: UserId) -> DbResult<()> {
        self.write_with(|tx| {
            Self::delete_post_tx(
                post_id,
                author,
                &mut tx.open_table(&posts::TABLE)?,
                &mut tx.open_table(&posts_by_author::TABLE)?,
                &mut tx.open_table(&stats::TABLE)?,
            )
        })
        .await
    }

    /// Insert a follow edge and, in the same transaction, update both
    /// denormalized counters and re-evaluate the followee's celebrity flag.
    pub async fn add_follow(&self, follower: UserId, following: UserId) -> DbResult<()> {
        let threshold = self.celebrity_threshold;
        self.write_with(|tx| {
            Self::add_follow_tx(
                follower,
                following,
                Timestamp::now(),
                threshold,
                &mut tx.open_table(&users::TABLE)?,
                &mut tx.open_table(&follows::TABLE)?,
                &mut tx.open_table(&followers::TABLE)?,
                &mut tx.open_table(&stats::TABLE)?,
            )
        })
        .await
    }

    pub async fn remove_follow(&self, follower: UserId, following: UserId) -> DbResult<()> {
        let threshold = self.celebrity_threshold;
        self.write_with(|tx| {
            Self::remove_follow_tx(
                follower,
                following,
                threshold,
                &mut tx.open_table(&users::TABLE)?,
                &mut tx.open_table(&follows::TABLE)?,
                &mut tx.open_table(&followers::TABLE)?,
                &mut tx.open_table(&stats::TABLE)?,
            )
        })
        .await
    }

    /// One page of a user's followers, ascending by follower id.
    ///
    /// Keyset-paginated so enumerating millions of followers never
    /// materializes more than `chunk` ids at a time; the returned cursor is
    /// the first id of the next page.
    pub async fn followers_page(
        &self,
        user_id: UserId,
        cursor: Option<UserId>,
        chunk: usize,
    ) -> DbResult<(Vec<UserId>, Option<UserId>)> {
        self.read_with(|tx| {
            let followers_table = tx.open_table(&followers::TABLE)?;
            Self::read_followers_page_tx(user_id, cursor, chunk, &followers_table)
        })
        .await
    }

    pub async fn followed_ids_of(&self, user_id: UserId) -> DbResult<Vec<UserId>> {
        self.read_with(|tx| {
            let follows_table = tx.open_table(&follows::TABLE)?;
            Self::read_followed_ids_tx(user_id, &follows_table)
        })
        .await
    }

    /// Followed users that are currently classified as celebrities.
    pub async fn followed_celebrities_of(&self, user_id: UserId) -> DbResult<Vec<UserId>> {
        self.read_with(|tx| {
            let follows_table = tx.open_table(&follows::TABLE)?;
            let users_table = tx.open_table(&users::TABLE)?;

            let mut ret = vec![];
            for followed in Self::read_followed_ids_tx(user_id, &follows_table)? {
                if Self::get_user_tx(followed, &users_table)?
                    .is_some_and(|record| record.is_celebrity)
                {
                    ret.push(followed);
                }
            }
            Ok(ret)
        })
        .await
    }

    /// Most recent posts by any of `authors` since the given time, newest
    /// first; ties on `created_at` order by higher post id first.
    pub async fn recent_posts_by_authors(
        &self,
        authors: &[UserId],
        since: Timestamp,
        limit: usize,
    ) -> DbResult<Vec<Post>> {
        let authors = authors.to_vec();
        self.read_with(|tx| {
            let posts_by_author_table = tx.open_table(&posts_by_author::TABLE)?;
            let posts_table = tx.open_table(&posts::TABLE)?;
            Self::recent_posts_tx(
                &authors,
                since,
                limit,
                &posts_by_author_table,
                &posts_table,
            )
        })
        .await
    }

    pub async fn stats(&self) -> DbResult<StatsRecord> {
        self.read_with(|tx| {
            let stats_table = tx.open_table(&stats::TABLE)?;
            let result = stats_table.get(&())?.map(|g| g.value()).unwrap_or_default();
            Ok(result)
        })
        .await
    }
}

impl Database {
    pub async fn write_with<T>(
        &self,
        f: impl FnOnce(&'_ redb_bincode::WriteTransaction) -> DbResult<T>,
    ) -> DbResult<T> {
        tokio::task::block_in_place(|| {
            let dbtx = self.inner.begin_write().context(TransactionSnafu)?;
            let res = f(&dbtx)?;

            dbtx.commit().context(CommitSnafu)?;

            Ok(res)
        })
    }

    pub async fn read_with<T>(
        &self,
        f: impl FnOnce(&'_ redb_bincode::ReadTransaction) -> DbResult<T>,
    ) -> DbResult<T> {
        tokio::task::block_in_place(|| {
            let dbtx = self.inner.begin_read().context(TransactionSnafu)?;

            f(&dbtx)
        })
    }

    fn init_tables_tx(tx: &redb_bincode::WriteTransaction) -> DbResult<()> {
        tx.open_table(&db_version::TABLE)?;
        tx.open_table(&sequences::TABLE)?;
        tx.open_table(&users::TABLE)?;
        tx.open_table(&users_by_name::TABLE)?;
        tx.open_table(&users_by_email::TABLE)?;
        tx.open_table(&posts::TABLE)?;
        tx.open_table(&posts_by_author::TABLE)?;
        tx.open_table(&follows::TABLE)?;
        tx.open_table(&followers::TABLE)?;
        tx.open_table(&stats::TABLE)?;
        Ok(())
    }

    fn verify_db_version_tx(db_version_table: &mut db_version::Table) -> DbResult<()> {
        let current = db_version_table.get(&())?.map(|g| g.value());
        let db_ver = match current {
            Some(v) => v,
            None => {
                db_version_table.insert(&(), &DB_VERSION)?;
                DB_VERSION
            }
        };

        if DB_VERSION < db_ver {
            return DbVersionTooHighSnafu {
                db_ver,
                code_ver: DB_VERSION,
            }
            .fail();
        }
        Ok(())
    }
}

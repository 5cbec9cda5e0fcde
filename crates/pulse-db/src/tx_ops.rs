use pulse_core::{PostId, Timestamp, UserId};
use redb_bincode::ReadableTable as _;
use snafu::OptionExt as _;
use tracing::info;

use crate::{
    DbResult, DuplicateFollowSnafu, EmailTakenSnafu, FollowNotFoundSnafu, FollowRecord,
    NotPostAuthorSnafu, Post, PostNotFoundSnafu, PostRecord, SelfFollowSnafu, SequencesRecord,
    User, UserNotFoundSnafu, UserRecord, UsernameTakenSnafu, followers, follows, posts,
    posts_by_author, sequences, stats, users, users_by_email, users_by_name, Database, LOG_TARGET,
};

impl Database {
    pub(crate) fn get_user_tx(
        user_id: UserId,
        users_table: &impl users::ReadableTable,
    ) -> DbResult<Option<UserRecord>> {
        Ok(users_table.get(&user_id)?.map(|g| g.value()))
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn create_user_tx(
        username: &str,
        email: &str,
        now: Timestamp,
        users_table: &mut users::Table,
        users_by_name_table: &mut users_by_name::Table,
        users_by_email_table: &mut users_by_email::Table,
        sequences_table: &mut sequences::Table,
        stats_table: &mut stats::Table,
    ) -> DbResult<User> {
        if users_by_name_table.get(&username.to_owned())?.is_some() {
            return UsernameTakenSnafu { username }.fail();
        }
        if users_by_email_table.get(&email.to_owned())?.is_some() {
            return EmailTakenSnafu { email }.fail();
        }

        let mut seq = Self::read_sequences_tx(sequences_table)?;
        let user_id = seq.next_user;
        seq.next_user = seq.next_user.next();
        sequences_table.insert(&(), &seq)?;

        let record = UserRecord {
            username: username.to_owned(),
            email: email.to_owned(),
            created_at: now,
            follower_count: 0,
            following_count: 0,
            is_celebrity: false,
        };
        users_table.insert(&user_id, &record)?;
        users_by_name_table.insert(&username.to_owned(), &user_id)?;
        users_by_email_table.insert(&email.to_owned(), &user_id)?;

        Self::update_stats_tx(stats_table, |stats| stats.users += 1)?;

        info!(target: LOG_TARGET, %user_id, username, "User created");
        Ok(User::from_record(user_id, record))
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn create_post_tx(
        author: UserId,
        content: &str,
        now: Timestamp,
        users_table: &impl users::ReadableTable,
        posts_table: &mut posts::Table,
        posts_by_author_table: &mut posts_by_author::Table,
        sequences_table: &mut sequences::Table,
        stats_table: &mut stats::Table,
    ) -> DbResult<Post> {
        Self::get_user_tx(author, users_table)?.context(UserNotFoundSnafu { user_id: author })?;

        let mut seq = Self::read_sequences_tx(sequences_table)?;
        let post_id = seq.next_post;
        // A backwards wall-clock step must not let a higher id carry an
        // earlier timestamp.
        let created_at = now.max(seq.last_post_at);
        seq.next_post = seq.next_post.next();
        seq.last_post_at = created_at;
        sequences_table.insert(&(), &seq)?;

        let record = PostRecord {
            author,
            content: content.to_owned(),
            created_at,
        };
        posts_table.insert(&post_id, &record)?;
        posts_by_author_table.insert(&(author, created_at, post_id), &())?;

        Self::update_stats_tx(stats_table, |stats| stats.posts += 1)?;

        Ok(Post::from_record(post_id, record))
    }

    pub(crate) fn delete_post_tx(
        post_id: PostId,
        author: UserId,
        posts_table: &mut posts::Table,
        posts_by_author_table: &mut posts_by_author::Table,
        stats_table: &mut stats::Table,
    ) -> DbResult<()> {
        let record = posts_table
            .get(&post_id)?
            .map(|g| g.value())
            .context(PostNotFoundSnafu { post_id })?;

        if record.author != author {
            return NotPostAuthorSnafu { post_id }.fail();
        }

        posts_table.remove(&post_id)?;
        posts_by_author_table.remove(&(record.author, record.created_at, post_id))?;

        Self::update_stats_tx(stats_table, |stats| {
            stats.posts = stats.posts.saturating_sub(1)
        })?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn add_follow_tx(
        follower: UserId,
        following: UserId,
        now: Timestamp,
        celebrity_threshold: u64,
        users_table: &mut users::Table,
        follows_table: &mut follows::Table,
        followers_table: &mut followers::Table,
        stats_table: &mut stats::Table,
    ) -> DbResult<()> {
        if follower == following {
            return SelfFollowSnafu.fail();
        }

        let mut follower_record = Self::get_user_tx(follower, users_table)?
            .context(UserNotFoundSnafu { user_id: follower })?;
        let mut following_record = Self::get_user_tx(following, users_table)?
            .context(UserNotFoundSnafu { user_id: following })?;

        if follows_table.get(&(follower, following))?.is_some() {
            return DuplicateFollowSnafu { following }.fail();
        }

        follows_table.insert(&(follower, following), &FollowRecord { created_at: now })?;
        followers_table.insert(&(following, follower), &())?;

        follower_record.following_count += 1;
        users_table.insert(&follower, &follower_record)?;

        following_record.follower_count += 1;
        let flipped = Self::reclassify_tx(
            following,
            &mut following_record,
            celebrity_threshold,
            stats_table,
        )?;
        users_table.insert(&following, &following_record)?;

        Self::update_stats_tx(stats_table, |stats| stats.follows += 1)?;

        info!(
            target: LOG_TARGET,
            %follower,
            %following,
            reclassified = flipped,
            "Follow edge added"
        );
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn remove_follow_tx(
        follower: UserId,
        following: UserId,
        celebrity_threshold: u64,
        users_table: &mut users::Table,
        follows_table: &mut follows::Table,
        followers_table: &mut followers::Table,
        stats_table: &mut stats::Table,
    ) -> DbResult<()> {
        if follows_table.remove(&(follower, following))?.is_none() {
            return FollowNotFoundSnafu { following }.fail();
        }
        followers_table.remove(&(following, follower))?;

        if let Some(mut follower_record) = Self::get_user_tx(follower, users_table)? {
            follower_record.following_count = follower_record.following_count.saturating_sub(1);
            users_table.insert(&follower, &follower_record)?;
        }

        if let Some(mut following_record) = Self::get_user_tx(following, users_table)? {
            following_record.follower_count = following_record.follower_count.saturating_sub(1);
            Self::reclassify_tx(
                following,
                &mut following_record,
                celebrity_threshold,
                stats_table,
            )?;
            users_table.insert(&following, &following_record)?;
        }

        Self::update_stats_tx(stats_table, |stats| {
            stats.follows = stats.follows.saturating_sub(1)
        })?;

        info!(target: LOG_TARGET, %follower, %following, "Follow edge removed");
        Ok(())
    }

    /// Re-evaluate the celebrity flag against the current follower count.
    ///
    /// Runs inside the same transaction as the edge change that altered the
    /// count, so the flag is never stale outside a transaction. Returns
    /// whether the flag flipped; the caller persists the record.
    fn reclassify_tx(
        user_id: UserId,
        record: &mut UserRecord,
        celebrity_threshold: u64,
        stats_table: &mut stats::Table,
    ) -> DbResult<bool> {
        let is_celebrity = celebrity_threshold <= record.follower_count;
        if is_celebrity == record.is_celebrity {
            return Ok(false);
        }

        record.is_celebrity = is_celebrity;
        Self::update_stats_tx(stats_table, |stats| {
            if is_celebrity {
                stats.celebrities += 1;
            } else {
                stats.celebrities = stats.celebrities.saturating_sub(1);
            }
        })?;

        info!(
            target: LOG_TARGET,
            %user_id,
            follower_count = record.follower_count,
            is_celebrity,
            "User reclassified"
        );
        Ok(true)
    }

    pub(crate) fn read_followers_page_tx(
        user_id: UserId,
        cursor: Option<UserId>,
        chunk: usize,
        followers_table: &impl followers::ReadableTable,
    ) -> DbResult<(Vec<UserId>, Option<UserId>)> {
        let start = cursor.unwrap_or(UserId::ZERO);

        let mut ret = vec![];
        for entry in followers_table.range((user_id, start)..=(user_id, UserId::MAX))? {
            let (k, _) = entry?;
            let (_, follower) = k.value();

            if chunk <= ret.len() {
                return Ok((ret, Some(follower)));
            }
            ret.push(follower);
        }

        Ok((ret, None))
    }

    pub(crate) fn read_followed_ids_tx(
        user_id: UserId,
        follows_table: &impl follows::ReadableTable,
    ) -> DbResult<Vec<UserId>> {
        follows_table
            .range((user_id, UserId::ZERO)..=(user_id, UserId::MAX))?
            .map(|res| res.map(|(k, _)| k.value().1).map_err(Into::into))
            .collect()
    }

    pub(crate) fn recent_posts_tx(
        authors: &[UserId],
        since: Timestamp,
        limit: usize,
        posts_by_author_table: &impl posts_by_author::ReadableTable,
        posts_table: &impl posts::ReadableTable,
    ) -> DbResult<Vec<Post>> {
        let mut keys: Vec<(Timestamp, PostId)> = vec![];

        for &author in authors {
            // Newest `limit` per author is enough: anything older can not
            // make the merged top `limit`.
            for entry in posts_by_author_table
                .range(
                    (author, since, PostId::ZERO)..=(author, Timestamp::MAX, PostId::MAX),
                )?
                .rev()
                .take(limit)
            {
                let (k, _) = entry?;
                let (_, created_at, post_id) = k.value();
                keys.push((created_at, post_id));
            }
        }

        keys.sort_unstable_by(|a, b| b.cmp(a));
        keys.truncate(limit);

        let mut ret = Vec::with_capacity(keys.len());
        for (_, post_id) in keys {
            if let Some(record) = posts_table.get(&post_id)?.map(|g| g.value()) {
                ret.push(Post::from_record(post_id, record));
            }
        }
        Ok(ret)
    }

    fn read_sequences_tx(sequences_table: &sequences::Table) -> DbResult<SequencesRecord> {
        Ok(sequences_table
            .get(&())?
            .map(|g| g.value())
            .unwrap_or_default())
    }

    fn update_stats_tx(
        stats_table: &mut stats::Table,
        f: impl FnOnce(&mut crate::StatsRecord),
    ) -> DbResult<()> {
        let mut stats = stats_table.get(&())?.map(|g| g.value()).unwrap_or_default();
        f(&mut stats);
        stats_table.insert(&(), &stats)?;
        Ok(())
    }
}

//! Follower counts for profile pages
use std::sync::Arc;

use sled::Tree;
use sled::transaction::{ConflictableTransactionResult, Transactional};
use tracing::debug;

use crate::config::RetryPolicy;
use crate::error::{MarketError, Result, ValidationError};
use crate::store::{compound_key, compound_prefix};
use crate::utils::retry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProfileStats {
    pub followers: u64,
    pub following: u64,
    pub is_following: bool, // whether the viewer follows the target
}

/// Anything that can aggregate follow counts for a user.
pub trait ProfileStatsSource: Send + Sync {
    fn fetch(&self, target_user_id: &str, viewer_id: Option<&str>) -> anyhow::Result<ProfileStats>;
}

pub struct ProfileStatsGateway {
    source: Arc<dyn ProfileStatsSource>,
    retry: RetryPolicy,
}

impl ProfileStatsGateway {
    pub fn new(source: Arc<dyn ProfileStatsSource>, retry: RetryPolicy) -> Self {
        Self { source, retry }
    }

    pub fn get_profile_stats(&self, target_user_id: &str, viewer_id: Option<&str>) -> Result<ProfileStats> {
        let stats = retry(&self.retry, "profile stats", || {
            self.source.fetch(target_user_id, viewer_id)
        })
        .map_err(MarketError::Io)?;

        debug!(target_user_id, followers = stats.followers, "profile stats fetched");
        Ok(stats)
    }
}

/// Follow edges kept in both directions so either count is a prefix scan.
#[derive(Clone)]
pub struct FollowGraph {
    follows: Tree,
    followers: Tree,
}

impl FollowGraph {
    pub fn new(follows: Tree, followers: Tree) -> Self {
        Self { follows, followers }
    }

    pub fn follow(&self, follower_id: &str, target_id: &str) -> Result<()> {
        if follower_id == target_id {
            return Err(ValidationError::SelfFollow.into());
        }
        let forward = compound_key(&[follower_id, target_id]);
        let backward = compound_key(&[target_id, follower_id]);

        Ok((&self.follows, &self.followers).transaction(
            |(follows, followers)| -> ConflictableTransactionResult<(), MarketError> {
                follows.insert(forward.clone(), Vec::<u8>::new())?;
                followers.insert(backward.clone(), Vec::<u8>::new())?;
                Ok(())
            },
        )?)
    }

    pub fn unfollow(&self, follower_id: &str, target_id: &str) -> Result<()> {
        let forward = compound_key(&[follower_id, target_id]);
        let backward = compound_key(&[target_id, follower_id]);

        Ok((&self.follows, &self.followers).transaction(
            |(follows, followers)| -> ConflictableTransactionResult<(), MarketError> {
                follows.remove(forward.clone())?;
                followers.remove(backward.clone())?;
                Ok(())
            },
        )?)
    }
}

impl ProfileStatsSource for FollowGraph {
    fn fetch(&self, target_user_id: &str, viewer_id: Option<&str>) -> anyhow::Result<ProfileStats> {
        let followers = self
            .followers
            .scan_prefix(compound_prefix(&[target_user_id]))
            .keys()
            .try_fold(0u64, |n, key| key.map(|_| n + 1))?;
        let following = self
            .follows
            .scan_prefix(compound_prefix(&[target_user_id]))
            .keys()
            .try_fold(0u64, |n, key| key.map(|_| n + 1))?;
        let is_following = match viewer_id {
            Some(viewer) => self
                .follows
                .contains_key(compound_key(&[viewer, target_user_id]))?,
            None => false,
        };

        Ok(ProfileStats {
            followers,
            following,
            is_following,
        })
    }
}

//! Account & membership registry.
//!
//! Owns accounts (tier, subscriptions, feature flags), teams, memberships and invites, and
//! resolves the capabilities a user holds over a project given the project's [`Owner`].
//!
//! Each team is its own serialization unit: membership changes and invite acceptance take the
//! team's lock, so the "at least one Owner" invariant and exactly-once invite consumption are
//! checked and applied atomically.

mod teams;

pub use teams::{Team, TeamInvite};

use crate::api::models::users::{AccountTier, Subscription, SubscriptionRequest, SubscriptionType, UserResponse};
use crate::errors::{Error, Result};
use crate::types::{Capabilities, Capability, TeamId, UserId, abbrev_uuid, all_capabilities};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;
use uuid::Uuid;

/// Who a project belongs to. A project always has exactly one owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Owner {
    User(UserId),
    Team(TeamId),
}

/// One append-only subscription record. Later records for the same id supersede earlier ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRecord {
    pub id: String,
    pub r#type: SubscriptionType,
    pub quantity: i32,
    pub created_at: DateTime<Utc>,
    /// End of the validity window; `None` while the subscription is open-ended
    pub valid_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct Account {
    pub id: UserId,
    pub name: String,
    pub key: String,
    pub tier: AccountTier,
    pub subscriptions: Vec<SubscriptionRecord>,
    pub flags: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
}

impl Account {
    /// The latest record of every subscription id whose window contains `now`.
    pub fn effective_subscriptions(&self, now: DateTime<Utc>) -> Vec<Subscription> {
        let mut ids: Vec<&str> = Vec::new();
        for record in &self.subscriptions {
            if !ids.contains(&record.id.as_str()) {
                ids.push(&record.id);
            }
        }

        ids.into_iter()
            .filter_map(|id| {
                let mut records = self.subscriptions.iter().filter(|r| r.id == id);
                let first = records.next()?;
                let latest = records.last().unwrap_or(first);
                let live = latest.quantity > 0 && latest.valid_until.is_none_or(|until| until > now);
                live.then(|| Subscription {
                    id: latest.id.clone(),
                    r#type: latest.r#type,
                    quantity: latest.quantity,
                    created_at: first.created_at,
                    updated_at: latest.created_at,
                })
            })
            .collect()
    }

    /// Extra dedicated database instances bought on top of the tier allowance.
    pub fn rds_quantity(&self, now: DateTime<Utc>) -> u32 {
        self.effective_subscriptions(now)
            .iter()
            .filter(|s| s.r#type == SubscriptionType::Rds)
            .map(|s| s.quantity.max(0) as u32)
            .sum()
    }

    pub fn to_response(&self) -> UserResponse {
        UserResponse {
            id: self.id,
            name: self.name.clone(),
            key: self.key.clone(),
            account_tier: self.tier,
            subscriptions: self.effective_subscriptions(Utc::now()),
            flags: (!self.flags.is_empty()).then(|| self.flags.iter().cloned().collect()),
        }
    }
}

pub struct AccountRegistry {
    accounts: DashMap<UserId, Account>,
    keys: DashMap<String, UserId>,
    teams: DashMap<TeamId, Arc<Mutex<Team>>>,
    invite_index: DashMap<Uuid, TeamId>,
    invite_ttl: Duration,
}

impl AccountRegistry {
    pub fn new(invite_ttl: Duration) -> Self {
        Self {
            accounts: DashMap::new(),
            keys: DashMap::new(),
            teams: DashMap::new(),
            invite_index: DashMap::new(),
            invite_ttl,
        }
    }

    #[instrument(skip(self, name), err)]
    pub fn create_account(&self, name: &str, tier: AccountTier) -> Result<UserResponse> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::validation("Account name must not be empty"));
        }

        let account = Account {
            id: Uuid::new_v4(),
            name: name.to_string(),
            key: format!("dh_{}", Uuid::new_v4().simple()),
            tier,
            subscriptions: Vec::new(),
            flags: BTreeSet::new(),
            created_at: Utc::now(),
        };
        let response = account.to_response();
        self.keys.insert(account.key.clone(), account.id);
        self.accounts.insert(account.id, account);

        tracing::info!(user_id = %abbrev_uuid(&response.id), tier = %tier, "Account created");
        Ok(response)
    }

    pub fn account(&self, user: UserId) -> Result<Account> {
        self.accounts
            .get(&user)
            .map(|a| a.clone())
            .ok_or_else(|| Error::not_found("Account", user))
    }

    pub fn user_response(&self, user: UserId) -> Result<UserResponse> {
        Ok(self.account(user)?.to_response())
    }

    pub fn exists(&self, user: UserId) -> bool {
        self.accounts.contains_key(&user)
    }

    pub fn tier(&self, user: UserId) -> Result<AccountTier> {
        Ok(self.account(user)?.tier)
    }

    /// Resolve an API key to its account.
    pub fn account_by_key(&self, key: &str) -> Result<UserId> {
        self.keys
            .get(key)
            .map(|id| *id)
            .ok_or_else(|| Error::not_found("Account", "<api key>"))
    }

    #[instrument(skip(self), fields(user_id = %abbrev_uuid(&user)), err)]
    pub fn set_tier(&self, user: UserId, tier: AccountTier) -> Result<UserResponse> {
        let mut account = self.accounts.get_mut(&user).ok_or_else(|| Error::not_found("Account", user))?;
        let previous = account.tier;
        account.tier = tier;
        tracing::info!(from = %previous, to = %tier, "Account tier changed");
        Ok(account.to_response())
    }

    /// Append a subscription record. Quantity 0 cancels the subscription from now on.
    #[instrument(skip(self, request), fields(user_id = %abbrev_uuid(&user), subscription_id = %request.id), err)]
    pub fn add_subscription(
        &self,
        user: UserId,
        request: SubscriptionRequest,
        valid_until: Option<DateTime<Utc>>,
    ) -> Result<UserResponse> {
        if request.id.trim().is_empty() {
            return Err(Error::validation("Subscription id must not be empty"));
        }
        if request.quantity < 0 {
            return Err(Error::validation("Subscription quantity must not be negative"));
        }

        let mut account = self.accounts.get_mut(&user).ok_or_else(|| Error::not_found("Account", user))?;
        let type_changed = account
            .subscriptions
            .iter()
            .any(|s| s.id == request.id && s.r#type != request.r#type);
        if type_changed {
            return Err(Error::validation(format!(
                "Subscription {} cannot change type once created",
                request.id
            )));
        }

        account.subscriptions.push(SubscriptionRecord {
            id: request.id,
            r#type: request.r#type,
            quantity: request.quantity,
            created_at: Utc::now(),
            valid_until,
        });
        Ok(account.to_response())
    }

    pub fn add_flag(&self, user: UserId, flag: &str) -> Result<UserResponse> {
        let flag = flag.trim();
        if flag.is_empty() {
            return Err(Error::validation("Feature flag must not be empty"));
        }
        let mut account = self.accounts.get_mut(&user).ok_or_else(|| Error::not_found("Account", user))?;
        account.flags.insert(flag.to_string());
        Ok(account.to_response())
    }

    pub fn remove_flag(&self, user: UserId, flag: &str) -> Result<UserResponse> {
        let mut account = self.accounts.get_mut(&user).ok_or_else(|| Error::not_found("Account", user))?;
        account.flags.remove(flag.trim());
        Ok(account.to_response())
    }

    /// Capabilities `user` holds over a project owned by `owner`.
    pub fn capabilities(&self, user: UserId, owner: &Owner) -> Result<Capabilities> {
        let tier = self.tier(user)?;

        let mut caps = match owner {
            Owner::User(owner_id) if *owner_id == user => all_capabilities(),
            Owner::User(_) => Capabilities::new(),
            Owner::Team(team_id) => match self.team_role(*team_id, user) {
                Some(role) => teams::role_capabilities(role),
                None => Capabilities::new(),
            },
        };

        match tier {
            AccountTier::Admin => caps.extend(Capability::ALL),
            AccountTier::Employee => {
                caps.insert(Capability::Read);
            }
            _ => {}
        }

        Ok(caps)
    }

    /// Fail with [`Error::InsufficientPermissions`] unless `user` holds `required` over `owner`'s project.
    pub fn authorize(&self, user: UserId, owner: &Owner, required: Capability, resource: &str) -> Result<()> {
        if self.capabilities(user, owner)?.contains(&required) {
            Ok(())
        } else {
            tracing::debug!(
                user_id = %abbrev_uuid(&user),
                required = %required,
                resource,
                "Authorization denied"
            );
            Err(Error::InsufficientPermissions {
                required,
                resource: resource.to_string(),
            })
        }
    }
}

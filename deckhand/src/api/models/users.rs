//! API request/response models for accounts and subscriptions.

use crate::types::UserId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum AccountTier {
    Basic,
    /// Time-limited trial of the Pro tier
    ProTrial,
    /// A basic user that is pending a payment
    PendingPaymentPro,
    CancelledPro,
    Pro,
    Growth,
    /// Higher limits and partial admin access
    Employee,
    /// Unlimited resources, full API access
    Admin,
}

impl AccountTier {
    pub const ALL: [AccountTier; 8] = [
        AccountTier::Basic,
        AccountTier::ProTrial,
        AccountTier::PendingPaymentPro,
        AccountTier::CancelledPro,
        AccountTier::Pro,
        AccountTier::Growth,
        AccountTier::Employee,
        AccountTier::Admin,
    ];

    /// Position in the tier ordering. ProTrial, PendingPaymentPro and CancelledPro share a level.
    pub fn level(&self) -> u8 {
        match self {
            AccountTier::Basic => 0,
            AccountTier::ProTrial | AccountTier::PendingPaymentPro | AccountTier::CancelledPro => 1,
            AccountTier::Pro => 2,
            AccountTier::Growth => 3,
            AccountTier::Employee => 4,
            AccountTier::Admin => 5,
        }
    }

    /// Employee and Admin are privilege overrides rather than billing tiers.
    pub fn is_override(&self) -> bool {
        matches!(self, AccountTier::Employee | AccountTier::Admin)
    }
}

impl fmt::Display for AccountTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AccountTier::Basic => "basic",
            AccountTier::ProTrial => "protrial",
            AccountTier::PendingPaymentPro => "pendingpaymentpro",
            AccountTier::CancelledPro => "cancelledpro",
            AccountTier::Pro => "pro",
            AccountTier::Growth => "growth",
            AccountTier::Employee => "employee",
            AccountTier::Admin => "admin",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionType {
    Pro,
    Rds,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Subscription {
    pub id: String,
    #[serde(rename = "type")]
    pub r#type: SubscriptionType,
    pub quantity: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct SubscriptionRequest {
    pub id: String,
    #[serde(rename = "type")]
    pub r#type: SubscriptionType,
    pub quantity: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct UserResponse {
    #[schema(value_type = String, format = "uuid")]
    pub id: UserId,
    pub name: String,
    pub key: String,
    pub account_tier: AccountTier,
    pub subscriptions: Vec<Subscription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flags: Option<Vec<String>>,
}

//! Entitlement Module
//!
//! Access grants held by a tenant, from either recurring billing or a one-time license
//! key, and the resolver that picks the single effective grant.
//!
//! ## Design Principles
//!
//! 1. **Single Source of Truth**: `resolve()` is THE function that decides which grant applies
//! 2. **Deterministic**: Same inputs always produce same outputs, ties included
//! 3. **Revocation dominates**: one revoked grant denies access outright

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::tenant::TenantId;

/// Where a grant came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EntitlementSource {
    RecurringBilling,
    OneTimeKey,
}

impl std::fmt::Display for EntitlementSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntitlementSource::RecurringBilling => write!(f, "recurring_billing"),
            EntitlementSource::OneTimeKey => write!(f, "one_time_key"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Entitlement {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub plan_code: String,
    pub source: EntitlementSource,
    #[serde(with = "time::serde::timestamp")]
    pub starts_at: OffsetDateTime,
    /// `None` never expires
    #[serde(with = "time::serde::timestamp::option")]
    pub ends_at: Option<OffsetDateTime>,
    /// Once set, never cleared
    #[serde(with = "time::serde::timestamp::option")]
    pub revoked_at: Option<OffsetDateTime>,
}

impl Entitlement {
    pub fn recurring(
        tenant_id: TenantId,
        plan_code: impl Into<String>,
        starts_at: OffsetDateTime,
        ends_at: OffsetDateTime,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            plan_code: plan_code.into(),
            source: EntitlementSource::RecurringBilling,
            starts_at,
            ends_at: Some(ends_at),
            revoked_at: None,
        }
    }

    pub fn one_time_key(
        tenant_id: TenantId,
        plan_code: impl Into<String>,
        starts_at: OffsetDateTime,
        ends_at: Option<OffsetDateTime>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            plan_code: plan_code.into(),
            source: EntitlementSource::OneTimeKey,
            starts_at,
            ends_at,
            revoked_at: None,
        }
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }

    /// Not revoked and not yet expired at `now`
    pub fn is_live(&self, now: OffsetDateTime) -> bool {
        !self.is_revoked() && self.ends_at.map_or(true, |ends_at| ends_at > now)
    }
}

/// Outcome of resolving a tenant's grants
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Resolution {
    /// The grant access is derived from
    Effective { entitlement: Entitlement },
    /// A revoked grant denies access regardless of the rest of the set
    Revoked {
        entitlement_id: Uuid,
        #[serde(with = "time::serde::timestamp")]
        revoked_at: OffsetDateTime,
    },
    /// Nothing live
    NoGrant,
}

impl Resolution {
    pub fn effective(&self) -> Option<&Entitlement> {
        match self {
            Resolution::Effective { entitlement } => Some(entitlement),
            _ => None,
        }
    }

    pub fn is_revoked(&self) -> bool {
        matches!(self, Resolution::Revoked { .. })
    }
}

/// Pick the effective entitlement at `now`
///
/// Any revoked grant denies outright. Otherwise non-expiring grants beat expiring ones,
/// and among expiring grants the furthest `ends_at` wins. Ties fall back to the earliest
/// `starts_at`, then the smallest id.
pub fn resolve<'a, I>(entitlements: I, now: OffsetDateTime) -> Resolution
where
    I: IntoIterator<Item = &'a Entitlement>,
{
    let entitlements: Vec<&Entitlement> = entitlements.into_iter().collect();

    if let Some(revoked) = entitlements
        .iter()
        .filter(|e| e.is_revoked())
        .min_by_key(|e| (e.revoked_at, e.id))
    {
        if let Some(revoked_at) = revoked.revoked_at {
            return Resolution::Revoked {
                entitlement_id: revoked.id,
                revoked_at,
            };
        }
    }

    let best = entitlements
        .into_iter()
        .filter(|e| e.is_live(now))
        .max_by(|a, b| {
            rank(a)
                .cmp(&rank(b))
                .then_with(|| b.starts_at.cmp(&a.starts_at))
                .then_with(|| b.id.cmp(&a.id))
        });

    match best {
        Some(entitlement) => Resolution::Effective {
            entitlement: entitlement.clone(),
        },
        None => Resolution::NoGrant,
    }
}

/// Ordering key: non-expiring above everything, then later expiry above earlier
fn rank(entitlement: &Entitlement) -> (bool, Option<OffsetDateTime>) {
    (entitlement.ends_at.is_none(), entitlement.ends_at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    fn now() -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_750_000_000).unwrap()
    }

    fn tenant() -> TenantId {
        TenantId(Uuid::nil())
    }

    #[test]
    fn test_empty_set_has_no_grant() {
        let none: Vec<Entitlement> = Vec::new();
        assert_eq!(resolve(&none, now()), Resolution::NoGrant);
    }

    #[test]
    fn test_non_expiring_beats_expiring() {
        let lifetime = Entitlement::one_time_key(tenant(), "lifetime", now(), None);
        let monthly = Entitlement::recurring(
            tenant(),
            "team",
            now() - Duration::days(1),
            now() + Duration::days(365),
        );

        let resolution = resolve(&[monthly, lifetime.clone()], now());
        assert_eq!(resolution.effective(), Some(&lifetime));
    }

    #[test]
    fn test_furthest_expiry_wins() {
        let short = Entitlement::recurring(tenant(), "team", now(), now() + Duration::days(3));
        let long = Entitlement::recurring(tenant(), "team", now(), now() + Duration::days(30));

        let resolution = resolve(&[short, long.clone()], now());
        assert_eq!(resolution.effective(), Some(&long));
    }

    #[test]
    fn test_revocation_dominates_everything() {
        let lifetime = Entitlement::one_time_key(tenant(), "lifetime", now(), None);
        let mut revoked =
            Entitlement::recurring(tenant(), "team", now(), now() - Duration::days(60));
        revoked.revoked_at = Some(now() - Duration::days(90));

        let resolution = resolve(&[lifetime, revoked.clone()], now());
        assert!(resolution.is_revoked());
        assert!(resolution.effective().is_none());
        assert_eq!(
            resolution,
            Resolution::Revoked {
                entitlement_id: revoked.id,
                revoked_at: now() - Duration::days(90),
            }
        );
    }

    #[test]
    fn test_expired_grants_are_ignored() {
        let expired = Entitlement::recurring(
            tenant(),
            "team",
            now() - Duration::days(30),
            now() - Duration::seconds(1),
        );
        let exactly_now = Entitlement::recurring(tenant(), "team", now(), now());

        assert_eq!(resolve(&[expired, exactly_now], now()), Resolution::NoGrant);
    }

    #[test]
    fn test_tie_break_is_deterministic() {
        let mut first = Entitlement::one_time_key(tenant(), "lifetime", now(), None);
        let mut second = Entitlement::one_time_key(tenant(), "lifetime", now(), None);
        first.id = Uuid::from_u128(1);
        second.id = Uuid::from_u128(2);

        let a = resolve(&[first.clone(), second.clone()], now());
        let b = resolve(&[second, first.clone()], now());
        assert_eq!(a, b);
        assert_eq!(a.effective().map(|e| e.id), Some(first.id));
    }

    #[test]
    fn test_is_live() {
        let mut grant = Entitlement::recurring(tenant(), "team", now(), now() + Duration::hours(1));
        assert!(grant.is_live(now()));
        assert!(!grant.is_live(now() + Duration::hours(1)));
        grant.revoked_at = Some(now());
        assert!(!grant.is_live(now()));
    }
}

//! Date and proration calculator
//!
//! Pure functions. Every function that depends on the current time takes it
//! as a parameter so results are reproducible.

use serde::Serialize;
use shopsub_shared::PlanType;
use time::{Duration, OffsetDateTime};

use crate::models::Subscription;

pub const TRIAL_LENGTH_DAYS: i64 = 14;
pub const MONTHLY_LENGTH_DAYS: i64 = 30;
pub const YEARLY_LENGTH_DAYS: i64 = 365;

/// Extra days granted when moving from monthly to yearly
pub const MONTHLY_TO_YEARLY_BONUS_DAYS: i64 = 30;

const SECONDS_PER_DAY: i64 = 86_400;

pub fn plan_length_days(plan_type: PlanType) -> i64 {
    match plan_type {
        PlanType::Trial => TRIAL_LENGTH_DAYS,
        PlanType::Monthly => MONTHLY_LENGTH_DAYS,
        PlanType::Yearly => YEARLY_LENGTH_DAYS,
    }
}

pub fn calculate_end_date(plan_type: PlanType, start_date: OffsetDateTime) -> OffsetDateTime {
    start_date + Duration::days(plan_length_days(plan_type))
}

/// End date for a plan type read from storage.
///
/// Unknown plan types get the trial length. New input never reaches this
/// path because plan types are validated when requests are parsed.
pub fn calculate_end_date_from_stored(raw_plan_type: &str, start_date: OffsetDateTime) -> OffsetDateTime {
    calculate_end_date(PlanType::parse_lenient(raw_plan_type), start_date)
}

/// Whole days left until `end_date`, rounded up. Zero once it has passed.
pub fn days_remaining(end_date: Option<OffsetDateTime>, now: OffsetDateTime) -> i64 {
    let Some(end) = end_date else {
        return 0;
    };
    let seconds = (end - now).whole_seconds();
    if seconds <= 0 {
        return 0;
    }
    (seconds + SECONDS_PER_DAY - 1) / SECONDS_PER_DAY
}

pub fn subscription_days_remaining(subscription: &Subscription, now: OffsetDateTime) -> i64 {
    days_remaining(subscription.dates.end_date, now)
}

/// Share of the current period already consumed, 0.0 to 100.0
pub fn percentage_used(
    period_start: OffsetDateTime,
    end_date: Option<OffsetDateTime>,
    now: OffsetDateTime,
) -> f64 {
    let Some(end) = end_date else {
        return 100.0;
    };
    let total = (end - period_start).whole_seconds();
    if total <= 0 {
        return 100.0;
    }
    let elapsed = (now - period_start).whole_seconds().clamp(0, total);
    let pct = elapsed as f64 * 100.0 / total as f64;
    (pct * 100.0).round() / 100.0
}

/// Outcome of moving a subscription onto a (possibly identical) plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Proration {
    #[serde(with = "time::serde::rfc3339")]
    pub end_date: OffsetDateTime,
    /// Unused days carried over from the current period
    pub credited_days: i64,
    pub bonus_days: i64,
}

impl Proration {
    /// Days granted beyond a fresh cycle of the new plan
    pub fn carried_entitlement(&self) -> i64 {
        self.credited_days + self.bonus_days
    }
}

/// Compute the new end date when switching from `current_plan` to `new_plan`.
///
/// Remaining days are credited on top of the new plan's cycle unless the
/// change is a downgrade. Monthly to yearly adds a fixed bonus. Downgrades and
/// periods with nothing left start fresh from `now`.
pub fn prorate(
    current_plan: PlanType,
    current_end: Option<OffsetDateTime>,
    new_plan: PlanType,
    now: OffsetDateTime,
) -> Proration {
    let fresh_end = calculate_end_date(new_plan, now);
    let remaining = days_remaining(current_end, now);
    let is_downgrade = new_plan.rank() < current_plan.rank();

    if remaining == 0 || is_downgrade {
        return Proration {
            end_date: fresh_end,
            credited_days: 0,
            bonus_days: 0,
        };
    }

    let bonus_days = if current_plan == PlanType::Monthly && new_plan == PlanType::Yearly {
        MONTHLY_TO_YEARLY_BONUS_DAYS
    } else {
        0
    };

    Proration {
        end_date: fresh_end + Duration::days(remaining + bonus_days),
        credited_days: remaining,
        bonus_days,
    }
}

pub fn prorate_on_plan_change(
    current: &Subscription,
    new_plan: PlanType,
    now: OffsetDateTime,
) -> Proration {
    prorate(current.plan.plan_type, current.dates.end_date, new_plan, now)
}

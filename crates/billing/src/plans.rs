//! Plan catalog
//!
//! Read-only lookup of the plans a shop can subscribe to. The catalog is built
//! once from configuration and shared; nothing mutates it at runtime.

use serde::Serialize;
use shopsub_shared::PlanType;

use crate::error::{BillingError, BillingResult};
use crate::models::PlanSnapshot;
use crate::proration::plan_length_days;

/// Resource limits bundled with a plan. `None` means unlimited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanLimits {
    pub max_products: Option<u32>,
    pub max_users: Option<u32>,
    pub max_locations: Option<u32>,
}

/// Subscription plan configuration
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanDefinition {
    #[serde(rename = "type")]
    pub plan_type: PlanType,
    pub name: String,
    pub base_price: i64,
    pub currency: String,
    pub billing_cycle_days: i64,
    pub trial_days: i64,
    pub features: Vec<String>,
    pub limits: PlanLimits,
    pub active: bool,
}

impl PlanDefinition {
    /// Trial: 14 days free, 1 location, 2 users, 100 products
    pub fn trial(currency: &str) -> Self {
        Self {
            plan_type: PlanType::Trial,
            name: "Free Trial".to_string(),
            base_price: 0,
            currency: currency.to_string(),
            billing_cycle_days: plan_length_days(PlanType::Trial),
            trial_days: plan_length_days(PlanType::Trial),
            features: vec!["pos".to_string(), "inventory".to_string()],
            limits: PlanLimits {
                max_products: Some(100),
                max_users: Some(2),
                max_locations: Some(1),
            },
            active: true,
        }
    }

    /// Monthly: every feature, 5 users, unlimited products
    pub fn monthly(price: i64, currency: &str) -> Self {
        Self {
            plan_type: PlanType::Monthly,
            name: "Monthly".to_string(),
            base_price: price,
            currency: currency.to_string(),
            billing_cycle_days: plan_length_days(PlanType::Monthly),
            trial_days: 0,
            features: vec![
                "pos".to_string(),
                "inventory".to_string(),
                "debt_tracking".to_string(),
                "reports".to_string(),
            ],
            limits: PlanLimits {
                max_products: None,
                max_users: Some(5),
                max_locations: Some(2),
            },
            active: true,
        }
    }

    /// Yearly: every feature, unlimited everything
    pub fn yearly(price: i64, currency: &str) -> Self {
        Self {
            plan_type: PlanType::Yearly,
            name: "Yearly".to_string(),
            base_price: price,
            currency: currency.to_string(),
            billing_cycle_days: plan_length_days(PlanType::Yearly),
            trial_days: 0,
            features: vec![
                "pos".to_string(),
                "inventory".to_string(),
                "debt_tracking".to_string(),
                "reports".to_string(),
                "priority_support".to_string(),
            ],
            limits: PlanLimits {
                max_products: None,
                max_users: None,
                max_locations: None,
            },
            active: true,
        }
    }

    pub fn snapshot(&self) -> PlanSnapshot {
        PlanSnapshot {
            plan_type: self.plan_type,
            name: self.name.clone(),
            base_price: self.base_price,
            currency: self.currency.clone(),
            billing_cycle_days: self.billing_cycle_days,
        }
    }

    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.iter().any(|f| f == feature)
    }
}

#[derive(Debug, Clone)]
pub struct PlanCatalog {
    plans: Vec<PlanDefinition>,
}

impl PlanCatalog {
    pub fn new(plans: Vec<PlanDefinition>) -> Self {
        Self { plans }
    }

    /// Standard three-plan catalog
    pub fn with_prices(monthly_price: i64, yearly_price: i64, currency: &str) -> Self {
        Self::new(vec![
            PlanDefinition::trial(currency),
            PlanDefinition::monthly(monthly_price, currency),
            PlanDefinition::yearly(yearly_price, currency),
        ])
    }

    pub fn get_plan(&self, plan_type: PlanType) -> BillingResult<&PlanDefinition> {
        self.plans
            .iter()
            .find(|p| p.plan_type == plan_type && p.active)
            .ok_or_else(|| BillingError::PlanNotFound(plan_type.to_string()))
    }

    /// Look up a plan by its request-supplied name
    pub fn get_plan_by_name(&self, raw: &str) -> BillingResult<&PlanDefinition> {
        let plan_type: PlanType = raw
            .parse()
            .map_err(|_| BillingError::PlanNotFound(raw.to_string()))?;
        self.get_plan(plan_type)
    }

    pub fn list_active_plans(&self) -> Vec<&PlanDefinition> {
        self.plans.iter().filter(|p| p.active).collect()
    }
}

impl Default for PlanCatalog {
    fn default() -> Self {
        Self::with_prices(25_000, 250_000, "TZS")
    }
}

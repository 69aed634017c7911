use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingType {
    PerUnit,
    PerToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingUnit {
    Second,
    Piece,
    Token,
}

/// One row of the pricing table, keyed by task type in `motif-pricing`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingRow {
    pub billing_type: BillingType,
    /// Minor units per unit.
    pub unit_price: i64,
    pub unit: BillingUnit,
    /// Floor applied to billable usage before pricing.
    pub min_unit: f64,
}

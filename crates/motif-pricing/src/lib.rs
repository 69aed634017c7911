//! Component B — pure `(task type, usage) -> cost` pricing.
//!
//! Pricing is immutable over the lifetime of a task: the value computed
//! at creation is the pre-charge amount, and if the task completes with
//! the same usage it is also the settled amount.

use std::collections::HashMap;

use motif_types::{BillingType, EngineError, EngineResult, PricingRow, TaskType};

#[derive(Debug, Clone)]
pub struct PricingTable {
    rows: HashMap<TaskType, PricingRow>,
}

impl PricingTable {
    pub fn new(rows: HashMap<TaskType, PricingRow>) -> Self {
        Self { rows }
    }

    /// Reasonable built-in defaults; callers may override via
    /// `motif-config`'s layered store.
    pub fn with_defaults() -> Self {
        use motif_types::BillingUnit;
        let mut rows = HashMap::new();
        rows.insert(
            TaskType::VideoMotion,
            PricingRow {
                billing_type: BillingType::PerUnit,
                unit_price: 200,
                unit: BillingUnit::Second,
                min_unit: 1.0,
            },
        );
        rows.insert(
            TaskType::VideoLipsync,
            PricingRow {
                billing_type: BillingType::PerUnit,
                unit_price: 250,
                unit: BillingUnit::Second,
                min_unit: 1.0,
            },
        );
        rows.insert(
            TaskType::AudioTts,
            PricingRow {
                billing_type: BillingType::PerToken,
                unit_price: 5,
                unit: BillingUnit::Token,
                min_unit: 1.0,
            },
        );
        rows.insert(
            TaskType::Img2img,
            PricingRow {
                billing_type: BillingType::PerUnit,
                unit_price: 100,
                unit: BillingUnit::Piece,
                min_unit: 1.0,
            },
        );
        Self { rows }
    }

    pub fn row(&self, task_type: TaskType) -> EngineResult<&PricingRow> {
        self.rows
            .get(&task_type)
            .ok_or_else(|| EngineError::PricingUnavailable(task_type.as_str().to_string()))
    }

    /// `cost = ceil(max(usage, minUnit) * unitPrice)`.
    pub fn price(&self, task_type: TaskType, usage: f64) -> EngineResult<i64> {
        let row = self.row(task_type)?;
        let billable = usage.max(row.min_unit);
        Ok((billable * row.unit_price as f64).ceil() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prices_floor_usage_to_min_unit() {
        let table = PricingTable::with_defaults();
        let cost = table.price(TaskType::VideoMotion, 0.2).unwrap();
        assert_eq!(cost, 200);
    }

    #[test]
    fn prices_ceil_fractional_cost() {
        let table = PricingTable::with_defaults();
        let cost = table.price(TaskType::AudioTts, 3.1).unwrap();
        assert_eq!(cost, 16);
    }

    #[test]
    fn unconfigured_type_is_pricing_unavailable() {
        let table = PricingTable::new(HashMap::new());
        let err = table.price(TaskType::VideoMotion, 5.0).unwrap_err();
        assert!(matches!(err, EngineError::PricingUnavailable(_)));
    }
}

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use utoipa::ToSchema;

use crate::config::TaxConfig;
use crate::errors::ServiceError;

/// One taxable line: the product category and its line total.
#[derive(Debug, Clone)]
pub struct TaxLine {
    pub category: String,
    pub amount: Decimal,
}

#[derive(Debug, Clone)]
pub struct TaxRequest {
    pub lines: Vec<TaxLine>,
    pub subtotal: Decimal,
    pub shipping_fee: Decimal,
    pub shipping_state: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SupplyType {
    IntraState,
    InterState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct TaxLineBreakdown {
    pub category: String,
    pub taxable_amount: Decimal,
    pub rate: Decimal,
    pub tax_amount: Decimal,
}

/// Stored verbatim on the order as `tax_breakdown`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct TaxBreakdown {
    pub supply_type: SupplyType,
    pub cgst: Decimal,
    pub sgst: Decimal,
    pub igst: Decimal,
    pub lines: Vec<TaxLineBreakdown>,
}

#[derive(Debug, Clone)]
pub struct TaxResult {
    pub total_tax_amount: Decimal,
    pub tax_breakdown: TaxBreakdown,
    /// Subtotal plus tax plus shipping.
    pub final_total: Decimal,
}

pub trait TaxEngine: Send + Sync {
    fn calculate(&self, request: &TaxRequest) -> Result<TaxResult, ServiceError>;
}

fn round_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// GST-style engine: category rates, CGST+SGST inside the origin state, IGST across states.
#[derive(Debug, Clone)]
pub struct GstTaxEngine {
    default_rate: Decimal,
    origin_state: String,
    category_rates: HashMap<String, Decimal>,
}

impl GstTaxEngine {
    pub fn new(config: &TaxConfig) -> Self {
        Self {
            default_rate: config.default_rate,
            origin_state: config.origin_state.trim().to_lowercase(),
            category_rates: config
                .category_rates
                .iter()
                .map(|(category, rate)| (category.trim().to_lowercase(), *rate))
                .collect(),
        }
    }

    fn rate_for(&self, category: &str) -> Decimal {
        self.category_rates
            .get(&category.trim().to_lowercase())
            .copied()
            .unwrap_or(self.default_rate)
    }
}

impl TaxEngine for GstTaxEngine {
    fn calculate(&self, request: &TaxRequest) -> Result<TaxResult, ServiceError> {
        let state = request.shipping_state.trim();
        if state.is_empty() {
            return Err(ServiceError::MissingShippingState);
        }

        let lines: Vec<TaxLineBreakdown> = request
            .lines
            .iter()
            .map(|line| {
                let rate = self.rate_for(&line.category);
                TaxLineBreakdown {
                    category: line.category.clone(),
                    taxable_amount: line.amount,
                    rate,
                    tax_amount: round_money(line.amount * rate),
                }
            })
            .collect();

        let total_tax: Decimal = lines.iter().map(|l| l.tax_amount).sum();

        let breakdown = if state.to_lowercase() == self.origin_state {
            let cgst = round_money(total_tax / Decimal::TWO);
            TaxBreakdown {
                supply_type: SupplyType::IntraState,
                cgst,
                sgst: total_tax - cgst,
                igst: Decimal::ZERO,
                lines,
            }
        } else {
            TaxBreakdown {
                supply_type: SupplyType::InterState,
                cgst: Decimal::ZERO,
                sgst: Decimal::ZERO,
                igst: total_tax,
                lines,
            }
        };

        Ok(TaxResult {
            total_tax_amount: total_tax,
            tax_breakdown: breakdown,
            final_total: request.subtotal + total_tax + request.shipping_fee,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rust_decimal_macros::dec;

    fn engine() -> GstTaxEngine {
        let mut config = TaxConfig::default();
        config.origin_state = "Karnataka".into();
        config.category_rates.insert("Books".into(), dec!(0.05));
        GstTaxEngine::new(&config)
    }

    fn request(state: &str, lines: Vec<(&str, Decimal)>) -> TaxRequest {
        let lines: Vec<TaxLine> = lines
            .into_iter()
            .map(|(category, amount)| TaxLine {
                category: category.to_string(),
                amount,
            })
            .collect();
        TaxRequest {
            subtotal: lines.iter().map(|l| l.amount).sum(),
            lines,
            shipping_fee: dec!(50),
            shipping_state: state.to_string(),
        }
    }

    #[test]
    fn inter_state_uses_igst() {
        let result = engine()
            .calculate(&request("Maharashtra", vec![("electronics", dec!(1000))]))
            .unwrap();
        assert_eq!(result.total_tax_amount, dec!(180));
        assert_eq!(result.final_total, dec!(1230));
        assert_eq!(result.tax_breakdown.supply_type, SupplyType::InterState);
        assert_eq!(result.tax_breakdown.igst, dec!(180));
        assert_eq!(result.tax_breakdown.cgst, Decimal::ZERO);
    }

    #[test]
    fn intra_state_splits_cgst_and_sgst() {
        let result = engine()
            .calculate(&request(" karnataka ", vec![("electronics", dec!(999.99))]))
            .unwrap();
        assert_eq!(result.total_tax_amount, dec!(180.00));
        let breakdown = result.tax_breakdown;
        assert_eq!(breakdown.supply_type, SupplyType::IntraState);
        assert_eq!(breakdown.cgst + breakdown.sgst, dec!(180.00));
        assert_eq!(breakdown.igst, Decimal::ZERO);
    }

    #[test]
    fn final_total_includes_shipping_fee() {
        let mut req = request("Maharashtra", vec![("electronics", dec!(1000))]);
        req.shipping_fee = Decimal::ZERO;
        assert_eq!(engine().calculate(&req).unwrap().final_total, dec!(1180));

        req.shipping_fee = dec!(75);
        assert_eq!(engine().calculate(&req).unwrap().final_total, dec!(1255));
    }

    #[test]
    fn category_rate_overrides_default() {
        let result = engine()
            .calculate(&request(
                "Goa",
                vec![("books", dec!(200)), ("toys", dec!(100))],
            ))
            .unwrap();
        assert_eq!(result.tax_breakdown.lines[0].rate, dec!(0.05));
        assert_eq!(result.tax_breakdown.lines[1].rate, dec!(0.18));
        assert_eq!(result.total_tax_amount, dec!(28));
    }

    #[test]
    fn blank_state_is_rejected() {
        let err = engine()
            .calculate(&request("  ", vec![("toys", dec!(100))]))
            .unwrap_err();
        assert_matches!(err, ServiceError::MissingShippingState);
    }
}

use std::sync::LazyLock;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::legal::templates::Materia;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeeTier {
    /// Inclusive upper bound of `valor_estimado`; `None` on the open-ended last tier.
    pub up_to: Option<Decimal>,
    pub amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeeKind {
    Fixed {
        amount: Decimal,
    },
    Percentage {
        rate: Decimal,
        minimum: Option<Decimal>,
    },
    Tiered {
        tiers: Vec<FeeTier>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct FeeItem {
    pub code: String,
    pub materia: Materia,
    pub descripcion: String,
    #[serde(flatten)]
    pub kind: FeeKind,
}

#[derive(Debug, Deserialize)]
struct FeeScheduleConfig {
    items: Vec<RawFeeItem>,
}

#[derive(Debug, Deserialize)]
struct RawFeeItem {
    code: String,
    materia: String,
    descripcion: String,
    kind: String,
    amount: Option<Decimal>,
    rate: Option<Decimal>,
    minimum: Option<Decimal>,
    #[serde(default)]
    tiers: Vec<RawFeeTier>,
}

#[derive(Debug, Deserialize)]
struct RawFeeTier {
    up_to: Option<Decimal>,
    amount: Decimal,
}

static FEE_SCHEDULE: LazyLock<Result<Vec<FeeItem>, String>> =
    LazyLock::new(|| parse_schedule(include_str!("fee_schedule.toml")));

fn parse_kind(item: &RawFeeItem) -> Result<FeeKind, String> {
    let positive = |value: Option<Decimal>, field: &str| -> Result<Decimal, String> {
        match value {
            Some(v) if v > Decimal::ZERO => Ok(v),
            _ => Err(format!(
                "fee item '{}' needs a positive '{}'",
                item.code, field
            )),
        }
    };

    match item.kind.as_str() {
        "fixed" => Ok(FeeKind::Fixed {
            amount: positive(item.amount, "amount")?,
        }),
        "percentage" => {
            let rate = positive(item.rate, "rate")?;
            if rate > Decimal::ONE {
                return Err(format!("fee item '{}' rate exceeds 1", item.code));
            }
            Ok(FeeKind::Percentage {
                rate,
                minimum: item.minimum,
            })
        }
        "tiered" => {
            if item.tiers.is_empty() {
                return Err(format!("fee item '{}' has no tiers", item.code));
            }
            let mut tiers = Vec::with_capacity(item.tiers.len());
            let mut previous: Option<Decimal> = None;
            for (idx, tier) in item.tiers.iter().enumerate() {
                let last = idx + 1 == item.tiers.len();
                match (tier.up_to, last) {
                    (None, false) => {
                        return Err(format!(
                            "fee item '{}': only the last tier may be open ended",
                            item.code
                        ));
                    }
                    (Some(_), true) => {
                        return Err(format!(
                            "fee item '{}': last tier must be open ended",
                            item.code
                        ));
                    }
                    (Some(bound), false) => {
                        if previous.is_some_and(|prev| bound <= prev) {
                            return Err(format!(
                                "fee item '{}': tier bounds must increase",
                                item.code
                            ));
                        }
                        previous = Some(bound);
                    }
                    (None, true) => {}
                }
                tiers.push(FeeTier {
                    up_to: tier.up_to,
                    amount: tier.amount,
                });
            }
            Ok(FeeKind::Tiered { tiers })
        }
        other => Err(format!(
            "invalid fee kind '{}' for item '{}'",
            other, item.code
        )),
    }
}

fn parse_schedule(raw: &str) -> Result<Vec<FeeItem>, String> {
    let parsed: FeeScheduleConfig =
        toml::from_str(raw).map_err(|e| format!("invalid fee schedule TOML: {}", e))?;
    let mut out: Vec<FeeItem> = Vec::with_capacity(parsed.items.len());
    for item in parsed.items {
        let code = item.code.trim().to_ascii_uppercase();
        if out.iter().any(|existing| existing.code == code) {
            return Err(format!("duplicate fee item '{}'", code));
        }
        let materia = Materia::from_label(&item.materia)
            .ok_or_else(|| format!("invalid materia '{}' in fee schedule", item.materia))?;
        let kind = parse_kind(&item)?;
        out.push(FeeItem {
            code,
            materia,
            descripcion: item.descripcion,
            kind,
        });
    }
    Ok(out)
}

pub fn all_fee_items() -> Result<&'static [FeeItem], String> {
    match &*FEE_SCHEDULE {
        Ok(items) => Ok(items.as_slice()),
        Err(err) => Err(err.clone()),
    }
}

pub fn get_fee_item(code: &str) -> Result<Option<&'static FeeItem>, String> {
    let wanted = code.trim().to_ascii_uppercase();
    let items = all_fee_items()?;
    Ok(items.iter().find(|item| item.code == wanted))
}

impl FeeItem {
    /// Fee amount for a case, or `None` when the kind needs an estimated
    /// value the case does not have.
    pub fn amount_for(&self, valor_estimado: Option<Decimal>) -> Option<Decimal> {
        match &self.kind {
            FeeKind::Fixed { amount } => Some(amount.round_dp(2)),
            FeeKind::Percentage { rate, minimum } => {
                let base = valor_estimado.filter(|v| *v > Decimal::ZERO)?;
                let amount = (base * rate).round_dp(2);
                Some(match minimum {
                    Some(floor) if amount < *floor => floor.round_dp(2),
                    _ => amount,
                })
            }
            FeeKind::Tiered { tiers } => {
                let base = valor_estimado.filter(|v| *v >= Decimal::ZERO)?;
                tiers
                    .iter()
                    .find(|tier| tier.up_to.is_none_or(|bound| base <= bound))
                    .map(|tier| tier.amount.round_dp(2))
            }
        }
    }
}

/// Resolve a reference code to a total fee.
pub fn resolve_fee(code: &str, valor_estimado: Option<Decimal>) -> Result<Option<Decimal>, String> {
    Ok(get_fee_item(code)?.and_then(|item| item.amount_for(valor_estimado)))
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    #[test]
    fn bundled_schedule_parses() {
        let items = all_fee_items().expect("bundled fee schedule should parse");
        assert!(items.len() >= 4);
        for materia in [
            Materia::Civil,
            Materia::Comercial,
            Materia::Laboral,
            Materia::Familia,
        ] {
            assert!(
                items.iter().any(|item| item.materia == materia),
                "no fee items for {materia:?}"
            );
        }
    }

    #[test]
    fn fixed_fee_ignores_estimated_value() {
        assert_eq!(resolve_fee("lab-ben", None).expect("lookup"), Some(dec!(6000)));
        assert_eq!(resolve_fee(" CIV-ORD ", Some(dec!(1))).expect("lookup"), Some(dec!(8000)));
    }

    #[test]
    fn percentage_fee_applies_minimum_and_needs_value() {
        assert_eq!(resolve_fee("COM-EJE", None).expect("lookup"), None);
        assert_eq!(
            resolve_fee("COM-EJE", Some(dec!(100000))).expect("lookup"),
            Some(dec!(10000))
        );
        assert_eq!(
            resolve_fee("COM-EJE", Some(dec!(1000))).expect("lookup"),
            Some(dec!(3000))
        );
    }

    #[test]
    fn tiered_fee_picks_first_covering_tier() {
        assert_eq!(
            resolve_fee("FAM-DIV", Some(dec!(50000))).expect("lookup"),
            Some(dec!(3000))
        );
        assert_eq!(
            resolve_fee("FAM-DIV", Some(dec!(50000.01))).expect("lookup"),
            Some(dec!(5000))
        );
        assert_eq!(
            resolve_fee("FAM-DIV", Some(dec!(900000))).expect("lookup"),
            Some(dec!(8000))
        );
    }

    #[test]
    fn unknown_code_resolves_to_none() {
        assert_eq!(resolve_fee("NOPE", Some(dec!(10))).expect("lookup"), None);
    }

    #[test]
    fn malformed_tiers_are_rejected() {
        let raw = r#"
            [[items]]
            code = "X"
            materia = "Civil"
            descripcion = "x"
            kind = "tiered"
            tiers = [{ amount = "1" }, { up_to = "10", amount = "2" }]
        "#;
        let err = parse_schedule(raw).expect_err("open tier must be last");
        assert!(err.contains("open ended"), "unexpected error: {err}");
    }
}

//! Field-level input checks shared by the case and stage operations.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Deserializer};

use crate::error::CaseError;

pub const MAX_TITLE_LEN: usize = 300;
pub const MAX_SHORT_TEXT_LEN: usize = 120;
pub const MAX_LONG_TEXT_LEN: usize = 4000;
pub const MAX_LINK_LEN: usize = 2048;
/// Highest stage position a case may use.
pub const MAX_STAGE_ORDER: i32 = 10_000;
/// Ceiling for any monetary input (10^12).
pub const MAX_AMOUNT: Decimal = dec!(1_000_000_000_000);

/// Distinguishes an absent field (`None`) from an explicit `null` (`Some(None)`).
pub(crate) fn double_option<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

pub fn required_text(field: &str, raw: &str, max_len: usize) -> Result<String, CaseError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(CaseError::validation(field, "es obligatorio"));
    }
    if trimmed.chars().count() > max_len {
        return Err(CaseError::validation(
            field,
            format!("no puede superar {} caracteres", max_len),
        ));
    }
    Ok(trimmed.to_string())
}

/// Trim an optional value; blank collapses to `None`.
pub fn optional_text(
    field: &str,
    raw: Option<&str>,
    max_len: usize,
) -> Result<Option<String>, CaseError> {
    match raw.map(str::trim).filter(|value| !value.is_empty()) {
        None => Ok(None),
        Some(value) => required_text(field, value, max_len).map(Some),
    }
}

pub fn non_negative_amount(field: &str, value: Option<Decimal>) -> Result<Option<Decimal>, CaseError> {
    match value {
        Some(amount) if amount < Decimal::ZERO => {
            Err(CaseError::validation(field, "no puede ser negativo"))
        }
        Some(amount) => within_ceiling(field, amount).map(Some),
        None => Ok(None),
    }
}

pub fn positive_amount(field: &str, value: Decimal) -> Result<Decimal, CaseError> {
    if value <= Decimal::ZERO {
        return Err(CaseError::validation(field, "debe ser mayor a cero"));
    }
    within_ceiling(field, value)
}

fn within_ceiling(field: &str, amount: Decimal) -> Result<Decimal, CaseError> {
    if amount > MAX_AMOUNT {
        return Err(CaseError::validation(
            field,
            format!("no puede superar {}", MAX_AMOUNT),
        ));
    }
    Ok(amount.round_dp(2))
}

pub fn currency_code(field: &str, raw: &str) -> Result<String, CaseError> {
    let trimmed = raw.trim();
    if trimmed.len() != 3 || !trimmed.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(CaseError::validation(
            field,
            "debe ser un código de moneda de tres letras",
        ));
    }
    Ok(trimmed.to_ascii_uppercase())
}

/// Fee share between 0 and 1 inclusive.
pub fn share(field: &str, value: Option<Decimal>) -> Result<Option<Decimal>, CaseError> {
    match value {
        Some(v) if v < Decimal::ZERO || v > Decimal::ONE => {
            Err(CaseError::validation(field, "debe estar entre 0 y 1"))
        }
        other => Ok(other),
    }
}

/// Empty clears the link; anything else must be an absolute http(s) URL.
pub fn payment_link(raw: &str) -> Result<Option<String>, CaseError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    if trimmed.len() > MAX_LINK_LEN {
        return Err(CaseError::validation("enlace_pago", "el enlace es demasiado largo"));
    }
    let parsed = url::Url::parse(trimmed)
        .map_err(|_| CaseError::validation("enlace_pago", "debe ser una URL válida"))?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(CaseError::validation(
            "enlace_pago",
            "debe comenzar con http:// o https://",
        ));
    }
    Ok(Some(trimmed.to_string()))
}

pub fn stage_order(field: &str, value: i32) -> Result<i32, CaseError> {
    if !(1..=MAX_STAGE_ORDER).contains(&value) {
        return Err(CaseError::validation(
            field,
            format!("debe estar entre 1 y {}", MAX_STAGE_ORDER),
        ));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    fn field_of(err: CaseError) -> String {
        match err {
            CaseError::Validation { field, .. } => field,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn required_text_trims_and_bounds() {
        assert_eq!(
            required_text("caratulado", "  Pérez c/ Gómez ", MAX_TITLE_LEN).expect("valid"),
            "Pérez c/ Gómez"
        );
        assert_eq!(
            field_of(required_text("caratulado", "   ", MAX_TITLE_LEN).expect_err("blank")),
            "caratulado"
        );
        let long = "x".repeat(MAX_SHORT_TEXT_LEN + 1);
        assert!(required_text("tribunal", &long, MAX_SHORT_TEXT_LEN).is_err());
    }

    #[test]
    fn optional_text_collapses_blank() {
        assert_eq!(optional_text("materia", Some("  "), 10).expect("valid"), None);
        assert_eq!(
            optional_text("materia", Some(" Civil "), 10).expect("valid"),
            Some("Civil".to_string())
        );
    }

    #[test]
    fn amounts_are_checked_and_rounded() {
        assert_eq!(
            non_negative_amount("valor_estimado", Some(dec!(10.005))).expect("valid"),
            Some(dec!(10.00))
        );
        assert!(non_negative_amount("valor_estimado", Some(dec!(-1))).is_err());
        assert_eq!(
            field_of(positive_amount("monto", dec!(0)).expect_err("zero")),
            "monto"
        );
    }

    #[test]
    fn amounts_are_capped() {
        assert_eq!(MAX_AMOUNT, dec!(1_000_000_000_000));
        assert_eq!(positive_amount("monto", MAX_AMOUNT).expect("at ceiling"), MAX_AMOUNT);
        assert_eq!(
            field_of(
                positive_amount("monto", dec!(50_000_000_000_000_000_000_000_000_000))
                    .expect_err("huge")
            ),
            "monto"
        );
        assert!(non_negative_amount("costo_uf", Some(MAX_AMOUNT + Decimal::ONE)).is_err());
    }

    #[test]
    fn stage_orders_are_bounded() {
        assert_eq!(stage_order("orden", 1).expect("first"), 1);
        assert_eq!(stage_order("orden", MAX_STAGE_ORDER).expect("last"), MAX_STAGE_ORDER);
        assert_eq!(field_of(stage_order("orden", 0).expect_err("zero")), "orden");
        assert_eq!(
            field_of(stage_order("target_order", i32::MAX).expect_err("max")),
            "target_order"
        );
    }

    #[test]
    fn payment_links_must_be_http() {
        assert_eq!(payment_link("  ").expect("blank clears"), None);
        assert_eq!(
            payment_link("https://pagos.example.com/x?id=1").expect("valid"),
            Some("https://pagos.example.com/x?id=1".to_string())
        );
        assert!(payment_link("ftp://pagos.example.com").is_err());
        assert!(payment_link("pagos.example.com").is_err());
        assert!(payment_link("javascript:alert(1)").is_err());
    }

    #[test]
    fn double_option_distinguishes_null_from_absent() {
        #[derive(Deserialize)]
        struct Patch {
            #[serde(default, deserialize_with = "double_option")]
            tribunal: Option<Option<String>>,
        }

        let absent: Patch = serde_json::from_str("{}").expect("absent");
        assert_eq!(absent.tribunal, None);
        let null: Patch = serde_json::from_str(r#"{"tribunal":null}"#).expect("null");
        assert_eq!(null.tribunal, Some(None));
        let set: Patch = serde_json::from_str(r#"{"tribunal":"TDJ"}"#).expect("set");
        assert_eq!(set.tribunal, Some(Some("TDJ".to_string())));
    }
}

//! Materia stage templates and the initial stage plan of a new case.

use std::sync::LazyLock;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::db::{BillingModality, NewStage, PaymentStatus, StageStatus};
use crate::legal::fees;

/// Currency under which prepaid fees are split across stages.
pub const DISTRIBUTION_CURRENCY: &str = "BOB";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Materia {
    Civil,
    Comercial,
    Laboral,
    Familia,
}

impl Materia {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Civil => "Civil",
            Self::Comercial => "Comercial",
            Self::Laboral => "Laboral",
            Self::Familia => "Familia",
        }
    }

    pub fn from_label(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "civil" => Some(Self::Civil),
            "comercial" => Some(Self::Comercial),
            "laboral" => Some(Self::Laboral),
            "familia" => Some(Self::Familia),
            _ => None,
        }
    }

    /// Resolve a case's free-text materia; unknown or absent falls back to Civil.
    pub fn resolve(raw: Option<&str>) -> Self {
        raw.and_then(Self::from_label).unwrap_or(Self::Civil)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StageTemplate {
    pub etapa: String,
    pub descripcion: String,
    pub duracion_dias: i64,
    pub porcentaje_honorario: Decimal,
    pub es_publica: bool,
}

#[derive(Debug, Deserialize)]
struct TemplateConfig {
    materias: Vec<RawMateria>,
}

#[derive(Debug, Deserialize)]
struct RawMateria {
    materia: String,
    etapas: Vec<RawStageTemplate>,
}

#[derive(Debug, Deserialize)]
struct RawStageTemplate {
    etapa: String,
    descripcion: String,
    duracion_dias: i64,
    porcentaje_honorario: Decimal,
    #[serde(default = "default_public")]
    es_publica: bool,
}

fn default_public() -> bool {
    true
}

type TemplateTable = Vec<(Materia, Vec<StageTemplate>)>;

static TEMPLATES: LazyLock<Result<TemplateTable, String>> =
    LazyLock::new(|| parse_templates(include_str!("stage_templates.toml")));

fn parse_templates(raw: &str) -> Result<TemplateTable, String> {
    let parsed: TemplateConfig =
        toml::from_str(raw).map_err(|e| format!("invalid stage templates TOML: {}", e))?;

    let mut out: TemplateTable = Vec::with_capacity(parsed.materias.len());
    for entry in parsed.materias {
        let materia = Materia::from_label(&entry.materia)
            .ok_or_else(|| format!("invalid materia '{}' in stage templates", entry.materia))?;
        if out.iter().any(|(existing, _)| *existing == materia) {
            return Err(format!("duplicate templates for materia '{}'", materia.as_str()));
        }
        if entry.etapas.is_empty() {
            return Err(format!("materia '{}' has no stages", materia.as_str()));
        }

        let mut share_sum = Decimal::ZERO;
        let mut stages = Vec::with_capacity(entry.etapas.len());
        for stage in entry.etapas {
            if stage.duracion_dias < 0 {
                return Err(format!(
                    "stage '{}' of '{}' has a negative duration",
                    stage.etapa,
                    materia.as_str()
                ));
            }
            if stage.porcentaje_honorario < Decimal::ZERO {
                return Err(format!(
                    "stage '{}' of '{}' has a negative fee share",
                    stage.etapa,
                    materia.as_str()
                ));
            }
            share_sum += stage.porcentaje_honorario;
            stages.push(StageTemplate {
                etapa: stage.etapa.trim().to_string(),
                descripcion: stage.descripcion.trim().to_string(),
                duracion_dias: stage.duracion_dias,
                porcentaje_honorario: stage.porcentaje_honorario,
                es_publica: stage.es_publica,
            });
        }
        if share_sum != Decimal::ONE {
            return Err(format!(
                "fee shares of '{}' sum to {} instead of 1",
                materia.as_str(),
                share_sum
            ));
        }
        out.push((materia, stages));
    }

    for required in [
        Materia::Civil,
        Materia::Comercial,
        Materia::Laboral,
        Materia::Familia,
    ] {
        if !out.iter().any(|(materia, _)| *materia == required) {
            return Err(format!("missing templates for '{}'", required.as_str()));
        }
    }
    Ok(out)
}

pub fn templates_for(materia: Materia) -> Result<&'static [StageTemplate], String> {
    let table = match &*TEMPLATES {
        Ok(table) => table,
        Err(err) => return Err(err.clone()),
    };
    table
        .iter()
        .find(|(candidate, _)| *candidate == materia)
        .map(|(_, stages)| stages.as_slice())
        .ok_or_else(|| format!("missing templates for '{}'", materia.as_str()))
}

/// Fee terms a new case carries.
#[derive(Debug, Clone, Default)]
pub struct FeeTerms {
    pub honorario_total_uf: Option<Decimal>,
    pub honorario_moneda: String,
    pub modalidad_cobro: Option<BillingModality>,
    pub tarifa_referencia: Option<String>,
    pub valor_estimado: Option<Decimal>,
}

/// Hearing metadata attached to the first hearing stage on creation.
#[derive(Debug, Clone, PartialEq)]
pub struct InitialHearing {
    pub tipo: String,
    pub fecha: DateTime<Utc>,
    pub lugar: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct StagePlanInput {
    pub materia: Option<String>,
    pub fecha_inicio: Option<NaiveDate>,
    pub fees: FeeTerms,
    pub hearing: Option<InitialHearing>,
}

/// Total to distribute across stages, when distribution applies at all.
pub fn distributable_total(terms: &FeeTerms) -> Result<Option<Decimal>, String> {
    if terms.modalidad_cobro != Some(BillingModality::Prepago)
        || !terms
            .honorario_moneda
            .trim()
            .eq_ignore_ascii_case(DISTRIBUTION_CURRENCY)
    {
        return Ok(None);
    }

    if let Some(total) = terms.honorario_total_uf.filter(|t| *t > Decimal::ZERO) {
        return Ok(Some(total.round_dp(2)));
    }

    match terms
        .tarifa_referencia
        .as_deref()
        .map(str::trim)
        .filter(|code| !code.is_empty())
    {
        Some(code) => fees::resolve_fee(code, terms.valor_estimado),
        None => Ok(None),
    }
}

/// Split `total` by `shares`; the last slot absorbs the rounding remainder.
pub fn distribute(total: Decimal, shares: &[Decimal]) -> Vec<Decimal> {
    let mut out = Vec::with_capacity(shares.len());
    let mut allocated = Decimal::ZERO;
    for (idx, share) in shares.iter().enumerate() {
        if idx + 1 == shares.len() {
            out.push(total - allocated);
        } else {
            let cost = (total * share).round_dp(2);
            allocated += cost;
            out.push(cost);
        }
    }
    out
}

/// Build the initial stages of a case. `today` stands in for a missing start date.
pub fn generate_stages(input: &StagePlanInput, today: NaiveDate) -> Result<Vec<NewStage>, String> {
    let materia = Materia::resolve(input.materia.as_deref());
    let templates = templates_for(materia)?;
    let start = input.fecha_inicio.unwrap_or(today);

    let costs = distributable_total(&input.fees)?.map(|total| {
        let shares: Vec<Decimal> = templates.iter().map(|t| t.porcentaje_honorario).collect();
        distribute(total, &shares)
    });

    let mut offset_days: i64 = 0;
    let mut stages = Vec::with_capacity(templates.len());
    for (idx, template) in templates.iter().enumerate() {
        offset_days += template.duracion_dias;
        let fecha = start
            .checked_add_signed(Duration::days(offset_days))
            .ok_or_else(|| format!("stage date out of range for '{}'", template.etapa))?;
        let costo = costs.as_ref().map(|all| all[idx]);
        let orden = i32::try_from(idx + 1).map_err(|_| "too many template stages".to_string())?;

        stages.push(NewStage {
            etapa: template.etapa.clone(),
            descripcion: Some(template.descripcion.clone()),
            fecha_programada: Some(fecha),
            orden,
            estado: StageStatus::Pendiente,
            es_publica: template.es_publica,
            requiere_pago: costo.is_some(),
            costo_uf: costo,
            porcentaje_variable: costs.as_ref().map(|_| template.porcentaje_honorario),
            estado_pago: PaymentStatus::Pendiente,
            enlace_pago: None,
            monto_pagado_uf: Decimal::ZERO,
            audiencia_tipo: None,
            audiencia_fecha: None,
            audiencia_lugar: None,
        });
    }

    if let Some(hearing) = &input.hearing {
        tag_initial_hearing(&mut stages, hearing);
    }
    Ok(stages)
}

fn tag_initial_hearing(stages: &mut [NewStage], hearing: &InitialHearing) {
    let target = stages
        .iter()
        .position(|stage| stage.etapa.to_lowercase().contains("audiencia"))
        .unwrap_or(0);
    if let Some(stage) = stages.get_mut(target) {
        stage.audiencia_tipo = Some(hearing.tipo.clone());
        stage.audiencia_fecha = Some(hearing.fecha);
        stage.audiencia_lugar = hearing.lugar.clone();
        stage.fecha_programada = Some(hearing.fecha.date_naive());
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    use super::*;

    fn prepaid(total: Option<Decimal>) -> FeeTerms {
        FeeTerms {
            honorario_total_uf: total,
            honorario_moneda: "BOB".to_string(),
            modalidad_cobro: Some(BillingModality::Prepago),
            tarifa_referencia: None,
            valor_estimado: None,
        }
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 2).expect("valid date")
    }

    #[test]
    fn bundled_templates_parse_with_exact_shares() {
        for materia in [
            Materia::Civil,
            Materia::Comercial,
            Materia::Laboral,
            Materia::Familia,
        ] {
            let stages = templates_for(materia).expect("templates");
            let sum: Decimal = stages.iter().map(|s| s.porcentaje_honorario).sum();
            assert_eq!(sum, Decimal::ONE, "{materia:?}");
        }
    }

    #[test]
    fn laboral_prepaid_splits_six_thousand() {
        let input = StagePlanInput {
            materia: Some("Laboral".to_string()),
            fecha_inicio: None,
            fees: prepaid(Some(dec!(6000))),
            hearing: None,
        };
        let stages = generate_stages(&input, today()).expect("plan");
        let costs: Vec<_> = stages.iter().map(|s| s.costo_uf).collect();
        assert_eq!(
            costs,
            vec![
                Some(dec!(1200)),
                Some(dec!(1200)),
                Some(dec!(1200)),
                Some(dec!(1200)),
                Some(dec!(600)),
                Some(dec!(600)),
            ]
        );
        assert!(stages.iter().all(|s| s.requiere_pago));
        let ordens: Vec<_> = stages.iter().map(|s| s.orden).collect();
        assert_eq!(ordens, vec![1, 2, 3, 4, 5, 6]);
        assert!(stages.iter().all(|s| s.estado == StageStatus::Pendiente
            && s.estado_pago == PaymentStatus::Pendiente));
    }

    #[test]
    fn distribution_sums_exactly_for_awkward_totals() {
        for materia in ["Civil", "Comercial", "Laboral", "Familia"] {
            for total in [dec!(1000.01), dec!(333.33), dec!(7777.77), dec!(0.05)] {
                let input = StagePlanInput {
                    materia: Some(materia.to_string()),
                    fecha_inicio: None,
                    fees: prepaid(Some(total)),
                    hearing: None,
                };
                let stages = generate_stages(&input, today()).expect("plan");
                let sum: Decimal = stages.iter().filter_map(|s| s.costo_uf).sum();
                assert_eq!(sum, total, "{materia} {total}");
            }
        }
    }

    #[test]
    fn distribution_requires_prepaid_bob() {
        let mut terms = prepaid(Some(dec!(6000)));
        terms.honorario_moneda = "usd".to_string();
        assert_eq!(distributable_total(&terms).expect("total"), None);

        let mut terms = prepaid(Some(dec!(6000)));
        terms.modalidad_cobro = Some(BillingModality::Postpago);
        assert_eq!(distributable_total(&terms).expect("total"), None);

        let mut terms = prepaid(Some(dec!(6000)));
        terms.honorario_moneda = " bob ".to_string();
        assert_eq!(distributable_total(&terms).expect("total"), Some(dec!(6000)));

        let input = StagePlanInput {
            materia: Some("Laboral".to_string()),
            fecha_inicio: None,
            fees: FeeTerms {
                modalidad_cobro: Some(BillingModality::Mixto),
                ..prepaid(Some(dec!(6000)))
            },
            hearing: None,
        };
        let stages = generate_stages(&input, today()).expect("plan");
        assert!(stages.iter().all(|s| s.costo_uf.is_none() && !s.requiere_pago));
    }

    #[test]
    fn fee_reference_resolves_missing_total() {
        let mut terms = prepaid(None);
        terms.tarifa_referencia = Some("LAB-BEN".to_string());
        assert_eq!(distributable_total(&terms).expect("total"), Some(dec!(6000)));

        terms.honorario_total_uf = Some(dec!(0));
        assert_eq!(distributable_total(&terms).expect("total"), Some(dec!(6000)));

        terms.tarifa_referencia = Some("UNKNOWN".to_string());
        assert_eq!(distributable_total(&terms).expect("total"), None);
    }

    #[test]
    fn unknown_materia_falls_back_to_civil() {
        assert_eq!(Materia::resolve(Some("Penal")), Materia::Civil);
        assert_eq!(Materia::resolve(None), Materia::Civil);
        assert_eq!(Materia::resolve(Some(" LABORAL ")), Materia::Laboral);

        let stages = generate_stages(&StagePlanInput::default(), today()).expect("plan");
        assert_eq!(
            stages.len(),
            templates_for(Materia::Civil).expect("civil").len()
        );
    }

    #[test]
    fn dates_accumulate_from_start() {
        let start = NaiveDate::from_ymd_opt(2026, 1, 1).expect("date");
        let input = StagePlanInput {
            materia: Some("Laboral".to_string()),
            fecha_inicio: Some(start),
            ..Default::default()
        };
        let stages = generate_stages(&input, today()).expect("plan");
        let templates = templates_for(Materia::Laboral).expect("templates");
        let mut expected = start;
        for (stage, template) in stages.iter().zip(templates) {
            expected += Duration::days(template.duracion_dias);
            assert_eq!(stage.fecha_programada, Some(expected));
        }

        let undated = generate_stages(
            &StagePlanInput {
                materia: Some("Laboral".to_string()),
                ..Default::default()
            },
            today(),
        )
        .expect("plan");
        assert_eq!(
            undated[0].fecha_programada,
            Some(today() + Duration::days(templates[0].duracion_dias))
        );
    }

    #[test]
    fn initial_hearing_tags_first_hearing_stage() {
        let fecha = Utc.with_ymd_and_hms(2026, 4, 15, 9, 0, 0).unwrap();
        let hearing = InitialHearing {
            tipo: "preliminar".to_string(),
            fecha,
            lugar: Some("Juzgado 3ro Civil".to_string()),
        };
        let input = StagePlanInput {
            materia: Some("Civil".to_string()),
            hearing: Some(hearing.clone()),
            ..Default::default()
        };
        let stages = generate_stages(&input, today()).expect("plan");
        let tagged: Vec<_> = stages
            .iter()
            .filter(|s| s.audiencia_tipo.is_some())
            .collect();
        assert_eq!(tagged.len(), 1);
        assert_eq!(tagged[0].etapa, "Audiencia preliminar");
        assert_eq!(tagged[0].fecha_programada, Some(fecha.date_naive()));
        assert_eq!(tagged[0].audiencia_lugar.as_deref(), Some("Juzgado 3ro Civil"));

        // Comercial only has "Audiencia de excepciones" at position 5.
        let input = StagePlanInput {
            materia: Some("Comercial".to_string()),
            hearing: Some(hearing),
            ..Default::default()
        };
        let stages = generate_stages(&input, today()).expect("plan");
        assert_eq!(
            stages
                .iter()
                .position(|s| s.audiencia_tipo.is_some()),
            Some(4)
        );
    }

    #[test]
    fn hearing_falls_back_to_first_stage() {
        let mut stages = generate_stages(
            &StagePlanInput {
                materia: Some("Laboral".to_string()),
                ..Default::default()
            },
            today(),
        )
        .expect("plan");
        for stage in &mut stages {
            stage.etapa = stage.etapa.replace("Audiencia", "Acto");
        }
        let fecha = Utc.with_ymd_and_hms(2026, 5, 1, 10, 0, 0).unwrap();
        tag_initial_hearing(
            &mut stages,
            &InitialHearing {
                tipo: "inicial".to_string(),
                fecha,
                lugar: None,
            },
        );
        assert_eq!(stages[0].audiencia_fecha, Some(fecha));
    }

    #[test]
    fn shares_not_summing_to_one_are_rejected() {
        let raw = r#"
            [[materias]]
            materia = "Civil"
            [[materias.etapas]]
            etapa = "Única"
            descripcion = "x"
            duracion_dias = 1
            porcentaje_honorario = "0.9"
        "#;
        let err = parse_templates(raw).expect_err("shares must sum to 1");
        assert!(err.contains("instead of 1"), "unexpected error: {err}");
    }
}

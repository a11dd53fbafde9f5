use chrono::Utc;
use libsql::params;
use uuid::Uuid;

use crate::db::{
    NewStage, PaymentStatus, StageRecord, StageStatus, StageStore, UpdateStageParams,
};
use crate::error::DatabaseError;

use super::{
    LibSqlBackend, fmt_ts, get_bool, get_i32, get_opt_text, get_text, opt_date, opt_decimal,
    opt_text, opt_ts, opt_uuid, parse_decimal, parse_enum, parse_opt_date, parse_opt_decimal,
    parse_opt_timestamp, parse_opt_uuid, parse_timestamp, parse_uuid,
};

pub(super) const STAGE_COLUMNS: &str = "id, case_id, etapa, descripcion, fecha_programada, orden, \
     estado, es_publica, requiere_pago, costo_uf, porcentaje_variable, estado_pago, enlace_pago, \
     monto_pagado_uf, solicitado_por, solicitado_at, completado_at, audiencia_tipo, \
     audiencia_fecha, audiencia_lugar, created_at, updated_at";

pub(super) fn row_to_stage_record(row: &libsql::Row) -> Result<StageRecord, DatabaseError> {
    Ok(StageRecord {
        id: parse_uuid(&get_text(row, 0), "stage.id")?,
        case_id: parse_uuid(&get_text(row, 1), "stage.case_id")?,
        etapa: get_text(row, 2),
        descripcion: get_opt_text(row, 3),
        fecha_programada: parse_opt_date(get_opt_text(row, 4))?,
        orden: get_i32(row, 5)?,
        estado: parse_enum(&get_text(row, 6), "stage status", StageStatus::from_db_value)?,
        es_publica: get_bool(row, 7),
        requiere_pago: get_bool(row, 8),
        costo_uf: parse_opt_decimal(get_opt_text(row, 9), "costo_uf")?,
        porcentaje_variable: parse_opt_decimal(get_opt_text(row, 10), "porcentaje_variable")?,
        estado_pago: parse_enum(
            &get_text(row, 11),
            "payment status",
            PaymentStatus::from_db_value,
        )?,
        enlace_pago: get_opt_text(row, 12),
        monto_pagado_uf: parse_decimal(&get_text(row, 13), "monto_pagado_uf")?,
        solicitado_por: parse_opt_uuid(get_opt_text(row, 14), "stage.solicitado_por")?,
        solicitado_at: parse_opt_timestamp(get_opt_text(row, 15))?,
        completado_at: parse_opt_timestamp(get_opt_text(row, 16))?,
        audiencia_tipo: get_opt_text(row, 17),
        audiencia_fecha: parse_opt_timestamp(get_opt_text(row, 18))?,
        audiencia_lugar: get_opt_text(row, 19),
        created_at: parse_timestamp(&get_text(row, 20))?,
        updated_at: parse_timestamp(&get_text(row, 21))?,
    })
}

/// Insert one stage row on an existing connection (inside or outside a transaction).
pub(super) async fn insert_stage(
    conn: &libsql::Connection,
    id: &str,
    case_id: &str,
    input: &NewStage,
    now: &str,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO case_stages \
         (id, case_id, etapa, descripcion, fecha_programada, orden, estado, es_publica, \
          requiere_pago, costo_uf, porcentaje_variable, estado_pago, enlace_pago, monto_pagado_uf, \
          audiencia_tipo, audiencia_fecha, audiencia_lugar, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?18)",
        params![
            id,
            case_id,
            input.etapa.as_str(),
            opt_text(input.descripcion.as_deref()),
            opt_date(input.fecha_programada),
            i64::from(input.orden),
            input.estado.as_str(),
            i64::from(input.es_publica),
            i64::from(input.requiere_pago),
            opt_decimal(input.costo_uf),
            opt_decimal(input.porcentaje_variable),
            input.estado_pago.as_str(),
            opt_text(input.enlace_pago.as_deref()),
            input.monto_pagado_uf.to_string(),
            opt_text(input.audiencia_tipo.as_deref()),
            opt_ts(input.audiencia_fecha),
            opt_text(input.audiencia_lugar.as_deref()),
            now,
        ],
    )
    .await?;
    Ok(())
}

#[async_trait::async_trait]
impl StageStore for LibSqlBackend {
    async fn list_stages(
        &self,
        case_id: Uuid,
        public_only: bool,
    ) -> Result<Vec<StageRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let sql = if public_only {
            format!(
                "SELECT {STAGE_COLUMNS} FROM case_stages \
                 WHERE case_id = ?1 AND es_publica = 1 ORDER BY orden ASC"
            )
        } else {
            format!("SELECT {STAGE_COLUMNS} FROM case_stages WHERE case_id = ?1 ORDER BY orden ASC")
        };
        let mut rows = conn.query(&sql, params![case_id.to_string()]).await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(row_to_stage_record(&row)?);
        }
        Ok(out)
    }

    async fn get_stage(&self, id: Uuid) -> Result<Option<StageRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let row = conn
            .query(
                &format!("SELECT {STAGE_COLUMNS} FROM case_stages WHERE id = ?1 LIMIT 1"),
                params![id.to_string()],
            )
            .await?
            .next()
            .await?;
        row.map(|row| row_to_stage_record(&row)).transpose()
    }

    async fn create_stage(
        &self,
        case_id: Uuid,
        input: &NewStage,
    ) -> Result<StageRecord, DatabaseError> {
        let conn = self.connect().await?;
        let id = Uuid::new_v4();
        let now = fmt_ts(&Utc::now());
        insert_stage(&conn, &id.to_string(), &case_id.to_string(), input, &now).await?;
        drop(conn);
        self.get_stage(id)
            .await?
            .ok_or_else(|| DatabaseError::Query("failed to load created stage".to_string()))
    }

    async fn update_stage(
        &self,
        id: Uuid,
        input: &UpdateStageParams,
    ) -> Result<Option<StageRecord>, DatabaseError> {
        let Some(existing) = self.get_stage(id).await? else {
            return Ok(None);
        };
        let merged = input.merge_into(&existing);

        let conn = self.connect().await?;
        conn.execute(
            "UPDATE case_stages SET \
             etapa = ?2, descripcion = ?3, fecha_programada = ?4, orden = ?5, estado = ?6, \
             es_publica = ?7, requiere_pago = ?8, costo_uf = ?9, porcentaje_variable = ?10, \
             estado_pago = ?11, enlace_pago = ?12, monto_pagado_uf = ?13, completado_at = ?14, \
             audiencia_tipo = ?15, audiencia_fecha = ?16, audiencia_lugar = ?17, updated_at = ?18 \
             WHERE id = ?1",
            params![
                id.to_string(),
                merged.etapa.as_str(),
                opt_text(merged.descripcion.as_deref()),
                opt_date(merged.fecha_programada),
                i64::from(merged.orden),
                merged.estado.as_str(),
                i64::from(merged.es_publica),
                i64::from(merged.requiere_pago),
                opt_decimal(merged.costo_uf),
                opt_decimal(merged.porcentaje_variable),
                merged.estado_pago.as_str(),
                opt_text(merged.enlace_pago.as_deref()),
                merged.monto_pagado_uf.to_string(),
                opt_ts(merged.completado_at),
                opt_text(merged.audiencia_tipo.as_deref()),
                opt_ts(merged.audiencia_fecha),
                opt_text(merged.audiencia_lugar.as_deref()),
                fmt_ts(&Utc::now()),
            ],
        )
        .await?;
        drop(conn);
        self.get_stage(id).await
    }

    async fn delete_stage(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let conn = self.connect().await?;
        let affected = conn
            .execute(
                "DELETE FROM case_stages WHERE id = ?1",
                params![id.to_string()],
            )
            .await?;
        Ok(affected > 0)
    }
}

/// Used by the scope change transaction to stamp the requester.
pub(super) fn requester_values(
    requested_by: Option<(Uuid, chrono::DateTime<Utc>)>,
) -> (libsql::Value, libsql::Value) {
    match requested_by {
        Some((profile_id, at)) => (opt_uuid(Some(profile_id)), opt_ts(Some(at))),
        None => (libsql::Value::Null, libsql::Value::Null),
    }
}

#[cfg(test)]
pub(super) mod tests {
    use rust_decimal_macros::dec;

    use super::*;
    use crate::db::libsql::cases::tests::seed_case;
    use crate::db::libsql::tests::setup_backend;

    pub(crate) fn plain_stage(orden: i32, etapa: &str) -> NewStage {
        NewStage {
            etapa: etapa.to_string(),
            descripcion: None,
            fecha_programada: None,
            orden,
            estado: StageStatus::Pendiente,
            es_publica: true,
            requiere_pago: false,
            costo_uf: None,
            porcentaje_variable: None,
            estado_pago: PaymentStatus::Pendiente,
            enlace_pago: None,
            monto_pagado_uf: dec!(0),
            audiencia_tipo: None,
            audiencia_fecha: None,
            audiencia_lugar: None,
        }
    }

    #[tokio::test]
    async fn private_stages_are_hidden_from_public_listing() {
        let (backend, _tmpdir) = setup_backend().await;
        let case = seed_case(&backend, Vec::new()).await;

        let mut hidden = plain_stage(2, "Estrategia interna");
        hidden.es_publica = false;
        backend
            .create_stage(case.id, &plain_stage(1, "Demanda"))
            .await
            .expect("create public");
        backend
            .create_stage(case.id, &hidden)
            .await
            .expect("create private");

        let all = backend.list_stages(case.id, false).await.expect("list all");
        assert_eq!(all.len(), 2);
        let public = backend.list_stages(case.id, true).await.expect("list public");
        assert_eq!(public.len(), 1);
        assert_eq!(public[0].etapa, "Demanda");
    }

    #[tokio::test]
    async fn duplicate_orden_in_case_conflicts() {
        let (backend, _tmpdir) = setup_backend().await;
        let case = seed_case(&backend, Vec::new()).await;
        backend
            .create_stage(case.id, &plain_stage(1, "Demanda"))
            .await
            .expect("first stage");
        let err = backend
            .create_stage(case.id, &plain_stage(1, "Duplicada"))
            .await
            .expect_err("same orden must conflict");
        assert!(matches!(err, DatabaseError::Conflict(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn update_stage_merges_and_clears_fields() {
        let (backend, _tmpdir) = setup_backend().await;
        let case = seed_case(&backend, Vec::new()).await;
        let mut input = plain_stage(1, "Demanda");
        input.enlace_pago = Some("https://pagos.example.com/1".to_string());
        input.costo_uf = Some(dec!(1200));
        let stage = backend.create_stage(case.id, &input).await.expect("create");

        let updated = backend
            .update_stage(
                stage.id,
                &UpdateStageParams {
                    enlace_pago: Some(None),
                    estado_pago: Some(PaymentStatus::Parcial),
                    monto_pagado_uf: Some(dec!(300.50)),
                    ..Default::default()
                },
            )
            .await
            .expect("update")
            .expect("stage exists");

        assert_eq!(updated.enlace_pago, None);
        assert_eq!(updated.estado_pago, PaymentStatus::Parcial);
        assert_eq!(updated.monto_pagado_uf, dec!(300.50));
        assert_eq!(updated.costo_uf, Some(dec!(1200)));

        assert!(
            backend
                .update_stage(Uuid::new_v4(), &UpdateStageParams::default())
                .await
                .expect("update missing")
                .is_none()
        );
    }
}

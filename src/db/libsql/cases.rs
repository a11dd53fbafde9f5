use chrono::Utc;
use libsql::params;
use uuid::Uuid;

use crate::db::{
    BillingModality, CaseClientRecord, CaseFilter, CasePriority, CaseRecord, CaseStatus,
    CaseStore, NewCaseBundle, ScopeChange, UpdateCaseParams, WorkflowState,
};
use crate::error::DatabaseError;

use super::stages::{insert_stage, requester_values};
use super::{
    LibSqlBackend, fmt_ts, get_bool, get_i32, get_opt_text, get_text, opt_date, opt_decimal,
    opt_text, opt_uuid, parse_decimal, parse_enum, parse_opt_date, parse_opt_decimal,
    parse_opt_uuid, parse_timestamp, parse_uuid,
};

const CASE_COLUMNS: &str = "id, numero_causa, caratulado, materia, tribunal, cliente_principal_id, \
     nombre_cliente, documento_cliente, abogado_responsable, analista_id, estado, prioridad, \
     workflow_state, fecha_inicio, valor_estimado, honorario_total_uf, honorario_pagado_uf, \
     honorario_moneda, modalidad_cobro, tarifa_referencia, alcance_cliente_solicitado, \
     alcance_cliente_autorizado, observaciones, created_by, created_at, updated_at";

fn row_to_case_record(row: &libsql::Row) -> Result<CaseRecord, DatabaseError> {
    let modalidad = get_opt_text(row, 18)
        .map(|raw| parse_enum(&raw, "modalidad_cobro", BillingModality::from_db_value))
        .transpose()?;

    Ok(CaseRecord {
        id: parse_uuid(&get_text(row, 0), "case.id")?,
        numero_causa: get_opt_text(row, 1),
        caratulado: get_text(row, 2),
        materia: get_opt_text(row, 3),
        tribunal: get_opt_text(row, 4),
        cliente_principal_id: parse_opt_uuid(get_opt_text(row, 5), "case.cliente_principal_id")?,
        nombre_cliente: get_text(row, 6),
        documento_cliente: get_opt_text(row, 7),
        abogado_responsable: parse_opt_uuid(get_opt_text(row, 8), "case.abogado_responsable")?,
        analista_id: parse_opt_uuid(get_opt_text(row, 9), "case.analista_id")?,
        estado: parse_enum(&get_text(row, 10), "case status", CaseStatus::from_db_value)?,
        prioridad: parse_enum(&get_text(row, 11), "priority", CasePriority::from_db_value)?,
        workflow_state: parse_enum(
            &get_text(row, 12),
            "workflow state",
            WorkflowState::from_db_value,
        )?,
        fecha_inicio: parse_opt_date(get_opt_text(row, 13))?,
        valor_estimado: parse_opt_decimal(get_opt_text(row, 14), "valor_estimado")?,
        honorario_total_uf: parse_opt_decimal(get_opt_text(row, 15), "honorario_total_uf")?,
        honorario_pagado_uf: parse_decimal(&get_text(row, 16), "honorario_pagado_uf")?,
        honorario_moneda: get_text(row, 17),
        modalidad_cobro: modalidad,
        tarifa_referencia: get_opt_text(row, 19),
        alcance_cliente_solicitado: get_i32(row, 20)?,
        alcance_cliente_autorizado: get_i32(row, 21)?,
        observaciones: get_opt_text(row, 22),
        created_by: parse_uuid(&get_text(row, 23), "case.created_by")?,
        created_at: parse_timestamp(&get_text(row, 24))?,
        updated_at: parse_timestamp(&get_text(row, 25))?,
    })
}

fn row_to_case_client_record(row: &libsql::Row) -> Result<CaseClientRecord, DatabaseError> {
    Ok(CaseClientRecord {
        case_id: parse_uuid(&get_text(row, 0), "case_client.case_id")?,
        client_id: parse_uuid(&get_text(row, 1), "case_client.client_id")?,
        es_principal: get_bool(row, 2),
        created_at: parse_timestamp(&get_text(row, 3))?,
    })
}

async fn load_case(
    conn: &libsql::Connection,
    id: &str,
) -> Result<Option<CaseRecord>, DatabaseError> {
    let row = conn
        .query(
            &format!("SELECT {CASE_COLUMNS} FROM cases WHERE id = ?1 LIMIT 1"),
            params![id],
        )
        .await?
        .next()
        .await?;
    row.map(|row| row_to_case_record(&row)).transpose()
}

#[async_trait::async_trait]
impl CaseStore for LibSqlBackend {
    async fn create_case_bundle(
        &self,
        bundle: &NewCaseBundle,
    ) -> Result<CaseRecord, DatabaseError> {
        let case = &bundle.case;
        let case_id = case.id.to_string();
        let now = fmt_ts(&Utc::now());

        let conn = self.connect().await?;
        conn.execute("BEGIN IMMEDIATE", ()).await?;
        let result = async {
            conn.execute(
                "INSERT INTO cases \
                 (id, numero_causa, caratulado, materia, tribunal, cliente_principal_id, \
                  nombre_cliente, documento_cliente, abogado_responsable, analista_id, estado, \
                  prioridad, workflow_state, fecha_inicio, valor_estimado, honorario_total_uf, \
                  honorario_pagado_uf, honorario_moneda, modalidad_cobro, tarifa_referencia, \
                  alcance_cliente_solicitado, alcance_cliente_autorizado, observaciones, \
                  created_by, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, \
                         '0', ?17, ?18, ?19, 0, 0, ?20, ?21, ?22, ?22)",
                params![
                    case_id.as_str(),
                    opt_text(case.numero_causa.as_deref()),
                    case.caratulado.as_str(),
                    opt_text(case.materia.as_deref()),
                    opt_text(case.tribunal.as_deref()),
                    case.cliente_principal_id.to_string(),
                    case.nombre_cliente.as_str(),
                    opt_text(case.documento_cliente.as_deref()),
                    opt_uuid(case.abogado_responsable),
                    opt_uuid(case.analista_id),
                    case.estado.as_str(),
                    case.prioridad.as_str(),
                    case.workflow_state.as_str(),
                    opt_date(case.fecha_inicio),
                    opt_decimal(case.valor_estimado),
                    opt_decimal(case.honorario_total_uf),
                    case.honorario_moneda.as_str(),
                    opt_text(case.modalidad_cobro.map(BillingModality::as_str)),
                    opt_text(case.tarifa_referencia.as_deref()),
                    opt_text(case.observaciones.as_deref()),
                    case.created_by.to_string(),
                    now.as_str(),
                ],
            )
            .await?;

            conn.execute(
                "INSERT INTO case_clients (case_id, client_id, es_principal, created_at) \
                 VALUES (?1, ?2, 1, ?3)",
                params![
                    case_id.as_str(),
                    case.cliente_principal_id.to_string(),
                    now.as_str()
                ],
            )
            .await?;

            for stage in &bundle.stages {
                let stage_id = Uuid::new_v4().to_string();
                insert_stage(&conn, &stage_id, &case_id, stage, &now).await?;
            }

            load_case(&conn, &case_id)
                .await?
                .ok_or_else(|| DatabaseError::Query("failed to load created case".to_string()))
        }
        .await;

        match result {
            Ok(record) => {
                conn.execute("COMMIT", ()).await?;
                Ok(record)
            }
            Err(err) => {
                let _ = conn.execute("ROLLBACK", ()).await;
                Err(err)
            }
        }
    }

    async fn get_case(&self, id: Uuid) -> Result<Option<CaseRecord>, DatabaseError> {
        let conn = self.connect().await?;
        load_case(&conn, &id.to_string()).await
    }

    async fn list_cases(&self, filter: &CaseFilter) -> Result<Vec<CaseRecord>, DatabaseError> {
        let mut clauses: Vec<String> = Vec::new();
        let mut values: Vec<libsql::Value> = Vec::new();

        if let Some(abogado_id) = filter.abogado_id {
            values.push(libsql::Value::Text(abogado_id.to_string()));
            clauses.push(format!("abogado_responsable = ?{}", values.len()));
        }
        if let Some(cliente_id) = filter.cliente_id {
            values.push(libsql::Value::Text(cliente_id.to_string()));
            let idx = values.len();
            clauses.push(format!(
                "(cliente_principal_id = ?{idx} OR id IN \
                 (SELECT case_id FROM case_clients WHERE client_id = ?{idx}))"
            ));
        }
        if let Some(estado) = filter.estado {
            values.push(libsql::Value::Text(estado.as_str().to_string()));
            clauses.push(format!("estado = ?{}", values.len()));
        }

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        let sql = format!("SELECT {CASE_COLUMNS} FROM cases{where_sql} ORDER BY created_at DESC");

        let conn = self.connect().await?;
        let mut rows = conn.query(&sql, values).await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(row_to_case_record(&row)?);
        }
        Ok(out)
    }

    async fn find_case_by_numero(
        &self,
        numero_causa: &str,
    ) -> Result<Option<Uuid>, DatabaseError> {
        let conn = self.connect().await?;
        let row = conn
            .query(
                "SELECT id FROM cases WHERE numero_causa = ?1 LIMIT 1",
                params![numero_causa],
            )
            .await?
            .next()
            .await?;
        row.map(|row| parse_uuid(&get_text(&row, 0), "case.id"))
            .transpose()
    }

    async fn update_case(
        &self,
        id: Uuid,
        input: &UpdateCaseParams,
    ) -> Result<Option<CaseRecord>, DatabaseError> {
        let Some(existing) = self.get_case(id).await? else {
            return Ok(None);
        };
        let merged = input.merge_into(&existing);

        let conn = self.connect().await?;
        conn.execute(
            "UPDATE cases SET \
             numero_causa = ?2, caratulado = ?3, materia = ?4, tribunal = ?5, \
             cliente_principal_id = ?6, nombre_cliente = ?7, documento_cliente = ?8, \
             abogado_responsable = ?9, analista_id = ?10, estado = ?11, prioridad = ?12, \
             workflow_state = ?13, fecha_inicio = ?14, valor_estimado = ?15, \
             honorario_total_uf = ?16, honorario_pagado_uf = ?17, honorario_moneda = ?18, \
             modalidad_cobro = ?19, tarifa_referencia = ?20, observaciones = ?21, updated_at = ?22 \
             WHERE id = ?1",
            params![
                id.to_string(),
                opt_text(merged.numero_causa.as_deref()),
                merged.caratulado.as_str(),
                opt_text(merged.materia.as_deref()),
                opt_text(merged.tribunal.as_deref()),
                opt_uuid(merged.cliente_principal_id),
                merged.nombre_cliente.as_str(),
                opt_text(merged.documento_cliente.as_deref()),
                opt_uuid(merged.abogado_responsable),
                opt_uuid(merged.analista_id),
                merged.estado.as_str(),
                merged.prioridad.as_str(),
                merged.workflow_state.as_str(),
                opt_date(merged.fecha_inicio),
                opt_decimal(merged.valor_estimado),
                opt_decimal(merged.honorario_total_uf),
                merged.honorario_pagado_uf.to_string(),
                merged.honorario_moneda.as_str(),
                opt_text(merged.modalidad_cobro.map(BillingModality::as_str)),
                opt_text(merged.tarifa_referencia.as_deref()),
                opt_text(merged.observaciones.as_deref()),
                fmt_ts(&Utc::now()),
            ],
        )
        .await?;
        load_case(&conn, &id.to_string()).await
    }

    async fn delete_case(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let conn = self.connect().await?;
        let affected = conn
            .execute("DELETE FROM cases WHERE id = ?1", params![id.to_string()])
            .await?;
        Ok(affected > 0)
    }

    async fn list_case_clients(
        &self,
        case_id: Uuid,
    ) -> Result<Vec<CaseClientRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT case_id, client_id, es_principal, created_at FROM case_clients \
                 WHERE case_id = ?1 ORDER BY es_principal DESC, created_at ASC",
                params![case_id.to_string()],
            )
            .await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(row_to_case_client_record(&row)?);
        }
        Ok(out)
    }

    async fn link_case_client(
        &self,
        case_id: Uuid,
        client_id: Uuid,
        es_principal: bool,
    ) -> Result<CaseClientRecord, DatabaseError> {
        let conn = self.connect().await?;
        conn.execute(
            "INSERT INTO case_clients (case_id, client_id, es_principal, created_at) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT (case_id, client_id) \
             DO UPDATE SET es_principal = MAX(case_clients.es_principal, excluded.es_principal)",
            params![
                case_id.to_string(),
                client_id.to_string(),
                i64::from(es_principal),
                fmt_ts(&Utc::now()),
            ],
        )
        .await?;

        let row = conn
            .query(
                "SELECT case_id, client_id, es_principal, created_at FROM case_clients \
                 WHERE case_id = ?1 AND client_id = ?2 LIMIT 1",
                params![case_id.to_string(), client_id.to_string()],
            )
            .await?
            .next()
            .await?
            .ok_or_else(|| DatabaseError::Query("failed to load case client link".to_string()))?;
        row_to_case_client_record(&row)
    }

    async fn is_client_linked(
        &self,
        case_id: Uuid,
        client_id: Uuid,
    ) -> Result<bool, DatabaseError> {
        let conn = self.connect().await?;
        let row = conn
            .query(
                "SELECT 1 FROM cases WHERE id = ?1 AND cliente_principal_id = ?2 \
                 UNION ALL \
                 SELECT 1 FROM case_clients WHERE case_id = ?1 AND client_id = ?2 \
                 LIMIT 1",
                params![case_id.to_string(), client_id.to_string()],
            )
            .await?
            .next()
            .await?;
        Ok(row.is_some())
    }

    async fn apply_scope_change(
        &self,
        change: &ScopeChange,
    ) -> Result<Option<u64>, DatabaseError> {
        let case_id = change.case_id.to_string();
        let now = fmt_ts(&Utc::now());

        let conn = self.connect().await?;
        conn.execute("BEGIN IMMEDIATE", ()).await?;
        let result = async {
            let swapped = conn
                .execute(
                    "UPDATE cases SET alcance_cliente_solicitado = ?2, \
                     alcance_cliente_autorizado = ?3, updated_at = ?4 \
                     WHERE id = ?1 AND alcance_cliente_solicitado = ?5 \
                     AND alcance_cliente_autorizado = ?6",
                    params![
                        case_id.as_str(),
                        i64::from(change.next.solicitado),
                        i64::from(change.next.autorizado),
                        now.as_str(),
                        i64::from(change.expected.solicitado),
                        i64::from(change.expected.autorizado),
                    ],
                )
                .await?;
            if swapped == 0 {
                return Ok(None);
            }

            let payment = &change.payment;
            if payment.from.is_empty() {
                return Ok(Some(0));
            }

            let (requester, requested_at) = requester_values(payment.requested_by);
            let mut values: Vec<libsql::Value> = vec![
                libsql::Value::Text(case_id.clone()),
                libsql::Value::Integer(i64::from(payment.max_orden)),
                libsql::Value::Text(payment.to.as_str().to_string()),
                requester,
                requested_at,
                libsql::Value::Text(now.clone()),
            ];
            let mut placeholders = Vec::with_capacity(payment.from.len());
            for status in &payment.from {
                values.push(libsql::Value::Text(status.as_str().to_string()));
                placeholders.push(format!("?{}", values.len()));
            }

            let sql = format!(
                "UPDATE case_stages SET estado_pago = ?3, \
                 solicitado_por = COALESCE(?4, solicitado_por), \
                 solicitado_at = COALESCE(?5, solicitado_at), updated_at = ?6 \
                 WHERE case_id = ?1 AND orden <= ?2 AND requiere_pago = 1 \
                 AND estado_pago IN ({})",
                placeholders.join(", ")
            );
            let moved = conn.execute(&sql, values).await?;
            Ok::<_, DatabaseError>(Some(moved))
        }
        .await;

        match result {
            Ok(Some(moved)) => {
                conn.execute("COMMIT", ()).await?;
                Ok(Some(moved))
            }
            Ok(None) => {
                let _ = conn.execute("ROLLBACK", ()).await;
                Ok(None)
            }
            Err(err) => {
                let _ = conn.execute("ROLLBACK", ()).await;
                Err(err)
            }
        }
    }
}

#[cfg(test)]
pub(super) mod tests {
    use rust_decimal_macros::dec;

    use super::*;
    use crate::db::libsql::stages::tests::plain_stage;
    use crate::db::libsql::tests::setup_backend;
    use crate::db::{
        CaseScope, CreateProfileParams, NewCase, NewStage, PaymentStatus, PaymentTransition,
        ProfileStore, StageStore, UserRole,
    };

    pub(crate) async fn seed_case(backend: &LibSqlBackend, stages: Vec<NewStage>) -> CaseRecord {
        let suffix = Uuid::new_v4().simple().to_string();
        let admin = backend
            .create_profile(&CreateProfileParams {
                full_name: "Admin Firma".to_string(),
                email: format!("admin-{suffix}@example.com"),
                role: UserRole::AdminFirma,
                telefono: None,
            })
            .await
            .expect("admin profile");
        let client = backend
            .create_profile(&CreateProfileParams {
                full_name: "Carla Cliente".to_string(),
                email: format!("cliente-{suffix}@example.com"),
                role: UserRole::Cliente,
                telefono: None,
            })
            .await
            .expect("client profile");

        backend
            .create_case_bundle(&NewCaseBundle {
                case: NewCase {
                    id: Uuid::new_v4(),
                    numero_causa: None,
                    caratulado: "Cliente c/ Empresa".to_string(),
                    materia: Some("Laboral".to_string()),
                    tribunal: None,
                    cliente_principal_id: client.id,
                    nombre_cliente: client.full_name.clone(),
                    documento_cliente: None,
                    abogado_responsable: None,
                    analista_id: None,
                    estado: CaseStatus::Activo,
                    prioridad: CasePriority::Media,
                    workflow_state: WorkflowState::Preparacion,
                    fecha_inicio: None,
                    valor_estimado: None,
                    honorario_total_uf: Some(dec!(6000)),
                    honorario_moneda: "BOB".to_string(),
                    modalidad_cobro: Some(BillingModality::Prepago),
                    tarifa_referencia: None,
                    observaciones: None,
                    created_by: admin.id,
                },
                stages,
            })
            .await
            .expect("create case bundle")
    }

    fn paid_stage(orden: i32) -> NewStage {
        let mut stage = plain_stage(orden, &format!("Etapa {orden}"));
        stage.requiere_pago = true;
        stage.costo_uf = Some(dec!(1000));
        stage
    }

    #[tokio::test]
    async fn bundle_links_principal_client_and_stages() {
        let (backend, _tmpdir) = setup_backend().await;
        let case = seed_case(&backend, vec![paid_stage(1), paid_stage(2)]).await;

        assert_eq!(case.scope(), CaseScope::default());
        let client_id = case.cliente_principal_id.expect("principal client");
        let links = backend.list_case_clients(case.id).await.expect("links");
        assert_eq!(links.len(), 1);
        assert!(links[0].es_principal);
        assert!(
            backend
                .is_client_linked(case.id, client_id)
                .await
                .expect("linked")
        );
        assert_eq!(
            backend
                .list_stages(case.id, false)
                .await
                .expect("stages")
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn bundle_rolls_back_when_a_stage_fails() {
        let (backend, _tmpdir) = setup_backend().await;
        let err = backend
            .create_case_bundle(&NewCaseBundle {
                case: NewCase {
                    id: Uuid::new_v4(),
                    numero_causa: Some("LP-1/2026".to_string()),
                    caratulado: "X c/ Y".to_string(),
                    materia: None,
                    tribunal: None,
                    cliente_principal_id: Uuid::new_v4(),
                    nombre_cliente: "X".to_string(),
                    documento_cliente: None,
                    abogado_responsable: None,
                    analista_id: None,
                    estado: CaseStatus::Activo,
                    prioridad: CasePriority::Media,
                    workflow_state: WorkflowState::Preparacion,
                    fecha_inicio: None,
                    valor_estimado: None,
                    honorario_total_uf: None,
                    honorario_moneda: "BOB".to_string(),
                    modalidad_cobro: None,
                    tarifa_referencia: None,
                    observaciones: None,
                    created_by: Uuid::new_v4(),
                },
                stages: vec![plain_stage(1, "A")],
            })
            .await
            .expect_err("unknown client must violate the foreign key");
        assert!(matches!(err, DatabaseError::Conflict(_)), "got {err:?}");

        assert!(
            backend
                .find_case_by_numero("LP-1/2026")
                .await
                .expect("lookup")
                .is_none()
        );
    }

    #[tokio::test]
    async fn scope_change_is_compare_and_set() {
        let (backend, _tmpdir) = setup_backend().await;
        let case = seed_case(&backend, (1..=4).map(paid_stage).collect()).await;
        let requester = case.cliente_principal_id.expect("client");

        let change = ScopeChange {
            case_id: case.id,
            expected: CaseScope::default(),
            next: CaseScope {
                solicitado: 3,
                autorizado: 0,
            },
            payment: PaymentTransition {
                max_orden: 3,
                from: vec![PaymentStatus::Pendiente, PaymentStatus::Vencido],
                to: PaymentStatus::Solicitado,
                requested_by: Some((requester, Utc::now())),
            },
        };
        let moved = backend
            .apply_scope_change(&change)
            .await
            .expect("apply")
            .expect("counters matched");
        assert_eq!(moved, 3);

        // Replaying with stale expectations must not write anything.
        let stale = backend.apply_scope_change(&change).await.expect("apply stale");
        assert_eq!(stale, None);

        let reloaded = backend
            .get_case(case.id)
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(reloaded.alcance_cliente_solicitado, 3);
        assert_eq!(reloaded.alcance_cliente_autorizado, 0);

        let stages = backend.list_stages(case.id, false).await.expect("stages");
        let states: Vec<_> = stages.iter().map(|s| s.estado_pago).collect();
        assert_eq!(
            states,
            vec![
                PaymentStatus::Solicitado,
                PaymentStatus::Solicitado,
                PaymentStatus::Solicitado,
                PaymentStatus::Pendiente,
            ]
        );
        assert_eq!(stages[0].solicitado_por, Some(requester));
        assert!(stages[3].solicitado_por.is_none());
    }

    #[tokio::test]
    async fn client_filter_includes_secondary_links() {
        let (backend, _tmpdir) = setup_backend().await;
        let first = seed_case(&backend, Vec::new()).await;
        let second = seed_case(&backend, Vec::new()).await;
        let client = first.cliente_principal_id.expect("client");

        backend
            .link_case_client(second.id, client, false)
            .await
            .expect("secondary link");

        let visible = backend
            .list_cases(&CaseFilter {
                cliente_id: Some(client),
                ..Default::default()
            })
            .await
            .expect("list");
        assert_eq!(visible.len(), 2);

        let all = backend.list_cases(&CaseFilter::default()).await.expect("all");
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn update_keeps_scope_and_delete_cascades() {
        let (backend, _tmpdir) = setup_backend().await;
        let case = seed_case(&backend, vec![paid_stage(1)]).await;
        backend
            .apply_scope_change(&ScopeChange {
                case_id: case.id,
                expected: CaseScope::default(),
                next: CaseScope {
                    solicitado: 1,
                    autorizado: 1,
                },
                payment: PaymentTransition {
                    max_orden: 1,
                    from: Vec::new(),
                    to: PaymentStatus::EnProceso,
                    requested_by: None,
                },
            })
            .await
            .expect("apply")
            .expect("matched");

        let updated = backend
            .update_case(
                case.id,
                &UpdateCaseParams {
                    numero_causa: Some(Some("LP-77/2026".to_string())),
                    ..Default::default()
                },
            )
            .await
            .expect("update")
            .expect("exists");
        assert_eq!(updated.numero_causa.as_deref(), Some("LP-77/2026"));
        assert_eq!(updated.alcance_cliente_autorizado, 1);

        assert!(backend.delete_case(case.id).await.expect("delete"));
        assert!(
            backend
                .list_stages(case.id, false)
                .await
                .expect("stages")
                .is_empty()
        );
        assert!(!backend.delete_case(case.id).await.expect("second delete"));
    }
}

//! PostgreSQL backend for the Database trait.
//!
//! Uses a `deadpool-postgres` pool; schema is managed by refinery migrations
//! embedded from `migrations/`.

use async_trait::async_trait;
use deadpool_postgres::{GenericClient, Pool};
use secrecy::ExposeSecret;
use tokio_postgres::types::ToSql;
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::db::{
    AuditAction, AuditLogFilter, AuditLogRecord, AuditStore, BillingModality, CaseClientRecord,
    CaseFilter, CasePriority, CaseRecord, CaseStatus, CaseStore, CreateAuditLogParams,
    CreateProfileParams, Database, NewCaseBundle, NewStage, PaymentStatus, ProfileRecord,
    ProfileStore, ScopeChange, StageRecord, StageStatus, StageStore, UpdateCaseParams,
    UpdateStageParams, UserRole, WorkflowState,
};
use crate::error::DatabaseError;

mod embedded {
    refinery::embed_migrations!("migrations");
}

/// PostgreSQL database backend.
pub struct PgBackend {
    pool: Pool,
}

impl PgBackend {
    /// Create a new PostgreSQL backend from configuration.
    pub async fn new(config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        let url = config
            .url
            .as_ref()
            .ok_or_else(|| DatabaseError::Pool("DATABASE_URL is not set".to_string()))?;

        let mut cfg = deadpool_postgres::Config::new();
        cfg.url = Some(url.expose_secret().to_string());
        cfg.pool = Some(deadpool_postgres::PoolConfig::new(config.pool_size));

        let pool = cfg
            .create_pool(
                Some(deadpool_postgres::Runtime::Tokio1),
                tokio_postgres::NoTls,
            )
            .map_err(|e| DatabaseError::Pool(e.to_string()))?;

        // Fail fast on bad credentials instead of on the first request.
        let _ = pool.get().await?;
        tracing::debug!(pool_size = config.pool_size, "connected to PostgreSQL");
        Ok(Self { pool })
    }

    /// Get a clone of the connection pool.
    pub fn pool(&self) -> Pool {
        self.pool.clone()
    }

    async fn conn(&self) -> Result<deadpool_postgres::Object, DatabaseError> {
        Ok(self.pool.get().await?)
    }
}

fn parse_db_enum<T>(
    raw: &str,
    what: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> Result<T, DatabaseError> {
    parse(raw).ok_or_else(|| DatabaseError::Serialization(format!("invalid {} '{}'", what, raw)))
}

fn row_to_profile_record(row: &tokio_postgres::Row) -> Result<ProfileRecord, DatabaseError> {
    let role_raw: String = row.get("role");
    Ok(ProfileRecord {
        id: row.get("id"),
        full_name: row.get("full_name"),
        email: row.get("email"),
        role: parse_db_enum(&role_raw, "role", UserRole::from_db_value)?,
        telefono: row.get("telefono"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_case_record(row: &tokio_postgres::Row) -> Result<CaseRecord, DatabaseError> {
    let estado_raw: String = row.get("estado");
    let prioridad_raw: String = row.get("prioridad");
    let workflow_raw: String = row.get("workflow_state");
    let modalidad_raw: Option<String> = row.get("modalidad_cobro");
    Ok(CaseRecord {
        id: row.get("id"),
        numero_causa: row.get("numero_causa"),
        caratulado: row.get("caratulado"),
        materia: row.get("materia"),
        tribunal: row.get("tribunal"),
        cliente_principal_id: row.get("cliente_principal_id"),
        nombre_cliente: row.get("nombre_cliente"),
        documento_cliente: row.get("documento_cliente"),
        abogado_responsable: row.get("abogado_responsable"),
        analista_id: row.get("analista_id"),
        estado: parse_db_enum(&estado_raw, "case status", CaseStatus::from_db_value)?,
        prioridad: parse_db_enum(&prioridad_raw, "priority", CasePriority::from_db_value)?,
        workflow_state: parse_db_enum(&workflow_raw, "workflow state", WorkflowState::from_db_value)?,
        fecha_inicio: row.get("fecha_inicio"),
        valor_estimado: row.get("valor_estimado"),
        honorario_total_uf: row.get("honorario_total_uf"),
        honorario_pagado_uf: row.get("honorario_pagado_uf"),
        honorario_moneda: row.get("honorario_moneda"),
        modalidad_cobro: modalidad_raw
            .map(|raw| parse_db_enum(&raw, "modalidad_cobro", BillingModality::from_db_value))
            .transpose()?,
        tarifa_referencia: row.get("tarifa_referencia"),
        alcance_cliente_solicitado: row.get("alcance_cliente_solicitado"),
        alcance_cliente_autorizado: row.get("alcance_cliente_autorizado"),
        observaciones: row.get("observaciones"),
        created_by: row.get("created_by"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_stage_record(row: &tokio_postgres::Row) -> Result<StageRecord, DatabaseError> {
    let estado_raw: String = row.get("estado");
    let pago_raw: String = row.get("estado_pago");
    Ok(StageRecord {
        id: row.get("id"),
        case_id: row.get("case_id"),
        etapa: row.get("etapa"),
        descripcion: row.get("descripcion"),
        fecha_programada: row.get("fecha_programada"),
        orden: row.get("orden"),
        estado: parse_db_enum(&estado_raw, "stage status", StageStatus::from_db_value)?,
        es_publica: row.get("es_publica"),
        requiere_pago: row.get("requiere_pago"),
        costo_uf: row.get("costo_uf"),
        porcentaje_variable: row.get("porcentaje_variable"),
        estado_pago: parse_db_enum(&pago_raw, "payment status", PaymentStatus::from_db_value)?,
        enlace_pago: row.get("enlace_pago"),
        monto_pagado_uf: row.get("monto_pagado_uf"),
        solicitado_por: row.get("solicitado_por"),
        solicitado_at: row.get("solicitado_at"),
        completado_at: row.get("completado_at"),
        audiencia_tipo: row.get("audiencia_tipo"),
        audiencia_fecha: row.get("audiencia_fecha"),
        audiencia_lugar: row.get("audiencia_lugar"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_case_client_record(row: &tokio_postgres::Row) -> CaseClientRecord {
    CaseClientRecord {
        case_id: row.get("case_id"),
        client_id: row.get("client_id"),
        es_principal: row.get("es_principal"),
        created_at: row.get("created_at"),
    }
}

fn row_to_audit_record(row: &tokio_postgres::Row) -> Result<AuditLogRecord, DatabaseError> {
    let action_raw: String = row.get("action");
    Ok(AuditLogRecord {
        id: row.get("id"),
        actor_id: row.get("actor_id"),
        action: parse_db_enum(&action_raw, "audit action", AuditAction::from_db_value)?,
        entity_type: row.get("entity_type"),
        entity_id: row.get("entity_id"),
        diff: row.get("diff"),
        created_at: row.get("created_at"),
    })
}

async fn insert_stage_pg<C>(conn: &C, case_id: Uuid, input: &NewStage) -> Result<Uuid, DatabaseError>
where
    C: GenericClient + Sync,
{
    let id = Uuid::new_v4();
    conn.execute(
        "INSERT INTO case_stages \
         (id, case_id, etapa, descripcion, fecha_programada, orden, estado, es_publica, \
          requiere_pago, costo_uf, porcentaje_variable, estado_pago, enlace_pago, monto_pagado_uf, \
          audiencia_tipo, audiencia_fecha, audiencia_lugar) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)",
        &[
            &id,
            &case_id,
            &input.etapa,
            &input.descripcion,
            &input.fecha_programada,
            &input.orden,
            &input.estado.as_str(),
            &input.es_publica,
            &input.requiere_pago,
            &input.costo_uf,
            &input.porcentaje_variable,
            &input.estado_pago.as_str(),
            &input.enlace_pago,
            &input.monto_pagado_uf,
            &input.audiencia_tipo,
            &input.audiencia_fecha,
            &input.audiencia_lugar,
        ],
    )
    .await?;
    Ok(id)
}

#[async_trait]
impl ProfileStore for PgBackend {
    async fn create_profile(
        &self,
        input: &CreateProfileParams,
    ) -> Result<ProfileRecord, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                "INSERT INTO profiles (id, full_name, email, role, telefono) \
                 VALUES ($1, $2, $3, $4, $5) RETURNING *",
                &[
                    &Uuid::new_v4(),
                    &input.full_name.trim(),
                    &input.email.trim(),
                    &input.role.as_str(),
                    &input.telefono,
                ],
            )
            .await?;
        row_to_profile_record(&row)
    }

    async fn get_profile(&self, id: Uuid) -> Result<Option<ProfileRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt("SELECT * FROM profiles WHERE id = $1", &[&id])
            .await?;
        row.map(|row| row_to_profile_record(&row)).transpose()
    }

    async fn list_profiles_by_role(
        &self,
        role: UserRole,
    ) -> Result<Vec<ProfileRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT * FROM profiles WHERE role = $1 ORDER BY full_name ASC",
                &[&role.as_str()],
            )
            .await?;
        rows.iter().map(row_to_profile_record).collect()
    }
}

#[async_trait]
impl CaseStore for PgBackend {
    async fn create_case_bundle(
        &self,
        bundle: &NewCaseBundle,
    ) -> Result<CaseRecord, DatabaseError> {
        let case = &bundle.case;
        let mut conn = self.conn().await?;
        let tx = conn.transaction().await?;

        let row = tx
            .query_one(
                "INSERT INTO cases \
                 (id, numero_causa, caratulado, materia, tribunal, cliente_principal_id, \
                  nombre_cliente, documento_cliente, abogado_responsable, analista_id, estado, \
                  prioridad, workflow_state, fecha_inicio, valor_estimado, honorario_total_uf, \
                  honorario_moneda, modalidad_cobro, tarifa_referencia, observaciones, created_by) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, \
                         $17, $18, $19, $20, $21) \
                 RETURNING *",
                &[
                    &case.id,
                    &case.numero_causa,
                    &case.caratulado,
                    &case.materia,
                    &case.tribunal,
                    &case.cliente_principal_id,
                    &case.nombre_cliente,
                    &case.documento_cliente,
                    &case.abogado_responsable,
                    &case.analista_id,
                    &case.estado.as_str(),
                    &case.prioridad.as_str(),
                    &case.workflow_state.as_str(),
                    &case.fecha_inicio,
                    &case.valor_estimado,
                    &case.honorario_total_uf,
                    &case.honorario_moneda,
                    &case.modalidad_cobro.map(BillingModality::as_str),
                    &case.tarifa_referencia,
                    &case.observaciones,
                    &case.created_by,
                ],
            )
            .await?;
        let record = row_to_case_record(&row)?;

        tx.execute(
            "INSERT INTO case_clients (case_id, client_id, es_principal) VALUES ($1, $2, TRUE)",
            &[&case.id, &case.cliente_principal_id],
        )
        .await?;

        for stage in &bundle.stages {
            insert_stage_pg(&tx, case.id, stage).await?;
        }

        tx.commit().await?;
        Ok(record)
    }

    async fn get_case(&self, id: Uuid) -> Result<Option<CaseRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt("SELECT * FROM cases WHERE id = $1", &[&id])
            .await?;
        row.map(|row| row_to_case_record(&row)).transpose()
    }

    async fn list_cases(&self, filter: &CaseFilter) -> Result<Vec<CaseRecord>, DatabaseError> {
        let mut clauses: Vec<String> = Vec::new();
        let mut params: Vec<Box<dyn ToSql + Sync + Send>> = Vec::new();

        if let Some(abogado_id) = filter.abogado_id {
            params.push(Box::new(abogado_id));
            clauses.push(format!("abogado_responsable = ${}", params.len()));
        }
        if let Some(cliente_id) = filter.cliente_id {
            params.push(Box::new(cliente_id));
            let idx = params.len();
            clauses.push(format!(
                "(cliente_principal_id = ${idx} OR id IN \
                 (SELECT case_id FROM case_clients WHERE client_id = ${idx}))"
            ));
        }
        if let Some(estado) = filter.estado {
            params.push(Box::new(estado.as_str().to_string()));
            clauses.push(format!("estado = ${}", params.len()));
        }

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        let sql = format!("SELECT * FROM cases{where_sql} ORDER BY created_at DESC");
        let param_refs: Vec<&(dyn ToSql + Sync)> = params
            .iter()
            .map(|p| p.as_ref() as &(dyn ToSql + Sync))
            .collect();

        let conn = self.conn().await?;
        let rows = conn.query(&sql, &param_refs).await?;
        rows.iter().map(row_to_case_record).collect()
    }

    async fn find_case_by_numero(
        &self,
        numero_causa: &str,
    ) -> Result<Option<Uuid>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "SELECT id FROM cases WHERE numero_causa = $1",
                &[&numero_causa],
            )
            .await?;
        Ok(row.map(|row| row.get("id")))
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

        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "UPDATE cases SET \
                 numero_causa = $2, caratulado = $3, materia = $4, tribunal = $5, \
                 cliente_principal_id = $6, nombre_cliente = $7, documento_cliente = $8, \
                 abogado_responsable = $9, analista_id = $10, estado = $11, prioridad = $12, \
                 workflow_state = $13, fecha_inicio = $14, valor_estimado = $15, \
                 honorario_total_uf = $16, honorario_pagado_uf = $17, honorario_moneda = $18, \
                 modalidad_cobro = $19, tarifa_referencia = $20, observaciones = $21, \
                 updated_at = NOW() \
                 WHERE id = $1 RETURNING *",
                &[
                    &id,
                    &merged.numero_causa,
                    &merged.caratulado,
                    &merged.materia,
                    &merged.tribunal,
                    &merged.cliente_principal_id,
                    &merged.nombre_cliente,
                    &merged.documento_cliente,
                    &merged.abogado_responsable,
                    &merged.analista_id,
                    &merged.estado.as_str(),
                    &merged.prioridad.as_str(),
                    &merged.workflow_state.as_str(),
                    &merged.fecha_inicio,
                    &merged.valor_estimado,
                    &merged.honorario_total_uf,
                    &merged.honorario_pagado_uf,
                    &merged.honorario_moneda,
                    &merged.modalidad_cobro.map(BillingModality::as_str),
                    &merged.tarifa_referencia,
                    &merged.observaciones,
                ],
            )
            .await?;
        row.map(|row| row_to_case_record(&row)).transpose()
    }

    async fn delete_case(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let conn = self.conn().await?;
        let affected = conn
            .execute("DELETE FROM cases WHERE id = $1", &[&id])
            .await?;
        Ok(affected > 0)
    }

    async fn list_case_clients(
        &self,
        case_id: Uuid,
    ) -> Result<Vec<CaseClientRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT case_id, client_id, es_principal, created_at FROM case_clients \
                 WHERE case_id = $1 ORDER BY es_principal DESC, created_at ASC",
                &[&case_id],
            )
            .await?;
        Ok(rows.iter().map(row_to_case_client_record).collect())
    }

    async fn link_case_client(
        &self,
        case_id: Uuid,
        client_id: Uuid,
        es_principal: bool,
    ) -> Result<CaseClientRecord, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                "INSERT INTO case_clients (case_id, client_id, es_principal) VALUES ($1, $2, $3) \
                 ON CONFLICT (case_id, client_id) DO UPDATE \
                 SET es_principal = case_clients.es_principal OR EXCLUDED.es_principal \
                 RETURNING case_id, client_id, es_principal, created_at",
                &[&case_id, &client_id, &es_principal],
            )
            .await?;
        Ok(row_to_case_client_record(&row))
    }

    async fn is_client_linked(
        &self,
        case_id: Uuid,
        client_id: Uuid,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                "SELECT EXISTS ( \
                   SELECT 1 FROM cases WHERE id = $1 AND cliente_principal_id = $2 \
                   UNION ALL \
                   SELECT 1 FROM case_clients WHERE case_id = $1 AND client_id = $2 \
                 ) AS linked",
                &[&case_id, &client_id],
            )
            .await?;
        Ok(row.get("linked"))
    }

    async fn apply_scope_change(
        &self,
        change: &ScopeChange,
    ) -> Result<Option<u64>, DatabaseError> {
        let mut conn = self.conn().await?;
        let tx = conn.transaction().await?;

        let swapped = tx
            .execute(
                "UPDATE cases SET alcance_cliente_solicitado = $2, \
                 alcance_cliente_autorizado = $3, updated_at = NOW() \
                 WHERE id = $1 AND alcance_cliente_solicitado = $4 \
                 AND alcance_cliente_autorizado = $5",
                &[
                    &change.case_id,
                    &change.next.solicitado,
                    &change.next.autorizado,
                    &change.expected.solicitado,
                    &change.expected.autorizado,
                ],
            )
            .await?;
        if swapped == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        let payment = &change.payment;
        let mut moved = 0;
        if !payment.from.is_empty() {
            let from: Vec<String> = payment
                .from
                .iter()
                .map(|status| status.as_str().to_string())
                .collect();
            let (requester, requested_at) = payment.requested_by.unzip();
            moved = tx
                .execute(
                    "UPDATE case_stages SET estado_pago = $3, \
                     solicitado_por = COALESCE($4, solicitado_por), \
                     solicitado_at = COALESCE($5, solicitado_at), updated_at = NOW() \
                     WHERE case_id = $1 AND orden <= $2 AND requiere_pago \
                     AND estado_pago = ANY($6)",
                    &[
                        &change.case_id,
                        &payment.max_orden,
                        &payment.to.as_str(),
                        &requester,
                        &requested_at,
                        &from,
                    ],
                )
                .await?;
        }

        tx.commit().await?;
        Ok(Some(moved))
    }
}

#[async_trait]
impl StageStore for PgBackend {
    async fn list_stages(
        &self,
        case_id: Uuid,
        public_only: bool,
    ) -> Result<Vec<StageRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT * FROM case_stages WHERE case_id = $1 AND (es_publica OR NOT $2) \
                 ORDER BY orden ASC",
                &[&case_id, &public_only],
            )
            .await?;
        rows.iter().map(row_to_stage_record).collect()
    }

    async fn get_stage(&self, id: Uuid) -> Result<Option<StageRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt("SELECT * FROM case_stages WHERE id = $1", &[&id])
            .await?;
        row.map(|row| row_to_stage_record(&row)).transpose()
    }

    async fn create_stage(
        &self,
        case_id: Uuid,
        input: &NewStage,
    ) -> Result<StageRecord, DatabaseError> {
        let mut conn = self.conn().await?;
        let tx = conn.transaction().await?;
        let id = insert_stage_pg(&tx, case_id, input).await?;
        tx.commit().await?;
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

        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "UPDATE case_stages SET \
                 etapa = $2, descripcion = $3, fecha_programada = $4, orden = $5, estado = $6, \
                 es_publica = $7, requiere_pago = $8, costo_uf = $9, porcentaje_variable = $10, \
                 estado_pago = $11, enlace_pago = $12, monto_pagado_uf = $13, completado_at = $14, \
                 audiencia_tipo = $15, audiencia_fecha = $16, audiencia_lugar = $17, \
                 updated_at = NOW() \
                 WHERE id = $1 RETURNING *",
                &[
                    &id,
                    &merged.etapa,
                    &merged.descripcion,
                    &merged.fecha_programada,
                    &merged.orden,
                    &merged.estado.as_str(),
                    &merged.es_publica,
                    &merged.requiere_pago,
                    &merged.costo_uf,
                    &merged.porcentaje_variable,
                    &merged.estado_pago.as_str(),
                    &merged.enlace_pago,
                    &merged.monto_pagado_uf,
                    &merged.completado_at,
                    &merged.audiencia_tipo,
                    &merged.audiencia_fecha,
                    &merged.audiencia_lugar,
                ],
            )
            .await?;
        row.map(|row| row_to_stage_record(&row)).transpose()
    }

    async fn delete_stage(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let conn = self.conn().await?;
        let affected = conn
            .execute("DELETE FROM case_stages WHERE id = $1", &[&id])
            .await?;
        Ok(affected > 0)
    }
}

#[async_trait]
impl AuditStore for PgBackend {
    async fn append_audit_log(
        &self,
        input: &CreateAuditLogParams,
    ) -> Result<AuditLogRecord, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                "INSERT INTO audit_log (id, actor_id, action, entity_type, entity_id, diff) \
                 VALUES ($1, $2, $3, $4, $5, $6) RETURNING *",
                &[
                    &Uuid::new_v4(),
                    &input.actor_id,
                    &input.action.as_str(),
                    &input.entity_type,
                    &input.entity_id,
                    &input.diff,
                ],
            )
            .await?;
        row_to_audit_record(&row)
    }

    async fn list_audit_logs(
        &self,
        filter: &AuditLogFilter,
    ) -> Result<Vec<AuditLogRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT * FROM audit_log \
                 WHERE ($1::TEXT IS NULL OR entity_type = $1) \
                   AND ($2::TEXT IS NULL OR entity_id = $2) \
                 ORDER BY created_at DESC LIMIT $3",
                &[&filter.entity_type, &filter.entity_id, &filter.limit.max(1)],
            )
            .await?;
        rows.iter().map(row_to_audit_record).collect()
    }
}

#[async_trait]
impl Database for PgBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let mut client = self.conn().await?;
        let report = embedded::migrations::runner()
            .run_async(&mut **client)
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;
        tracing::info!(
            applied = report.applied_migrations().len(),
            "postgres migrations complete"
        );
        Ok(())
    }
}

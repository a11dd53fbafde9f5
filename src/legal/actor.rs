//! Caller identity and the role rules every workflow operation checks.

use serde::Serialize;
use uuid::Uuid;

use crate::db::{CaseRecord, Database, ProfileRecord, UserRole, WorkflowState};
use crate::error::CaseError;

/// The authenticated profile on whose behalf an operation runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Actor {
    pub profile_id: Uuid,
    pub role: UserRole,
    pub full_name: String,
}

impl From<&ProfileRecord> for Actor {
    fn from(profile: &ProfileRecord) -> Self {
        Self {
            profile_id: profile.id,
            role: profile.role,
            full_name: profile.full_name.clone(),
        }
    }
}

impl Actor {
    /// Load the actor for a profile id, or `None` when no such profile exists.
    pub async fn resolve(db: &dyn Database, profile_id: Uuid) -> Result<Option<Self>, CaseError> {
        Ok(db.get_profile(profile_id).await?.as_ref().map(Self::from))
    }

    pub fn is_admin(&self) -> bool {
        self.role == UserRole::AdminFirma
    }

    pub fn is_staff(&self) -> bool {
        self.role.is_staff()
    }

    /// Fails unless the actor holds one of `roles`.
    pub fn require_role(&self, roles: &[UserRole], action: &str) -> Result<(), CaseError> {
        if roles.contains(&self.role) {
            Ok(())
        } else {
            Err(CaseError::PermissionDenied(format!(
                "el rol {} no puede {}",
                self.role.as_str(),
                action
            )))
        }
    }

    pub fn require_staff(&self, action: &str) -> Result<(), CaseError> {
        if self.is_staff() {
            Ok(())
        } else {
            Err(CaseError::PermissionDenied(format!(
                "solo el personal de la firma puede {}",
                action
            )))
        }
    }

    /// Edit rights on a case and on its stages and payments.
    pub fn can_manage_case(&self, case: &CaseRecord) -> bool {
        match self.role {
            UserRole::AdminFirma => true,
            UserRole::Abogado => case.abogado_responsable == Some(self.profile_id),
            UserRole::Analista => {
                case.analista_id == Some(self.profile_id)
                    && case.workflow_state != WorkflowState::Cerrado
            }
            UserRole::Cliente => false,
        }
    }

    pub fn require_manage(&self, case: &CaseRecord) -> Result<(), CaseError> {
        if self.can_manage_case(case) {
            Ok(())
        } else {
            Err(CaseError::PermissionDenied(
                "no tiene permisos para modificar este caso".to_string(),
            ))
        }
    }

    /// Read rights for staff. Client visibility depends on the client links
    /// and is checked by [`can_view_case`].
    fn staff_can_view(&self, case: &CaseRecord) -> bool {
        match self.role {
            UserRole::AdminFirma | UserRole::Analista => true,
            UserRole::Abogado => case.abogado_responsable == Some(self.profile_id),
            UserRole::Cliente => false,
        }
    }
}

/// Read rights on a case, including client links.
pub async fn can_view_case(
    db: &dyn Database,
    actor: &Actor,
    case: &CaseRecord,
) -> Result<bool, CaseError> {
    if actor.role == UserRole::Cliente {
        if case.cliente_principal_id == Some(actor.profile_id) {
            return Ok(true);
        }
        return Ok(db.is_client_linked(case.id, actor.profile_id).await?);
    }
    Ok(actor.staff_can_view(case))
}

pub async fn require_view(
    db: &dyn Database,
    actor: &Actor,
    case: &CaseRecord,
) -> Result<(), CaseError> {
    if can_view_case(db, actor, case).await? {
        Ok(())
    } else {
        Err(CaseError::PermissionDenied(
            "no tiene acceso a este caso".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use rust_decimal::Decimal;

    use super::*;
    use crate::db::{CasePriority, CaseStatus};

    fn actor(role: UserRole) -> Actor {
        Actor {
            profile_id: Uuid::new_v4(),
            role,
            full_name: "Test".to_string(),
        }
    }

    fn case_for(abogado: Option<Uuid>, analista: Option<Uuid>, state: WorkflowState) -> CaseRecord {
        let now = Utc::now();
        CaseRecord {
            id: Uuid::new_v4(),
            numero_causa: None,
            caratulado: "A c/ B".to_string(),
            materia: None,
            tribunal: None,
            cliente_principal_id: None,
            nombre_cliente: "A".to_string(),
            documento_cliente: None,
            abogado_responsable: abogado,
            analista_id: analista,
            estado: CaseStatus::Activo,
            prioridad: CasePriority::Media,
            workflow_state: state,
            fecha_inicio: None,
            valor_estimado: None,
            honorario_total_uf: None,
            honorario_pagado_uf: Decimal::ZERO,
            honorario_moneda: "BOB".to_string(),
            modalidad_cobro: None,
            tarifa_referencia: None,
            alcance_cliente_solicitado: 0,
            alcance_cliente_autorizado: 0,
            observaciones: None,
            created_by: Uuid::new_v4(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn admin_manages_every_case() {
        let admin = actor(UserRole::AdminFirma);
        assert!(admin.can_manage_case(&case_for(None, None, WorkflowState::Cerrado)));
    }

    #[test]
    fn lawyer_manages_only_own_cases() {
        let lawyer = actor(UserRole::Abogado);
        assert!(lawyer.can_manage_case(&case_for(
            Some(lawyer.profile_id),
            None,
            WorkflowState::Activo
        )));
        assert!(!lawyer.can_manage_case(&case_for(
            Some(Uuid::new_v4()),
            None,
            WorkflowState::Activo
        )));
    }

    #[test]
    fn analyst_loses_edit_rights_on_closed_cases() {
        let analyst = actor(UserRole::Analista);
        let open = case_for(None, Some(analyst.profile_id), WorkflowState::EnRevision);
        let closed = case_for(None, Some(analyst.profile_id), WorkflowState::Cerrado);
        let foreign = case_for(None, Some(Uuid::new_v4()), WorkflowState::Activo);
        assert!(analyst.can_manage_case(&open));
        assert!(!analyst.can_manage_case(&closed));
        assert!(!analyst.can_manage_case(&foreign));
    }

    #[test]
    fn clients_never_manage() {
        let client = actor(UserRole::Cliente);
        let err = client
            .require_manage(&case_for(None, None, WorkflowState::Preparacion))
            .expect_err("clients cannot edit");
        assert!(matches!(err, CaseError::PermissionDenied(_)));
        assert!(client.require_staff("listar abogados").is_err());
    }

    #[test]
    fn require_role_names_the_role() {
        let err = actor(UserRole::Cliente)
            .require_role(&[UserRole::Abogado, UserRole::Analista], "crear casos")
            .expect_err("client cannot create");
        assert_eq!(err.to_string(), "No autorizado: el rol cliente no puede crear casos");
    }
}

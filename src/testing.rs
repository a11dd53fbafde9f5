//! Fixtures for store-backed unit tests.

use std::sync::Arc;

use rust_decimal_macros::dec;
use uuid::Uuid;

use crate::config::WorkflowConfig;
use crate::db::libsql::LibSqlBackend;
use crate::db::{BillingModality, CreateProfileParams, Database, UserRole};
use crate::legal::cases::CreateCaseInput;
use crate::legal::{Actor, Workflow};

/// Fresh libsql database in a temp dir. Keep the `TempDir` alive for the test.
pub(crate) async fn test_db() -> (Arc<dyn Database>, tempfile::TempDir) {
    let tmpdir = tempfile::tempdir().expect("tempdir");
    let backend = LibSqlBackend::new_local(&tmpdir.path().join("workflow_test.db"))
        .await
        .expect("local backend should initialize");
    backend
        .run_migrations()
        .await
        .expect("migrations should succeed");
    (Arc::new(backend), tmpdir)
}

pub(crate) async fn test_workflow() -> (Workflow, tempfile::TempDir) {
    let (db, tmpdir) = test_db().await;
    (Workflow::new(db, WorkflowConfig::default()), tmpdir)
}

pub(crate) async fn seed_actor(db: &dyn Database, role: UserRole, full_name: &str) -> Actor {
    let profile = db
        .create_profile(&CreateProfileParams {
            full_name: full_name.to_string(),
            email: format!("{}-{}@example.com", role.as_str(), Uuid::new_v4().simple()),
            role,
            telefono: Some("+591 70000000".to_string()),
        })
        .await
        .expect("seed profile");
    Actor::from(&profile)
}

/// The usual cast of a case: admin, lawyer, analyst and client.
pub(crate) struct Cast {
    pub admin: Actor,
    pub lawyer: Actor,
    pub analyst: Actor,
    pub client: Actor,
}

pub(crate) async fn seed_cast(db: &dyn Database) -> Cast {
    Cast {
        admin: seed_actor(db, UserRole::AdminFirma, "Ana Admin").await,
        lawyer: seed_actor(db, UserRole::Abogado, "Luis Abogado").await,
        analyst: seed_actor(db, UserRole::Analista, "Marta Analista").await,
        client: seed_actor(db, UserRole::Cliente, "Carla Cliente").await,
    }
}

/// Prepaid Laboral case worth 6000 BOB: six stages of 1200, 1200, 1200, 1200, 600, 600.
pub(crate) fn sample_case_input(client_id: Uuid) -> CreateCaseInput {
    CreateCaseInput {
        caratulado: "Carla Cliente c/ Empresa Andina S.A.".to_string(),
        materia: Some("Laboral".to_string()),
        tribunal: Some("Juzgado 1ro de Trabajo".to_string()),
        cliente_principal_id: Some(client_id),
        honorario_total_uf: Some(dec!(6000)),
        honorario_moneda: Some("BOB".to_string()),
        modalidad_cobro: Some(BillingModality::Prepago),
        ..Default::default()
    }
}

//! LEX Altius command line.
//!
//! Usage:
//!   lexaltius [serve]                  - Run the HTTP gateway (default)
//!   lexaltius migrate                  - Apply database migrations and exit
//!   lexaltius plan-stages <materia>    - Print the initial stage plan of a case

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use secrecy::ExposeSecret;
use tracing_subscriber::EnvFilter;

use lexaltius::config::Config;
use lexaltius::db::{self, BillingModality};
use lexaltius::legal::Workflow;
use lexaltius::legal::templates::{FeeTerms, StagePlanInput, generate_stages};
use lexaltius::settings::Settings;
use lexaltius::web::{GatewayState, start_server};

#[derive(Parser)]
#[command(name = "lexaltius")]
#[command(about = "Case, stage and payment workflow for law firms")]
#[command(version)]
struct Cli {
    /// Settings file (TOML)
    #[arg(short, long, env = "LEXALTIUS_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP gateway
    Serve,

    /// Apply database migrations and exit
    Migrate,

    /// Print the stage plan generated for a new case
    PlanStages {
        /// Case materia (Civil, Comercial, Laboral, Familia)
        materia: String,
        /// Start date (YYYY-MM-DD); defaults to today
        #[arg(long)]
        fecha_inicio: Option<NaiveDate>,
        /// Agreed total fee
        #[arg(long)]
        honorario: Option<Decimal>,
        /// Fee currency
        #[arg(long, default_value = "BOB")]
        moneda: String,
        /// Billing modality (prepago, postpago, mixto)
        #[arg(long, default_value = "prepago")]
        modalidad: String,
        /// Fee schedule reference used when no total is given
        #[arg(long)]
        tarifa: Option<String>,
        /// Estimated claim value for percentage fees
        #[arg(long)]
        valor_estimado: Option<Decimal>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("lexaltius=info,tower_http=info"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(cli.config).await,
        Commands::Migrate => migrate(cli.config).await,
        Commands::PlanStages {
            materia,
            fecha_inicio,
            honorario,
            moneda,
            modalidad,
            tarifa,
            valor_estimado,
        } => {
            let modalidad = BillingModality::from_db_value(&modalidad)
                .with_context(|| format!("unknown billing modality '{modalidad}'"))?;
            let input = StagePlanInput {
                materia: Some(materia),
                fecha_inicio,
                fees: FeeTerms {
                    honorario_total_uf: honorario,
                    honorario_moneda: moneda,
                    modalidad_cobro: Some(modalidad),
                    tarifa_referencia: tarifa,
                    valor_estimado,
                },
                hearing: None,
            };
            plan_stages(&input)
        }
    }
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<Config> {
    let settings = Settings::load(path.as_deref()).context("loading settings")?;
    Config::resolve(&settings).context("resolving configuration")
}

async fn migrate(path: Option<PathBuf>) -> anyhow::Result<()> {
    let config = load_config(path)?;
    db::connect_from_config(&config.database)
        .await
        .context("connecting to the database")?;
    tracing::info!(backend = ?config.database.backend, "migrations applied");
    Ok(())
}

async fn serve(path: Option<PathBuf>) -> anyhow::Result<()> {
    let config = load_config(path)?;
    let Some(token) = config.gateway.auth_token.as_ref() else {
        bail!("GATEWAY_AUTH_TOKEN must be set to run the gateway");
    };

    let addr: SocketAddr = format!("{}:{}", config.gateway.host, config.gateway.port)
        .parse()
        .with_context(|| {
            format!(
                "invalid gateway address {}:{}",
                config.gateway.host, config.gateway.port
            )
        })?;

    let database = db::connect_from_config(&config.database)
        .await
        .context("connecting to the database")?;
    let workflow = Workflow::new(database, config.workflow.clone());
    let state = Arc::new(GatewayState::new(workflow));

    let (bound, handle) =
        start_server(addr, state.clone(), token.expose_secret().to_string()).await?;
    tracing::info!("LEX Altius gateway ready on http://{}", bound);

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    state.shutdown().await;
    handle.await.context("gateway task panicked")?;
    Ok(())
}

fn plan_stages(input: &StagePlanInput) -> anyhow::Result<()> {
    let stages = generate_stages(input, Utc::now().date_naive()).map_err(anyhow::Error::msg)?;
    for stage in &stages {
        let fecha = stage
            .fecha_programada
            .map(|f| f.to_string())
            .unwrap_or_else(|| "-".to_string());
        let costo = stage
            .costo_uf
            .map(|c| c.to_string())
            .unwrap_or_else(|| "-".to_string());
        let visibilidad = if stage.es_publica { "publica" } else { "interna" };
        println!(
            "{:>2}  {:<40} {:<10} {:>12}  {}",
            stage.orden, stage.etapa, fecha, costo, visibilidad
        );
    }
    Ok(())
}

//! Operator command line

use chrono::{NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use sqlx::PgPool;

use crate::{
    config::AppConfig,
    error::AppResult,
    models::{
        change_request::{Origin, RequestQuery, RequestState, RequestType},
        equipment::EquipmentQuery,
    },
    repository::Repository,
    services::Services,
};

/// Labfleet - laboratory equipment ledger and change-request workflow
#[derive(Debug, Parser)]
#[command(name = "labfleet", version, about, long_about = None)]
pub struct Cli {
    /// Configuration directory
    #[arg(short, long, default_value = "config", env = "LABFLEET_CONFIG_DIR")]
    pub config: String,

    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level commands
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Apply pending database migrations
    Migrate,
    /// Disable every equipment whose validity date has passed
    SweepExpired {
        /// Reference date (YYYY-MM-DD), defaults to today
        #[arg(long)]
        as_of: Option<NaiveDate>,
    },
    /// Equipment inspection and maintenance
    Equipment(EquipmentArgs),
    /// Change request inspection
    Requests(RequestsArgs),
}

#[derive(Debug, Args)]
pub struct EquipmentArgs {
    #[command(subcommand)]
    pub command: EquipmentCommand,
}

#[derive(Debug, Subcommand)]
pub enum EquipmentCommand {
    /// Show the live record
    Show { id: i32 },
    /// Show the most recent history entries
    History { id: i32 },
    /// List equipment
    List {
        #[arg(long)]
        search: Option<String>,
        #[arg(long = "type")]
        equipment_type: Option<String>,
        #[arg(long)]
        location: Option<String>,
        #[arg(long)]
        enabled: Option<bool>,
        #[arg(long, default_value_t = 1)]
        page: i64,
        #[arg(long, default_value_t = 50)]
        per_page: i64,
    },
    /// Make a history entry live again
    Restore {
        id: i32,
        history_id: i32,
        /// Acting user
        #[arg(long)]
        actor: Option<i32>,
    },
    /// Propose a code for a new equipment
    SuggestCode {
        #[arg(long = "type")]
        equipment_type: String,
        #[arg(long)]
        location: String,
        #[arg(long, default_value = "")]
        name: String,
    },
}

#[derive(Debug, Args)]
pub struct RequestsArgs {
    #[command(subcommand)]
    pub command: RequestsCommand,
}

#[derive(Debug, Subcommand)]
pub enum RequestsCommand {
    /// Show one request
    Show { id: i32 },
    /// List requests, newest first
    List {
        /// State, e.g. PENDING_QUALITY
        #[arg(long)]
        state: Option<String>,
        /// Request type, e.g. DECOMMISSION
        #[arg(long = "type")]
        request_type: Option<String>,
        #[arg(long)]
        requester: Option<i32>,
        #[arg(long)]
        exclude_requester: Option<i32>,
        /// FIELD_SAMPLER or TECHNICAL_STAFF
        #[arg(long)]
        origin: Option<String>,
    },
}

fn print_json<T: Serialize>(value: &T) -> AppResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

impl Cli {
    /// Execute the selected command against the database
    pub async fn execute(&self, config: AppConfig, pool: PgPool) -> AppResult<()> {
        if let Commands::Migrate = self.command {
            sqlx::migrate!("./migrations")
                .run(&pool)
                .await
                .map_err(sqlx::Error::from)?;
            tracing::info!("Database migrations completed");
            return Ok(());
        }

        let services = Services::new(Repository::new(pool), &config);

        match &self.command {
            Commands::Migrate => Ok(()),
            Commands::SweepExpired { as_of } => {
                let as_of = as_of.unwrap_or_else(|| Utc::now().date_naive());
                let disabled = services.equipment.sweep_expired(as_of).await?;
                println!("{} equipment disabled (validity before {})", disabled, as_of);
                Ok(())
            }
            Commands::Equipment(args) => match &args.command {
                EquipmentCommand::Show { id } => print_json(&services.equipment.get_by_id(*id).await?),
                EquipmentCommand::History { id } => print_json(&services.equipment.history(*id).await?),
                EquipmentCommand::List {
                    search,
                    equipment_type,
                    location,
                    enabled,
                    page,
                    per_page,
                } => {
                    let query = EquipmentQuery {
                        search: search.clone(),
                        equipment_type: equipment_type.clone(),
                        location: location.clone(),
                        enabled: *enabled,
                        page: Some(*page),
                        per_page: Some(*per_page),
                    };
                    print_json(&services.equipment.list(&query).await?)
                }
                EquipmentCommand::Restore { id, history_id, actor } => {
                    print_json(&services.equipment.restore(*id, *history_id, *actor).await?)
                }
                EquipmentCommand::SuggestCode {
                    equipment_type,
                    location,
                    name,
                } => print_json(
                    &services
                        .equipment
                        .suggest_code(equipment_type, location, name)
                        .await?,
                ),
            },
            Commands::Requests(args) => match &args.command {
                RequestsCommand::Show { id } => print_json(&services.workflow.get_by_id(*id).await?),
                RequestsCommand::List {
                    state,
                    request_type,
                    requester,
                    exclude_requester,
                    origin,
                } => {
                    let query = RequestQuery {
                        state: state.as_deref().map(str::parse::<RequestState>).transpose()?,
                        request_type: request_type.as_deref().map(str::parse::<RequestType>).transpose()?,
                        requester_id: *requester,
                        exclude_requester_id: *exclude_requester,
                        origin: origin.as_deref().map(str::parse::<Origin>).transpose()?,
                    };
                    print_json(&services.workflow.list(&query).await?)
                }
            },
        }
    }
}

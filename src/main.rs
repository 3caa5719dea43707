use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;

use fernhill_lib::model::{BookingRequest, PublishRequest, SlotEntry};
use fernhill_lib::state::AppState;
use fernhill_lib::sync::{DirectoryClient, SyncBridge};
use fernhill_lib::AppError;

#[derive(Debug, Parser)]
#[command(name = "fernhill", about = "Fernhill clinic application", version)]
struct Cli {
    /// Application data directory. Defaults to the platform data dir.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// First-run setup: create the encrypted store and print the recovery code.
    Setup {
        #[arg(long)]
        password: String,
    },
    /// Unlock an existing installation and print its status.
    Login {
        #[arg(long)]
        password: String,
    },
    /// Reset the password with a recovery code; prints the reissued code.
    Recover {
        #[arg(long)]
        code: String,
        #[arg(long)]
        new_password: String,
    },
    /// Show vault, schema and backup status.
    Status,
    /// Register this clinic with the directory and store its credentials.
    Onboard {
        #[arg(long)]
        password: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        city: String,
        #[arg(long)]
        specialty: Option<String>,
        #[arg(long)]
        directory_url: String,
        #[arg(long, env = "FERNHILL_APP_SECRET")]
        app_secret: String,
    },
    /// Publish availability for the given dates.
    Publish {
        #[arg(long)]
        password: String,
        /// Date to (re)publish, repeatable.
        #[arg(long = "date", required = true)]
        dates: Vec<String>,
        /// Slot as "YYYY-MM-DD HH:MM", repeatable.
        #[arg(long = "slot")]
        slots: Vec<String>,
    },
    /// Book a slot against the directory (patient-side helper).
    Book {
        #[arg(long)]
        directory_url: String,
        #[arg(long)]
        slot_id: Option<String>,
        #[arg(long)]
        clinic_id: Option<String>,
        #[arg(long)]
        patient_name: String,
        #[arg(long)]
        phone: Option<String>,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Run one sync cycle against the directory outbox.
    SyncNow {
        #[arg(long)]
        password: String,
    },
    /// Run a backup immediately (local, then cloud if authenticated).
    BackupNow {
        #[arg(long)]
        password: String,
    },
    /// Configure the daily backup schedules ("HH:MM" or a cron expression).
    Schedule {
        #[arg(long)]
        password: String,
        #[arg(long)]
        local: Option<String>,
        #[arg(long)]
        cloud: Option<String>,
    },
    /// List synced appointment requests, or advance one request's status.
    Requests {
        #[arg(long)]
        password: String,
        /// Request id to update; lists all requests when omitted.
        #[arg(long, requires = "set_status")]
        id: Option<String>,
        #[arg(long, value_parser = ["accepted", "rejected"], requires = "id")]
        set_status: Option<String>,
    },
    /// List local backup files, newest first.
    ListBackups,
    /// Overwrite the store with a backup file. Requires a restart afterwards.
    Restore {
        backup_path: PathBuf,
    },
}

fn data_dir(cli: &Cli) -> Result<PathBuf> {
    if let Some(dir) = &cli.data_dir {
        return Ok(dir.clone());
    }
    let base = dirs::data_dir().context("no platform data directory")?;
    Ok(base.join("fernhill"))
}

async fn unlocked_state(cli: &Cli, password: &str) -> Result<AppState> {
    let state = AppState::new(data_dir(cli)?);
    state.login(password).await.map_err(print_and_exit)?;
    Ok(state)
}

fn print_and_exit(err: AppError) -> anyhow::Error {
    eprintln!("{}", json!({ "error": err }));
    process::exit(1);
}

fn parse_slot(text: &str) -> Result<SlotEntry> {
    let mut parts = text.split_whitespace();
    let (Some(date), Some(time), None) = (parts.next(), parts.next(), parts.next()) else {
        anyhow::bail!("slot must be \"YYYY-MM-DD HH:MM\", got `{text}`");
    };
    Ok(SlotEntry {
        date: date.to_string(),
        time: time.to_string(),
    })
}

async fn clinic_bridge(state: &AppState) -> Result<SyncBridge> {
    let settings = state.settings().await.map_err(print_and_exit)?;
    let (Some(url), Some(clinic_id), Some(api_key)) = (
        settings.directory_url.clone(),
        settings.clinic_id.clone(),
        settings.clinic_api_key.clone(),
    ) else {
        return Err(print_and_exit(AppError::new(
            AppError::NOT_SETUP,
            "Clinic is not onboarded; run `fernhill onboard` first",
        )));
    };
    Ok(SyncBridge::new(DirectoryClient::with_credentials(
        url, clinic_id, api_key,
    )))
}

#[tokio::main]
async fn main() -> Result<()> {
    fernhill_lib::logging::init();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Setup { password } => {
            let state = AppState::new(data_dir(&cli)?);
            let code = state.setup(password).await.map_err(print_and_exit)?;
            println!(
                "{}",
                json!({ "status": "ok", "recoveryCode": code, "note": "Store the recovery code somewhere safe; it is shown only once." })
            );
            state.vault.close().await;
        }
        Commands::Login { password } => {
            let state = unlocked_state(&cli, password).await?;
            println!("{}", json!({ "status": "ok", "report": state.status().await }));
            state.shutdown().await;
        }
        Commands::Recover { code, new_password } => {
            let state = AppState::new(data_dir(&cli)?);
            let reissued = state
                .recover(code, new_password)
                .await
                .map_err(print_and_exit)?;
            println!("{}", json!({ "status": "ok", "recoveryCode": reissued }));
            state.vault.close().await;
        }
        Commands::Status => {
            let state = AppState::new(data_dir(&cli)?);
            println!("{}", json!(state.status().await));
        }
        Commands::Onboard {
            password,
            name,
            city,
            specialty,
            directory_url,
            app_secret,
        } => {
            let state = unlocked_state(&cli, password).await?;
            let client = DirectoryClient::new(directory_url.clone());
            let result = client
                .onboard(app_secret, name, city, specialty.as_deref())
                .await
                .map_err(print_and_exit)?;

            let mut settings = state.settings().await.map_err(print_and_exit)?;
            settings.directory_url = Some(directory_url.clone());
            settings.clinic_id = Some(result.clinic_id.clone());
            settings.clinic_api_key = Some(result.api_key.clone());
            state
                .save_settings(&settings)
                .await
                .map_err(print_and_exit)?;

            println!("{}", json!({ "status": "ok", "clinicId": result.clinic_id }));
            state.vault.close().await;
        }
        Commands::Publish {
            password,
            dates,
            slots,
        } => {
            let state = unlocked_state(&cli, password).await?;
            let bridge = clinic_bridge(&state).await?;
            let entries = slots
                .iter()
                .map(|s| parse_slot(s))
                .collect::<Result<Vec<_>>>()?;
            let count = bridge
                .client()
                .publish(&PublishRequest {
                    dates: dates.clone(),
                    slots: entries,
                })
                .await
                .map_err(print_and_exit)?;
            println!("{}", json!({ "status": "ok", "count": count }));
            state.vault.close().await;
        }
        Commands::Book {
            directory_url,
            slot_id,
            clinic_id,
            patient_name,
            phone,
            reason,
        } => {
            let client = DirectoryClient::new(directory_url.clone());
            let message_id = client
                .book(&BookingRequest {
                    slot_id: slot_id.clone(),
                    clinic_id: clinic_id.clone(),
                    patient_name: patient_name.clone(),
                    phone: phone.clone(),
                    reason: reason.clone(),
                })
                .await
                .map_err(print_and_exit)?;
            println!("{}", json!({ "status": "queued", "messageId": message_id }));
        }
        Commands::SyncNow { password } => {
            let state = unlocked_state(&cli, password).await?;
            let bridge = clinic_bridge(&state).await?;
            let pool = state.vault.store().map_err(print_and_exit)?;
            let report = bridge.sync_once(&pool).await.map_err(print_and_exit)?;
            println!("{}", json!({ "status": "ok", "report": report }));
            state.vault.close().await;
        }
        Commands::BackupNow { password } => {
            let state = unlocked_state(&cli, password).await?;
            state.scheduler.run_backup().await;
            println!(
                "{}",
                json!({ "status": "ok", "backups": state.scheduler.list_backups().map_err(print_and_exit)? })
            );
            state.vault.close().await;
        }
        Commands::Schedule {
            password,
            local,
            cloud,
        } => {
            for text in [local, cloud].into_iter().flatten() {
                fernhill_lib::schedule::ScheduleSpec::parse(text).map_err(|err| {
                    print_and_exit(AppError::new(AppError::VALIDATION, err.to_string()))
                })?;
            }
            let state = unlocked_state(&cli, password).await?;
            let mut settings = state.settings().await.map_err(print_and_exit)?;
            if local.is_some() {
                settings.backup_local_schedule = local.clone();
            }
            if cloud.is_some() {
                settings.backup_cloud_schedule = cloud.clone();
                settings.cloud_enabled = true;
            }
            state
                .save_settings(&settings)
                .await
                .map_err(print_and_exit)?;
            println!("{}", json!({ "status": "ok" }));
            state.vault.close().await;
        }
        Commands::Requests {
            password,
            id,
            set_status,
        } => {
            let state = unlocked_state(&cli, password).await?;
            let pool = state.vault.store().map_err(print_and_exit)?;
            if let (Some(id), Some(status)) = (id, set_status) {
                let status = match status.as_str() {
                    "accepted" => fernhill_lib::model::RequestStatus::Accepted,
                    _ => fernhill_lib::model::RequestStatus::Rejected,
                };
                fernhill_lib::sync::set_request_status(&pool, id, status)
                    .await
                    .map_err(print_and_exit)?;
                println!("{}", json!({ "status": "ok" }));
            } else {
                let requests = fernhill_lib::sync::list_requests(&pool)
                    .await
                    .map_err(print_and_exit)?;
                println!("{}", json!(requests));
            }
            state.vault.close().await;
        }
        Commands::ListBackups => {
            let state = AppState::new(data_dir(&cli)?);
            let backups = state.scheduler.list_backups().map_err(print_and_exit)?;
            println!("{}", json!(backups));
        }
        Commands::Restore { backup_path } => {
            let state = AppState::new(data_dir(&cli)?);
            let target = state
                .scheduler
                .restore(backup_path)
                .await
                .map_err(print_and_exit)?;
            println!(
                "{}",
                json!({
                    "status": "ok",
                    "restoredTo": target.display().to_string(),
                    "note": "Restart the application before unlocking again."
                })
            );
        }
    }

    Ok(())
}

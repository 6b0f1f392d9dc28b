use anyhow::Result;
use clap::{Parser, Subcommand};
use shared::domain::{EventKind, SessionId};
use storage::Storage;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/coordinator.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Newest-first lifecycle intents for one service on one host.
    History {
        service: String,
        host: String,
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// Job rows, including any left behind by earlier sessions.
    Jobs {
        #[arg(long)]
        session: Option<String>,
    },
    /// Records a start or stop intent without going through the coordinator.
    Record {
        service: String,
        host: String,
        kind: EventKind,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let storage = Storage::new(&storage::normalize_database_url(&cli.database_url)).await?;

    match cli.command {
        Command::History {
            service,
            host,
            limit,
        } => {
            let events = storage
                .service_event_history(&service, &host, limit)
                .await?;
            if events.is_empty() {
                println!("no events for {service}@{host}");
            }
            for event in events {
                println!(
                    "{}  {:<5}  {}@{}",
                    event.timestamp.to_rfc3339(),
                    event.kind.as_str(),
                    event.service,
                    event.host
                );
            }
        }
        Command::Jobs { session } => {
            let session = session.map(SessionId);
            for job in storage.list_jobs(session.as_ref()).await? {
                println!(
                    "{}  {}  {} / {}  {}",
                    job.session_id,
                    job.created_at.to_rfc3339(),
                    job.name,
                    job.detail,
                    job.status.as_str()
                );
            }
        }
        Command::Record {
            service,
            host,
            kind,
        } => {
            let event = storage.record_service_event(&service, &host, kind).await?;
            println!(
                "recorded {} for {}@{} at {}",
                event.kind.as_str(),
                event.service,
                event.host,
                event.timestamp.to_rfc3339()
            );
        }
    }

    Ok(())
}

//! Read-only operator inspection surface. Queries the same
//! coordination-fabric rows a terminal itself reads rather than
//! opening a socket to a running process, so there is nothing new to
//! keep alive between CLI invocations.

use aldctl::config::Config;
use aldctl::store::{MachineStatus, PostgresStore, Store};
use chrono::Utc;
use clap::{Parser, Subcommand};
use colored::Colorize;
use prettytable::{row, Table};

#[derive(Parser)]
#[command(name = "aldctl-cli", about = "Inspect a running ALD control plane")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Machine status, current process, PLC lease holder.
    Info,
    /// Configured parameters from the registry's backing table.
    List,
    /// One-line health summary.
    Stat,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{} {e}", "configuration error:".red().bold());
            std::process::exit(1);
        }
    };

    let store = match PostgresStore::connect(&config.database_url).await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("{} {e}", "could not reach store:".red().bold());
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Command::Info => info(&store, &config.machine_id).await,
        Command::List => list(&store).await,
        Command::Stat => stat(&store, &config.machine_id).await,
    };

    if let Err(e) = result {
        eprintln!("{} {e}", "error:".red().bold());
        std::process::exit(1);
    }
}

async fn info(store: &PostgresStore, machine_id: &str) -> aldctl::error::PlcResult<()> {
    let state = store.get_machine_state(machine_id).await?;
    let holder = store.current_plc_lease_holder().await?;

    println!("{}", "machine state".bold());
    println!("  status:          {:?}", state.status);
    println!(
        "  current process: {}",
        state.current_process_id.map_or_else(|| "-".to_owned(), |id| id.to_string())
    );
    println!("  last heartbeat:  {}", state.last_heartbeat);
    println!(
        "  plc lease held by: {}",
        holder.unwrap_or_else(|| "none".to_owned())
    );
    Ok(())
}

async fn list(store: &PostgresStore) -> aldctl::error::PlcResult<()> {
    let rows = store.load_component_parameters().await?;
    let mut table = Table::new();
    table.add_row(row!["id", "component", "parameter", "read", "write", "type", "unit"]);
    for p in rows {
        table.add_row(row![
            p.id,
            p.component_name,
            p.parameter_name,
            p.read_modbus_address.map_or_else(|| "-".to_owned(), |a| a.to_string()),
            p.write_modbus_address.map_or_else(|| "-".to_owned(), |a| a.to_string()),
            format!("{:?}", p.data_type),
            p.unit.unwrap_or_else(|| "-".to_owned())
        ]);
    }
    table.printstd();
    Ok(())
}

async fn stat(store: &PostgresStore, machine_id: &str) -> aldctl::error::PlcResult<()> {
    let state = store.get_machine_state(machine_id).await?;
    let since = store.latest_emergency_reset_at().await?.unwrap_or_else(|| Utc::now() - chrono::Duration::days(1));
    let signals = store.poll_emergency_signals_since(since).await?;
    let in_emergency = state.status == MachineStatus::Emergency || !signals.is_empty();

    let label = if in_emergency {
        "EMERGENCY".red().bold()
    } else {
        "OK".green().bold()
    };
    println!("{machine_id}: {label} ({:?}, last heartbeat {})", state.status, state.last_heartbeat);
    Ok(())
}

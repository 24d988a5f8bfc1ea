use clap::{Parser, Subcommand};
use log::info;
use xpsync::persist::{ExperienceRepo, Store};
use xpsync::{config, observability, run};

#[derive(Parser)]
#[command(name = "xpsync", about = "xpsync - experience point replication between master and nodes")]
struct Cli {
	#[command(subcommand)]
	command: Option<Commands>,
	/// SQLite database file (overrides configuration)
	#[arg(long, global = true)]
	database: Option<String>,
	/// RPC listen port (overrides configuration)
	#[arg(long, global = true)]
	port: Option<u16>,
	/// Master address `host:port`; enables node mode
	#[arg(long, global = true)]
	master: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
	/// Serve the sync facade (default)
	Serve {
		/// Seed SQL script to execute before accepting connections
		#[arg(long = "seed")]
		seed: Vec<String>,
	},
	/// Execute seed SQL scripts against the database and exit
	Import {
		#[arg(required = true)]
		files: Vec<String>,
	},
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let cli = Cli::parse();

	let mut settings = match config::load() {
		Ok(s) => s,
		Err(e) => {
			eprintln!("failed to load config, using defaults: {}", e);
			config::Settings::default()
		}
	};
	if let Some(database) = cli.database {
		settings.database_path = database;
	}
	if let Some(port) = cli.port {
		settings.port = port;
	}
	if let Some(master) = cli.master {
		settings.master = Some(master);
	}

	observability::init_logging(settings.log_level)?;

	match cli.command.unwrap_or(Commands::Serve { seed: Vec::new() }) {
		Commands::Serve { seed } => {
			settings.seed_files.extend(seed);
			info!(
				"starting on {}:{} with database {}",
				settings.host, settings.port, settings.database_path
			);
			run(settings).await
		}
		Commands::Import { files } => {
			let store = Store::open(&settings.database_path, settings.namespace.clone()).await?;
			store.import(&files).await?;
			store.close().await;
			info!("imported {} seed file(s) into {}", files.len(), settings.database_path);
			Ok(())
		}
	}
}

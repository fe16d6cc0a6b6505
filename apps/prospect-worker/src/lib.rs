pub mod worker;

mod error;

pub use error::{Error, Result};

use std::path::PathBuf;

use clap::Parser;

use prospect_service::ProspectService;
use prospect_storage::db::Db;

#[derive(Debug, Parser)]
#[command(
	version = prospect_cli::VERSION,
	rename_all = "kebab",
	styles = prospect_cli::styles(),
)]
pub struct Args {
	#[arg(long, short = 'c', value_name = "FILE")]
	pub config: PathBuf,
}

pub async fn run(args: Args) -> color_eyre::Result<()> {
	let config = prospect_config::load(&args.config)?;

	prospect_cli::init_tracing(&config.service.log_level);

	let db = Db::connect(&config.storage.postgres).await?;

	db.ensure_schema().await?;

	let schedule = worker::Schedule::from_config(&config);
	let service = ProspectService::new(config, db)?;

	worker::run_worker(&service, schedule).await
}

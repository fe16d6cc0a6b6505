use clap::Parser;

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
	color_eyre::install()?;

	let args = prospect_worker::Args::parse();

	prospect_worker::run(args).await
}

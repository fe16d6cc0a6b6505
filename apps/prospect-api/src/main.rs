use clap::Parser;

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
	color_eyre::install()?;

	let args = prospect_api::Args::parse();

	prospect_api::run(args).await
}

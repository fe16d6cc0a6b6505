use std::sync::Arc;

use prospect_service::ProspectService;
use prospect_storage::db::Db;

#[derive(Clone)]
pub struct AppState {
	pub service: Arc<ProspectService>,
}
impl AppState {
	pub async fn new(config: prospect_config::Config) -> color_eyre::Result<Self> {
		let db = Db::connect(&config.storage.postgres).await?;

		db.ensure_schema().await?;

		let service = ProspectService::new(config, db)?;

		Ok(Self::from_service(service))
	}

	pub fn from_service(service: ProspectService) -> Self {
		Self { service: Arc::new(service) }
	}
}

use serde_json::Value;
use time::{Date, OffsetDateTime};
use uuid::Uuid;

#[derive(Clone, Debug, sqlx::FromRow)]
pub struct Proxy {
	pub proxy_id: Uuid,
	pub provider: String,
	pub kind: String,
	pub host: String,
	pub port: i32,
	pub username: Option<String>,
	pub password_sealed: Option<String>,
	pub status: String,
	pub health_score: i32,
	pub auto_rotate: bool,
	pub rotation_interval_hours: i32,
	pub last_used_at: Option<OffsetDateTime>,
	pub last_latency_ms: Option<i32>,
	pub avg_latency_ms: Option<f64>,
	pub consecutive_failures: i32,
	pub last_checked_at: Option<OffsetDateTime>,
	pub created_at: OffsetDateTime,
	pub updated_at: OffsetDateTime,
}

#[derive(Clone, Debug, sqlx::FromRow)]
pub struct ProxyAllocation {
	pub allocation_id: Uuid,
	pub proxy_id: Uuid,
	pub workspace_id: String,
	pub account_id: String,
	pub status: String,
	pub exclusive: bool,
	pub sticky_session_id: String,
	pub allocated_at: OffsetDateTime,
	pub next_rotation_at: Option<OffsetDateTime>,
	pub revoked_at: Option<OffsetDateTime>,
}

#[derive(Clone, Debug, sqlx::FromRow)]
pub struct AccountHealth {
	pub workspace_id: String,
	pub account_id: String,
	pub pages_this_hour: i32,
	pub hour_start: OffsetDateTime,
	pub captchas_today: i32,
	pub captcha_day: Date,
	pub last_captcha_at: Option<OffsetDateTime>,
	pub cooldown_until: Option<OffsetDateTime>,
	pub consecutive_successes: i32,
	pub updated_at: OffsetDateTime,
}

#[derive(Clone, Debug, sqlx::FromRow)]
pub struct SearchJob {
	pub job_id: Uuid,
	pub workspace_id: String,
	pub account_id: String,
	pub campaign_id: Option<String>,
	pub criteria: Value,
	pub max_results: i32,
	pub status: String,
	pub progress: i32,
	pub total_found: i32,
	pub total_pulled: i32,
	pub credits_used: i32,
	pub data_source: Option<String>,
	pub error: Option<String>,
	pub owner_instance: Option<String>,
	pub heartbeat_at: Option<OffsetDateTime>,
	pub created_at: OffsetDateTime,
	pub updated_at: OffsetDateTime,
	pub started_at: Option<OffsetDateTime>,
	pub completed_at: Option<OffsetDateTime>,
}

#[derive(Clone, Debug, sqlx::FromRow)]
pub struct Lead {
	pub lead_id: Uuid,
	pub workspace_id: String,
	pub profile_url: String,
	pub first_name: Option<String>,
	pub last_name: Option<String>,
	pub full_name: Option<String>,
	pub headline: Option<String>,
	pub company: Option<String>,
	pub location: Option<String>,
	pub connection_degree: Option<String>,
	pub data_source: String,
	pub created_at: OffsetDateTime,
}

#[derive(Clone, Debug, sqlx::FromRow)]
pub struct RetrievalLease {
	pub workspace_id: String,
	pub account_id: String,
	pub holder_job_id: Uuid,
	pub lease_until: OffsetDateTime,
	pub acquired_at: OffsetDateTime,
}

#[derive(Clone, Debug, sqlx::FromRow)]
pub struct AccountSession {
	pub workspace_id: String,
	pub account_id: String,
	pub sealed_payload: String,
	pub ip_bound: bool,
	pub updated_at: OffsetDateTime,
}

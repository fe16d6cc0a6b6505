//! Shared proxy pool with sticky-session allocation.
//!
//! Allocation uniqueness lives in Postgres: partial unique indexes on `proxy_allocations` plus
//! row locks taken inside one transaction per operation. Nothing here holds an in-process lock.

use std::sync::Arc;

use futures::{StreamExt, stream};
use serde::{Deserialize, Serialize};
use sqlx::PgConnection;
use time::OffsetDateTime;
use uuid::Uuid;

use prospect_domain::proxy::{
	self, ProbeOutcome, ProxyEndpoint, ProxyHealth, ProxyKind, ProxyStatus,
};
use prospect_storage::{
	allocations::{self, NewAllocation},
	db::Db,
	models::{Proxy, ProxyAllocation},
	proxies::{self, NewProxy, ProbeUpdate},
};

use crate::{CredentialCipher, Error, ProxyProbe, Result};

const ROTATION_BATCH: i64 = 500;
const PROBE_CONCURRENCY: usize = 8;

#[derive(Clone, Debug)]
pub struct ProxyAssignment {
	pub proxy_id: Uuid,
	pub allocation_id: Uuid,
	pub sticky_session_id: String,
	pub exclusive: bool,
	pub endpoint: ProxyEndpoint,
}

#[derive(Clone, Debug, Deserialize)]
pub struct AddProxyRequest {
	pub provider: String,
	pub kind: ProxyKind,
	pub host: String,
	pub port: u16,
	#[serde(default)]
	pub username: Option<String>,
	#[serde(default)]
	pub password: Option<String>,
	#[serde(default)]
	pub auto_rotate: bool,
	#[serde(default)]
	pub rotation_interval_hours: Option<u32>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ProxyView {
	pub proxy_id: Uuid,
	pub provider: String,
	pub kind: String,
	pub host: String,
	pub port: i32,
	pub username: Option<String>,
	pub status: String,
	pub health_score: i32,
	pub auto_rotate: bool,
	pub rotation_interval_hours: i32,
	pub active_allocations: i64,
	#[serde(with = "time::serde::rfc3339::option")]
	pub last_used_at: Option<OffsetDateTime>,
	pub last_latency_ms: Option<i32>,
	pub avg_latency_ms: Option<f64>,
	pub consecutive_failures: i32,
	#[serde(with = "time::serde::rfc3339::option")]
	pub last_checked_at: Option<OffsetDateTime>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct HealthCheckReport {
	pub checked: u32,
	pub healthy: u32,
	pub unhealthy: u32,
}

#[derive(Clone)]
pub struct ProxyPool {
	db: Db,
	cipher: Arc<dyn CredentialCipher>,
	sticky_username_template: String,
	default_rotation_interval_hours: u32,
	master_max_sessions: u32,
}
impl ProxyPool {
	pub fn new(db: Db, cfg: &prospect_config::ProxyPool, cipher: Arc<dyn CredentialCipher>) -> Self {
		Self {
			db,
			cipher,
			sticky_username_template: cfg.sticky_username_template.clone(),
			default_rotation_interval_hours: cfg.default_rotation_interval_hours,
			master_max_sessions: cfg.master_max_sessions,
		}
	}

	/// Returns the account's current proxy and sticky session, allocating one when needed.
	pub async fn allocate(&self, workspace_id: &str, account_id: &str) -> Result<ProxyAssignment> {
		let now = OffsetDateTime::now_utc();
		let mut tx = self.db.pool.begin().await?;

		if let Some(active) =
			allocations::lock_active_for_account(&mut tx, workspace_id, account_id).await?
		{
			let proxy = proxies::lock_proxy(&mut tx, active.proxy_id).await?;

			match proxy {
				Some(proxy) if is_usable(&proxy) => {
					let allocation = if active.next_rotation_at.is_some_and(|at| at <= now) {
						self.rotate_locked(&mut tx, &proxy, &active, now).await?
					} else {
						active
					};

					proxies::touch_last_used(&mut *tx, proxy.proxy_id, now).await?;

					let assignment = self.assignment(&proxy, &allocation)?;

					tx.commit().await?;

					return Ok(assignment);
				},
				_ => {
					tracing::info!(
						workspace_id,
						account_id,
						proxy_id = %active.proxy_id,
						"Allocated proxy is no longer usable; reallocating."
					);

					allocations::revoke(&mut *tx, active.allocation_id, now).await?;
				},
			}
		}

		let assignment = match self.allocate_fresh(&mut tx, workspace_id, account_id, now).await {
			Err(Error::Conflict { message }) => {
				tracing::warn!(
					workspace_id,
					account_id,
					constraint = %message,
					"Allocation conflicted; clearing the stale row and retrying once."
				);

				allocations::delete_active_for_account(&mut *tx, workspace_id, account_id, now)
					.await?;

				self.allocate_fresh(&mut tx, workspace_id, account_id, now).await?
			},
			other => other?,
		};

		tx.commit().await?;

		tracing::info!(
			workspace_id,
			account_id,
			proxy_id = %assignment.proxy_id,
			exclusive = assignment.exclusive,
			"Proxy allocated."
		);

		Ok(assignment)
	}

	/// Revokes the account's active allocation. Returns `false` when there was none.
	pub async fn release(&self, workspace_id: &str, account_id: &str) -> Result<bool> {
		let now = OffsetDateTime::now_utc();
		let mut tx = self.db.pool.begin().await?;
		let Some(active) =
			allocations::lock_active_for_account(&mut tx, workspace_id, account_id).await?
		else {
			return Ok(false);
		};

		allocations::revoke(&mut *tx, active.allocation_id, now).await?;

		if active.exclusive
			&& let Some(proxy) = proxies::lock_proxy(&mut tx, active.proxy_id).await?
			&& proxy.status == ProxyStatus::Allocated.as_str()
		{
			proxies::set_status(&mut *tx, proxy.proxy_id, ProxyStatus::Available.as_str(), now)
				.await?;
		}

		tx.commit().await?;

		tracing::debug!(workspace_id, account_id, proxy_id = %active.proxy_id, "Proxy released.");

		Ok(true)
	}

	/// Issues a new sticky token on the same proxy so the upstream hands out a new exit IP.
	pub async fn rotate_sticky_session(
		&self,
		proxy_id: Uuid,
		workspace_id: &str,
		account_id: &str,
	) -> Result<ProxyAssignment> {
		let now = OffsetDateTime::now_utc();
		let mut tx = self.db.pool.begin().await?;
		let active = allocations::lock_active_for_account(&mut tx, workspace_id, account_id)
			.await?
			.filter(|allocation| allocation.proxy_id == proxy_id)
			.ok_or_else(|| {
				Error::not_found(format!(
					"No active allocation on proxy {proxy_id} for {workspace_id}/{account_id}."
				))
			})?;
		let proxy = proxies::lock_proxy(&mut tx, proxy_id)
			.await?
			.ok_or_else(|| Error::not_found(format!("Proxy {proxy_id} does not exist.")))?;
		let allocation = self.rotate_locked(&mut tx, &proxy, &active, now).await?;
		let assignment = self.assignment(&proxy, &allocation)?;

		tx.commit().await?;

		tracing::info!(workspace_id, account_id, proxy_id = %proxy_id, "Sticky session rotated.");

		Ok(assignment)
	}

	/// Rotates every due allocation on auto-rotating proxies. Returns how many rotated.
	pub async fn rotate_due(&self, now: OffsetDateTime) -> Result<u32> {
		let due = allocations::due_for_rotation(&self.db.pool, now, ROTATION_BATCH).await?;
		let mut rotated = 0;

		for item in due {
			match self.rotate_sticky_session(item.proxy_id, &item.workspace_id, &item.account_id).await
			{
				Ok(_) => rotated += 1,
				// Released between the scan and the rotation.
				Err(Error::NotFound { .. }) => {},
				Err(err) => {
					tracing::warn!(
						error = %err,
						allocation_id = %item.allocation_id,
						"Scheduled sticky-session rotation failed."
					);
				},
			}
		}

		Ok(rotated)
	}

	/// Probes every non-disabled proxy and folds the result into its score and status.
	pub async fn health_check(&self, probe: &dyn ProxyProbe) -> Result<HealthCheckReport> {
		let targets = proxies::list_probe_targets(&self.db.pool).await?;
		let results = stream::iter(targets)
			.map(|proxy| async move {
				let outcome = match self.base_endpoint(&proxy) {
					Ok(endpoint) => probe.probe(&endpoint).await,
					Err(err) => Err(err),
				};

				(proxy, outcome)
			})
			.buffer_unordered(PROBE_CONCURRENCY)
			.collect::<Vec<_>>()
			.await;
		let mut report = HealthCheckReport::default();

		for (proxy, outcome) in results {
			let outcome = outcome.unwrap_or_else(|err| {
				tracing::warn!(proxy_id = %proxy.proxy_id, error = %err, "Proxy probe errored.");

				ProbeOutcome { success: false, latency_ms: None }
			});
			let success = self.record_probe(&proxy, outcome).await?;

			report.checked += 1;

			if success {
				report.healthy += 1;
			} else {
				report.unhealthy += 1;
			}
		}

		tracing::info!(
			checked = report.checked,
			healthy = report.healthy,
			unhealthy = report.unhealthy,
			"Proxy health check finished."
		);

		Ok(report)
	}

	pub async fn add_proxy(&self, req: AddProxyRequest) -> Result<ProxyView> {
		let host = req.host.trim();

		if host.is_empty() {
			return Err(Error::invalid("host must be non-empty."));
		}
		if req.port == 0 {
			return Err(Error::invalid("port must be between 1 and 65535."));
		}
		if req.provider.trim().is_empty() {
			return Err(Error::invalid("provider must be non-empty."));
		}

		let password_sealed =
			req.password.as_deref().map(|password| self.cipher.encrypt(password)).transpose()?;
		let rotation_interval_hours =
			req.rotation_interval_hours.unwrap_or(self.default_rotation_interval_hours);
		let proxy = NewProxy {
			provider: req.provider.trim(),
			kind: req.kind.as_str(),
			host,
			port: i32::from(req.port),
			username: req.username.as_deref().map(str::trim).filter(|name| !name.is_empty()),
			password_sealed: password_sealed.as_deref(),
			auto_rotate: req.auto_rotate,
			rotation_interval_hours: crate::health::saturating_i32(rotation_interval_hours),
		};
		let row = proxies::insert_proxy(&self.db.pool, &proxy, OffsetDateTime::now_utc()).await?;

		tracing::info!(proxy_id = %row.proxy_id, kind = %row.kind, host = %row.host, "Proxy added.");

		Ok(view(row, 0))
	}

	/// Rejected with [`Error::Conflict`] while any allocation on the proxy is active.
	pub async fn remove_proxy(&self, proxy_id: Uuid) -> Result<()> {
		let mut tx = self.db.pool.begin().await?;

		if proxies::lock_proxy(&mut tx, proxy_id).await?.is_none() {
			return Err(Error::not_found(format!("Proxy {proxy_id} does not exist.")));
		}

		let active = allocations::count_active_for_proxy(&mut *tx, proxy_id).await?;

		if active > 0 {
			return Err(Error::Conflict {
				message: format!("Proxy {proxy_id} still backs {active} active allocation(s)."),
			});
		}

		proxies::delete_proxy(&mut tx, proxy_id).await?;
		tx.commit().await?;

		tracing::info!(proxy_id = %proxy_id, "Proxy removed.");

		Ok(())
	}

	pub async fn list_proxies(&self) -> Result<Vec<ProxyView>> {
		let rows = proxies::list_proxies(&self.db.pool).await?;
		let mut views = Vec::with_capacity(rows.len());

		for row in rows {
			let active = allocations::count_active_for_proxy(&self.db.pool, row.proxy_id).await?;

			views.push(view(row, active));
		}

		Ok(views)
	}

	/// Disabling parks the proxy; enabling returns it to `allocated` when a dedicated allocation
	/// still holds it, `available` otherwise.
	pub async fn set_proxy_disabled(&self, proxy_id: Uuid, disabled: bool) -> Result<ProxyView> {
		let now = OffsetDateTime::now_utc();
		let mut tx = self.db.pool.begin().await?;
		let proxy = proxies::lock_proxy(&mut tx, proxy_id)
			.await?
			.ok_or_else(|| Error::not_found(format!("Proxy {proxy_id} does not exist.")))?;
		let active = allocations::list_active_for_proxy(&mut *tx, proxy_id).await?;
		let status = if disabled {
			ProxyStatus::Disabled
		} else if active.iter().any(|allocation| allocation.exclusive) {
			ProxyStatus::Allocated
		} else {
			ProxyStatus::Available
		};

		proxies::set_status(&mut *tx, proxy_id, status.as_str(), now).await?;
		tx.commit().await?;

		tracing::info!(proxy_id = %proxy_id, status = status.as_str(), "Proxy status set.");

		let proxy = Proxy { status: status.as_str().to_string(), updated_at: now, ..proxy };

		Ok(view(proxy, active.len() as i64))
	}

	async fn allocate_fresh(
		&self,
		conn: &mut PgConnection,
		workspace_id: &str,
		account_id: &str,
		now: OffsetDateTime,
	) -> Result<ProxyAssignment> {
		let master = proxies::pick_master(conn, i64::from(self.master_max_sessions)).await?;
		let (proxy, kind) = match master {
			Some(proxy) => (proxy, ProxyKind::Master),
			None => match proxies::pick_dedicated(conn).await? {
				Some(proxy) => (proxy, ProxyKind::Dedicated),
				None =>
					return Err(Error::ProxyUnavailable {
						message: "No master or dedicated proxy is available.".to_string(),
					}),
			},
		};
		let sticky_session_id = proxy::new_sticky_session_id(&mut rand::rng());
		let allocation = NewAllocation {
			proxy_id: proxy.proxy_id,
			workspace_id,
			account_id,
			exclusive: kind.is_exclusive(),
			sticky_session_id: &sticky_session_id,
			next_rotation_at: proxy::next_rotation_at(
				now,
				proxy.auto_rotate,
				proxy.rotation_interval_hours,
			),
		};
		let allocation = allocations::insert_allocation(conn, &allocation, now).await?;

		if kind.is_exclusive() {
			proxies::set_status(&mut *conn, proxy.proxy_id, ProxyStatus::Allocated.as_str(), now)
				.await?;
		}

		proxies::touch_last_used(&mut *conn, proxy.proxy_id, now).await?;

		self.assignment(&proxy, &allocation)
	}

	async fn rotate_locked(
		&self,
		conn: &mut PgConnection,
		proxy: &Proxy,
		active: &ProxyAllocation,
		now: OffsetDateTime,
	) -> Result<ProxyAllocation> {
		let next_rotation_at =
			proxy::next_rotation_at(now, proxy.auto_rotate, proxy.rotation_interval_hours);

		// A token collision on a shared master proxy is astronomically rare; one retry covers it.
		for _ in 0..2 {
			let sticky_session_id = proxy::new_sticky_session_id(&mut rand::rng());

			match allocations::update_sticky_session(
				conn,
				active.allocation_id,
				&sticky_session_id,
				next_rotation_at,
			)
			.await
			{
				Ok(Some(allocation)) => return Ok(allocation),
				Ok(None) =>
					return Err(Error::not_found(format!(
						"Allocation {} is no longer active.",
						active.allocation_id
					))),
				Err(prospect_storage::Error::Conflict(_)) => continue,
				Err(err) => return Err(err.into()),
			}
		}

		Err(Error::Conflict { message: "Could not issue a unique sticky session.".to_string() })
	}

	async fn record_probe(&self, proxy: &Proxy, outcome: ProbeOutcome) -> Result<bool> {
		let now = OffsetDateTime::now_utc();
		let current = ProxyHealth {
			score: proxy.health_score,
			last_latency_ms: proxy.last_latency_ms,
			avg_latency_ms: proxy.avg_latency_ms,
			consecutive_failures: proxy.consecutive_failures,
		};
		let next = proxy::apply_probe(&current, outcome);
		let status = proxy.status.parse::<ProxyStatus>().unwrap_or(ProxyStatus::Available);
		let held = proxy.kind == ProxyKind::Dedicated.as_str()
			&& allocations::count_active_for_proxy(&self.db.pool, proxy.proxy_id).await? > 0;
		let next_status = proxy::status_after_probe(status, outcome.success, held);

		proxies::record_probe(
			&self.db.pool,
			proxy.proxy_id,
			&ProbeUpdate {
				status: next_status.as_str(),
				health_score: next.score,
				last_latency_ms: next.last_latency_ms,
				avg_latency_ms: next.avg_latency_ms,
				consecutive_failures: next.consecutive_failures,
			},
			now,
		)
		.await?;

		if next_status != status {
			tracing::info!(
				proxy_id = %proxy.proxy_id,
				from = status.as_str(),
				to = next_status.as_str(),
				score = next.score,
				"Proxy status changed after probe."
			);
		}

		Ok(outcome.success)
	}

	fn assignment(&self, proxy: &Proxy, allocation: &ProxyAllocation) -> Result<ProxyAssignment> {
		let mut endpoint = self.base_endpoint(proxy)?;

		endpoint.username = endpoint.username.map(|username| {
			proxy::render_sticky_username(
				&self.sticky_username_template,
				&username,
				&allocation.sticky_session_id,
			)
		});

		Ok(ProxyAssignment {
			proxy_id: proxy.proxy_id,
			allocation_id: allocation.allocation_id,
			sticky_session_id: allocation.sticky_session_id.clone(),
			exclusive: allocation.exclusive,
			endpoint,
		})
	}

	fn base_endpoint(&self, proxy: &Proxy) -> Result<ProxyEndpoint> {
		let port = u16::try_from(proxy.port).map_err(|_| {
			Error::fatal(format!("Proxy {} has invalid port {}.", proxy.proxy_id, proxy.port))
		})?;
		let password =
			proxy.password_sealed.as_deref().map(|sealed| self.cipher.decrypt(sealed)).transpose()?;

		Ok(ProxyEndpoint {
			host: proxy.host.clone(),
			port,
			username: proxy.username.clone(),
			password,
		})
	}
}

fn is_usable(proxy: &Proxy) -> bool {
	!matches!(
		proxy.status.parse::<ProxyStatus>(),
		Ok(ProxyStatus::Unhealthy | ProxyStatus::Disabled) | Err(_)
	)
}

fn view(proxy: Proxy, active_allocations: i64) -> ProxyView {
	ProxyView {
		proxy_id: proxy.proxy_id,
		provider: proxy.provider,
		kind: proxy.kind,
		host: proxy.host,
		port: proxy.port,
		username: proxy.username,
		status: proxy.status,
		health_score: proxy.health_score,
		auto_rotate: proxy.auto_rotate,
		rotation_interval_hours: proxy.rotation_interval_hours,
		active_allocations,
		last_used_at: proxy.last_used_at,
		last_latency_ms: proxy.last_latency_ms,
		avg_latency_ms: proxy.avg_latency_ms,
		consecutive_failures: proxy.consecutive_failures,
		last_checked_at: proxy.last_checked_at,
	}
}

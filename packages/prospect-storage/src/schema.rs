pub fn render_schema() -> String {
	expand_includes(include_str!("../../../sql/init.sql"))
}

fn expand_includes(sql: &str) -> String {
	let mut out = String::new();

	for line in sql.lines() {
		let trimmed = line.trim();

		if let Some(path) = trimmed.strip_prefix("\\ir ") {
			match path.trim() {
				"tables/001_proxies.sql" =>
					out.push_str(include_str!("../../../sql/tables/001_proxies.sql")),
				"tables/002_proxy_allocations.sql" =>
					out.push_str(include_str!("../../../sql/tables/002_proxy_allocations.sql")),
				"tables/003_account_health.sql" =>
					out.push_str(include_str!("../../../sql/tables/003_account_health.sql")),
				"tables/004_search_jobs.sql" =>
					out.push_str(include_str!("../../../sql/tables/004_search_jobs.sql")),
				"tables/005_leads.sql" =>
					out.push_str(include_str!("../../../sql/tables/005_leads.sql")),
				"tables/006_job_leads.sql" =>
					out.push_str(include_str!("../../../sql/tables/006_job_leads.sql")),
				"tables/007_retrieval_leases.sql" =>
					out.push_str(include_str!("../../../sql/tables/007_retrieval_leases.sql")),
				"tables/008_account_sessions.sql" =>
					out.push_str(include_str!("../../../sql/tables/008_account_sessions.sql")),
				"tables/009_credit_balances.sql" =>
					out.push_str(include_str!("../../../sql/tables/009_credit_balances.sql")),
				"tables/010_credit_transactions.sql" =>
					out.push_str(include_str!("../../../sql/tables/010_credit_transactions.sql")),
				_ => out.push_str(line),
			}
		} else {
			out.push_str(line);
		}

		out.push('\n');
	}

	out
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn every_include_is_expanded() {
		let sql = render_schema();

		assert!(!sql.contains("\\ir "));
		assert!(sql.contains("CREATE TABLE IF NOT EXISTS proxies"));
		assert!(sql.contains("uq_proxy_allocations_exclusive_active"));
		assert!(sql.contains("CREATE TABLE IF NOT EXISTS credit_transactions"));
	}
}

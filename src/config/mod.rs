use log::Level;
use serde::Deserialize;
use thiserror::Error;

/// Runtime configuration for xpsync.
///
/// Values are loaded from (in order): the `/etc/xpsync/xpsync.json` file,
/// the same file name in the user config folder (both optional), and
/// environment variables prefixed with `XPS_` (e.g. `XPS_PORT`).
#[derive(Debug, Deserialize, PartialEq, Clone)]
#[serde(default)]
pub struct Settings {
	pub host: String,
	pub port: u16,
	/// SQLite file the records live in; `:memory:` for a throwaway store.
	pub database_path: String,
	pub namespace: String,
	pub log_level: Level,
	// How long one accept waits before the loop re-checks for shutdown
	pub accept_timeout_ms: u64,
	/// SQL scripts run once at startup, before any connection is accepted.
	pub seed_files: Vec<String>,
	/// `host:port` of the master. When set this process runs as a node and
	/// syncs with it.
	pub master: Option<String>,
	pub sync_interval_secs: u64,
	pub node_id: String,
	/// Port for the HTTP `/health` and `/metrics` endpoints, off when unset.
	pub admin_port: Option<u16>,
}

impl Default for Settings {
	fn default() -> Self {
		let node_id = hostname::get()
			.ok()
			.and_then(|s| s.into_string().ok())
			.unwrap_or_else(|| "xpsync".to_string());

		Self {
			host: "127.0.0.1".to_string(),
			port: 9876,
			database_path: "zanxp.db".to_string(),
			namespace: crate::persist::DEFAULT_NAMESPACE.to_string(),
			log_level: Level::Info,
			accept_timeout_ms: 1000,
			seed_files: Vec::new(),
			master: None,
			sync_interval_secs: 30,
			node_id,
			admin_port: None,
		}
	}
}

#[derive(Debug, Error)]
pub enum SettingsError {
	#[error("configuration error: {0}")]
	Config(#[from] config::ConfigError),
}

pub fn load() -> Result<Settings, SettingsError> {
	let mut builder = config::Config::builder()
		.add_source(config::File::with_name("/etc/xpsync/xpsync.json").required(false));

	if let Some(folder) = dirs::config_dir() {
		let user_config_path = folder.join("xpsync").join("xpsync.json");
		builder = builder.add_source(config::File::from(user_config_path).required(false));
	}

	builder = builder.add_source(config::Environment::with_prefix("XPS").separator("__"));

	let cfg = builder.build()?;

	let mut s: Settings = cfg.try_deserialize()?;

	// Direct environment variables win. The `config` crate lowercases keys and
	// splits on the separator, which does not map cleanly onto every field.
	if let Ok(h) = std::env::var("XPS_HOST") {
		if !h.is_empty() {
			s.host = h;
		}
	}
	if let Ok(p) = std::env::var("XPS_PORT") {
		if let Ok(pn) = p.parse::<u16>() {
			s.port = pn;
		}
	}
	if let Ok(db) = std::env::var("XPS_DATABASE_PATH") {
		if !db.is_empty() {
			s.database_path = db;
		}
	}
	if let Ok(ns) = std::env::var("XPS_NAMESPACE") {
		if !ns.is_empty() {
			s.namespace = ns;
		}
	}
	if let Ok(m) = std::env::var("XPS_MASTER") {
		if !m.is_empty() {
			s.master = Some(m);
		}
	}
	if let Ok(i) = std::env::var("XPS_SYNC_INTERVAL_SECS") {
		if let Ok(parsed) = i.parse::<u64>() {
			s.sync_interval_secs = parsed;
		}
	}
	if let Ok(t) = std::env::var("XPS_ACCEPT_TIMEOUT_MS") {
		if let Ok(parsed) = t.parse::<u64>() {
			s.accept_timeout_ms = parsed;
		}
	}
	if let Ok(a) = std::env::var("XPS_ADMIN_PORT") {
		if let Ok(parsed) = a.parse::<u16>() {
			s.admin_port = Some(parsed);
		}
	}
	if let Ok(l) = std::env::var("XPS_LOG_LEVEL") {
		if !l.is_empty() {
			if let Ok(parsed) = l.parse::<Level>() {
				s.log_level = parsed;
			}
		}
	}

	Ok(s)
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use std::env;

	use log::Level;

	use crate::config::{Settings, load};

	const VARS: [&str; 6] = [
		"XPS_HOST",
		"XPS_PORT",
		"XPS_DATABASE_PATH",
		"XPS_MASTER",
		"XPS_ADMIN_PORT",
		"XPS_LOG_LEVEL",
	];

	#[test]
	fn test_load_defaults_and_env_overlay() {
		// Save original values so we can restore them
		let originals: Vec<_> = VARS.iter().map(|v| (*v, env::var_os(v))).collect();

		for v in VARS {
			unsafe { env::remove_var(v) };
		}

		let s = load().expect("load should succeed with defaults");
		let d = Settings::default();
		assert_eq!(s.host, d.host);
		assert_eq!(s.port, 9876);
		assert_eq!(s.namespace, "zanxp");
		assert_eq!(s.master, None);
		assert_eq!(s.log_level, d.log_level);

		unsafe { env::set_var("XPS_HOST", "0.0.0.0") };
		unsafe { env::set_var("XPS_PORT", "9999") };
		unsafe { env::set_var("XPS_DATABASE_PATH", "/tmp/node.db") };
		unsafe { env::set_var("XPS_MASTER", "master.example:9876") };
		unsafe { env::set_var("XPS_ADMIN_PORT", "9100") };
		unsafe { env::set_var("XPS_LOG_LEVEL", "debug") };

		let s2 = load().expect("load should succeed with env");
		assert_eq!(s2.host, "0.0.0.0");
		assert_eq!(s2.port, 9999u16);
		assert_eq!(s2.database_path, "/tmp/node.db");
		assert_eq!(s2.master.as_deref(), Some("master.example:9876"));
		assert_eq!(s2.admin_port, Some(9100));
		assert_eq!(s2.log_level, Level::Debug);

		for (v, original) in originals {
			match original {
				Some(val) => unsafe { env::set_var(v, val) },
				None => unsafe { env::remove_var(v) },
			}
		}
	}
}

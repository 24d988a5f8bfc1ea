use fern::colors::{Color, ColoredLevelConfig};
use log::{Level, LevelFilter};

/// Install the process-wide logger: colored level, local timestamp and
/// target, written to stdout. Can only succeed once per process.
pub fn init_logging(level: Level) -> Result<(), log::SetLoggerError> {
	let colors = ColoredLevelConfig::new()
		.error(Color::Red)
		.warn(Color::Yellow)
		.info(Color::Green)
		.debug(Color::Blue)
		.trace(Color::Magenta);

	fern::Dispatch::new()
		.format(move |out, message, record| {
			out.finish(format_args!(
				"{} {:<5} [{}] {}",
				chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
				colors.color(record.level()),
				record.target(),
				message
			))
		})
		.level(level.to_level_filter())
		// sqlx logs every statement at info
		.level_for("sqlx", LevelFilter::Warn)
		.chain(std::io::stdout())
		.apply()
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	#[test]
	fn second_initialization_fails() {
		// The first call may fail too if another test got there first.
		let _ = super::init_logging(log::Level::Debug);
		assert!(super::init_logging(log::Level::Debug).is_err());
	}
}

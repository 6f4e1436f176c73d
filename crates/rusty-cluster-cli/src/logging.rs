use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use rusty_cluster_core::LoggingConfig;

/// Filter directives: `RUST_LOG` wins, then `--verbose`, then the config file.
fn filter_directives(config: &LoggingConfig, verbose: bool) -> String {
    let level = if verbose {
        "debug".to_string()
    } else {
        config.level.clone().unwrap_or_else(|| "info".to_string())
    };
    std::iter::once(level)
        .chain(config.filters.iter().cloned())
        .collect::<Vec<_>>()
        .join(",")
}

/// Install the global tracing subscriber.
pub fn init(config: &LoggingConfig, verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(config, verbose)));

    let writer = match config.output.as_str() {
        "stdout" => BoxMakeWriter::new(std::io::stdout),
        _ => BoxMakeWriter::new(std::io::stderr),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer);
    if config.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_directives() {
        let config = LoggingConfig {
            level: Some("warn".into()),
            filters: vec!["rusty_cluster=debug".into()],
            ..Default::default()
        };
        assert_eq!(filter_directives(&config, false), "warn,rusty_cluster=debug");
        assert_eq!(filter_directives(&config, true), "debug,rusty_cluster=debug");
        assert_eq!(filter_directives(&LoggingConfig::default(), false), "info");
    }
}

use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    Json,
    Compact,
    Pretty,
}

impl LogFormat {
    fn parse(format: &str) -> Self {
        match format.trim().to_ascii_lowercase().as_str() {
            "json" => LogFormat::Json,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Pretty,
        }
    }
}

/// Installs the global subscriber. `RUST_LOG` takes precedence over `level`.
/// Unknown formats fall back to pretty output.
pub fn init_tracing(level: &str, format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(filter);
    match LogFormat::parse(format) {
        LogFormat::Json => builder.json().init(),
        LogFormat::Compact => builder.compact().init(),
        LogFormat::Pretty => builder.pretty().init(),
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::LogFormat;

    #[test_case("json", LogFormat::Json)]
    #[test_case(" JSON ", LogFormat::Json)]
    #[test_case("compact", LogFormat::Compact)]
    #[test_case("pretty", LogFormat::Pretty)]
    #[test_case("", LogFormat::Pretty)]
    fn format_selection(format: &str, expected: LogFormat) {
        assert_eq!(LogFormat::parse(format), expected);
    }
}

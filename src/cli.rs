use std::env;

use crate::error::EstimateError;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Ledger unavailable or query failed; the check can be retried.
pub const EXIT_DATA_SOURCE: u8 = 1;
/// Bad arguments, input or configuration.
pub const EXIT_INVALID: u8 = 2;
/// The HTTP server could not bind or stopped with an error.
pub const EXIT_SERVER: u8 = 3;

pub fn exit_code_for(err: &EstimateError) -> u8 {
    match err {
        EstimateError::Input(_) => EXIT_INVALID,
        EstimateError::DataSource(_) => EXIT_DATA_SOURCE,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Json,
    Text,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CliArgs {
    pub domains: Vec<String>,
    pub lookback: Option<String>,
    pub now: Option<String>,
    pub table: Option<String>,
    pub output: OutputFormat,
    pub serve: bool,
    pub import: Option<String>,
    pub validate_config: bool,
    pub show_version: bool,
    pub show_help: bool,
}

impl CliArgs {
    pub fn parse() -> Result<Self, String> {
        Self::parse_from(env::args().skip(1))
    }

    /// Parse arguments, excluding the program name.
    pub fn parse_from<I>(args: I) -> Result<Self, String>
    where
        I: IntoIterator<Item = String>,
    {
        let mut parsed = Self::default();
        let mut args = args.into_iter();

        while let Some(arg) = args.next() {
            // Accept both `--flag value` and `--flag=value`
            let (flag, inline) = match arg.split_once('=') {
                Some((f, v)) if f.starts_with("--") => (f.to_string(), Some(v.to_string())),
                _ => (arg.clone(), None),
            };
            let mut value = |name: &str| -> Result<String, String> {
                inline
                    .clone()
                    .or_else(|| args.next())
                    .ok_or_else(|| format!("{} requires a value", name))
            };

            match flag.as_str() {
                "--domain" | "-d" => parsed.domains.push(value("--domain")?),
                "--lookback" | "-l" => parsed.lookback = Some(value("--lookback")?),
                "--now" => parsed.now = Some(value("--now")?),
                "--table" => parsed.table = Some(value("--table")?),
                "--import" => parsed.import = Some(value("--import")?),
                "--output" | "-o" => {
                    parsed.output = match value("--output")?.as_str() {
                        "json" => OutputFormat::Json,
                        "text" => OutputFormat::Text,
                        other => return Err(format!("unknown output format: {}", other)),
                    }
                }
                "--serve" => parsed.serve = true,
                "--validate-config" => parsed.validate_config = true,
                "--version" | "-V" => parsed.show_version = true,
                "--help" | "-h" => parsed.show_help = true,
                other => return Err(format!("unknown argument: {}", other)),
            }
        }

        Ok(parsed)
    }

    /// True when the invocation asks for estimates rather than a server,
    /// an import or a config check.
    pub fn is_estimate(&self) -> bool {
        !self.serve && self.import.is_none() && !self.validate_config
    }

    pub fn print_help() {
        println!("certquota {}", VERSION);
        println!();
        println!("Estimate certificate-issuance quota usage from a certificate transparency ledger");
        println!();
        println!("USAGE:");
        println!("    certquota --domain <DOMAIN> [--domain <DOMAIN>...] [OPTIONS]");
        println!("    certquota --serve");
        println!("    certquota --import <FILE>");
        println!();
        println!("OPTIONS:");
        println!("    -d, --domain <DOMAIN>   Registered domain to estimate (repeatable)");
        println!("    -l, --lookback <SPAN>   Window length: P7D, PT36H, 7d, 36h, '7 days'");
        println!("                            (default: estimator.default_lookback)");
        println!("    --now <RFC3339>         Evaluate as of this instant instead of now");
        println!("    --table <PATH>          Delta ledger table (overrides ledger.table_path)");
        println!("    -o, --output <FORMAT>   json (one object per line) or text");
        println!("    --serve                 Run the HTTP API");
        println!("    --import <FILE>         Append JSON-lines observations to the ledger");
        println!("    --validate-config       Validate configuration and exit");
        println!("    -V, --version           Print version information");
        println!("    -h, --help              Print help information");
        println!();
        println!("EXIT STATUS:");
        println!("    0    success");
        println!("    1    ledger unavailable or query failed; retry later");
        println!("    2    invalid input or configuration");
        println!("    3    HTTP server failed to bind or stopped with an error");
        println!();
        println!("ENVIRONMENT VARIABLES:");
        println!("    CERTQUOTA_CONFIG                  Path to config file");
        println!("    CERTQUOTA_HOST                    Server host (default: 0.0.0.0)");
        println!("    CERTQUOTA_PORT                    Server port (default: 8080)");
        println!("    CERTQUOTA_LOG_LEVEL               Log level (default: info)");
        println!("    CERTQUOTA_TABLE_PATH              Ledger table (default: ./data/ct_ledger)");
        println!("    CERTQUOTA_QUERY_TIMEOUT_SECS      Ledger query deadline (default: 60)");
        println!("    CERTQUOTA_CANDIDATE_MARGIN_DAYS   not_after margin (default: 180)");
        println!("    CERTQUOTA_DEFAULT_LOOKBACK        Default window (default: P7D)");
    }

    pub fn print_version() {
        println!("certquota {}", VERSION);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<CliArgs, String> {
        CliArgs::parse_from(args.iter().map(|s| s.to_string()))
    }

    #[test]
    fn test_repeated_domains_keep_order() {
        let args = parse(&["--domain", "b.org", "-d", "a.org", "--domain=c.org"]).unwrap();
        assert_eq!(args.domains, vec!["b.org", "a.org", "c.org"]);
        assert!(args.is_estimate());
    }

    #[test]
    fn test_value_flags() {
        let args = parse(&[
            "--lookback",
            "36h",
            "--now",
            "2026-10-15T10:30:00Z",
            "--table",
            "/tmp/ledger",
            "--output",
            "text",
        ])
        .unwrap();
        assert_eq!(args.lookback.as_deref(), Some("36h"));
        assert_eq!(args.now.as_deref(), Some("2026-10-15T10:30:00Z"));
        assert_eq!(args.table.as_deref(), Some("/tmp/ledger"));
        assert_eq!(args.output, OutputFormat::Text);
    }

    #[test]
    fn test_lookback_with_space_as_single_argument() {
        let args = parse(&["--lookback", "7 days"]).unwrap();
        assert_eq!(args.lookback.as_deref(), Some("7 days"));
    }

    #[test]
    fn test_mode_flags() {
        let args = parse(&["--serve"]).unwrap();
        assert!(args.serve);
        assert!(!args.is_estimate());

        let args = parse(&["--import", "obs.jsonl"]).unwrap();
        assert_eq!(args.import.as_deref(), Some("obs.jsonl"));
        assert!(!args.is_estimate());

        let args = parse(&["-V", "-h"]).unwrap();
        assert!(args.show_version && args.show_help);
    }

    #[test]
    fn test_exit_codes_are_distinct() {
        use crate::error::{InputError, LedgerError};

        let input = EstimateError::Input(InputError::EmptyDomain);
        let ledger = EstimateError::DataSource(LedgerError::Unavailable("gone".to_string()));
        assert_eq!(exit_code_for(&input), EXIT_INVALID);
        assert_eq!(exit_code_for(&ledger), EXIT_DATA_SOURCE);
        assert_ne!(EXIT_SERVER, EXIT_DATA_SOURCE, "bind failures must not read as retryable");
        assert_ne!(EXIT_SERVER, EXIT_INVALID);
    }

    #[test]
    fn test_errors() {
        assert_eq!(
            parse(&["--domain"]).unwrap_err(),
            "--domain requires a value"
        );
        assert!(parse(&["--output", "yaml"]).unwrap_err().contains("yaml"));
        assert!(parse(&["--bogus"]).unwrap_err().contains("--bogus"));
    }
}

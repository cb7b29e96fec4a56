use clap::{
    builder::{
        styling::{AnsiColor, Effects, Styles},
        ValueParser,
    },
    Arg, ColorChoice, Command,
};

pub fn validator_log_level() -> ValueParser {
    ValueParser::from(move |level: &str| -> std::result::Result<u8, String> {
        if let Ok(parsed) = level.parse::<u8>() {
            // Successfully parsed as a number
            if parsed <= 5 {
                return Ok(parsed);
            }
        }

        match level.to_lowercase().as_str() {
            "error" => Ok(0),
            "warn" => Ok(1),
            "info" => Ok(2),
            "debug" => Ok(3),
            "trace" => Ok(4),
            _ => Err("invalid log level".to_string()),
        }
    })
}

pub fn new() -> Command {
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Green.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default());

    Command::new("custodia")
        .about("Accounts and credential authority")
        .version(env!("CARGO_PKG_VERSION"))
        .color(ColorChoice::Auto)
        .styles(styles)
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .help("Port to listen on")
                .default_value("8080")
                .env("CUSTODIA_PORT")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new("dsn")
                .short('d')
                .long("dsn")
                .help("Database connection string")
                .env("CUSTODIA_DSN")
                .required(true),
        )
        .arg(
            Arg::new("jwks")
                .long("jwks")
                .help("Path to the JWKS file holding the signing key set")
                .env("CUSTODIA_JWKS")
                .required(true),
        )
        .arg(
            Arg::new("portal-url")
                .long("portal-url")
                .help("Base URL of the portal frontend, used as token issuer and CORS origin")
                .env("CUSTODIA_PORTAL_URL")
                .required(true),
        )
        .arg(
            Arg::new("cookie-domain")
                .long("cookie-domain")
                .help("Domain attribute for the session cookie")
                .env("CUSTODIA_COOKIE_DOMAIN")
                .required(true),
        )
        .arg(
            Arg::new("cookie-hash-key")
                .long("cookie-hash-key")
                .help("32-byte session cookie hash key")
                .env("CUSTODIA_COOKIE_HASH_KEY")
                .required(true),
        )
        .arg(
            Arg::new("cookie-enc-key")
                .long("cookie-enc-key")
                .help("32-byte session cookie encryption key")
                .env("CUSTODIA_COOKIE_ENC_KEY")
                .required(true),
        )
        .arg(
            Arg::new("token-ttl")
                .long("token-ttl")
                .help("Session token lifetime in seconds")
                .default_value("2592000")
                .env("CUSTODIA_TOKEN_TTL")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new("max-keys")
                .long("max-keys")
                .help("Maximum API keys per owner, per kind")
                .default_value("64")
                .env("CUSTODIA_MAX_KEYS")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new("verbosity")
                .short('v')
                .long("verbose")
                .help("Verbosity level: ERROR, WARN, INFO, DEBUG, TRACE (default: ERROR)")
                .env("CUSTODIA_LOG_LEVEL")
                .global(true)
                .action(clap::ArgAction::Count)
                .value_parser(validator_log_level()),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQUIRED: [&str; 11] = [
        "custodia",
        "--dsn",
        "postgres://localhost/custodia",
        "--jwks",
        "/etc/custodia/jwks.json",
        "--portal-url",
        "https://portal.custodia.dev",
        "--cookie-domain",
        "custodia.dev",
        "--cookie-hash-key",
        "00000000000000000000000000000000",
    ];

    fn args_with_enc_key() -> Vec<&'static str> {
        let mut args = REQUIRED.to_vec();
        args.extend(["--cookie-enc-key", "11111111111111111111111111111111"]);
        args
    }

    #[test]
    fn test_new() {
        let command = new();

        assert_eq!(command.get_name(), "custodia");
        assert_eq!(
            command.get_about().unwrap().to_string(),
            "Accounts and credential authority"
        );
        assert_eq!(
            command.get_version().unwrap().to_string(),
            env!("CARGO_PKG_VERSION")
        );
    }

    #[test]
    fn test_defaults() {
        let command = new();
        let matches = command.get_matches_from(args_with_enc_key());

        assert_eq!(matches.get_one::<u16>("port").copied(), Some(8080));
        assert_eq!(matches.get_one::<i64>("token-ttl").copied(), Some(2_592_000));
        assert_eq!(matches.get_one::<i64>("max-keys").copied(), Some(64));
    }

    #[test]
    fn test_missing_required_arg_fails() {
        let command = new();
        let result = command.try_get_matches_from(REQUIRED.to_vec());
        assert!(result.is_err());
    }

    #[test]
    fn test_env_fallback() {
        temp_env::with_vars(
            [
                ("CUSTODIA_PORT", Some("9090")),
                (
                    "CUSTODIA_COOKIE_ENC_KEY",
                    Some("11111111111111111111111111111111"),
                ),
            ],
            || {
                let command = new();
                let matches = command.get_matches_from(REQUIRED.to_vec());
                assert_eq!(matches.get_one::<u16>("port").copied(), Some(9090));
                assert_eq!(
                    matches.get_one::<String>("cookie-enc-key").map(String::len),
                    Some(32)
                );
            },
        );
    }

    #[test]
    fn test_log_level_env_names() {
        // loop cover all possible value_parse
        let levels = ["error", "warn", "info", "debug", "trace"];
        for (index, &level) in levels.iter().enumerate() {
            temp_env::with_vars(
                [
                    ("CUSTODIA_LOG_LEVEL", Some(level)),
                    ("CUSTODIA_COOKIE_ENC_KEY", Some("11111111111111111111111111111111")),
                ],
                || {
                    let command = new();
                    let matches = command.get_matches_from(REQUIRED.to_vec());
                    assert_eq!(
                        matches.get_one::<u8>("verbosity").copied(),
                        Some(index as u8)
                    );
                },
            );
        }
    }

    #[test]
    fn test_invalid_log_level_fails() {
        temp_env::with_vars(
            [
                ("CUSTODIA_LOG_LEVEL", Some("loud")),
                ("CUSTODIA_COOKIE_ENC_KEY", Some("11111111111111111111111111111111")),
            ],
            || {
                let command = new();
                assert!(command.try_get_matches_from(REQUIRED.to_vec()).is_err());
            },
        );
    }
}

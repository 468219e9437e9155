use std::{fmt, path::PathBuf};

/// The address listened on when none is given.
pub const DEFAULT_LISTEN_ADDRESS: &str = "1666";

/// The trust file used when `--trust-file` isn't given.
pub const DEFAULT_TRUST_FILE: &str = ".p4rpc_trust";

/// Gets a small string with this program's name and version.
pub fn get_version_string() -> String {
    format!(
        concat!(env!("CARGO_PKG_NAME"), " ", env!("CARGO_PKG_VERSION"), " ({} {})"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}

/// Gets a string with this program's help documentation.
pub fn get_help_string() -> &'static str {
    concat!(
        "Usage: p4rpc [options...]\n",
        "Options:\n",
        "  -h, --help                      Display this help menu and exit\n",
        "  -V, --version                   Display the version number and exit\n",
        "  -v, --verbose                   Display additional information while running\n",
        "  -s, --silent                    Only display errors\n",
        "  -t, --tunable <name=value>      Set a tunable, e.g. net.maxwait=60 or rpc.himark=65536\n",
        "\n",
        "Server options:\n",
        "  -l, --listen <address>          Listen for connections on this address (default 1666)\n",
        "\n",
        "Client options:\n",
        "  -c, --connect <address>         Connect to the server at this address\n",
        "  -u, --user <name>               The user to log in as\n",
        "      --trust                     Trust the server's key if it's not known yet\n",
        "      --trust-file <path>         Where trusted keys are kept (default .p4rpc_trust)\n",
        "\n",
        "Addresses are written as [transport:][host:]port, where transport is one of tcp, tcp4,\n",
        "tcp6, ssl, ssl4 or ssl6. IPv6 hosts go between brackets, e.g. ssl:[::1]:1666.\n",
    )
}

/// The result of parsing the program's arguments.
#[derive(Debug, PartialEq)]
pub enum ArgumentsRequest {
    /// Print the help menu to stdout and exit.
    Help,

    /// Print this program's version to stdout and exit.
    Version,

    /// Run with the provided arguments.
    Run(StartupArguments),
}

/// Specifies the information on how the program should run.
#[derive(Debug, PartialEq)]
pub struct StartupArguments {
    pub verbose: bool,
    pub silent: bool,

    /// Tunables as given, in `name=value` form.
    pub tunables: Vec<String>,

    pub startup_mode: StartupMode,
}

#[derive(Debug, PartialEq)]
pub enum StartupMode {
    Server(StartServerConfig),
    Client(StartClientConfig),
}

impl StartupMode {
    pub fn is_client(&self) -> bool {
        matches!(self, StartupMode::Client(_))
    }
}

#[derive(Debug, PartialEq)]
pub struct StartServerConfig {
    pub address: String,
}

#[derive(Debug, PartialEq)]
pub struct StartClientConfig {
    pub address: String,
    pub user: String,

    /// Whether to pin the server's key if it isn't known yet.
    pub trust: bool,
    pub trust_file: PathBuf,
}

impl StartClientConfig {
    fn new() -> Self {
        Self {
            address: String::new(),
            user: String::new(),
            trust: false,
            trust_file: PathBuf::from(DEFAULT_TRUST_FILE),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ArgumentsError {
    UnknownArgument(String),
    MissingValue(String),
    EmptyValue(String),
    BadTunable(String),
    ClientFoundServerArgument(String),
    ServerFoundClientArgument(String),
    MissingDestination,
}

impl fmt::Display for ArgumentsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownArgument(arg) => write!(f, "Unknown argument: {arg}"),
            Self::MissingValue(arg) => write!(f, "Expected a value after {arg}"),
            Self::EmptyValue(arg) => write!(f, "The value after {arg} can't be empty"),
            Self::BadTunable(value) => write!(f, "Tunables are written as name=value, got '{value}'"),
            Self::ClientFoundServerArgument(arg) => {
                write!(f, "Previous arguments indicated client mode, but {arg} is indicating server mode")
            }
            Self::ServerFoundClientArgument(arg) => {
                write!(f, "Previous arguments indicated server mode, but {arg} is indicating client mode")
            }
            Self::MissingDestination => write!(f, "When running on client mode, a destination address must be specified"),
        }
    }
}

fn parse_value_arg(arg: &str, maybe_value: Option<String>) -> Result<String, ArgumentsError> {
    match maybe_value {
        None => Err(ArgumentsError::MissingValue(arg.to_string())),
        Some(value) if value.trim().is_empty() => Err(ArgumentsError::EmptyValue(arg.to_string())),
        Some(value) => Ok(value),
    }
}

struct StartupArgumentsParser {
    verbose: bool,
    silent: bool,
    tunables: Vec<String>,
    startup_mode: Option<StartupMode>,
}

impl StartupArgumentsParser {
    const fn new() -> Self {
        Self {
            verbose: false,
            silent: false,
            tunables: Vec::new(),
            startup_mode: None,
        }
    }

    fn modify_startup_mode_client<F>(&mut self, arg: String, f: F) -> Result<(), ArgumentsError>
    where
        F: FnOnce(String, &mut StartClientConfig) -> Result<(), ArgumentsError>,
    {
        match &mut self.startup_mode {
            None => {
                let mut client_config = StartClientConfig::new();
                f(arg, &mut client_config)?;
                self.startup_mode = Some(StartupMode::Client(client_config));
            }
            Some(StartupMode::Client(client_config)) => f(arg, client_config)?,
            Some(StartupMode::Server(_)) => return Err(ArgumentsError::ServerFoundClientArgument(arg)),
        }

        Ok(())
    }

    fn modify_startup_mode_server<F>(&mut self, arg: String, f: F) -> Result<(), ArgumentsError>
    where
        F: FnOnce(String, &mut StartServerConfig) -> Result<(), ArgumentsError>,
    {
        match &mut self.startup_mode {
            None => {
                let mut server_config = StartServerConfig { address: String::new() };
                f(arg, &mut server_config)?;
                self.startup_mode = Some(StartupMode::Server(server_config));
            }
            Some(StartupMode::Server(server_config)) => f(arg, server_config)?,
            Some(StartupMode::Client(_)) => return Err(ArgumentsError::ClientFoundServerArgument(arg)),
        }

        Ok(())
    }

    fn complete(self) -> Result<StartupArguments, ArgumentsError> {
        let mut startup_mode = self.startup_mode.unwrap_or_else(|| StartupMode::Server(StartServerConfig { address: String::new() }));

        match &mut startup_mode {
            StartupMode::Server(server_config) if server_config.address.is_empty() => {
                server_config.address = DEFAULT_LISTEN_ADDRESS.to_string();
            }
            StartupMode::Client(client_config) if client_config.address.is_empty() => return Err(ArgumentsError::MissingDestination),
            StartupMode::Client(client_config) if client_config.user.is_empty() => {
                client_config.user = std::env::var("USER").unwrap_or_else(|_| "nobody".to_string());
            }
            _ => {}
        }

        Ok(StartupArguments {
            verbose: self.verbose,
            silent: self.silent,
            tunables: self.tunables,
            startup_mode,
        })
    }
}

fn try_parse_general_argument<F>(
    result: &mut StartupArgumentsParser,
    maybe_arg: &mut Option<String>,
    get_next_arg: F,
) -> Result<bool, ArgumentsError>
where
    F: FnOnce() -> Option<String>,
{
    let arg = match maybe_arg.take() {
        Some(s) => s,
        None => return Ok(false),
    };

    if arg.eq("-v") || arg.eq_ignore_ascii_case("--verbose") {
        result.verbose = true;
    } else if arg.eq("-s") || arg.eq_ignore_ascii_case("--silent") {
        result.silent = true;
    } else if arg.eq("-t") || arg.eq_ignore_ascii_case("--tunable") {
        let tunable = parse_value_arg(&arg, get_next_arg())?;
        if !tunable.contains('=') {
            return Err(ArgumentsError::BadTunable(tunable));
        }
        result.tunables.push(tunable);
    } else {
        *maybe_arg = Some(arg);
    }

    Ok(maybe_arg.is_none())
}

fn try_parse_server_argument<F>(
    result: &mut StartupArgumentsParser,
    maybe_arg: &mut Option<String>,
    get_next_arg: F,
) -> Result<bool, ArgumentsError>
where
    F: FnOnce() -> Option<String>,
{
    let arg = match maybe_arg.take() {
        Some(s) => s,
        None => return Ok(false),
    };

    if arg.eq("-l") || arg.eq_ignore_ascii_case("--listen") {
        result.modify_startup_mode_server(arg, |arg, server_config| {
            server_config.address = parse_value_arg(&arg, get_next_arg())?;
            Ok(())
        })?;
    } else {
        *maybe_arg = Some(arg);
    }

    Ok(maybe_arg.is_none())
}

fn try_parse_client_argument<F>(
    result: &mut StartupArgumentsParser,
    maybe_arg: &mut Option<String>,
    get_next_arg: F,
) -> Result<bool, ArgumentsError>
where
    F: FnOnce() -> Option<String>,
{
    let arg = match maybe_arg.take() {
        Some(s) => s,
        None => return Ok(false),
    };

    if arg.eq("-c") || arg.eq_ignore_ascii_case("--connect") {
        result.modify_startup_mode_client(arg, |arg, client_config| {
            client_config.address = parse_value_arg(&arg, get_next_arg())?;
            Ok(())
        })?;
    } else if arg.eq("-u") || arg.eq_ignore_ascii_case("--user") {
        result.modify_startup_mode_client(arg, |arg, client_config| {
            client_config.user = parse_value_arg(&arg, get_next_arg())?;
            Ok(())
        })?;
    } else if arg.eq_ignore_ascii_case("--trust") {
        result.modify_startup_mode_client(arg, |_, client_config| {
            client_config.trust = true;
            Ok(())
        })?;
    } else if arg.eq_ignore_ascii_case("--trust-file") {
        result.modify_startup_mode_client(arg, |arg, client_config| {
            client_config.trust_file = PathBuf::from(parse_value_arg(&arg, get_next_arg())?);
            Ok(())
        })?;
    } else {
        *maybe_arg = Some(arg);
    }

    Ok(maybe_arg.is_none())
}

pub fn parse_arguments<T>(mut args: T) -> Result<ArgumentsRequest, ArgumentsError>
where
    T: Iterator<Item = String>,
{
    let mut result = StartupArgumentsParser::new();

    // Ignore the first argument, as it's by convention the name of the program
    args.next();

    while let Some(arg) = args.next() {
        if arg.is_empty() {
            continue;
        } else if arg.eq("-h") || arg.eq_ignore_ascii_case("--help") {
            return Ok(ArgumentsRequest::Help);
        } else if arg.eq("-V") || arg.eq_ignore_ascii_case("--version") {
            return Ok(ArgumentsRequest::Version);
        }

        let mut maybe_arg = Some(arg);
        let _ = !try_parse_general_argument(&mut result, &mut maybe_arg, || args.next())?
            && !try_parse_server_argument(&mut result, &mut maybe_arg, || args.next())?
            && !try_parse_client_argument(&mut result, &mut maybe_arg, || args.next())?;

        if let Some(arg) = maybe_arg {
            return Err(ArgumentsError::UnknownArgument(arg));
        }
    }

    let result = result.complete()?;
    Ok(ArgumentsRequest::Run(result))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::{parse_arguments, ArgumentsError, ArgumentsRequest, StartupMode, DEFAULT_LISTEN_ADDRESS, DEFAULT_TRUST_FILE};

    fn parse(args: &[&str]) -> Result<ArgumentsRequest, ArgumentsError> {
        parse_arguments(std::iter::once("p4rpc").chain(args.iter().copied()).map(String::from))
    }

    #[test]
    fn test_defaults_to_server() {
        let Ok(ArgumentsRequest::Run(args)) = parse(&[]) else {
            panic!("expected run");
        };

        assert!(!args.verbose);
        assert_eq!(args.startup_mode, StartupMode::Server(super::StartServerConfig { address: DEFAULT_LISTEN_ADDRESS.into() }));
    }

    #[test]
    fn test_client_arguments() {
        let Ok(ArgumentsRequest::Run(args)) = parse(&[
            "-v",
            "--connect",
            "ssl:localhost:1666",
            "--user",
            "alice",
            "--trust",
            "-t",
            "net.maxwait=5",
        ]) else {
            panic!("expected run");
        };

        assert!(args.verbose);
        assert_eq!(args.tunables, vec!["net.maxwait=5".to_string()]);

        let StartupMode::Client(client) = args.startup_mode else {
            panic!("expected client mode");
        };
        assert_eq!(client.address, "ssl:localhost:1666");
        assert_eq!(client.user, "alice");
        assert!(client.trust);
        assert_eq!(client.trust_file, PathBuf::from(DEFAULT_TRUST_FILE));
    }

    #[test]
    fn test_errors() {
        assert_eq!(parse(&["--bogus"]), Err(ArgumentsError::UnknownArgument("--bogus".into())));
        assert_eq!(parse(&["--trust"]), Err(ArgumentsError::MissingDestination));
        assert_eq!(parse(&["--connect"]), Err(ArgumentsError::MissingValue("--connect".into())));
        assert_eq!(parse(&["-t", "rpc.himark"]), Err(ArgumentsError::BadTunable("rpc.himark".into())));
        assert_eq!(
            parse(&["--listen", "1666", "--user", "bob"]),
            Err(ArgumentsError::ServerFoundClientArgument("--user".into()))
        );
        assert_eq!(parse(&["-h", "--bogus"]), Ok(ArgumentsRequest::Help));
    }
}

use tracing_subscriber::filter::LevelFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    /// Newline-delimited JSON events.
    Json,
    /// Plain text without ANSI colors.
    Text,
    /// Text with ANSI colors.
    Color,
}

/// Logging arguments shared by all subcommands.
#[derive(Debug, clap::Args)]
pub struct LogArgs {
    /// Level of logs to emit. RUST_LOG directives, when set, take precedence.
    #[clap(
        long = "log.level",
        env = "RUNCMD_LOG",
        default_value = "warn",
        value_enum,
        global = true
    )]
    pub level: LogLevel,
    /// Format of emitted logs. Defaults to `color` when stderr is a TTY, and `text` otherwise.
    #[clap(long = "log.format", value_enum, global = true)]
    pub format: Option<LogFormat>,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Off => LevelFilter::OFF,
        }
    }
}

/// Install a global tracing subscriber which writes to stderr.
/// Stdout is left to the output of run commands.
pub fn init_logging(args: &LogArgs) {
    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(LevelFilter::from(args.level).into())
        .from_env_lossy();

    let format = args.format.unwrap_or_else(|| {
        if atty::is(atty::Stream::Stderr) {
            LogFormat::Color
        } else {
            LogFormat::Text
        }
    });

    let builder = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter);

    match format {
        LogFormat::Json => builder
            .json()
            // Without this, the message and fields would be nested under "fields".
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(false)
            .with_target(false)
            .init(),
        LogFormat::Text => builder.with_ansi(false).init(),
        LogFormat::Color => builder.with_ansi(true).init(),
    }
}

use crate::config::Config as LoghubConfig;
use log4rs::{
    append::console::ConsoleAppender,
    append::rolling_file::{
        policy::compound::{
            roll::fixed_window::FixedWindowRoller, trigger::size::SizeTrigger, CompoundPolicy,
        },
        RollingFileAppender,
    },
    config::{Appender, Config, Logger, Root},
    encode::pattern::PatternEncoder,
    filter::threshold::ThresholdFilter,
};

#[derive(Debug, Clone, Copy)]
pub enum LogTarget {
    Daemon,
    Ingest,
    Egress,
    Control,
    Cli,
}

impl LogTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogTarget::Daemon => "daemon",
            LogTarget::Ingest => "ingest",
            LogTarget::Egress => "egress",
            LogTarget::Control => "control",
            LogTarget::Cli => "cli",
        }
    }
}

fn create_stdout_appender() -> ConsoleAppender {
    let pattern = "{d(%Y-%m-%d %H:%M:%S%.3f %Z)} [{h({l})}] - {m} (({f}:{L})){n}";
    ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new(pattern)))
        .build()
}

fn create_rolling_file_appender(
    base_path: &std::path::Path,
    pattern: &str,
) -> Result<RollingFileAppender, Box<dyn std::error::Error>> {
    let log_file_path = base_path.with_extension("log");
    let roll_pattern = format!("{}.{{}}.log", base_path.to_string_lossy());

    let roller = FixedWindowRoller::builder()
        .base(1)
        .build(&roll_pattern, 5)?;

    let trigger = SizeTrigger::new(10 * 1024 * 1024);
    let policy = CompoundPolicy::new(Box::new(trigger), Box::new(roller));

    RollingFileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(pattern)))
        .build(log_file_path.to_str().unwrap(), Box::new(policy))
        .map_err(|e| e.into())
}

/// Initializes log4rs for one binary: a console appender plus a rolling file
/// under the configured log directory. Each [`LogTarget`] gets its own
/// logger routed to that file so endpoint chatter is attributable.
pub fn init_logger(
    config: &LoghubConfig,
    log_file_base: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let pattern = "{d(%Y-%m-%d %H:%M:%S%.3f %Z)} - {h({l})} - [{t}] {m} (({f}:{L})){n}";

    std::fs::create_dir_all(config.loghub_dirs.log_dir.as_path())?;

    let base_path = config.loghub_dirs.log_dir.join(log_file_base);
    let rolling_file = create_rolling_file_appender(&base_path, pattern)?;
    let file_appender = Appender::builder()
        .filter(Box::new(ThresholdFilter::new(log::LevelFilter::Info)))
        .build("file", Box::new(rolling_file));

    let stdout = create_stdout_appender();

    let mut builder = Config::builder()
        .appender(Appender::builder().build("stdout", Box::new(stdout)))
        .appender(file_appender);

    for target in [
        LogTarget::Daemon,
        LogTarget::Ingest,
        LogTarget::Egress,
        LogTarget::Control,
        LogTarget::Cli,
    ] {
        builder = builder.logger(
            Logger::builder()
                .appender("file")
                .appender("stdout")
                .additive(false)
                .build(target.as_str(), config.log_level),
        );
    }

    let log_config = builder.build(Root::builder().build(config.log_level))?;

    log4rs::init_config(log_config)?;

    Ok(())
}

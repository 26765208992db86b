mod cli;
mod cmds;

use clap::Parser;
use cli::{Cli, Commands};
use env_logger::{Builder, Env};
use log::error;
use loghub_utils::config::Config;
use loghub_utils::log::LogTarget;

#[tokio::main]
async fn main() {
    let config = Config::from_env();

    let cli = Cli::parse();

    Builder::from_env(Env::default().default_filter_or("warn"))
        .filter(None, cli.global_args.log_level)
        .init();

    let code = match cli.command {
        Commands::Stats { buffers, json } => {
            let mut command = String::from("getStatistics");
            for buffer in &buffers {
                command.push(' ');
                command.push_str(buffer);
            }
            if json {
                command.push_str(" format=json");
            }
            control(&config, &command, true).await
        }
        Commands::Clear { buffer, uid } => {
            let command = match uid {
                Some(uid) => format!("clear {buffer} uid={uid}"),
                None => format!("clear {buffer}"),
            };
            control(&config, &command, false).await
        }
        Commands::Prune { set } => match set {
            Some(spec) => control(&config, &format!("setPruneList {spec}"), false).await,
            None => control(&config, "getPruneList", true).await,
        },
        Commands::Tag { name, format } => {
            control(&config, &format!("getEventTag name={name} format={format}"), false).await
        }
        Commands::Reinit => control(&config, "reinit", false).await,
        Commands::Quota { buffer, set } => match set {
            Some(bytes) => control(&config, &format!("setQuota {buffer} {bytes}"), false).await,
            None => control(&config, &format!("getQuota {buffer}"), false).await,
        },
        Commands::Cat { read_args } => cmds::read::run(&config, &read_args, false).await,
        Commands::Tail { read_args } => cmds::read::run(&config, &read_args, true).await,
    };

    std::process::exit(code);
}

async fn control(config: &Config, command: &str, multiline: bool) -> i32 {
    match cmds::control::send_command(config, command, multiline).await {
        Ok(reply) => cmds::control::finish(&reply),
        Err(e) => {
            error!(target: LogTarget::Cli.as_str(), "control connection failed: {e}");
            1
        }
    }
}

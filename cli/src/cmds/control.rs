//! Client side of the control protocol: one command line out, a one-line
//! or blank-line-terminated block reply back.

use log::debug;
use loghub_utils::config::Config;
use loghub_utils::log::LogTarget;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

pub async fn send_command(
    config: &Config,
    command: &str,
    multiline: bool,
) -> std::io::Result<String> {
    debug!(target: LogTarget::Cli.as_str(), "sending: {command}");

    let mut stream = UnixStream::connect(config.loghub_dirs.control_socket()).await?;
    stream.write_all(format!("{command}\n").as_bytes()).await?;

    let mut lines = BufReader::new(stream).lines();
    if !multiline {
        return Ok(lines.next_line().await?.unwrap_or_default());
    }

    let mut reply = String::new();
    while let Some(line) = lines.next_line().await? {
        if line.is_empty() {
            break;
        }
        reply.push_str(&line);
        reply.push('\n');
    }
    Ok(reply)
}

/// Prints the reply and maps it to a process exit code.
pub fn finish(reply: &str) -> i32 {
    let failed = reply.starts_with("error")
        || reply.starts_with("Invalid")
        || reply.starts_with("Permission Denied");
    if !reply.is_empty() {
        println!("{}", reply.trim_end());
    }
    i32::from(failed)
}

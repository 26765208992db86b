use crate::config::Env;
use std::path::PathBuf;

const LOG_DIR: &str = "logs";
const SOCKET_DIR: &str = "sockets";
const TAG_FILE: &str = "event-log-tags";

const INGEST_SOCKET: &str = "ingest";
const EGRESS_SOCKET: &str = "reader";
const CONTROL_SOCKET: &str = "control";

#[derive(Clone)]
pub struct LoghubDirs {
    app_dir: PathBuf,
    pub env_dir: PathBuf,
    pub log_dir: PathBuf,
    pub socket_dir: PathBuf,
}

impl LoghubDirs {
    pub fn new(env: Env, app_dir: PathBuf) -> Self {
        let env_dir = app_dir.join(env.to_string());
        std::fs::create_dir_all(&env_dir).unwrap();

        let log_dir = env_dir.join(LOG_DIR);
        let _ = std::fs::create_dir(&log_dir);

        let socket_dir = env_dir.join(SOCKET_DIR);
        let _ = std::fs::create_dir(&socket_dir);

        Self {
            app_dir,
            env_dir,
            log_dir,
            socket_dir,
        }
    }

    pub fn ingest_socket(&self) -> PathBuf {
        self.socket_dir.join(INGEST_SOCKET)
    }

    pub fn egress_socket(&self) -> PathBuf {
        self.socket_dir.join(EGRESS_SOCKET)
    }

    pub fn control_socket(&self) -> PathBuf {
        self.socket_dir.join(CONTROL_SOCKET)
    }

    pub fn tag_file(&self) -> PathBuf {
        self.env_dir.join(TAG_FILE)
    }

    pub fn app_dir(&self) -> &PathBuf {
        &self.app_dir
    }
}

pub fn get_app_dir(name: String) -> PathBuf {
    dirs::home_dir().unwrap().join(name)
}

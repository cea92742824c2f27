//! Server configuration from command-line flags and environment variables.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser};

use crate::build::BuildCommand;
use crate::notify::DEFAULT_CAPACITY;

#[derive(Debug, Clone, Args)]
pub struct ServerConfig {
    /// Forest directory holding `trees/` (build input) and `output/` (build output)
    #[arg(long, env = "FOREST_DIR", default_value = "/tmp/forest")]
    pub forest_dir: PathBuf,

    /// SQLite database path (default: `<forest-dir>/state.db`)
    #[arg(long = "db", env = "FOREST_DB")]
    pub db_path: Option<PathBuf>,

    /// Address to bind the HTTP server to
    #[arg(long, env = "FOREST_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Port for the HTTP server
    #[arg(short, long, env = "FOREST_PORT", default_value_t = 1234)]
    pub port: u16,

    /// Build program, run once per build over the whole forest
    #[arg(long, env = "FOREST_BUILD_PROGRAM", default_value = "forester")]
    pub build_program: String,

    /// Build program arguments; `{content}` and `{output}` are replaced by the
    /// content and built roots
    #[arg(
        long = "build-arg",
        env = "FOREST_BUILD_ARGS",
        value_delimiter = ' ',
        allow_hyphen_values = true,
        default_values = ["build", "--dir", "{output}", "{content}"]
    )]
    pub build_args: Vec<String>,

    /// Seconds before a running build is killed (0 disables the deadline)
    #[arg(long, env = "FOREST_BUILD_TIMEOUT_SECS", default_value_t = 300)]
    pub build_timeout_secs: u64,

    /// Build events buffered per preview connection
    #[arg(long, default_value_t = DEFAULT_CAPACITY)]
    pub bus_capacity: usize,
}

#[derive(Parser)]
struct Standalone {
    #[command(flatten)]
    config: ServerConfig,
}

impl ServerConfig {
    /// Defaults overridden by environment variables only.
    pub fn from_env() -> Self {
        Standalone::parse_from(["forest-server"]).config
    }

    /// Defaults for a forest at `dir`, ignoring the environment.
    pub fn for_forest(dir: impl Into<PathBuf>) -> Self {
        Self {
            forest_dir: dir.into(),
            db_path: None,
            host: "127.0.0.1".to_string(),
            port: 1234,
            build_program: "forester".to_string(),
            build_args: ["build", "--dir", "{output}", "{content}"]
                .map(String::from)
                .to_vec(),
            build_timeout_secs: 300,
            bus_capacity: DEFAULT_CAPACITY,
        }
    }

    pub fn content_root(&self) -> PathBuf {
        self.forest_dir.join("trees")
    }

    pub fn built_root(&self) -> PathBuf {
        self.forest_dir.join("output")
    }

    pub fn database_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| self.forest_dir.join("state.db"))
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn build_timeout(&self) -> Option<Duration> {
        (self.build_timeout_secs > 0).then(|| Duration::from_secs(self.build_timeout_secs))
    }

    pub fn build_command(&self) -> BuildCommand {
        BuildCommand::new(&self.build_program)
            .args(self.build_args.iter().filter(|arg| !arg.is_empty()).cloned())
            .current_dir(&self.forest_dir)
            .timeout(self.build_timeout())
    }
}

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::DEFAULT_CONFIG_PATH;
use crate::state_store::DEFAULT_STATE_PATH;

#[derive(Parser, Debug)]
#[command(
    name = "one-click-kag",
    version,
    about = "Run a King Arthur's Gold server on a DigitalOcean droplet"
)]
pub struct Cli {
    /// Desired-state config (YAML)
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    pub config_file: PathBuf,

    /// Where the droplet and key identity is tracked
    #[arg(long, global = true, default_value = DEFAULT_STATE_PATH)]
    pub state_file: PathBuf,

    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// Create (or reuse) the droplet and start the server
    Up,
    /// Destroy the droplet
    Down {
        /// Don't download the server cache before destroying
        #[arg(long)]
        skip_cache: bool,
    },
    /// Re-upload configuration and restart the game server
    RestartKag,
    /// Follow the game server logs
    KagLogs,
    /// Open a shell on the droplet
    Ssh,
    /// Attach to the server's remote console
    Rcon,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cli = Cli::try_parse_from(["one-click-kag", "up"]).unwrap();
        assert_eq!(cli.config_file, PathBuf::from("config.yaml"));
        assert_eq!(cli.state_file, PathBuf::from("state.json"));
        assert_eq!(cli.cmd, Command::Up);
    }

    #[test]
    fn kebab_case_subcommands() {
        for (arg, expected) in [
            ("restart-kag", Command::RestartKag),
            ("kag-logs", Command::KagLogs),
            ("ssh", Command::Ssh),
            ("rcon", Command::Rcon),
        ] {
            let cli = Cli::try_parse_from(["one-click-kag", arg]).unwrap();
            assert_eq!(cli.cmd, expected);
        }
    }

    #[test]
    fn down_skip_cache_and_global_paths() {
        let cli = Cli::try_parse_from([
            "one-click-kag",
            "down",
            "--skip-cache",
            "--config-file",
            "/srv/kag/config.yaml",
            "--state-file",
            "/srv/kag/state.json",
        ])
        .unwrap();
        assert_eq!(cli.cmd, Command::Down { skip_cache: true });
        assert_eq!(cli.config_file, PathBuf::from("/srv/kag/config.yaml"));
        assert_eq!(cli.state_file, PathBuf::from("/srv/kag/state.json"));
    }

    #[test]
    fn unknown_subcommand_rejected() {
        assert!(Cli::try_parse_from(["one-click-kag", "explode"]).is_err());
        assert!(Cli::try_parse_from(["one-click-kag"]).is_err());
    }
}

//! C7: command-line surface, scoped down from the teacher's much larger
//! `inspect`/`optimize`/`simplify`/`copy`/`verify` set to just the two
//! things this crate does: run the pipeline once, and manage profiles.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "streetcull", version, about = "Filters an MBTiles vector tile archive to a street-only layer profile.")]
pub struct Cli {
    /// Log level passed to `tracing_subscriber::EnvFilter` (e.g. info, debug).
    #[arg(long, global = true, default_value = "info")]
    pub log: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the pipeline once over an MBTiles archive.
    Run(RunArgs),
    /// Manage stored profiles.
    Profile(ProfileArgs),
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Source MBTiles archive. Never modified.
    pub input: PathBuf,
    /// Destination MBTiles archive. Must not already exist.
    pub output: PathBuf,
    /// Id of a stored profile to use. Defaults to the store's default profile.
    #[arg(long)]
    pub profile: Option<String>,
    /// Inline comma-separated layer list, used instead of a stored profile.
    #[arg(long, conflicts_with = "profile")]
    pub profile_layers: Option<String>,
    /// Path to the JSON profile store.
    #[arg(long, default_value = "profiles.json")]
    pub profile_store: PathBuf,
}

#[derive(Debug, Args)]
pub struct ProfileArgs {
    #[command(subcommand)]
    pub command: ProfileCommand,
    /// Path to the JSON profile store.
    #[arg(long, default_value = "profiles.json", global = true)]
    pub profile_store: PathBuf,
}

#[derive(Debug, Subcommand)]
pub enum ProfileCommand {
    /// List all stored profiles, ordered by name.
    List,
    /// Show one profile by id.
    Show { id: String },
    /// Create a new profile.
    Create {
        id: String,
        name: String,
        /// Comma-separated layer names to keep.
        layers: String,
        #[arg(long)]
        set_default: bool,
    },
    /// Replace a profile's name and/or layer list.
    Update {
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        layers: Option<String>,
    },
    /// Delete a profile.
    Delete { id: String },
    /// Make an existing profile the default.
    SetDefault { id: String },
}

/// Parse a comma-separated layer list into the set `Profile::layers_to_keep` expects.
pub fn parse_layer_list(raw: &str) -> std::collections::HashSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_comma_separated_layers_trimming_whitespace() {
        let set = parse_layer_list("streets, water , , buildings");
        assert_eq!(set.len(), 3);
        assert!(set.contains("streets"));
        assert!(set.contains("water"));
        assert!(set.contains("buildings"));
    }
}

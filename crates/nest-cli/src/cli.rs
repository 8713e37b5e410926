use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use nest_codec::ObjectKind;

#[derive(Parser)]
#[command(
    name = "nest",
    about = "Inspect nest objects, rule files, and configuration",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Compute the object id of a file's content
    HashObject(HashObjectArgs),
    /// Parse a rule file and optionally run its generator
    CheckRule(CheckRuleArgs),
    /// Normalize and edit a .gitmodules file
    Modules(ModulesArgs),
    /// Print the effective forest configuration
    Config(ConfigArgs),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum KindArg {
    Blob,
    Tree,
    Commit,
    Tag,
}

impl From<KindArg> for ObjectKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Blob => ObjectKind::Blob,
            KindArg::Tree => ObjectKind::Tree,
            KindArg::Commit => ObjectKind::Commit,
            KindArg::Tag => ObjectKind::Tag,
        }
    }
}

#[derive(Args)]
pub struct HashObjectArgs {
    pub path: PathBuf,
    #[arg(short = 't', long, default_value = "blob")]
    pub kind: KindArg,
    /// Read the file as a JSON description of the object instead of raw bytes
    #[arg(long)]
    pub json: bool,
}

#[derive(Args)]
pub struct CheckRuleArgs {
    pub path: PathBuf,
    /// Run the generator with the built-in registry
    #[arg(long)]
    pub eval: bool,
}

#[derive(Args)]
pub struct ModulesArgs {
    pub path: PathBuf,
    /// Add or replace a submodule, as PATH=URL
    #[arg(long, value_name = "PATH=URL")]
    pub add: Vec<String>,
    /// Remove the submodule at PATH
    #[arg(long, value_name = "PATH")]
    pub remove: Vec<String>,
}

#[derive(Args)]
pub struct ConfigArgs {
    /// TOML file to load; defaults apply to anything it leaves out
    pub path: Option<PathBuf>,
}

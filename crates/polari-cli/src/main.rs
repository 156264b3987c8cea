//! Polari Command-Line Inspector
//!
//! Loads a JSON fixture into an in-memory object store and prints the
//! object tree, a principal's access dicts, or the result of a read.

mod error;
mod fixture;
mod output;

use clap::{Parser, Subcommand};
use error::{CliError, Result};
use fixture::Fixture;
use output::OutputFormat;
use polari_core::{AttributeFilter, Principal, StoreConfig};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Polari Command-Line Inspector
#[derive(Parser, Debug)]
#[command(name = "polari")]
#[command(version, about = "Inspect a Polari object store built from a JSON fixture")]
pub struct Args {
    /// Fixture file (classes, directory, permission_sets, instances, placements)
    pub fixture: PathBuf,

    /// Store configuration file (JSON)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "text", value_enum)]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Command,
}

/// Principal selection shared by access and query commands.
#[derive(clap::Args, Debug, Default)]
pub struct PrincipalArgs {
    /// User id; omit for an anonymous request
    #[arg(short, long)]
    pub user: Option<String>,

    /// Group membership (repeatable)
    #[arg(short, long = "group")]
    pub groups: Vec<String>,
}

impl PrincipalArgs {
    fn principal(&self) -> Result<Option<Principal>> {
        match &self.user {
            Some(user) => Ok(Some(
                self.groups
                    .iter()
                    .fold(Principal::new(user.clone()), |p, g| p.with_group(g.clone())),
            )),
            None if self.groups.is_empty() => Ok(None),
            None => Err(CliError::Usage("--group requires --user".to_string())),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the object tree
    Tree,
    /// Print a principal's access and permission dicts
    Access {
        #[command(flatten)]
        principal: PrincipalArgs,
    },
    /// Read instances of a class as a principal
    Query {
        /// Class name
        class: String,

        /// Attribute filter, e.g. '{"status": {"EQUALS": "open"}}'
        #[arg(long, default_value = "*")]
        filter: String,

        #[command(flatten)]
        principal: PrincipalArgs,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("polari=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match run(&args) {
        Ok(output) => println!("{}", output),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

fn run(args: &Args) -> Result<String> {
    let config = match &args.config {
        Some(path) => fixture::read_json::<StoreConfig>(path)?,
        None => StoreConfig::default(),
    };
    let store = Fixture::from_path(&args.fixture)?.load(config)?;

    match &args.command {
        Command::Tree => {
            let tree = store.read(|tree| tree.to_json())?;
            Ok(output::render_tree(&tree, args.format))
        }
        Command::Access { principal } => {
            let principal = principal.principal()?;
            let (access, permission) = store.get_users_object_access_permissions(principal.as_ref());
            Ok(output::render_access(&access, &permission, args.format))
        }
        Command::Query {
            class,
            filter,
            principal,
        } => {
            let filter = parse_filter(filter)?;
            let principal = principal.principal()?;
            let result = store.read_instances(class, &filter, principal.as_ref())?;
            Ok(output::render_json(&result))
        }
    }
}

fn parse_filter(raw: &str) -> Result<AttributeFilter> {
    let json = match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(json) => json,
        Err(_) if raw.trim() == "*" => serde_json::Value::String("*".to_string()),
        Err(e) => return Err(CliError::Usage(format!("--filter is not JSON: {}", e))),
    };
    Ok(AttributeFilter::from_json("filter", &json)?)
}

//! CLI entry point for mecm-admin, a Configuration Manager Administration
//! Service client.
//!
//! Connects once per invocation, runs one subcommand and prints the result
//! as pretty JSON on stdout. Diagnostics go to stderr through `tracing`
//! (`-v` for info, `-vv` for debug, `RUST_LOG` overrides).
//!
//! Exit codes:
//! - 0: success
//! - 1: runtime error (connection, HTTP, not found, partial batch failure)
//! - 2: argument validation error (clap handles this automatically)

use std::process::ExitCode;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use mecm_admin::auth::{Credential, TokenProvider};
use mecm_admin::batch::BatchReport;
use mecm_admin::collections::{self, CollectionKind, CollectionUpdate, NewCollection};
use mecm_admin::devices;
use mecm_admin::error::{AdminError, Result};
use mecm_admin::resolver::EntityRef;
use mecm_admin::rules::{self, RuleKind};
use mecm_admin::scripts::{self, PollConfig, ScriptInvocation, ScriptTarget};
use mecm_admin::session::{ConnectOptions, Session};
use mecm_admin::variables::{self, NewVariable, VariableOwner, VariableUpdate};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// SMS Provider host, optionally with `:port`.
    #[arg(long, env = "MECM_SERVER", global = true)]
    server: Option<String>,

    /// User for Basic authentication (`DOMAIN\user`).
    #[arg(long, env = "MECM_USERNAME", global = true)]
    username: Option<String>,

    /// Password for Basic authentication. Prefer the MECM_PASSWORD
    /// environment variable to keep it out of shell history.
    #[arg(long, env = "MECM_PASSWORD", hide_env_values = true, global = true)]
    password: Option<String>,

    /// Entra ID tenant for client-credential authentication.
    #[arg(long, env = "MECM_TENANT_ID", global = true)]
    tenant_id: Option<String>,

    /// Entra ID application (client) ID.
    #[arg(long, env = "MECM_CLIENT_ID", global = true)]
    client_id: Option<String>,

    /// Entra ID client secret.
    #[arg(long, env = "MECM_CLIENT_SECRET", hide_env_values = true, global = true)]
    client_secret: Option<String>,

    /// Token scope, e.g. `api://<server app id>/.default`.
    #[arg(long, env = "MECM_SCOPE", global = true)]
    scope: Option<String>,

    /// Accept any TLS certificate.
    #[arg(long, global = true)]
    skip_cert_check: bool,

    /// Increase log verbosity.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Collections.
    #[command(subcommand)]
    Collection(CollectionCmd),
    /// Devices.
    #[command(subcommand)]
    Device(DeviceCmd),
    /// Device and collection variables.
    #[command(subcommand)]
    Variable(VariableCmd),
    /// Collection membership rules.
    #[command(subcommand)]
    Rule(RuleCmd),
    /// Run Scripts.
    #[command(subcommand)]
    Script(ScriptCmd),
}

/// A collection by `--collection NAME` or `--collection-id ID`.
#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
struct CollectionArg {
    /// Collection name.
    #[arg(long)]
    collection: Option<String>,
    /// Collection ID, e.g. PS100012.
    #[arg(long)]
    collection_id: Option<String>,
}

impl CollectionArg {
    fn entity(&self) -> EntityRef {
        match (&self.collection, &self.collection_id) {
            (_, Some(id)) => EntityRef::key(id.as_str()),
            (Some(name), None) => EntityRef::name(name.as_str()),
            (None, None) => EntityRef::name(""),
        }
    }
}

/// A device by `--device NAME` or `--device-id ID`.
#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
struct DeviceArg {
    /// Device name.
    #[arg(long)]
    device: Option<String>,
    /// Device resource ID.
    #[arg(long)]
    device_id: Option<i64>,
}

impl DeviceArg {
    fn entity(&self) -> EntityRef {
        match (&self.device, self.device_id) {
            (_, Some(id)) => EntityRef::key(id),
            (Some(name), None) => EntityRef::name(name.as_str()),
            (None, None) => EntityRef::name(""),
        }
    }
}

/// Owner of a variable list: exactly one of the four flags.
#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
struct OwnerArg {
    /// Collection name.
    #[arg(long)]
    collection: Option<String>,
    /// Collection ID.
    #[arg(long)]
    collection_id: Option<String>,
    /// Device name.
    #[arg(long)]
    device: Option<String>,
    /// Device resource ID.
    #[arg(long)]
    device_id: Option<i64>,
}

impl OwnerArg {
    fn owner(&self) -> Result<VariableOwner> {
        match (
            &self.collection,
            &self.collection_id,
            &self.device,
            self.device_id,
        ) {
            (Some(n), None, None, None) => Ok(VariableOwner::Collection(EntityRef::name(n.as_str()))),
            (None, Some(id), None, None) => Ok(VariableOwner::Collection(EntityRef::key(id.as_str()))),
            (None, None, Some(n), None) => Ok(VariableOwner::Device(EntityRef::name(n.as_str()))),
            (None, None, None, Some(id)) => Ok(VariableOwner::Device(EntityRef::key(id))),
            _ => Err(AdminError::Validation(
                "exactly one of --collection, --collection-id, --device, --device-id is required".into(),
            )),
        }
    }
}

#[derive(Subcommand)]
enum CollectionCmd {
    /// List collections, optionally by name pattern.
    List {
        /// Name or wildcard pattern.
        #[arg(long)]
        name: Option<String>,
    },
    /// Show one collection.
    Get(CollectionArg),
    /// Create a collection.
    New {
        /// Display name.
        #[arg(long)]
        name: String,
        /// Limiting collection name.
        #[arg(long)]
        limit: String,
        /// Create a user collection instead of a device collection.
        #[arg(long)]
        user: bool,
        /// Comment.
        #[arg(long)]
        comment: Option<String>,
    },
    /// Rename or re-comment a collection.
    Set {
        #[command(flatten)]
        target: CollectionArg,
        /// New display name.
        #[arg(long)]
        new_name: Option<String>,
        /// New comment.
        #[arg(long)]
        comment: Option<String>,
    },
    /// Remove every collection matching a name pattern.
    Remove {
        /// Name or wildcard pattern.
        pattern: String,
    },
    /// Request a membership re-evaluation.
    Refresh(CollectionArg),
    /// List members.
    Members(CollectionArg),
}

#[derive(Subcommand)]
enum DeviceCmd {
    /// List devices, optionally by name pattern.
    List {
        /// Name or wildcard pattern.
        #[arg(long)]
        name: Option<String>,
    },
    /// Show one device.
    Get(DeviceArg),
}

#[derive(Subcommand)]
enum VariableCmd {
    /// List variables.
    List {
        #[command(flatten)]
        owner: OwnerArg,
        /// Name or wildcard pattern.
        #[arg(long)]
        name: Option<String>,
    },
    /// Add a variable.
    New {
        #[command(flatten)]
        owner: OwnerArg,
        /// Variable name.
        #[arg(long)]
        name: String,
        /// Variable value.
        #[arg(long, allow_hyphen_values = true)]
        value: String,
        /// Hide the value in the console.
        #[arg(long)]
        masked: bool,
    },
    /// Change a variable.
    Set {
        #[command(flatten)]
        owner: OwnerArg,
        /// Variable name.
        #[arg(long)]
        name: String,
        /// New value.
        #[arg(long, allow_hyphen_values = true)]
        value: Option<String>,
        /// New mask state.
        #[arg(long)]
        masked: Option<bool>,
    },
    /// Remove variables by name or wildcard pattern.
    Remove {
        #[command(flatten)]
        owner: OwnerArg,
        /// Name or wildcard pattern.
        #[arg(long)]
        name: String,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum KindArg {
    Direct,
    Query,
    Include,
    Exclude,
}

impl From<KindArg> for RuleKind {
    fn from(k: KindArg) -> Self {
        match k {
            KindArg::Direct => RuleKind::Direct,
            KindArg::Query => RuleKind::Query,
            KindArg::Include => RuleKind::Include,
            KindArg::Exclude => RuleKind::Exclude,
        }
    }
}

#[derive(Subcommand)]
enum RuleCmd {
    /// List rules of a collection.
    List {
        #[command(flatten)]
        target: CollectionArg,
        /// Only rules of this kind.
        #[arg(long, value_enum)]
        kind: Option<KindArg>,
        /// Rule name or wildcard pattern.
        #[arg(long)]
        name: Option<String>,
    },
    /// Add a device by direct rule.
    AddDirect {
        #[command(flatten)]
        target: CollectionArg,
        #[command(flatten)]
        device: DeviceArg,
    },
    /// Add a WQL query rule.
    AddQuery {
        #[command(flatten)]
        target: CollectionArg,
        /// Rule name.
        #[arg(long)]
        name: String,
        /// WQL statement.
        #[arg(long)]
        query: String,
    },
    /// Include another collection's members.
    AddInclude {
        #[command(flatten)]
        target: CollectionArg,
        /// Name of the collection to include.
        #[arg(long)]
        source: String,
    },
    /// Exclude another collection's members.
    AddExclude {
        #[command(flatten)]
        target: CollectionArg,
        /// Name of the collection to exclude.
        #[arg(long)]
        source: String,
    },
    /// Remove rules by kind and name pattern.
    Remove {
        #[command(flatten)]
        target: CollectionArg,
        /// Only rules of this kind.
        #[arg(long, value_enum)]
        kind: Option<KindArg>,
        /// Rule name or wildcard pattern.
        #[arg(long)]
        name: String,
    },
}

#[derive(Subcommand)]
enum ScriptCmd {
    /// List scripts.
    List,
    /// Run a script against a collection or devices.
    Run {
        /// Script name.
        #[arg(long)]
        script: String,
        /// Target collection name.
        #[arg(long, conflicts_with = "device", required_unless_present = "device")]
        collection: Option<String>,
        /// Target device name; repeat for several devices.
        #[arg(long)]
        device: Vec<String>,
        /// Script parameter as NAME=VALUE; repeatable.
        #[arg(long = "param", value_parser = parse_param, allow_hyphen_values = true)]
        params: Vec<(String, String)>,
        /// Poll until every device reports.
        #[arg(long)]
        wait: bool,
        /// Seconds between polls with --wait.
        #[arg(long, default_value_t = 10)]
        interval: u64,
        /// Give up polling after this many seconds.
        #[arg(long, default_value_t = 600)]
        timeout: u64,
    },
    /// Show the status of a script run.
    Status {
        /// Client operation ID.
        operation_id: u64,
        /// Include per-device output.
        #[arg(long)]
        results: bool,
    },
}

fn parse_param(raw: &str) -> std::result::Result<(String, String), String> {
    match raw.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected NAME=VALUE, got '{raw}'")),
    }
}

fn init_tracing(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn credential(cli: &Cli, server: &str) -> Result<Credential> {
    match (&cli.tenant_id, &cli.client_id, &cli.client_secret) {
        (Some(tenant), Some(client_id), Some(secret)) => {
            let scope = cli.scope.clone().ok_or_else(|| {
                AdminError::Validation("--scope is required with Entra ID credentials".into())
            })?;
            tracing::debug!(server, %tenant, "using Entra ID client credentials");
            Ok(Credential::AzureAd(TokenProvider::new(
                tenant, client_id, secret, &scope,
            )))
        }
        (None, None, None) => match (&cli.username, &cli.password) {
            (Some(user), Some(password)) => Ok(Credential::basic(user.as_str(), password.as_str())),
            (None, None) => Ok(Credential::Default),
            _ => Err(AdminError::Validation(
                "--username and --password must be given together".into(),
            )),
        },
        _ => Err(AdminError::Validation(
            "--tenant-id, --client-id and --client-secret must be given together".into(),
        )),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Prints what succeeded, reports failures on stderr and fails the run if
/// any item failed.
fn print_batch<T: Serialize>(report: BatchReport<T>) -> Result<()> {
    print_json(&report.succeeded)?;
    for failure in &report.failed {
        eprintln!("failed: {}: {}", failure.item, failure.error);
    }
    if report.is_complete_success() {
        Ok(())
    } else {
        Err(AdminError::Validation(format!(
            "{} of {} items failed",
            report.failed.len(),
            report.len()
        )))
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let server = cli
        .server
        .clone()
        .ok_or_else(|| AdminError::Validation("--server (or MECM_SERVER) is required".into()))?;
    let options = ConnectOptions::new(server.as_str())
        .credential(credential(&cli, &server)?)
        .skip_certificate_validation(cli.skip_cert_check);
    let client = Session::global().connect(options).await?;
    let client = client.as_ref();

    match cli.command {
        Command::Collection(cmd) => match cmd {
            CollectionCmd::List { name } => {
                let found = match name {
                    Some(pattern) => collections::find_collections(client, &pattern).await?,
                    None => collections::list_collections(client, None).await?,
                };
                print_json(&found)
            }
            CollectionCmd::Get(target) => {
                print_json(&collections::get_collection(client, &target.entity()).await?)
            }
            CollectionCmd::New {
                name,
                limit,
                user,
                comment,
            } => {
                let request = NewCollection {
                    name,
                    limiting_collection: EntityRef::name(limit),
                    kind: if user {
                        CollectionKind::User
                    } else {
                        CollectionKind::Device
                    },
                    comment,
                    refresh_type: None,
                };
                print_json(&collections::new_collection(client, &request, true).await?)
            }
            CollectionCmd::Set {
                target,
                new_name,
                comment,
            } => {
                let update = CollectionUpdate {
                    name: new_name,
                    comment,
                    refresh_type: None,
                };
                let updated =
                    collections::set_collection(client, &target.entity(), &update, true).await?;
                print_json(&updated)
            }
            CollectionCmd::Remove { pattern } => {
                print_batch(collections::remove_collections(client, &pattern).await?)
            }
            CollectionCmd::Refresh(target) => {
                collections::invoke_collection_update(client, &target.entity()).await
            }
            CollectionCmd::Members(target) => {
                print_json(&collections::get_collection_members(client, &target.entity()).await?)
            }
        },

        Command::Device(cmd) => match cmd {
            DeviceCmd::List { name } => {
                let found = match name {
                    Some(pattern) => devices::find_devices(client, &pattern).await?,
                    None => devices::list_devices(client, None).await?,
                };
                print_json(&found)
            }
            DeviceCmd::Get(target) => print_json(&devices::get_device(client, &target.entity()).await?),
        },

        Command::Variable(cmd) => match cmd {
            VariableCmd::List { owner, name } => {
                let found = variables::get_variables(client, &owner.owner()?, name.as_deref()).await?;
                print_json(&found)
            }
            VariableCmd::New {
                owner,
                name,
                value,
                masked,
            } => {
                let variable = NewVariable {
                    name,
                    value,
                    is_masked: masked,
                };
                let created = variables::new_variable(client, &owner.owner()?, &variable, true).await?;
                print_json(&created)
            }
            VariableCmd::Set {
                owner,
                name,
                value,
                masked,
            } => {
                let update = VariableUpdate {
                    value,
                    is_masked: masked,
                };
                let updated =
                    variables::set_variable(client, &owner.owner()?, &name, &update, true).await?;
                print_json(&updated)
            }
            VariableCmd::Remove { owner, name } => {
                print_json(&variables::remove_variables(client, &owner.owner()?, &name).await?)
            }
        },

        Command::Rule(cmd) => match cmd {
            RuleCmd::List { target, kind, name } => {
                let found = rules::get_membership_rules(
                    client,
                    &target.entity(),
                    kind.map(RuleKind::from),
                    name.as_deref(),
                )
                .await?;
                print_json(&found)
            }
            RuleCmd::AddDirect { target, device } => {
                rules::add_direct_rule(client, &target.entity(), &device.entity()).await
            }
            RuleCmd::AddQuery {
                target,
                name,
                query,
            } => rules::add_query_rule(client, &target.entity(), &name, &query).await,
            RuleCmd::AddInclude { target, source } => {
                rules::add_include_rule(client, &target.entity(), &EntityRef::name(source)).await
            }
            RuleCmd::AddExclude { target, source } => {
                rules::add_exclude_rule(client, &target.entity(), &EntityRef::name(source)).await
            }
            RuleCmd::Remove { target, kind, name } => print_batch(
                rules::remove_membership_rules(
                    client,
                    &target.entity(),
                    kind.map(RuleKind::from),
                    &name,
                )
                .await?,
            ),
        },

        Command::Script(cmd) => match cmd {
            ScriptCmd::List => print_json(&scripts::list_scripts(client, None).await?),
            ScriptCmd::Run {
                script,
                collection,
                device,
                params,
                wait,
                interval,
                timeout,
            } => {
                let target = match collection {
                    Some(name) => ScriptTarget::Collection(EntityRef::name(name)),
                    None => ScriptTarget::Devices(device.into_iter().map(EntityRef::name).collect()),
                };
                let invocation = ScriptInvocation {
                    script: EntityRef::name(script),
                    target,
                    parameters: params,
                };
                let operation = scripts::invoke_script(client, &invocation).await?;
                print_json(&operation)?;
                if wait {
                    let config =
                        PollConfig::new(Duration::from_secs(interval), Duration::from_secs(timeout));
                    let status =
                        scripts::poll_script_execution(client, operation.operation_id, &config)
                            .await?;
                    print_json(&status)?;
                    print_json(
                        &scripts::get_script_execution_results(client, operation.operation_id)
                            .await?,
                    )?;
                }
                Ok(())
            }
            ScriptCmd::Status {
                operation_id,
                results,
            } => {
                print_json(&scripts::get_script_execution_status(client, operation_id).await?)?;
                if results {
                    print_json(&scripts::get_script_execution_results(client, operation_id).await?)?;
                }
                Ok(())
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Vec<&'static str> {
        vec!["mecm-admin", "--server", "cm01.contoso.com"]
    }

    #[test]
    fn missing_subcommand_is_rejected() {
        let result = Cli::try_parse_from(base_args());
        assert!(result.is_err(), "a subcommand is required");
    }

    #[test]
    fn collection_get_by_name() {
        let mut args = base_args();
        args.extend_from_slice(&["collection", "get", "--collection", "Test Collection"]);
        let cli = Cli::try_parse_from(args).expect("should parse collection get");
        let Command::Collection(CollectionCmd::Get(target)) = cli.command else {
            panic!("wrong subcommand");
        };
        assert_eq!(target.entity(), EntityRef::name("Test Collection"));
    }

    #[test]
    fn collection_name_and_id_conflict() {
        let mut args = base_args();
        args.extend_from_slice(&[
            "collection",
            "get",
            "--collection",
            "Test",
            "--collection-id",
            "PS100012",
        ]);
        assert!(Cli::try_parse_from(args).is_err());
    }

    #[test]
    fn collection_id_becomes_key() {
        let mut args = base_args();
        args.extend_from_slice(&["collection", "refresh", "--collection-id", "PS100012"]);
        let cli = Cli::try_parse_from(args).unwrap();
        let Command::Collection(CollectionCmd::Refresh(target)) = cli.command else {
            panic!("wrong subcommand");
        };
        assert_eq!(target.entity(), EntityRef::key("PS100012"));
    }

    #[test]
    fn variable_new_for_device_id() {
        let mut args = base_args();
        args.extend_from_slice(&[
            "variable",
            "new",
            "--device-id",
            "16777220",
            "--name",
            "OSDRole",
            "--value",
            "-kiosk",
            "--masked",
        ]);
        let cli = Cli::try_parse_from(args).expect("should parse variable new");
        let Command::Variable(VariableCmd::New {
            owner,
            name,
            value,
            masked,
        }) = cli.command
        else {
            panic!("wrong subcommand");
        };
        assert_eq!(
            owner.owner().unwrap(),
            VariableOwner::Device(EntityRef::key(16777220_i64))
        );
        assert_eq!(name, "OSDRole");
        assert_eq!(value, "-kiosk", "hyphen-leading values are accepted");
        assert!(masked);
    }

    #[test]
    fn variable_owner_is_required() {
        let mut args = base_args();
        args.extend_from_slice(&["variable", "list"]);
        assert!(Cli::try_parse_from(args).is_err());
    }

    #[test]
    fn rule_remove_with_kind() {
        let mut args = base_args();
        args.extend_from_slice(&[
            "rule",
            "remove",
            "--collection",
            "Test Collection",
            "--kind",
            "direct",
            "--name",
            "PC-*",
        ]);
        let cli = Cli::try_parse_from(args).unwrap();
        let Command::Rule(RuleCmd::Remove { kind, name, .. }) = cli.command else {
            panic!("wrong subcommand");
        };
        assert_eq!(kind.map(RuleKind::from), Some(RuleKind::Direct));
        assert_eq!(name, "PC-*");
    }

    #[test]
    fn script_run_collects_params() {
        let mut args = base_args();
        args.extend_from_slice(&[
            "script",
            "run",
            "--script",
            "Get-Uptime",
            "--device",
            "PC-001",
            "--device",
            "PC-002",
            "--param",
            "Days=3",
            "--param",
            "Mode=-fast",
        ]);
        let cli = Cli::try_parse_from(args).unwrap();
        let Command::Script(ScriptCmd::Run { device, params, wait, .. }) = cli.command else {
            panic!("wrong subcommand");
        };
        assert_eq!(device, vec!["PC-001", "PC-002"]);
        assert_eq!(
            params,
            vec![
                ("Days".to_string(), "3".to_string()),
                ("Mode".to_string(), "-fast".to_string()),
            ]
        );
        assert!(!wait);
    }

    #[test]
    fn script_run_needs_a_target() {
        let mut args = base_args();
        args.extend_from_slice(&["script", "run", "--script", "Get-Uptime"]);
        assert!(Cli::try_parse_from(args).is_err());
    }

    #[test]
    fn malformed_param_is_rejected() {
        assert!(parse_param("novalue").is_err());
        assert!(parse_param("=x").is_err());
        assert_eq!(parse_param("A=b=c").unwrap(), ("A".into(), "b=c".into()));
    }

    #[test]
    fn partial_basic_credential_is_rejected() {
        let mut args = base_args();
        args.extend_from_slice(&["--username", "CONTOSO\\cm", "device", "list"]);
        let cli = Cli::try_parse_from(args).unwrap();
        if cli.password.is_none() {
            let err = credential(&cli, "cm01.contoso.com").unwrap_err();
            assert!(matches!(err, AdminError::Validation(_)));
        }
    }
}

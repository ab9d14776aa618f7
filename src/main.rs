//! Azure identity controller - inspect and reconcile scale-set identities

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tracing::info;

use azure_identity_controller::azure::cloud_config::DEFAULT_CLOUD_CONFIG_PATH;
use azure_identity_controller::azure::{
    ArmScaleSetApi, AzureCloudConfig, ScaleSetClient, StaticToken, VmssClient,
};
use azure_identity_controller::telemetry::{init_telemetry, TelemetryConfig};
use azure_identity_controller::{reconcile_scale_set_identities, IdentityHolder};

/// Azure identity controller - manage user-assigned identities on scale sets
#[derive(Parser, Debug)]
#[command(name = "azure-identity-controller", version, about, long_about = None)]
struct Cli {
    /// Path to the Azure cloud config file
    #[arg(long, global = true, default_value = DEFAULT_CLOUD_CONFIG_PATH)]
    cloudconfig: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Log format (fmt or json)
    #[arg(long, global = true, env = "LOG_FORMAT", default_value = "fmt")]
    log_format: String,

    /// Bearer token for Azure Resource Manager
    #[arg(long, global = true, env = "AZURE_ACCESS_TOKEN", hide_env_values = true)]
    access_token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the user-assigned identities attached to a scale set
    Show(ScaleSetArgs),

    /// Attach and detach user-assigned identities on a scale set
    ///
    /// Only sends a patch when the scale set is not already in the
    /// requested state. An ID given to both --add and --remove is removed.
    Assign(AssignArgs),
}

/// Scale set selection
#[derive(Args, Debug)]
struct ScaleSetArgs {
    /// Resource group of the scale set
    #[arg(short = 'g', long)]
    resource_group: String,

    /// Scale set name
    #[arg(short = 'n', long)]
    name: String,
}

/// Assign mode arguments
#[derive(Args, Debug)]
struct AssignArgs {
    #[command(flatten)]
    scale_set: ScaleSetArgs,

    /// Identity resource ID to attach (repeatable)
    #[arg(long = "add", value_name = "ID")]
    add: Vec<String>,

    /// Identity resource ID to detach (repeatable)
    #[arg(long = "remove", value_name = "ID")]
    remove: Vec<String>,
}

impl AssignArgs {
    fn desired(&self) -> BTreeMap<String, bool> {
        let mut desired = BTreeMap::new();
        for id in &self.add {
            desired.insert(id.clone(), true);
        }
        for id in &self.remove {
            desired.insert(id.clone(), false);
        }
        desired
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_telemetry(TelemetryConfig {
        log_level: cli.log_level.clone(),
        log_format: cli.log_format.clone(),
        ..Default::default()
    })?;

    let client = build_client(&cli)?;

    match cli.command {
        Commands::Show(args) => run_show(&client, args).await,
        Commands::Assign(args) => run_assign(&client, args).await,
    }
}

/// Build the scale-set client from the cloud config and access token
fn build_client(cli: &Cli) -> anyhow::Result<VmssClient<ArmScaleSetApi>> {
    let config = AzureCloudConfig::from_file(&cli.cloudconfig)?;
    let endpoint = config.resource_manager_endpoint()?;
    let subscription_id = config.subscription_id()?;

    let token = cli
        .access_token
        .as_deref()
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| anyhow::anyhow!("--access-token or AZURE_ACCESS_TOKEN is required"))?;

    info!(
        cloudconfig = %cli.cloudconfig.display(),
        endpoint = %endpoint,
        subscription_id,
        "Loaded cloud config"
    );

    let api = ArmScaleSetApi::new(
        endpoint,
        subscription_id,
        Arc::new(StaticToken::new(token)),
    )?;
    Ok(VmssClient::new(api))
}

/// Print the attached identities, one per line
async fn run_show<C: ScaleSetClient>(client: &C, args: ScaleSetArgs) -> anyhow::Result<()> {
    let mut vmss = client.get(&args.resource_group, &args.name).await?;

    let ids = vmss
        .identity_info()
        .map(|info| info.user_identity_list())
        .unwrap_or_default();

    for id in ids {
        println!("{id}");
    }
    Ok(())
}

/// Reconcile the requested identities onto the scale set
async fn run_assign<C: ScaleSetClient>(client: &C, args: AssignArgs) -> anyhow::Result<()> {
    let desired = args.desired();
    if desired.is_empty() {
        anyhow::bail!("nothing to do: pass at least one --add or --remove");
    }

    let outcome = reconcile_scale_set_identities(
        client,
        &args.scale_set.resource_group,
        &args.scale_set.name,
        &desired,
    )
    .await?;

    if outcome.patched {
        println!(
            "Updated {}/{}",
            args.scale_set.resource_group, args.scale_set.name
        );
    } else {
        println!(
            "{}/{} already up to date",
            args.scale_set.resource_group, args.scale_set.name
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn assign_removal_wins_over_addition() {
        let cli = Cli::parse_from([
            "azure-identity-controller",
            "assign",
            "-g",
            "rg",
            "-n",
            "pool",
            "--add",
            "/sub/id-a",
            "--add",
            "/sub/id-b",
            "--remove",
            "/sub/id-b",
        ]);
        let Commands::Assign(args) = cli.command else {
            panic!("Expected assign");
        };
        let desired = args.desired();
        assert_eq!(desired.get("/sub/id-a"), Some(&true));
        assert_eq!(desired.get("/sub/id-b"), Some(&false));
    }

    #[test]
    fn global_flags_parse_after_subcommand() {
        let cli = Cli::parse_from([
            "azure-identity-controller",
            "show",
            "-g",
            "rg",
            "-n",
            "pool",
            "--cloudconfig",
            "/tmp/azure.json",
            "--log-format",
            "json",
        ]);
        assert_eq!(cli.cloudconfig, PathBuf::from("/tmp/azure.json"));
        assert_eq!(cli.log_format, "json");
        assert!(matches!(cli.command, Commands::Show(_)));
    }
}

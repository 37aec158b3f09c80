use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};
use crds::names;
use pki::{ADMIN_COMMON_NAME, DEFAULT_KUBECONFIG_EXPIRY_DAYS, SYSTEM_PRIVILEGED_GROUP};

#[derive(Parser, Debug)]
#[command(name = "k3kcli")]
#[command(about = "Manage k3k virtual clusters")]
#[command(version)]
pub struct Args {
    /// Host cluster kubeconfig; in-cluster or default config when unset
    #[arg(long, global = true, value_name = "FILE")]
    pub kubeconfig: Option<PathBuf>,

    /// Namespace of the cluster, k3k-<name> when unset
    #[arg(short, long, global = true)]
    pub namespace: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Cluster management
    #[command(subcommand)]
    Cluster(ClusterCommand),

    /// Kubeconfig management
    #[command(subcommand)]
    Kubeconfig(KubeconfigCommand),
}

#[derive(Subcommand, Debug)]
pub enum ClusterCommand {
    /// Delete a cluster and its host objects
    Delete {
        name: String,

        /// Keep the server volumes
        #[arg(long)]
        keep_data: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum KubeconfigCommand {
    /// Write an admin kubeconfig for a cluster
    Generate(GenerateArgs),
}

#[derive(ClapArgs, Debug)]
pub struct GenerateArgs {
    /// Cluster name
    #[arg(long)]
    pub name: String,

    /// Output file, <namespace>-<name>-kubeconfig.yaml when unset
    #[arg(long)]
    pub config_name: Option<String>,

    /// Certificate common name
    #[arg(long, default_value = ADMIN_COMMON_NAME)]
    pub cn: String,

    /// Certificate organizations
    #[arg(long = "org", default_values_t = [SYSTEM_PRIVILEGED_GROUP.to_string()])]
    pub orgs: Vec<String>,

    /// Extra certificate SANs
    #[arg(long = "altNames", value_delimiter = ',')]
    pub alt_names: Vec<String>,

    /// Certificate lifetime in days
    #[arg(long, default_value_t = DEFAULT_KUBECONFIG_EXPIRY_DAYS)]
    pub expiration_days: u64,

    /// Server host written to the kubeconfig and added to the SANs
    #[arg(long)]
    pub kubeconfig_server: Option<String>,
}

impl Args {
    /// Namespace of cluster `name`
    #[must_use]
    pub fn namespace_for(&self, name: &str) -> String {
        self.namespace
            .clone()
            .filter(|ns| !ns.is_empty())
            .unwrap_or_else(|| names::default_namespace(name))
    }
}

impl GenerateArgs {
    #[must_use]
    pub fn output_file(&self, namespace: &str) -> PathBuf {
        match &self.config_name {
            Some(name) => PathBuf::from(name),
            None => PathBuf::from(format!("{namespace}-{}-kubeconfig.yaml", self.name)),
        }
    }
}

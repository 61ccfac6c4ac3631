use anyhow::Context;
use clap::Parser;

use obmc_mapper::config::MapperConfig;
use obmc_mapper::server;

/// D-Bus object path mapper daemon.
#[derive(Debug, Parser)]
#[clap(name = "obmc-mapper")]
struct Args {
    /// Path namespaces to keep track of.
    #[clap(
        long = "path-namespaces",
        multiple_values = true,
        default_values = &["/org/openbmc", "/xyz/openbmc_project"]
    )]
    path_namespaces: Vec<String>,

    /// Interface namespaces to keep track of.
    #[clap(
        long = "interface-namespaces",
        multiple_values = true,
        default_values = &["org.openbmc", "xyz.openbmc_project"]
    )]
    interface_namespaces: Vec<String>,

    /// Path namespaces to ignore.
    #[clap(long = "path-blacklist", multiple_values = true)]
    path_blacklist: Vec<String>,

    /// Interface namespaces to ignore.
    #[clap(long = "interface-blacklist", multiple_values = true)]
    interface_blacklist: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();
    let config = MapperConfig::new(
        args.path_namespaces,
        args.interface_namespaces,
        args.path_blacklist,
        args.interface_blacklist,
    );
    server::run(config).await.context("object mapper failed")
}

use clap::{Parser, Subcommand};

/// tfinfra - Terraform-backed Infrastructure operator
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub mode: Mode,
}

#[derive(Subcommand, Debug)]
pub enum Mode {
    /// Run the Infrastructure controller
    Run {
        /// Only watch this namespace (overrides WATCH_NAMESPACE)
        #[arg(short, long)]
        namespace: Option<String>,

        /// Port of the health endpoints (overrides HEALTH_PORT)
        #[arg(long)]
        health_port: Option<u16>,
    },

    /// Print the Infrastructure CRD as YAML
    Crd,
}

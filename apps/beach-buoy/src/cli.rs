use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::config::Config;
use crate::credentials::RelayCredentialIssuer;

#[derive(Parser, Debug)]
#[command(name = "beach-buoy")]
#[command(about = "Beach Buoy WebRTC signaling server")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Address to bind (overrides BEACH_BUOY_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on (overrides BEACH_BUOY_PORT)
    #[arg(short, long)]
    pub port: Option<u16>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Mint a TURN credential and print the ICE configuration a browser would get
    Credential {
        /// Session id the credential is bound to
        #[arg(short, long)]
        session: String,
    },
}

impl Cli {
    pub fn apply(&self, config: &mut Config) {
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
    }
}

pub fn print_credential(config: &Config, session: &str) -> Result<()> {
    let issuer = RelayCredentialIssuer::new(config.issuer_config());
    let credential = issuer
        .issue(session)
        .context("failed to issue relay credential")?;
    let ice = issuer.ice_configuration(session, &credential);
    let rendered = serde_json::to_string_pretty(&ice).context("failed to render configuration")?;
    println!("{rendered}");
    Ok(())
}

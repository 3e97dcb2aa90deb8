use std::path::PathBuf;

use cata::{Command, Container};
use clap::Parser;
use eyre::{Result, WrapErr};

use crate::keys;

/// Mint an RSA key usable as the gateway host key or the magic key.
#[derive(Parser, Container)]
pub struct Keygen {
    /// Where to write the key
    #[arg(default_value = "gatehouse_key")]
    path: PathBuf,
}

#[async_trait::async_trait]
impl Command for Keygen {
    async fn run(&self) -> Result<()> {
        let key = keys::generate()?;

        let file = std::fs::File::create(&self.path)
            .wrap_err_with(|| format!("failed to create {}", self.path.display()))?;
        russh_keys::encode_pkcs8_pem(&key, file)?;

        println!("wrote {}", self.path.display());

        Ok(())
    }
}

//! The `auth` command family.

use magg_core::Settings;
use magg_server::BearerAuth;

use crate::commands::AuthCommand;

pub fn execute(settings: &Settings, command: &AuthCommand) -> anyhow::Result<()> {
    let mut auth = BearerAuth::new(settings.key_dir(), settings.private_key.clone());

    match command {
        AuthCommand::Init => {
            auth.init_keys().map_err(|e| anyhow::anyhow!(e))?;
            println!("Generated RSA keypair in {}", settings.key_dir().display());
        }
        AuthCommand::Token {
            subject,
            hours,
            scope,
        } => {
            let scopes = if scope.is_empty() {
                None
            } else {
                Some(scope.as_slice())
            };
            let token = auth
                .create_token(subject, *hours, scopes)
                .map_err(|e| anyhow::anyhow!(e))?;
            println!("{token}");
        }
        AuthCommand::Status => {
            if auth.enabled() {
                println!("Authentication: enabled");
                println!("Issuer:   {}", auth.issuer());
                println!("Audience: {}", auth.audience());
            } else {
                println!("Authentication: disabled (no private key)");
            }
        }
        AuthCommand::PublicKey => {
            print!("{}", auth.public_key_pem().map_err(|e| anyhow::anyhow!(e))?);
        }
        AuthCommand::PrivateKey => {
            print!("{}", auth.private_key_pem().map_err(|e| anyhow::anyhow!(e))?);
        }
    }

    Ok(())
}

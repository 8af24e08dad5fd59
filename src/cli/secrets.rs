use clap::{Args, Subcommand};

use super::CliContext;
use sheet_dispatch::secret::credential_keys;

#[derive(Args, Debug)]
pub struct SecretArgs {
    #[command(subcommand)]
    pub command: SecretCommands,
}

#[derive(Subcommand, Debug)]
pub enum SecretCommands {
    /// Store the admin user and password used by dispatcher `id`
    Set {
        id: String,
        user: String,
        password: String,
    },
    /// Forget the credentials of dispatcher `id`
    Delete { id: String },
}

pub async fn execute(args: SecretArgs, context: &CliContext) -> anyhow::Result<()> {
    let secrets = &context.secrets_manager;
    match args.command {
        SecretCommands::Set { id, user, password } => {
            let (user_key, password_key) = credential_keys(&id);
            let stored = async {
                secrets.add_secret(&user_key, &user).await?;
                secrets.add_secret(&password_key, &password).await
            }
            .await;
            match stored {
                Ok(()) => println!("✅ Credentials stored for `{id}`."),
                Err(e) => eprintln!("❌ Credentials could not be stored: {e}"),
            }
        }
        SecretCommands::Delete { id } => {
            let (user_key, password_key) = credential_keys(&id);
            let user = secrets.delete_secret(&user_key).await;
            let password = secrets.delete_secret(&password_key).await;
            match user.and(password) {
                Ok(()) => println!("✅ Credentials deleted for `{id}`."),
                Err(e) => eprintln!("❌ Credentials could not be deleted: {e}"),
            }
        }
    }
    Ok(())
}

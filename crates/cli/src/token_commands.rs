use {
    anyhow::{Result, bail},
    clap::Subcommand,
    switchboard_config::{AuthMode, SwitchboardConfig},
    switchboard_gateway::auth::select_strategy,
};

#[derive(Subcommand)]
pub enum TokenAction {
    /// Issue a token for an instance with the configured signing secret.
    Issue {
        /// Instance name the token is bound to.
        instance: String,
    },
    /// Check whether a token grants access to an instance.
    Verify { instance: String, token: String },
}

pub fn handle_token(action: TokenAction, config: &SwitchboardConfig) -> Result<()> {
    if config.auth.mode != AuthMode::Token {
        bail!(
            "auth.mode is \"{}\"; instance tokens need auth.mode = \"token\"",
            config.auth.mode.as_str()
        );
    }
    let strategy = select_strategy(&config.auth)?;

    match action {
        TokenAction::Issue { instance } => {
            let Some(token) = strategy.issue(&instance) else {
                bail!("could not sign a token for {instance}");
            };
            println!("{token}");
        },
        TokenAction::Verify { instance, token } => {
            if strategy.validate(&token, &instance) {
                println!("valid for {instance}");
            } else {
                bail!("token is not valid for {instance}");
            }
        },
    }
    Ok(())
}

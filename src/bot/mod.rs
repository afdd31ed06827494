pub mod commands;
pub mod handler;

use crate::cooldown::ClaimCooldown;
use crate::error::AppError;
use crate::keeper::Keeper;
use poise::serenity_prelude::{self as serenity, FullEvent, GatewayIntents};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Shared data accessible in all commands
#[derive(Debug)]
pub struct Data {
    pub keeper: Arc<Keeper>,
    pub cooldown: Arc<ClaimCooldown>,
    /// Extra attempts at granting the role after a transient failure
    pub role_grant_retries: u32,
}

type Error = Box<dyn std::error::Error + Send + Sync>;

/// Event handler for Discord events
async fn event_handler(
    ctx: &serenity::Context,
    event: &FullEvent,
    _framework: poise::FrameworkContext<'_, Data, Error>,
    data: &Data,
) -> Result<(), Error> {
    match event {
        FullEvent::Ready { data_about_bot } => {
            info!(
                "Bot is ready! Logged in as {} in {} guilds",
                data_about_bot.user.name,
                data_about_bot.guilds.len()
            );
        }
        FullEvent::GuildCreate { guild, is_new: _ } => {
            handler::handle_guild_create(ctx, guild, data).await;
        }
        FullEvent::InteractionCreate { interaction } => {
            if let Some(command) = interaction.as_command() {
                handler::handle_claim_interaction(ctx, command, data).await;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Create and configure the Discord bot framework
pub fn create_framework(
    keeper: Arc<Keeper>,
    cooldown: Arc<ClaimCooldown>,
    role_grant_retries: u32,
) -> poise::Framework<Data, Error> {
    poise::Framework::builder()
        .options(poise::FrameworkOptions {
            commands: commands::all_commands(),
            event_handler: |ctx, event, framework, data| {
                Box::pin(event_handler(ctx, event, framework, data))
            },
            on_error: |error| {
                Box::pin(async move {
                    match error {
                        poise::FrameworkError::Command { error, ctx, .. } => {
                            let message = match error.downcast_ref::<AppError>() {
                                Some(AppError::UnknownCommunity(_)) => "Run /setup first!".to_string(),
                                Some(e) if e.is_recoverable() => e.to_string(),
                                _ => {
                                    error!("Command /{} failed: {}", ctx.command().name, error);
                                    error.to_string()
                                }
                            };
                            let reply = poise::CreateReply::default()
                                .content(format!("❌ {}", message))
                                .ephemeral(true);
                            let _ = ctx.send(reply).await;
                        }
                        poise::FrameworkError::MissingUserPermissions { ctx, .. } => {
                            let reply = poise::CreateReply::default()
                                .content("❌ This command is for administrators only.")
                                .ephemeral(true);
                            let _ = ctx.send(reply).await;
                        }
                        // Per-guild claim commands are answered by the event handler
                        poise::FrameworkError::UnknownInteraction { interaction, .. } => {
                            debug!("Interaction /{} handled outside poise", interaction.data.name);
                        }
                        poise::FrameworkError::Setup { error, .. } => {
                            error!("Setup error: {}", error);
                        }
                        err => {
                            error!("Framework error: {:?}", err);
                        }
                    }
                })
            },
            ..Default::default()
        })
        .setup(move |ctx, ready, framework| {
            Box::pin(async move {
                poise::builtins::register_globally(ctx, &framework.options().commands).await?;
                info!("Registered {} slash commands globally", framework.options().commands.len());

                for guild in &ready.guilds {
                    handler::register_configured_claim_command(ctx, &keeper, guild.id).await;
                }

                Ok(Data {
                    keeper,
                    cooldown,
                    role_grant_retries,
                })
            })
        })
        .build()
}

/// Connect to Discord and run until the gateway connection ends.
pub async fn start_bot(
    keeper: Arc<Keeper>,
    cooldown: Arc<ClaimCooldown>,
    role_grant_retries: u32,
    token: &str,
) -> Result<(), Error> {
    if token.is_empty() {
        return Err("Discord token is empty".into());
    }

    // Slash commands and role grants need no privileged intents
    let intents = GatewayIntents::GUILDS;

    let framework = create_framework(keeper, cooldown, role_grant_retries);

    let mut client = serenity::ClientBuilder::new(token, intents)
        .framework(framework)
        .await?;

    info!("Starting Discord bot...");
    client.start().await?;

    Ok(())
}

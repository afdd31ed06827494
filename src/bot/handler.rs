use crate::bot::Data;
use crate::error::{AppError, AppResult};
use crate::keeper::Keeper;
use crate::keys::ClaimantId;
use crate::redeem::{Redemption, Verdict};
use crate::registry::CommunityId;
use poise::serenity_prelude::{
    self as serenity, CommandInteraction, CommandOptionType, Context, CreateCommand,
    CreateCommandOption, EditInteractionResponse, GuildId, Mentionable, UserId,
};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Name of the string option carried by every claim command
pub const CLAIM_KEY_OPTION: &str = "key";

/// Builder for a guild's claim command
pub fn claim_command(name: &str) -> CreateCommand {
    CreateCommand::new(name)
        .description("✨ Claim your role with a mystical key")
        .add_option(
            CreateCommandOption::new(CommandOptionType::String, CLAIM_KEY_OPTION, "Your secret key")
                .required(true),
        )
}

/// Register (or overwrite) the claim command of one guild, dropping the
/// command registered under `previous` when the name changed.
pub async fn register_claim_command(
    ctx: &Context,
    guild_id: GuildId,
    name: &str,
    previous: Option<&str>,
) -> Result<(), serenity::Error> {
    if let Some(previous) = previous.filter(|p| *p != name) {
        let existing = guild_id.get_commands(&ctx.http).await?;
        for command in existing.iter().filter(|c| c.name == previous) {
            guild_id.delete_command(&ctx.http, command.id).await?;
            info!("Removed old claim command /{} in guild {}", previous, guild_id);
        }
    }

    guild_id.create_command(ctx, claim_command(name)).await?;
    info!("Registered claim command /{} in guild {}", name, guild_id);
    Ok(())
}

/// Register the claim command if the guild is configured. Failures are logged.
pub async fn register_configured_claim_command(ctx: &Context, keeper: &Keeper, guild_id: GuildId) {
    let Ok(settings) = keeper.settings(CommunityId(guild_id.get())).await else {
        return;
    };
    if let Err(e) = register_claim_command(ctx, guild_id, &settings.command, None).await {
        error!("Failed to register claim command in guild {}: {}", guild_id, e);
    }
}

/// Handle guild join (or guild becoming available after startup)
pub async fn handle_guild_create(ctx: &Context, guild: &serenity::Guild, data: &Data) {
    debug!("Guild available: {} ({})", guild.name, guild.id);
    register_configured_claim_command(ctx, &data.keeper, guild.id).await;
}

/// Answer a member's claim command. Other interactions are left to poise.
pub async fn handle_claim_interaction(ctx: &Context, command: &CommandInteraction, data: &Data) {
    let Some(guild_id) = command.guild_id else {
        return;
    };
    let community_id = CommunityId(guild_id.get());
    let Ok(settings) = data.keeper.settings(community_id).await else {
        return;
    };
    if command.data.name != settings.command {
        return;
    }

    if let Err(e) = process_claim(ctx, command, data, community_id).await {
        error!("Claim in guild {} failed: {}", guild_id, e);
    }
}

async fn process_claim(
    ctx: &Context,
    command: &CommandInteraction,
    data: &Data,
    community_id: CommunityId,
) -> AppResult<()> {
    command.defer_ephemeral(ctx).await?;

    let claimant = ClaimantId(command.user.id.get());
    let is_admin = command
        .member
        .as_ref()
        .and_then(|m| m.permissions)
        .is_some_and(|p| p.administrator());

    if !is_admin {
        if let Some(wait) = data.cooldown.check(community_id, claimant) {
            let content = format!("⏳ The gates are resting. Try again in {}.", format_wait(wait));
            command
                .edit_response(ctx, EditInteractionResponse::new().content(content))
                .await?;
            return Ok(());
        }
    }

    let key = command
        .data
        .options
        .iter()
        .find(|o| o.name == CLAIM_KEY_OPTION)
        .and_then(|o| o.value.as_str())
        .unwrap_or_default();

    let content = match data.keeper.redeem(community_id, claimant, key).await {
        Verdict::Rejected(reason) => format!("❌ {}", reason.message()),
        Verdict::Committed(redemption) => {
            match grant_role(ctx, command.user.id, &redemption, data.role_grant_retries).await {
                Ok(()) => success_message(command, &redemption),
                Err(e) => {
                    error!(
                        community = %community_id,
                        claimant = %claimant,
                        key = %redemption.record.fingerprint.short(),
                        "key redeemed but role grant failed: {}",
                        e
                    );
                    "⚠️ Your key was accepted, but the role could not be granted. \
                    Please contact a server administrator."
                        .to_string()
                }
            }
        }
    };

    command
        .edit_response(ctx, EditInteractionResponse::new().content(content))
        .await?;
    Ok(())
}

fn success_message(command: &CommandInteraction, redemption: &Redemption) -> String {
    let role = serenity::RoleId::new(redemption.role_id.0);
    redemption.render_message(
        &command.user.id.mention().to_string(),
        &role.mention().to_string(),
    )
}

/// Grant the redeemed role, retrying transient API failures
async fn grant_role(
    ctx: &Context,
    user_id: UserId,
    redemption: &Redemption,
    max_retries: u32,
) -> AppResult<()> {
    let guild_id = GuildId::new(redemption.community_id.0);
    let role_id = serenity::RoleId::new(redemption.role_id.0);
    let mut last_error = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = retry_delay(attempt);
            warn!(
                "Retrying role grant (attempt {}/{}), waiting {:?}",
                attempt, max_retries, delay
            );
            tokio::time::sleep(delay).await;
        }

        match ctx
            .http
            .add_member_role(guild_id, user_id, role_id, Some("Redeemed a key"))
            .await
        {
            Ok(()) => return Ok(()),
            Err(e) if is_transient(&e) => {
                warn!("Role grant failed: {}", e);
                last_error = Some(e);
            }
            Err(e) => return Err(e.into()),
        }
    }

    Err(last_error
        .map(AppError::from)
        .unwrap_or_else(|| AppError::internal("role grant was never attempted")))
}

/// Rate limits, server errors and transport failures are worth retrying.
/// Other 4xx responses (missing permission, unknown role) are not.
fn is_transient(error: &serenity::Error) -> bool {
    match error {
        serenity::Error::Http(serenity::HttpError::UnsuccessfulRequest(response)) => {
            let status = response.status_code.as_u16();
            status == 429 || status >= 500
        }
        serenity::Error::Http(_) => true,
        _ => false,
    }
}

fn retry_delay(attempt: u32) -> Duration {
    Duration::from_millis(250 * 2u64.pow(attempt.min(6)))
}

/// Human-readable remaining cooldown
pub fn format_wait(wait: Duration) -> String {
    let secs = wait.as_secs().max(1);
    match (secs / 60, secs % 60) {
        (0, s) => format!("{}s", s),
        (m, 0) => format!("{}m", m),
        (m, s) => format!("{}m {}s", m, s),
    }
}

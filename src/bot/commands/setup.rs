use super::{community_id, reply, Context, Error};
use crate::bot::handler;
use crate::registry::{ConfigureOutcome, RoleId, DEFAULT_CLAIM_COMMAND};
use poise::serenity_prelude as serenity;
use tracing::error;

/// ⚙️ Set the reward role and claim command for this server
#[poise::command(slash_command, guild_only, required_permissions = "ADMINISTRATOR")]
pub async fn setup(
    ctx: Context<'_>,
    #[description = "Role granted when a key is redeemed"] role: serenity::Role,
    #[description = "Name of the claim command (default: claim)"] command: Option<String>,
    #[description = "Allow each member to redeem only one key"] one_per_member: Option<bool>,
) -> Result<(), Error> {
    let community = community_id(ctx)?;
    let guild_id = ctx.guild_id().ok_or("Must be used in a guild")?;
    let command = command.unwrap_or_else(|| DEFAULT_CLAIM_COMMAND.to_string());

    ctx.defer_ephemeral().await?;

    let outcome = ctx
        .data()
        .keeper
        .setup(community, RoleId(role.id.get()), &command, one_per_member)
        .await?;
    let settings = ctx.data().keeper.settings(community).await?;

    let previous = match &outcome {
        ConfigureOutcome::Created => None,
        ConfigureOutcome::Updated { previous_command } => Some(previous_command.as_str()),
    };
    let registered = handler::register_claim_command(
        ctx.serenity_context(),
        guild_id,
        &settings.command,
        previous,
    )
    .await;

    let mut response = match outcome {
        ConfigureOutcome::Created => format!(
            "✅ The realm is ready! Members can now use `/{}` to claim {}.",
            settings.command, role
        ),
        ConfigureOutcome::Updated { .. } => format!(
            "✅ Configuration updated. Members use `/{}` to claim {}. Existing keys were kept.",
            settings.command, role
        ),
    };
    response.push_str(&format!(
        "\nOne key per member: **{}**",
        if settings.one_per_member { "on" } else { "off" }
    ));
    if let Err(e) = registered {
        error!("Failed to register claim command in guild {}: {}", guild_id, e);
        response.push_str("\n⚠️ The claim command could not be registered yet. Run `/sync` to retry.");
    }

    reply(ctx, response).await
}

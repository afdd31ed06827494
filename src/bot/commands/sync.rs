use super::{community_id, reply, Context, Error};
use crate::bot::handler;

/// 🔄 Re-register this server's claim command
#[poise::command(slash_command, guild_only, required_permissions = "ADMINISTRATOR")]
pub async fn sync(ctx: Context<'_>) -> Result<(), Error> {
    let community = community_id(ctx)?;
    let guild_id = ctx.guild_id().ok_or("Must be used in a guild")?;
    ctx.defer_ephemeral().await?;

    let settings = ctx.data().keeper.settings(community).await?;
    handler::register_claim_command(ctx.serenity_context(), guild_id, &settings.command, None)
        .await?;

    reply(ctx, format!("✅ Commands synced! `/{}` is ready.", settings.command)).await
}

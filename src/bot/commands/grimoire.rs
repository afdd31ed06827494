use super::{community_id, Context, Error};
use poise::serenity_prelude as serenity;

const ADMIN_COMMANDS: &[(&str, &str)] = &[
    ("setup", "Set the reward role and claim command"),
    ("addkey", "Add one key, optionally expiring"),
    ("addkeys", "Bulk add keys inline or from a file"),
    ("removekey", "Remove one key"),
    ("removekeys", "Bulk remove keys"),
    ("clearkeys", "Remove every available key"),
    ("keys", "Show key statistics"),
    ("sync", "Re-register the claim command"),
];

/// 📚 View command documentation
#[poise::command(slash_command, guild_only)]
pub async fn grimoire(ctx: Context<'_>) -> Result<(), Error> {
    let community = community_id(ctx)?;
    let claim_command = ctx
        .data()
        .keeper
        .settings(community)
        .await
        .ok()
        .map(|s| s.command);

    let admin = ADMIN_COMMANDS
        .iter()
        .map(|(name, about)| format!("`/{}` - {}", name, about))
        .collect::<Vec<_>>()
        .join("\n");

    let user = match &claim_command {
        Some(name) => format!("`/{} <key>` - Claim your role with a key", name),
        None => "Not configured yet. An admin must run `/setup`.".to_string(),
    };

    let embed = serenity::CreateEmbed::default()
        .title("📚 Realm Keeper's Grimoire")
        .description("A guide to the mystical arts")
        .field("🔧 Admin Commands", admin, false)
        .field("✨ User Commands", user, false)
        .field(
            "📝 Examples",
            "• `/setup role:@Member` - First time setup\n\
            • `/addkey key:<key> expires_in:3600` - Key valid for one hour\n\
            • `/addkeys file:keys.txt` - Bulk add keys",
            false,
        )
        .color(0x9B59B6);

    ctx.send(poise::CreateReply::default().embed(embed).ephemeral(true))
        .await?;
    Ok(())
}

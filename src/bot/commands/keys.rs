use super::{community_id, reply, Context, Error};
use crate::keys::{AddOutcome, RemoveOutcome};
use crate::registry::ClaimTiming;
use poise::serenity_prelude as serenity;
use std::time::Duration;

/// Largest key file accepted by the bulk commands
const MAX_ATTACHMENT_BYTES: u32 = 1024 * 1024;

/// Split bulk input on whitespace, commas and newlines
pub fn split_keys(input: &str) -> Vec<&str> {
    input
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|k| !k.is_empty())
        .collect()
}

/// Gather keys typed inline and from an uploaded text file
async fn collect_bulk_input(
    inline: Option<String>,
    file: Option<serenity::Attachment>,
) -> Result<String, Error> {
    let mut input = inline.unwrap_or_default();
    if let Some(file) = file {
        if file.size > MAX_ATTACHMENT_BYTES {
            return Err(format!("{} is too large (limit is 1 MiB)", file.filename).into());
        }
        let bytes = file.download().await?;
        let text = String::from_utf8(bytes)
            .map_err(|_| format!("{} is not a UTF-8 text file", file.filename))?;
        input.push('\n');
        input.push_str(&text);
    }
    if input.trim().is_empty() {
        return Err("Provide keys inline or as a text file".into());
    }
    Ok(input)
}

/// 🔑 Add a single key
#[poise::command(slash_command, guild_only, required_permissions = "ADMINISTRATOR")]
pub async fn addkey(
    ctx: Context<'_>,
    #[description = "The secret key"] key: String,
    #[description = "Lifetime in seconds (optional)"]
    #[min = 1]
    expires_in: Option<u64>,
) -> Result<(), Error> {
    let community = community_id(ctx)?;
    let lifetime = match expires_in {
        Some(secs) => Some(
            i64::try_from(secs)
                .ok()
                .and_then(chrono::Duration::try_seconds)
                .ok_or("Lifetime is too long")?,
        ),
        None => None,
    };

    let outcome = ctx.data().keeper.add_key(community, &key, lifetime).await?;
    let response = match (outcome, expires_in) {
        (AddOutcome::Created, Some(secs)) => format!("✅ Key added! It expires in {} seconds.", secs),
        (AddOutcome::Created, None) => "✅ Key added!".to_string(),
        (AddOutcome::Duplicate, _) => "❌ Key exists!".to_string(),
    };
    reply(ctx, response).await
}

/// 🔑 Bulk add keys
#[poise::command(slash_command, guild_only, required_permissions = "ADMINISTRATOR")]
pub async fn addkeys(
    ctx: Context<'_>,
    #[description = "Keys separated by spaces, commas or newlines"] keys: Option<String>,
    #[description = "Text file with one key per line"] file: Option<serenity::Attachment>,
) -> Result<(), Error> {
    let community = community_id(ctx)?;
    ctx.defer_ephemeral().await?;

    let input = collect_bulk_input(keys, file).await?;
    let counts = ctx
        .data()
        .keeper
        .add_keys(community, &split_keys(&input))
        .await?;

    reply(
        ctx,
        format!(
            "✅ Added {} keys!\n• Duplicates: {}\n• Invalid: {}",
            counts.created, counts.duplicate, counts.invalid
        ),
    )
    .await
}

/// 🗑️ Remove a specific key
#[poise::command(slash_command, guild_only, required_permissions = "ADMINISTRATOR")]
pub async fn removekey(
    ctx: Context<'_>,
    #[description = "The key to remove"] key: String,
) -> Result<(), Error> {
    let community = community_id(ctx)?;
    let response = match ctx.data().keeper.remove_key(community, &key).await? {
        RemoveOutcome::Removed => "✅ Key removed!",
        RemoveOutcome::NotFound => "❌ Key not found!",
    };
    reply(ctx, response).await
}

/// 🗑️ Remove multiple keys
#[poise::command(slash_command, guild_only, required_permissions = "ADMINISTRATOR")]
pub async fn removekeys(
    ctx: Context<'_>,
    #[description = "Keys separated by spaces, commas or newlines"] keys: Option<String>,
    #[description = "Text file with one key per line"] file: Option<serenity::Attachment>,
) -> Result<(), Error> {
    let community = community_id(ctx)?;
    ctx.defer_ephemeral().await?;

    let input = collect_bulk_input(keys, file).await?;
    let counts = ctx
        .data()
        .keeper
        .remove_keys(community, &split_keys(&input))
        .await?;

    reply(
        ctx,
        format!(
            "✅ Removed {} keys!\n• Not found: {}\n• Invalid: {}",
            counts.removed, counts.not_found, counts.invalid
        ),
    )
    .await
}

/// 🗑️ Remove all available keys
#[poise::command(slash_command, guild_only, required_permissions = "ADMINISTRATOR")]
pub async fn clearkeys(ctx: Context<'_>) -> Result<(), Error> {
    let community = community_id(ctx)?;
    let removed = ctx.data().keeper.clear_keys(community).await?;
    reply(
        ctx,
        format!("🗑️ Cleared {} keys. Redemption history is kept.", removed),
    )
    .await
}

fn millis(d: Duration) -> String {
    format!("{:.1}ms", d.as_micros() as f64 / 1000.0)
}

/// Average, fastest and slowest claim, once anything was redeemed
fn format_timing(timing: &ClaimTiming) -> Option<String> {
    Some(format!(
        "Average: {}\nFastest: {}\nSlowest: {}",
        millis(timing.average()?),
        millis(timing.fastest?),
        millis(timing.slowest?)
    ))
}

/// 📊 View key statistics
#[poise::command(slash_command, guild_only, required_permissions = "ADMINISTRATOR")]
pub async fn keys(ctx: Context<'_>) -> Result<(), Error> {
    let community = community_id(ctx)?;
    let report = ctx.data().keeper.report(community).await?;
    let settings = ctx.data().keeper.settings(community).await?;
    let stats = report.stats;

    let success_rate = if stats.claim_attempts > 0 {
        stats.successful_claims as f64 / stats.claim_attempts as f64 * 100.0
    } else {
        0.0
    };

    let mut embed = serenity::CreateEmbed::default()
        .title("📊 Key Statistics")
        .field("Available", report.available.to_string(), true)
        .field("Expired", report.expired.to_string(), true)
        .field("In pool", report.in_pool.to_string(), true)
        .field("Redeemed", report.claimed.to_string(), true)
        .field(
            "Claims",
            format!(
                "Attempts: {}\nSuccessful: {}\nFailed: {}\nSuccess rate: {:.1}%",
                stats.claim_attempts, stats.successful_claims, stats.failed_claims, success_rate
            ),
            true,
        )
        .field(
            "Keys",
            format!("Added: {}\nRemoved: {}", stats.keys_added, stats.keys_removed),
            true,
        );
    if let Some(timing) = format_timing(&stats.timing) {
        embed = embed.field("Timing", timing, true);
    }
    let embed = embed
        .field(
            "Configuration",
            format!(
                "Role: <@&{}>\nCommand: `/{}`\nOne key per member: {}",
                settings.role_id,
                settings.command,
                if settings.one_per_member { "on" } else { "off" }
            ),
            false,
        )
        .color(0x9B59B6);

    ctx.send(poise::CreateReply::default().embed(embed).ephemeral(true))
        .await?;
    Ok(())
}

pub mod grimoire;
pub mod keys;
pub mod setup;
pub mod sync;

pub use grimoire::grimoire;
pub use keys::{addkey, addkeys, clearkeys, keys, removekey, removekeys};
pub use setup::setup;
pub use sync::sync;

use crate::bot::Data;
use crate::registry::CommunityId;

type Error = Box<dyn std::error::Error + Send + Sync>;
type Context<'a> = poise::Context<'a, Data, Error>;

/// Get all registered commands
pub fn all_commands() -> Vec<poise::Command<Data, Error>> {
    vec![
        setup(),
        addkey(),
        addkeys(),
        removekey(),
        removekeys(),
        clearkeys(),
        keys(),
        sync(),
        grimoire(),
    ]
}

/// Community of the guild the command was used in
fn community_id(ctx: Context<'_>) -> Result<CommunityId, Error> {
    let guild_id = ctx.guild_id().ok_or("Must be used in a guild")?;
    Ok(CommunityId(guild_id.get()))
}

/// Admin answers are only shown to the invoking admin
async fn reply(ctx: Context<'_>, content: impl Into<String>) -> Result<(), Error> {
    ctx.send(
        poise::CreateReply::default()
            .content(content)
            .ephemeral(true),
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RESERVED_COMMAND_NAMES;

    #[test]
    fn test_every_admin_command_name_is_reserved() {
        let commands = all_commands();
        assert_eq!(commands.len(), RESERVED_COMMAND_NAMES.len());
        for command in commands {
            assert!(
                RESERVED_COMMAND_NAMES.contains(&command.name.as_str()),
                "/{} can be shadowed by a claim command",
                command.name
            );
        }
    }
}

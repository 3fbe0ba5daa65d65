// ============================
// viewsync-lib/src/chat.rs
// ============================
//! Chat relay: HTML-escape, truncate, fan out. The one inline command is
//! `/rename`, which renames the sender instead of being broadcast.

use crate::validation::{sanitize_string, truncate_chat, validate_display_name};

const RENAME_PREFIX: &str = "/rename";

/// What the dispatcher should do with an inbound chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatOutcome {
    /// Relay to the room: both fields already escaped and capped.
    Broadcast { sender: String, message: String },
    /// Rename the sender. The raw `/rename` text is never broadcast; the
    /// caller persists the name, confirms to the sender, and announces
    /// with a system-authored message.
    Rename { new_name: String },
    /// Malformed; drop without a reply.
    Ignored,
}

/// Classify and sanitize one chat message.
pub fn process_message(sender: &str, message: &str) -> ChatOutcome {
    let trimmed = message.trim();
    if trimmed.is_empty() {
        return ChatOutcome::Ignored;
    }

    if let Some(rest) = trimmed.strip_prefix(RENAME_PREFIX) {
        // require either exactly "/rename" (malformed) or "/rename NAME"
        if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
            // e.g. "/renamed" is an ordinary message
        } else {
            return match validate_display_name(rest) {
                Ok(new_name) => ChatOutcome::Rename { new_name },
                Err(_) => ChatOutcome::Ignored,
            };
        }
    }

    ChatOutcome::Broadcast {
        sender: sanitize_string(sender),
        message: sanitize_string(truncate_chat(trimmed)),
    }
}

/// System-authored rename announcement.
pub fn rename_announcement(old_name: &str, new_name: &str) -> String {
    format!(
        "{} is now known as {}",
        sanitize_string(old_name),
        sanitize_string(new_name)
    )
}

//! Participant-facing texts and keyboards for the quest flow.

use chrono::{DateTime, FixedOffset, Utc};

use crate::catalog::{Prompt, PromptKind};
use crate::channels::{InlineButton, OutgoingMessage};

/// Callback data prefix for team buttons (`team:<name>`).
pub const TEAM_CALLBACK_PREFIX: &str = "team:";

/// Callback data of the "I'm ready" button.
pub const CONFIRM_CALLBACK: &str = "confirm_start";

pub fn greeting() -> String {
    "Dear colleague, welcome to the event quest! 🎉".to_string()
}

pub fn ask_name() -> String {
    "Please enter your first and last name to register:".to_string()
}

pub fn greeting_back(name: &str) -> String {
    format!("Welcome back, {name}! Picking up where you left off.")
}

/// Team selection keyboard, one button per configured team.
pub fn team_keyboard(name: &str, teams: &[String]) -> OutgoingMessage {
    let buttons = teams
        .iter()
        .map(|team| InlineButton::new(team, format!("{TEAM_CALLBACK_PREFIX}{team}")))
        .collect();
    OutgoingMessage::text(format!(
        "Great, {name}! Now pick the color of your wristband so we can put you in a team:"
    ))
    .with_buttons(buttons)
}

pub fn use_buttons() -> String {
    "Please choose an option using the buttons!".to_string()
}

pub fn unknown_team(choice: &str) -> String {
    format!("There is no team called \"{choice}\". Please use the buttons.")
}

pub fn team_chosen(team: &str) -> String {
    format!("You chose: {team}")
}

/// Registration summary with the rules and the start button.
pub fn rules_with_confirm() -> OutgoingMessage {
    OutgoingMessage::text(
        "Thanks for registering! 📋\n\n\
         The rules:\n\
         - listen to the speakers, raise your hand if you have questions\n\
         - answer the questions and complete the tasks\n\
         - every correct answer earns points for your team\n\
         - the teams with the most points win prizes at the end\n\n\
         Ready? Press YES",
    )
    .with_buttons(vec![InlineButton::new("YES", CONFIRM_CALLBACK)])
}

pub fn press_confirm() -> String {
    "Press YES when you are ready to start.".to_string()
}

pub fn lets_go() -> String {
    "Let's go! 🚀".to_string()
}

pub fn new_block(title: &str) -> String {
    format!("Hooray! A new block is open: {title}")
}

/// The prompt itself, with a hint when a photo is required.
pub fn question(prompt: &Prompt) -> String {
    match prompt.kind {
        PromptKind::Text => prompt.text.clone(),
        PromptKind::Photo => format!("{}\n\n📷 Reply with a photo.", prompt.text),
    }
}

pub fn expected(kind: PromptKind) -> String {
    match kind {
        PromptKind::Text => "This question needs a text answer.".to_string(),
        PromptKind::Photo => "This task needs a photo. Please send a picture.".to_string(),
    }
}

pub fn block_saved() -> String {
    "Thanks for your answers! They are saved.".to_string()
}

pub fn next_block_at(at: DateTime<Utc>, offset: FixedOffset) -> String {
    format!(
        "The next block opens at {}. We'll message you.",
        at.with_timezone(&offset).format("%H:%M")
    )
}

pub fn next_block_later() -> String {
    "Wait for the next block, we'll message you when it opens.".to_string()
}

pub fn waiting_for_team() -> String {
    "You've reached the team poem! ✍️ We'll start as soon as all your teammates get here."
        .to_string()
}

pub fn all_done() -> String {
    "You've completed the whole quest. Thank you! 🏁".to_string()
}

pub fn still_waiting() -> String {
    "No block is open for you right now. We'll message you when the next one starts.".to_string()
}

pub fn session_reset() -> String {
    "Session reset. Your current block will be offered again later.".to_string()
}

pub fn nothing_to_reset() -> String {
    "There is no block in progress.".to_string()
}

pub fn event_closed() -> String {
    "The quest is over. Thank you all for playing! 🎉".to_string()
}

pub fn not_registered() -> String {
    "You are not registered yet. Send /start to begin.".to_string()
}

pub fn try_again() -> String {
    "Something went wrong on our side. Please try again.".to_string()
}

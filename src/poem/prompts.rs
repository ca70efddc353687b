//! Team poem messages.

use std::time::Duration;

use super::model::{PoemMember, TeamPoem};

fn minutes(timeout: Duration) -> String {
    let secs = timeout.as_secs();
    if secs % 60 == 0 {
        format!("{} min", secs / 60)
    } else {
        format!("{secs} s")
    }
}

/// Sent to every member when the poem starts.
pub fn instructions(poem: &TeamPoem, intro: &str, timeout: Duration) -> String {
    let mut text = format!(
        "🎭 Team {} is writing a poem together!\n\n{intro}\n\n\
         Rules:\n\
         - everyone writes one line, in turn\n\
         - you have {} for your line, then the turn moves on\n\n\
         Order:\n",
        poem.team,
        minutes(timeout)
    );
    for (i, member) in poem.members.iter().enumerate() {
        text.push_str(&format!("{}. {}\n", i + 1, member.display_name));
    }
    text.push_str("\n💫 Good luck!");
    text
}

/// Sent to the turn-holder.
pub fn your_turn(member: &PoemMember, poem: &TeamPoem, timeout: Duration) -> String {
    let mut text = format!("🖊 {}, it's your turn!\n\n", member.display_name);
    if poem.lines.is_empty() {
        text.push_str("You open the poem!\n\n");
    } else {
        text.push_str(&poem.text());
        text.push_str("\n\n");
    }
    text.push_str(&format!(
        "✍️ Write one line of the poem. Try to carry on the thought and keep the rhyme.\n\n\
         ⏰ You have {}.",
        minutes(timeout)
    ));
    text
}

pub fn line_accepted() -> String {
    "✅ Your line is in the poem. Thanks! 🎭".to_string()
}

pub fn progress(author: &str, line: &str, written: usize, total: usize) -> String {
    format!("📝 {author} added a line:\n➡️ {line}\n\nLines written: {written}/{total}")
}

pub fn timed_out() -> String {
    "⏰ Time's up! Your turn was skipped and passed to the next teammate.".to_string()
}

pub fn not_your_turn(current: Option<&str>) -> String {
    match current {
        Some(name) => format!("⏳ It's {name}'s turn now. Wait for yours."),
        None => "⏳ It's not your turn. Wait for yours.".to_string(),
    }
}

pub fn already_written() -> String {
    "You've already had your turn in this poem.".to_string()
}

pub fn not_in_poem() -> String {
    "❌ You're not taking part in a poem right now.".to_string()
}

pub fn empty_line() -> String {
    "Please write one line of text.".to_string()
}

pub fn team_already_done() -> String {
    "Your team's poem is already under way or finished without you. Thanks for playing!"
        .to_string()
}

/// Final message with the poem and its authors.
pub fn completed(poem: &TeamPoem) -> String {
    let mut text = format!(
        "🎉 THE POEM IS FINISHED!\n\nTeam {} wrote:\n\n{}\n\n👏 Authors:\n",
        poem.team,
        poem.text()
    );
    let authors = poem.authors();
    if authors.is_empty() {
        text.push_str("(nobody this time)\n");
    }
    for member in authors {
        text.push_str(&format!("• {}\n", member.display_name));
    }
    text.push_str("\n🏆 Great teamwork!");
    text
}

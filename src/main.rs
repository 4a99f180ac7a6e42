// Terminal front end: sends one prompt and follows the reply as it streams in.
//
//   AI_BOX_API_KEY=sk-... ai-box "Explain borrow checking in one paragraph"
//
// Ctrl-C cancels the generation and prints whatever arrived so far.

use ai_box::commands::{chat, settings};
use ai_box::config::AppConfig;
use ai_box::db::models::MessageRole;
use ai_box::AppState;
use std::io::Write;
use std::process::ExitCode;
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[tokio::main]
async fn main() -> ExitCode {
    ai_box::init_tracing();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let prompt = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    if prompt.trim().is_empty() {
        return Err("usage: ai-box <prompt>".into());
    }

    let config = AppConfig::from_env()?;
    let state = AppState::open(config)?;
    let user_id = std::env::var("AI_BOX_USER").unwrap_or_else(|_| "local".to_string());

    if let Ok(api_key) = std::env::var("AI_BOX_API_KEY") {
        settings::set_api_key(&state, &user_id, &api_key)?;
    }

    let title: String = prompt.chars().take(48).collect();
    let conversation = chat::create_conversation(&state, &user_id, &title, None)?;
    let sent =
        chat::send_message(&state, &user_id, &conversation.id, chat::SendMessage::text(prompt))
            .await?;
    tracing::debug!(message_id = %sent.message.id, "prompt stored");

    let mut printed = String::new();
    let mut interval = tokio::time::interval(POLL_INTERVAL);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                chat::cancel_generation(&state, &user_id, &conversation.id)?;
            }
            _ = interval.tick() => {}
        }

        let messages = chat::get_messages(&state, &user_id, &conversation.id)?;
        let Some(reply) = messages.iter().find(|m| m.role == MessageRole::Assistant) else {
            continue;
        };

        // Content only grows while streaming; terminal states may rewrite it
        match reply.content.strip_prefix(printed.as_str()) {
            Some(fresh) => print!("{}", fresh),
            None => print!("\n{}", reply.content),
        }
        std::io::stdout().flush()?;
        printed = reply.content.clone();

        if !reply.is_streaming {
            println!();
            break;
        }
    }

    sent.generation.wait().await;
    Ok(())
}

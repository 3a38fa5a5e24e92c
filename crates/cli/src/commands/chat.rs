//! `weft chat`: Stream one generation to the terminal.

use std::io::Write;
use weft_agent::DEFAULT_APPROVAL_TEXT;
use weft_client::{ClientError, Follower, GatewayClient};
use weft_config::AppConfig;
use weft_core::event::StreamEvent;

pub async fn run(
    url: Option<String>,
    conversation: Option<String>,
    message: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let client = GatewayClient::new(gateway_url(url));
    let stream = client.generate(conversation.as_deref(), &message).await?;
    render(&client, client.follow(stream)).await
}

/// Explicit URL, else the configured gateway address.
pub(crate) fn gateway_url(url: Option<String>) -> String {
    url.unwrap_or_else(|| {
        let config = AppConfig::load().unwrap_or_default();
        format!("http://{}:{}", config.gateway.host, config.gateway.port)
    })
}

/// Print events as they arrive until the generation ends.
pub(crate) async fn render(client: &GatewayClient, mut follower: Follower<'_>) -> Result<(), Box<dyn std::error::Error>> {
    let mut stdout = std::io::stdout();

    loop {
        let event = match follower.next().await {
            Ok(Some(event)) => event,
            Ok(None) => break,
            Err(ClientError::NoActiveJob(id)) => {
                // Finished while we were away; show what was persisted.
                let conversation = client.get_conversation(&id).await?;
                if let Some(text) = conversation.last_assistant_text() {
                    println!("\n{text}");
                }
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        match event {
            StreamEvent::Start { conversation_id, .. } => {
                eprintln!("  conversation {conversation_id}");
            }
            StreamEvent::TextChunk { text } => {
                print!("{text}");
                stdout.flush()?;
            }
            StreamEvent::ToolCallStart(call) => eprintln!("\n  [tool] {} ...", call.name),
            StreamEvent::ToolCallEnd(call) => {
                let failed = call.result.as_ref().is_some_and(|r| r.is_error());
                eprintln!("  [tool] {} {}", call.name, if failed { "failed" } else { "done" });
            }
            StreamEvent::PlanReady { approval_id, plan } => {
                println!("\n\n  Proposed plan:\n");
                for line in plan.lines() {
                    println!("    {line}");
                }
                let answer = prompt("\n  Approve? [Y/n, or type an instruction] ").await?;
                let conversation_id = follower
                    .transcript()
                    .conversation_id()
                    .ok_or("plan arrived before the conversation id")?
                    .to_string();
                match approval_instruction(&answer) {
                    Some(instruction) => client.approve(&conversation_id, &approval_id, &instruction).await?,
                    None => client.deny(&conversation_id, &approval_id).await?,
                }
            }
            StreamEvent::FrontendToolRequest { call_id, name, .. } => {
                // The terminal has no client-side tools to offer.
                client
                    .respond_tool(&call_id, Err(format!("tool '{name}' is not available in the terminal client")))
                    .await?;
            }
            StreamEvent::Complete { .. } => println!(),
            StreamEvent::Error(error) => {
                return Err(format!("\ngeneration failed: {}", error.message).into());
            }
            StreamEvent::Cancel { reason } => eprintln!("\n  [cancelled: {reason}]"),
            StreamEvent::ToolUpdate { .. } | StreamEvent::Ping { .. } => {}
        }
    }

    Ok(())
}

async fn prompt(question: &str) -> Result<String, Box<dyn std::error::Error>> {
    print!("{question}");
    std::io::stdout().flush()?;
    let line = tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        std::io::stdin().read_line(&mut line).map(|_| line)
    })
    .await??;
    Ok(line.trim().to_string())
}

/// Map a terminal answer to an approval instruction; `None` denies.
fn approval_instruction(answer: &str) -> Option<String> {
    match answer.trim().to_lowercase().as_str() {
        "" | "y" | "yes" => Some(DEFAULT_APPROVAL_TEXT.to_string()),
        "n" | "no" => None,
        _ => Some(answer.trim().to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn approval_answers() {
        assert_eq!(approval_instruction(""), Some(DEFAULT_APPROVAL_TEXT.to_string()));
        assert_eq!(approval_instruction(" Yes "), Some(DEFAULT_APPROVAL_TEXT.to_string()));
        assert_eq!(approval_instruction("n"), None);
        assert_eq!(approval_instruction("Skip step 2"), Some("Skip step 2".to_string()));
    }

    #[test]
    fn explicit_url_wins() {
        assert_eq!(gateway_url(Some("http://gw:1".into())), "http://gw:1");
    }
}

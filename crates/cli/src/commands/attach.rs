//! `weft attach`: Reconnect to a running generation.

use weft_client::{ClientError, GatewayClient};

use super::chat::{gateway_url, render};

pub async fn run(url: Option<String>, conversation_id: String) -> Result<(), Box<dyn std::error::Error>> {
    let client = GatewayClient::new(gateway_url(url));

    let stream = match client.attach(&conversation_id).await {
        Ok(stream) => stream,
        Err(ClientError::NoActiveJob(_)) => {
            eprintln!("  No generation is running for {conversation_id}.");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };
    render(&client, client.follow(stream)).await
}

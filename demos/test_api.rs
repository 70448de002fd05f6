//! Call the Tinfoil API through a verified, pinned and encrypted client
//!
//! Requires `TINFOIL_API_KEY`.

use futures::StreamExt;
use tinfoil_client::{ChatMessage, SecureClient};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("Verifying enclave...");
    let client = SecureClient::builder()
        .enclave("inference.tinfoil.sh")
        .on_verification(|doc| {
            println!("   securityVerified = {}", doc.security_verified());
        })
        .build()
        .await?;

    println!("   ✓ Connected to {} (encrypted bodies: {})\n", client.host(), client.transport().is_encrypted());

    print!("   Embedding API: ");
    match client.embed("Hello, secure world!").await {
        Ok(emb) => println!("✓ {} dimensions", emb.len()),
        Err(e) => println!("✗ {}", e),
    }

    print!("   Chat API:      ");
    match client
        .chat(vec![ChatMessage::user("What is 2+2? Reply with just the number.")])
        .await
    {
        Ok(resp) => {
            let answer = resp.choices[0].message.content.as_deref().unwrap_or("?");
            println!("✓ {}", answer.trim());
        }
        Err(e) => println!("✗ {}", e),
    }

    println!("   Streaming:");
    let mut stream = client
        .chat_stream(
            tinfoil_client::client::DEFAULT_CHAT_MODEL,
            vec![ChatMessage::user("Count from one to five.")],
        )
        .await?;
    while let Some(chunk) = stream.next().await {
        if let Some(text) = chunk?.content() {
            print!("{}", text);
        }
    }
    println!();

    Ok(())
}

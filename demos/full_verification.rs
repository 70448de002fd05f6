//! Full end-to-end verification example
//!
//! Runs the four verification steps against a live enclave with the
//! built-in engine and prints the resulting verification document.
//!
//! ```text
//! RUST_LOG=tinfoil_client=debug cargo run --example full_verification -- inference.tinfoil.sh
//! ```

use std::sync::Arc;

use tinfoil_client::{Config, NativeEngine, Step, Target, Verifier};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let host = std::env::args().nth(1).unwrap_or_else(|| "inference.tinfoil.sh".into());
    let config = Config::default();

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║      Tinfoil Full End-to-End Verification Demo               ║");
    println!("╚══════════════════════════════════════════════════════════════╝\n");
    println!("Enclave host: {}", host);
    println!("Source repo:  {}\n", config.repo);

    let verifier = Verifier::new(
        config.repo.clone(),
        Target::Enclave(host),
        Arc::new(NativeEngine::from_config(&config)?),
    );

    let result = verifier.verify().await;
    let doc = verifier
        .last_document()
        .ok_or("verifier recorded no document")?;

    for step in Step::ALL {
        let state = doc.steps.state(step);
        let mark = if state.is_success() { "✓" } else { "✗" };
        println!("   {} {:<20} {:?}", mark, step.as_str(), state);
    }

    match result {
        Ok(gt) => {
            println!("\n   ✅ VERIFICATION PASSED");
            println!("   TLS fingerprint:   {}...", &gt.tls_public_key_fingerprint[..32]);
            if let Some(key) = &gt.recipient_encryption_key {
                println!("   Recipient key:     {}...", &key[..key.len().min(32)]);
            }
            println!("   Code fingerprint:  {}", gt.code_fingerprint);
        }
        Err(e) => println!("\n   ❌ {}", e),
    }

    println!("\n{}", serde_json::to_string_pretty(&doc)?);
    Ok(())
}

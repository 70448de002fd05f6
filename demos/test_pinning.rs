//! Check that TLS pinning rejects wrong fingerprints and accepts the
//! attested one

use std::sync::Arc;

use tinfoil_client::attestation::{self, tdx::DcapVerifier};
use tinfoil_client::tls::create_pinned_client;
use tinfoil_client::{Config, PinningMode};
use tracing_subscriber::EnvFilter;

const HOST: &str = "inference.tinfoil.sh";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let url = format!("https://{}/.well-known/tinfoil-attestation", HOST);

    println!("Test 1: strict pinning with a WRONG fingerprint");
    let client = create_pinned_client(&"00".repeat(32), PinningMode::Strict, None)?;
    match client.get(&url).send().await {
        Ok(_) => println!("   ❌ FAIL: request succeeded with wrong fingerprint\n"),
        Err(e) => println!("   ✅ PASS: rejected ({})\n", e),
    }

    println!("Test 2: strict pinning with the ATTESTED fingerprint");
    let doc = attestation::fetch(HOST).await?;
    let config = Config::default();
    let quotes = DcapVerifier::new(config.pccs_url.as_str());
    let verification = attestation::verify(&doc, None, &config.kds_proxy, &quotes).await?;
    let fp = verification.tls_public_key_fp;
    println!("   Attested fingerprint: {}...", &fp[..32]);

    let client = create_pinned_client(&fp, PinningMode::Strict, None)?;
    match client.get(&url).send().await {
        Ok(resp) => println!("   ✅ PASS: HTTP {}\n", resp.status()),
        Err(e) => println!("   ❌ FAIL: {}\n", e),
    }

    println!("Test 3: relaxed pinning reports the mismatch");
    let mode = PinningMode::Relaxed(Arc::new(|matched: bool| {
        println!("   observer: fingerprint matched = {}", matched);
    }));
    let client = create_pinned_client(&"00".repeat(32), mode, None)?;
    match client.get(&url).send().await {
        Ok(resp) => println!("   ✅ accepted with HTTP {}", resp.status()),
        Err(e) => println!("   ❌ FAIL: {}", e),
    }

    Ok(())
}

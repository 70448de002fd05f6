//! Client configuration
//!
//! Every endpoint the client talks to lives in [`Config`] so tests and
//! self-hosted deployments can point the client elsewhere without touching
//! process-wide state.

use std::sync::Arc;
use std::time::Duration;

use crate::attestation::tdx::INTEL_PCS_URL;
use crate::attestation::types::HardwareMeasurement;
use crate::error::{Error, Result};
use crate::sigstore::FulcioRoots;

/// Default source repository the enclave is expected to run
pub const DEFAULT_REPO: &str = "tinfoilsh/confidential-model-router";

/// Environment variable consulted when no API key is configured
pub const API_KEY_ENV: &str = "TINFOIL_API_KEY";

const GITHUB_PROXY: &str = "https://api-github-proxy.tinfoil.sh";
const ATTESTATION_PROXY: &str = "https://gh-attestation-proxy.tinfoil.sh";
const KDS_PROXY: &str = "https://kds-proxy.tinfoil.sh";
const ROUTER_URL: &str = "https://atc.tinfoil.sh/routers";

/// Where the enclave's attestation comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Talk to the enclave directly and fetch its attestation document
    Enclave(String),
    /// Fetch a self-contained attestation bundle; the enclave host is
    /// discovered from the bundle
    Bundle(String),
}

impl Target {
    /// The configured enclave host, if this is a direct target
    pub fn host(&self) -> Option<&str> {
        match self {
            Target::Enclave(host) => Some(host),
            Target::Bundle(_) => None,
        }
    }
}

/// How the pinned TLS verifier reacts to a fingerprint mismatch
#[derive(Clone, Default)]
pub enum PinningMode {
    /// Reject the connection
    #[default]
    Strict,
    /// Accept the connection and report the comparison result
    Relaxed(Arc<dyn Fn(bool) + Send + Sync>),
}

impl std::fmt::Debug for PinningMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PinningMode::Strict => f.write_str("Strict"),
            PinningMode::Relaxed(_) => f.write_str("Relaxed"),
        }
    }
}

/// Immutable client configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// GitHub repository the enclave code is built from (`owner/name`)
    pub repo: String,

    /// Enclave address or bundle URL. `None` picks a router at random.
    pub target: Option<Target>,

    /// API key; falls back to `TINFOIL_API_KEY`
    pub api_key: Option<String>,

    /// Send traffic here instead of straight to the enclave (e.g. a proxy).
    /// Must be https, or http on loopback. A base URL on another origin
    /// than the enclave requires a recipient key, and the verified enclave
    /// URL is forwarded in a header.
    pub base_url: Option<String>,

    pub pinning: PinningMode,

    pub github_proxy: String,
    pub attestation_proxy: String,
    pub kds_proxy: String,
    pub router_url: String,

    /// PCCS serving TDX collateral (TCB info, QE identity, CRLs)
    pub pccs_url: String,

    /// PEM certificates trusted to issue Fulcio signing certificates.
    /// `None` uses the Sigstore public-good instance.
    pub fulcio_roots: Option<String>,

    /// Accepted TDX boot measurements. Empty disables the check.
    pub hardware_measurements: Vec<HardwareMeasurement>,

    pub request_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            repo: DEFAULT_REPO.to_string(),
            target: None,
            api_key: None,
            base_url: None,
            pinning: PinningMode::Strict,
            github_proxy: GITHUB_PROXY.to_string(),
            attestation_proxy: ATTESTATION_PROXY.to_string(),
            kds_proxy: KDS_PROXY.to_string(),
            router_url: ROUTER_URL.to_string(),
            pccs_url: INTEL_PCS_URL.to_string(),
            fulcio_roots: None,
            hardware_measurements: Vec::new(),
            request_timeout: None,
        }
    }
}

impl Config {
    /// Return the configured API key, or read it from the environment
    pub fn resolve_api_key(&self) -> Result<String> {
        if let Some(key) = self.api_key.as_deref().filter(|k| !k.is_empty()) {
            return Ok(key.to_string());
        }

        match std::env::var(API_KEY_ENV) {
            Ok(key) if !key.is_empty() => Ok(key),
            _ => Err(Error::Config(format!(
                "no API key configured and {} is not set",
                API_KEY_ENV
            ))),
        }
    }

    /// Validate fields that would otherwise fail only after network traffic
    pub fn validate(&self) -> Result<()> {
        if self.repo.split('/').filter(|p| !p.is_empty()).count() != 2 {
            return Err(Error::Config(format!(
                "repository must look like owner/name, got {:?}",
                self.repo
            )));
        }

        match &self.target {
            Some(Target::Enclave(host)) if host.is_empty() || host.contains('/') => {
                return Err(Error::Config(format!("invalid enclave host {:?}", host)));
            }
            Some(Target::Bundle(url)) => {
                url::Url::parse(url)
                    .map_err(|e| Error::Config(format!("invalid bundle URL {:?}: {}", url, e)))?;
            }
            _ => {}
        }

        if let Some(base) = &self.base_url {
            let url = url::Url::parse(base)
                .map_err(|e| Error::Config(format!("invalid base URL {:?}: {}", base, e)))?;
            if url.scheme() != "https" && !(url.scheme() == "http" && is_loopback(&url)) {
                return Err(Error::Config(format!(
                    "base URL must use https (plain http only on loopback), got {:?}",
                    base
                )));
            }
        }

        if let Some(pem) = &self.fulcio_roots {
            FulcioRoots::from_pem(pem)
                .map_err(|e| Error::Config(format!("invalid Fulcio roots: {}", e)))?;
        }

        Ok(())
    }

    /// Fulcio issuers signing certificates must chain to
    pub fn fulcio_roots(&self) -> Result<FulcioRoots> {
        match &self.fulcio_roots {
            Some(pem) => FulcioRoots::from_pem(pem),
            None => FulcioRoots::public_good(),
        }
    }
}

fn is_loopback(url: &url::Url) -> bool {
    match url.host() {
        Some(url::Host::Ipv4(ip)) => ip.is_loopback(),
        Some(url::Host::Ipv6(ip)) => ip.is_loopback(),
        Some(url::Host::Domain(name)) => name.eq_ignore_ascii_case("localhost"),
        None => false,
    }
}

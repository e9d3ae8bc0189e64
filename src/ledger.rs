//! Boundary to the Ledger hardware wallet. The vendor transport is opaque;
//! this module only guarantees the transport is released after every use
//! and translates the one vendor error users can act on.

use async_trait::async_trait;
use thiserror::Error;

pub const HD_PATH: [u32; 5] = [44, 118, 0, 0, 0];

const DEVICE_BUSY_PREFIX: &str = "Device is already open";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("Lunie doesn't support connecting to the Ledger for this network.")]
    UnsupportedNetwork(String),
    #[error("Something went wrong connecting to your Ledger. Please refresh your page and try again.")]
    DeviceBusy,
    #[error("{0}")]
    Device(String),
}

/// Parameters handed to the vendor connector for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerParams {
    pub network: String,
    pub hd_path: [u32; 5],
    pub bech32_prefix: &'static str,
    pub test_mode_allowed: bool,
}

pub fn params_for(network: &str, test_mode_allowed: bool) -> Result<LedgerParams, LedgerError> {
    let bech32_prefix = match network {
        "cosmos-hub-mainnet" | "cosmos-hub-testnet" => "cosmos",
        "regen-testnet" | "regen-mainnet" => "regen",
        "terra-testnet" | "terra-mainnet" => "terra",
        other => return Err(LedgerError::UnsupportedNetwork(other.to_string())),
    };
    Ok(LedgerParams {
        network: network.to_string(),
        hd_path: HD_PATH,
        bech32_prefix,
        test_mode_allowed,
    })
}

#[async_trait]
pub trait LedgerApp: Send {
    async fn get_address(&mut self) -> Result<String, LedgerError>;
    async fn confirm_address(&mut self) -> Result<(), LedgerError>;
    /// Releases the transport. A transport left open breaks the next
    /// connection attempt.
    fn close(&mut self);
}

#[async_trait]
pub trait LedgerConnector: Send + Sync {
    async fn connect(&self, params: LedgerParams) -> Result<Box<dyn LedgerApp>, LedgerError>;
}

struct Session(Box<dyn LedgerApp>);

impl Drop for Session {
    fn drop(&mut self) {
        self.0.close();
    }
}

fn rewrite_error(err: LedgerError) -> LedgerError {
    match err {
        LedgerError::Device(message) if message.trim().starts_with(DEVICE_BUSY_PREFIX) => {
            LedgerError::DeviceBusy
        }
        other => other,
    }
}

async fn open<C>(connector: &C, network: &str, test_mode_allowed: bool) -> Result<Session, LedgerError>
where
    C: LedgerConnector + ?Sized,
{
    let params = params_for(network, test_mode_allowed)?;
    let app = connector.connect(params).await.map_err(rewrite_error)?;
    Ok(Session(app))
}

pub async fn get_address_from_ledger<C>(
    connector: &C,
    network: &str,
    test_mode_allowed: bool,
) -> Result<String, LedgerError>
where
    C: LedgerConnector + ?Sized,
{
    let mut session = open(connector, network, test_mode_allowed).await?;
    session.0.get_address().await.map_err(rewrite_error)
}

pub async fn show_address_on_ledger<C>(
    connector: &C,
    network: &str,
    test_mode_allowed: bool,
) -> Result<(), LedgerError>
where
    C: LedgerConnector + ?Sized,
{
    let mut session = open(connector, network, test_mode_allowed).await?;
    session.0.confirm_address().await.map_err(rewrite_error)
}

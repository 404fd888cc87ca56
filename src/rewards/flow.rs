//! Flow blockchain dispatcher for the TaskRewardToken contract.
//!
//! Read-only scripts (balance) run against the Flow Access REST API. Transactions are
//! built but not signed: submitting them needs a signer this service does not carry, so
//! they fail with a non-transient `Unsupported` error and the reward queue drops them.

use std::sync::OnceLock;

use async_trait::async_trait;
use base64::Engine;
use regex::Regex;
use reqwest::Client;
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use super::{custodial_address, RewardDispatcher, RewardError};
use crate::config::FlowConfig;

const SETUP_VAULT_TX: &str = r#"
import TaskRewardToken from {contract}

transaction() {
  prepare(signer: AuthAccount) {
    if signer.borrow<&TaskRewardToken.Vault>(from: /storage/TaskRewardTokenVault) == nil {
      let vault <- TaskRewardToken.createEmptyVault()
      signer.save(<-vault, to: /storage/TaskRewardTokenVault)
      signer.link<&{TaskRewardToken.Receiver}>(
        /public/TaskRewardTokenReceiver,
        target: /storage/TaskRewardTokenVault
      )
      signer.link<&TaskRewardToken.Vault{TaskRewardToken.Balance}>(
        /public/TaskRewardTokenBalance,
        target: /storage/TaskRewardTokenVault
      )
    }
  }
}
"#;

const MINT_TX: &str = r#"
import TaskRewardToken from {contract}

transaction(recipient: Address, amount: UFix64, rewardId: String) {
  let admin: &TaskRewardToken.Admin
  let recipientVault: &{TaskRewardToken.Receiver}

  prepare(signer: AuthAccount) {
    self.admin = signer.borrow<&TaskRewardToken.Admin>(from: /storage/TaskRewardTokenAdmin)
      ?? panic("Admin not found")
    self.recipientVault = getAccount(recipient)
      .getCapability<&{TaskRewardToken.Receiver}>(/public/TaskRewardTokenReceiver)
      .borrow() ?? panic("Recipient vault not found")
  }

  pre {
    !TaskRewardToken.isRewardMinted(rewardId): "Reward already minted"
  }

  execute {
    self.admin.mintTokens(amount: amount, recipient: self.recipientVault, rewardId: rewardId)
  }
}
"#;

const TRANSFER_TX: &str = r#"
import TaskRewardToken from {contract}

transaction(to: Address, amount: UFix64) {
  let senderVault: &TaskRewardToken.Vault{TaskRewardToken.Provider}
  let receiverVault: &{TaskRewardToken.Receiver}

  prepare(signer: AuthAccount) {
    self.senderVault = signer.borrow<&TaskRewardToken.Vault{TaskRewardToken.Provider}>(from: /storage/TaskRewardTokenVault)
      ?? panic("Sender vault not found")
    self.receiverVault = getAccount(to)
      .getCapability<&{TaskRewardToken.Receiver}>(/public/TaskRewardTokenReceiver)
      .borrow() ?? panic("Receiver vault not found")
  }

  execute {
    let vault <- self.senderVault.withdraw(amount: amount)
    self.receiverVault.deposit(from: <-vault)
  }
}
"#;

const BALANCE_SCRIPT: &str = r#"
import TaskRewardToken from {contract}

pub fun main(address: Address): UFix64 {
  let vault = getAccount(address)
    .getCapability<&TaskRewardToken.Vault{TaskRewardToken.Balance}>(/public/TaskRewardTokenBalance)
    .borrow() ?? panic("Vault not found")
  return vault.balance()
}
"#;

fn address_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^0x[0-9a-fA-F]{16}$").expect("valid address regex"))
}

/// Whether `address` is `0x` followed by 16 hex digits.
pub fn is_flow_address(address: &str) -> bool {
    address_regex().is_match(address)
}

/// Format a whole token amount as a Cadence `UFix64` literal.
pub fn ufix64(amount: u64) -> String {
    format!("{}.00000000", amount)
}

/// A Cadence program plus JSON-Cadence arguments, ready to be signed or executed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CadenceCall {
    pub script: String,
    pub arguments: Vec<serde_json::Value>,
}

impl CadenceCall {
    /// Body for the access node: base64 script and base64 JSON-Cadence arguments.
    fn to_request_body(&self) -> serde_json::Value {
        let engine = base64::engine::general_purpose::STANDARD;
        json!({
            "script": engine.encode(self.script.as_bytes()),
            "arguments": self
                .arguments
                .iter()
                .map(|arg| engine.encode(arg.to_string().as_bytes()))
                .collect::<Vec<_>>(),
        })
    }
}

pub struct FlowDispatcher {
    client: Client,
    access_node: String,
    contract_address: String,
    admin_address: Option<String>,
}

impl FlowDispatcher {
    /// Returns `None` when no contract address is configured.
    pub fn from_config(config: &FlowConfig) -> Option<Self> {
        let contract_address = config.contract_address.clone()?;
        if !is_flow_address(&contract_address) {
            tracing::warn!("Ignoring malformed Flow contract address {:?}", contract_address);
            return None;
        }
        Some(Self {
            client: Client::new(),
            access_node: config.access_node.trim_end_matches('/').to_string(),
            contract_address,
            admin_address: config.admin_address.clone(),
        })
    }

    fn render(&self, template: &str) -> String {
        template.replace("{contract}", &self.contract_address)
    }

    fn check_address(address: &str) -> Result<(), RewardError> {
        if is_flow_address(address) {
            Ok(())
        } else {
            Err(RewardError::Rejected {
                status: 400,
                message: format!("invalid Flow address: {}", address),
            })
        }
    }

    pub fn setup_vault_transaction(&self) -> CadenceCall {
        CadenceCall {
            script: self.render(SETUP_VAULT_TX),
            arguments: Vec::new(),
        }
    }

    /// `reward_id` lets the contract refuse a second mint for the same completion.
    pub fn mint_transaction(&self, recipient: &str, amount: u64, reward_id: Uuid) -> CadenceCall {
        CadenceCall {
            script: self.render(MINT_TX),
            arguments: vec![
                json!({ "type": "Address", "value": recipient }),
                json!({ "type": "UFix64", "value": ufix64(amount) }),
                json!({ "type": "String", "value": reward_id.to_string() }),
            ],
        }
    }

    pub fn transfer_transaction(&self, to: &str, amount: u64) -> CadenceCall {
        CadenceCall {
            script: self.render(TRANSFER_TX),
            arguments: vec![
                json!({ "type": "Address", "value": to }),
                json!({ "type": "UFix64", "value": ufix64(amount) }),
            ],
        }
    }

    pub fn balance_script(&self, address: &str) -> CadenceCall {
        CadenceCall {
            script: self.render(BALANCE_SCRIPT),
            arguments: vec![json!({ "type": "Address", "value": address })],
        }
    }

    fn submit(&self, kind: &str, call: &CadenceCall) -> Result<String, RewardError> {
        tracing::debug!(
            kind,
            proposer = self.admin_address.as_deref().unwrap_or("(unset)"),
            arguments = %serde_json::Value::from(call.arguments.clone()),
            "Built Flow transaction"
        );
        Err(RewardError::Unsupported(format!(
            "{} transaction requires a signer, which is not configured",
            kind
        )))
    }

    /// Execute a read-only script and return the decoded JSON-Cadence value.
    async fn execute_script(&self, call: &CadenceCall) -> Result<serde_json::Value, RewardError> {
        let url = format!("{}/v1/scripts?block_height=sealed", self.access_node);
        let response = self
            .client
            .post(&url)
            .json(&call.to_request_body())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RewardError::Network(format!("Request timeout: {}", e))
                } else if e.is_connect() {
                    RewardError::Network(format!("Connection failed: {}", e))
                } else {
                    RewardError::Network(format!("Request failed: {}", e))
                }
            })?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(RewardError::from_status(status.as_u16(), body));
        }

        decode_script_response(&body)
    }
}

/// The access node answers with a JSON string holding base64 JSON-Cadence.
fn decode_script_response(body: &str) -> Result<serde_json::Value, RewardError> {
    let encoded: String = serde_json::from_str(body)
        .map_err(|e| RewardError::Parse(format!("expected base64 string: {}", e)))?;
    let raw = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| RewardError::Parse(format!("invalid base64: {}", e)))?;
    serde_json::from_slice(&raw).map_err(|e| RewardError::Parse(format!("invalid JSON-Cadence: {}", e)))
}

/// Read a `UFix64` JSON-Cadence value as a float.
fn parse_ufix64(value: &serde_json::Value) -> Result<f64, RewardError> {
    if value.get("type").and_then(|t| t.as_str()) != Some("UFix64") {
        return Err(RewardError::Parse(format!("expected UFix64, got {}", value)));
    }
    value
        .get("value")
        .and_then(|v| v.as_str())
        .and_then(|v| v.parse::<f64>().ok())
        .ok_or_else(|| RewardError::Parse(format!("invalid UFix64 value: {}", value)))
}

#[async_trait]
impl RewardDispatcher for FlowDispatcher {
    fn account_for(&self, user_id: &str) -> String {
        custodial_address(user_id)
    }

    async fn create_account(&self, user_id: &str) -> Result<String, RewardError> {
        // Custodial accounts are derived from the uid rather than created on chain.
        Ok(custodial_address(user_id))
    }

    async fn setup_receiving_vault(&self, address: &str) -> Result<String, RewardError> {
        Self::check_address(address)?;
        self.submit("setup_vault", &self.setup_vault_transaction())
    }

    async fn mint(&self, address: &str, amount: u64, reference: Uuid) -> Result<String, RewardError> {
        Self::check_address(address)?;
        self.submit("mint", &self.mint_transaction(address, amount, reference))
    }

    async fn get_balance(&self, address: &str) -> Result<f64, RewardError> {
        Self::check_address(address)?;
        let value = self.execute_script(&self.balance_script(address)).await?;
        parse_ufix64(&value)
    }

    async fn transfer(&self, from: &str, to: &str, amount: u64) -> Result<String, RewardError> {
        Self::check_address(from)?;
        Self::check_address(to)?;
        self.submit("transfer", &self.transfer_transaction(to, amount))
    }
}

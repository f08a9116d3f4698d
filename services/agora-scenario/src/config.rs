//! Scenario Configuration
//!
//! Describes the simulated network (requestor and provider nodes), market
//! settings, timeouts, payment amounts and logging. Loaded from config files
//! and `AGORA__` environment variables.

use std::path::Path;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use agora_market::{MarketConfig, ProviderConfig};
use agora_types::LinearPricing;

/// Scenario runner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioConfig {
    /// Nodes taking part in every scenario
    #[serde(default = "default_nodes")]
    pub nodes: Vec<NodeConfig>,

    /// Market network settings
    #[serde(default)]
    pub market: MarketConfig,

    /// Round-trip timeouts
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Requestor demand and workload
    #[serde(default)]
    pub workload: WorkloadConfig,

    /// Requestor funding
    #[serde(default)]
    pub payment: PaymentConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            nodes: default_nodes(),
            market: MarketConfig::default(),
            timeouts: TimeoutConfig::default(),
            workload: WorkloadConfig::default(),
            payment: PaymentConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeType {
    Requestor,
    #[serde(rename = "VM-Wasm-Provider", alias = "Provider")]
    Provider,
}

/// One node of the simulated network
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: String,

    #[serde(rename = "type")]
    pub node_type: NodeType,

    /// Route traffic through the relay proxy
    #[serde(rename = "use-proxy", default)]
    pub use_proxy: bool,

    /// Agreement slots (providers only)
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    #[serde(default = "default_true")]
    pub multi_activity: bool,

    #[serde(default = "default_max_simultaneous_activities")]
    pub max_simultaneous_activities: usize,

    #[serde(default = "default_runtime_name")]
    pub runtime_name: String,

    #[serde(default)]
    pub pricing: LinearPricing,
}

impl NodeConfig {
    pub fn requestor(name: &str) -> Self {
        Self::new(name, NodeType::Requestor)
    }

    pub fn provider(name: &str) -> Self {
        Self::new(name, NodeType::Provider)
    }

    fn new(name: &str, node_type: NodeType) -> Self {
        Self {
            name: name.to_string(),
            node_type,
            use_proxy: false,
            capacity: default_capacity(),
            multi_activity: true,
            max_simultaneous_activities: default_max_simultaneous_activities(),
            runtime_name: default_runtime_name(),
            pricing: LinearPricing::default(),
        }
    }

    /// Provider node settings for the market
    pub fn provider_config(&self) -> ProviderConfig {
        let mut config = ProviderConfig::new(self.name.as_str())
            .with_capacity(self.capacity)
            .with_multi_activity(self.multi_activity)
            .with_max_simultaneous_activities(self.max_simultaneous_activities)
            .with_pricing(self.pricing);
        config.runtime_name = self.runtime_name.clone();
        config.use_proxy = self.use_proxy;
        config
    }
}

/// Round-trip timeouts in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_negotiation_timeout")]
    pub negotiation_secs: u64,

    #[serde(default = "default_activity_timeout")]
    pub activity_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            negotiation_secs: default_negotiation_timeout(),
            activity_secs: default_activity_timeout(),
        }
    }
}

impl TimeoutConfig {
    pub fn negotiation(&self) -> Duration {
        Duration::from_secs(self.negotiation_secs)
    }

    pub fn activity(&self) -> Duration {
        Duration::from_secs(self.activity_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadConfig {
    /// Constraint expression of the requestor demand
    #[serde(default = "default_demand_constraints")]
    pub demand_constraints: String,

    /// Activity cycles per agreement in the multi-activity scenario
    #[serde(default = "default_cycles")]
    pub cycles: usize,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            demand_constraints: default_demand_constraints(),
            cycles: default_cycles(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentConfig {
    /// Funds credited to each requestor
    #[serde(default = "default_fund_amount")]
    pub fund_amount: Decimal,

    /// Allocation reserved before negotiating
    #[serde(default = "default_allocation_amount")]
    pub allocation_amount: Decimal,
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            fund_amount: default_fund_amount(),
            allocation_amount: default_allocation_amount(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// Default value functions
fn default_nodes() -> Vec<NodeConfig> {
    vec![
        NodeConfig::requestor("requestor"),
        NodeConfig::requestor("requestor-2"),
        NodeConfig::provider("provider-1"),
        NodeConfig::provider("provider-2"),
    ]
}

fn default_capacity() -> usize {
    1
}

fn default_true() -> bool {
    true
}

fn default_max_simultaneous_activities() -> usize {
    1
}

fn default_runtime_name() -> String {
    "wasmtime".to_string()
}

fn default_negotiation_timeout() -> u64 {
    30
}

fn default_activity_timeout() -> u64 {
    60
}

fn default_demand_constraints() -> String {
    "(&(golem.com.pricing.model=linear)(golem.srv.caps.multi-activity=true)(golem.runtime.name=wasmtime))".to_string()
}

fn default_cycles() -> usize {
    3
}

fn default_fund_amount() -> Decimal {
    Decimal::new(100, 0)
}

fn default_allocation_amount() -> Decimal {
    Decimal::new(10, 0)
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl ScenarioConfig {
    /// Load configuration from file and environment
    pub fn load(config_path: Option<&str>) -> anyhow::Result<Self> {
        // Load .env file if present
        let _ = dotenvy::dotenv();

        Self::load_layered(Path::new("config"), config_path)
    }

    /// Layer `dir/default`, `dir/local`, the explicit file and `AGORA__`
    /// environment variables; later sources win
    fn load_layered(dir: &Path, config_path: Option<&str>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::File::from(dir.join("default")).required(false))
            .add_source(config::File::from(dir.join("local")).required(false));

        if let Some(path) = config_path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }

        // Environment variables with AGORA__ prefix
        builder = builder.add_source(
            config::Environment::with_prefix("AGORA")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        Ok(config.try_deserialize()?)
    }

    pub fn requestors(&self) -> impl Iterator<Item = &NodeConfig> {
        self.nodes
            .iter()
            .filter(|n| n.node_type == NodeType::Requestor)
    }

    pub fn providers(&self) -> impl Iterator<Item = &NodeConfig> {
        self.nodes
            .iter()
            .filter(|n| n.node_type == NodeType::Provider)
    }

    /// Reject configurations no scenario can run with
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.requestors().next().is_none() {
            anyhow::bail!("At least one Requestor node is required");
        }
        if self.providers().next().is_none() {
            anyhow::bail!("At least one provider node is required");
        }
        if let Some(node) = self.providers().find(|n| n.capacity == 0) {
            anyhow::bail!("Provider {} has zero agreement capacity", node.name);
        }
        if self.payment.allocation_amount > self.payment.fund_amount {
            anyhow::bail!(
                "Allocation amount {} exceeds funding {}",
                self.payment.allocation_amount,
                self.payment.fund_amount
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = ScenarioConfig::default();
        config.validate().unwrap();
        assert_eq!(config.requestors().count(), 2);
        assert_eq!(config.providers().count(), 2);
    }

    #[test]
    fn nodes_parse_from_yaml() {
        let yaml = r#"
nodes:
  - name: requestor
    type: Requestor
    use-proxy: true
  - name: provider-1
    type: VM-Wasm-Provider
    capacity: 2
"#;
        let config: ScenarioConfig = config::Config::builder()
            .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert!(config.nodes[0].use_proxy);
        assert_eq!(config.nodes[1].node_type, NodeType::Provider);
        let provider = config.nodes[1].provider_config();
        assert_eq!(provider.capacity, 2);
        assert!(provider.multi_activity);
        assert_eq!(config.workload.cycles, 3);
    }

    #[test]
    fn explicit_file_overrides_default_files() {
        let dir = std::env::temp_dir().join(format!("agora-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("default.yaml"),
            "workload:\n  cycles: 3\npayment:\n  fund_amount: 50\n",
        )
        .unwrap();
        let explicit = dir.join("nodes.yaml");
        std::fs::write(
            &explicit,
            r#"
nodes:
  - name: requestor
    type: Requestor
  - name: provider-1
    type: VM-Wasm-Provider
workload:
  cycles: 7
"#,
        )
        .unwrap();

        let config =
            ScenarioConfig::load_layered(&dir, Some(explicit.to_str().unwrap())).unwrap();
        std::fs::remove_dir_all(&dir).unwrap();

        assert_eq!(config.nodes.len(), 2);
        assert_eq!(config.workload.cycles, 7);
        // Keys the explicit file leaves out still come from the defaults
        assert_eq!(config.payment.fund_amount, Decimal::new(50, 0));
    }

    #[test]
    fn allocation_above_funding_is_rejected() {
        let mut config = ScenarioConfig::default();
        config.payment.allocation_amount = Decimal::new(1000, 0);
        assert!(config.validate().is_err());
    }
}

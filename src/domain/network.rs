use super::address::Address;
use std::collections::HashMap;

/// Delegation manager deployment shared by the supported networks.
pub const DELEGATION_MANAGER: &str = "0xdb9B1e94B5b69Df7e401DDbedE43491141047dB3";
/// ERC-4337 v0.7 entry point.
pub const ENTRY_POINT_V07: &str = "0x0000000071727De22E5E9d8BAf0edAc6f37da032";

const BUILTIN_NETWORKS: &[(u64, &str)] = &[
    (1, "ethereum"),
    (10, "optimism"),
    (137, "polygon"),
    (8453, "base"),
    (42161, "arbitrum"),
    (59144, "linea"),
    (84532, "base-sepolia"),
    (11155111, "sepolia"),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Network {
    pub chain_id: u64,
    pub name: String,
    pub delegation_manager: Address,
    pub entry_point: Address,
}

impl Network {
    pub fn new(chain_id: u64, name: impl Into<String>) -> Self {
        Self {
            chain_id,
            name: name.into(),
            delegation_manager: canonical(DELEGATION_MANAGER),
            entry_point: canonical(ENTRY_POINT_V07),
        }
    }

    /// Loose name comparison; callers send both `sepolia` and `Sepolia`.
    pub fn matches_name(&self, name: &str) -> bool {
        name.trim().is_empty() || self.name.eq_ignore_ascii_case(name.trim())
    }
}

fn canonical(raw: &str) -> Address {
    // Constants above are well-formed.
    Address::parse(raw).unwrap_or_else(|_| unreachable!("invalid built-in address {raw}"))
}

/// Chain configuration indexed by chain id, built once at startup.
#[derive(Debug, Clone, Default)]
pub struct NetworkRegistry {
    by_chain: HashMap<u64, Network>,
}

impl NetworkRegistry {
    pub fn builtin() -> Self {
        let mut registry = Self::default();
        for (chain_id, name) in BUILTIN_NETWORKS {
            registry.insert(Network::new(*chain_id, *name));
        }
        registry
    }

    pub fn insert(&mut self, network: Network) {
        self.by_chain.insert(network.chain_id, network);
    }

    pub fn get(&self, chain_id: u64) -> Option<&Network> {
        self.by_chain.get(&chain_id)
    }

    pub fn len(&self) -> usize {
        self.by_chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_chain.is_empty()
    }
}

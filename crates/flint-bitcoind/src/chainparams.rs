//! Per-network parameters for invoking the node's CLI tool.

/// How to reach the node for one Bitcoin network: the CLI binary plus the
/// network-selection argument it needs, if any.
///
/// The fields are public so embedders (and tests) can point `cli` at a
/// non-default binary.
#[derive(Debug, Clone)]
pub struct ChainParams {
    pub network: String,
    pub cli: String,
    pub cli_args: Option<String>,
}

impl ChainParams {
    /// Look up the parameters for a named network.
    pub fn for_network(name: &str) -> Option<ChainParams> {
        let (cli_args, known) = match name {
            "bitcoin" => (None, true),
            "testnet" => (Some("-testnet"), true),
            "signet" => (Some("-signet"), true),
            "regtest" => (Some("-regtest"), true),
            _ => (None, false),
        };
        if !known {
            return None;
        }
        Some(ChainParams {
            network: name.to_owned(),
            cli: "bitcoin-cli".to_owned(),
            cli_args: cli_args.map(str::to_owned),
        })
    }
}

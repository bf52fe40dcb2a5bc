/// Address and key encoding parameters for one Bitcoin-family chain.
///
/// Values are supplied by the caller and never mutated; the presets below
/// cover the chains the engine is exercised against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkParams {
    pub name: &'static str,
    /// Human-readable prefix for segwit addresses. `None` on chains without
    /// segwit, which makes every bech32 string invalid for them.
    pub bech32_hrp: Option<&'static str>,
    pub p2pkh_version: u8,
    pub p2sh_version: u8,
    pub wif_version: u8,
    pub message_prefix: &'static str,
}

pub const BITCOIN: NetworkParams = NetworkParams {
    name: "bitcoin",
    bech32_hrp: Some("bc"),
    p2pkh_version: 0x00,
    p2sh_version: 0x05,
    wif_version: 0x80,
    message_prefix: "\x18Bitcoin Signed Message:\n",
};

pub const BITCOIN_TESTNET: NetworkParams = NetworkParams {
    name: "testnet",
    bech32_hrp: Some("tb"),
    p2pkh_version: 0x6f,
    p2sh_version: 0xc4,
    wif_version: 0xef,
    message_prefix: "\x18Bitcoin Signed Message:\n",
};

pub const BITCOIN_SIGNET: NetworkParams = NetworkParams {
    name: "signet",
    ..BITCOIN_TESTNET
};

pub const BITCOIN_REGTEST: NetworkParams = NetworkParams {
    name: "regtest",
    bech32_hrp: Some("bcrt"),
    ..BITCOIN_TESTNET
};

pub const LITECOIN: NetworkParams = NetworkParams {
    name: "litecoin",
    bech32_hrp: Some("ltc"),
    p2pkh_version: 0x30,
    p2sh_version: 0x32,
    wif_version: 0xb0,
    message_prefix: "\x19Litecoin Signed Message:\n",
};

pub const DOGECOIN: NetworkParams = NetworkParams {
    name: "dogecoin",
    bech32_hrp: None,
    p2pkh_version: 0x1e,
    p2sh_version: 0x16,
    wif_version: 0x9e,
    message_prefix: "\x19Dogecoin Signed Message:\n",
};

pub const BITCOIN_CASH: NetworkParams = NetworkParams {
    name: "bitcoincash",
    bech32_hrp: None,
    ..BITCOIN
};

pub const BITCOIN_SV: NetworkParams = NetworkParams {
    name: "bitcoinsv",
    bech32_hrp: None,
    ..BITCOIN
};

const PRESETS: [NetworkParams; 8] = [
    BITCOIN,
    BITCOIN_TESTNET,
    BITCOIN_SIGNET,
    BITCOIN_REGTEST,
    LITECOIN,
    DOGECOIN,
    BITCOIN_CASH,
    BITCOIN_SV,
];

impl NetworkParams {
    /// Look up a preset by its name (`"bitcoin"`, `"testnet"`, `"litecoin"`, ...).
    pub fn from_name(name: &str) -> Option<NetworkParams> {
        let wanted = name.trim().to_ascii_lowercase();
        PRESETS.iter().copied().find(|p| p.name == wanted)
    }

    /// Whether native segwit and taproot addresses exist on this chain.
    pub fn supports_segwit(&self) -> bool {
        self.bech32_hrp.is_some()
    }
}

impl std::fmt::Display for NetworkParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name)
    }
}

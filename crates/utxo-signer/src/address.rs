use bech32::{segwit, Hrp};
use bitcoin::hashes::Hash;
use bitcoin::key::TweakedPublicKey;
use bitcoin::script::{Script, ScriptBuf};
use bitcoin::secp256k1::{PublicKey, SecretKey, XOnlyPublicKey};
use bitcoin::{PubkeyHash, ScriptHash, WPubkeyHash, WScriptHash};

use crate::crypto::hash160;
use crate::error::{Result, SignerError};
use crate::network::NetworkParams;
use crate::taproot;

/// The four spendable script families the signer understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressType {
    /// P2PKH.
    Legacy,
    /// P2SH wrapping a P2WPKH program.
    SegwitNested,
    /// Witness v0 (P2WPKH, or P2WSH for explicit scripts).
    SegwitNative,
    /// Witness v1 (P2TR).
    SegwitTaproot,
}

impl AddressType {
    /// Classify an explicit scriptPubKey.
    pub fn from_script(script: &Script) -> Result<AddressType> {
        if script.is_p2pkh() {
            Ok(AddressType::Legacy)
        } else if script.is_p2sh() {
            Ok(AddressType::SegwitNested)
        } else if script.is_p2wpkh() || script.is_p2wsh() {
            Ok(AddressType::SegwitNative)
        } else if script.is_p2tr() {
            Ok(AddressType::SegwitTaproot)
        } else {
            Err(SignerError::UnknownAddressType(format!(
                "unsupported script {}",
                hex::encode(script.as_bytes())
            )))
        }
    }

    /// Whether spends of this type carry a witness.
    pub fn is_segwit(self) -> bool {
        !matches!(self, AddressType::Legacy)
    }
}

impl std::fmt::Display for AddressType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AddressType::Legacy => write!(f, "legacy"),
            AddressType::SegwitNested => write!(f, "segwit_nested"),
            AddressType::SegwitNative => write!(f, "segwit_native"),
            AddressType::SegwitTaproot => write!(f, "segwit_taproot"),
        }
    }
}

/// Where an input's or output's script comes from: an address string that
/// must be decoded against the network, or a script given verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptSource {
    Address(String),
    Script(ScriptBuf),
}

impl ScriptSource {
    pub fn address(address: impl Into<String>) -> Self {
        ScriptSource::Address(address.into())
    }

    pub fn script_pubkey(&self, network: &NetworkParams) -> Result<ScriptBuf> {
        match self {
            ScriptSource::Address(address) => derive_script_pubkey(address, network),
            ScriptSource::Script(script) => Ok(script.clone()),
        }
    }

    pub fn address_type(&self, network: &NetworkParams) -> Result<AddressType> {
        match self {
            ScriptSource::Address(address) => classify(address, network),
            ScriptSource::Script(script) => AddressType::from_script(script),
        }
    }
}

/// Classify an address string for the given network.
pub fn classify(address: &str, network: &NetworkParams) -> Result<AddressType> {
    decode(address, network).map(|(address_type, _)| address_type)
}

/// Decode an address string into the scriptPubKey it pays to.
pub fn derive_script_pubkey(address: &str, network: &NetworkParams) -> Result<ScriptBuf> {
    decode(address, network).map(|(_, script)| script)
}

// Base58Check first, bech32/bech32m second.
fn decode(address: &str, network: &NetworkParams) -> Result<(AddressType, ScriptBuf)> {
    if let Ok(payload) = bs58::decode(address).with_check(None).into_vec() {
        return decode_base58_payload(&payload, network);
    }
    decode_segwit(address, network)
}

fn decode_base58_payload(
    payload: &[u8],
    network: &NetworkParams,
) -> Result<(AddressType, ScriptBuf)> {
    let (version, hash) = payload
        .split_first()
        .ok_or_else(|| SignerError::InvalidAddress("empty base58 payload".into()))?;
    let hash: [u8; 20] = hash.try_into().map_err(|_| {
        SignerError::InvalidAddress(format!("base58 payload has {} hash bytes", hash.len()))
    })?;

    if *version == network.p2pkh_version {
        let script = ScriptBuf::new_p2pkh(&PubkeyHash::from_byte_array(hash));
        Ok((AddressType::Legacy, script))
    } else if *version == network.p2sh_version {
        let script = ScriptBuf::new_p2sh(&ScriptHash::from_byte_array(hash));
        Ok((AddressType::SegwitNested, script))
    } else {
        Err(SignerError::InvalidAddress(format!(
            "version byte {version:#04x} does not belong to {network}"
        )))
    }
}

fn decode_segwit(address: &str, network: &NetworkParams) -> Result<(AddressType, ScriptBuf)> {
    let expected_hrp = network.bech32_hrp.ok_or_else(|| {
        SignerError::InvalidAddress(format!("{network} has no segwit addresses"))
    })?;

    let (hrp, version, program) = segwit::decode(address)
        .map_err(|e| SignerError::InvalidAddress(format!("failed to decode address: {e}")))?;

    if hrp.to_lowercase() != expected_hrp {
        return Err(SignerError::InvalidAddress(format!(
            "prefix {} does not match {network} ({expected_hrp})",
            hrp.to_lowercase()
        )));
    }

    match (version.to_u8(), program.len()) {
        (0, 20) => {
            let hash: [u8; 20] = program.as_slice().try_into().map_err(|_| {
                SignerError::InvalidAddress("bad witness v0 key hash".into())
            })?;
            let script = ScriptBuf::new_p2wpkh(&WPubkeyHash::from_byte_array(hash));
            Ok((AddressType::SegwitNative, script))
        }
        (0, 32) => {
            let hash: [u8; 32] = program.as_slice().try_into().map_err(|_| {
                SignerError::InvalidAddress("bad witness v0 script hash".into())
            })?;
            let script = ScriptBuf::new_p2wsh(&WScriptHash::from_byte_array(hash));
            Ok((AddressType::SegwitNative, script))
        }
        (1, 32) => {
            let output_key = XOnlyPublicKey::from_slice(&program).map_err(|e| {
                SignerError::InvalidAddress(format!("invalid taproot output key: {e}"))
            })?;
            let script =
                ScriptBuf::new_p2tr_tweaked(TweakedPublicKey::dangerous_assume_tweaked(output_key));
            Ok((AddressType::SegwitTaproot, script))
        }
        (v, len) => Err(SignerError::InvalidAddress(format!(
            "unsupported witness version {v} with {len}-byte program"
        ))),
    }
}

/// P2PKH address for a compressed public key.
pub fn p2pkh_address(public_key: &PublicKey, network: &NetworkParams) -> String {
    bs58::encode(hash160(&public_key.serialize()))
        .with_check_version(network.p2pkh_version)
        .into_string()
}

/// P2SH-P2WPKH address for a compressed public key.
pub fn p2sh_p2wpkh_address(public_key: &PublicKey, network: &NetworkParams) -> String {
    let redeem_script = p2wpkh_script(public_key);
    bs58::encode(hash160(redeem_script.as_bytes()))
        .with_check_version(network.p2sh_version)
        .into_string()
}

/// Native segwit (bech32) address for a compressed public key.
pub fn p2wpkh_address(public_key: &PublicKey, network: &NetworkParams) -> Result<String> {
    encode_segwit(network, segwit::VERSION_0, &hash160(&public_key.serialize()))
}

/// Key-path-only taproot (bech32m) address for an internal key.
pub fn p2tr_address(internal_key: &XOnlyPublicKey, network: &NetworkParams) -> Result<String> {
    let (output_key, _) = taproot::tweak_public_key(internal_key, None)?;
    encode_segwit(network, segwit::VERSION_1, &output_key.serialize())
}

/// Render a standard scriptPubKey back into its address string.
pub fn address_from_script(script: &Script, network: &NetworkParams) -> Result<String> {
    let bytes = script.as_bytes();
    if script.is_p2pkh() {
        Ok(bs58::encode(&bytes[3..23])
            .with_check_version(network.p2pkh_version)
            .into_string())
    } else if script.is_p2sh() {
        Ok(bs58::encode(&bytes[2..22])
            .with_check_version(network.p2sh_version)
            .into_string())
    } else if script.is_p2wpkh() || script.is_p2wsh() {
        encode_segwit(network, segwit::VERSION_0, &bytes[2..])
    } else if script.is_p2tr() {
        encode_segwit(network, segwit::VERSION_1, &bytes[2..])
    } else {
        Err(SignerError::UnknownAddressType(format!(
            "no address form for script {}",
            hex::encode(bytes)
        )))
    }
}

/// The P2WPKH program `OP_0 <hash160(pubkey)>`, also used as the nested
/// segwit redeem script.
pub fn p2wpkh_script(public_key: &PublicKey) -> ScriptBuf {
    ScriptBuf::new_p2wpkh(&WPubkeyHash::from_byte_array(hash160(&public_key.serialize())))
}

/// The scriptPubKey a given public key would own under `address_type`.
///
/// Taproot uses the key-path output key (empty Merkle root).
pub fn script_for_key(public_key: &PublicKey, address_type: AddressType) -> Result<ScriptBuf> {
    let hash = hash160(&public_key.serialize());
    match address_type {
        AddressType::Legacy => Ok(ScriptBuf::new_p2pkh(&PubkeyHash::from_byte_array(hash))),
        AddressType::SegwitNested => {
            let redeem = p2wpkh_script(public_key);
            Ok(ScriptBuf::new_p2sh(&ScriptHash::from_byte_array(hash160(
                redeem.as_bytes(),
            ))))
        }
        AddressType::SegwitNative => Ok(p2wpkh_script(public_key)),
        AddressType::SegwitTaproot => {
            let (internal, _) = public_key.x_only_public_key();
            let (output_key, _) = taproot::tweak_public_key(&internal, None)?;
            Ok(ScriptBuf::new_p2tr_tweaked(
                TweakedPublicKey::dangerous_assume_tweaked(output_key),
            ))
        }
    }
}

/// Decode a WIF private key, checking the network's WIF version byte.
///
/// Only compressed keys (34-byte payload) are accepted. The engine signs
/// with compressed public keys, which cannot satisfy outputs locked to an
/// uncompressed key.
pub fn decode_wif(wif: &str, network: &NetworkParams) -> Result<SecretKey> {
    let payload = zeroize::Zeroizing::new(
        bs58::decode(wif)
            .with_check(None)
            .into_vec()
            .map_err(|e| SignerError::InvalidPrivateKey(format!("failed to decode WIF: {e}")))?,
    );

    let key_bytes = match payload.len() {
        34 if payload[33] == 0x01 => &payload[1..33],
        33 => {
            return Err(SignerError::InvalidPrivateKey(
                "uncompressed WIF keys are not supported".into(),
            ))
        }
        n => {
            return Err(SignerError::InvalidPrivateKey(format!(
                "unexpected WIF payload length {n}"
            )))
        }
    };
    if payload[0] != network.wif_version {
        return Err(SignerError::InvalidPrivateKey(format!(
            "WIF version {:#04x} does not belong to {network}",
            payload[0]
        )));
    }

    SecretKey::from_slice(key_bytes)
        .map_err(|e| SignerError::InvalidPrivateKey(format!("invalid secret key: {e}")))
}

fn encode_segwit(network: &NetworkParams, version: bech32::Fe32, program: &[u8]) -> Result<String> {
    let hrp = network.bech32_hrp.ok_or_else(|| {
        SignerError::InvalidAddress(format!("{network} has no segwit addresses"))
    })?;
    let hrp = Hrp::parse(hrp)
        .map_err(|e| SignerError::InvalidAddress(format!("invalid prefix {hrp}: {e}")))?;
    segwit::encode(hrp, version, program)
        .map_err(|e| SignerError::InvalidAddress(format!("failed to encode address: {e}")))
}

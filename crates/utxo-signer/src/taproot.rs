//! BIP-341 key tweaking.
//!
//! Key-path spends commit to an empty Merkle root; script-path commitments
//! pass the script tree's root, so the same internal key yields a different
//! output key for each.

use bitcoin::hashes::Hash;
use bitcoin::key::TweakedPublicKey;
use bitcoin::script::ScriptBuf;
use bitcoin::secp256k1::{Parity, Scalar, SecretKey, XOnlyPublicKey};
use bitcoin::taproot::{ControlBlock, LeafVersion, TapNodeHash, TaprootBuilder};

use crate::crypto::{secp, tagged_hash};
use crate::error::{Result, SignerError};

/// TaggedHash("TapTweak", x(P) || merkle_root).
pub fn tap_tweak_hash(internal_key: &XOnlyPublicKey, merkle_root: Option<&[u8; 32]>) -> [u8; 32] {
    let mut msg = Vec::with_capacity(64);
    msg.extend_from_slice(&internal_key.serialize());
    if let Some(root) = merkle_root {
        msg.extend_from_slice(root);
    }
    tagged_hash("TapTweak", &msg)
}

fn tweak_scalar(internal_key: &XOnlyPublicKey, merkle_root: Option<&[u8; 32]>) -> Result<Scalar> {
    Scalar::from_be_bytes(tap_tweak_hash(internal_key, merkle_root))
        .map_err(|_| SignerError::InvalidTweak)
}

/// Tweak a private key for a taproot spend.
///
/// The secret is first normalised so its public point has even y, then the
/// tweak scalar is added mod n.
pub fn tweak_private_key(key: &SecretKey, merkle_root: Option<&[u8; 32]>) -> Result<SecretKey> {
    let secp = secp();
    let (internal_key, parity) = key.x_only_public_key(&secp);
    let even_key = match parity {
        Parity::Odd => key.negate(),
        Parity::Even => *key,
    };
    let tweak = tweak_scalar(&internal_key, merkle_root)?;
    even_key
        .add_tweak(&tweak)
        .map_err(|_| SignerError::InvalidTweak)
}

/// Tweak an x-only internal key, returning the output key and the parity of
/// its full point.
pub fn tweak_public_key(
    internal_key: &XOnlyPublicKey,
    merkle_root: Option<&[u8; 32]>,
) -> Result<(XOnlyPublicKey, Parity)> {
    let tweak = tweak_scalar(internal_key, merkle_root)?;
    internal_key
        .add_tweak(&secp(), &tweak)
        .map_err(|_| SignerError::InvalidTweak)
}

/// A computed taproot commitment for one internal key and Merkle root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaprootTweak {
    pub internal_key: XOnlyPublicKey,
    pub merkle_root: Option<[u8; 32]>,
    pub output_key: XOnlyPublicKey,
    pub parity: Parity,
}

impl TaprootTweak {
    pub fn new(internal_key: XOnlyPublicKey, merkle_root: Option<[u8; 32]>) -> Result<Self> {
        let (output_key, parity) = tweak_public_key(&internal_key, merkle_root.as_ref())?;
        Ok(TaprootTweak {
            internal_key,
            merkle_root,
            output_key,
            parity,
        })
    }

    pub fn script_pubkey(&self) -> ScriptBuf {
        ScriptBuf::new_p2tr_tweaked(TweakedPublicKey::dangerous_assume_tweaked(self.output_key))
    }
}

/// Spend data for a script tree holding exactly one tapscript leaf.
#[derive(Debug, Clone)]
pub struct SingleLeafTree {
    pub leaf_script: ScriptBuf,
    pub merkle_root: TapNodeHash,
    pub tweak: TaprootTweak,
    pub control_block: ControlBlock,
}

impl SingleLeafTree {
    pub fn script_pubkey(&self) -> ScriptBuf {
        self.tweak.script_pubkey()
    }
}

/// Commit `leaf_script` under `internal_key` as the only leaf of the tree.
pub fn single_leaf_tree(
    internal_key: &XOnlyPublicKey,
    leaf_script: &ScriptBuf,
) -> Result<SingleLeafTree> {
    let spend_info = TaprootBuilder::new()
        .add_leaf(0, leaf_script.clone())
        .map_err(|e| SignerError::InvalidInput(format!("failed to build taproot tree: {e}")))?
        .finalize(&secp(), *internal_key)
        .map_err(|_| SignerError::InvalidInput("failed to finalize taproot tree".into()))?;

    let merkle_root = spend_info
        .merkle_root()
        .ok_or_else(|| SignerError::InvalidInput("taproot tree has no merkle root".into()))?;
    let control_block = spend_info
        .control_block(&(leaf_script.clone(), LeafVersion::TapScript))
        .ok_or_else(|| SignerError::InvalidInput("leaf missing from taproot tree".into()))?;

    let tweak = TaprootTweak::new(*internal_key, Some(merkle_root.to_byte_array()))?;
    if tweak.output_key != spend_info.output_key().to_x_only_public_key() {
        return Err(SignerError::InvalidTweak);
    }

    Ok(SingleLeafTree {
        leaf_script: leaf_script.clone(),
        merkle_root,
        tweak,
        control_block,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::opcodes::all::OP_CHECKSIG;
    use bitcoin::script::Builder;

    fn keys() -> Vec<SecretKey> {
        [[0x01u8; 32], [0x42; 32], [0xcd; 32], [0x7f; 32], [0x03; 32]]
            .iter()
            .map(|b| SecretKey::from_slice(b).unwrap())
            .collect()
    }

    #[test]
    fn private_and_public_tweaks_agree_without_merkle_root() {
        let secp = secp();
        for key in keys() {
            let (xonly, _) = key.x_only_public_key(&secp);
            let tweaked = tweak_private_key(&key, None).unwrap();
            let (expected, parity) = tweak_public_key(&xonly, None).unwrap();
            let (actual, actual_parity) = tweaked.x_only_public_key(&secp);
            assert_eq!(actual, expected);
            assert_eq!(actual_parity, parity);
        }
    }

    #[test]
    fn private_and_public_tweaks_agree_with_merkle_root() {
        let secp = secp();
        let root = [0x5a; 32];
        for key in keys() {
            let (xonly, _) = key.x_only_public_key(&secp);
            let tweaked = tweak_private_key(&key, Some(&root)).unwrap();
            let (expected, _) = tweak_public_key(&xonly, Some(&root)).unwrap();
            assert_eq!(tweaked.x_only_public_key(&secp).0, expected);
        }
    }

    #[test]
    fn output_key_matches_bitcoin_p2tr_script() {
        let secp = secp();
        let root = [0x33; 32];
        for key in keys() {
            let (xonly, _) = key.x_only_public_key(&secp);

            let key_path = TaprootTweak::new(xonly, None).unwrap();
            assert_eq!(key_path.script_pubkey(), ScriptBuf::new_p2tr(&secp, xonly, None));

            let script_path = TaprootTweak::new(xonly, Some(root)).unwrap();
            let expected =
                ScriptBuf::new_p2tr(&secp, xonly, Some(TapNodeHash::from_byte_array(root)));
            assert_eq!(script_path.script_pubkey(), expected);
        }
    }

    #[test]
    fn merkle_root_changes_the_output_key() {
        let secp = secp();
        let (xonly, _) = keys()[0].x_only_public_key(&secp);
        let key_path = tweak_public_key(&xonly, None).unwrap().0;
        let script_path = tweak_public_key(&xonly, Some(&[0u8; 32])).unwrap().0;
        assert_ne!(key_path, script_path);
        assert_ne!(key_path, xonly);
    }

    #[test]
    fn odd_y_keys_are_normalised() {
        let secp = secp();
        let odd = (1u8..=64)
            .map(|b| SecretKey::from_slice(&[b; 32]).unwrap())
            .find(|k| k.x_only_public_key(&secp).1 == Parity::Odd)
            .unwrap();
        let negated = odd.negate();
        assert_eq!(
            tweak_private_key(&odd, None).unwrap(),
            tweak_private_key(&negated, None).unwrap()
        );
    }

    #[test]
    fn single_leaf_tree_control_block_verifies() {
        let secp = secp();
        let (xonly, _) = keys()[1].x_only_public_key(&secp);
        let leaf = Builder::new()
            .push_x_only_key(&xonly)
            .push_opcode(OP_CHECKSIG)
            .into_script();

        let tree = single_leaf_tree(&xonly, &leaf).unwrap();
        assert_eq!(tree.tweak.internal_key, xonly);
        assert_eq!(tree.control_block.internal_key, xonly);
        assert!(tree.control_block.verify_taproot_commitment(
            &secp,
            tree.tweak.output_key,
            &leaf
        ));
        assert!(tree.script_pubkey().is_p2tr());
    }
}

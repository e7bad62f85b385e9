//! Address derivation from output scripts.
//!
//! Standard templates go through `bitcoin::Address::from_script`.
//! Pay-to-pubkey and bare multisig outputs have no address of their own and
//! are indexed under the P2PKH address of each public key.

use bitcoin::opcodes::all::{OP_CHECKMULTISIG, OP_PUSHNUM_1, OP_PUSHNUM_16};
use bitcoin::script::Instruction;
use bitcoin::{Address, PublicKey, Script};

use crate::constants::NetworkType;

/// Derive the address strings an output script pays to.
///
/// Null-data and non-standard scripts derive nothing. Duplicates (a
/// multisig listing the same key twice) are collapsed.
pub fn script_addresses(script: &Script, network: NetworkType) -> Vec<String> {
    let network = network.to_bitcoin();
    if let Ok(address) = Address::from_script(script, network) {
        return vec![address.to_string()];
    }

    let keys = match script.p2pk_public_key() {
        Some(key) => vec![key],
        None => multisig_keys(script).unwrap_or_default(),
    };
    let mut out: Vec<String> = Vec::with_capacity(keys.len());
    for key in keys {
        let address = Address::p2pkh(key.pubkey_hash(), network).to_string();
        if !out.contains(&address) {
            out.push(address);
        }
    }
    out
}

/// Keys of an `m <keys...> n OP_CHECKMULTISIG` script with `n` matching
/// the number of keys pushed.
fn multisig_keys(script: &Script) -> Option<Vec<PublicKey>> {
    let instructions = script.instructions().collect::<Result<Vec<_>, _>>().ok()?;
    let (first, rest) = instructions.split_first()?;
    let (last, rest) = rest.split_last()?;
    let (count, pushes) = rest.split_last()?;

    let required = small_int(first)?;
    let total = small_int(count)?;
    if *last != Instruction::Op(OP_CHECKMULTISIG) || required > total || pushes.len() != total {
        return None;
    }
    pushes
        .iter()
        .map(|push| match push {
            Instruction::PushBytes(bytes) => PublicKey::from_slice(bytes.as_bytes()).ok(),
            Instruction::Op(_) => None,
        })
        .collect()
}

fn small_int(instruction: &Instruction<'_>) -> Option<usize> {
    let Instruction::Op(op) = instruction else {
        return None;
    };
    let code = op.to_u8();
    (OP_PUSHNUM_1.to_u8()..=OP_PUSHNUM_16.to_u8())
        .contains(&code)
        .then(|| usize::from(code - OP_PUSHNUM_1.to_u8()) + 1)
}

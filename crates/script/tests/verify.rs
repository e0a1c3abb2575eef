use pivxd_primitives::hash::hash160;
use pivxd_primitives::outpoint::OutPoint;
use pivxd_primitives::transaction::{Transaction, TxIn, TxOut};
use pivxd_script::interpreter::{
    verify_script, ScriptError, TransactionSignatureChecker, MANDATORY_SCRIPT_VERIFY_FLAGS,
    SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY, STANDARD_SCRIPT_VERIFY_FLAGS,
};
use pivxd_script::opcodes::{
    push_data, push_int, OP_CHECKLOCKTIMEVERIFY, OP_CHECKSIG, OP_DROP, OP_DUP, OP_EQUAL,
    OP_EQUALVERIFY, OP_HASH160,
};
use pivxd_script::sighash::{signature_hash, SighashType, SIGHASH_ALL};
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};

fn key() -> (SecretKey, Vec<u8>) {
    let secp = Secp256k1::new();
    let secret = SecretKey::from_slice(&[0x42; 32]).expect("secret key");
    let public = PublicKey::from_secret_key(&secp, &secret);
    (secret, public.serialize().to_vec())
}

fn p2pkh(pubkey: &[u8]) -> Vec<u8> {
    let mut script = vec![OP_DUP, OP_HASH160, 0x14];
    script.extend_from_slice(&hash160(pubkey));
    script.extend_from_slice(&[OP_EQUALVERIFY, OP_CHECKSIG]);
    script
}

fn spending_tx() -> Transaction {
    Transaction {
        vin: vec![TxIn {
            prevout: OutPoint {
                hash: [7u8; 32],
                index: 1,
            },
            script_sig: Vec::new(),
            sequence: u32::MAX,
        }],
        vout: vec![TxOut {
            value: 1_000,
            script_pubkey: vec![0x51],
        }],
        ..Transaction::default()
    }
}

fn sign(tx: &Transaction, script_code: &[u8], secret: &SecretKey) -> Vec<u8> {
    let secp = Secp256k1::new();
    let digest = signature_hash(tx, 0, script_code, SighashType(SIGHASH_ALL));
    let signature = secp.sign_ecdsa(&Message::from_digest(digest), secret);
    let mut bytes = signature.serialize_der().to_vec();
    bytes.push(SIGHASH_ALL as u8);
    bytes
}

#[test]
fn p2pkh_spend_verifies_under_standard_flags() {
    let (secret, pubkey) = key();
    let script_pubkey = p2pkh(&pubkey);
    let mut tx = spending_tx();
    let signature = sign(&tx, &script_pubkey, &secret);
    let mut script_sig = Vec::new();
    push_data(&mut script_sig, &signature);
    push_data(&mut script_sig, &pubkey);
    tx.vin[0].script_sig = script_sig.clone();

    let checker = TransactionSignatureChecker::new(&tx, 0);
    verify_script(&script_sig, &script_pubkey, STANDARD_SCRIPT_VERIFY_FLAGS, &checker)
        .expect("valid spend");

    // Changing an output invalidates the signature.
    let mut tampered = tx.clone();
    tampered.vout[0].value += 1;
    let checker = TransactionSignatureChecker::new(&tampered, 0);
    assert_eq!(
        verify_script(&script_sig, &script_pubkey, MANDATORY_SCRIPT_VERIFY_FLAGS, &checker),
        Err(ScriptError::EvalFalse)
    );
}

#[test]
fn p2sh_wrapped_checksig() {
    let (secret, pubkey) = key();
    let mut redeem = Vec::new();
    push_data(&mut redeem, &pubkey);
    redeem.push(OP_CHECKSIG);
    let mut script_pubkey = vec![OP_HASH160, 0x14];
    script_pubkey.extend_from_slice(&hash160(&redeem));
    script_pubkey.push(OP_EQUAL);

    let tx = spending_tx();
    let signature = sign(&tx, &redeem, &secret);
    let mut script_sig = Vec::new();
    push_data(&mut script_sig, &signature);
    push_data(&mut script_sig, &redeem);

    let checker = TransactionSignatureChecker::new(&tx, 0);
    verify_script(&script_sig, &script_pubkey, MANDATORY_SCRIPT_VERIFY_FLAGS, &checker)
        .expect("p2sh spend");

    // The hash commitment still matches; the redeem script itself fails.
    let mut bad_sig = Vec::new();
    push_data(&mut bad_sig, &[0x30, 0x01]);
    push_data(&mut bad_sig, &redeem);
    assert_eq!(
        verify_script(&bad_sig, &script_pubkey, MANDATORY_SCRIPT_VERIFY_FLAGS, &checker),
        Err(ScriptError::EvalFalse)
    );
}

#[test]
fn checklocktimeverify_compares_against_tx_lock_time() {
    let mut script_pubkey = Vec::new();
    push_int(&mut script_pubkey, 100);
    script_pubkey.extend_from_slice(&[OP_CHECKLOCKTIMEVERIFY, OP_DROP, 0x51]);

    let mut tx = spending_tx();
    tx.vin[0].sequence = 0;
    tx.lock_time = 99;
    let checker = TransactionSignatureChecker::new(&tx, 0);
    assert_eq!(
        verify_script(&[], &script_pubkey, SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY, &checker),
        Err(ScriptError::UnsatisfiedLockTime)
    );
    // Treated as a NOP without the flag.
    assert!(verify_script(&[], &script_pubkey, 0, &checker).is_ok());

    tx.lock_time = 100;
    let checker = TransactionSignatureChecker::new(&tx, 0);
    assert!(
        verify_script(&[], &script_pubkey, SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY, &checker).is_ok()
    );
}

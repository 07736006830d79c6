//! Integration tests for the chain state engine: genesis bootstrap, block
//! admission, the dynamic signatory set and the full re-verification pass.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use daisy_node::block;
use daisy_node::chain::{self, Chain, ChainError};
use daisy_node::chainparams::ChainParams;
use daisy_node::cli;
use daisy_node::config::Config;
use daisy_node::crypto::{self, Keypair};
use daisy_node::db;

static UNIQUE: AtomicU64 = AtomicU64::new(0);

/// Create a brand new chain in a temp dir and return the reopened engine.
fn new_test_chain() -> (tempfile::TempDir, Chain, ChainParams) {
    let dir = tempfile::tempdir().expect("temp dir");
    let data_dir = dir.path().join("data");
    let cfg = Config {
        data_dir: data_dir.to_str().unwrap().to_string(),
        ..Config::default()
    };

    let params_file = dir.path().join("newchain.json");
    std::fs::write(
        &params_file,
        r#"{
            "genesis_block_hash": "",
            "genesis_block_hash_signature": "",
            "genesis_block_timestamp": "",
            "creator": "Test Creator",
            "creator_public_key": "",
            "bootstrap_peers": [],
            "description": "test chain"
        }"#,
    )
    .unwrap();
    cli::new_chain(&cfg, params_file.to_str().unwrap()).expect("newchain");

    // Reopen everything the way a normal start would
    let params =
        ChainParams::load(&data_dir.join("chainparams.json")).expect("written chainparams");
    let (main_db, private_db) = db::init(cfg.data_dir.as_str(), &params.bootstrap_peers).unwrap();
    let chain = Chain::new(main_db, private_db, params.clone(), &cfg.data_dir);
    chain.init().expect("init over existing chain");
    (dir, chain, params)
}

/// Write a small unique payload so every authored block hashes differently.
fn write_payload(conn: &rusqlite::Connection) {
    let tag = format!(
        "payload-{}-{}",
        std::process::id(),
        UNIQUE.fetch_add(1, Ordering::Relaxed)
    );
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS products (id INTEGER PRIMARY KEY, name VARCHAR)",
    )
    .unwrap();
    conn.execute("INSERT INTO products (name) VALUES (?1)", rusqlite::params![tag])
        .unwrap();
}

/// A keypair that exists nowhere in the node's stores until some block
/// introduces it.
fn foreign_keypair() -> Keypair {
    let main = db::open_memory().unwrap();
    let private = db::open_memory_private().unwrap();
    crypto::generate_keypair(&main, &private, -1).unwrap()
}

struct KeyOpGroup<'a> {
    op: &'a str,
    target: &'a Keypair,
    signers: Vec<&'a Keypair>,
}

/// Author a complete block file: payload, metadata, signatures and key
/// ops. Returns the path and the detached hash signature.
fn author_block(
    dir: &Path,
    signer: &Keypair,
    prev_hash: &str,
    key_ops: &[KeyOpGroup],
) -> (PathBuf, Vec<u8>) {
    let path = dir.join(format!(
        "candidate-{}.db",
        UNIQUE.fetch_add(1, Ordering::Relaxed)
    ));
    let conn = block::open_for_authoring(&path).unwrap();
    block::ensure_block_tables(&conn).unwrap();
    write_payload(&conn);

    block::set_meta(&conn, block::META_VERSION, &block::CURRENT_BLOCK_VERSION.to_string())
        .unwrap();
    block::set_meta(&conn, block::META_PREVIOUS_BLOCK_HASH, prev_hash).unwrap();
    let prev_sig = signer.sign_hex(prev_hash).unwrap();
    block::set_meta(&conn, block::META_PREVIOUS_BLOCK_HASH_SIGNATURE, &prev_sig).unwrap();
    block::set_meta(&conn, block::META_TIMESTAMP, &chrono::Utc::now().to_rfc2822()).unwrap();
    block::set_meta(&conn, block::META_CREATOR_PUBLIC_KEY, &signer.public_key_hash).unwrap();

    for group in key_ops {
        let target_der = group.target.public_key_der().unwrap();
        for op_signer in &group.signers {
            let signature = op_signer.sign_key_hash(&group.target.public_key_hash).unwrap();
            block::insert_key_op(
                &conn,
                group.op,
                &group.target.public_key_hash,
                &target_der,
                &op_signer.public_key_hash,
                &signature,
                None,
            )
            .unwrap();
        }
    }
    drop(conn);

    let hash = block::hash_file_hex(&path).unwrap();
    let hash_signature = hex::decode(signer.sign_hex(&hash).unwrap()).unwrap();
    (path, hash_signature)
}

fn tip_hash(chain: &Chain) -> String {
    let conn = db::lock(&chain.main_db).unwrap();
    chain::index::hash_by_height(&conn, chain::index::height(&conn).unwrap())
        .unwrap()
        .unwrap()
}

#[test]
fn fresh_genesis_initializes_the_chain() {
    let (_dir, chain, params) = new_test_chain();

    assert_eq!(chain.height().unwrap(), 0);
    let conn = db::lock(&chain.main_db).unwrap();
    assert_eq!(
        chain::index::hash_by_height(&conn, 0).unwrap().unwrap(),
        params.genesis_block_hash
    );
    let creator = chain::keyring::get_public_key(&conn, &params.creator_public_key)
        .unwrap()
        .expect("creator key accepted");
    assert!(!creator.is_revoked());

    let record = chain::index::block_by_height(&conn, 0).unwrap().unwrap();
    assert_eq!(
        record.previous_block_hash,
        chain::GENESIS_PREVIOUS_BLOCK_HASH
    );
    assert_eq!(record.signatory_key_hash, params.creator_public_key);
}

#[test]
fn sign_import_extends_the_chain() {
    let (dir, chain, _params) = new_test_chain();

    let payload_file = dir.path().join("next.db");
    let conn = rusqlite::Connection::open(&payload_file).unwrap();
    write_payload(&conn);
    drop(conn);

    let height = cli::sign_import_block(&chain, payload_file.to_str().unwrap()).unwrap();
    assert_eq!(height, 1);
    assert_eq!(chain.height().unwrap(), 1);

    // The copied chain file must hash to the recorded value
    let stored = chain.block_filename(1);
    let file_hash = block::hash_file_hex(&stored).unwrap();
    let conn = db::lock(&chain.main_db).unwrap();
    assert_eq!(
        chain::index::hash_by_height(&conn, 1).unwrap().unwrap(),
        file_hash
    );
    drop(conn);

    chain.verify_everything().expect("chain verifies after import");
}

#[test]
fn orphan_block_is_rejected() {
    let (dir, chain, _params) = new_test_chain();
    let signer = crypto::load_keypair(&chain.main_db, &chain.private_db).unwrap();

    let bogus_prev = "f".repeat(64);
    let (path, sig) = author_block(dir.path(), &signer, &bogus_prev, &[]);
    let err = chain.accept_block(&path, &sig).unwrap_err();
    assert!(matches!(err, ChainError::OrphanBlock(_)));
    assert_eq!(chain.height().unwrap(), 0);
}

#[test]
fn replacement_of_an_existing_height_is_rejected() {
    let (dir, chain, _params) = new_test_chain();
    let signer = crypto::load_keypair(&chain.main_db, &chain.private_db).unwrap();
    let genesis_hash = tip_hash(&chain);

    let (first, first_sig) = author_block(dir.path(), &signer, &genesis_hash, &[]);
    let (second, second_sig) = author_block(dir.path(), &signer, &genesis_hash, &[]);

    assert_eq!(chain.accept_block(&first, &first_sig).unwrap(), 1);
    let err = chain.accept_block(&second, &second_sig).unwrap_err();
    assert!(matches!(err, ChainError::ReplacementUnsupported(1)));
    assert_eq!(chain.height().unwrap(), 1);
}

#[test]
fn unknown_signer_is_rejected() {
    let (dir, chain, _params) = new_test_chain();
    let stranger = foreign_keypair();

    let (path, sig) = author_block(dir.path(), &stranger, &tip_hash(&chain), &[]);
    let err = chain.accept_block(&path, &sig).unwrap_err();
    assert!(matches!(err, ChainError::UnknownSigner(_)));
}

#[test]
fn tampered_hash_signature_is_rejected() {
    let (dir, chain, _params) = new_test_chain();
    let signer = crypto::load_keypair(&chain.main_db, &chain.private_db).unwrap();

    let (path, _sig) = author_block(dir.path(), &signer, &tip_hash(&chain), &[]);
    // Signature over a different digest
    let wrong_sig = hex::decode(signer.sign_hex(&"e".repeat(64)).unwrap()).unwrap();
    let err = chain.accept_block(&path, &wrong_sig).unwrap_err();
    assert!(matches!(err, ChainError::Signature { .. }));
    assert_eq!(chain.height().unwrap(), 0);
}

#[test]
fn added_signatory_signs_later_blocks_until_revoked() {
    let (dir, chain, _params) = new_test_chain();
    let genesis_key = crypto::load_keypair(&chain.main_db, &chain.private_db).unwrap();
    let new_key = foreign_keypair();

    // Height 1 adds the new signatory, vouched by the genesis key
    let (path, sig) = author_block(
        dir.path(),
        &genesis_key,
        &tip_hash(&chain),
        &[KeyOpGroup {
            op: block::KEY_OP_ADD,
            target: &new_key,
            signers: vec![&genesis_key],
        }],
    );
    assert_eq!(chain.accept_block(&path, &sig).unwrap(), 1);
    {
        let conn = db::lock(&chain.main_db).unwrap();
        let record = chain::keyring::get_public_key(&conn, &new_key.public_key_hash)
            .unwrap()
            .unwrap();
        assert_eq!(record.added_at_height, 1);
    }

    // Height 2 can be created by the new signatory
    let (path, sig) = author_block(dir.path(), &new_key, &tip_hash(&chain), &[]);
    assert_eq!(chain.accept_block(&path, &sig).unwrap(), 2);

    // Height 3 revokes it
    let (path, sig) = author_block(
        dir.path(),
        &genesis_key,
        &tip_hash(&chain),
        &[KeyOpGroup {
            op: block::KEY_OP_REVOKE,
            target: &new_key,
            signers: vec![&genesis_key],
        }],
    );
    assert_eq!(chain.accept_block(&path, &sig).unwrap(), 3);

    // The revoked key can no longer extend the chain
    let (path, sig) = author_block(dir.path(), &new_key, &tip_hash(&chain), &[]);
    let err = chain.accept_block(&path, &sig).unwrap_err();
    assert!(matches!(err, ChainError::RevokedSigner(_)));
    assert_eq!(chain.height().unwrap(), 3);

    // Historical blocks signed by the key before its revocation still verify
    chain.verify_everything().expect("as-of-height verification");
}

#[test]
fn adding_an_existing_key_is_rejected() {
    let (dir, chain, _params) = new_test_chain();
    let genesis_key = crypto::load_keypair(&chain.main_db, &chain.private_db).unwrap();

    let (path, sig) = author_block(
        dir.path(),
        &genesis_key,
        &tip_hash(&chain),
        &[KeyOpGroup {
            op: block::KEY_OP_ADD,
            target: &genesis_key,
            signers: vec![&genesis_key],
        }],
    );
    let err = chain.accept_block(&path, &sig).unwrap_err();
    assert!(matches!(err, ChainError::DuplicateAdd(_)));
    assert_eq!(chain.height().unwrap(), 0);
}

#[test]
fn revoking_an_unknown_key_is_rejected() {
    let (dir, chain, _params) = new_test_chain();
    let genesis_key = crypto::load_keypair(&chain.main_db, &chain.private_db).unwrap();
    let stranger = foreign_keypair();

    let (path, sig) = author_block(
        dir.path(),
        &genesis_key,
        &tip_hash(&chain),
        &[KeyOpGroup {
            op: block::KEY_OP_REVOKE,
            target: &stranger,
            signers: vec![&genesis_key],
        }],
    );
    let err = chain.accept_block(&path, &sig).unwrap_err();
    assert!(matches!(err, ChainError::RevokeMissing(_)));
}

#[test]
fn a_key_cannot_vouch_for_its_own_addition() {
    let (dir, chain, _params) = new_test_chain();
    let genesis_key = crypto::load_keypair(&chain.main_db, &chain.private_db).unwrap();
    let new_key = foreign_keypair();

    // The only signature on the add comes from the key being added
    let (path, sig) = author_block(
        dir.path(),
        &genesis_key,
        &tip_hash(&chain),
        &[KeyOpGroup {
            op: block::KEY_OP_ADD,
            target: &new_key,
            signers: vec![&new_key],
        }],
    );
    let err = chain.accept_block(&path, &sig).unwrap_err();
    assert!(matches!(err, ChainError::UnknownSigner(_)));
    assert_eq!(chain.height().unwrap(), 0);
}

#[test]
fn rejected_block_leaves_no_ledger_trace() {
    let (dir, chain, _params) = new_test_chain();
    let genesis_key = crypto::load_keypair(&chain.main_db, &chain.private_db).unwrap();
    let new_key = foreign_keypair();

    // Valid add of new_key plus an invalid duplicate add of the genesis
    // key: the whole block must be rolled back, including new_key.
    let (path, sig) = author_block(
        dir.path(),
        &genesis_key,
        &tip_hash(&chain),
        &[
            KeyOpGroup {
                op: block::KEY_OP_ADD,
                target: &new_key,
                signers: vec![&genesis_key],
            },
            KeyOpGroup {
                op: block::KEY_OP_ADD,
                target: &genesis_key,
                signers: vec![&genesis_key],
            },
        ],
    );
    let err = chain.accept_block(&path, &sig).unwrap_err();
    assert!(matches!(err, ChainError::DuplicateAdd(_)));

    let conn = db::lock(&chain.main_db).unwrap();
    assert!(
        chain::keyring::get_public_key(&conn, &new_key.public_key_hash)
            .unwrap()
            .is_none(),
        "rolled-back key op must not persist"
    );
}

#[test]
fn verification_detects_a_tampered_block_file() {
    let (dir, chain, _params) = new_test_chain();
    let signer = crypto::load_keypair(&chain.main_db, &chain.private_db).unwrap();

    let (path, sig) = author_block(dir.path(), &signer, &tip_hash(&chain), &[]);
    assert_eq!(chain.accept_block(&path, &sig).unwrap(), 1);
    chain.verify_everything().unwrap();

    // Flip payload bytes in the stored chain file
    let stored = chain.block_filename(1);
    let mut bytes = std::fs::read(&stored).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    std::fs::write(&stored, bytes).unwrap();

    let err = chain.verify_everything().unwrap_err();
    assert!(matches!(err, ChainError::HashMismatch { height: 1, .. }));
}

#[test]
fn wrong_chain_data_dir_is_refused() {
    let (_dir, chain, params) = new_test_chain();

    let mut other = params.clone();
    other.genesis_block_hash = "0".repeat(64);
    let other_chain = Chain::new(
        chain.main_db.clone(),
        chain.private_db.clone(),
        other,
        chain.blocks_dir().parent().unwrap().to_str().unwrap(),
    );
    let err = other_chain.init().unwrap_err();
    assert!(matches!(err, ChainError::WrongChain { .. }));
}

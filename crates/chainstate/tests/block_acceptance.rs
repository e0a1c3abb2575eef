mod common;

use std::sync::Arc;

use common::{coinbase, open_chain, spend, ChainBuilder, Tip};
use pivxd_chainstate::blockindex::{BLOCK_FAILED_VALID, BLOCK_HAVE_DATA, BLOCK_VALID_SCRIPTS};
use pivxd_chainstate::coins::CoinView;
use pivxd_chainstate::state::{BlockStatus, ChainStateError};
use pivxd_chainstate::validation::ValidationFlags;
use pivxd_chainstate::RejectCode;
use pivxd_consensus::money::COIN;
use pivxd_primitives::genesis_block;
use pivxd_primitives::outpoint::OutPoint;
use pivxd_storage::memory::MemoryStore;

fn rejection_reason(err: ChainStateError) -> String {
    match err {
        ChainStateError::Rejected(rejection) => rejection.reason,
        other => panic!("expected a rejection, got {other}"),
    }
}

#[test]
fn genesis_outputs_are_in_the_coin_view() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MemoryStore::new());
    let chain = open_chain(dir.path(), &store);

    let genesis = genesis_block(chain.params());
    let tip = chain.tip().expect("genesis connected");
    assert_eq!(tip.hash, genesis.hash());
    assert_eq!(tip.height, 0);
    assert_eq!(chain.coins().best_block().expect("best"), genesis.hash());

    let coinbase = &genesis.transactions[0];
    let coin = chain
        .coins()
        .get(&OutPoint::new(coinbase.txid(), 0))
        .expect("read")
        .expect("genesis output present");
    assert_eq!(coin.out, coinbase.vout[0]);
    assert_eq!(coin.height, 0);
    assert!(coin.is_coinbase);
}

#[test]
fn duplicate_block_is_benign() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MemoryStore::new());
    let mut chain = open_chain(dir.path(), &store);
    let builder = ChainBuilder::regtest();

    let block = builder.next_block(&builder.genesis(), 1, Vec::new(), 0);
    assert_eq!(
        chain.process_new_block(&block).expect("first"),
        BlockStatus::Accepted
    );
    let tip_before = chain.tip();
    assert_eq!(
        chain.process_new_block(&block).expect("second"),
        BlockStatus::AlreadyHave
    );
    assert_eq!(chain.tip(), tip_before);
    assert_eq!(chain.index().len(), 2);
}

#[test]
fn reward_must_match_the_schedule_exactly() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MemoryStore::new());
    let mut chain = open_chain(dir.path(), &store);
    let builder = ChainBuilder::regtest();
    let genesis = builder.genesis();
    let reward = builder.reward(1);
    assert_eq!(reward, 250 * COIN);

    let greedy = builder.block_paying(&genesis, 1, reward + 1, vec![0x51], Vec::new());
    let err = chain.process_new_block(&greedy).expect_err("pays too much");
    assert_eq!(rejection_reason(err), "bad-cb-amount");
    let node = chain.index().node(chain.lookup(&greedy.hash()).expect("indexed"));
    assert_ne!(node.status & BLOCK_FAILED_VALID, 0);
    assert_eq!(chain.height(), 0);

    let short = builder.block_paying(&genesis, 2, reward - 1, vec![0x51], Vec::new());
    let err = chain.process_new_block(&short).expect_err("pays too little");
    assert_eq!(rejection_reason(err), "bad-cb-amount");

    let exact = builder.block_paying(&genesis, 3, reward, vec![0x51], Vec::new());
    chain.process_new_block(&exact).expect("exact reward");
    assert_eq!(chain.tip().expect("tip").hash, exact.hash());
    let node = chain.index().node(chain.lookup(&exact.hash()).expect("indexed"));
    assert!(node.is_valid(BLOCK_VALID_SCRIPTS));
    assert!(node.have_undo());
}

#[test]
fn fees_raise_the_proof_of_work_reward() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MemoryStore::new());
    let mut chain = open_chain(dir.path(), &store);
    let builder = ChainBuilder::regtest();
    let genesis = builder.genesis();

    // The first coinbase matures once a block at height 101 spends it.
    let blocks = builder.extend(&mut chain, genesis, 100, 1);
    let tip = Tip::of(blocks.last().expect("blocks"), 100);
    let funding = OutPoint::new(blocks[0].transactions[0].txid(), 0);
    let fee = COIN / 10;
    let tx = spend(funding, builder.reward(1) - fee);

    let block = builder.next_block(&tip, 1, vec![tx.clone()], fee);
    chain.process_new_block(&block).expect("fees collected");
    assert_eq!(chain.height(), 101);
    assert!(chain
        .coins()
        .get(&OutPoint::new(tx.txid(), 0))
        .expect("read")
        .is_some());
}

#[test]
fn orphan_and_invalid_parent_are_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MemoryStore::new());
    let mut chain = open_chain(dir.path(), &store);
    let builder = ChainBuilder::regtest();
    let genesis = builder.genesis();

    let parent = builder.next_block(&genesis, 1, Vec::new(), 0);
    let child = builder.next_block(&Tip::of(&parent, 1), 1, Vec::new(), 0);
    match chain.process_new_block(&child) {
        Err(ChainStateError::MissingParent(hash)) => assert_eq!(hash, parent.hash()),
        other => panic!("expected a missing parent, got {other:?}"),
    }

    let bad = builder.block_paying(&genesis, 2, builder.reward(1) + 1, vec![0x51], Vec::new());
    chain.process_new_block(&bad).expect_err("bad reward");
    let on_bad = builder.next_block(&Tip::of(&bad, 1), 2, Vec::new(), 0);
    let err = chain.process_new_block(&on_bad).expect_err("parent failed");
    match err {
        ChainStateError::Rejected(rejection) => {
            assert_eq!(rejection.reason, "bad-prevblk");
            assert_eq!(rejection.dos, 100);
        }
        other => panic!("unexpected error {other}"),
    }

    let err = chain.process_new_block(&bad).expect_err("still invalid");
    match err {
        ChainStateError::Rejected(rejection) => {
            assert_eq!(rejection.code, RejectCode::Duplicate);
        }
        other => panic!("unexpected error {other}"),
    }
}

#[test]
fn structural_failures_mark_the_block_failed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MemoryStore::new());
    let mut chain = open_chain(dir.path(), &store);
    let builder = ChainBuilder::regtest();
    let genesis = builder.genesis();

    // Coinbase committing to the wrong height.
    let mut block = builder.next_block(&genesis, 1, Vec::new(), 0);
    block.transactions[0].vin[0].script_sig = vec![0x52, 0x01];
    let block = builder.mine(&genesis, block.transactions);
    let err = chain.accept_block(&block).expect_err("wrong height");
    assert_eq!(rejection_reason(err), "bad-cb-height");
    let id = chain.lookup(&block.hash()).expect("header indexed");
    let node = chain.index().node(id);
    assert!(node.is_failed());
    assert_eq!(node.status & BLOCK_HAVE_DATA, 0);
}

#[test]
fn structural_check_runs_on_both_entry_points() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MemoryStore::new());
    let mut chain = open_chain(dir.path(), &store);
    let builder = ChainBuilder::regtest();
    let genesis = builder.genesis();

    let extra = coinbase(1, 9, COIN, vec![0x51]);
    let block = builder.next_block(&genesis, 1, vec![extra.clone()], 0);
    let err = chain.process_new_block(&block).expect_err("two coinbases");
    assert_eq!(rejection_reason(err), "bad-cb-multiple");
    assert!(chain.lookup(&block.hash()).is_none());

    let direct = builder.next_block(&genesis, 2, vec![extra], 0);
    let err = chain.accept_block(&direct).expect_err("two coinbases");
    assert_eq!(rejection_reason(err), "bad-cb-multiple");
    let id = chain.lookup(&direct.hash()).expect("header indexed");
    assert!(chain.index().node(id).is_failed());
    assert_eq!(chain.height(), 0);
}

#[test]
fn wrong_difficulty_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MemoryStore::new());
    let mut chain = open_chain(dir.path(), &store);
    let builder = ChainBuilder::regtest();
    let mut genesis = builder.genesis();
    genesis.bits = 0x207f_fffe;

    let block = builder.next_block(&genesis, 1, Vec::new(), 0);
    let err = chain.process_new_block(&block).expect_err("bits differ from parent");
    assert_eq!(rejection_reason(err), "bad-diffbits");
    assert!(chain.lookup(&block.hash()).is_none());
}

#[test]
fn test_block_validity_leaves_state_untouched() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MemoryStore::new());
    let mut chain = open_chain(dir.path(), &store);
    let builder = ChainBuilder::regtest();
    let genesis = builder.genesis();

    let template = builder.next_block(&genesis, 1, Vec::new(), 0);
    let flags = ValidationFlags {
        check_pow: false,
        check_merkle: true,
    };
    chain
        .test_block_validity(&template, flags)
        .expect("template valid");
    assert_eq!(chain.height(), 0);
    assert!(chain.lookup(&template.hash()).is_none());
    assert_eq!(chain.coins().best_block().expect("best"), genesis.hash);

    let greedy = builder.block_paying(&genesis, 2, builder.reward(1) + 5, vec![0x51], Vec::new());
    let err = chain
        .test_block_validity(&greedy, flags)
        .expect_err("overpaying template");
    assert_eq!(rejection_reason(err), "bad-cb-amount");
    assert!(chain.lookup(&greedy.hash()).is_none());
}

#[test]
fn store_failure_aborts_the_chain_state() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MemoryStore::new());
    let mut chain = open_chain(dir.path(), &store);
    let builder = ChainBuilder::regtest();

    store.set_fail_writes(true);
    let blocks = builder.next_block(&builder.genesis(), 1, Vec::new(), 0);
    chain.process_new_block(&blocks).expect("connected in memory");
    chain
        .flush_state_to_disk(pivxd_chainstate::flush::FlushMode::Always)
        .expect_err("write fails");
    assert!(chain.is_aborted());

    store.set_fail_writes(false);
    let next = builder.next_block(&Tip::of(&blocks, 1), 1, Vec::new(), 0);
    match chain.process_new_block(&next) {
        Err(ChainStateError::Aborted(_)) => {}
        other => panic!("expected abort, got {other:?}"),
    }
}

mod common;

use common::{
    key, open_context, p2pkh, pay_to_key, pay_to_op_true, regtest_policy, spend_funding,
    spend_op_true, ChainBuilder, Tip,
};
use pivxd::admission::AcceptOptions;
use pivxd::mempool::MempoolErrorKind;
use pivxd::policy::MempoolPolicy;
use pivxd_consensus::money::COIN;
use pivxd_primitives::outpoint::OutPoint;
use pivxd_primitives::transaction::TxOut;
use pivxd_script::opcodes::OP_1;

const FEE: i64 = 10_000;

#[test]
fn admits_spend_and_refuses_double_spend() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ctx = open_context(dir.path(), regtest_policy());
    let builder = ChainBuilder::regtest();
    let (first, _) = builder.funded_chain(&ctx, 100);

    let tx = pay_to_key(&first, builder.reward(1), FEE);
    let txid = ctx
        .submit_transaction(&tx, AcceptOptions::default())
        .expect("spend admitted");
    assert_eq!(txid, tx.txid());

    let again = ctx
        .submit_transaction(&tx, AcceptOptions::default())
        .expect_err("duplicate");
    assert_eq!(again.reason(), "txn-already-in-mempool");

    let rival = pay_to_key(&first, builder.reward(1), 2 * FEE);
    let err = ctx
        .submit_transaction(&rival, AcceptOptions::default())
        .expect_err("conflict");
    assert_eq!(err.kind, MempoolErrorKind::ConflictingInput);
    assert_eq!(err.reason(), "txn-mempool-conflict");

    assert_eq!(ctx.with_mempool(|pool| pool.txids()), Some(vec![txid]));
}

#[test]
fn immature_coinbase_is_refused() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ctx = open_context(dir.path(), regtest_policy());
    let builder = ChainBuilder::regtest();
    let (first, _) = builder.funded_chain(&ctx, 99);

    // Depth 99 at the next height.
    let tx = pay_to_key(&first, builder.reward(1), FEE);
    let err = ctx
        .submit_transaction(&tx, AcceptOptions::default())
        .expect_err("immature");
    assert_eq!(err.kind, MempoolErrorKind::Invalid);
    assert_eq!(
        err.reason(),
        "bad-txns-premature-spend-of-coinbase-coinstake"
    );
    assert_eq!(ctx.with_mempool(|pool| pool.size()), Some(0));
}

#[test]
fn unknown_inputs_are_orphans() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ctx = open_context(dir.path(), regtest_policy());
    let missing = OutPoint::new([0x77; 32], 3);
    let err = ctx
        .submit_transaction(&spend_op_true(missing.clone(), 1_000), AcceptOptions::default())
        .expect_err("orphan");
    assert!(err.is_orphan());
    assert_eq!(err.missing_inputs, vec![missing]);
}

#[test]
fn coinbase_is_never_admitted() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ctx = open_context(dir.path(), regtest_policy());
    let builder = ChainBuilder::regtest();
    let block = builder.next_block(&builder.genesis(), 5, Vec::new(), 0);
    let err = ctx
        .submit_transaction(&block.transactions[0], AcceptOptions::default())
        .expect_err("coinbase");
    assert_eq!(err.reason(), "coinbase");
    assert_eq!(err.rejection.dos, 100);
}

#[test]
fn standard_policy_enforces_relay_fee_floor() {
    let dir = tempfile::tempdir().expect("tempdir");
    let policy = MempoolPolicy::default();
    let ctx = open_context(dir.path(), policy.clone());
    let builder = ChainBuilder::regtest();
    let (first, _) = builder.funded_chain(&ctx, 100);
    let (_, pubkey) = key();

    // Large enough that the free allowance no longer applies.
    let outputs = |fee: i64| {
        let count = 1_450;
        let each = 20_000;
        let mut vout: Vec<TxOut> = (0..count - 1)
            .map(|_| TxOut {
                value: each,
                script_pubkey: p2pkh(&pubkey),
            })
            .collect();
        vout.push(TxOut {
            value: builder.reward(1) - fee - each * (count - 1),
            script_pubkey: p2pkh(&pubkey),
        });
        vout
    };

    let cheap = spend_funding(&first, outputs(100_000));
    let size = cheap.serialized_size();
    assert!(size >= 49_000, "size {size}");
    assert!(100_000 < policy.min_relay_fee(size));
    let err = ctx
        .submit_transaction(&cheap, AcceptOptions::default())
        .expect_err("below the floor");
    assert_eq!(err.kind, MempoolErrorKind::InsufficientFee);
    assert_eq!(err.reason(), "insufficient fee");

    let paying = spend_funding(&first, outputs(1_000_000));
    assert!(1_000_000 >= policy.min_relay_fee(paying.serialized_size()));
    ctx.submit_transaction(&paying, AcceptOptions::default())
        .expect("fee at the floor is admitted");
}

#[test]
fn connected_block_clears_confirmed_and_conflicting() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ctx = open_context(dir.path(), regtest_policy());
    let builder = ChainBuilder::regtest();
    let (first, tip) = builder.funded_chain(&ctx, 100);

    let pooled = pay_to_key(&first, builder.reward(1), FEE);
    ctx.submit_transaction(&pooled, AcceptOptions::default())
        .expect("admitted");

    let mined = pay_to_key(&first, builder.reward(1), 3 * FEE);
    let block = builder.next_block(&tip, 2, vec![mined], 3 * FEE);
    ctx.process_block(&block).expect("block connects");
    assert_eq!(ctx.with_mempool(|pool| pool.size()), Some(0));
    assert_eq!(ctx.tip().map(|tip| tip.height), Some(101));
}

#[test]
fn disconnected_transactions_return_to_the_pool() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ctx = open_context(dir.path(), regtest_policy());
    let builder = ChainBuilder::regtest();
    let (first, tip) = builder.funded_chain(&ctx, 100);

    let tx = pay_to_key(&first, builder.reward(1), FEE);
    let block = builder.next_block(&tip, 2, vec![tx.clone()], FEE);
    ctx.process_block(&block).expect("block connects");
    assert_eq!(ctx.with_mempool(|pool| pool.size()), Some(0));

    ctx.invalidate_block(&block.hash()).expect("invalidate");
    assert_eq!(ctx.tip().map(|tip| tip.height), Some(100));
    assert_eq!(
        ctx.with_mempool(|pool| pool.contains(&tx.txid())),
        Some(true)
    );

    ctx.reconsider_block(&block.hash()).expect("reconsider");
    assert_eq!(ctx.tip().map(|tip| tip.hash), Some(block.hash()));
    assert_eq!(ctx.with_mempool(|pool| pool.size()), Some(0));
}

#[test]
fn reorg_drops_spends_of_vanished_coinbase() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ctx = open_context(dir.path(), regtest_policy());
    let builder = ChainBuilder::regtest();
    let (first, tip) = builder.funded_chain(&ctx, 100);

    // The block 101 reward is spendable from height 201, so with the tip at
    // 200 a pool spend is valid until block 200 goes away.
    let mut parent = tip;
    let mut blocks = Vec::new();
    for _ in 0..100 {
        let block = builder.next_block(&parent, 3, Vec::new(), 0);
        ctx.process_block(&block).expect("block connects");
        parent = Tip::of(&block, parent.height + 1);
        blocks.push(block);
    }
    let reward_101 = OutPoint::new(blocks[0].transactions[0].txid(), 0);
    let tx = spend_op_true(reward_101, builder.reward(101) - FEE);
    ctx.submit_transaction(&tx, AcceptOptions::default())
        .expect("mature reward spend");
    let funded = pay_to_key(&first, builder.reward(1), FEE);
    ctx.submit_transaction(&funded, AcceptOptions::default())
        .expect("block 1 spend");

    let last = blocks.last().expect("blocks").hash();
    ctx.invalidate_block(&last).expect("invalidate");
    assert_eq!(ctx.tip().map(|tip| tip.height), Some(199));
    assert_eq!(ctx.with_mempool(|pool| pool.contains(&tx.txid())), Some(false));
    assert_eq!(
        ctx.with_mempool(|pool| pool.contains(&funded.txid())),
        Some(true)
    );
}

#[test]
fn returning_parent_adopts_pooled_child() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ctx = open_context(dir.path(), regtest_policy());
    let builder = ChainBuilder::regtest();
    let (first, tip) = builder.funded_chain(&ctx, 100);

    let parent = pay_to_op_true(&first, builder.reward(1), FEE);
    let block = builder.next_block(&tip, 2, vec![parent.clone()], FEE);
    ctx.process_block(&block).expect("block connects");
    let child = spend_op_true(
        OutPoint::new(parent.txid(), 0),
        builder.reward(1) - 2 * FEE,
    );
    ctx.submit_transaction(&child, AcceptOptions::default())
        .expect("child of a confirmed parent");

    ctx.invalidate_block(&block.hash()).expect("invalidate");
    let (linked, parents) = ctx
        .with_mempool(|pool| {
            (
                pool.descendants(&parent.txid()).contains(&child.txid()),
                pool.get(&child.txid()).map(|entry| entry.parents.clone()),
            )
        })
        .expect("mempool");
    assert!(linked);
    assert_eq!(parents, Some(vec![parent.txid()]));
}

#[test]
fn children_of_a_double_spent_parent_are_dropped() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ctx = open_context(dir.path(), regtest_policy());
    let builder = ChainBuilder::regtest();
    let (first, tip) = builder.funded_chain(&ctx, 100);

    let parent = pay_to_op_true(&first, builder.reward(1), FEE);
    let block = builder.next_block(&tip, 2, vec![parent.clone()], FEE);
    ctx.process_block(&block).expect("block connects");
    let child = spend_op_true(
        OutPoint::new(parent.txid(), 0),
        builder.reward(1) - 2 * FEE,
    );
    ctx.submit_transaction(&child, AcceptOptions::default())
        .expect("child admitted");

    // A heavier branch spends the same funding output differently.
    let rival = pay_to_key(&first, builder.reward(1), 2 * FEE);
    let fork_a = builder.next_block(&tip, 9, vec![rival], 2 * FEE);
    ctx.process_block(&fork_a).expect("side block stored");
    assert_eq!(ctx.tip().map(|tip| tip.hash), Some(block.hash()));
    let fork_b = builder.next_block(&Tip::of(&fork_a, 101), 9, Vec::new(), 0);
    ctx.process_block(&fork_b).expect("reorg");

    assert_eq!(ctx.tip().map(|tip| tip.hash), Some(fork_b.hash()));
    assert_eq!(ctx.with_mempool(|pool| pool.contains(&parent.txid())), Some(false));
    assert_eq!(ctx.with_mempool(|pool| pool.contains(&child.txid())), Some(false));
    assert_eq!(ctx.with_mempool(|pool| pool.size()), Some(0));
}

#[test]
fn full_mempool_refuses_the_newcomer() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut policy = regtest_policy();
    policy.max_mempool_bytes = 1;
    let ctx = open_context(dir.path(), policy);
    let builder = ChainBuilder::regtest();
    let (first, _) = builder.funded_chain(&ctx, 100);

    let err = ctx
        .submit_transaction(&pay_to_key(&first, builder.reward(1), FEE), AcceptOptions::default())
        .expect_err("no room");
    assert_eq!(err.kind, MempoolErrorKind::MempoolFull);
    assert_eq!(err.reason(), "mempool full");
    assert_eq!(ctx.with_mempool(|pool| pool.size()), Some(0));
}

#[test]
fn free_transactions_are_rate_limited() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut policy = regtest_policy();
    policy.relay_priority = false;
    policy.limit_free_relay_kb_per_minute = 0;
    let ctx = open_context(dir.path(), policy);
    let builder = ChainBuilder::regtest();
    let (first, _) = builder.funded_chain(&ctx, 100);

    let free = pay_to_key(&first, builder.reward(1), 0);
    let err = ctx
        .submit_transaction(&free, AcceptOptions::default())
        .expect_err("limiter is closed");
    assert_eq!(err.kind, MempoolErrorKind::InsufficientFee);
    assert_eq!(err.reason(), "rate limited free transaction");

    let unlimited = AcceptOptions {
        limit_free: false,
        ..AcceptOptions::default()
    };
    ctx.submit_transaction(&free, unlimited)
        .expect("limit not applied");
}

#[test]
fn absurd_fee_is_refused_unless_allowed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ctx = open_context(dir.path(), regtest_policy());
    let builder = ChainBuilder::regtest();
    let (first, _) = builder.funded_chain(&ctx, 100);

    let generous = pay_to_key(&first, builder.reward(1), COIN);
    let err = ctx
        .submit_transaction(&generous, AcceptOptions::default())
        .expect_err("absurd");
    assert_eq!(err.kind, MempoolErrorKind::AbsurdFee);
    assert_eq!(err.reason(), "absurdly-high-fee");

    let allowed = AcceptOptions {
        reject_absurd_fee: false,
        ..AcceptOptions::default()
    };
    ctx.submit_transaction(&generous, allowed)
        .expect("high fee accepted on request");
}

#[test]
fn long_unconfirmed_chains_are_refused() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut policy = regtest_policy();
    policy.chain_limits.ancestor_count = 2;
    let ctx = open_context(dir.path(), policy);
    let builder = ChainBuilder::regtest();
    let (first, _) = builder.funded_chain(&ctx, 100);

    let mut value = builder.reward(1) - FEE;
    let root = pay_to_op_true(&first, builder.reward(1), FEE);
    ctx.submit_transaction(&root, AcceptOptions::default())
        .expect("root");
    value -= FEE;
    let second = spend_op_true(OutPoint::new(root.txid(), 0), value);
    ctx.submit_transaction(&second, AcceptOptions::default())
        .expect("one ancestor");
    value -= FEE;
    let third = spend_op_true(OutPoint::new(second.txid(), 0), value);
    let err = ctx
        .submit_transaction(&third, AcceptOptions::default())
        .expect_err("two ancestors");
    assert_eq!(err.kind, MempoolErrorKind::TooLongChain);
    assert_eq!(err.reason(), "too-long-mempool-chain");
    assert_eq!(ctx.with_mempool(|pool| pool.size()), Some(2));
}

#[test]
fn relay_only_script_failure_is_nonstandard() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ctx = open_context(dir.path(), regtest_policy());
    let builder = ChainBuilder::regtest();
    let (first, _) = builder.funded_chain(&ctx, 100);

    let parent = pay_to_op_true(&first, builder.reward(1), FEE);
    ctx.submit_transaction(&parent, AcceptOptions::default())
        .expect("parent");
    // Leaves two items on the stack: valid by consensus, not clean.
    let mut child = spend_op_true(OutPoint::new(parent.txid(), 0), builder.reward(1) - 2 * FEE);
    child.vin[0].script_sig = vec![OP_1];
    let err = ctx
        .submit_transaction(&child, AcceptOptions::default())
        .expect_err("unclean stack");
    assert_eq!(err.kind, MempoolErrorKind::NonStandard);
    assert!(
        err.reason().starts_with("non-mandatory-script-verify-flag"),
        "{}",
        err.reason()
    );
}

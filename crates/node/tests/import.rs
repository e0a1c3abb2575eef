mod common;

use std::fs;

use common::{open_context, regtest_policy, ChainBuilder, Tip};
use pivxd::import::{import_file, ImportStats};
use pivxd_consensus::{chain_params, Network};
use pivxd_primitives::block::Block;

fn bootstrap(blocks: &[&Block], magic: [u8; 4]) -> Vec<u8> {
    let mut out = Vec::new();
    for block in blocks {
        let bytes = block.consensus_encode();
        out.extend_from_slice(&magic);
        out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        out.extend_from_slice(&bytes);
    }
    out
}

#[test]
fn imports_out_of_order_blocks() {
    let dir = tempfile::tempdir().expect("tempdir");
    let blocks_dir = dir.path().join("blocks");
    fs::create_dir_all(&blocks_dir).expect("blocks dir");
    let ctx = open_context(&blocks_dir, regtest_policy());
    let builder = ChainBuilder::regtest();
    let magic = chain_params(Network::Regtest).message_start;

    let mut tip = builder.genesis();
    let mut chain = Vec::new();
    for _ in 0..5 {
        let block = builder.next_block(&tip, 7, Vec::new(), 0);
        tip = Tip::of(&block, tip.height + 1);
        chain.push(block);
    }
    // A block whose parent never appears in the file.
    let stray_parent = builder.next_block(&builder.genesis(), 8, Vec::new(), 0);
    let stray = builder.next_block(&Tip::of(&stray_parent, 1), 8, Vec::new(), 0);

    let order = [&chain[2], &stray, &chain[0], &chain[4], &chain[1], &chain[3], &chain[0]];
    let path = dir.path().join("bootstrap.dat");
    fs::write(&path, bootstrap(&order, magic)).expect("write bootstrap");

    let stats = import_file(&ctx, &path, magic).expect("import");
    assert_eq!(
        stats,
        ImportStats {
            records: 7,
            accepted: 5,
            already_have: 1,
            rejected: 0,
            undecodable: 0,
            orphans: 1,
        }
    );
    let imported_tip = ctx.tip().expect("tip");
    assert_eq!(imported_tip.height, 5);
    assert_eq!(imported_tip.hash, chain[4].hash());
}

#[test]
fn invalid_blocks_are_counted_not_fatal() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ctx = open_context(dir.path(), regtest_policy());
    let builder = ChainBuilder::regtest();
    let magic = chain_params(Network::Regtest).message_start;

    let genesis = builder.genesis();
    // Pays one satoshi more than the reward allows.
    let greedy = builder.block_paying(&genesis, 9, builder.reward(1) + 1, vec![0x51], Vec::new());
    let good = builder.next_block(&genesis, 10, Vec::new(), 0);
    let path = dir.path().join("bootstrap.dat");
    fs::write(&path, bootstrap(&[&greedy, &good], magic)).expect("write bootstrap");

    let stats = import_file(&ctx, &path, magic).expect("import");
    assert_eq!(stats.rejected, 1);
    assert_eq!(stats.accepted, 1);
    assert_eq!(ctx.tip().map(|tip| tip.hash), Some(good.hash()));
}

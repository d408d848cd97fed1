//! Several nodes wired in-process through `LedgerPeer`.

mod common;

use common::*;
use stakenode::node::NodeCore;
use stakenode::sync::{EntityKind, Flow, PeerClient, SyncPhase};

fn empty_node(dir: &std::path::Path, id: &str) -> NodeCore {
    NodeCore::open(config(dir, id)).unwrap()
}

#[test]
fn empty_nodes_converge_on_the_reference_chain() {
    let ref_dir = tempfile::tempdir().unwrap();
    let reference = reference_chain(ref_dir.path());

    let mut results = Vec::new();
    for id in ["b", "c"] {
        let dir = tempfile::tempdir().unwrap();
        let mut node = empty_node(dir.path(), id);
        let peers: Vec<Box<dyn PeerClient>> = vec![Box::new(reference.peer_view())];
        let mut pages = 0;
        let report = node
            .sync_once(&peers, 5_000, &mut |_| {
                pages += 1;
                Flow::Continue
            })
            .unwrap();

        assert!(report.is_complete(), "{report:?}");
        assert!(report.errors.is_empty(), "{:?}", report.errors);
        assert_eq!(report.peer.as_deref(), Some("reference"));
        assert_eq!(report.height_before, None);
        assert_eq!(report.height_after, Some(10));
        assert_eq!(report.entities[&EntityKind::Blocks].inserted, 11);
        assert!(pages > 0);
        assert!(!node.data_dir().sync_state_path().exists());
        assert!(node.verify_chain().unwrap().ok());
        results.push((node.height(), node.tx_count(), node.block_hashes(), dir));
    }

    let expected = (reference.height(), reference.tx_count(), reference.block_hashes());
    for (height, txs, hashes, _dir) in &results {
        assert_eq!(*height, expected.0);
        assert_eq!(*txs, 25);
        assert_eq!(*txs, expected.1);
        assert_eq!(hashes, &expected.2);
    }
}

#[test]
fn second_pass_is_a_no_op_and_picks_up_new_blocks() {
    let ref_dir = tempfile::tempdir().unwrap();
    let mut reference = reference_chain(ref_dir.path());
    let dir = tempfile::tempdir().unwrap();
    let mut node = empty_node(dir.path(), "b");

    let sync = |node: &mut NodeCore, reference: &NodeCore, now| {
        let peers: Vec<Box<dyn PeerClient>> = vec![Box::new(reference.peer_view())];
        node.sync_once(&peers, now, &mut |_| Flow::Continue).unwrap()
    };

    sync(&mut node, &reference, 5_000);
    let again = sync(&mut node, &reference, 5_001);
    assert_eq!(again.entities.get(&EntityKind::Blocks).map_or(0, |s| s.inserted), 0);
    assert_eq!(node.height(), Some(10));

    queue(&reference, "9000", &signed_transfer(&key(9), 0, [0xC0; 20], 1_000_000_000, GAS_PRICE));
    reference.admit_intake(6_000, &Default::default()).unwrap();
    reference.produce_block(6_001).unwrap();

    let report = sync(&mut node, &reference, 6_002);
    assert_eq!(report.entities[&EntityKind::Blocks].inserted, 1);
    assert_eq!(node.height(), Some(11));
    assert_eq!(node.tx_count(), 26);
    assert_eq!(node.block_hashes(), reference.block_hashes());
}

#[test]
fn cancelled_run_resumes_where_it_stopped() {
    let ref_dir = tempfile::tempdir().unwrap();
    let reference = reference_chain(ref_dir.path());
    let dir = tempfile::tempdir().unwrap();
    // small pages so the block phase spans several of them
    let mut cfg = config(dir.path(), "b");
    cfg.sync.page_size = 4;
    let mut node = NodeCore::open(cfg).unwrap();
    let peers: Vec<Box<dyn PeerClient>> = vec![Box::new(reference.peer_view())];

    let first = node
        .sync_once(&peers, 5_000, &mut |p| if p.phase == SyncPhase::Blocks { Flow::Cancel } else { Flow::Continue })
        .unwrap();
    assert!(first.cancelled);
    assert!(!first.is_complete());
    assert!(first.completed.contains(&SyncPhase::NetworkConfig));
    assert!(node.data_dir().sync_state_path().exists());
    assert_eq!(node.height(), Some(3));

    let second = node.sync_once(&peers, 5_001, &mut |_| Flow::Continue).unwrap();
    assert_eq!(second.resumed_from, Some(SyncPhase::Blocks));
    assert!(second.is_complete());
    assert_eq!(node.block_hashes(), reference.block_hashes());
    assert_eq!(node.tx_count(), 25);
}

#[test]
fn foreign_chain_peer_is_not_used() {
    let a_dir = tempfile::tempdir().unwrap();
    let a = genesis_node(a_dir.path(), "a", 100);
    let b_dir = tempfile::tempdir().unwrap();
    let mut b = genesis_node(b_dir.path(), "b", 200);
    assert_ne!(a.block_hashes()[0], b.block_hashes()[0]);

    let peers: Vec<Box<dyn PeerClient>> = vec![Box::new(a.peer_view())];
    let err = b.sync_once(&peers, 300, &mut |_| Flow::Continue).unwrap_err();
    assert!(err.to_string().contains("no reachable peer"), "{err}");
    assert_eq!(b.height(), Some(0));
}

//! Template ingestion end-to-end: a large template with an undecodable
//! extension-block transaction still yields a serializable block.

mod common;

use std::sync::Arc;

use serde_json::json;

use common::TestPool;
use peerpool_node::parent::BlockTemplate;
use peerpool_node::primitives::hash::hash256;
use peerpool_node::primitives::tx::{Transaction, TxOut};
use peerpool_node::work::{Classified, WorkRequest};

/// 500 decodable transactions plus one 900-byte HogEx-shaped blob
fn big_template_json() -> serde_json::Value {
    let mut txs = Vec::new();
    for i in 0u32..500 {
        let tx = Transaction {
            version: 1,
            inputs: vec![peerpool_node::primitives::tx::TxIn {
                prevout: peerpool_node::primitives::tx::OutPoint {
                    txid: hash256(&i.to_le_bytes()),
                    vout: 0,
                },
                script_sig: bytes::Bytes::from_static(&[0x51]),
                sequence: 0xffff_ffff,
                witness: Vec::new(),
            }],
            outputs: vec![TxOut {
                value: 1000 + i as u64,
                script_pubkey: bytes::Bytes::from_static(&[0x51]),
            }],
            lock_time: 0,
        };
        txs.push(json!({
            "data": hex::encode(tx.to_bytes()),
            "txid": tx.txid().to_hex(),
            "fee": 100,
        }));
    }
    // The HogEx: valid hex, refuses structured decode
    txs.push(json!({
        "data": hex::encode(vec![0x08u8; 900]),
        "txid": hash256(b"hogex").to_hex(),
        "fee": 0,
    }));
    json!({
        "previousblockhash": hash256(b"tip").to_hex(),
        "height": 840_002,
        "coinbasevalue": 5_000_000_000u64,
        "bits": format!("{:08x}", common::EASY_BITS),
        "version": 0x20000000,
        "curtime": 1_700_000_000,
        "transactions": txs,
    })
}

#[test]
fn mweb_template_keeps_all_transactions_and_builds_a_block() {
    let template = BlockTemplate::parse(&big_template_json(), 1_700_000_000).unwrap();
    assert_eq!(template.transactions.len(), 501);
    assert!(template.transactions[500].raw.is_opaque());
    assert_eq!(template.transactions[500].raw.raw_bytes().len(), 900);

    let mut pool = TestPool::new();
    let template = Arc::new(template);
    let request = WorkRequest {
        pubkey_hash: [0x21; 20],
        extranonce1: [0, 1, 2, 3],
        pseudo_target: peerpool_node::primitives::target::U256::MAX,
    };
    let job = pool
        .workgen
        .make_job(&pool.tracker, &template, &request, true)
        .unwrap();
    // Branch depth for 502 leaves (coinbase + 501)
    assert_eq!(job.merkle_branch.len(), 9);

    let en2 = [9u8; 4];
    for nonce in 0..4096u32 {
        if let Classified::Block { block, .. } =
            pool.workgen.classify(&job, &en2, job.ntime, nonce, 0, 0)
        {
            assert_eq!(block.transactions.len(), 501);
            let bytes = block.to_bytes();
            // Header, then a varint tx count of 502
            assert_eq!(bytes[80], 0xfd);
            assert_eq!(
                u16::from_le_bytes([bytes[81], bytes[82]]),
                502
            );
            // The opaque blob rides along untouched at the end
            assert_eq!(&bytes[bytes.len() - 900..], &[0x08u8; 900][..]);
            return;
        }
    }
    panic!("no block found with an easy parent target");
}

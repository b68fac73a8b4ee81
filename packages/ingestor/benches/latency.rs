//! Latency benchmarks for the ingestor pipeline
//!
//! Covers the per-transaction hot path: decode, selector lookup, address
//! classification and graph message encoding.

use std::sync::Arc;

use alloy::primitives::{address, U256};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

use chaingraph_ingestor::decoder::{decode_interactions, encode_address_word, encode_uint_word};
use chaingraph_ingestor::node::{AddressStats, NodeClassifier};
use chaingraph_ingestor::publisher::{GraphMessage, GraphUpdate};
use chaingraph_ingestor::registry::RegistryStore;
use chaingraph_ingestor::repository::RelationshipRecord;
use chaingraph_ingestor::signatures::lookup;
use chaingraph_ingestor::transaction::Transaction;

fn erc20_transfer() -> Transaction {
    Transaction {
        hash: "0x1234567890abcdef1234567890abcdef1234567890abcdef1234567890abcdef".to_string(),
        from: "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266".to_string(),
        to: "0x1f9840a85d5aF5bf1D1762F925BDADdC4201F984".to_string(),
        value: "0".to_string(),
        data: format!(
            "0xa9059cbb{}{}",
            encode_address_word(address!("70997970C51812dc3A010C7d01b50e0d17dc79C8")),
            encode_uint_word(U256::from(1_000_000_000_000_000_000u64))
        ),
        block_number: 19_000_000,
        timestamp: 1_703_000_000,
        network: "ethereum".to_string(),
        success: true,
    }
}

/// Benchmark call data decoding
fn bench_decode_transaction(c: &mut Criterion) {
    let tx = erc20_transfer();

    c.bench_function("decode_erc20_transfer", |b| {
        b.iter(|| black_box(decode_interactions(black_box(&tx))))
    });
}

/// Benchmark selector lookup
fn bench_lookup_selector(c: &mut Criterion) {
    let selector: [u8; 4] = [0x38, 0xed, 0x17, 0x39];

    c.bench_function("lookup_selector", |b| {
        b.iter(|| black_box(lookup(black_box(&selector))))
    });
}

/// Benchmark node classification without bytecode inspection
fn bench_classify_node(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let classifier = NodeClassifier::new(Arc::new(RegistryStore::with_defaults()), "ethereum");
    let stats = AddressStats {
        transaction_count: 250,
        total_volume: 4_200.0,
        incoming_connections: 12,
        outgoing_connections: 30,
    };
    let tags = vec!["dex_trader".to_string(), "protocol:uniswap".to_string()];

    c.bench_function("classify_node", |b| {
        b.to_async(&runtime).iter(|| async {
            black_box(
                classifier
                    .classify_node("0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266", Some(&stats), &tags)
                    .await,
            )
        })
    });
}

/// Benchmark JSON graph message formatting
fn bench_format_message(c: &mut Criterion) {
    let relationship = RelationshipRecord::new(
        "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266",
        "0x70997970c51812dc3a010c7d01b50e0d17dc79c8",
        "ERC20_TRANSFER",
        "ethereum",
    );
    let message = GraphMessage::new(GraphUpdate::Relationships(vec![relationship]));

    c.bench_function("format_message_json", |b| {
        b.iter(|| black_box(message.to_json().unwrap()))
    });
}

criterion_group!(
    benches,
    bench_decode_transaction,
    bench_lookup_selector,
    bench_classify_node,
    bench_format_message
);

criterion_main!(benches);

//! Benchmarks for order book operations

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use market_stream::decoder::{DepthDelta, DepthUpdate};
use market_stream::orderbook::OrderBook;
use rust_decimal::Decimal;
use std::str::FromStr;

fn create_snapshot(levels: usize) -> DepthUpdate {
    let quantity = Decimal::from_str("1.5").unwrap();
    let bids = (0..levels)
        .map(|i| DepthDelta::new(Decimal::from(50000 - i as i64), quantity))
        .collect();
    let asks = (0..levels)
        .map(|i| DepthDelta::new(Decimal::from(50001 + i as i64), quantity))
        .collect();

    DepthUpdate {
        symbol: "BTCUSDT".to_string(),
        is_snapshot: true,
        asks,
        bids,
    }
}

fn create_update() -> DepthUpdate {
    DepthUpdate {
        symbol: "BTCUSDT".to_string(),
        is_snapshot: false,
        bids: vec![
            DepthDelta::new(Decimal::from(49999), Decimal::from_str("2.0").unwrap()),
            DepthDelta::new(Decimal::from(49990), Decimal::ZERO),
        ],
        asks: vec![DepthDelta::new(Decimal::from(50001), Decimal::from_str("2.5").unwrap())],
    }
}

fn benchmark_full_snapshot(c: &mut Criterion) {
    let snapshot = create_snapshot(100);

    c.bench_function("apply_snapshot_100_levels", |b| {
        b.iter(|| {
            let mut book = OrderBook::new("BTCUSDT");
            book.apply_update(black_box(&snapshot)).unwrap();
        })
    });
}

fn benchmark_apply_update(c: &mut Criterion) {
    let mut book = OrderBook::new("BTCUSDT");
    book.apply_update(&create_snapshot(100)).unwrap();

    let update = create_update();

    c.bench_function("apply_update", |b| {
        b.iter(|| {
            book.apply_update(black_box(&update)).unwrap();
        })
    });
}

fn benchmark_snapshot(c: &mut Criterion) {
    let mut book = OrderBook::new("BTCUSDT");
    book.apply_update(&create_snapshot(1000)).unwrap();

    c.bench_function("snapshot_full_1000_levels", |b| {
        b.iter(|| {
            black_box(book.snapshot(None));
        })
    });

    c.bench_function("snapshot_top_20", |b| {
        b.iter(|| {
            black_box(book.snapshot(Some(20)));
        })
    });
}

criterion_group!(benches, benchmark_full_snapshot, benchmark_apply_update, benchmark_snapshot);
criterion_main!(benches);

use criterion::{Criterion, criterion_group, criterion_main};
use cryptocards_server::domain::lifecycle::{compute_payout, validate_destination};
use cryptocards_server::domain::{
    Card, DepositBalance, LifecyclePolicy, NewCard, SettlementKind, TokenHolding,
    reconcile_funding,
};
use std::collections::HashMap;
use std::hint::black_box;

fn holding(mint: &str, raw_amount: u64, decimals: u8) -> TokenHolding {
    TokenHolding {
        mint: mint.to_string(),
        token_account: format!("{}-account", mint),
        token_program: "TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA".to_string(),
        raw_amount,
        decimals,
        ui_amount: raw_amount as f64 / 10f64.powi(i32::from(decimals)),
    }
}

fn mixed_balance() -> (DepositBalance, HashMap<String, f64>) {
    let tokens = (0..8)
        .map(|i| holding(&format!("Mint{}", i), 1_000_000 * (i + 1), 6))
        .collect();
    let prices = (0..6)
        .map(|i| (format!("Mint{}", i), 0.0065 * (i + 1) as f64))
        .collect();
    (
        DepositBalance {
            address: "deposit".to_string(),
            lamports: 2_000_000_000,
            tokens,
        },
        prices,
    )
}

fn bench_reconcile_funding(c: &mut Criterion) {
    let (balance, prices) = mixed_balance();

    c.bench_function("reconcile_funding_mixed", |b| {
        b.iter(|| reconcile_funding(black_box(&balance), black_box(&prices)))
    });
}

fn bench_compute_payout(c: &mut Criterion) {
    let (balance, prices) = mixed_balance();
    let snapshot = reconcile_funding(&balance, &prices);
    let card = Card::from_new(
        "bench".to_string(),
        &NewCard {
            public_id: "K7MX3QPA".to_string(),
            cvv: "482913".to_string(),
            deposit_address: Some("deposit".to_string()),
            user_id: None,
            message: None,
            currency: "USD".to_string(),
            amount_fiat: None,
            token_mint: None,
            expires_at: None,
            template_url: None,
            refund_address: None,
        },
    );
    let destination = bs58::encode([7u8; 32]).into_string();
    let policy = LifecyclePolicy::default()
        .with_tax_collection_address(bs58::encode([9u8; 32]).into_string());

    c.bench_function("compute_payout_claim", |b| {
        b.iter(|| {
            let _ = compute_payout(
                black_box(&card),
                black_box(&snapshot),
                SettlementKind::Claim,
                black_box(&destination),
                &policy,
            );
        })
    });

    c.bench_function("validate_destination", |b| {
        b.iter(|| {
            let _ = validate_destination(black_box(&destination), Some("deposit"));
        })
    });
}

criterion_group!(benches, bench_reconcile_funding, bench_compute_payout);
criterion_main!(benches);

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rug::integer::Order;
use rug::Integer;

use constel::{fermat, modarith, primes};

fn bench_generate_primes_1m(c: &mut Criterion) {
    c.bench_function("generate_primes(1_000_000)", |b| {
        b.iter(|| primes::generate_primes(black_box(1_000_000)));
    });
}

fn bench_rem_limbs(c: &mut Criterion) {
    // A 1216-bit value, the size of a typical block target.
    let value = (Integer::from(0x1234_5678_9abc_def0u64) << 1152u32) + 987_654_321u32;
    let limbs: Vec<u64> = value.to_digits(Order::Lsf);
    let p = 1_000_003u64;
    let v = modarith::reciprocal(p);
    c.bench_function("rem_limbs(1216-bit, p~2^20)", |b| {
        b.iter(|| modarith::rem_limbs(black_box(&limbs), black_box(p), black_box(v)));
    });
    c.bench_function("rem_limbs_plain(1216-bit, p~2^20)", |b| {
        b.iter(|| modarith::rem_limbs_plain(black_box(&limbs), black_box(p)));
    });
}

fn bench_mul_rem(c: &mut Criterion) {
    let p = 2_147_483_647u64;
    let v = modarith::reciprocal(p);
    c.bench_function("mul_rem", |b| {
        b.iter(|| {
            modarith::mul_rem(
                black_box(1_234_567_890),
                black_box(0xdead_beef_cafe_f00d),
                black_box(p),
                black_box(v),
            )
        });
    });
}

fn bench_fermat_320bit(c: &mut Criterion) {
    let candidate = (Integer::from(1) << 320u32) + 27u32;
    c.bench_function("fermat(320-bit)", |b| {
        b.iter(|| fermat::is_probable_prime(black_box(&candidate)));
    });
}

criterion_group!(
    benches,
    bench_generate_primes_1m,
    bench_rem_limbs,
    bench_mul_rem,
    bench_fermat_320bit,
);
criterion_main!(benches);

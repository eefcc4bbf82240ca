//! Benchmarks for syslog record generation.

use std::time::Duration;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use logspray_payload::SystemLog;

fn system_log_setup(c: &mut Criterion) {
    c.bench_function("system_log_setup", |b| {
        b.iter(|| {
            let _templater = SystemLog::new(19690716).expect("construction");
        })
    });
}

fn system_log_batches(c: &mut Criterion) {
    let mut group = c.benchmark_group("system_log_batches");
    for batch in &[100_usize, 250, 1_000] {
        group.throughput(Throughput::Elements(*batch as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch), batch, |b, &batch| {
            let mut templater = SystemLog::new(19690716).expect("construction");
            let mut buf = Vec::with_capacity((templater.max_record_len() + 1) * batch);
            b.iter(|| {
                buf.clear();
                templater.refresh_timestamp().expect("refresh");
                for i in 0..batch {
                    if i > 0 {
                        buf.push(b'\n');
                    }
                    templater.generate_into(&mut buf);
                }
            });
        });
    }
    group.finish();
}

criterion_group!(
    name = benches;
    config = Criterion::default().measurement_time(Duration::from_secs(30));
    targets = system_log_setup, system_log_batches
);
criterion_main!(benches);

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::Arc;

use anyexec::{Executor, ThreadExecutor};
use criterion::{Criterion, criterion_group, criterion_main};
use tether::{AoContext, Promise, make_ready_future};

fn ready_chain(c: &mut Criterion) {
    c.bench_function("ready_chain_three_links", |b| {
        b.iter(|| {
            make_ready_future(1)
                .then(|value| value + 1)
                .then(|value| value * 2)
                .then(|value| value.to_string())
                .get()
                .expect("chain must succeed")
        });
    });
}

fn promise_roundtrip(c: &mut Criterion) {
    c.bench_function("promise_set_then_get", |b| {
        b.iter(|| {
            let mut promise = Promise::new();
            let future = promise.future().expect("fresh promise");
            promise.set_value(42).expect("satisfy");
            future.get().expect("ready")
        });
    });
}

fn context_bound_chain(c: &mut Criterion) {
    let executor = Arc::new(ThreadExecutor::new());
    let cx = AoContext::new(executor as Arc<dyn Executor>);

    c.bench_function("context_bound_then", |b| {
        b.iter(|| {
            make_ready_future(1)
                .via(&cx)
                .then(|value| value + 1)
                .get()
                .expect("chain must succeed")
        });
    });
}

criterion_group!(benches, ready_chain, promise_roundtrip, context_bound_chain);
criterion_main!(benches);

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Chains continuations through a context and shows close-time
//! cancellation.

use std::sync::Arc;
use std::time::Duration;

use anyexec::{Executor, ThreadPoolExecutor};
use tether::{AoContext, Promise, delay, make_ready_future, to_thread};

fn main() {
    let pool = Arc::new(ThreadPoolExecutor::new(4));
    let cx = AoContext::new(Arc::clone(&pool) as Arc<dyn Executor>);

    // A chain that hops through a worker thread and lands back in the
    // context.
    let greeting = make_ready_future(10)
        .then(|value| to_thread(move || value + 1))
        .flatten()
        .via(&cx)
        .then(|value| format!("computed {value}"))
        .get()
        .expect("the chain resolves");
    println!("{greeting}");

    // A timer bound to the context resolves...
    delay(&cx, Duration::from_millis(20))
        .get()
        .expect("the delay elapses");
    println!("short delay elapsed");

    // ...but closing the context cancels everything still attached to it.
    let mut promise = Promise::<i32>::new();
    let pending = promise
        .future()
        .expect("fresh promise")
        .via(&cx)
        .then(|value| value * 2);

    cx.close();
    drop(promise);

    println!("after close: {:?}", pending.get());
}

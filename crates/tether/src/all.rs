// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::{AoContext, Error, Future, Promise, make_failed_future, promise_pair};

struct AllVecInner<R: Send + 'static> {
    results: Vec<Option<R>>,
    finished: usize,
    promise: Option<Promise<Vec<R>>>,
}

/// Shared state of one `all` run. The operations all execute inside a
/// dedicated child context, so a single failure can cancel the remaining
/// peers by closing it.
struct AllVecOp<R: Send + 'static> {
    cx: AoContext,
    inner: Mutex<AllVecInner<R>>,
}

impl<R: Send + 'static> AllVecOp<R> {
    fn task_finished(&self, index: usize, result: R) {
        let mut inner = self.inner.lock();
        inner.results[index] = Some(result);
        inner.finished += 1;

        if inner.finished == inner.results.len() {
            if let Some(mut promise) = inner.promise.take() {
                let results = inner
                    .results
                    .iter_mut()
                    .map(|slot| slot.take().expect("every slot was filled"))
                    .collect();
                let _ = promise.set_value(results);
            }
        }
    }

    fn task_failed(&self, error: Error) {
        if let Some(mut promise) = self.inner.lock().promise.take() {
            let _ = promise.set_error(error);
        }

        // Cancel the peers that are still running.
        self.cx.close();
    }
}

/// Starts `make_future(cx, arg)` for every argument and collects the
/// results, preserving input order.
///
/// All operations run inside a child context of `cx`. The first failure
/// settles the collective future with that error and closes the child
/// context, cancelling the remaining peers. An empty argument vector
/// resolves immediately.
pub fn all<A, R, F>(cx: &AoContext, mut make_future: F, args: Vec<A>) -> Future<Vec<R>>
where
    R: Send + 'static,
    F: FnMut(&AoContext, A) -> Future<R>,
{
    let (mut promise, future) = promise_pair();

    if args.is_empty() {
        let _ = promise.set_value(Vec::new());
        return future;
    }

    let child = match cx.new_child() {
        Ok(child) => child,
        Err(error) => return make_failed_future(error),
    };

    let op = Arc::new(AllVecOp {
        cx: child,
        inner: Mutex::new(AllVecInner {
            results: (0..args.len()).map(|_| None).collect(),
            finished: 0,
            promise: Some(promise),
        }),
    });

    for (index, arg) in args.into_iter().enumerate() {
        let task = make_future(&op.cx, arg);

        let on_success = Arc::clone(&op);
        let on_failure = Arc::clone(&op);
        let _ = task
            .via(&op.cx)
            .then(move |result| on_success.task_finished(index, result))
            .via(&op.cx)
            .fail(move |error| {
                on_failure.task_failed(error);
                Ok(())
            });
    }

    future
}

struct AllPairInner<A: Send + 'static, B: Send + 'static> {
    left: Option<A>,
    right: Option<B>,
    promise: Option<Promise<(A, B)>>,
}

struct AllPairOp<A: Send + 'static, B: Send + 'static> {
    cx: AoContext,
    inner: Mutex<AllPairInner<A, B>>,
}

impl<A: Send + 'static, B: Send + 'static> AllPairOp<A, B> {
    fn try_complete(inner: &mut AllPairInner<A, B>) {
        if inner.left.is_some() && inner.right.is_some() {
            if let Some(mut promise) = inner.promise.take() {
                let left = inner.left.take().expect("checked above");
                let right = inner.right.take().expect("checked above");
                let _ = promise.set_value((left, right));
            }
        }
    }

    fn failed(&self, error: Error) {
        if let Some(mut promise) = self.inner.lock().promise.take() {
            let _ = promise.set_error(error);
        }

        self.cx.close();
    }
}

/// Resolves immediately; the zero-operation form of the `all` family.
pub fn all0(_cx: &AoContext) -> Future<()> {
    crate::make_ready_future(())
}

/// Runs a single operation in a child context; the unary form of the `all`
/// family.
pub fn all1<A, FA>(cx: &AoContext, make_a: FA) -> Future<A>
where
    A: Send + 'static,
    FA: FnOnce(&AoContext) -> Future<A>,
{
    let child = match cx.new_child() {
        Ok(child) => child,
        Err(error) => return make_failed_future(error),
    };

    let task = make_a(&child);
    let child = Arc::new(child);
    // The child rides along in the continuation so it stays open until the
    // operation has delivered its result.
    task.via(child.as_ref()).then(move |value| {
        drop(child);
        value
    })
}

/// Runs two heterogeneous operations in a shared child context and joins
/// their results. The first failure cancels the other operation.
pub fn all2<A, B, FA, FB>(cx: &AoContext, make_a: FA, make_b: FB) -> Future<(A, B)>
where
    A: Send + 'static,
    B: Send + 'static,
    FA: FnOnce(&AoContext) -> Future<A>,
    FB: FnOnce(&AoContext) -> Future<B>,
{
    let (promise, future) = promise_pair();

    let child = match cx.new_child() {
        Ok(child) => child,
        Err(error) => return make_failed_future(error),
    };

    let op = Arc::new(AllPairOp {
        cx: child,
        inner: Mutex::new(AllPairInner {
            left: None,
            right: None,
            promise: Some(promise),
        }),
    });

    {
        let task = make_a(&op.cx);
        let on_success = Arc::clone(&op);
        let on_failure = Arc::clone(&op);
        let _ = task
            .via(&op.cx)
            .then(move |value| {
                let mut inner = on_success.inner.lock();
                inner.left = Some(value);
                AllPairOp::try_complete(&mut inner);
            })
            .via(&op.cx)
            .fail(move |error| {
                on_failure.failed(error);
                Ok(())
            });
    }
    {
        let task = make_b(&op.cx);
        let on_success = Arc::clone(&op);
        let on_failure = Arc::clone(&op);
        let _ = task
            .via(&op.cx)
            .then(move |value| {
                let mut inner = on_success.inner.lock();
                inner.right = Some(value);
                AllPairOp::try_complete(&mut inner);
            })
            .via(&op.cx)
            .fail(move |error| {
                on_failure.failed(error);
                Ok(())
            });
    }

    future
}

/// Three-way [`all2`].
pub fn all3<A, B, C, FA, FB, FC>(
    cx: &AoContext,
    make_a: FA,
    make_b: FB,
    make_c: FC,
) -> Future<(A, B, C)>
where
    A: Send + 'static,
    B: Send + 'static,
    C: Send + 'static,
    FA: FnOnce(&AoContext) -> Future<A>,
    FB: FnOnce(&AoContext) -> Future<B>,
    FC: FnOnce(&AoContext) -> Future<C>,
{
    all2(cx, |cx| all2(cx, make_a, make_b), make_c).then(|((a, b), c)| (a, b, c))
}

/// Four-way [`all2`].
pub fn all4<A, B, C, D, FA, FB, FC, FD>(
    cx: &AoContext,
    make_a: FA,
    make_b: FB,
    make_c: FC,
    make_d: FD,
) -> Future<(A, B, C, D)>
where
    A: Send + 'static,
    B: Send + 'static,
    C: Send + 'static,
    D: Send + 'static,
    FA: FnOnce(&AoContext) -> Future<A>,
    FB: FnOnce(&AoContext) -> Future<B>,
    FC: FnOnce(&AoContext) -> Future<C>,
    FD: FnOnce(&AoContext) -> Future<D>,
{
    all2(cx, |cx| all2(cx, make_a, make_b), |cx| all2(cx, make_c, make_d))
        .then(|((a, b), (c, d))| (a, b, c, d))
}

/// Five-way [`all2`].
pub fn all5<A, B, C, D, E, FA, FB, FC, FD, FE>(
    cx: &AoContext,
    make_a: FA,
    make_b: FB,
    make_c: FC,
    make_d: FD,
    make_e: FE,
) -> Future<(A, B, C, D, E)>
where
    A: Send + 'static,
    B: Send + 'static,
    C: Send + 'static,
    D: Send + 'static,
    E: Send + 'static,
    FA: FnOnce(&AoContext) -> Future<A>,
    FB: FnOnce(&AoContext) -> Future<B>,
    FC: FnOnce(&AoContext) -> Future<C>,
    FD: FnOnce(&AoContext) -> Future<D>,
    FE: FnOnce(&AoContext) -> Future<E>,
{
    all2(
        cx,
        |cx| all4(cx, make_a, make_b, make_c, make_d),
        make_e,
    )
    .then(|((a, b, c, d), e)| (a, b, c, d, e))
}

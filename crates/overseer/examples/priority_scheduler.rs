// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Two tasks compete for the scheduler; the higher priority wins until it
//! finishes.

use std::thread;
use std::time::Duration;

use overseer::Scheduler;

fn main() {
    let scheduler = Scheduler::new();

    let background = scheduler
        .push(
            |cx| {
                let mut ticks = 0;
                while cx.checkpoint() {
                    ticks += 1;
                    thread::sleep(Duration::from_millis(5));
                }
                println!("background task stopped after {ticks} ticks");
                Ok(())
            },
            0,
        )
        .expect("push background task");

    thread::sleep(Duration::from_millis(25));

    let urgent = scheduler
        .push(
            |cx| {
                for step in 1..=5 {
                    if !cx.checkpoint() {
                        break;
                    }
                    println!("urgent task step {step}");
                    thread::sleep(Duration::from_millis(5));
                }
                Ok(())
            },
            10,
        )
        .expect("push urgent task");

    // The urgent task preempted the background one.
    scheduler.wait(urgent).expect("urgent task finishes");

    thread::sleep(Duration::from_millis(25));
    scheduler.cancel(background).expect("cancel background");
    scheduler.wait_all().expect("everything stopped");
}
